//! Applying JSON-Patch operations to a JSON document.

use crate::error::{SyncError, SyncResult};
use kanban_sync_types::{PatchOp, PatchOperation};
use serde_json::Value;

/// Splits an RFC 6901 pointer into unescaped reference tokens.
pub fn parse_pointer(path: &str) -> SyncResult<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(patch_error(path, "pointer must start with '/'"));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Applies `ops` to `doc` in order, stopping at the first failure.
///
/// A failed batch may leave `doc` partially modified; callers discard the
/// document and resync.
pub fn apply_patch(doc: &mut Value, ops: &[PatchOperation]) -> SyncResult<()> {
    for op in ops {
        apply_operation(doc, op)?;
    }
    Ok(())
}

/// Applies a single operation.
pub fn apply_operation(doc: &mut Value, op: &PatchOperation) -> SyncResult<()> {
    let tokens = parse_pointer(&op.path)?;
    match op.op {
        PatchOp::Add => {
            let value = required_value(op)?;
            add(doc, &op.path, &tokens, value)
        }
        PatchOp::Replace => {
            let value = required_value(op)?;
            let target = resolve_mut(doc, &op.path, &tokens)?;
            *target = value;
            Ok(())
        }
        PatchOp::Remove => remove(doc, &op.path, &tokens),
    }
}

fn required_value(op: &PatchOperation) -> SyncResult<Value> {
    op.value
        .clone()
        .ok_or_else(|| patch_error(&op.path, "operation requires a value"))
}

fn add(doc: &mut Value, path: &str, tokens: &[String], value: Value) -> SyncResult<()> {
    let Some((last, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = resolve_mut(doc, path, parent_tokens)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = array_index(path, last)?;
            if index > items.len() {
                return Err(patch_error(path, "array index out of bounds"));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(patch_error(path, "parent is not a container")),
    }
}

fn remove(doc: &mut Value, path: &str, tokens: &[String]) -> SyncResult<()> {
    let Some((last, parent_tokens)) = tokens.split_last() else {
        return Err(patch_error(path, "cannot remove the document root"));
    };
    let parent = resolve_mut(doc, path, parent_tokens)?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .map(|_| ())
            .ok_or_else(|| patch_error(path, "no such member")),
        Value::Array(items) => {
            let index = array_index(path, last)?;
            if index >= items.len() {
                return Err(patch_error(path, "array index out of bounds"));
            }
            items.remove(index);
            Ok(())
        }
        _ => Err(patch_error(path, "parent is not a container")),
    }
}

fn resolve_mut<'a>(doc: &'a mut Value, path: &str, tokens: &[String]) -> SyncResult<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| patch_error(path, "no such member"))?,
            Value::Array(items) => {
                let index = array_index(path, token)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| patch_error(path, "array index out of bounds"))?
            }
            _ => return Err(patch_error(path, "cannot traverse a scalar")),
        };
    }
    Ok(current)
}

fn array_index(path: &str, token: &str) -> SyncResult<usize> {
    // RFC 6901 forbids leading zeros.
    if token.len() > 1 && token.starts_with('0') {
        return Err(patch_error(path, "invalid array index"));
    }
    token
        .parse::<usize>()
        .map_err(|_| patch_error(path, "invalid array index"))
}

fn patch_error(path: &str, reason: &str) -> SyncError {
    SyncError::Patch {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
