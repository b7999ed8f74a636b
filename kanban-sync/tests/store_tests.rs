use kanban_sync::{
    ChangeKind, Entity, EntityId, OptimisticStore, OptimisticWrite, ResourceKey, RevisionClock,
    StoreChange,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn key() -> ResourceKey {
    ResourceKey::projects(Some("ws-1"))
}

fn project(id: &str, name: &str) -> Entity {
    Entity::from_value(json!({ "id": id, "name": name })).unwrap()
}

fn id(s: &str) -> EntityId {
    EntityId::new(s)
}

// ── RevisionClock ────────────────────────────────────────────────

#[test]
fn clock_starts_at_zero_and_ticks_monotonically() {
    let clock = RevisionClock::new();
    assert_eq!(clock.current(), 0);
    assert_eq!(clock.tick(), 1);
    assert_eq!(clock.tick(), 2);
    assert_eq!(clock.current(), 2);
}

// ── Writes ───────────────────────────────────────────────────────

#[test]
fn add_records_upsert_at_current_revision() {
    let clock = Arc::new(RevisionClock::new());
    clock.tick();
    clock.tick();
    let store = OptimisticStore::with_clock(clock);

    store.add(&key(), project("p1", "Alpha"));

    let entry = store.get(&key(), &id("p1")).unwrap();
    assert_eq!(entry.write, OptimisticWrite::Upsert(project("p1", "Alpha")));
    assert_eq!(entry.base_revision, 2);
    assert!(!entry.held);
    assert_eq!(store.len(&key()), 1);
}

#[test]
fn update_replaces_previous_write() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    store.update(&key(), project("p1", "Beta"));

    let entry = store.get(&key(), &id("p1")).unwrap();
    assert_eq!(entry.entity().unwrap().get("name"), Some(&json!("Beta")));
    assert_eq!(store.len(&key()), 1);
}

#[test]
fn remove_records_tombstone() {
    let store = OptimisticStore::new();
    store.remove(&key(), &id("p1"));

    let entry = store.get(&key(), &id("p1")).unwrap();
    assert!(entry.is_removal());
    assert!(entry.entity().is_none());
}

#[test]
fn keys_are_isolated() {
    let store = OptimisticStore::new();
    let other = ResourceKey::projects(Some("ws-2"));
    store.add(&key(), project("p1", "Alpha"));

    assert!(store.contains(&key(), &id("p1")));
    assert!(!store.contains(&other, &id("p1")));
    assert!(store.is_empty(&other));
}

#[test]
fn rollback_discards_entry() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));

    assert!(store.rollback(&key(), &id("p1")));
    assert!(store.is_empty(&key()));
    assert!(!store.rollback(&key(), &id("p1")));
}

#[test]
fn snapshot_is_a_copy() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    let snapshot = store.snapshot(&key());
    store.add(&key(), project("p2", "Beta"));

    assert_eq!(snapshot.len(), 1);
    assert_eq!(store.len(&key()), 2);
}

#[test]
fn clear_drops_every_entry_of_key() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    store.remove(&key(), &id("p2"));
    store.clear(&key());
    assert!(store.is_empty(&key()));
}

// ── Confirmation ─────────────────────────────────────────────────

#[test]
fn confirm_only_drops_entries_older_than_revision() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    let server_revision = store.clock().tick();
    store.add(&key(), project("p2", "Beta"));

    let confirmed = store.confirm(&key(), &[id("p1"), id("p2")], server_revision);

    assert_eq!(confirmed, 1);
    assert!(!store.contains(&key(), &id("p1")));
    assert!(store.contains(&key(), &id("p2")));
}

#[test]
fn confirm_skips_held_entries() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    assert!(store.hold(&key(), &id("p1")));
    let server_revision = store.clock().tick();

    assert_eq!(store.confirm(&key(), &[id("p1")], server_revision), 0);
    assert!(store.contains(&key(), &id("p1")));
}

#[test]
fn settle_releases_and_restamps() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Alpha"));
    store.hold(&key(), &id("p1"));
    store.clock().tick();
    store.clock().tick();

    let server_copy = Entity::from_value(json!({ "id": "p1", "name": "Alpha", "created_at": "2026-01-01T00:00:00Z" })).unwrap();
    assert!(store.settle(&key(), &id("p1"), Some(server_copy.clone())));

    let entry = store.get(&key(), &id("p1")).unwrap();
    assert!(!entry.held);
    assert_eq!(entry.base_revision, 2);
    assert_eq!(entry.entity(), Some(&server_copy));
}

#[test]
fn settle_keeps_tombstone() {
    let store = OptimisticStore::new();
    store.remove(&key(), &id("p1"));
    store.hold(&key(), &id("p1"));
    assert!(store.settle(&key(), &id("p1"), None));
    assert!(store.get(&key(), &id("p1")).unwrap().is_removal());
}

#[test]
fn hold_and_settle_on_missing_entry() {
    let store = OptimisticStore::new();
    assert!(!store.hold(&key(), &id("nope")));
    assert!(!store.settle(&key(), &id("nope"), None));
}

#[test]
fn release_keeps_write_revision() {
    let store = OptimisticStore::new();
    store.add(&key(), project("p1", "Mine"));
    store.hold(&key(), &id("p1"));
    let server_revision = store.clock().tick();

    assert!(store.release(&key(), &id("p1")));
    let entry = store.get(&key(), &id("p1")).unwrap();
    assert!(!entry.held);
    assert_eq!(entry.base_revision, 0);
    assert_eq!(entry.entity(), Some(&project("p1", "Mine")));

    // A publication made after the write now confirms it away.
    assert_eq!(store.confirm(&key(), &[id("p1")], server_revision), 1);
    assert!(store.is_empty(&key()));
}

#[test]
fn resolve_drops_entry_without_notifying() {
    let store = OptimisticStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    store.add(&key(), project("p1", "Alpha"));
    store.hold(&key(), &id("p1"));
    let seen = Arc::clone(&calls);
    store.on_change(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert!(store.resolve(&key(), &id("p1")));
    assert!(!store.contains(&key(), &id("p1")));
    assert!(!store.resolve(&key(), &id("p1")));
    assert!(!store.release(&key(), &id("p1")));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ── Listeners ────────────────────────────────────────────────────

#[test]
fn listeners_see_every_mutation_in_order() {
    let store = OptimisticStore::new();
    let seen: Arc<Mutex<Vec<StoreChange>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.on_change(move |change| sink.lock().unwrap().push(change.clone()));

    store.add(&key(), project("p1", "Alpha"));
    store.update(&key(), project("p1", "Beta"));
    store.remove(&key(), &id("p1"));
    store.rollback(&key(), &id("p1"));

    let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::Added,
            ChangeKind::Updated,
            ChangeKind::Removed,
            ChangeKind::RolledBack
        ]
    );
    assert!(seen.lock().unwrap().iter().all(|c| c.key == key() && c.id == id("p1")));
}

#[test]
fn confirm_does_not_notify() {
    let store = OptimisticStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    store.add(&key(), project("p1", "Alpha"));
    let counter = calls.clone();
    store.on_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let revision = store.clock().tick();
    store.confirm(&key(), &[id("p1")], revision);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn removed_listener_is_not_called() {
    let store = OptimisticStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let listener = store.on_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store.add(&key(), project("p1", "Alpha"));
    assert!(store.remove_listener(listener));
    assert!(!store.remove_listener(listener));
    store.add(&key(), project("p2", "Beta"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_may_write_to_store() {
    let store = Arc::new(OptimisticStore::new());
    let inner = store.clone();
    store.on_change(move |change| {
        if change.id == EntityId::new("p1") && change.kind == ChangeKind::Added {
            inner.add(&change.key, project("p2", "Echo"));
        }
    });

    store.add(&key(), project("p1", "Alpha"));

    assert!(store.contains(&key(), &id("p2")));
}

#[test]
fn listener_may_unregister_itself() {
    let store = Arc::new(OptimisticStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(Mutex::new(None));

    let inner = store.clone();
    let counter = calls.clone();
    let own = slot.clone();
    let listener = store.on_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = *own.lock().unwrap() {
            inner.remove_listener(id);
        }
    });
    *slot.lock().unwrap() = Some(listener);

    store.add(&key(), project("p1", "Alpha"));
    store.add(&key(), project("p2", "Beta"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
