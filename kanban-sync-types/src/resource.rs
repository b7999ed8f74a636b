//! Resource kinds and the scoped keys that partition resource state.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A synchronized resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Workspace projects.
    Projects,
    /// Issues (tasks) belonging to a team.
    TeamIssues,
    /// Projects assigned to a team.
    TeamProjects,
}

impl ResourceKind {
    /// Every kind, in a stable order.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Projects,
        ResourceKind::TeamIssues,
        ResourceKind::TeamProjects,
    ];

    /// Stable name used in logs and on the command line.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::TeamIssues => "team-issues",
            Self::TeamProjects => "team-projects",
        }
    }

    /// Key under which the entity map appears in a stream snapshot.
    pub const fn snapshot_key(&self) -> &'static str {
        match self {
            Self::Projects | Self::TeamProjects => "projects",
            Self::TeamIssues => "issues",
        }
    }

    /// Whether the backend offers a patch stream for this kind.
    pub const fn supports_streaming(&self) -> bool {
        matches!(self, Self::Projects)
    }

    /// Whether a key of this kind must carry a scope (team id).
    pub const fn requires_scope(&self) -> bool {
        matches!(self, Self::TeamIssues | Self::TeamProjects)
    }

    /// Entity field the facade sorts by, newest first.
    pub const fn sort_field(&self) -> &'static str {
        "created_at"
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// A resource kind together with its tenant scope.
///
/// For projects the scope is the workspace id (optional); for team resources
/// it is the team id (required). Each key owns exactly one resource state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    kind: ResourceKind,
    scope: Option<String>,
}

impl ResourceKey {
    /// Creates a key, validating that scoped kinds carry a scope.
    pub fn new(kind: ResourceKind, scope: Option<String>) -> Result<Self> {
        let scope = scope.filter(|s| !s.is_empty());
        if kind.requires_scope() && scope.is_none() {
            return Err(Error::MissingScope(kind));
        }
        Ok(Self { kind, scope })
    }

    /// Projects, optionally scoped to a workspace.
    pub fn projects(workspace_id: Option<impl Into<String>>) -> Self {
        Self {
            kind: ResourceKind::Projects,
            scope: workspace_id.map(Into::into).filter(|s| !s.is_empty()),
        }
    }

    /// Issues of a team.
    pub fn team_issues(team_id: impl Into<String>) -> Result<Self> {
        Self::new(ResourceKind::TeamIssues, Some(team_id.into()))
    }

    /// Projects assigned to a team.
    pub fn team_projects(team_id: impl Into<String>) -> Result<Self> {
        Self::new(ResourceKind::TeamProjects, Some(team_id.into()))
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}[{}]", self.kind, scope),
            None => write!(f, "{}", self.kind),
        }
    }
}
