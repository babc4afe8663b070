//! The data model of spec §3: Project, Branch, Snapshot, and the Catalog
//! that owns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    Stopped,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub image: String,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    /// Ordered set of branches owned by this project; exactly one has
    /// `is_primary = true` (spec §3).
    pub branches: Vec<Branch>,
}

impl Project {
    pub fn primary_branch(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.is_primary)
    }

    pub fn branch_by_leaf(&self, leaf: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.leaf() == leaf)
    }

    pub fn branch_by_leaf_mut(&mut self, leaf: &str) -> Option<&mut Branch> {
        self.branches.iter_mut().find(|b| b.leaf() == leaf)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    /// `"<project>/<branch>"`, fully qualified.
    pub name: String,
    pub project_name: String,
    /// Null ⇔ primary.
    pub parent_branch_id: Option<String>,
    pub is_primary: bool,
    /// Null ⇔ primary. Name of the snapshot this branch was cloned from.
    pub snapshot_name: Option<String>,
    pub zfs_dataset: String,
    pub zfs_dataset_name: String,
    pub container_name: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: BranchStatus,
}

impl Branch {
    pub fn leaf(&self) -> &str {
        self.name
            .split_once('/')
            .map(|(_, leaf)| leaf)
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub branch_id: String,
    pub branch_name: String,
    pub project_name: String,
    /// `"<pool>/<base>/<dataset>@<snap>"`.
    pub zfs_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub label: Option<String>,
    pub size_bytes: u64,
    /// True if this snapshot exists only because `branch-create` took it to
    /// back a clone, rather than because the user ran `snapshot-create`
    /// directly. Governs the garbage-collection policy of `branch-delete`
    /// (spec §9 Open Question, resolved in DESIGN.md).
    pub implicit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub initialized: bool,
    pub zfs_pool: String,
    pub zfs_dataset_base: String,
    pub projects: Vec<Project>,
    pub snapshots: Vec<Snapshot>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            initialized: false,
            zfs_pool: String::new(),
            zfs_dataset_base: String::new(),
            projects: Vec::new(),
            snapshots: Vec::new(),
        }
    }
}

impl Catalog {
    pub fn project_by_name(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn project_by_name_mut(&mut self, name: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.name == name)
    }
}
