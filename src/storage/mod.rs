//! Component B: the Storage Driver (spec §4.B). A trait so a second backend
//! (Btrfs, say) is a new impl rather than a rewrite of the Orchestrator —
//! only `storage::zfs` ships.

pub mod zfs;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub compression: Option<String>,
    pub recordsize: Option<String>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            compression: Some("lz4".to_string()),
            recordsize: Some("8k".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub name: String,
    pub health: String,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
}

#[async_trait]
pub trait CowStorageDriver: Send + Sync {
    /// Creates `<pool>/<base>/<name>`. `EngineError::AlreadyExists` if present.
    async fn create_dataset(&self, name: &str, options: &DatasetOptions) -> Result<()>;

    /// Recursive destroy. `EngineError::StorageBusy` if clones depend on it.
    /// Absent dataset is not an error (idempotent per spec §4.B).
    async fn destroy_dataset(&self, name: &str) -> Result<()>;

    /// `EngineError::AlreadyExists` if `snap_name` already exists on `dataset_name`.
    async fn create_snapshot(&self, dataset_name: &str, snap_name: &str) -> Result<()>;

    /// `EngineError::StorageBusy` if a clone still depends on it. Idempotent:
    /// absent snapshot is not an error.
    async fn destroy_snapshot(&self, full_ref: &str) -> Result<()>;

    /// New dataset sharing blocks with `full_snapshot_ref`'s dataset; the
    /// read-only dependency on the snapshot must persist until the clone
    /// itself is destroyed.
    async fn clone_snapshot(&self, full_snapshot_ref: &str, new_dataset_name: &str) -> Result<()>;

    async fn get_mountpoint(&self, name: &str) -> Result<String>;

    async fn get_used_space(&self, name: &str) -> Result<u64>;

    async fn get_snapshot_size(&self, full_ref: &str) -> Result<u64>;

    async fn get_pool_status(&self, pool: &str) -> Result<PoolStatus>;

    /// Enumerates importable pools (`zpool list`), used by `project-create`
    /// step 4 to auto-select a pool when exactly one is importable.
    async fn detect_pools(&self) -> Result<Vec<PoolStatus>>;
}
