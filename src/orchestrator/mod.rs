//! Component F: the Branch Orchestrator (spec §4.F). One function per
//! workflow, each a linear numbered sequence with an explicit compensation
//! closure run on failure — the teacher's `LocalBackend::create_branch`
//! already pauses/unpauses the parent around a clone and unwinds that pause
//! on both paths; this generalizes the same shape to every step of every
//! workflow.

pub mod branch;
pub mod project;
pub mod query;
pub mod snapshot;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::container::ContainerDriver;
use crate::naming;
use crate::state::Store;
use crate::storage::zfs::ZfsDriver;
use crate::storage::CowStorageDriver;

/// Builds the concrete `CowStorageDriver` a workflow talks to, scoped to the
/// catalog's recorded pool and dataset base — only known for certain once
/// `Catalog::initialize` has run, so the Orchestrator asks for one per
/// invocation rather than holding a single long-lived driver. A trait rather
/// than a bare constructor so tests can inject a fake in-memory driver
/// without the real `zfs`/`zpool` binaries (SPEC_FULL.md §10/§11), and so a
/// second storage backend (Btrfs, say) is a new `StorageDriverFactory` impl
/// rather than a rewrite of every workflow.
pub trait StorageDriverFactory: Send + Sync {
    fn build(&self, pool: &str, base: &str) -> Arc<dyn CowStorageDriver>;
}

pub struct ZfsDriverFactory;

impl StorageDriverFactory for ZfsDriverFactory {
    fn build(&self, pool: &str, base: &str) -> Arc<dyn CowStorageDriver> {
        Arc::new(ZfsDriver::new(pool, base))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_image: String,
    pub port_range_start: u16,
    pub pg_user: String,
    pub pg_password: String,
    pub pg_db: String,
    pub data_root: PathBuf,
    pub startup_timeout: Duration,
    /// `--pool` override; when `None`, `project-create` auto-selects iff
    /// exactly one pool is importable (spec §8 Boundaries).
    pub pool: Option<String>,
    pub dataset_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_image: "postgres:17".to_string(),
            port_range_start: 55432,
            pg_user: "postgres".to_string(),
            pg_password: "postgres".to_string(),
            pg_db: "postgres".to_string(),
            data_root: PathBuf::from("/var/lib/pgforge"),
            startup_timeout: Duration::from_secs(120),
            pool: None,
            dataset_base: "pgforge".to_string(),
        }
    }
}

pub struct Engine {
    pub(crate) store: Store,
    pub(crate) containers: Box<dyn ContainerDriver>,
    pub(crate) storage_factory: Box<dyn StorageDriverFactory>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(store: Store, containers: Box<dyn ContainerDriver>, config: EngineConfig) -> Self {
        Self::with_storage_factory(store, containers, Box::new(ZfsDriverFactory), config)
    }

    pub fn with_storage_factory(
        store: Store,
        containers: Box<dyn ContainerDriver>,
        storage_factory: Box<dyn StorageDriverFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            containers,
            storage_factory,
            config,
        }
    }

    pub(crate) fn storage_driver(&self, pool: &str, base: &str) -> Arc<dyn CowStorageDriver> {
        self.storage_factory.build(pool, base)
    }

    pub(crate) fn branch_data_path(&self, project: &str, branch_leaf: &str) -> PathBuf {
        self.config
            .data_root
            .join("projects")
            .join(project)
            .join(branch_leaf)
            .join("pgdata")
    }

    /// `$XDG_DATA_HOME/<tool>/wal-archive/<datasetName>/` (spec §6), not
    /// nested under the per-project data tree like `branch_data_path` — the
    /// WAL archive location is spec'd as its own top-level directory keyed by
    /// dataset name, independent of the project/branch layout.
    pub(crate) fn branch_wal_archive_path(&self, project: &str, branch_leaf: &str) -> PathBuf {
        self.config
            .data_root
            .join("wal-archive")
            .join(naming::dataset_name(project, branch_leaf))
    }
}
