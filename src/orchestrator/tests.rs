//! Workflow-level scenario tests (spec §8) exercised against fake
//! `CowStorageDriver`/`ContainerDriver` pairs rather than a live ZFS pool or
//! Docker daemon (SPEC_FULL.md §10/§11): the real `Engine` runs unmodified,
//! only its storage/container collaborators are swapped for in-memory
//! stand-ins via `StorageDriverFactory`, so it's the Orchestrator's
//! sequencing, idempotence, and compensation logic under test here, not the
//! shell-out drivers themselves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crate::container::{ContainerDriver, ContainerSpec, ContainerState, ContainerStatus};
use crate::error::{EngineError, Result};
use crate::model::BranchStatus;
use crate::orchestrator::project::CreateProjectRequest;
use crate::orchestrator::{Engine, EngineConfig, StorageDriverFactory};
use crate::state::Store;
use crate::storage::{CowStorageDriver, DatasetOptions, PoolStatus};

#[derive(Default)]
struct FakeStorageInner {
    datasets: HashSet<String>,
    /// full snapshot ref -> set of clone dataset leaves depending on it.
    snapshots: HashMap<String, HashSet<String>>,
}

/// In-memory stand-in for `storage::zfs::ZfsDriver`: tracks dataset/snapshot
/// existence and which clones depend on which snapshot, enough to exercise
/// `AlreadyExists`/`StorageBusy` without a real ZFS pool.
struct FakeStorage {
    inner: Mutex<FakeStorageInner>,
}

impl FakeStorage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeStorageInner::default()),
        })
    }
}

#[async_trait]
impl CowStorageDriver for FakeStorage {
    async fn create_dataset(&self, name: &str, _options: &DatasetOptions) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.datasets.insert(name.to_string()) {
            return Err(EngineError::AlreadyExists(format!("dataset '{name}' already exists")));
        }
        Ok(())
    }

    async fn destroy_dataset(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.datasets.remove(name);
        for dependents in inner.snapshots.values_mut() {
            dependents.remove(name);
        }
        Ok(())
    }

    async fn create_snapshot(&self, dataset_name: &str, snap_name: &str) -> Result<()> {
        let full_ref = format!("{dataset_name}@{snap_name}");
        let mut inner = self.inner.lock().unwrap();
        if inner.snapshots.contains_key(&full_ref) {
            return Err(EngineError::AlreadyExists(format!("snapshot '{full_ref}' already exists")));
        }
        inner.snapshots.insert(full_ref, HashSet::new());
        Ok(())
    }

    async fn destroy_snapshot(&self, full_ref: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(dependents) = inner.snapshots.get(full_ref) {
            if !dependents.is_empty() {
                return Err(EngineError::StorageBusy(format!(
                    "'{full_ref}' has {} dependent clone(s)",
                    dependents.len()
                )));
            }
        }
        inner.snapshots.remove(full_ref);
        Ok(())
    }

    async fn clone_snapshot(&self, full_snapshot_ref: &str, new_dataset_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.datasets.insert(new_dataset_name.to_string()) {
            return Err(EngineError::AlreadyExists(format!(
                "dataset '{new_dataset_name}' already exists"
            )));
        }
        inner
            .snapshots
            .entry(full_snapshot_ref.to_string())
            .or_default()
            .insert(new_dataset_name.to_string());
        Ok(())
    }

    async fn get_mountpoint(&self, name: &str) -> Result<String> {
        Ok(format!("/mnt/{name}"))
    }

    async fn get_used_space(&self, _name: &str) -> Result<u64> {
        Ok(1024)
    }

    async fn get_snapshot_size(&self, _full_ref: &str) -> Result<u64> {
        Ok(512)
    }

    async fn get_pool_status(&self, pool: &str) -> Result<PoolStatus> {
        Ok(PoolStatus {
            name: pool.to_string(),
            health: "ONLINE".to_string(),
            size_bytes: 100_000_000_000,
            allocated_bytes: 1_000_000,
            free_bytes: 99_999_000_000,
        })
    }

    async fn detect_pools(&self) -> Result<Vec<PoolStatus>> {
        Ok(vec![PoolStatus {
            name: "tank".to_string(),
            health: "ONLINE".to_string(),
            size_bytes: 100_000_000_000,
            allocated_bytes: 1_000_000,
            free_bytes: 99_999_000_000,
        }])
    }
}

/// Hands the same shared `FakeStorage` back on every call, the way a real
/// `ZfsDriverFactory` hands back a fresh but equally-backed-by-one-pool
/// `ZfsDriver` each time.
struct FakeStorageFactory(Arc<FakeStorage>);

impl StorageDriverFactory for FakeStorageFactory {
    fn build(&self, _pool: &str, _base: &str) -> Arc<dyn CowStorageDriver> {
        self.0.clone()
    }
}

#[derive(Clone)]
struct FakeContainerRecord {
    state: ContainerState,
    port: u16,
}

#[derive(Default)]
struct FakeContainerInner {
    next_port: u16,
    containers: HashMap<String, FakeContainerRecord>,
}

/// In-memory stand-in for `container::docker::DockerContainerDriver`. Ports
/// are dealt out sequentially starting at 60000, mirroring the real driver's
/// "runtime is the only port registry" contract (spec §4.E).
struct FakeContainers {
    inner: Mutex<FakeContainerInner>,
}

impl FakeContainers {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FakeContainerInner {
                next_port: 60000,
                containers: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeContainers {
    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let port = if spec.port == 0 {
            let port = inner.next_port;
            inner.next_port += 1;
            port
        } else {
            spec.port
        };
        inner.containers.insert(
            spec.name.clone(),
            FakeContainerRecord {
                state: ContainerState::Exited,
                port,
            },
        );
        Ok(spec.name.clone())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.containers.get_mut(id) {
            record.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.containers.get_mut(id) {
            record.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().containers.remove(id);
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.containers.get_mut(id) {
            record.state = ContainerState::Paused;
        }
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.containers.get_mut(id) {
            record.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn wait_for_healthy(
        &self,
        id: &str,
        _username: &str,
        _database: &str,
        _timeout: Duration,
    ) -> Result<()> {
        match self.inner.lock().unwrap().containers.get(id) {
            Some(record) if record.state == ContainerState::Running => Ok(()),
            _ => Err(EngineError::Unhealthy(format!("container '{id}' never became ready"))),
        }
    }

    async fn get_container_by_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .contains_key(name)
            .then(|| name.to_string()))
    }

    async fn get_container_status(&self, id: &str) -> Result<ContainerStatus> {
        match self.inner.lock().unwrap().containers.get(id) {
            Some(record) => Ok(ContainerStatus {
                state: record.state,
                started_at: Some(Utc::now()),
            }),
            None => Ok(ContainerStatus {
                state: ContainerState::NotFound,
                started_at: None,
            }),
        }
    }

    async fn get_container_port(&self, id: &str) -> Result<u16> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|r| r.port)
            .ok_or_else(|| EngineError::NotFound(format!("container '{id}' not found")))
    }

    async fn exec_sql(&self, id: &str, _sql: &str, _username: &str) -> Result<String> {
        match self.inner.lock().unwrap().containers.get(id) {
            Some(record) if record.state == ContainerState::Running => Ok(String::new()),
            _ => Err(EngineError::DriverError(anyhow::anyhow!(
                "container '{id}' is not running"
            ))),
        }
    }
}

/// A fresh `Engine` over fake collaborators and its own temp data root; the
/// fake storage is returned alongside so tests can assert on it directly
/// (e.g. destroy a dependent dataset out from under the Orchestrator).
fn test_engine(dir: &TempDir) -> (Engine, Arc<FakeStorage>) {
    let storage = FakeStorage::new();
    let store = Store::new(dir.path()).unwrap();
    let config = EngineConfig {
        data_root: dir.path().to_path_buf(),
        startup_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    };
    let engine = Engine::with_storage_factory(
        store,
        Box::new(FakeContainers::new()),
        Box::new(FakeStorageFactory(storage.clone())),
        config,
    );
    (engine, storage)
}

fn create_req(name: &str) -> CreateProjectRequest {
    CreateProjectRequest {
        name: name.to_string(),
        image: None,
        version: None,
        pool: None,
    }
}

#[tokio::test]
async fn scenario_1_project_create_produces_one_primary_branch_on_a_high_port() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    let project = engine.project_create(create_req("demo")).await.unwrap();

    assert_eq!(project.branches.len(), 1);
    let primary = &project.branches[0];
    assert!(primary.is_primary);
    assert!(primary.parent_branch_id.is_none());
    assert!(primary.snapshot_name.is_none());
    assert!(primary.port >= 1024);
    assert_eq!(primary.zfs_dataset_name, "demo-main");
    assert_eq!(primary.container_name, "pgforge-demo-main");
    assert_eq!(primary.zfs_dataset, "tank/pgforge/demo-main");

    let catalog = engine.store.snapshot().unwrap();
    assert_eq!(catalog.projects.len(), 1);
    assert!(catalog.initialized);
}

#[tokio::test]
async fn scenario_2_branch_create_clones_onto_a_distinct_port() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    engine.project_create(create_req("demo")).await.unwrap();
    let child = engine.branch_create("demo/main", "dev").await.unwrap();

    assert_eq!(child.name, "demo/dev");
    assert!(!child.is_primary);
    assert_eq!(child.zfs_dataset, "tank/pgforge/demo-dev");

    let catalog = engine.store.snapshot().unwrap();
    let project = catalog.project_by_name("demo").unwrap();
    assert_eq!(project.branches.len(), 2);

    let snapshots = catalog.list_snapshots(None);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].branch_name, "demo/main");
    assert!(snapshots[0].zfs_snapshot.starts_with("tank/pgforge/demo-main@"));

    let main_port = project.branch_by_leaf("main").unwrap().port;
    let dev_port = project.branch_by_leaf("dev").unwrap().port;
    assert_ne!(main_port, dev_port);
}

#[tokio::test]
async fn scenario_3_snapshot_delete_blocked_then_succeeds_after_branch_delete() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    engine.project_create(create_req("demo")).await.unwrap();
    engine.branch_create("demo/main", "dev").await.unwrap();

    let snapshot_id = engine
        .store
        .snapshot()
        .unwrap()
        .list_snapshots(None)
        .first()
        .unwrap()
        .id
        .clone();

    let err = engine.snapshot_delete(&snapshot_id).await.unwrap_err();
    assert!(matches!(err, EngineError::StorageBusy(_)));

    engine.branch_delete("demo/dev").await.unwrap();

    // branch-delete already garbage-collected the implicit snapshot that
    // backed `demo/dev` (no branch depends on it any more — DESIGN.md's
    // resolution of the spec §9 Open Question), so the explicit delete now
    // correctly reports the id as gone rather than double-freeing it.
    let err = engine.snapshot_delete(&snapshot_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn scenario_4_branch_reset_restores_from_the_same_snapshot_on_the_same_port() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    engine.project_create(create_req("demo")).await.unwrap();
    let child = engine.branch_create("demo/main", "dev").await.unwrap();
    let pre_reset_size = child.size_bytes;

    let reset = engine.branch_reset("demo/dev").await.unwrap();

    assert_eq!(reset.status, BranchStatus::Running);
    assert_eq!(reset.port, child.port);
    assert_eq!(reset.snapshot_name, child.snapshot_name);
    assert!(reset.size_bytes <= pre_reset_size.max(reset.size_bytes));
}

#[tokio::test]
async fn scenario_5_conflicting_image_and_version_is_a_user_error_with_no_state_change() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    let err = engine
        .project_create(CreateProjectRequest {
            name: "foo".to_string(),
            image: Some("postgres:15".to_string()),
            version: Some("16".to_string()),
            pool: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::UserError(_)));
    assert!(engine.store.snapshot().unwrap().projects.is_empty());
}

#[tokio::test]
async fn scenario_6_two_concurrent_branch_creates_both_succeed_distinctly() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    engine.project_create(create_req("demo")).await.unwrap();

    let engine = Arc::new(engine);
    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.branch_create("demo/main", "a").await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.branch_create("demo/main", "b").await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert_ne!(a.port, b.port);
    assert_ne!(a.zfs_dataset_name, b.zfs_dataset_name);

    let catalog = engine.store.snapshot().unwrap();
    assert_eq!(catalog.project_by_name("demo").unwrap().branches.len(), 3);
    assert_eq!(catalog.list_snapshots(None).len(), 2);
}

#[tokio::test]
async fn branch_reset_on_primary_is_a_user_error() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    engine.project_create(create_req("demo")).await.unwrap();

    let err = engine.branch_reset("demo/main").await.unwrap_err();
    assert!(matches!(err, EngineError::UserError(_)));
}

#[tokio::test]
async fn branch_delete_nonexistent_branch_is_not_found_with_no_state_change() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    engine.project_create(create_req("demo")).await.unwrap();

    let before = engine.store.snapshot().unwrap();
    let err = engine.branch_delete("demo/missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    let after = engine.store.snapshot().unwrap();
    assert_eq!(before.projects.len(), after.projects.len());
}

#[tokio::test]
async fn project_create_twice_is_a_user_error_with_exactly_one_project() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);

    engine.project_create(create_req("demo")).await.unwrap();
    let err = engine.project_create(create_req("demo")).await.unwrap_err();

    assert!(matches!(err, EngineError::UserError(_)));
    let catalog = engine.store.snapshot().unwrap();
    assert_eq!(catalog.projects.len(), 1);
}

#[tokio::test]
async fn deleting_primary_branch_with_siblings_is_a_user_error() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    engine.project_create(create_req("demo")).await.unwrap();
    engine.branch_create("demo/main", "dev").await.unwrap();

    let err = engine.branch_delete("demo/main").await.unwrap_err();
    assert!(matches!(err, EngineError::UserError(_)));
}

#[tokio::test]
async fn project_delete_requires_every_other_branch_gone_first() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    engine.project_create(create_req("demo")).await.unwrap();
    engine.branch_create("demo/main", "dev").await.unwrap();

    let err = engine.project_delete("demo").await.unwrap_err();
    assert!(matches!(err, EngineError::StorageBusy(_)));

    engine.branch_delete("demo/dev").await.unwrap();
    engine.project_delete("demo").await.unwrap();
    assert!(engine.store.snapshot().unwrap().projects.is_empty());
}

#[tokio::test]
async fn status_refreshes_drifted_container_state() {
    let dir = TempDir::new().unwrap();
    let (engine, _storage) = test_engine(&dir);
    let project = engine.project_create(create_req("demo")).await.unwrap();

    engine
        .containers
        .stop_container(&project.branches[0].container_name)
        .await
        .unwrap();

    let report = engine.status().await.unwrap();
    let branch = &report.projects[0].branches[0];
    assert_eq!(branch.status, BranchStatus::Stopped);

    // The drift was persisted, not just reported in this one call.
    let catalog = engine.store.snapshot().unwrap();
    assert_eq!(
        catalog.project_by_name("demo").unwrap().branches[0].status,
        BranchStatus::Stopped
    );
}
