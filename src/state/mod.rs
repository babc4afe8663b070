//! Component D: the file-backed Catalog (spec §4.D, §6). One JSON document,
//! atomic temp-file + rename on every mutation, an advisory file lock held
//! for the full duration of a mutating workflow (spec §5).
//!
//! The lock is taken on a sidecar file (`state.json.lock`) that is never
//! renamed or replaced, not on `state.json` itself: `commit` unlinks
//! `state.json`'s inode by renaming a temp file over it, so a lock held on
//! that path would protect only the inode, not the name — a second process
//! already blocked on the old inode would wake, read stale content, and
//! silently discard the first process's write. Locking a name that the write
//! path never touches keeps the lock meaningful across the rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use fs4::fs_std::FileExt;

use crate::error::{EngineError, Result};
use crate::model::{Branch, Catalog, Project, Snapshot};
use crate::naming;

pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!(
                "failed to create data directory '{}': {e}",
                data_dir.display()
            ))
        })?;
        Ok(Self { data_dir })
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.data_dir.join("state.json.lock")
    }

    pub fn wal_archive_root(&self) -> PathBuf {
        self.data_dir.join("wal-archive")
    }

    fn open_lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.lock_path())
            .map_err(|e| {
                EngineError::DriverError(anyhow::anyhow!("failed to open catalog lock file: {e}"))
            })
    }

    /// Reads the current `state.json` fresh from disk. Safe to call only
    /// while the sidecar lock is held, so concurrent writers always observe
    /// each other's committed renames rather than a handle to an orphaned
    /// inode.
    fn read_catalog(&self) -> Result<Catalog> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(Catalog::default());
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!("failed to read catalog file: {e}"))
        })?;

        if contents.trim().is_empty() {
            return Ok(Catalog::default());
        }

        serde_json::from_str(&contents).map_err(|e| {
            EngineError::Inconsistent(format!("catalog file is not valid JSON: {e}"))
        })
    }

    fn write_atomic(&self, catalog: &Catalog) -> Result<()> {
        let json = serde_json::to_string_pretty(catalog).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!("failed to serialize catalog: {e}"))
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.data_dir).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!("failed to create temp catalog file: {e}"))
        })?;
        tmp.write_all(json.as_bytes()).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!("failed to write temp catalog file: {e}"))
        })?;
        tmp.flush().ok();
        tmp.persist(self.state_path()).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!(
                "failed to rename catalog file into place: {e}"
            ))
        })?;
        Ok(())
    }

    /// One-shot, shared-lock read for read-only commands (`status`, `list`).
    pub fn snapshot(&self) -> Result<Catalog> {
        let lock_file = self.open_lock_file()?;
        FileExt::lock_shared(&lock_file).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!("failed to acquire shared catalog lock: {e}"))
        })?;
        let catalog = self.read_catalog();
        let _ = FileExt::unlock(&lock_file);
        catalog
    }

    /// Acquires the exclusive catalog lock for the full duration of a
    /// mutating workflow and loads the current catalog. The caller reads and
    /// mutates the in-memory catalog through the returned guard and calls
    /// `commit` exactly once, at the workflow's single atomic success point;
    /// an early return without `commit` (compensation path) simply drops the
    /// guard, releasing the lock with no state change.
    pub fn begin(&self) -> Result<CatalogGuard<'_>> {
        let lock_file = self.open_lock_file()?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| {
            EngineError::DriverError(anyhow::anyhow!(
                "failed to acquire exclusive catalog lock: {e}"
            ))
        })?;
        let catalog = self.read_catalog()?;
        Ok(CatalogGuard {
            store: self,
            lock_file,
            catalog,
        })
    }
}

pub struct CatalogGuard<'a> {
    store: &'a Store,
    // Held only to keep the advisory lock alive for the guard's lifetime;
    // released automatically when the file handle is dropped. Locks
    // `state.json.lock`, never `state.json` itself — see the module doc.
    #[allow(dead_code)]
    lock_file: File,
    catalog: Catalog,
}

impl<'a> CatalogGuard<'a> {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn commit(self) -> Result<()> {
        self.store.write_atomic(&self.catalog)
    }
}

impl Catalog {
    /// `autoInitialize(pool, datasetBase)` (spec §4.D). `zfsPool` and
    /// `zfsDatasetBase` are immutable once set (spec §3).
    pub fn initialize(&mut self, pool: impl Into<String>, dataset_base: impl Into<String>) -> Result<()> {
        if self.initialized {
            return Err(EngineError::AlreadyExists(
                "catalog is already initialized".to_string(),
            ));
        }
        self.zfs_pool = pool.into();
        self.zfs_dataset_base = dataset_base.into();
        self.initialized = true;
        Ok(())
    }

    pub fn add_project(&mut self, project: Project) -> Result<()> {
        if self.project_by_name(&project.name).is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "project '{}' already exists",
                project.name
            )));
        }
        self.projects.push(project);
        Ok(())
    }

    pub fn list_projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn remove_project(&mut self, name: &str) -> Result<Project> {
        let idx = self
            .projects
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{name}' not found")))?;
        Ok(self.projects.remove(idx))
    }

    pub fn add_branch(&mut self, project_name: &str, branch: Branch) -> Result<()> {
        if self.branch_by_namespace(&branch.name).is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "branch '{}' already exists",
                branch.name
            )));
        }
        let project = self
            .project_by_name_mut(project_name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{project_name}' not found")))?;
        project.branches.push(branch);
        Ok(())
    }

    pub fn update_branch(&mut self, branch: Branch) -> Result<()> {
        let project = self
            .project_by_name_mut(&branch.project_name)
            .ok_or_else(|| {
                EngineError::NotFound(format!("project '{}' not found", branch.project_name))
            })?;
        let slot = project
            .branches
            .iter_mut()
            .find(|b| b.id == branch.id)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{}' not found", branch.name)))?;
        *slot = branch;
        Ok(())
    }

    pub fn remove_branch(&mut self, project_name: &str, branch_id: &str) -> Result<Branch> {
        let project = self
            .project_by_name_mut(project_name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{project_name}' not found")))?;
        let idx = project
            .branches
            .iter()
            .position(|b| b.id == branch_id)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{branch_id}' not found")))?;
        Ok(project.branches.remove(idx))
    }

    pub fn branch_by_namespace(&self, namespace: &str) -> Option<&Branch> {
        let (project_name, leaf) = naming::split_namespace(namespace)?;
        self.project_by_name(project_name)?.branch_by_leaf(leaf)
    }

    pub fn branch_by_namespace_mut(&mut self, namespace: &str) -> Option<&mut Branch> {
        let (project_name, leaf) = naming::split_namespace(namespace)?;
        self.project_by_name_mut(project_name)?.branch_by_leaf_mut(leaf)
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        if self.snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(EngineError::AlreadyExists(format!(
                "snapshot '{}' already exists",
                snapshot.id
            )));
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    pub fn delete_snapshot(&mut self, id: &str) -> Result<Snapshot> {
        let idx = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot '{id}' not found")))?;
        Ok(self.snapshots.remove(idx))
    }

    pub fn get_snapshot_by_id(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn list_snapshots(&self, branch_name: Option<&str>) -> Vec<&Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| branch_name.map(|n| s.branch_name == n).unwrap_or(true))
            .collect()
    }

    /// Any branch whose `snapshot_name` (a bare leaf like
    /// `2026-01-01T00-00-00`) is the suffix of `snapshot.zfs_snapshot` (the
    /// full `<dataset>@<leaf>` ref) is a dependent clone — mirrors the
    /// storage layer's own busy check so the State Store and Storage Driver
    /// never disagree about collectibility. Matches the same `@<snap_name>`
    /// suffix lookup `branch_reset`/`branch_delete` already do.
    pub fn snapshot_has_dependents(&self, snapshot_id: &str) -> bool {
        let Some(snapshot) = self.get_snapshot_by_id(snapshot_id) else {
            return false;
        };
        self.projects.iter().flat_map(|p| p.branches.iter()).any(|b| {
            b.snapshot_name
                .as_deref()
                .map_or(false, |n| snapshot.zfs_snapshot.ends_with(&format!("@{n}")))
        })
    }

    /// `deleteOldSnapshots(branchName, retentionDays)` (spec §4.D). Removes
    /// and returns the expired snapshot records; the caller is responsible
    /// for destroying the underlying storage snapshots.
    pub fn delete_old_snapshots(
        &mut self,
        branch_name: &str,
        retention_days: i64,
    ) -> Vec<Snapshot> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
        let expired_ids: Vec<String> = self
            .snapshots
            .iter()
            .filter(|s| s.branch_name == branch_name && s.created_at < cutoff)
            .map(|s| s.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired_ids.len());
        self.snapshots.retain(|s| {
            if expired_ids.contains(&s.id) {
                removed.push(s.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BranchStatus, Credentials};
    use tempfile::TempDir;

    fn sample_project() -> Project {
        Project {
            id: "proj-1".into(),
            name: "demo".into(),
            image: "postgres:17".into(),
            credentials: Credentials {
                username: "postgres".into(),
                password: "postgres".into(),
                database: "postgres".into(),
            },
            created_at: chrono::Utc::now(),
            branches: vec![Branch {
                id: "b-main".into(),
                name: "demo/main".into(),
                project_name: "demo".into(),
                parent_branch_id: None,
                is_primary: true,
                snapshot_name: None,
                zfs_dataset: "tank/pgforge/demo-main".into(),
                zfs_dataset_name: "demo-main".into(),
                container_name: "pgforge-demo-main".into(),
                port: 55432,
                created_at: chrono::Utc::now(),
                size_bytes: 0,
                status: BranchStatus::Running,
            }],
        }
    }

    #[test]
    fn save_then_load_roundtrips_byte_identical_json() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let mut guard = store.begin().unwrap();
        guard.catalog_mut().initialize("tank", "pgforge").unwrap();
        guard.catalog_mut().add_project(sample_project()).unwrap();
        guard.commit().unwrap();

        let first_write = fs::read_to_string(store.state_path()).unwrap();

        let mut guard = store.begin().unwrap();
        // No-op mutation; re-saving the identical catalog must reproduce the
        // same bytes (spec §8: `save(load(save(S))) == save(S)`).
        guard.commit().unwrap();

        let second_write = fs::read_to_string(store.state_path()).unwrap();
        assert_eq!(first_write, second_write);
    }

    #[test]
    fn missing_catalog_file_is_equivalent_to_empty_uninitialized() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();
        assert!(!store.state_path().exists());

        let catalog = store.snapshot().unwrap();
        assert!(!catalog.initialized);
        assert!(catalog.projects.is_empty());
    }

    #[test]
    fn double_initialize_fails_already_exists() {
        let mut catalog = Catalog::default();
        catalog.initialize("tank", "pgforge").unwrap();
        let err = catalog.initialize("tank2", "pgforge2").unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn duplicate_project_name_fails_already_exists() {
        let mut catalog = Catalog::default();
        catalog.add_project(sample_project()).unwrap();
        let err = catalog.add_project(sample_project()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn branch_lookup_by_namespace() {
        let mut catalog = Catalog::default();
        catalog.add_project(sample_project()).unwrap();
        let branch = catalog.branch_by_namespace("demo/main").unwrap();
        assert!(branch.is_primary);
        assert!(catalog.branch_by_namespace("demo/missing").is_none());
    }

    #[test]
    fn delete_old_snapshots_only_removes_expired_ones() {
        let mut catalog = Catalog::default();
        let old = Snapshot {
            id: "s-old".into(),
            branch_id: "b-main".into(),
            branch_name: "demo/main".into(),
            project_name: "demo".into(),
            zfs_snapshot: "tank/pgforge/demo-main@old".into(),
            created_at: chrono::Utc::now() - chrono::Duration::days(40),
            label: None,
            size_bytes: 0,
            implicit: true,
        };
        let recent = Snapshot {
            id: "s-new".into(),
            created_at: chrono::Utc::now(),
            ..old.clone()
        };
        catalog.add_snapshot(old.clone()).unwrap();
        catalog.add_snapshot(recent).unwrap();

        let removed = catalog.delete_old_snapshots("demo/main", 30);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "s-old");
        assert_eq!(catalog.list_snapshots(None).len(), 1);
    }

    #[test]
    fn snapshot_has_dependents_matches_bare_leaf_against_full_ref() {
        let mut catalog = Catalog::default();
        catalog.add_project(sample_project()).unwrap();
        let snapshot = Snapshot {
            id: "s-1".into(),
            branch_id: "b-main".into(),
            branch_name: "demo/main".into(),
            project_name: "demo".into(),
            zfs_snapshot: "tank/pgforge/demo-main@2026-01-01T00-00-00".into(),
            created_at: chrono::Utc::now(),
            label: None,
            size_bytes: 0,
            implicit: true,
        };
        catalog.add_snapshot(snapshot).unwrap();
        assert!(!catalog.snapshot_has_dependents("s-1"));

        catalog
            .project_by_name_mut("demo")
            .unwrap()
            .branches
            .get_mut(0)
            .unwrap()
            .snapshot_name = Some("2026-01-01T00-00-00".into());
        assert!(catalog.snapshot_has_dependents("s-1"));

        assert!(!catalog.snapshot_has_dependents("missing"));
    }
}
