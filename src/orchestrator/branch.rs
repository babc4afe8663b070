//! `branch-create`, `branch-reset`, `branch-delete` (spec §4.F.2–F.4).

use chrono::Utc;
use uuid::Uuid;

use crate::container::{ContainerSpec, ContainerState};
use crate::error::{EngineError, Result};
use crate::model::{Branch, BranchStatus, Snapshot};
use crate::naming;
use crate::storage::CowStorageDriver;

use super::Engine;

impl Engine {
    pub async fn branch_create(&self, parent_namespace: &str, child_leaf: &str) -> Result<Branch> {
        let (child_leaf, changed) = naming::canonicalize(child_leaf);
        if changed {
            log::info!("branch name interpreted as '{child_leaf}'");
        }

        let catalog = self.store.snapshot()?;
        let parent = catalog
            .branch_by_namespace(parent_namespace)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{parent_namespace}' not found")))?
            .clone();
        let project = catalog
            .project_by_name(&parent.project_name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{}' not found", parent.project_name)))?
            .clone();

        let child_namespace = naming::branch_namespace(&project.name, &child_leaf);
        if catalog.branch_by_namespace(&child_namespace).is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "branch '{child_namespace}' already exists"
            )));
        }

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);

        if parent.status == BranchStatus::Running {
            self.containers
                .exec_sql(&parent.container_name, "CHECKPOINT;", &project.credentials.username)
                .await?;
        }

        let snap_name = naming::snapshot_name(Utc::now(), None);
        storage.create_snapshot(&parent.zfs_dataset, &snap_name).await?;
        let snapshot_ref = naming::snapshot_ref(&parent.zfs_dataset, &snap_name);

        let child_dataset_leaf = naming::dataset_name(&project.name, &child_leaf);
        if let Err(e) = storage.clone_snapshot(&snapshot_ref, &child_dataset_leaf).await {
            log::warn!("compensating failed clone by destroying snapshot '{snapshot_ref}'");
            if let Err(rollback_err) = storage.destroy_snapshot(&snapshot_ref).await {
                log::warn!("compensation failed to destroy snapshot '{snapshot_ref}': {rollback_err}");
            }
            return Err(e);
        }

        let data_path = self.branch_data_path(&project.name, &child_leaf);
        let wal_path = self.branch_wal_archive_path(&project.name, &child_leaf);
        tokio::fs::create_dir_all(&data_path)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create data directory: {e}")))?;
        tokio::fs::create_dir_all(&wal_path)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create WAL archive directory: {e}")))?;

        let spec = ContainerSpec {
            name: naming::container_name(&project.name, &child_leaf),
            image: project.image.clone(),
            port: 0,
            data_path,
            wal_archive_path: wal_path,
            username: project.credentials.username.clone(),
            password: project.credentials.password.clone(),
            database: project.credentials.database.clone(),
        };

        let container_result = async {
            let id = self.containers.create_container(&spec).await?;
            self.containers.start_container(&id).await?;
            self.containers
                .wait_for_healthy(&id, &project.credentials.username, &project.credentials.database, self.config.startup_timeout)
                .await?;
            let port = self.containers.get_container_port(&id).await?;
            Ok(port)
        }
        .await;

        let port = match container_result {
            Ok(port) => port,
            Err(e) => {
                log::warn!("compensating failed container start by destroying clone '{child_dataset_leaf}' and snapshot '{snapshot_ref}'");
                if let Err(rollback_err) = storage.destroy_dataset(&child_dataset_leaf).await {
                    log::warn!("compensation failed to destroy dataset '{child_dataset_leaf}': {rollback_err}");
                }
                if let Err(rollback_err) = storage.destroy_snapshot(&snapshot_ref).await {
                    log::warn!("compensation failed to destroy snapshot '{snapshot_ref}': {rollback_err}");
                }
                return Err(e);
            }
        };

        let used_space = storage.get_used_space(&child_dataset_leaf).await.unwrap_or(0);
        let dataset_path = naming::dataset_path(&catalog.zfs_pool, &catalog.zfs_dataset_base, &project.name, &child_leaf);

        let branch = Branch {
            id: Uuid::new_v4().to_string(),
            name: child_namespace,
            project_name: project.name.clone(),
            parent_branch_id: Some(parent.id.clone()),
            is_primary: false,
            snapshot_name: Some(snap_name.clone()),
            zfs_dataset: dataset_path,
            zfs_dataset_name: child_dataset_leaf,
            container_name: naming::container_name(&project.name, &child_leaf),
            port,
            created_at: Utc::now(),
            size_bytes: used_space,
            status: BranchStatus::Running,
        };

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            branch_id: parent.id.clone(),
            branch_name: parent.name.clone(),
            project_name: project.name.clone(),
            zfs_snapshot: snapshot_ref,
            created_at: Utc::now(),
            label: None,
            size_bytes: storage.get_snapshot_size(&naming::snapshot_ref(&parent.zfs_dataset, &snap_name)).await.unwrap_or(0),
            implicit: true,
        };

        let mut guard = self.store.begin()?;
        guard.catalog_mut().add_branch(&project.name, branch.clone())?;
        guard.catalog_mut().add_snapshot(snapshot)?;
        guard.commit()?;

        log::info!("branch '{}' created from '{parent_namespace}'", branch.name);
        Ok(branch)
    }

    /// Restores a branch to its origin snapshot, discarding all divergence
    /// (spec §4.F.3). Primaries have no origin snapshot and cannot be reset.
    pub async fn branch_reset(&self, namespace: &str) -> Result<Branch> {
        let catalog = self.store.snapshot()?;
        let branch = catalog
            .branch_by_namespace(namespace)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{namespace}' not found")))?
            .clone();
        if branch.is_primary {
            return Err(EngineError::UserError(
                "the primary branch has no snapshot to reset to".to_string(),
            ));
        }
        let project = catalog
            .project_by_name(&branch.project_name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{}' not found", branch.project_name)))?
            .clone();
        let snap_name = branch
            .snapshot_name
            .clone()
            .ok_or_else(|| EngineError::Inconsistent(format!("branch '{namespace}' has no recorded origin snapshot")))?;

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);

        self.containers.stop_container(&branch.container_name).await?;
        self.containers.remove_container(&branch.container_name).await?;
        storage.destroy_dataset(&branch.zfs_dataset_name).await?;

        let mark_stopped = |engine: &Self, mut branch: Branch| -> Result<Branch> {
            branch.status = BranchStatus::Stopped;
            let mut guard = engine.store.begin()?;
            guard.catalog_mut().update_branch(branch.clone())?;
            guard.commit()?;
            Ok(branch)
        };

        // The snapshot record for this origin was taken on the parent's
        // dataset, not the branch's own — look it up by its recorded suffix
        // rather than guessing a path from the child's dataset.
        let suffix = format!("@{snap_name}");
        let Some(snapshot_ref) = catalog
            .snapshots
            .iter()
            .find(|s| s.zfs_snapshot.ends_with(&suffix))
            .map(|s| s.zfs_snapshot.clone())
        else {
            return mark_stopped(self, branch);
        };

        if let Err(e) = storage.clone_snapshot(&snapshot_ref, &branch.zfs_dataset_name).await {
            log::warn!("branch-reset '{namespace}' could not re-clone from '{snapshot_ref}': {e}");
            return mark_stopped(self, branch);
        }

        let spec = ContainerSpec {
            name: branch.container_name.clone(),
            image: project.image.clone(),
            port: branch.port,
            data_path: self.branch_data_path(&project.name, branch.leaf()),
            wal_archive_path: self.branch_wal_archive_path(&project.name, branch.leaf()),
            username: project.credentials.username.clone(),
            password: project.credentials.password.clone(),
            database: project.credentials.database.clone(),
        };

        let restart = async {
            let id = self.containers.create_container(&spec).await?;
            self.containers.start_container(&id).await?;
            self.containers
                .wait_for_healthy(&id, &project.credentials.username, &project.credentials.database, self.config.startup_timeout)
                .await
        }
        .await;

        if let Err(e) = restart {
            log::warn!("branch-reset '{namespace}' failed to restart after re-clone: {e}");
            return mark_stopped(self, branch);
        }

        branch.size_bytes = storage.get_used_space(&branch.zfs_dataset_name).await.unwrap_or(branch.size_bytes);
        branch.status = BranchStatus::Running;

        let mut guard = self.store.begin()?;
        guard.catalog_mut().update_branch(branch.clone())?;
        guard.commit()?;

        log::info!("branch '{namespace}' reset to '{snap_name}'");
        Ok(branch)
    }

    /// Primary branches may only be deleted by deleting the whole project
    /// (spec §4.F.4): a primary delete fails with `StorageBusy` if other
    /// branches exist.
    pub async fn branch_delete(&self, namespace: &str) -> Result<()> {
        let catalog = self.store.snapshot()?;
        let branch = catalog
            .branch_by_namespace(namespace)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{namespace}' not found")))?
            .clone();

        if branch.is_primary {
            let project = catalog
                .project_by_name(&branch.project_name)
                .ok_or_else(|| EngineError::NotFound(format!("project '{}' not found", branch.project_name)))?;
            if project.branches.len() > 1 {
                return Err(EngineError::UserError(
                    "cannot delete the primary branch while other branches exist; delete the project instead".to_string(),
                ));
            }
        }

        match self.containers.get_container_status(&branch.container_name).await?.state {
            ContainerState::NotFound => {}
            _ => {
                self.containers.stop_container(&branch.container_name).await?;
                self.containers.remove_container(&branch.container_name).await?;
            }
        }

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);
        storage.destroy_dataset(&branch.zfs_dataset_name).await?;

        let mut guard = self.store.begin()?;
        guard.catalog_mut().remove_branch(&branch.project_name, &branch.id)?;

        if let Some(snap_name) = &branch.snapshot_name {
            // The snapshot record keyed by the timestamp this branch recorded
            // as its origin, taken on the parent's dataset — not derivable
            // from the child's own dataset path, so look it up by suffix.
            let suffix = format!("@{snap_name}");
            if let Some(snapshot) = guard
                .catalog()
                .snapshots
                .iter()
                .find(|s| s.zfs_snapshot.ends_with(&suffix))
                .cloned()
            {
                let still_depended_on = guard.catalog().snapshot_has_dependents(&snapshot.id);
                if snapshot.implicit && !still_depended_on {
                    if let Err(e) = storage.destroy_snapshot(&snapshot.zfs_snapshot).await {
                        log::warn!(
                            "failed to garbage-collect implicit snapshot '{}': {e}",
                            snapshot.zfs_snapshot
                        );
                    } else {
                        guard.catalog_mut().delete_snapshot(&snapshot.id)?;
                    }
                }
            }
        }

        guard.commit()?;
        log::info!("branch '{namespace}' deleted");
        Ok(())
    }
}
