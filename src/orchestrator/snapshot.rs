//! `snapshot-create`, `snapshot-delete` (spec §4.F.5–F.6).

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{BranchStatus, Snapshot};
use crate::naming;
use crate::storage::CowStorageDriver;

use super::Engine;

impl Engine {
    pub async fn snapshot_create(&self, namespace: &str, label: Option<&str>) -> Result<Snapshot> {
        let catalog = self.store.snapshot()?;
        let branch = catalog
            .branch_by_namespace(namespace)
            .ok_or_else(|| EngineError::NotFound(format!("branch '{namespace}' not found")))?
            .clone();
        let project = catalog
            .project_by_name(&branch.project_name)
            .ok_or_else(|| EngineError::NotFound(format!("project '{}' not found", branch.project_name)))?
            .clone();

        if branch.status == BranchStatus::Running {
            self.containers
                .exec_sql(&branch.container_name, "CHECKPOINT;", &project.credentials.username)
                .await?;
        }

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);
        let snap_name = naming::snapshot_name(Utc::now(), label);
        storage.create_snapshot(&branch.zfs_dataset, &snap_name).await?;
        let full_ref = naming::snapshot_ref(&branch.zfs_dataset, &snap_name);
        let size_bytes = storage.get_snapshot_size(&full_ref).await.unwrap_or(0);

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            branch_id: branch.id.clone(),
            branch_name: branch.name.clone(),
            project_name: project.name.clone(),
            zfs_snapshot: full_ref,
            created_at: Utc::now(),
            label: label.map(|l| naming::canonicalize(l).0),
            size_bytes,
            implicit: false,
        };

        let mut guard = self.store.begin()?;
        guard.catalog_mut().add_snapshot(snapshot.clone())?;
        guard.commit()?;

        log::info!("snapshot '{}' created for branch '{namespace}'", snapshot.zfs_snapshot);
        Ok(snapshot)
    }

    pub async fn snapshot_delete(&self, id: &str) -> Result<()> {
        let catalog = self.store.snapshot()?;
        let snapshot = catalog
            .get_snapshot_by_id(id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot '{id}' not found")))?
            .clone();

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);
        storage.destroy_snapshot(&snapshot.zfs_snapshot).await?;

        let mut guard = self.store.begin()?;
        guard.catalog_mut().delete_snapshot(id)?;
        guard.commit()?;

        log::info!("snapshot '{id}' deleted");
        Ok(())
    }
}
