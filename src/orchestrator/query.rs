//! Read-only lookups (`project get/list`, `branch get/list`, `status`) and
//! `project-delete` — not one of the five core workflows of spec §4.F, but
//! named by spec §6's CLI surface as "destroy the whole project once every
//! branch but the primary is gone." Container/dataset teardown here is
//! best-effort (teacher precedent: `LocalBackend::destroy_project` logs and
//! continues rather than aborting mid-teardown).

use futures_util::future::join_all;

use crate::container::ContainerState;
use crate::error::{EngineError, Result};
use crate::model::{Branch, BranchStatus, Project};
use crate::storage::{CowStorageDriver, PoolStatus};

use super::Engine;

pub struct StatusReport {
    pub initialized: bool,
    pub pool: Option<PoolStatus>,
    pub projects: Vec<Project>,
}

impl Engine {
    pub async fn project_list(&self) -> Result<Vec<Project>> {
        let catalog = self.store.snapshot()?;
        let mut projects = catalog.projects.clone();
        for project in &mut projects {
            project.branches = self.refresh_statuses(project.branches.clone()).await?;
        }
        Ok(projects)
    }

    pub async fn project_get(&self, name: &str) -> Result<Project> {
        let catalog = self.store.snapshot()?;
        let mut project = catalog
            .project_by_name(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("project '{name}' not found")))?;
        project.branches = self.refresh_statuses(project.branches).await?;
        Ok(project)
    }

    /// Requires every non-primary branch to already be gone (spec §3:
    /// "destroyed only when every branch has been destroyed first").
    pub async fn project_delete(&self, name: &str) -> Result<()> {
        let catalog = self.store.snapshot()?;
        let project = catalog
            .project_by_name(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("project '{name}' not found")))?;

        if project.branches.len() > 1 {
            return Err(EngineError::StorageBusy(format!(
                "project '{name}' still has {} branch(es) besides the primary; delete them first",
                project.branches.len() - 1
            )));
        }

        let primary = project.primary_branch().cloned().ok_or_else(|| {
            EngineError::Inconsistent(format!("project '{name}' has no primary branch"))
        })?;

        match self.containers.get_container_status(&primary.container_name).await {
            Ok(status) if status.state != ContainerState::NotFound => {
                if let Err(e) = self.containers.stop_container(&primary.container_name).await {
                    log::warn!("failed to stop container '{}': {e}", primary.container_name);
                }
                if let Err(e) = self.containers.remove_container(&primary.container_name).await {
                    log::warn!("failed to remove container '{}': {e}", primary.container_name);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("failed to query container '{}': {e}", primary.container_name),
        }

        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);
        if let Err(e) = storage.destroy_dataset(&primary.zfs_dataset_name).await {
            log::warn!("failed to destroy dataset '{}': {e}", primary.zfs_dataset_name);
        }

        let mut guard = self.store.begin()?;
        guard.catalog_mut().remove_project(name)?;
        guard.commit()?;

        log::info!("project '{name}' deleted");
        Ok(())
    }

    pub async fn branch_list(&self, project_filter: Option<&str>) -> Result<Vec<Branch>> {
        let catalog = self.store.snapshot()?;
        let branches: Vec<Branch> = catalog
            .projects
            .iter()
            .filter(|p| project_filter.map_or(true, |f| p.name == f))
            .flat_map(|p| p.branches.clone())
            .collect();
        self.refresh_statuses(branches).await
    }

    pub async fn branch_get(&self, namespace: &str) -> Result<Branch> {
        let catalog = self.store.snapshot()?;
        let branch = catalog
            .branch_by_namespace(namespace)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("branch '{namespace}' not found")))?;
        let mut refreshed = self.refresh_statuses(vec![branch]).await?;
        Ok(refreshed.remove(0))
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let catalog = self.store.snapshot()?;
        let pool = if catalog.initialized {
            let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);
            storage
                .get_pool_status(&catalog.zfs_pool)
                .await
                .map(Some)
                .unwrap_or_else(|e| {
                    log::warn!("failed to query pool '{}' status: {e}", catalog.zfs_pool);
                    None
                })
        } else {
            None
        };

        let mut projects = catalog.projects.clone();
        for project in &mut projects {
            project.branches = self.refresh_statuses(project.branches.clone()).await?;
        }

        Ok(StatusReport {
            initialized: catalog.initialized,
            pool,
            projects,
        })
    }

    /// Concurrently re-probes each branch's container (spec §5: "internal
    /// parallelism is permitted only for independent read-only queries, e.g.
    /// refreshing status of N containers for a listing") and persists any
    /// `running → stopped` drift discovered (spec §4.F state machine).
    async fn refresh_statuses(&self, mut branches: Vec<Branch>) -> Result<Vec<Branch>> {
        let checks = branches
            .iter()
            .map(|b| self.containers.get_container_status(&b.container_name));
        let results = join_all(checks).await;

        let mut drifted = Vec::new();
        for (branch, probe) in branches.iter_mut().zip(results) {
            let actually_running = matches!(probe, Ok(status) if status.state == ContainerState::Running);
            if branch.status == BranchStatus::Running && !actually_running {
                branch.status = BranchStatus::Stopped;
                drifted.push(branch.clone());
            }
        }

        if !drifted.is_empty() {
            let mut guard = self.store.begin()?;
            for branch in drifted {
                guard.catalog_mut().update_branch(branch)?;
            }
            guard.commit()?;
        }

        Ok(branches)
    }
}
