//! `project-create` (spec §4.F.1).

use chrono::Utc;
use uuid::Uuid;

use crate::container::ContainerSpec;
use crate::error::{EngineError, Result};
use crate::model::{Branch, BranchStatus, Credentials, Project};
use crate::naming;
use crate::storage::{CowStorageDriver, DatasetOptions};

use super::Engine;

pub struct CreateProjectRequest {
    pub name: String,
    pub image: Option<String>,
    pub version: Option<String>,
    pub pool: Option<String>,
}

impl Engine {
    pub async fn project_create(&self, req: CreateProjectRequest) -> Result<Project> {
        if req.image.is_some() && req.version.is_some() {
            return Err(EngineError::UserError(
                "specify either --image or --version, not both".to_string(),
            ));
        }

        let (name, changed) = naming::canonicalize(&req.name);
        if changed {
            log::info!("project name interpreted as '{name}'");
        }

        let image = req
            .image
            .or_else(|| req.version.as_ref().map(|v| format!("postgres:{v}-alpine")))
            .unwrap_or_else(|| self.config.default_image.clone());

        let catalog = self.store.snapshot()?;
        if !catalog.initialized {
            self.auto_initialize(req.pool.as_deref().or(self.config.pool.as_deref())).await?;
        }

        let catalog = self.store.snapshot()?;
        if catalog.project_by_name(&name).is_some() {
            return Err(EngineError::UserError(format!(
                "project '{name}' already exists"
            )));
        }

        let dataset_leaf = naming::dataset_name(&name, "main");
        let storage = self.storage_driver(&catalog.zfs_pool, &catalog.zfs_dataset_base);

        storage
            .create_dataset(&dataset_leaf, &DatasetOptions::default())
            .await?;

        let result = self.create_primary_container(&name, &image).await;

        let (_container_id, port) = match result {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("project-create '{name}' failed after storage provisioning, rolling back dataset");
                if let Err(rollback_err) = storage.destroy_dataset(&dataset_leaf).await {
                    log::warn!("compensation failed to destroy dataset '{dataset_leaf}': {rollback_err}");
                }
                return Err(e);
            }
        };

        let used_space = storage.get_used_space(&dataset_leaf).await.unwrap_or(0);
        let namespace = naming::branch_namespace(&name, "main");
        let dataset_path = naming::dataset_path(&catalog.zfs_pool, &catalog.zfs_dataset_base, &name, "main");

        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            image,
            credentials: Credentials {
                username: self.config.pg_user.clone(),
                password: self.config.pg_password.clone(),
                database: self.config.pg_db.clone(),
            },
            created_at: Utc::now(),
            branches: vec![Branch {
                id: Uuid::new_v4().to_string(),
                name: namespace,
                project_name: name.clone(),
                parent_branch_id: None,
                is_primary: true,
                snapshot_name: None,
                zfs_dataset: dataset_path,
                zfs_dataset_name: dataset_leaf,
                container_name: naming::container_name(&name, "main"),
                port,
                created_at: Utc::now(),
                size_bytes: used_space,
                status: BranchStatus::Running,
            }],
        };

        let mut guard = self.store.begin()?;
        if guard.catalog().project_by_name(&name).is_some() {
            return Err(EngineError::UserError(format!(
                "project '{name}' already exists"
            )));
        }
        guard.catalog_mut().add_project(project.clone())?;
        guard.commit()?;

        log::info!("project '{name}' created, primary branch listening on port {port}");
        Ok(project)
    }

    async fn auto_initialize(&self, pool_override: Option<&str>) -> Result<()> {
        let pool = match pool_override {
            Some(p) => p.to_string(),
            None => {
                let discovery = self.storage_driver("", "");
                let pools = discovery.detect_pools().await?;
                match pools.len() {
                    1 => pools.into_iter().next().unwrap().name,
                    0 => {
                        return Err(EngineError::UserError(
                            "no importable ZFS pool found; pass --pool".to_string(),
                        ))
                    }
                    _ => {
                        return Err(EngineError::UserError(
                            "multiple ZFS pools found; pass --pool to choose one".to_string(),
                        ))
                    }
                }
            }
        };

        tokio::fs::create_dir_all(self.config.data_root.join("wal-archive"))
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create WAL archive root: {e}")))?;

        let mut guard = self.store.begin()?;
        guard.catalog_mut().initialize(pool, self.config.dataset_base.clone())?;
        guard.commit()
    }

    async fn create_primary_container(
        &self,
        project_name: &str,
        image: &str,
    ) -> Result<(String, u16)> {
        if !self.containers.image_exists(image).await? {
            self.containers.pull_image(image).await?;
        }

        let data_path = self.branch_data_path(project_name, "main");
        let wal_path = self.branch_wal_archive_path(project_name, "main");
        tokio::fs::create_dir_all(&data_path)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create data directory: {e}")))?;
        tokio::fs::create_dir_all(&wal_path)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create WAL archive directory: {e}")))?;

        let spec = ContainerSpec {
            name: naming::container_name(project_name, "main"),
            image: image.to_string(),
            port: 0,
            data_path,
            wal_archive_path: wal_path,
            username: self.config.pg_user.clone(),
            password: self.config.pg_password.clone(),
            database: self.config.pg_db.clone(),
        };

        let id = self.containers.create_container(&spec).await?;

        let start_result = async {
            self.containers.start_container(&id).await?;
            self.containers
                .wait_for_healthy(&id, &self.config.pg_user, &self.config.pg_db, self.config.startup_timeout)
                .await
        }
        .await;

        if let Err(e) = start_result {
            log::warn!("compensating failed container start for project '{project_name}'");
            if let Err(remove_err) = self.containers.remove_container(&id).await {
                log::warn!("compensation failed to remove container '{id}': {remove_err}");
            }
            return Err(e);
        }

        let port = self.containers.get_container_port(&id).await?;
        Ok((id, port))
    }
}
