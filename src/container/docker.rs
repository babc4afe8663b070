//! Concrete `ContainerDriver` over `bollard::Docker`. Grounded in the
//! teacher's `backends/local/docker.rs`: status polling via
//! `inspect_container`, pause/unpause retained for the parent-quiescing
//! pattern, `exec_check`'s exec/start/inspect dance generalized to capture
//! stdout instead of only a boolean.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::exec::StartExecOptions;
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, ExecConfig, HostConfig, PortBinding, PortMap};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::TryStreamExt;
use tokio::time::{sleep, Instant};

use crate::error::{EngineError, Result};

use super::{ContainerDriver, ContainerSpec, ContainerState, ContainerStatus};

const PGDATA_CONTAINER_PATH: &str = "/var/lib/postgresql/data";
const WAL_ARCHIVE_CONTAINER_PATH: &str = "/var/lib/postgresql/wal-archive";

pub struct DockerContainerDriver {
    client: Docker,
}

impl DockerContainerDriver {
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to connect to Docker daemon: {e}")))?;
        Ok(Self { client })
    }

    async fn raw_status(&self, id: &str) -> Result<ContainerStatus> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.as_ref().and_then(|s| s.status.clone());
                let started_at = info
                    .state
                    .as_ref()
                    .and_then(|s| s.started_at.as_ref())
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));
                let state = match state {
                    Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
                    Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
                    Some(ContainerStateStatusEnum::EXITED)
                    | Some(ContainerStateStatusEnum::CREATED) => ContainerState::Exited,
                    _ => ContainerState::Exited,
                };
                Ok(ContainerStatus { state, started_at })
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(ContainerStatus {
                    state: ContainerState::NotFound,
                    started_at: None,
                })
            }
            Err(e) => Err(EngineError::DriverError(anyhow::anyhow!(
                "failed to inspect container '{id}': {e}"
            ))),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerContainerDriver {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.client.inspect_image(image).await.is_ok())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((name, tag)) => (name.to_string(), Some(tag.to_string())),
            None => (image.to_string(), None),
        };

        let options = CreateImageOptions {
            from_image: Some(from_image),
            tag,
            ..Default::default()
        };

        self.client
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to pull image '{image}': {e}")))?;

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let data_bind = format!("{}:{PGDATA_CONTAINER_PATH}", spec.data_path.display());
        let wal_bind = format!(
            "{}:{WAL_ARCHIVE_CONTAINER_PATH}",
            spec.wal_archive_path.display()
        );

        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            "5432/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: if spec.port == 0 {
                    None
                } else {
                    Some(spec.port.to_string())
                },
            }]),
        );

        let mut labels = HashMap::new();
        labels.insert("pgforge.managed".to_string(), "true".to_string());

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(vec![
                format!("POSTGRES_USER={}", spec.username),
                format!("POSTGRES_PASSWORD={}", spec.password),
                format!("POSTGRES_DB={}", spec.database),
                format!("PGDATA={PGDATA_CONTAINER_PATH}/pgdata"),
            ]),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(vec![data_bind, wal_bind]),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!(
                "failed to create container '{}': {e}",
                spec.name
            )))?;

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self.raw_status(id).await?.state {
            ContainerState::Running => return Ok(()),
            ContainerState::Paused => return self.unpause_container(id).await,
            _ => {}
        }

        self.client
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to start container '{id}': {e}")))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.raw_status(id).await?.state {
            ContainerState::NotFound | ContainerState::Exited => return Ok(()),
            ContainerState::Paused => self.unpause_container(id).await?,
            ContainerState::Running => {}
        }

        let options = StopContainerOptions {
            t: Some(20),
            ..Default::default()
        };

        self.client
            .stop_container(id, Some(options))
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to stop container '{id}': {e}")))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if matches!(self.raw_status(id).await?.state, ContainerState::NotFound) {
            return Ok(());
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to remove container '{id}': {e}")))
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        if !matches!(self.raw_status(id).await?.state, ContainerState::Running) {
            return Ok(());
        }
        self.client
            .pause_container(id)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to pause container '{id}': {e}")))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        if !matches!(self.raw_status(id).await?.state, ContainerState::Paused) {
            return Ok(());
        }
        self.client
            .unpause_container(id)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to unpause container '{id}': {e}")))
    }

    async fn wait_for_healthy(
        &self,
        id: &str,
        username: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::Unhealthy(format!(
                    "timed out waiting for postgres readiness in '{id}'"
                )));
            }

            match self.raw_status(id).await?.state {
                ContainerState::NotFound => {
                    return Err(EngineError::Unhealthy(format!(
                        "container '{id}' does not exist"
                    )));
                }
                ContainerState::Running => {
                    if self
                        .exec_check(id, &["pg_isready", "-U", username, "-d", database])
                        .await
                    {
                        return Ok(());
                    }
                }
                _ => {}
            }

            sleep(Duration::from_millis(500)).await;
        }
    }

    async fn get_container_by_name(&self, name: &str) -> Result<Option<String>> {
        match self.raw_status(name).await?.state {
            ContainerState::NotFound => Ok(None),
            _ => Ok(Some(name.to_string())),
        }
    }

    async fn get_container_status(&self, id: &str) -> Result<ContainerStatus> {
        self.raw_status(id).await
    }

    async fn get_container_port(&self, id: &str) -> Result<u16> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to inspect container '{id}': {e}")))?;

        info.network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get("5432/tcp").cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| EngineError::Inconsistent(format!(
                "container '{id}' has no host port bound to 5432/tcp"
            )))
    }

    async fn exec_sql(&self, id: &str, sql: &str, username: &str) -> Result<String> {
        let config = ExecConfig {
            cmd: Some(
                ["psql", "-U", username, "-At", "-c", sql]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, config)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to create exec in '{id}': {e}")))?;

        let start_opts = Some(StartExecOptions {
            detach: false,
            ..Default::default()
        });

        let mut captured = String::new();
        match self
            .client
            .start_exec(&exec.id, start_opts)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to start exec in '{id}': {e}")))?
        {
            bollard::exec::StartExecResults::Attached { mut output, .. } => {
                while let Ok(Some(chunk)) = output.try_next().await {
                    captured.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
            bollard::exec::StartExecResults::Detached => {}
        }

        let info = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to inspect exec in '{id}': {e}")))?;

        if info.exit_code != Some(0) {
            return Err(EngineError::DriverError(anyhow::anyhow!(
                "sql statement failed in container '{id}': {captured}"
            )));
        }

        Ok(captured.trim().to_string())
    }
}

impl DockerContainerDriver {
    async fn exec_check(&self, id: &str, cmd: &[&str]) -> bool {
        let config = ExecConfig {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match self.client.create_exec(id, config).await {
            Ok(e) => e,
            Err(_) => return false,
        };

        let start_opts = Some(StartExecOptions {
            detach: false,
            ..Default::default()
        });

        match self.client.start_exec(&exec.id, start_opts).await {
            Ok(bollard::exec::StartExecResults::Attached { mut output, .. }) => {
                while output.try_next().await.ok().flatten().is_some() {}
            }
            Ok(bollard::exec::StartExecResults::Detached) => {}
            Err(_) => return false,
        }

        matches!(self.client.inspect_exec(&exec.id).await, Ok(info) if info.exit_code == Some(0))
    }
}

