//! Component C: the Container Driver (spec §4.C). A trait over the Docker
//! Engine API so `orchestrator` never talks to `bollard` directly.

pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// 0 ⇒ the runtime dynamically assigns a free host port (spec §4.E).
    pub port: u16,
    pub data_path: PathBuf,
    pub wal_archive_path: PathBuf,
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    NotFound,
    Running,
    Paused,
    Exited,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub started_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Network I/O, retriable.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Creates but does not start. Mounts `data_path` at the PostgreSQL data
    /// directory and `wal_archive_path` at the WAL archive directory.
    /// Returns the new container's id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Quiesces the parent branch's container around a clone (teacher
    /// precedent: `LocalBackend::create_branch` pause/unpause bracketing).
    async fn pause_container(&self, id: &str) -> Result<()>;
    async fn unpause_container(&self, id: &str) -> Result<()>;

    /// Polls container health until a PostgreSQL-ready probe succeeds or
    /// `timeout` elapses; fails with `EngineError::Unhealthy`.
    async fn wait_for_healthy(
        &self,
        id: &str,
        username: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn get_container_by_name(&self, name: &str) -> Result<Option<String>>;
    async fn get_container_status(&self, id: &str) -> Result<ContainerStatus>;

    /// Host port bound to `5432/tcp`.
    async fn get_container_port(&self, id: &str) -> Result<u16>;

    /// Runs one SQL statement inside the container and returns captured
    /// stdout (`branch-create`/`snapshot-create` need the output of
    /// `CHECKPOINT;` to be visible for diagnostics, not just a success bit).
    async fn exec_sql(&self, id: &str, sql: &str, username: &str) -> Result<String>;
}
