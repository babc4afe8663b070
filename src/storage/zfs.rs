//! Concrete `CowStorageDriver` over the `zfs`/`zpool` CLIs. Grounded in the
//! teacher's `backends/local/storage/zfs_driver.rs` (machine-readable `-H`
//! output, stderr-to-typed-error mapping) and `zfs_setup.rs` (pool status
//! and auto-detection).

use std::ffi::OsString;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{EngineError, Result};

use super::{CowStorageDriver, DatasetOptions, PoolStatus};

pub struct ZfsDriver {
    pool: String,
    base: String,
}

impl ZfsDriver {
    pub fn new(pool: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            base: base.into(),
        }
    }

    fn full_path(&self, leaf: &str) -> String {
        format!("{}/{}/{leaf}", self.pool, self.base)
    }

    async fn dataset_exists(&self, full: &str) -> Result<bool> {
        let output = zfs_output(["list", "-H", "-o", "name", full]).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl CowStorageDriver for ZfsDriver {
    async fn create_dataset(&self, name: &str, options: &DatasetOptions) -> Result<()> {
        let full = self.full_path(name);
        if self.dataset_exists(&full).await? {
            return Err(EngineError::AlreadyExists(format!(
                "dataset '{full}' already exists"
            )));
        }

        let mut args = vec![
            OsString::from("create"),
            OsString::from("-p"),
        ];
        if let Some(compression) = &options.compression {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("compression={compression}")));
        }
        if let Some(recordsize) = &options.recordsize {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!("recordsize={recordsize}")));
        }
        args.push(OsString::from(full.clone()));

        zfs_output_os(args)
            .await?
            .success_or_driver_error(&format!("failed to create dataset '{full}'"))
    }

    async fn destroy_dataset(&self, name: &str) -> Result<()> {
        let full = self.full_path(name);
        if !self.dataset_exists(&full).await? {
            return Ok(());
        }

        let output = zfs_output(["destroy", "-r", &full]).await?;
        if output.status.success() {
            return Ok(());
        }
        classify_destroy_failure(&output, &full)
    }

    async fn create_snapshot(&self, dataset_name: &str, snap_name: &str) -> Result<()> {
        let full_ref = format!("{dataset_name}@{snap_name}");
        let exists = zfs_output(["list", "-H", "-t", "snapshot", "-o", "name", &full_ref]).await?;
        if exists.status.success() {
            return Err(EngineError::AlreadyExists(format!(
                "snapshot '{full_ref}' already exists"
            )));
        }

        zfs_output(["snapshot", &full_ref])
            .await?
            .success_or_driver_error(&format!("failed to create snapshot '{full_ref}'"))
    }

    async fn destroy_snapshot(&self, full_ref: &str) -> Result<()> {
        let exists = zfs_output(["list", "-H", "-t", "snapshot", "-o", "name", full_ref]).await?;
        if !exists.status.success() {
            return Ok(());
        }

        let output = zfs_output(["destroy", full_ref]).await?;
        if output.status.success() {
            return Ok(());
        }
        classify_destroy_failure(&output, full_ref)
    }

    async fn clone_snapshot(&self, full_snapshot_ref: &str, new_dataset_name: &str) -> Result<()> {
        let full = self.full_path(new_dataset_name);
        if self.dataset_exists(&full).await? {
            return Err(EngineError::AlreadyExists(format!(
                "dataset '{full}' already exists"
            )));
        }

        zfs_output(["clone", full_snapshot_ref, &full])
            .await?
            .success_or_driver_error(&format!(
                "failed to clone '{full_snapshot_ref}' into '{full}'"
            ))
    }

    async fn get_mountpoint(&self, name: &str) -> Result<String> {
        let full = self.full_path(name);
        let output = zfs_output(["get", "-H", "-o", "value", "mountpoint", &full]).await?;
        if !output.status.success() {
            return Err(EngineError::NotFound(format!("dataset '{full}' not found")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn get_used_space(&self, name: &str) -> Result<u64> {
        let full = self.full_path(name);
        let output = zfs_output(["get", "-H", "-p", "-o", "value", "used", &full]).await?;
        if !output.status.success() {
            return Err(EngineError::NotFound(format!("dataset '{full}' not found")));
        }
        parse_bytes(&output.stdout)
    }

    async fn get_snapshot_size(&self, full_ref: &str) -> Result<u64> {
        let output = zfs_output(["get", "-H", "-p", "-o", "value", "used", full_ref]).await?;
        if !output.status.success() {
            return Err(EngineError::NotFound(format!(
                "snapshot '{full_ref}' not found"
            )));
        }
        parse_bytes(&output.stdout)
    }

    async fn get_pool_status(&self, pool: &str) -> Result<PoolStatus> {
        let output = zpool_output(["list", "-H", "-p", "-o", "name,health,size,alloc,free", pool])
            .await?;
        if !output.status.success() {
            return Err(EngineError::NotFound(format!("pool '{pool}' not found")));
        }
        parse_pool_line(&output.stdout)
            .ok_or_else(|| EngineError::Inconsistent(format!("unparseable zpool output for '{pool}'")))
    }

    async fn detect_pools(&self) -> Result<Vec<PoolStatus>> {
        let output = zpool_output(["list", "-H", "-p", "-o", "name,health,size,alloc,free"]).await?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_pool_line_str).collect())
    }
}

fn classify_destroy_failure(output: &std::process::Output, target: &str) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("dependent clones") || stderr.contains("is busy") || stderr.contains("has children")
    {
        return Err(EngineError::StorageBusy(format!(
            "'{target}' has dependents: {stderr}"
        )));
    }
    Err(EngineError::DriverError(anyhow::anyhow!(
        "failed to destroy '{target}': {stderr}"
    )))
}

fn parse_bytes(stdout: &[u8]) -> Result<u64> {
    String::from_utf8_lossy(stdout)
        .trim()
        .parse::<u64>()
        .map_err(|e| EngineError::Inconsistent(format!("unparseable zfs size output: {e}")))
}

fn parse_pool_line(stdout: &[u8]) -> Option<PoolStatus> {
    parse_pool_line_str(String::from_utf8_lossy(stdout).lines().next()?)
}

fn parse_pool_line_str(line: &str) -> Option<PoolStatus> {
    let mut parts = line.split('\t');
    let name = parts.next()?.to_string();
    let health = parts.next()?.to_string();
    let size_bytes = parts.next()?.parse().ok()?;
    let allocated_bytes = parts.next()?.parse().ok()?;
    let free_bytes = parts.next()?.parse().ok()?;
    Some(PoolStatus {
        name,
        health,
        size_bytes,
        allocated_bytes,
        free_bytes,
    })
}

async fn zfs_output<const N: usize>(args: [&str; N]) -> Result<std::process::Output> {
    Command::new("zfs")
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to execute zfs: {e}")))
}

async fn zfs_output_os(args: Vec<OsString>) -> Result<std::process::Output> {
    Command::new("zfs")
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to execute zfs: {e}")))
}

async fn zpool_output<const N: usize>(args: [&str; N]) -> Result<std::process::Output> {
    Command::new("zpool")
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::DriverError(anyhow::anyhow!("failed to execute zpool: {e}")))
}

trait OutputExt {
    fn success_or_driver_error(self, context: &str) -> Result<()>;
}

impl OutputExt for std::process::Output {
    fn success_or_driver_error(self, context: &str) -> Result<()> {
        if self.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        Err(EngineError::DriverError(anyhow::anyhow!(
            "{context}: {stderr}"
        )))
    }
}
