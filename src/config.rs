//! Layered configuration (spec §9): built-in default, overridden by an
//! optional config file, overridden by environment variables. Modeled on
//! the teacher's `Config`/`EnvConfig` layering, trimmed to the handful of
//! fields this engine's workflows actually read.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default container image when neither `--image` nor `--version` is
    /// given to `project-create`.
    pub default_image: String,
    /// First host port the container runtime is asked to try; currently
    /// unused, since `project-create`/`branch-create` always pass `port = 0`
    /// and let Docker assign the binding (spec §4.E: no separate port
    /// registry). Kept for an explicit-range mode a future driver might want.
    pub port_range_start: u16,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    /// Root directory for per-branch PGDATA/WAL-archive bind mounts and the
    /// catalog file, default `$XDG_DATA_HOME/pgforge`.
    pub data_root: Option<PathBuf>,
    /// `--pool` default; still overridable per-invocation on the CLI.
    pub pool: Option<String>,
    pub zfs_dataset_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_image: "postgres:17".to_string(),
            port_range_start: 55432,
            postgres_user: "postgres".to_string(),
            postgres_password: "postgres".to_string(),
            postgres_db: "postgres".to_string(),
            data_root: None,
            pool: None,
            zfs_dataset_base: "pgforge".to_string(),
        }
    }
}

impl Config {
    /// Config file, then environment overrides, per spec §9.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => {
                log::debug!("no config file found, using built-in defaults");
                Config::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pgforge").join("config.yml"))
    }

    pub fn data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pgforge")
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PGFORGE_DEFAULT_IMAGE") {
            self.default_image = v;
        }
        if let Ok(v) = std::env::var("PGFORGE_PORT_RANGE_START") {
            match v.parse() {
                Ok(port) => self.port_range_start = port,
                Err(e) => log::warn!("ignoring invalid PGFORGE_PORT_RANGE_START '{v}': {e}"),
            }
        }
        if let Ok(v) = std::env::var("PGFORGE_POSTGRES_USER") {
            self.postgres_user = v;
        }
        if let Ok(v) = std::env::var("PGFORGE_POSTGRES_PASSWORD") {
            self.postgres_password = v;
        }
        if let Ok(v) = std::env::var("PGFORGE_POSTGRES_DB") {
            self.postgres_db = v;
        }
        if let Ok(v) = std::env::var("PGFORGE_DATA_ROOT") {
            self.data_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PGFORGE_POOL") {
            self.pool = Some(v);
        }
        if let Ok(v) = std::env::var("PGFORGE_ZFS_DATASET_BASE") {
            self.zfs_dataset_base = v;
        }
    }
}
