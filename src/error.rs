//! The error taxonomy of spec §7. Driver internals use `anyhow::Error` with
//! `.context()` chains exactly as the teacher does; the Orchestrator boundary
//! classifies those into one of the kinds below so the CLI can map them to
//! an exit code and a kind-specific message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input, name conflict, primary-delete-with-children, both
    /// `--image` and `--version` given.
    #[error("{0}")]
    UserError(String),

    /// Project/branch/snapshot/container absent.
    #[error("{0}")]
    NotFound(String),

    /// Storage or container name collision discovered mid-workflow.
    #[error("{0}")]
    AlreadyExists(String),

    /// Destroy refused because clones depend on a snapshot or dataset.
    #[error("{0}")]
    StorageBusy(String),

    /// Container started but the readiness probe didn't succeed in time.
    #[error("{0}")]
    Unhealthy(String),

    /// Storage or container subsystem returned an unclassified failure.
    #[error("{0}")]
    DriverError(#[from] anyhow::Error),

    /// State file references an entity the driver says doesn't exist, or
    /// vice versa. Surfaced, never auto-corrected.
    #[error("{0}")]
    Inconsistent(String),
}

impl EngineError {
    /// Exit codes of spec §7: 0 success, 1 user error, 2 operational error,
    /// 130 on signal (handled by the CLI's signal handler, not here).
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::UserError(_)
            | EngineError::NotFound(_)
            | EngineError::AlreadyExists(_) => 1,
            EngineError::StorageBusy(_)
            | EngineError::Unhealthy(_)
            | EngineError::DriverError(_)
            | EngineError::Inconsistent(_) => 2,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UserError(_) => "UserError",
            EngineError::NotFound(_) => "NotFound",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::StorageBusy(_) => "StorageBusy",
            EngineError::Unhealthy(_) => "Unhealthy",
            EngineError::DriverError(_) => "DriverError",
            EngineError::Inconsistent(_) => "Inconsistent",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
