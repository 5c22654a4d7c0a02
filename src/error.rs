use std::fmt;

use crate::records::{ContainerKind, ContainerStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("container engine unavailable")]
    EngineUnavailable,

    #[error("image operation failed: {message}")]
    Image {
        message: String,
        build_logs: Option<String>,
    },

    #[error("engine rejected resource limits: {message}")]
    Quota { message: String },

    #[error("container quota exceeded: {current} of {max} containers in use")]
    QuotaExceeded { current: i64, max: i64 },

    #[error("host port {port} already in use")]
    PortInUse { port: u16 },

    #[error("no host ports available in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("engine error: {message}")]
    Runtime { message: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("storage error at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("record and engine state diverged for runtime id {runtime_id}")]
    Drift { runtime_id: String },

    #[error("concurrent operation in progress for this user and kind")]
    Busy,

    #[error("container already exists in state {status}")]
    AlreadyExists { status: ContainerStatus },

    #[error("engine cleanup failed, record retained: {message}")]
    DeleteIncomplete { message: String },

    #[error("state transition invalid: {from} -> {to}")]
    InvalidTransition {
        from: ContainerStatus,
        to: ContainerStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),
}

pub type CoreResult<T> = Result<T, Error>;

/// Failure escaping the lifecycle manager. Every one names the user, the
/// container kind and the step that failed so operators can trace what
/// broke without replaying the request.
#[derive(Debug)]
pub struct LifecycleError {
    pub user_id: i64,
    pub kind: ContainerKind,
    pub step: &'static str,
    pub last_status: Option<ContainerStatus>,
    pub source: Error,
}

impl LifecycleError {
    pub(crate) fn new(user_id: i64, kind: ContainerKind, step: &'static str, source: Error) -> Self {
        Self {
            user_id,
            kind,
            step,
            last_status: None,
            source,
        }
    }

    pub(crate) fn with_status(mut self, status: ContainerStatus) -> Self {
        self.last_status = Some(status);
        self
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for user {} ({})",
            self.step, self.user_id, self.kind
        )?;
        if let Some(status) = self.last_status {
            write!(f, " [last known status: {}]", status)?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
