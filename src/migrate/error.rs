//! Migrator error taxonomy.

use thiserror::Error;

use crate::migrate::docker::DockerApiError;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Docker(#[from] DockerApiError),

    #[error("dependency {0} was never registered")]
    UnknownDependency(String),

    #[error("translation table has no destination id for source {0}")]
    UntranslatedReference(String),

    #[error("sync channel error: {0}")]
    SyncChannel(String),

    #[error("agent container failed to start: {0}")]
    AgentStart(String),

    #[error("daemon config migration failed: {0}")]
    DaemonConfig(String),

    #[error("credential migration failed: {0}")]
    CredentialMigration(String),

    #[error("insufficient free disk on source: need at least {need} bytes, have {have}")]
    InsufficientDisk { need: u64, have: u64 },

    #[error("destination already has entities and force was not set")]
    DestinationNotEmpty,

    #[error("{0}")]
    Other(String),
}

impl MigrateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::Docker(e) if e.is_status_error(409) || e.is_status_error(404))
    }
}

pub type MigrateResult<T> = std::result::Result<T, MigrateError>;
