//! Top-level error taxonomy shared by the migrator and the network stack.

use thiserror::Error;

use crate::migrate::MigrateError;
use crate::netstack::NetstackError;

/// Error taxonomy per §7: precondition / transient / partial / fatal.
///
/// Transient errors never escape this far — they are handled locally
/// (retried, recorded as a partial failure, or mapped to a guest-visible
/// signal) by the subsystem that observed them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Destination already has entities and `force` was not set, insufficient
    /// free disk, or an unsupported source-engine feature was detected.
    /// Reported before any task is submitted; no side effects on destination.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// At least one per-entity task failed. The destination engine is left
    /// in a usable state; `failures` names every failing entity.
    #[error("migration partially failed: {} entities failed", failures.len())]
    Partial { failures: Vec<EntityFailure> },

    /// Agent container failed to start, sync server failed to start, or
    /// daemon config write failed. The run is aborted.
    #[error("fatal error in phase {phase}: {source}")]
    Fatal {
        phase: &'static str,
        #[source]
        source: MigrateError,
    },

    /// A migrator error that aborted the run without being tied to one
    /// named phase (e.g. a connection failure before phase 1 starts).
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error(transparent)]
    Netstack(#[from] NetstackError),
}

/// One failing entity, as recorded by the error tracker and surfaced in a
/// [`CoreError::Partial`].
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub source_id: String,
    pub kind: &'static str,
    pub message: String,
}

impl std::fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.source_id, self.message)
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
