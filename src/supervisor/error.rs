//! Supervisor error types — distinguishes failure classes so callers can
//! decide between retrying, surfacing a status, or giving up.

/// Errors raised by supervised-service lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Service '{0}' did not become healthy within the start timeout")]
    HealthTimeout(String),

    #[error("Failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}
