use thiserror::Error;

/// Typed failure taxonomy for the deployment pipeline.
///
/// The orchestrator matches on these categories to decide between a local
/// abort (nothing destructive has happened yet) and a full rollback.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A pre-flight check failed. Non-destructive; fix the condition and
    /// re-run.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Checksum mismatch after writing a backup artifact. Never proceed
    /// without a verified backup.
    #[error("backup integrity check failed for '{source_name}': expected {expected}, got {actual}")]
    BackupIntegrity {
        source_name: String,
        expected: String,
        actual: String,
    },

    /// A step inside a phase failed; triggers automatic rollback.
    #[error("step '{step}' failed in phase '{phase}': {reason}")]
    PhaseStepFailure {
        phase: String,
        step: String,
        reason: String,
    },

    /// Health polling exhausted its budget without reaching UP.
    #[error("health check '{target}' did not pass within {budget_secs}s")]
    HealthCheckTimeout { target: String, budget_secs: u64 },

    /// The rollback path itself could not restore a healthy state. Fatal,
    /// requires human escalation; never retried automatically.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    /// Another run holds the per-environment lease.
    #[error("deployment already in progress for environment '{environment}' (held by pid {holder_pid})")]
    LeaseHeld { environment: String, holder_pid: u32 },
}
