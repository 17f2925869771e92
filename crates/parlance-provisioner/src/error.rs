use parlance_domain::ProvisionerKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The request can never succeed as posed. Supervisors move the resource
    /// to its failed state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The remote side refused or timed out. Supervisors stay in the current
    /// state, record a warning, and retry next tick.
    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("provisioner not configured for kind: {0}")]
    NotConfigured(ProvisionerKind),

    #[error("internal provisioner error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Whether the failure is permanent (maps to a `…-failed` state) rather
    /// than retriable.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProvisionError::Validation(_) | ProvisionError::NotConfigured(_))
    }
}
