use parlance_provisioner::ProvisionError;
use parlance_store::StoreError;
use thiserror::Error;

/// Failure of one transition step. Never propagates out of a tick: the
/// supervisor records a warning on the resource and either moves it to its
/// failed state (permanent provisioner errors) or leaves it where it is for
/// the next tick.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("provisioner error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("{0}")]
    Invariant(String),
}

impl SupervisorError {
    /// Whether the step can never succeed as posed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SupervisorError::Provision(err) if err.is_permanent())
    }
}
