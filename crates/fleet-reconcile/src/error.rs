//! Reconcile error types.

use fleet_lifecycle::LifecycleError;
use fleet_state::StateError;
use thiserror::Error;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("lifecycle: {0}")]
    Lifecycle(LifecycleError),

    /// The desired document cannot be acted on.
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

impl From<LifecycleError> for ReconcileError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::InvalidPlan(msg) => ReconcileError::UnsupportedConfig(msg),
            other => ReconcileError::Lifecycle(other),
        }
    }
}
