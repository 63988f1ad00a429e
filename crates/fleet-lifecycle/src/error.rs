//! Lifecycle error types.

use fleet_transport::TransportError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The host could not be reached, or a transfer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The process was started but never showed up in the process table.
    #[error("{worker}: process not observed after {attempts} probes")]
    NotObserved { worker: String, attempts: u32 },

    /// The host ran the operation and refused it.
    #[error("{worker}: {operation} failed: {source}")]
    Remote {
        worker: String,
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    /// The plan cannot be acted on in the configured sandbox mode.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl LifecycleError {
    /// Wrap a transport error raised while performing `operation`.
    ///
    /// Commands that ran and failed are reported as [`LifecycleError::Remote`];
    /// everything else stays a transport failure.
    pub fn from_remote(worker: &str, operation: &'static str, source: TransportError) -> Self {
        if source.is_command_failure() {
            LifecycleError::Remote {
                worker: worker.to_string(),
                operation,
                source,
            }
        } else {
            LifecycleError::Transport(source)
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, LifecycleError::Transport(_))
    }
}
