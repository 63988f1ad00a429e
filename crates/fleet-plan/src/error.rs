//! Error types for the plan API.

use thiserror::Error;

use fleet_core::ConfigError;
use fleet_state::StateError;

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("unknown role {0:?}")]
    UnknownRole(String),

    /// A command that acts on existing workers found none.
    #[error("no known workers for role {0:?}")]
    NoWorkers(String),
}
