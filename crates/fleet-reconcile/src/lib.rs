//! fleet-reconcile — brings every worker's APPLIED document into agreement
//! with its DESIRED document.
//!
//! - [`ReconcileEngine`] performs one level-triggered step for one worker:
//!   derive its [`Phase`], act through the lifecycle, commit APPLIED.
//! - [`DomainDaemon`] runs the reconcile and heartbeat loops, fanning each
//!   tick out over all workers with bounded parallelism and joining the
//!   whole tick before the next one starts.
//!
//! A failed step leaves the documents untouched, so the same transition is
//! attempted again on the next tick.

pub mod daemon;
pub mod engine;
pub mod error;
pub mod phase;

pub use daemon::{DaemonSettings, DomainDaemon, TickReport};
pub use engine::{ReconcileEngine, StepOutcome};
pub use error::{ReconcileError, ReconcileResult};
pub use phase::Phase;
