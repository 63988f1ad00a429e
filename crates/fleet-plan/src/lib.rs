//! fleet-plan — the operator-facing side of the control plane.
//!
//! Every command only writes DESIRED documents and returns; the daemon
//! carries the change out on its own schedule. Status queries read the
//! APPLIED and HEARTBEAT documents back.

pub mod api;
pub mod error;
pub mod status;

pub use api::PlanApi;
pub use error::{PlanError, PlanResult};
pub use status::{render_summary, Level, WorkerDetail, WorkerStatus};
