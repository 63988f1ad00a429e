//! fleet-lifecycle — idempotent operations on one worker's sandbox and process.
//!
//! [`WorkerLifecycle`] is the seam the reconcile engine drives. Every
//! operation is safe to repeat: creating a sandbox replaces any existing
//! one, starting an already-running process is a no-op, and stopping or
//! removing something absent succeeds.
//!
//! [`HostLifecycle`] implements it over a [`fleet_transport::RemoteExecutor`]
//! in one of two sandbox modes:
//!
//! - **container**: an idle docker container per worker; the process is
//!   started inside it with `docker exec`
//! - **process**: a runtime directory per worker; the process runs on the
//!   host under `nohup` and is known only by the pid file in that directory
//!
//! [`testing::RecordingLifecycle`] is an in-memory stand-in for tests of the
//! layers above.

pub mod bootstrap;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod probe;
pub mod retry;
pub mod testing;
pub mod workload;

pub use error::{LifecycleError, LifecycleResult};
pub use host::HostLifecycle;
pub use lifecycle::{LifecycleFuture, WorkerLifecycle};
pub use retry::RetryPolicy;
pub use workload::Workload;
