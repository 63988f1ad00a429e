//! The lifecycle seam.

use std::future::Future;
use std::pin::Pin;

use crate::error::LifecycleResult;
use crate::workload::Workload;

/// Boxed future returned by [`WorkerLifecycle`] operations.
pub type LifecycleFuture<'a, T> = Pin<Box<dyn Future<Output = LifecycleResult<T>> + Send + 'a>>;

/// Idempotent operations on one worker's sandbox and process.
///
/// A failure leaves nothing to clean up on the caller's side; the next
/// call starts over from whatever the host currently shows.
pub trait WorkerLifecycle: Send + Sync {
    /// Run the workload's host-init actions if the host has not seen them
    /// yet. Returns true if they ran.
    fn bootstrap_host<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, bool>;

    /// Create the sandbox, replacing any existing one.
    fn ensure_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()>;

    /// Start the process unless it already runs with the same command line,
    /// then wait until it is observed. Returns its pid.
    fn start_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, u32>;

    /// Stop the process. Absence counts as success.
    fn stop_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()>;

    /// Remove the sandbox. Absence counts as success.
    fn remove_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()>;

    /// Pid of the running process, if any.
    fn inspect<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, Option<u32>>;
}
