//! The remote execution seam.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::TransportResult;

/// Boxed future returned by [`RemoteExecutor`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Runs commands on, and copies files to and from, worker hosts.
///
/// Implementations must be safe to call concurrently for different hosts;
/// every call is independent and carries its own timeout.
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on `host` and return its stdout.
    ///
    /// A non-zero exit status is an error carrying stderr.
    fn run<'a>(&'a self, host: &'a str, command: &'a str) -> TransportFuture<'a, String>;

    /// Copy the local file `local` to `remote_path` on `host`, creating
    /// parent directories as needed.
    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()>;

    /// Copy `remote_path` on `host` into the local file `local`.
    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote_path: &'a str,
        local: &'a Path,
    ) -> TransportFuture<'a, ()>;
}
