//! fleet-transport — how the control plane reaches worker hosts.
//!
//! Everything remote goes through the [`RemoteExecutor`] trait: run a
//! shell command on a host, or copy one file to or from it. The
//! production implementation, [`SshExecutor`], shells out to `ssh` and
//! `rsync` (or `sh`/local copies for hosts listed as local). Callers never
//! see which one they got, so a native SSH client can replace it later.
//!
//! `fake::FakeExecutor` is an in-memory host simulator used by the tests
//! of every crate above this one. It is only built with the `test-util`
//! feature.

pub mod error;
pub mod executor;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod shell;
pub mod ssh;

pub use error::{TransportError, TransportResult};
pub use executor::{RemoteExecutor, TransportFuture};
pub use ssh::SshExecutor;
