//! fleet-state — per-worker document store for the fleet control plane.
//!
//! Every worker owns at most three documents: desired (`user-target`),
//! applied (`final-target`) and heartbeat. The [`StateStore`] reads and
//! writes them through a swappable [`DocumentBackend`]:
//!
//! - [`FsBackend`]: the canonical tree
//!   `<state_dir>/<domain>/<role>/<worker>-<kind>.json`
//! - [`RedbBackend`]: one embedded [redb](https://docs.rs/redb) table keyed
//!   `{domain}/{role}/{worker}/{kind}`, with an in-memory mode for tests
//!
//! It also moves documents between the admin host and worker hosts:
//! pushing applied targets out and pulling heartbeats back.
//!
//! A missing document is a valid state: reads return `Ok(None)`.

pub mod backend;
pub mod error;
pub mod fs_backend;
pub mod redb_backend;
pub mod store;
pub mod tables;

pub use backend::{DocumentBackend, DocumentKey};
pub use error::{StateError, StateResult};
pub use fs_backend::FsBackend;
pub use redb_backend::RedbBackend;
pub use store::StateStore;
