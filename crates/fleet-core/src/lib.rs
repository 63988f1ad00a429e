//! fleet-core — shared data model for the fleet control plane.
//!
//! A [`Target`] is one configuration snapshot for exactly one worker
//! process. Every worker owns up to three of them (desired, applied and
//! heartbeat); the state store persists them and the reconcile engine
//! drives applied towards desired.
//!
//! This crate is pure: no I/O beyond reading the domain config file.

pub mod config;
pub mod error;
pub mod expand;
pub mod partition;
pub mod target;

pub use config::{
    parse_duration, DaemonConfig, DomainConfig, DomainSection, LifecycleConfig, RoleConfig,
    SandboxMode, StoreBackend, TransportConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use expand::{expand_role, host_for_slot};
pub use partition::{partition_intervals, worker_id, KeyRange, KEY_RANGE_MAX};
pub use target::*;
