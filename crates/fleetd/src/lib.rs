//! fleetd — the domain daemon.
//!
//! One process per domain: loads the domain config, opens the document
//! store, and runs the reconcile and heartbeat loops. An optional
//! read-only HTTP API serves worker status.

pub mod api;

use std::sync::Arc;

use fleet_core::DomainConfig;
use fleet_lifecycle::HostLifecycle;
use fleet_plan::PlanApi;
use fleet_reconcile::{DaemonSettings, DomainDaemon, ReconcileEngine};
use fleet_transport::RemoteExecutor;

/// The assembled control plane of one domain.
pub struct Domain {
    pub plan: Arc<PlanApi>,
    pub daemon: Arc<DomainDaemon>,
}

impl Domain {
    /// Wire store, lifecycle, engine and daemon from one config.
    ///
    /// The daemon and the status API share one store handle.
    pub fn assemble(config: DomainConfig, executor: Arc<dyn RemoteExecutor>) -> anyhow::Result<Self> {
        let lifecycle = Arc::new(HostLifecycle::from_config(&config, Arc::clone(&executor)));
        let settings = DaemonSettings::from_config(&config.daemon);
        let plan = Arc::new(PlanApi::open(config, executor)?);
        let engine = Arc::new(ReconcileEngine::new(plan.store().clone(), lifecycle));
        let daemon = Arc::new(DomainDaemon::new(plan.domain(), engine, settings));
        Ok(Self { plan, daemon })
    }
}
