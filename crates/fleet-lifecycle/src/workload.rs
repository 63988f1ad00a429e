//! What a lifecycle needs to know about one worker.

use fleet_core::{HostInit, LaunchSpec, Placement, Target, WorkerIdentity};

use crate::error::{LifecycleError, LifecycleResult};

/// The parts of a target that lifecycle operations act on.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub identity: WorkerIdentity,
    pub placement: Placement,
    pub launch: LaunchSpec,
    pub host_init: HostInit,
}

impl Workload {
    /// Build a workload from a target, rejecting plans that cannot run.
    pub fn from_target(target: &Target) -> LifecycleResult<Self> {
        target
            .plan
            .validate()
            .map_err(|e| LifecycleError::InvalidPlan(format!("{}: {e}", target.identity())))?;
        Ok(Self {
            identity: target.identity(),
            placement: target.plan.placement.clone(),
            launch: target.plan.launch.clone(),
            host_init: target.host_init.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.placement.host
    }

    /// Docker container name. Worker ids are unique within a domain.
    pub fn container_name(&self) -> String {
        format!("fleet-{}-{}", self.identity.domain, self.identity.worker)
    }
}
