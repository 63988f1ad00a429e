pub mod plan;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use fleet_core::DomainConfig;
use fleet_plan::PlanApi;
use fleet_transport::SshExecutor;

/// Load the domain config and open its document store.
pub fn open(config: &Path) -> anyhow::Result<PlanApi> {
    let config = DomainConfig::from_file(config)?;
    let executor = Arc::new(SshExecutor::new(&config.transport));
    Ok(PlanApi::open(config, executor)?)
}
