use std::fmt::Write as _;

use fleet_core::{UserCommand, WorkerIdentity};
use fleet_plan::PlanApi;

fn written(command: &str, role: &str, ids: &[WorkerIdentity]) -> String {
    let mut out = format!("{command}: wrote desired state for {} worker(s) of {role}\n", ids.len());
    for id in ids {
        let _ = writeln!(out, "  {id}");
    }
    out
}

pub fn submit(api: &PlanApi, role: &str, command: UserCommand) -> anyhow::Result<String> {
    let ids = api.submit(role, command)?;
    Ok(written(command.as_str(), role, &ids))
}

pub fn update_data(
    api: &PlanApi,
    role: &str,
    index_name: &str,
    index_path: &str,
) -> anyhow::Result<String> {
    let ids = api.update_data(role, index_name, index_path)?;
    Ok(written(UserCommand::Upf.as_str(), role, &ids))
}
