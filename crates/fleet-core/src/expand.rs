//! Role plan expansion: one desired target per (replica, partition) slot.

use std::collections::BTreeMap;

use crate::config::RoleConfig;
use crate::error::ConfigResult;
use crate::partition::{partition_intervals, worker_id, KeyRange};
use crate::target::{
    LaunchSpec, Placement, Plan, Slot, Target, TargetKind, UserCommand, WorkerIdentity,
};

/// Host for a slot: the role's host list is used round-robin in slot order.
pub fn host_for_slot(role: &RoleConfig, replica: u32, partition: u32) -> &str {
    let index = (replica as usize * role.partition_count as usize + partition as usize)
        % role.hosts.len().max(1);
    role.hosts.get(index).map(String::as_str).unwrap_or_default()
}

/// Expand a role's plan template into desired targets.
///
/// Targets are returned replica-major: all partitions of replica 0 first.
pub fn expand_role(
    domain: &str,
    role_name: &str,
    role: &RoleConfig,
    command: UserCommand,
) -> ConfigResult<Vec<Target>> {
    let ranges = partition_intervals(role.partition_count)?;
    let mut targets = Vec::with_capacity(ranges.len() * role.replica_count as usize);

    for replica in 0..role.replica_count {
        for (partition, range) in (0u32..).zip(ranges.iter().copied()) {
            let worker = worker_id(role_name, replica, partition, range);
            let vars = SlotVars {
                domain,
                role: role_name,
                worker: &worker,
                replica,
                partition,
                range,
            };

            let plan = Plan {
                placement: Placement {
                    host: host_for_slot(role, replica, partition).to_string(),
                    image: role.image.clone(),
                    cpus: role.cpus,
                    memory_mb: role.memory_mb,
                    mounts: role.mounts.clone(),
                },
                slot: Slot {
                    replica,
                    partition,
                    replica_count: role.replica_count,
                    partition_count: role.partition_count,
                    range,
                },
                launch: LaunchSpec {
                    command: role.command.clone(),
                    args: role.args.iter().map(|a| vars.render(a)).collect(),
                    env: role
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), vars.render(v)))
                        .collect::<BTreeMap<_, _>>(),
                    work_dir: role.work_dir.as_deref().map(|w| vars.render(w)),
                },
                biz: role.biz.clone(),
                data: role.data.clone(),
            };
            plan.validate()?;

            let identity = WorkerIdentity::new(domain, role_name, &worker);
            targets.push(Target::new(
                TargetKind::Desired,
                &identity,
                command,
                plan,
                role.host_init.clone(),
            ));
        }
    }
    Ok(targets)
}

/// Per-slot placeholder values.
struct SlotVars<'a> {
    domain: &'a str,
    role: &'a str,
    worker: &'a str,
    replica: u32,
    partition: u32,
    range: KeyRange,
}

impl SlotVars<'_> {
    fn render(&self, template: &str) -> String {
        template
            .replace("{domain}", self.domain)
            .replace("{role}", self.role)
            .replace("{worker}", self.worker)
            .replace("{replica}", &self.replica.to_string())
            .replace("{partition}", &self.partition.to_string())
            .replace("{from}", &self.range.from.to_string())
            .replace("{to}", &self.range.to.to_string())
    }
}
