//! Plan API: turns operator commands into DESIRED documents.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use fleet_core::{
    epoch_millis, expand_role, ConfigError, DomainConfig, Target, TargetKind, UserCommand,
    WorkerIdentity,
};
use fleet_state::StateStore;
use fleet_transport::RemoteExecutor;

use crate::error::{PlanError, PlanResult};
use crate::status::{self, WorkerDetail};

/// Writes operator intent for one domain.
///
/// Re-issuing a command simply overwrites the previous DESIRED document;
/// nothing here waits for, or is blocked by, reconciliation in flight.
pub struct PlanApi {
    config: DomainConfig,
    store: StateStore,
}

impl PlanApi {
    pub fn new(config: DomainConfig, store: StateStore) -> Self {
        Self { config, store }
    }

    /// Open the domain's document store as described by `config`.
    pub fn open(config: DomainConfig, executor: Arc<dyn RemoteExecutor>) -> PlanResult<Self> {
        let store = StateStore::open(&config, executor)?;
        Ok(Self::new(config, store))
    }

    pub fn domain(&self) -> &str {
        &self.config.domain.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Issue `command` to every worker of the selected role(s).
    ///
    /// `selector` is a role name or `all`. START and RESTART expand the
    /// role plan from config. UPC, UPF and DP expand it too but keep the
    /// data locations of the current DESIRED document. STOP and REMOVE
    /// are written over the workers the store already knows.
    pub fn submit(&self, selector: &str, command: UserCommand) -> PlanResult<Vec<WorkerIdentity>> {
        let written = match command {
            UserCommand::Stop | UserCommand::Remove => self.reissue(selector, command)?,
            _ => self.expand(selector, command, |_| {})?,
        };
        info!(
            domain = %self.domain(),
            role = selector,
            command = %command,
            workers = written.len(),
            "desired state written"
        );
        Ok(written)
    }

    /// Point every worker of `role` at a new data location.
    ///
    /// Writes DESIRED with command UPF, carrying the other data locations
    /// over from the current DESIRED document.
    pub fn update_data(
        &self,
        role: &str,
        index_name: &str,
        index_path: &str,
    ) -> PlanResult<Vec<WorkerIdentity>> {
        if index_name.trim().is_empty() || index_path.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "index name and index path must not be empty".to_string(),
            )
            .into());
        }
        if role == "all" {
            return Err(ConfigError::UnsupportedConfig(
                "a data update targets a single role".to_string(),
            )
            .into());
        }
        let written = self.expand(role, UserCommand::Upf, |target| {
            target
                .plan
                .data
                .insert(index_name.to_string(), index_path.to_string());
        })?;
        info!(
            domain = %self.domain(),
            role,
            index_name,
            index_path,
            workers = written.len(),
            "data update written"
        );
        Ok(written)
    }

    /// Expand role plans into DESIRED documents.
    ///
    /// For commands other than START/RESTART the data locations of an
    /// existing DESIRED document are kept before `adjust` runs.
    fn expand(
        &self,
        selector: &str,
        command: UserCommand,
        adjust: impl Fn(&mut Target),
    ) -> PlanResult<Vec<WorkerIdentity>> {
        let carry_data = !matches!(command, UserCommand::Start | UserCommand::Restart);
        let mut written = Vec::new();

        for role_name in self.configured_roles(selector)? {
            let role = self.config.role(&role_name)?;
            for mut target in expand_role(self.domain(), &role_name, role, command)? {
                let identity = target.identity();
                if carry_data {
                    if let Some(current) = self.store.read(&identity, TargetKind::Desired)? {
                        target.plan.data = current.plan.data;
                    }
                }
                adjust(&mut target);
                self.store.write(&target)?;
                written.push(identity);
            }
        }
        Ok(written)
    }

    /// Re-issue `command` over every known worker, keeping its plan.
    fn reissue(&self, selector: &str, command: UserCommand) -> PlanResult<Vec<WorkerIdentity>> {
        let mut written = Vec::new();
        for role in self.known_roles(selector)? {
            for worker in self.store.list_workers(self.domain(), &role)? {
                let identity = WorkerIdentity::new(self.domain(), &role, &worker);
                let base = match self.store.read(&identity, TargetKind::Desired)? {
                    Some(desired) => desired,
                    None => match self.store.read(&identity, TargetKind::Applied)? {
                        Some(applied) => applied.as_kind(TargetKind::Desired),
                        // Heartbeat only: nothing to carry a plan from.
                        None => continue,
                    },
                };
                self.store.write(&base.with_command(command))?;
                written.push(identity);
            }
        }
        if written.is_empty() {
            return Err(PlanError::NoWorkers(selector.to_string()));
        }
        Ok(written)
    }

    /// Roles with a plan template in config.
    fn configured_roles(&self, selector: &str) -> PlanResult<Vec<String>> {
        if selector == "all" {
            return Ok(self.config.roles.keys().cloned().collect());
        }
        if self.config.roles.contains_key(selector) {
            return Ok(vec![selector.to_string()]);
        }
        Err(PlanError::UnknownRole(selector.to_string()))
    }

    /// Roles in config or with documents in the store.
    pub fn known_roles(&self, selector: &str) -> PlanResult<Vec<String>> {
        let stored = self.store.list_roles(self.domain())?;
        if selector == "all" {
            let mut roles: BTreeSet<String> = self.config.roles.keys().cloned().collect();
            roles.extend(stored);
            return Ok(roles.into_iter().collect());
        }
        if self.config.roles.contains_key(selector) || stored.iter().any(|r| r == selector) {
            return Ok(vec![selector.to_string()]);
        }
        Err(PlanError::UnknownRole(selector.to_string()))
    }

    /// Heartbeats older than this are reported stale.
    pub fn stale_after(&self) -> Duration {
        self.config.daemon.heartbeat_stale_after()
    }

    /// Status of every worker of the selected role(s), sorted by role
    /// then worker.
    pub fn status(&self, selector: &str) -> PlanResult<Vec<WorkerDetail>> {
        let now = epoch_millis();
        let mut details = Vec::new();
        for role in self.known_roles(selector)? {
            for worker in self.store.list_workers(self.domain(), &role)? {
                let identity = WorkerIdentity::new(self.domain(), &role, &worker);
                if let Some(detail) = status::inspect(&self.store, &identity, self.stale_after(), now)? {
                    details.push(detail);
                }
            }
        }
        Ok(details)
    }

    /// Status of one worker, or `None` when it has no documents.
    pub fn worker_status(&self, role: &str, worker: &str) -> PlanResult<Option<WorkerDetail>> {
        let identity = WorkerIdentity::new(self.domain(), role, worker);
        status::inspect(&self.store, &identity, self.stale_after(), epoch_millis())
    }
}
