//! Target documents: one configuration snapshot for one worker.
//!
//! The persisted field names (`type`, `domain_name`, `role_name`,
//! `worker_name`, `user_cmd`, `plan`, `host_init`, `timestamp`) are the
//! on-disk contract shared with the agents running on worker hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, ConfigResult};
use crate::partition::KeyRange;

// ── Kind ──────────────────────────────────────────────────────────

/// Which of the three per-worker documents a target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    /// Operator intent. Written only by the plan API.
    #[serde(rename = "user-target")]
    Desired,
    /// Observed-applied reality. Written only by the reconcile engine.
    #[serde(rename = "final-target")]
    Applied,
    /// Liveness pulled back from the worker host.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] = [
        TargetKind::Desired,
        TargetKind::Applied,
        TargetKind::Heartbeat,
    ];

    /// Document name suffix, e.g. `user-target`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Desired => "user-target",
            TargetKind::Applied => "final-target",
            TargetKind::Heartbeat => "heartbeat",
        }
    }

    /// File name of this document for a worker: `<worker>-<kind>.json`.
    pub fn file_name(&self, worker: &str) -> String {
        format!("{worker}-{}.json", self.as_str())
    }

    /// Split a document file name back into `(worker, kind)`.
    pub fn parse_file_name(name: &str) -> Option<(&str, TargetKind)> {
        let stem = name.strip_suffix(".json")?;
        Self::ALL.into_iter().find_map(|kind| {
            stem.strip_suffix(kind.as_str())
                .and_then(|rest| rest.strip_suffix('-'))
                .filter(|worker| !worker.is_empty())
                .map(|worker| (worker, kind))
        })
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Command ───────────────────────────────────────────────────────

/// Operator intent that produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserCommand {
    Start,
    Stop,
    Remove,
    Restart,
    /// Config refresh without a data change.
    Upc,
    /// Data update: a new index location.
    Upf,
    /// Package deploy to an already-running worker.
    Dp,
}

impl UserCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserCommand::Start => "start",
            UserCommand::Stop => "stop",
            UserCommand::Remove => "remove",
            UserCommand::Restart => "restart",
            UserCommand::Upc => "upc",
            UserCommand::Upf => "upf",
            UserCommand::Dp => "dp",
        }
    }

    /// Commands whose effect is a running process on the host.
    pub fn is_launch(&self) -> bool {
        matches!(
            self,
            UserCommand::Start
                | UserCommand::Restart
                | UserCommand::Upc
                | UserCommand::Upf
                | UserCommand::Dp
        )
    }
}

impl fmt::Display for UserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserCommand {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(UserCommand::Start),
            "stop" => Ok(UserCommand::Stop),
            "remove" => Ok(UserCommand::Remove),
            "restart" => Ok(UserCommand::Restart),
            "upc" | "update_config" => Ok(UserCommand::Upc),
            "upf" | "update_data" => Ok(UserCommand::Upf),
            "dp" | "deploy" => Ok(UserCommand::Dp),
            other => Err(ConfigError::UnknownCommand(other.to_string())),
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────

/// The `(domain, role, worker)` triple addressing one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub domain: String,
    pub role: String,
    pub worker: String,
}

impl WorkerIdentity {
    pub fn new(domain: &str, role: &str, worker: &str) -> Self {
        Self {
            domain: domain.to_string(),
            role: role.to_string(),
            worker: worker.to_string(),
        }
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.role, self.worker)
    }
}

// ── Plan ──────────────────────────────────────────────────────────

/// Nested configuration carried by every target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    pub placement: Placement,
    #[serde(default)]
    pub slot: Slot,
    pub launch: LaunchSpec,
    /// Role-specific business configuration, opaque to the control plane.
    #[serde(default)]
    pub biz: BTreeMap<String, serde_json::Value>,
    /// Named data locations (index name → path).
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Where and inside what the worker process runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Placement {
    /// Host address the worker is assigned to.
    pub host: String,
    /// Container image; unused by the bare-process sandbox.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Bind mounts as `host_path:container_path`.
    #[serde(default)]
    pub mounts: Vec<String>,
}

/// The (replica, partition) slot a worker occupies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Slot {
    pub replica: u32,
    pub partition: u32,
    pub replica_count: u32,
    pub partition_count: u32,
    pub range: KeyRange,
}

/// How the worker process is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl LaunchSpec {
    /// The command line as it shows up in a process table.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Plan {
    /// Reject plans that no lifecycle could act on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.placement.host.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "plan has no placement host".to_string(),
            ));
        }
        if self.launch.command.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "plan has no launch command".to_string(),
            ));
        }
        if let Some(bad) = self.placement.mounts.iter().find(|m| !m.contains(':')) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "mount {bad:?} is not host_path:container_path"
            )));
        }
        if let Some(cpus) = self.placement.cpus {
            if cpus.is_nan() || cpus <= 0.0 {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "cpus must be positive, got {cpus}"
                )));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 of the canonical JSON encoding.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

// ── Host init ─────────────────────────────────────────────────────

/// Host-level bootstrap actions run once per fresh host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HostInit {
    /// Directories that must exist before any worker starts.
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Package URLs prefetched into the host's package directory.
    #[serde(default)]
    pub packages: Vec<String>,
    /// OS-level init commands, run in order.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl HostInit {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.packages.is_empty() && self.commands.is_empty()
    }

    /// Short digest used to key the bootstrap marker.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(&Sha256::digest(&bytes)[..6])
    }
}

// ── Target ────────────────────────────────────────────────────────

/// A desired-or-observed configuration snapshot for one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub domain_name: String,
    pub role_name: String,
    pub worker_name: String,
    pub user_cmd: UserCommand,
    pub plan: Plan,
    #[serde(default)]
    pub host_init: HostInit,
    /// Unix milliseconds, assigned by the writer.
    #[serde(default)]
    pub timestamp: u64,
}

impl Target {
    pub fn new(
        kind: TargetKind,
        identity: &WorkerIdentity,
        user_cmd: UserCommand,
        plan: Plan,
        host_init: HostInit,
    ) -> Self {
        Self {
            kind,
            domain_name: identity.domain.clone(),
            role_name: identity.role.clone(),
            worker_name: identity.worker.clone(),
            user_cmd,
            plan,
            host_init,
            timestamp: epoch_millis(),
        }
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity::new(&self.domain_name, &self.role_name, &self.worker_name)
    }

    /// Copy of this document re-labelled as another kind, freshly stamped.
    pub fn as_kind(&self, kind: TargetKind) -> Self {
        Self {
            kind,
            timestamp: epoch_millis(),
            ..self.clone()
        }
    }

    /// Copy of this document carrying a different command, freshly stamped.
    pub fn with_command(&self, user_cmd: UserCommand) -> Self {
        Self {
            user_cmd,
            timestamp: epoch_millis(),
            ..self.clone()
        }
    }

    /// Whether `other` carries the same command and plan as `self`.
    ///
    /// Timestamps and kinds are ignored.
    pub fn mirrors(&self, other: &Target) -> bool {
        self.user_cmd == other.user_cmd && self.plan == other.plan
    }

    /// The identity triple must be complete before a document is stored.
    pub fn validate_identity(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("domain_name", &self.domain_name),
            ("role_name", &self.role_name),
            ("worker_name", &self.worker_name),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "target {field} {value:?} is empty or contains '/'"
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> Target {
        let identity = WorkerIdentity::new("d1", "searcher", "searcher_0_0_0_65535");
        let plan = Plan {
            placement: Placement {
                host: "10.0.0.1".to_string(),
                image: Some("registry/searcher:1".to_string()),
                cpus: Some(2.0),
                memory_mb: Some(1024),
                mounts: vec!["/data:/data".to_string()],
            },
            launch: LaunchSpec {
                command: "/opt/bin/searcher".to_string(),
                args: vec!["--port".to_string(), "7000".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        Target::new(
            TargetKind::Desired,
            &identity,
            UserCommand::Start,
            plan,
            HostInit::default(),
        )
    }

    #[test]
    fn json_uses_document_field_names() {
        let target = sample_target();
        let value: serde_json::Value = serde_json::from_slice(&target.to_json().unwrap()).unwrap();
        for field in [
            "plan",
            "type",
            "domain_name",
            "role_name",
            "worker_name",
            "user_cmd",
            "host_init",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["type"], "user-target");
        assert_eq!(value["user_cmd"], "start");
    }

    #[test]
    fn json_reload_preserves_fields() {
        let target = sample_target();
        let reloaded = Target::from_json(&target.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, target);
    }

    #[test]
    fn command_parse_rejects_unknown() {
        assert_eq!("UPC".parse::<UserCommand>().unwrap(), UserCommand::Upc);
        assert_eq!("deploy".parse::<UserCommand>().unwrap(), UserCommand::Dp);
        assert!(matches!(
            "reboot".parse::<UserCommand>(),
            Err(ConfigError::UnknownCommand(_))
        ));
    }

    #[test]
    fn unknown_command_rejected_when_deserializing() {
        let mut value = serde_json::to_value(sample_target()).unwrap();
        value["user_cmd"] = serde_json::json!("reboot");
        assert!(serde_json::from_value::<Target>(value).is_err());
    }

    #[test]
    fn file_name_round_trip() {
        let name = TargetKind::Applied.file_name("qrs_0_0_0_65535");
        assert_eq!(name, "qrs_0_0_0_65535-final-target.json");
        assert_eq!(
            TargetKind::parse_file_name(&name),
            Some(("qrs_0_0_0_65535", TargetKind::Applied))
        );
        assert_eq!(TargetKind::parse_file_name("-heartbeat.json"), None);
        assert_eq!(TargetKind::parse_file_name("notes.txt"), None);
    }

    #[test]
    fn mirrors_ignores_timestamp_and_kind() {
        let desired = sample_target();
        let mut applied = desired.as_kind(TargetKind::Applied);
        applied.timestamp += 10;
        assert!(applied.mirrors(&desired));

        applied.plan.data.insert("main".to_string(), "/data/v2".to_string());
        assert!(!applied.mirrors(&desired));
        assert!(!desired.with_command(UserCommand::Stop).mirrors(&desired));
    }

    #[test]
    fn validate_rejects_missing_host_and_command() {
        let mut plan = sample_target().plan;
        assert!(plan.validate().is_ok());

        plan.placement.host.clear();
        assert!(plan.validate().is_err());

        let mut plan = sample_target().plan;
        plan.launch.command = " ".to_string();
        assert!(plan.validate().is_err());

        let mut plan = sample_target().plan;
        plan.placement.mounts.push("/nowhere".to_string());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn identity_validation() {
        let mut target = sample_target();
        assert!(target.validate_identity().is_ok());
        target.worker_name = "a/b".to_string();
        assert!(target.validate_identity().is_err());
    }

    #[test]
    fn command_line_joins_args() {
        let target = sample_target();
        assert_eq!(target.plan.launch.command_line(), "/opt/bin/searcher --port 7000");
    }

    #[test]
    fn digest_tracks_plan_changes() {
        let target = sample_target();
        let mut other = target.plan.clone();
        assert_eq!(target.plan.digest(), other.digest());
        other.biz.insert("generation".to_string(), serde_json::json!(2));
        assert_ne!(target.plan.digest(), other.digest());
    }
}
