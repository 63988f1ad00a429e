//! Domain config parser (`domain.toml`).
//!
//! One file describes a whole domain: where its documents live, how the
//! daemon paces its loops, how hosts are reached, and a plan template per
//! role. Durations are strings like `"5s"` or `"500ms"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::target::HostInit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub domain: DomainSection,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSection {
    pub name: String,
    /// Root of the document tree.
    pub state_dir: PathBuf,
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Medium holding the per-worker documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// One JSON file per document under `state_dir/<domain>/<role>/`.
    #[default]
    Fs,
    /// Embedded redb database at `state_dir/<domain>.redb`.
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
    /// Upper bound on concurrently handled workers within one tick.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Budget for one worker's step within a tick.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: String,
    /// Heartbeats older than this are reported stale.
    #[serde(default = "default_heartbeat_stale_after")]
    pub heartbeat_stale_after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    /// Well-known directory on every worker host.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// Hosts reached without SSH.
    #[serde(default = "default_local_hosts")]
    pub local_hosts: Vec<String>,
    /// Extra `-o` options passed to ssh.
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

/// How a worker process is sandboxed on its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// An idle docker container per worker; the process runs via `docker exec`.
    #[default]
    Container,
    /// A working directory per worker; the process runs directly on the host.
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub sandbox: SandboxMode,
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
    #[serde(default = "default_start_backoff")]
    pub start_backoff: String,
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,
    #[serde(default = "default_bootstrap_backoff")]
    pub bootstrap_backoff: String,
}

/// Plan template for one role, expanded into one target per slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Caller-provided host assignment, used round-robin over slots.
    pub hosts: Vec<String>,
    #[serde(default = "default_count")]
    pub partition_count: u32,
    #[serde(default = "default_count")]
    pub replica_count: u32,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub mounts: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub biz: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub host_init: HostInit,
}

fn default_reconcile_interval() -> String {
    "5s".to_string()
}
fn default_heartbeat_interval() -> String {
    "10s".to_string()
}
fn default_max_parallel() -> usize {
    32
}
fn default_worker_timeout() -> String {
    "300s".to_string()
}
fn default_heartbeat_stale_after() -> String {
    "60s".to_string()
}
fn default_user() -> String {
    "admin".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout() -> String {
    "5s".to_string()
}
fn default_command_timeout() -> String {
    "120s".to_string()
}
fn default_remote_root() -> String {
    "/home/admin/fleet".to_string()
}
fn default_local_hosts() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "localhost".to_string()]
}
fn default_start_attempts() -> u32 {
    10
}
fn default_start_backoff() -> String {
    "2s".to_string()
}
fn default_bootstrap_attempts() -> u32 {
    3
}
fn default_bootstrap_backoff() -> String {
    "5s".to_string()
}
fn default_count() -> u32 {
    1
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            max_parallel: default_max_parallel(),
            worker_timeout: default_worker_timeout(),
            heartbeat_stale_after: default_heartbeat_stale_after(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_ssh_port(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            remote_root: default_remote_root(),
            local_hosts: default_local_hosts(),
            ssh_options: Vec::new(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxMode::default(),
            start_attempts: default_start_attempts(),
            start_backoff: default_start_backoff(),
            bootstrap_attempts: default_bootstrap_attempts(),
            bootstrap_backoff: default_bootstrap_backoff(),
        }
    }
}

impl DomainConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a config document.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: DomainConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.domain.name.is_empty() || self.domain.name.contains('/') {
            return Err(ConfigError::UnsupportedConfig(format!(
                "invalid domain name {:?}",
                self.domain.name
            )));
        }
        if self.daemon.max_parallel == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "daemon.max_parallel must be at least 1".to_string(),
            ));
        }
        for (key, duration) in [
            ("daemon.reconcile_interval", &self.daemon.reconcile_interval),
            ("daemon.heartbeat_interval", &self.daemon.heartbeat_interval),
            ("daemon.worker_timeout", &self.daemon.worker_timeout),
            ("daemon.heartbeat_stale_after", &self.daemon.heartbeat_stale_after),
            ("transport.connect_timeout", &self.transport.connect_timeout),
            ("transport.command_timeout", &self.transport.command_timeout),
        ] {
            if parse_duration(duration)?.is_zero() {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        // Backoffs may be zero.
        parse_duration(&self.lifecycle.start_backoff)?;
        parse_duration(&self.lifecycle.bootstrap_backoff)?;
        for (name, role) in &self.roles {
            role.validate(name)?;
        }
        Ok(())
    }

    pub fn role(&self, name: &str) -> ConfigResult<&RoleConfig> {
        self.roles
            .get(name)
            .ok_or_else(|| ConfigError::UnsupportedConfig(format!("unknown role {name:?}")))
    }

    /// Resolve `all` or a single role name into role names.
    pub fn select_roles(&self, selector: &str) -> ConfigResult<Vec<String>> {
        if selector == "all" {
            return Ok(self.roles.keys().cloned().collect());
        }
        self.role(selector)?;
        Ok(vec![selector.to_string()])
    }
}

impl DaemonConfig {
    pub fn reconcile_interval(&self) -> Duration {
        parse_duration(&self.reconcile_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn worker_timeout(&self) -> Duration {
        parse_duration(&self.worker_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        parse_duration(&self.heartbeat_stale_after).unwrap_or(Duration::from_secs(60))
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(120))
    }
}

impl LifecycleConfig {
    pub fn start_backoff(&self) -> Duration {
        parse_duration(&self.start_backoff).unwrap_or(Duration::from_secs(2))
    }

    pub fn bootstrap_backoff(&self) -> Duration {
        parse_duration(&self.bootstrap_backoff).unwrap_or(Duration::from_secs(5))
    }
}

impl RoleConfig {
    fn validate(&self, name: &str) -> ConfigResult<()> {
        let unsupported = |msg: String| ConfigError::UnsupportedConfig(format!("role {name}: {msg}"));
        if name.is_empty() || name == "all" || name.contains('/') {
            return Err(unsupported("reserved or malformed role name".to_string()));
        }
        if self.hosts.is_empty() {
            return Err(unsupported("no hosts assigned".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(unsupported("empty command".to_string()));
        }
        if self.replica_count == 0 {
            return Err(unsupported("replica_count must be at least 1".to_string()));
        }
        if self.partition_count == 0 || self.partition_count > crate::KEY_RANGE_MAX + 1 {
            return Err(unsupported(format!(
                "partition_count {} out of range",
                self.partition_count
            )));
        }
        Ok(())
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::UnsupportedConfig(format!("invalid duration {s:?}"));
    let (digits, millis_per_unit) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        return Err(invalid());
    };
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
