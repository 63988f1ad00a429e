//! Status report: what each worker is doing, read back from the store.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use fleet_core::{ConfigError, Target, TargetKind, UserCommand, WorkerIdentity};
use fleet_reconcile::Phase;
use fleet_state::StateStore;

use crate::error::PlanResult;

/// How much `gs` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    #[default]
    Summary,
    Detail,
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Level::Summary),
            "detail" => Ok(Level::Detail),
            other => Err(ConfigError::UnsupportedConfig(format!(
                "unknown status level {other:?}"
            ))),
        }
    }
}

/// One row of the summary report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub role: String,
    pub worker: String,
    pub host: Option<String>,
    pub desired_cmd: Option<UserCommand>,
    pub applied_cmd: Option<UserCommand>,
    pub phase: &'static str,
    /// Milliseconds since the heartbeat was collected.
    pub heartbeat_age_ms: Option<u64>,
    /// No heartbeat, or one older than the staleness threshold.
    pub stale: bool,
    pub data: BTreeMap<String, String>,
    pub generation: Option<serde_json::Value>,
}

/// Everything known about one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDetail {
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub desired_digest: Option<String>,
    pub applied_digest: Option<String>,
    pub converged: bool,
    pub desired: Option<Target>,
    pub applied: Option<Target>,
    pub heartbeat: Option<Target>,
}

/// Read the three documents of a worker and summarise them.
///
/// Returns `None` when the worker has no documents at all.
pub fn inspect(
    store: &StateStore,
    identity: &WorkerIdentity,
    stale_after: Duration,
    now_ms: u64,
) -> PlanResult<Option<WorkerDetail>> {
    let desired = store.read(identity, TargetKind::Desired)?;
    let applied = store.read(identity, TargetKind::Applied)?;
    let heartbeat = store.read(identity, TargetKind::Heartbeat)?;
    if desired.is_none() && applied.is_none() && heartbeat.is_none() {
        return Ok(None);
    }

    let phase = Phase::derive(desired.as_ref(), applied.as_ref());
    let current = applied.as_ref().or(desired.as_ref());
    let heartbeat_age_ms = heartbeat
        .as_ref()
        .map(|hb| now_ms.saturating_sub(hb.timestamp));
    let stale = heartbeat_age_ms.is_none_or(|age| age > stale_after.as_millis() as u64);

    let status = WorkerStatus {
        role: identity.role.clone(),
        worker: identity.worker.clone(),
        host: current.map(|t| t.plan.placement.host.clone()),
        desired_cmd: desired.as_ref().map(|t| t.user_cmd),
        applied_cmd: applied.as_ref().map(|t| t.user_cmd),
        phase: phase.as_str(),
        heartbeat_age_ms,
        stale,
        data: current.map(|t| t.plan.data.clone()).unwrap_or_default(),
        generation: current.and_then(|t| t.plan.biz.get("generation").cloned()),
    };

    Ok(Some(WorkerDetail {
        status,
        desired_digest: desired.as_ref().map(|t| t.plan.digest()),
        applied_digest: applied.as_ref().map(|t| t.plan.digest()),
        converged: phase == Phase::Converged,
        desired,
        applied,
        heartbeat,
    }))
}

fn format_age(age_ms: Option<u64>) -> String {
    match age_ms {
        None => "-".to_string(),
        Some(ms) if ms < 1_000 => format!("{ms}ms"),
        Some(ms) if ms < 120_000 => format!("{}s", ms / 1_000),
        Some(ms) if ms < 7_200_000 => format!("{}m", ms / 60_000),
        Some(ms) => format!("{}h", ms / 3_600_000),
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn push_line<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>, widths: &[usize]) {
    let mut text = String::new();
    for (field, &width) in fields.zip(widths) {
        let _ = write!(text, "{field:<width$}  ");
    }
    out.push_str(text.trim_end());
    out.push('\n');
}

/// Plain-text table, one line per worker.
pub fn render_summary(rows: &[WorkerStatus]) -> String {
    let header = [
        "ROLE", "WORKER", "HOST", "DESIRED", "APPLIED", "PHASE", "HEARTBEAT", "STALE", "GEN", "DATA",
    ];
    let cells: Vec<[String; 10]> = rows
        .iter()
        .map(|row| {
            [
                row.role.clone(),
                row.worker.clone(),
                or_dash(row.host.as_deref()),
                or_dash(row.desired_cmd),
                or_dash(row.applied_cmd),
                row.phase.to_string(),
                format_age(row.heartbeat_age_ms),
                if row.stale { "yes" } else { "no" }.to_string(),
                or_dash(row.generation.as_ref()),
                row.data
                    .iter()
                    .map(|(name, path)| format!("{name}={path}"))
                    .collect::<Vec<_>>()
                    .join(","),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_line(&mut out, header.iter().copied(), &widths);
    for row in &cells {
        push_line(&mut out, row.iter().map(String::as_str), &widths);
    }
    let _ = writeln!(
        out,
        "{} workers, {} stale",
        rows.len(),
        rows.iter().filter(|r| r.stale).count()
    );
    out
}
