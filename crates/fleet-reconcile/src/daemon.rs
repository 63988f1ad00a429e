//! The domain daemon: a reconcile loop and a heartbeat loop.
//!
//! Each tick enumerates the domain's workers and runs one task per worker
//! on a [`JoinSet`], at most `max_parallel` at a time, each bounded by
//! `worker_timeout`. The tick completes only when every task has joined.
//! Per-worker failures are logged and counted; they never end a loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_core::{DaemonConfig, TargetKind, WorkerIdentity};

use crate::engine::ReconcileEngine;

/// Floor for loop periods; a zero interval would spin.
const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSettings {
    pub reconcile_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_parallel: usize,
    pub worker_timeout: Duration,
}

impl DaemonSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            max_parallel: config.max_parallel.max(1),
            worker_timeout: config.worker_timeout(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Per-tick tally.
///
/// For the reconcile loop `changed` counts workers that were acted on; for
/// the heartbeat loop it counts heartbeats collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub workers: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl TickReport {
    /// No worker failed or timed out.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Reconcile,
    Heartbeat,
}

impl Tick {
    fn as_str(&self) -> &'static str {
        match self {
            Tick::Reconcile => "reconcile",
            Tick::Heartbeat => "heartbeat",
        }
    }
}

/// Drives one domain.
pub struct DomainDaemon {
    domain: String,
    engine: Arc<ReconcileEngine>,
    settings: DaemonSettings,
}

impl DomainDaemon {
    pub fn new(domain: &str, engine: Arc<ReconcileEngine>, settings: DaemonSettings) -> Self {
        Self {
            domain: domain.to_string(),
            engine,
            settings,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    fn identities(&self, tick: Tick) -> Vec<WorkerIdentity> {
        match self.engine.store().list_identities(&self.domain) {
            Ok(ids) => ids,
            Err(e) => {
                error!(tick = tick.as_str(), domain = %self.domain, error = %e, "failed to enumerate workers");
                Vec::new()
            }
        }
    }

    /// Run one reconcile step for every worker of the domain.
    pub async fn reconcile_tick(&self) -> TickReport {
        let identities = self.identities(Tick::Reconcile);
        let engine = Arc::clone(&self.engine);
        let report = self
            .fan_out(Tick::Reconcile, identities, move |identity| {
                let engine = Arc::clone(&engine);
                async move {
                    engine
                        .step(&identity)
                        .await
                        .map(|outcome| outcome.is_change())
                        .map_err(|e| e.to_string())
                }
            })
            .await;
        self.log_report(Tick::Reconcile, &report);
        report
    }

    /// Pull the heartbeat of every worker that has been applied.
    pub async fn heartbeat_tick(&self) -> TickReport {
        let store = self.engine.store().clone();
        let identities: Vec<WorkerIdentity> = self
            .identities(Tick::Heartbeat)
            .into_iter()
            .filter(|id| matches!(store.read(id, TargetKind::Applied), Ok(Some(_))))
            .collect();
        let report = self
            .fan_out(Tick::Heartbeat, identities, move |identity| {
                let store = store.clone();
                async move {
                    store
                        .pull_heartbeat_from_host(&identity)
                        .await
                        .map(|heartbeat| heartbeat.is_some())
                        .map_err(|e| e.to_string())
                }
            })
            .await;
        self.log_report(Tick::Heartbeat, &report);
        report
    }

    async fn fan_out<F, Fut>(&self, tick: Tick, identities: Vec<WorkerIdentity>, work: F) -> TickReport
    where
        F: Fn(WorkerIdentity) -> Fut,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        let mut report = TickReport {
            workers: identities.len(),
            ..TickReport::default()
        };
        let budget = self.settings.worker_timeout;
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for identity in identities {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let task = work(identity.clone());
            tasks.spawn(async move {
                let _permit = permit;
                (identity, tokio::time::timeout(budget, task).await)
            });
        }

        let tick = tick.as_str();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(true)))) => report.changed += 1,
                Ok((_, Ok(Ok(false)))) => report.unchanged += 1,
                Ok((identity, Ok(Err(error)))) => {
                    warn!(tick, worker = %identity, %error, "worker failed this tick");
                    report.failed += 1;
                }
                Ok((identity, Err(_))) => {
                    warn!(tick, worker = %identity, timeout = ?budget, "worker timed out this tick");
                    report.timed_out += 1;
                }
                Err(e) => {
                    error!(tick, error = %e, "worker task aborted");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn log_report(&self, tick: Tick, report: &TickReport) {
        if report.workers == 0 {
            debug!(tick = tick.as_str(), domain = %self.domain, "no workers");
            return;
        }
        info!(
            tick = tick.as_str(),
            domain = %self.domain,
            workers = report.workers,
            changed = report.changed,
            unchanged = report.unchanged,
            failed = report.failed,
            timed_out = report.timed_out,
            "tick complete"
        );
    }

    /// Run both loops until `shutdown` flips. A tick in progress finishes
    /// before its loop exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            domain = %self.domain,
            reconcile_interval = ?self.settings.reconcile_interval,
            heartbeat_interval = ?self.settings.heartbeat_interval,
            max_parallel = self.settings.max_parallel,
            "domain daemon started"
        );
        let reconcile = tokio::spawn(Arc::clone(&self).run_loop(Tick::Reconcile, shutdown.clone()));
        let heartbeat = tokio::spawn(Arc::clone(&self).run_loop(Tick::Heartbeat, shutdown));
        let _ = reconcile.await;
        let _ = heartbeat.await;
        info!(domain = %self.domain, "domain daemon stopped");
    }

    async fn run_loop(self: Arc<Self>, tick: Tick, mut shutdown: watch::Receiver<bool>) {
        let period = match tick {
            Tick::Reconcile => self.settings.reconcile_interval,
            Tick::Heartbeat => self.settings.heartbeat_interval,
        };
        let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    match tick {
                        Tick::Reconcile => self.reconcile_tick().await,
                        Tick::Heartbeat => self.heartbeat_tick().await,
                    };
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(tick = tick.as_str(), "loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleet_core::{expand_role, HostInit, RoleConfig, Target, UserCommand};
    use fleet_lifecycle::testing::RecordingLifecycle;
    use fleet_lifecycle::{LifecycleFuture, WorkerLifecycle, Workload};
    use fleet_state::{RedbBackend, StateStore};
    use fleet_transport::fake::FakeExecutor;

    use super::*;

    fn role(hosts: &[&str], partitions: u32, replicas: u32) -> RoleConfig {
        RoleConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            partition_count: partitions,
            replica_count: replicas,
            image: Some("registry/searcher:1".to_string()),
            cpus: None,
            memory_mb: None,
            mounts: Vec::new(),
            command: "/opt/bin/searcher".to_string(),
            args: vec!["--range".to_string(), "{from}-{to}".to_string()],
            env: BTreeMap::new(),
            work_dir: None,
            data: BTreeMap::new(),
            biz: BTreeMap::new(),
            host_init: HostInit::default(),
        }
    }

    struct Harness {
        daemon: Arc<DomainDaemon>,
        fake: Arc<FakeExecutor>,
        _scratch: tempfile::TempDir,
    }

    fn harness(lifecycle: Arc<dyn WorkerLifecycle>, settings: DaemonSettings) -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let store = StateStore::new(
            Arc::new(RedbBackend::open_in_memory().unwrap()),
            fake.clone(),
            "/home/admin/fleet",
            scratch.path(),
        );
        let engine = Arc::new(ReconcileEngine::new(store, lifecycle));
        Harness {
            daemon: Arc::new(DomainDaemon::new("d1", engine, settings)),
            fake,
            _scratch: scratch,
        }
    }

    fn fast() -> DaemonSettings {
        DaemonSettings {
            reconcile_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(10),
            max_parallel: 4,
            worker_timeout: Duration::from_secs(5),
        }
    }

    fn submit(h: &Harness, role_cfg: &RoleConfig) -> Vec<Target> {
        let targets = expand_role("d1", "searcher", role_cfg, UserCommand::Start).unwrap();
        for t in &targets {
            h.daemon.engine().store().write(t).unwrap();
        }
        targets
    }

    fn store(h: &Harness) -> &StateStore {
        h.daemon.engine().store()
    }

    #[tokio::test]
    async fn reconcile_tick_converges_every_worker() {
        let h = harness(Arc::new(RecordingLifecycle::new()), fast());
        let targets = submit(&h, &role(&["h1", "h2"], 4, 2));

        let first = h.daemon.reconcile_tick().await;
        assert_eq!(
            first,
            TickReport {
                workers: 8,
                changed: 8,
                ..TickReport::default()
            }
        );
        for t in &targets {
            let applied = store(&h).read(&t.identity(), TargetKind::Applied).unwrap().unwrap();
            assert!(applied.mirrors(t));
        }

        let second = h.daemon.reconcile_tick().await;
        assert_eq!(second.unchanged, 8);
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn unreachable_host_does_not_block_others() {
        let lifecycle = Arc::new(RecordingLifecycle::new());
        lifecycle.set_unreachable("h1", true);
        let h = harness(lifecycle.clone(), fast());
        let targets = submit(&h, &role(&["h1", "h2"], 2, 2));

        let report = h.daemon.reconcile_tick().await;
        assert_eq!(report.workers, 4);
        assert_eq!(report.failed, 2);
        assert_eq!(report.changed, 2);
        for t in &targets {
            let applied = store(&h).read(&t.identity(), TargetKind::Applied).unwrap();
            assert_eq!(applied.is_some(), t.plan.placement.host == "h2");
        }

        lifecycle.set_unreachable("h1", false);
        let report = h.daemon.reconcile_tick().await;
        assert_eq!((report.changed, report.unchanged), (2, 2));
    }

    #[tokio::test]
    async fn heartbeat_tick_keeps_stale_heartbeat_on_failure() {
        let h = harness(Arc::new(RecordingLifecycle::new()), fast());
        let targets = submit(&h, &role(&["h1", "h2"], 2, 1));

        // Nothing applied yet: nothing to pull.
        assert_eq!(h.daemon.heartbeat_tick().await.workers, 0);

        h.daemon.reconcile_tick().await;
        for t in &targets {
            let id = t.identity();
            let hb = t.as_kind(TargetKind::Heartbeat);
            h.fake.put_file(
                &t.plan.placement.host,
                &store(&h).remote_path(&id, TargetKind::Heartbeat),
                &hb.to_json().unwrap(),
            );
        }
        let report = h.daemon.heartbeat_tick().await;
        assert_eq!((report.workers, report.changed), (2, 2));

        let on_h1 = targets
            .iter()
            .find(|t| t.plan.placement.host == "h1")
            .unwrap()
            .identity();
        let before = store(&h).read(&on_h1, TargetKind::Heartbeat).unwrap();
        assert!(before.is_some());

        h.fake.set_unreachable("h1", true);
        let report = h.daemon.heartbeat_tick().await;
        assert_eq!((report.changed, report.unchanged), (1, 1));
        assert_eq!(store(&h).read(&on_h1, TargetKind::Heartbeat).unwrap(), before);
    }

    /// A lifecycle whose every operation takes `delay`, tracking concurrency.
    struct Slow {
        delay: Duration,
        inflight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Slow {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                inflight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn op<'a, T: Send + 'a>(&'a self, value: T) -> LifecycleFuture<'a, T> {
            Box::pin(async move {
                let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                Ok(value)
            })
        }
    }

    impl WorkerLifecycle for Slow {
        fn bootstrap_host<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, bool> {
            self.op(false)
        }
        fn ensure_container<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, ()> {
            self.op(())
        }
        fn start_process<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, u32> {
            self.op(1)
        }
        fn stop_process<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, ()> {
            self.op(())
        }
        fn remove_container<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, ()> {
            self.op(())
        }
        fn inspect<'a>(&'a self, _: &'a Workload) -> LifecycleFuture<'a, Option<u32>> {
            self.op(None)
        }
    }

    #[tokio::test]
    async fn fan_out_respects_max_parallel() {
        let slow = Arc::new(Slow::new(Duration::from_millis(20)));
        let settings = DaemonSettings {
            max_parallel: 2,
            ..fast()
        };
        let h = harness(slow.clone(), settings);
        submit(&h, &role(&["h1"], 6, 1));

        let report = h.daemon.reconcile_tick().await;
        assert_eq!(report.changed, 6);
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stuck_worker_times_out_without_stalling_the_tick() {
        let settings = DaemonSettings {
            worker_timeout: Duration::from_millis(50),
            ..fast()
        };
        let h = harness(Arc::new(Slow::new(Duration::from_secs(60))), settings);
        let targets = submit(&h, &role(&["h1"], 2, 1));

        let report = tokio::time::timeout(Duration::from_secs(5), h.daemon.reconcile_tick())
            .await
            .expect("tick must finish once workers time out");
        assert_eq!(report.timed_out, 2);
        for t in &targets {
            assert!(store(&h).read(&t.identity(), TargetKind::Applied).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn run_converges_and_stops_on_shutdown() {
        let h = harness(Arc::new(RecordingLifecycle::new()), fast());
        let targets = submit(&h, &role(&["h1"], 2, 1));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&h.daemon).run(rx));

        let converged = async {
            loop {
                let done = targets.iter().all(|t| {
                    matches!(store(&h).read(&t.identity(), TargetKind::Applied), Ok(Some(_)))
                });
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), converged)
            .await
            .expect("workers converge");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon stops")
            .unwrap();
    }
}
