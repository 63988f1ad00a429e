//! One reconcile step for one worker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use fleet_core::{Target, TargetKind, UserCommand, WorkerIdentity};
use fleet_lifecycle::{WorkerLifecycle, Workload};
use fleet_state::StateStore;

use crate::error::ReconcileResult;
use crate::phase::Phase;

/// What a step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do: no DESIRED, or already converged.
    Idle(Phase),
    /// The process runs as desired and APPLIED was committed.
    Applied {
        command: UserCommand,
        pid: u32,
        distributed: bool,
    },
    /// The process was stopped and APPLIED records the stop.
    Stopped { distributed: bool },
    /// The worker was torn down and its documents deleted.
    Removed,
}

impl StepOutcome {
    /// Whether the step changed anything.
    pub fn is_change(&self) -> bool {
        !matches!(self, StepOutcome::Idle(_))
    }
}

/// Compares DESIRED against APPLIED and acts on the difference.
pub struct ReconcileEngine {
    store: StateStore,
    lifecycle: Arc<dyn WorkerLifecycle>,
    /// Workers whose committed APPLIED has not reached their host yet.
    undistributed: Mutex<HashSet<WorkerIdentity>>,
}

impl ReconcileEngine {
    pub fn new(store: StateStore, lifecycle: Arc<dyn WorkerLifecycle>) -> Self {
        Self {
            store,
            lifecycle,
            undistributed: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Current phase of a worker.
    pub fn phase(&self, identity: &WorkerIdentity) -> ReconcileResult<Phase> {
        let desired = self.store.read(identity, TargetKind::Desired)?;
        let applied = self.store.read(identity, TargetKind::Applied)?;
        Ok(Phase::derive(desired.as_ref(), applied.as_ref()))
    }

    /// Whether a committed APPLIED is still waiting to reach its host.
    pub fn is_undistributed(&self, identity: &WorkerIdentity) -> bool {
        self.pending().contains(identity)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<WorkerIdentity>> {
        self.undistributed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one step for one worker.
    ///
    /// Documents are only written after the lifecycle confirmed the
    /// change; any error leaves them exactly as they were.
    pub async fn step(&self, identity: &WorkerIdentity) -> ReconcileResult<StepOutcome> {
        let desired = self.store.read(identity, TargetKind::Desired)?;
        let applied = self.store.read(identity, TargetKind::Applied)?;
        let phase = Phase::derive(desired.as_ref(), applied.as_ref());

        match (phase, desired) {
            (Phase::PendingRemove, Some(desired)) => self.remove(&desired, applied.as_ref()).await,
            (Phase::PendingApply, Some(desired)) => match desired.user_cmd {
                UserCommand::Stop => self.stop(&desired, applied.as_ref()).await,
                command => self.apply(&desired, applied.as_ref(), command).await,
            },
            (Phase::Converged, _) => {
                if let Some(applied) = applied {
                    self.redistribute(&applied).await;
                }
                Ok(StepOutcome::Idle(Phase::Converged))
            }
            (phase, _) => {
                debug!(worker = %identity, %phase, "nothing to reconcile");
                Ok(StepOutcome::Idle(phase))
            }
        }
    }

    async fn apply(
        &self,
        desired: &Target,
        applied: Option<&Target>,
        command: UserCommand,
    ) -> ReconcileResult<StepOutcome> {
        let identity = desired.identity();
        let workload = Workload::from_target(desired)?;

        // A worker moved to another host leaves its old sandbox behind.
        if let Some(previous) = applied.filter(|a| a.plan.placement.host != workload.host()) {
            let old = Workload::from_target(previous)?;
            info!(worker = %identity, from = old.host(), to = workload.host(), "worker moved; tearing down old placement");
            self.lifecycle.stop_process(&old).await?;
            self.lifecycle.remove_container(&old).await?;
        }

        if self.lifecycle.bootstrap_host(&workload).await? {
            info!(worker = %identity, host = workload.host(), "host bootstrapped");
        }
        self.lifecycle.ensure_container(&workload).await?;
        let pid = self.lifecycle.start_process(&workload).await?;

        let committed = self.store.write(&desired.as_kind(TargetKind::Applied))?;
        let distributed = self.distribute(&committed).await;
        info!(worker = %identity, %command, pid, host = workload.host(), "applied");
        Ok(StepOutcome::Applied {
            command,
            pid,
            distributed,
        })
    }

    async fn stop(&self, desired: &Target, applied: Option<&Target>) -> ReconcileResult<StepOutcome> {
        let identity = desired.identity();
        // The process lives wherever it was last applied.
        let workload = Workload::from_target(applied.unwrap_or(desired))?;
        self.lifecycle.stop_process(&workload).await?;

        let committed = self.store.write(&desired.as_kind(TargetKind::Applied))?;
        let distributed = self.distribute(&committed).await;
        info!(worker = %identity, host = workload.host(), "stopped");
        Ok(StepOutcome::Stopped { distributed })
    }

    async fn remove(&self, desired: &Target, applied: Option<&Target>) -> ReconcileResult<StepOutcome> {
        let identity = desired.identity();
        match Workload::from_target(applied.unwrap_or(desired)) {
            Ok(workload) => {
                self.lifecycle.stop_process(&workload).await?;
                self.lifecycle.remove_container(&workload).await?;
            }
            // Never applied and not placeable: there is nothing on any host.
            Err(e) if applied.is_none() => {
                warn!(worker = %identity, error = %e, "removing worker without teardown");
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete_worker(&identity)?;
        self.pending().remove(&identity);
        info!(worker = %identity, "removed");
        Ok(StepOutcome::Removed)
    }

    /// Push a committed APPLIED to its host. Failure is remembered, not raised.
    ///
    /// The worker stays marked until the push succeeds, so a step cancelled
    /// mid-push is retried as well.
    async fn distribute(&self, committed: &Target) -> bool {
        let identity = committed.identity();
        self.pending().insert(identity.clone());
        match self.store.push_applied_to_host(committed).await {
            Ok(()) => {
                self.pending().remove(&identity);
                true
            }
            Err(e) => {
                warn!(worker = %identity, error = %e, "applied target not distributed; will retry");
                false
            }
        }
    }

    async fn redistribute(&self, applied: &Target) {
        let identity = applied.identity();
        if self.is_undistributed(&identity) && self.distribute(applied).await {
            info!(worker = %identity, "applied target distributed on retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fleet_core::{expand_role, HostInit, RoleConfig};
    use fleet_lifecycle::testing::{Op, RecordingLifecycle};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use fleet_state::RedbBackend;
    use fleet_transport::fake::FakeExecutor;
    use fleet_transport::{RemoteExecutor, TransportFuture, TransportResult};

    use super::*;

    struct Fixture {
        engine: ReconcileEngine,
        lifecycle: Arc<RecordingLifecycle>,
        fake: Arc<FakeExecutor>,
        _scratch: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let store = StateStore::new(
            Arc::new(RedbBackend::open_in_memory().unwrap()),
            fake.clone(),
            "/home/admin/fleet",
            scratch.path(),
        );
        let lifecycle = Arc::new(RecordingLifecycle::new());
        Fixture {
            engine: ReconcileEngine::new(store, lifecycle.clone()),
            lifecycle,
            fake,
            _scratch: scratch,
        }
    }

    fn role(hosts: &[&str]) -> RoleConfig {
        RoleConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            partition_count: 2,
            replica_count: 1,
            image: Some("registry/searcher:1".to_string()),
            cpus: None,
            memory_mb: None,
            mounts: Vec::new(),
            command: "/opt/bin/searcher".to_string(),
            args: vec!["--range".to_string(), "{from}-{to}".to_string()],
            env: BTreeMap::new(),
            work_dir: None,
            data: BTreeMap::from([("main".to_string(), "/data/v1".to_string())]),
            biz: BTreeMap::new(),
            host_init: HostInit {
                mounts: vec!["/data".to_string()],
                ..Default::default()
            },
        }
    }

    fn submit(f: &Fixture, hosts: &[&str], command: UserCommand) -> Vec<WorkerIdentity> {
        expand_role("d1", "searcher", &role(hosts), command)
            .unwrap()
            .into_iter()
            .map(|t| {
                f.engine.store().write(&t).unwrap();
                t.identity()
            })
            .collect()
    }

    fn read(f: &Fixture, id: &WorkerIdentity, kind: TargetKind) -> Option<Target> {
        f.engine.store().read(id, kind).unwrap()
    }

    #[tokio::test]
    async fn start_converges_in_one_step() {
        let f = fixture();
        let ids = submit(&f, &["h1"], UserCommand::Start);
        let id = &ids[0];

        let outcome = f.engine.step(id).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Applied {
                command: UserCommand::Start,
                distributed: true,
                ..
            }
        ));

        let desired = read(&f, id, TargetKind::Desired).unwrap();
        let applied = read(&f, id, TargetKind::Applied).unwrap();
        assert!(applied.mirrors(&desired));
        assert_eq!(applied.kind, TargetKind::Applied);
        assert_eq!(f.engine.phase(id).unwrap(), Phase::Converged);
        assert!(f.lifecycle.is_running(&id.worker));

        let order: Vec<Op> = f
            .lifecycle
            .calls()
            .into_iter()
            .filter(|(_, w)| *w == id.worker)
            .map(|(op, _)| op)
            .collect();
        assert_eq!(order, vec![Op::Bootstrap, Op::EnsureContainer, Op::StartProcess]);

        let remote = f.engine.store().remote_path(id, TargetKind::Applied);
        assert!(f.fake.file("h1", &remote).is_some());
    }

    #[tokio::test]
    async fn repeated_steps_are_idempotent() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();
        let applied = read(&f, &id, TargetKind::Applied).unwrap();

        for _ in 0..3 {
            assert_eq!(
                f.engine.step(&id).await.unwrap(),
                StepOutcome::Idle(Phase::Converged)
            );
        }
        // Re-submitting the same command overwrites DESIRED only.
        submit(&f, &["h1"], UserCommand::Start);
        assert_eq!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Idle(Phase::Converged)
        );

        assert_eq!(f.lifecycle.launches(&id.worker), 1);
        assert_eq!(f.lifecycle.count(Op::EnsureContainer, &id.worker), 1);
        assert_eq!(read(&f, &id, TargetKind::Applied), Some(applied));
    }

    #[tokio::test]
    async fn lifecycle_failure_leaves_documents_unchanged() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.lifecycle.fail(&id.worker, Op::StartProcess);

        let before = read(&f, &id, TargetKind::Desired);
        assert!(f.engine.step(&id).await.is_err());
        assert_eq!(read(&f, &id, TargetKind::Desired), before);
        assert!(read(&f, &id, TargetKind::Applied).is_none());

        // Retried from scratch on the next step.
        f.lifecycle.clear_failures();
        assert!(f.engine.step(&id).await.unwrap().is_change());
        assert_eq!(f.engine.phase(&id).unwrap(), Phase::Converged);
    }

    #[tokio::test]
    async fn stop_keeps_worker_known() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();

        submit(&f, &["h1"], UserCommand::Stop);
        assert_eq!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Stopped { distributed: true }
        );
        let applied = read(&f, &id, TargetKind::Applied).unwrap();
        assert_eq!(applied.user_cmd, UserCommand::Stop);
        assert!(!f.lifecycle.is_running(&id.worker));
        assert_eq!(f.engine.phase(&id).unwrap(), Phase::Converged);
    }

    #[tokio::test]
    async fn remove_deletes_all_documents() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();
        f.engine
            .store()
            .write(&read(&f, &id, TargetKind::Applied).unwrap().as_kind(TargetKind::Heartbeat))
            .unwrap();

        submit(&f, &["h1"], UserCommand::Remove);
        assert_eq!(f.engine.step(&id).await.unwrap(), StepOutcome::Removed);
        for kind in TargetKind::ALL {
            assert!(read(&f, &id, kind).is_none(), "{kind} survived removal");
        }
        assert!(!f.lifecycle.has_container(&id.worker));
        assert_eq!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Idle(Phase::Absent)
        );
    }

    #[tokio::test]
    async fn remove_without_applied_still_tears_down() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Remove).remove(0);
        assert_eq!(f.engine.step(&id).await.unwrap(), StepOutcome::Removed);
        assert_eq!(f.lifecycle.count(Op::StopProcess, &id.worker), 1);
        assert_eq!(f.lifecycle.count(Op::RemoveContainer, &id.worker), 1);
        assert!(read(&f, &id, TargetKind::Desired).is_none());
    }

    #[tokio::test]
    async fn failed_removal_keeps_documents() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();
        submit(&f, &["h1"], UserCommand::Remove);
        f.lifecycle.set_unreachable("h1", true);

        assert!(f.engine.step(&id).await.is_err());
        assert!(read(&f, &id, TargetKind::Applied).is_some());
        assert_eq!(f.engine.phase(&id).unwrap(), Phase::PendingRemove);
    }

    #[tokio::test]
    async fn data_update_reapplies() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();

        let mut upf = read(&f, &id, TargetKind::Desired)
            .unwrap()
            .with_command(UserCommand::Upf);
        upf.plan.data.insert("main".to_string(), "/data/v2".to_string());
        f.engine.store().write(&upf).unwrap();

        assert_eq!(f.engine.phase(&id).unwrap(), Phase::PendingApply);
        assert!(matches!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Applied {
                command: UserCommand::Upf,
                ..
            }
        ));
        let applied = read(&f, &id, TargetKind::Applied).unwrap();
        assert_eq!(applied.plan.data["main"], "/data/v2");
    }

    #[tokio::test]
    async fn move_tears_down_old_host() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.engine.step(&id).await.unwrap();

        submit(&f, &["h2"], UserCommand::Start);
        f.engine.step(&id).await.unwrap();
        assert_eq!(f.lifecycle.count(Op::RemoveContainer, &id.worker), 1);
        let applied = read(&f, &id, TargetKind::Applied).unwrap();
        assert_eq!(applied.plan.placement.host, "h2");
    }

    #[tokio::test]
    async fn failed_distribution_is_retried_once_converged() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        f.fake.set_corrupt_uploads("h1", true);

        assert!(matches!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Applied {
                distributed: false,
                ..
            }
        ));
        // APPLIED stands even though the host has a bad copy.
        assert_eq!(f.engine.phase(&id).unwrap(), Phase::Converged);
        assert!(f.engine.is_undistributed(&id));

        f.fake.set_corrupt_uploads("h1", false);
        assert_eq!(
            f.engine.step(&id).await.unwrap(),
            StepOutcome::Idle(Phase::Converged)
        );
        assert!(!f.engine.is_undistributed(&id));
        assert_eq!(f.lifecycle.launches(&id.worker), 1);
    }

    /// Uploads never finish while `stalled` is set.
    struct StalledUploads {
        inner: Arc<FakeExecutor>,
        stalled: AtomicBool,
    }

    impl RemoteExecutor for StalledUploads {
        fn run<'a>(&'a self, host: &'a str, command: &'a str) -> TransportFuture<'a, String> {
            self.inner.run(host, command)
        }

        fn copy_to<'a>(
            &'a self,
            host: &'a str,
            local: &'a Path,
            remote_path: &'a str,
        ) -> TransportFuture<'a, ()> {
            if self.stalled.load(Ordering::SeqCst) {
                return Box::pin(std::future::pending::<TransportResult<()>>());
            }
            self.inner.copy_to(host, local, remote_path)
        }

        fn copy_from<'a>(
            &'a self,
            host: &'a str,
            remote_path: &'a str,
            local: &'a Path,
        ) -> TransportFuture<'a, ()> {
            self.inner.copy_from(host, remote_path, local)
        }
    }

    #[tokio::test]
    async fn push_cut_short_by_a_timeout_is_retried() {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let uploads = Arc::new(StalledUploads {
            inner: fake.clone(),
            stalled: AtomicBool::new(true),
        });
        let store = StateStore::new(
            Arc::new(RedbBackend::open_in_memory().unwrap()),
            uploads.clone(),
            "/home/admin/fleet",
            scratch.path(),
        );
        let engine = ReconcileEngine::new(store, Arc::new(RecordingLifecycle::new()));
        let desired = expand_role("d1", "searcher", &role(&["h1"]), UserCommand::Start)
            .unwrap()
            .remove(0);
        engine.store().write(&desired).unwrap();
        let id = desired.identity();

        let cut = tokio::time::timeout(Duration::from_millis(50), engine.step(&id)).await;
        assert!(cut.is_err(), "the upload never finishes");
        assert_eq!(engine.phase(&id).unwrap(), Phase::Converged);
        assert!(engine.is_undistributed(&id));

        uploads.stalled.store(false, Ordering::SeqCst);
        assert_eq!(
            engine.step(&id).await.unwrap(),
            StepOutcome::Idle(Phase::Converged)
        );
        assert!(!engine.is_undistributed(&id));
        let remote = engine.store().remote_path(&id, TargetKind::Applied);
        assert!(fake.file("h1", &remote).is_some());
    }

    #[tokio::test]
    async fn invalid_plan_is_unsupported_config() {
        let f = fixture();
        let id = submit(&f, &["h1"], UserCommand::Start).remove(0);
        let mut desired = read(&f, &id, TargetKind::Desired).unwrap();
        desired.plan.launch.command.clear();
        f.engine.store().write(&desired).unwrap();

        assert!(matches!(
            f.engine.step(&id).await,
            Err(crate::ReconcileError::UnsupportedConfig(_))
        ));
        assert!(f.lifecycle.calls().is_empty());
    }
}
