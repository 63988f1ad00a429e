//! The per-worker document store.
//!
//! [`StateStore`] wraps a [`DocumentBackend`] with the target encoding and
//! the write rules shared by every caller, and carries the transport used
//! to move documents between the admin host and worker hosts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fleet_core::{epoch_millis, DomainConfig, StoreBackend, Target, TargetKind, WorkerIdentity};
use fleet_transport::{shell, RemoteExecutor, TransportError};

use crate::backend::{DocumentBackend, DocumentKey};
use crate::error::{StateError, StateResult};
use crate::fs_backend::FsBackend;
use crate::redb_backend::RedbBackend;

/// Documents, plus the means to ship them to and from hosts.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn DocumentBackend>,
    executor: Arc<dyn RemoteExecutor>,
    remote_root: String,
    scratch_dir: PathBuf,
}

impl StateStore {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        executor: Arc<dyn RemoteExecutor>,
        remote_root: &str,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            executor,
            remote_root: remote_root.trim_end_matches('/').to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Open the backend the domain config selects.
    pub fn open(config: &DomainConfig, executor: Arc<dyn RemoteExecutor>) -> StateResult<Self> {
        let state_dir = &config.domain.state_dir;
        let backend: Arc<dyn DocumentBackend> = match config.domain.backend {
            StoreBackend::Fs => Arc::new(FsBackend::new(state_dir)),
            StoreBackend::Redb => Arc::new(RedbBackend::open(
                &state_dir.join(format!("{}.redb", config.domain.name)),
            )?),
        };
        info!(
            domain = %config.domain.name,
            backend = ?config.domain.backend,
            state_dir = %state_dir.display(),
            "state store opened"
        );
        Ok(Self::new(
            backend,
            executor,
            &config.transport.remote_root,
            state_dir.join(".scratch"),
        ))
    }

    // ── Documents ─────────────────────────────────────────────────

    pub fn list_roles(&self, domain: &str) -> StateResult<Vec<String>> {
        self.backend.list_roles(domain)
    }

    pub fn list_workers(&self, domain: &str, role: &str) -> StateResult<Vec<String>> {
        self.backend.list_workers(domain, role)
    }

    /// Every worker of the domain holding at least one document, in role order.
    pub fn list_identities(&self, domain: &str) -> StateResult<Vec<WorkerIdentity>> {
        let mut out = Vec::new();
        for role in self.list_roles(domain)? {
            for worker in self.list_workers(domain, &role)? {
                out.push(WorkerIdentity::new(domain, &role, &worker));
            }
        }
        Ok(out)
    }

    /// Read one document. `Ok(None)` means it does not exist.
    pub fn read(&self, identity: &WorkerIdentity, kind: TargetKind) -> StateResult<Option<Target>> {
        let Some(bytes) = self.backend.get(&DocumentKey::new(identity, kind))? else {
            return Ok(None);
        };
        let target = Target::from_json(&bytes)
            .map_err(|e| StateError::Deserialize(format!("{identity} {kind}: {e}")))?;
        Ok(Some(target))
    }

    /// Store a document under its own identity and kind.
    ///
    /// The stored timestamp never goes backwards for one document: a write
    /// carrying an older stamp than the current document inherits the
    /// current one. Returns the document as stored.
    pub fn write(&self, target: &Target) -> StateResult<Target> {
        target
            .validate_identity()
            .map_err(|e| StateError::Invalid(e.to_string()))?;
        let identity = target.identity();
        let key = DocumentKey::new(&identity, target.kind);

        let mut stored = target.clone();
        match self.read(&identity, target.kind) {
            Ok(Some(previous)) => stored.timestamp = stored.timestamp.max(previous.timestamp),
            Ok(None) => {}
            Err(e) => warn!(worker = %identity, kind = %target.kind, error = %e, "overwriting unreadable document"),
        }

        let bytes = stored
            .to_json()
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        self.backend.put(&key, &bytes)?;
        debug!(worker = %identity, kind = %stored.kind, cmd = %stored.user_cmd, "document written");
        Ok(stored)
    }

    /// Delete one document. Returns true if it existed.
    pub fn delete(&self, identity: &WorkerIdentity, kind: TargetKind) -> StateResult<bool> {
        self.backend.remove(&DocumentKey::new(identity, kind))
    }

    /// Delete all three documents of a worker.
    ///
    /// DESIRED goes last, so an interrupted removal is still pending on
    /// the next tick. APPLIED goes before HEARTBEAT: a heartbeat pull that
    /// lands after this deletion finds APPLIED gone and drops its write.
    pub fn delete_worker(&self, identity: &WorkerIdentity) -> StateResult<()> {
        for kind in [TargetKind::Applied, TargetKind::Heartbeat, TargetKind::Desired] {
            self.delete(identity, kind)?;
        }
        info!(worker = %identity, "worker documents deleted");
        Ok(())
    }

    // ── Distribution ──────────────────────────────────────────────

    /// Well-known location of a worker's document on its host.
    pub fn remote_path(&self, identity: &WorkerIdentity, kind: TargetKind) -> String {
        format!(
            "{}/{}/{}/{}",
            self.remote_root,
            identity.domain,
            identity.role,
            kind.file_name(&identity.worker)
        )
    }

    fn scratch_path(&self, lane: &str, identity: &WorkerIdentity, kind: TargetKind) -> PathBuf {
        self.scratch_dir
            .join(lane)
            .join(&identity.domain)
            .join(&identity.role)
            .join(kind.file_name(&identity.worker))
    }

    /// Copy a committed APPLIED document to the worker's host, exactly as
    /// stored, and verify the remote copy by digest.
    ///
    /// Failure leaves the local APPLIED document in place.
    pub async fn push_applied_to_host(&self, target: &Target) -> StateResult<()> {
        if target.kind != TargetKind::Applied {
            return Err(StateError::Invalid(format!(
                "{}: only an applied target is distributed, not {}",
                target.identity(),
                target.kind
            )));
        }
        let identity = target.identity();
        let host = target.plan.placement.host.as_str();
        let remote = self.remote_path(&identity, TargetKind::Applied);
        let bytes = target
            .to_json()
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        let distribution = |source: TransportError| StateError::Distribution {
            worker: identity.to_string(),
            source,
        };

        let local = self.scratch_path("outbox", &identity, TargetKind::Applied);
        write_scratch(&local, &bytes).await?;
        let copied = self.executor.copy_to(host, &local, &remote).await;
        let _ = tokio::fs::remove_file(&local).await;
        copied.map_err(distribution)?;

        let output = self
            .executor
            .run(host, &format!("sha256sum {}", shell::quote(&remote)))
            .await
            .map_err(distribution)?;
        let expected = hex::encode(Sha256::digest(&bytes));
        let actual = output.split_whitespace().next().unwrap_or_default();
        if actual != expected {
            return Err(distribution(TransportError::FileTransfer {
                host: host.to_string(),
                path: remote,
                reason: format!("sha256 {actual:?} does not match {expected}"),
            }));
        }

        debug!(worker = %identity, %host, path = %remote, "applied target distributed");
        Ok(())
    }

    /// Collect the worker's heartbeat from its host.
    ///
    /// Workers without an APPLIED document have nothing to pull. Any
    /// transport or decoding failure is logged and yields `Ok(None)`; the
    /// previously stored heartbeat is left untouched. A collected heartbeat
    /// is stamped with the collection time before it is stored, and dropped
    /// again if the worker was removed while it was in flight.
    pub async fn pull_heartbeat_from_host(
        &self,
        identity: &WorkerIdentity,
    ) -> StateResult<Option<Target>> {
        let Some(applied) = self.read(identity, TargetKind::Applied)? else {
            return Ok(None);
        };
        let host = applied.plan.placement.host.as_str();
        let remote = self.remote_path(identity, TargetKind::Heartbeat);
        let local = self.scratch_path("inbox", identity, TargetKind::Heartbeat);

        if let Err(e) = self.executor.copy_from(host, &remote, &local).await {
            warn!(worker = %identity, %host, error = %e, "heartbeat not collected this cycle");
            return Ok(None);
        }
        let bytes = tokio::fs::read(&local).await;
        let _ = tokio::fs::remove_file(&local).await;
        let parsed = match bytes {
            Ok(bytes) => Target::from_json(&bytes).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let mut heartbeat = match parsed {
            Ok(target) if target.identity() == *identity => target,
            Ok(target) => {
                warn!(worker = %identity, reported = %target.identity(), "heartbeat names another worker; ignored");
                return Ok(None);
            }
            Err(error) => {
                warn!(worker = %identity, %host, %error, "unreadable heartbeat; ignored");
                return Ok(None);
            }
        };

        heartbeat.kind = TargetKind::Heartbeat;
        heartbeat.timestamp = epoch_millis();
        let stored = self.write(&heartbeat)?;
        if self.read(identity, TargetKind::Applied)?.is_none() {
            self.delete(identity, TargetKind::Heartbeat)?;
            debug!(worker = %identity, %host, "worker removed during heartbeat pull; dropped");
            return Ok(None);
        }
        debug!(worker = %identity, %host, "heartbeat collected");
        Ok(Some(stored))
    }
}

async fn write_scratch(path: &Path, bytes: &[u8]) -> StateResult<()> {
    let io_err = |source| StateError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    tokio::fs::write(path, bytes).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use fleet_core::{HostInit, LaunchSpec, Placement, Plan, UserCommand};
    use fleet_transport::fake::FakeExecutor;
    use fleet_transport::TransportFuture;
    use tokio::sync::Notify;

    use super::*;

    const HOST: &str = "10.0.0.1";

    struct Fixture {
        store: StateStore,
        fake: Arc<FakeExecutor>,
        _scratch: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let store = StateStore::new(
            Arc::new(RedbBackend::open_in_memory().unwrap()),
            fake.clone(),
            "/home/admin/fleet/",
            scratch.path(),
        );
        Fixture {
            store,
            fake,
            _scratch: scratch,
        }
    }

    fn identity() -> WorkerIdentity {
        WorkerIdentity::new("d1", "searcher", "searcher_0_0_0_65535")
    }

    fn target(kind: TargetKind, cmd: UserCommand) -> Target {
        let plan = Plan {
            placement: Placement {
                host: HOST.to_string(),
                ..Default::default()
            },
            launch: LaunchSpec {
                command: "/opt/bin/searcher".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        Target::new(kind, &identity(), cmd, plan, HostInit::default())
    }

    #[test]
    fn missing_document_reads_as_absent() {
        let f = fixture();
        for kind in TargetKind::ALL {
            assert!(f.store.read(&identity(), kind).unwrap().is_none());
        }
    }

    #[test]
    fn write_then_read_reproduces_fields() {
        let f = fixture();
        let desired = target(TargetKind::Desired, UserCommand::Start);
        f.store.write(&desired).unwrap();
        let back = f.store.read(&identity(), TargetKind::Desired).unwrap().unwrap();
        assert_eq!(back, desired);
        assert_eq!(
            f.store.list_identities("d1").unwrap(),
            vec![identity()]
        );
    }

    #[test]
    fn timestamp_never_decreases() {
        let f = fixture();
        let mut first = target(TargetKind::Desired, UserCommand::Start);
        first.timestamp = 5_000;
        f.store.write(&first).unwrap();

        let mut older = target(TargetKind::Desired, UserCommand::Stop);
        older.timestamp = 1_000;
        let stored = f.store.write(&older).unwrap();
        assert_eq!(stored.timestamp, 5_000);
        assert_eq!(stored.user_cmd, UserCommand::Stop);

        let reread = f.store.read(&identity(), TargetKind::Desired).unwrap().unwrap();
        assert!(reread.timestamp >= first.timestamp);
    }

    #[test]
    fn write_rejects_incomplete_identity() {
        let f = fixture();
        let mut bad = target(TargetKind::Desired, UserCommand::Start);
        bad.role_name.clear();
        assert!(matches!(f.store.write(&bad), Err(StateError::Invalid(_))));
    }

    #[test]
    fn delete_worker_removes_all_documents() {
        let f = fixture();
        for kind in TargetKind::ALL {
            f.store.write(&target(kind, UserCommand::Start)).unwrap();
        }
        f.store.delete_worker(&identity()).unwrap();
        for kind in TargetKind::ALL {
            assert!(f.store.read(&identity(), kind).unwrap().is_none());
        }
        assert!(f.store.list_workers("d1", "searcher").unwrap().is_empty());
    }

    #[test]
    fn remote_path_layout() {
        let f = fixture();
        assert_eq!(
            f.store.remote_path(&identity(), TargetKind::Heartbeat),
            "/home/admin/fleet/d1/searcher/searcher_0_0_0_65535-heartbeat.json"
        );
    }

    #[tokio::test]
    async fn push_copies_applied_to_host() {
        let f = fixture();
        let applied = f
            .store
            .write(&target(TargetKind::Applied, UserCommand::Start))
            .unwrap();
        f.store.push_applied_to_host(&applied).await.unwrap();

        let remote = f.store.remote_path(&identity(), TargetKind::Applied);
        let copied = Target::from_json(&f.fake.file(HOST, &remote).unwrap()).unwrap();
        assert_eq!(copied.kind, TargetKind::Applied);
        assert!(copied.mirrors(&applied));
    }

    #[tokio::test]
    async fn pushed_copy_is_byte_identical_to_the_stored_document() {
        let f = fixture();
        let mut applied = target(TargetKind::Applied, UserCommand::Start);
        applied.timestamp = 1_234;
        let applied = f.store.write(&applied).unwrap();
        f.store.push_applied_to_host(&applied).await.unwrap();

        let remote = f.store.remote_path(&identity(), TargetKind::Applied);
        let stored = f.store.read(&identity(), TargetKind::Applied).unwrap().unwrap();
        assert_eq!(f.fake.file(HOST, &remote).unwrap(), stored.to_json().unwrap());
        assert_eq!(stored.timestamp, 1_234);
    }

    #[tokio::test]
    async fn only_applied_documents_are_pushed() {
        let f = fixture();
        let desired = target(TargetKind::Desired, UserCommand::Start);
        assert!(matches!(
            f.store.push_applied_to_host(&desired).await,
            Err(StateError::Invalid(_))
        ));
        assert!(f.fake.commands().is_empty());
    }

    #[tokio::test]
    async fn corrupted_push_is_a_distribution_error() {
        let f = fixture();
        f.fake.set_corrupt_uploads(HOST, true);
        let applied = f
            .store
            .write(&target(TargetKind::Applied, UserCommand::Start))
            .unwrap();

        let err = f.store.push_applied_to_host(&applied).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Distribution {
                source: TransportError::FileTransfer { .. },
                ..
            }
        ));
        // The committed document stands.
        assert!(f.store.read(&identity(), TargetKind::Applied).unwrap().is_some());
    }

    #[tokio::test]
    async fn pull_without_applied_is_a_no_op() {
        let f = fixture();
        assert!(f.store.pull_heartbeat_from_host(&identity()).await.unwrap().is_none());
        assert!(f.fake.commands().is_empty());
    }

    #[tokio::test]
    async fn pull_stores_and_restamps_heartbeat() {
        let f = fixture();
        f.store
            .write(&target(TargetKind::Applied, UserCommand::Start))
            .unwrap();
        let mut remote_hb = target(TargetKind::Heartbeat, UserCommand::Start);
        remote_hb.timestamp = 1;
        f.fake.put_file(
            HOST,
            &f.store.remote_path(&identity(), TargetKind::Heartbeat),
            &remote_hb.to_json().unwrap(),
        );

        let collected = f
            .store
            .pull_heartbeat_from_host(&identity())
            .await
            .unwrap()
            .unwrap();
        assert!(collected.timestamp > 1);
        assert_eq!(
            f.store.read(&identity(), TargetKind::Heartbeat).unwrap(),
            Some(collected)
        );
    }

    #[tokio::test]
    async fn failed_pull_keeps_previous_heartbeat() {
        let f = fixture();
        f.store
            .write(&target(TargetKind::Applied, UserCommand::Start))
            .unwrap();
        let previous = f
            .store
            .write(&target(TargetKind::Heartbeat, UserCommand::Start))
            .unwrap();

        f.fake.set_unreachable(HOST, true);
        assert!(f.store.pull_heartbeat_from_host(&identity()).await.unwrap().is_none());
        assert_eq!(
            f.store.read(&identity(), TargetKind::Heartbeat).unwrap(),
            Some(previous)
        );
    }

    #[tokio::test]
    async fn garbage_heartbeat_is_ignored() {
        let f = fixture();
        f.store
            .write(&target(TargetKind::Applied, UserCommand::Start))
            .unwrap();
        f.fake.put_file(
            HOST,
            &f.store.remote_path(&identity(), TargetKind::Heartbeat),
            b"not json",
        );
        assert!(f.store.pull_heartbeat_from_host(&identity()).await.unwrap().is_none());
        assert!(f.store.read(&identity(), TargetKind::Heartbeat).unwrap().is_none());
    }

    /// Holds every `copy_from` until released.
    struct PausedPull {
        inner: Arc<FakeExecutor>,
        entered: Notify,
        release: Notify,
    }

    impl RemoteExecutor for PausedPull {
        fn run<'a>(&'a self, host: &'a str, command: &'a str) -> TransportFuture<'a, String> {
            self.inner.run(host, command)
        }

        fn copy_to<'a>(
            &'a self,
            host: &'a str,
            local: &'a Path,
            remote_path: &'a str,
        ) -> TransportFuture<'a, ()> {
            self.inner.copy_to(host, local, remote_path)
        }

        fn copy_from<'a>(
            &'a self,
            host: &'a str,
            remote_path: &'a str,
            local: &'a Path,
        ) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                self.inner.copy_from(host, remote_path, local).await
            })
        }
    }

    #[tokio::test]
    async fn removal_during_pull_leaves_no_heartbeat() {
        let scratch = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExecutor::new());
        let paused = Arc::new(PausedPull {
            inner: fake.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = StateStore::new(
            Arc::new(RedbBackend::open_in_memory().unwrap()),
            paused.clone(),
            "/home/admin/fleet",
            scratch.path(),
        );
        for kind in [TargetKind::Desired, TargetKind::Applied] {
            store.write(&target(kind, UserCommand::Start)).unwrap();
        }
        fake.put_file(
            HOST,
            &store.remote_path(&identity(), TargetKind::Heartbeat),
            &target(TargetKind::Heartbeat, UserCommand::Start).to_json().unwrap(),
        );

        let pull = tokio::spawn({
            let store = store.clone();
            async move { store.pull_heartbeat_from_host(&identity()).await }
        });
        paused.entered.notified().await;
        store.delete_worker(&identity()).unwrap();
        paused.release.notify_one();

        assert!(pull.await.unwrap().unwrap().is_none());
        for kind in TargetKind::ALL {
            assert!(store.read(&identity(), kind).unwrap().is_none(), "{kind} survived");
        }
        assert!(store.list_workers("d1", "searcher").unwrap().is_empty());
    }

    #[test]
    fn open_selects_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let doc = format!(
            "[domain]\nname = \"d1\"\nstate_dir = {:?}\nbackend = \"redb\"\n",
            dir.path().display().to_string()
        );
        let config = DomainConfig::parse(&doc).unwrap();
        let store = StateStore::open(&config, Arc::new(FakeExecutor::new())).unwrap();
        store
            .write(&target(TargetKind::Desired, UserCommand::Start))
            .unwrap();
        assert!(dir.path().join("d1.redb").exists());
    }
}
