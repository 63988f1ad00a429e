//! redb document backend.
//!
//! All documents live in the single [`TARGETS`] table under composite keys
//! `{domain}/{role}/{worker}/{kind}`, which keeps one role's workers
//! adjacent for prefix scans.
//!
//! redb holds an exclusive lock on its file while a `Database` is open.
//! The daemon and `fleetctl` both write the same file, so a file-backed
//! store opens the database for each operation and closes it again,
//! waiting briefly while another process has it open.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::backend::{DocumentBackend, DocumentKey};
use crate::error::{StateError, StateResult};
use crate::tables::TARGETS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How long an operation waits for another process to release the file.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const LOCK_RETRY: Duration = Duration::from_millis(20);

#[derive(Clone)]
enum Storage {
    File {
        path: PathBuf,
        lock_wait: Duration,
        /// Serializes this process's own opens of the file.
        gate: Arc<Mutex<()>>,
    },
    Memory(Arc<Database>),
}

/// Thread-safe document backend backed by redb.
#[derive(Clone)]
pub struct RedbBackend {
    storage: Storage,
}

impl RedbBackend {
    /// Open (or create) a persistent database at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::open_with_lock_wait(path, DEFAULT_LOCK_WAIT)
    }

    pub fn open_with_lock_wait(path: &Path, lock_wait: Duration) -> StateResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StateError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let backend = Self {
            storage: Storage::File {
                path: path.to_path_buf(),
                lock_wait,
                gate: Arc::new(Mutex::new(())),
            },
        };
        backend.with_db(ensure_tables)?;
        debug!(?path, "redb document store opened");
        Ok(backend)
    }

    /// Create an ephemeral in-memory database (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(map_err!(Open))?;
        ensure_tables(&db)?;
        Ok(Self {
            storage: Storage::Memory(Arc::new(db)),
        })
    }

    /// Run `op` against the database, holding the file only for its duration.
    fn with_db<T>(&self, op: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<T> {
        match &self.storage {
            Storage::Memory(db) => op(db),
            Storage::File {
                path,
                lock_wait,
                gate,
            } => {
                let _gate = gate.lock().unwrap_or_else(|e| e.into_inner());
                let db = open_file(path, *lock_wait)?;
                op(&db)
            }
        }
    }

    fn table_key(key: &DocumentKey<'_>) -> String {
        let id = key.identity;
        format!("{}/{}/{}/{}", id.domain, id.role, id.worker, key.kind)
    }

    /// Collect the path segment following `prefix` for every key under it.
    fn child_segments(&self, prefix: &str) -> StateResult<Vec<String>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            let mut out = BTreeSet::new();
            for entry in table.range(prefix..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                let Some(rest) = key.strip_prefix(prefix) else {
                    break;
                };
                if let Some((segment, _)) = rest.split_once('/') {
                    out.insert(segment.to_string());
                }
            }
            Ok(out.into_iter().collect())
        })
    }
}

fn ensure_tables(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    txn.open_table(TARGETS).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

/// Open the database file, retrying while another process holds it.
fn open_file(path: &Path, lock_wait: Duration) -> StateResult<Database> {
    let deadline = Instant::now() + lock_wait;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                thread::sleep(LOCK_RETRY);
            }
            Err(e) => return Err(StateError::Open(format!("{}: {e}", path.display()))),
        }
    }
}

impl DocumentBackend for RedbBackend {
    fn get(&self, key: &DocumentKey<'_>) -> StateResult<Option<Vec<u8>>> {
        let key = Self::table_key(key);
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            Ok(table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec()))
        })
    }

    fn put(&self, key: &DocumentKey<'_>, value: &[u8]) -> StateResult<()> {
        let key = Self::table_key(key);
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
                table
                    .insert(key.as_str(), value)
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })?;
        debug!(%key, "document stored");
        Ok(())
    }

    fn remove(&self, key: &DocumentKey<'_>) -> StateResult<bool> {
        let key = Self::table_key(key);
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let existed;
            {
                let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
                existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(existed)
        })
    }

    fn list_roles(&self, domain: &str) -> StateResult<Vec<String>> {
        self.child_segments(&format!("{domain}/"))
    }

    fn list_workers(&self, domain: &str, role: &str) -> StateResult<Vec<String>> {
        self.child_segments(&format!("{domain}/{role}/"))
    }
}
