//! The storage seam behind [`crate::StateStore`].

use fleet_core::{TargetKind, WorkerIdentity};

use crate::error::StateResult;

/// Address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey<'a> {
    pub identity: &'a WorkerIdentity,
    pub kind: TargetKind,
}

impl<'a> DocumentKey<'a> {
    pub fn new(identity: &'a WorkerIdentity, kind: TargetKind) -> Self {
        Self { identity, kind }
    }
}

/// Raw document storage. Values are opaque bytes; the store owns the
/// encoding. Every write is last-writer-wins per key.
pub trait DocumentBackend: Send + Sync {
    fn get(&self, key: &DocumentKey<'_>) -> StateResult<Option<Vec<u8>>>;

    fn put(&self, key: &DocumentKey<'_>, value: &[u8]) -> StateResult<()>;

    /// Remove a document. Returns true if it existed.
    fn remove(&self, key: &DocumentKey<'_>) -> StateResult<bool>;

    /// Roles with at least one document in `domain`, sorted.
    fn list_roles(&self, domain: &str) -> StateResult<Vec<String>>;

    /// Workers with at least one document in `domain/role`, sorted.
    fn list_workers(&self, domain: &str, role: &str) -> StateResult<Vec<String>>;
}
