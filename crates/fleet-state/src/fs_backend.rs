//! Filesystem document backend.
//!
//! Layout: `<root>/<domain>/<role>/<worker>-<kind>.json`. Writes go to a
//! sibling temp file first and are renamed into place, so readers never
//! observe a half-written document.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleet_core::TargetKind;
use tracing::debug;

use crate::backend::{DocumentBackend, DocumentKey};
use crate::error::{StateError, StateResult};

#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn role_dir(&self, domain: &str, role: &str) -> PathBuf {
        self.root.join(domain).join(role)
    }

    /// Path of one document.
    pub fn path(&self, key: &DocumentKey<'_>) -> PathBuf {
        let id = key.identity;
        self.role_dir(&id.domain, &id.role)
            .join(key.kind.file_name(&id.worker))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Entries of a directory, or nothing if it does not exist.
fn read_dir_or_empty(dir: &Path) -> StateResult<Vec<std::fs::DirEntry>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err(dir)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_err(dir)(e)),
    }
}

impl DocumentBackend for FsBackend {
    fn get(&self, key: &DocumentKey<'_>) -> StateResult<Option<Vec<u8>>> {
        let path = self.path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn put(&self, key: &DocumentKey<'_>, value: &[u8]) -> StateResult<()> {
        let path = self.path(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        debug!(path = %path.display(), "document written");
        Ok(())
    }

    fn remove(&self, key: &DocumentKey<'_>) -> StateResult<bool> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn list_roles(&self, domain: &str) -> StateResult<Vec<String>> {
        let mut roles = BTreeSet::new();
        for entry in read_dir_or_empty(&self.root.join(domain))? {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                roles.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(roles.into_iter().collect())
    }

    fn list_workers(&self, domain: &str, role: &str) -> StateResult<Vec<String>> {
        let mut workers = BTreeSet::new();
        for entry in read_dir_or_empty(&self.role_dir(domain, role))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some((worker, _)) = TargetKind::parse_file_name(&name) {
                workers.insert(worker.to_string());
            }
        }
        Ok(workers.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::WorkerIdentity;

    use super::*;

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let id = WorkerIdentity::new("d1", "qrs", "qrs_0_0_0_65535");
        let key = DocumentKey::new(&id, TargetKind::Desired);

        assert_eq!(backend.get(&key).unwrap(), None);
        backend.put(&key, b"{}").unwrap();
        assert_eq!(backend.get(&key).unwrap(), Some(b"{}".to_vec()));
        assert!(dir
            .path()
            .join("d1/qrs/qrs_0_0_0_65535-user-target.json")
            .exists());

        assert!(backend.remove(&key).unwrap());
        assert!(!backend.remove(&key).unwrap());
        assert_eq!(backend.get(&key).unwrap(), None);
    }

    #[test]
    fn lists_roles_and_workers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let a = WorkerIdentity::new("d1", "searcher", "searcher_0_0_0_32767");
        let b = WorkerIdentity::new("d1", "searcher", "searcher_0_1_32768_65535");
        let c = WorkerIdentity::new("d1", "qrs", "qrs_0_0_0_65535");

        backend.put(&DocumentKey::new(&a, TargetKind::Desired), b"{}").unwrap();
        backend.put(&DocumentKey::new(&a, TargetKind::Applied), b"{}").unwrap();
        backend.put(&DocumentKey::new(&b, TargetKind::Heartbeat), b"{}").unwrap();
        backend.put(&DocumentKey::new(&c, TargetKind::Desired), b"{}").unwrap();
        std::fs::write(dir.path().join("d1/searcher/README"), b"ignored").unwrap();

        assert_eq!(backend.list_roles("d1").unwrap(), vec!["qrs", "searcher"]);
        assert_eq!(
            backend.list_workers("d1", "searcher").unwrap(),
            vec!["searcher_0_0_0_32767", "searcher_0_1_32768_65535"]
        );
        assert!(backend.list_workers("d1", "bs").unwrap().is_empty());
        assert!(backend.list_roles("d2").unwrap().is_empty());
    }

    #[test]
    fn overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let id = WorkerIdentity::new("d1", "qrs", "w");
        let key = DocumentKey::new(&id, TargetKind::Applied);
        backend.put(&key, b"1").unwrap();
        backend.put(&key, b"2").unwrap();

        assert_eq!(backend.get(&key).unwrap(), Some(b"2".to_vec()));
        let names: Vec<_> = std::fs::read_dir(dir.path().join("d1/qrs"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["w-final-target.json"]);
    }
}
