//! In-memory [`RemoteExecutor`] for tests.
//!
//! Simulates a set of hosts with a flat file map each. A handful of shell
//! commands the control plane relies on (`test -f`, `test -d`, `mkdir -p`,
//! `touch`, `cat`, `rm -f`, `sha256sum`) are interpreted against that file
//! map; any other command succeeds with empty output unless a scripted
//! response matches its prefix. Hosts can be marked unreachable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{TransportError, TransportResult};
use crate::executor::{RemoteExecutor, TransportFuture};

type Scripted = Result<String, (i32, String)>;

#[derive(Default)]
struct Inner {
    files: HashMap<(String, String), Vec<u8>>,
    unreachable: HashSet<String>,
    corrupt_uploads: HashSet<String>,
    scripts: Vec<(String, VecDeque<Scripted>)>,
    log: Vec<(String, String)>,
}

/// Scriptable host simulator.
#[derive(Default)]
pub struct FakeExecutor {
    inner: Mutex<Inner>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call against `host` time out.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut inner = self.lock();
        if unreachable {
            inner.unreachable.insert(host.to_string());
        } else {
            inner.unreachable.remove(host);
        }
    }

    /// Flip a byte in every file uploaded to `host`.
    pub fn set_corrupt_uploads(&self, host: &str, corrupt: bool) {
        let mut inner = self.lock();
        if corrupt {
            inner.corrupt_uploads.insert(host.to_string());
        } else {
            inner.corrupt_uploads.remove(host);
        }
    }

    /// Queue a stdout response for commands starting with `prefix`.
    ///
    /// Responses queued for one prefix are consumed in order; the last
    /// one stays in place for every later match.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.push_script(prefix, Ok(stdout.to_string()));
    }

    /// Queue a failure (exit `code`, `stderr`) for commands starting with `prefix`.
    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) {
        self.push_script(prefix, Err((code, stderr.to_string())));
    }

    fn push_script(&self, prefix: &str, response: Scripted) {
        let mut inner = self.lock();
        match inner.scripts.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(response),
            None => inner
                .scripts
                .push((prefix.to_string(), VecDeque::from([response]))),
        }
    }

    pub fn put_file(&self, host: &str, path: &str, bytes: &[u8]) {
        self.lock()
            .files
            .insert((host.to_string(), path.to_string()), bytes.to_vec());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    /// Every `(host, command)` run so far, in order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.lock().log.clone()
    }

    /// Commands run on `host` that start with `prefix`.
    pub fn commands_matching(&self, host: &str, prefix: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|(h, c)| h == host && c.starts_with(prefix))
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn unreachable(host: &str, command: &str) -> TransportError {
        TransportError::Timeout {
            host: host.to_string(),
            command: command.to_string(),
            timeout: Duration::from_secs(0),
        }
    }

    fn failure(host: &str, command: &str, code: i32, stderr: &str) -> TransportError {
        TransportError::Command {
            host: host.to_string(),
            command: command.to_string(),
            code: Some(code),
            stderr: stderr.to_string(),
        }
    }

    fn run_sync(&self, host: &str, command: &str) -> TransportResult<String> {
        let mut inner = self.lock();
        inner.log.push((host.to_string(), command.to_string()));
        if inner.unreachable.contains(host) {
            return Err(Self::unreachable(host, command));
        }

        if let Some((_, queue)) = inner
            .scripts
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            return match response {
                Some(Ok(stdout)) => Ok(stdout),
                Some(Err((code, stderr))) => Err(Self::failure(host, command, code, &stderr)),
                None => Ok(String::new()),
            };
        }

        let key = |path: &str| (host.to_string(), unquote(path));
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            ["test", "-f", path] => {
                if inner.files.contains_key(&key(path)) {
                    Ok(String::new())
                } else {
                    Err(Self::failure(host, command, 1, ""))
                }
            }
            ["test", "-d", path] => {
                let dir = format!("{}/", unquote(path));
                if inner
                    .files
                    .keys()
                    .any(|(h, p)| h == host && (p.starts_with(&dir) || p == &dir))
                {
                    Ok(String::new())
                } else {
                    Err(Self::failure(host, command, 1, ""))
                }
            }
            ["touch", path] => {
                inner.files.entry(key(path)).or_default();
                Ok(String::new())
            }
            ["rm", "-f", path] => {
                inner.files.remove(&key(path));
                Ok(String::new())
            }
            ["cat", path] => inner
                .files
                .get(&key(path))
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| Self::failure(host, command, 1, "No such file or directory")),
            ["sha256sum", path] => inner
                .files
                .get(&key(path))
                .map(|bytes| format!("{}  {}\n", hex::encode(Sha256::digest(bytes)), unquote(path)))
                .ok_or_else(|| Self::failure(host, command, 1, "No such file or directory")),
            _ => Ok(String::new()),
        }
    }

    fn copy_to_sync(&self, host: &str, local: &Path, remote_path: &str) -> TransportResult<()> {
        let display = format!("copy {} -> {host}:{remote_path}", local.display());
        let mut bytes = std::fs::read(local).map_err(|source| TransportError::Io {
            path: local.display().to_string(),
            source,
        })?;
        let mut inner = self.lock();
        inner.log.push((host.to_string(), display.clone()));
        if inner.unreachable.contains(host) {
            return Err(Self::unreachable(host, &display));
        }
        if inner.corrupt_uploads.contains(host) {
            match bytes.first_mut() {
                Some(b) => *b ^= 0xff,
                None => bytes.push(0),
            }
        }
        inner
            .files
            .insert((host.to_string(), remote_path.to_string()), bytes);
        Ok(())
    }

    fn copy_from_sync(&self, host: &str, remote_path: &str, local: &Path) -> TransportResult<()> {
        let display = format!("copy {host}:{remote_path} -> {}", local.display());
        let bytes = {
            let mut inner = self.lock();
            inner.log.push((host.to_string(), display.clone()));
            if inner.unreachable.contains(host) {
                return Err(Self::unreachable(host, &display));
            }
            inner
                .files
                .get(&(host.to_string(), remote_path.to_string()))
                .cloned()
                .ok_or_else(|| Self::failure(host, &display, 23, "No such file or directory"))?
        };
        let io_err = |source| TransportError::Io {
            path: local.display().to_string(),
            source,
        };
        if let Some(dir) = local.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(local, bytes).map_err(io_err)
    }
}

/// Strip one layer of single quotes added by [`crate::shell::quote`].
fn unquote(word: &str) -> String {
    word.strip_prefix('\'')
        .and_then(|w| w.strip_suffix('\''))
        .unwrap_or(word)
        .to_string()
}

impl RemoteExecutor for FakeExecutor {
    fn run<'a>(&'a self, host: &'a str, command: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move { self.run_sync(host, command) })
    }

    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move { self.copy_to_sync(host, local, remote_path) })
    }

    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote_path: &'a str,
        local: &'a Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move { self.copy_from_sync(host, remote_path, local) })
    }
}
