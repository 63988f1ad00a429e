//! `ssh`/`rsync` executor.
//!
//! Each call spawns one child process with `kill_on_drop`, so a caller
//! that abandons the future (for example on a per-worker timeout) also
//! tears down the ssh session. Hosts listed in `local_hosts` bypass ssh
//! entirely.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use fleet_core::TransportConfig;

use crate::error::{TransportError, TransportResult};
use crate::executor::{RemoteExecutor, TransportFuture};
use crate::shell;

/// Production [`RemoteExecutor`] backed by the `ssh` and `rsync` binaries.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
    ssh_options: Vec<String>,
    local_hosts: HashSet<String>,
}

impl SshExecutor {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            user: config.user.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            ssh_options: config.ssh_options.clone(),
            local_hosts: config.local_hosts.iter().cloned().collect(),
        }
    }

    pub fn is_local(&self, host: &str) -> bool {
        self.local_hosts.contains(host)
    }

    fn destination(&self, host: &str) -> String {
        if self.user.is_empty() {
            host.to_string()
        } else {
            format!("{}@{host}", self.user)
        }
    }

    /// Options shared by `ssh` invocations and rsync's remote shell.
    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        for opt in &self.ssh_options {
            opts.push("-o".to_string());
            opts.push(opt.clone());
        }
        opts
    }

    /// Full argv (minus the program) for running `command` on `host`.
    pub fn ssh_argv(&self, host: &str, command: &str) -> Vec<String> {
        let mut argv = self.ssh_options();
        argv.push(self.destination(host));
        argv.push(command.to_string());
        argv
    }

    /// Value for rsync's `-e` flag.
    pub fn rsync_remote_shell(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.ssh_options())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn execute(
        &self,
        mut cmd: Command,
        host: &str,
        display_cmd: &str,
    ) -> TransportResult<String> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(%host, command = %display_cmd, "spawning");
        let child = cmd
            .spawn()
            .map_err(|source| TransportError::Spawn { program, source })?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(|source| TransportError::Io {
                path: display_cmd.to_string(),
                source,
            })?,
            Err(_) => {
                debug!(%host, command = %display_cmd, "remote command timed out");
                return Err(TransportError::Timeout {
                    host: host.to_string(),
                    command: display_cmd.to_string(),
                    timeout: self.command_timeout,
                });
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(%host, command = %display_cmd, code = ?output.status.code(), %stderr, "remote command failed");
            Err(TransportError::Command {
                host: host.to_string(),
                command: display_cmd.to_string(),
                code: output.status.code(),
                stderr,
            })
        }
    }

    async fn run_inner(&self, host: &str, command: &str) -> TransportResult<String> {
        let cmd = if self.is_local(host) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("ssh");
            cmd.args(self.ssh_argv(host, command));
            cmd
        };
        self.execute(cmd, host, command).await
    }

    async fn rsync(&self, host: &str, from: &str, to: &str) -> TransportResult<()> {
        let mut cmd = Command::new("rsync");
        cmd.arg("-a")
            .arg("--checksum")
            .arg("-e")
            .arg(self.rsync_remote_shell())
            .arg(from)
            .arg(to);
        let display = format!("rsync {from} {to}");
        self.execute(cmd, host, &display).await.map(|_| ())
    }

    async fn copy_to_inner(&self, host: &str, local: &Path, remote_path: &str) -> TransportResult<()> {
        if self.is_local(host) {
            return local_copy(local, Path::new(remote_path)).await;
        }
        if let Some(dir) = shell::parent_dir(remote_path) {
            self.run_inner(host, &format!("mkdir -p {}", shell::quote(dir)))
                .await?;
        }
        let to = format!("{}:{remote_path}", self.destination(host));
        self.rsync(host, &local.to_string_lossy(), &to).await
    }

    async fn copy_from_inner(
        &self,
        host: &str,
        remote_path: &str,
        local: &Path,
    ) -> TransportResult<()> {
        if self.is_local(host) {
            return local_copy(Path::new(remote_path), local).await;
        }
        ensure_parent(local).await?;
        let from = format!("{}:{remote_path}", self.destination(host));
        self.rsync(host, &from, &local.to_string_lossy()).await
    }
}

impl RemoteExecutor for SshExecutor {
    fn run<'a>(&'a self, host: &'a str, command: &'a str) -> TransportFuture<'a, String> {
        Box::pin(self.run_inner(host, command))
    }

    fn copy_to<'a>(
        &'a self,
        host: &'a str,
        local: &'a Path,
        remote_path: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.copy_to_inner(host, local, remote_path))
    }

    fn copy_from<'a>(
        &'a self,
        host: &'a str,
        remote_path: &'a str,
        local: &'a Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.copy_from_inner(host, remote_path, local))
    }
}

async fn ensure_parent(path: &Path) -> TransportResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| TransportError::Io {
                path: dir.display().to_string(),
                source,
            })?;
    }
    Ok(())
}

async fn local_copy(from: &Path, to: &Path) -> TransportResult<()> {
    ensure_parent(to).await?;
    tokio::fs::copy(from, to)
        .await
        .map_err(|source| TransportError::Io {
            path: from.display().to_string(),
            source,
        })?;
    Ok(())
}
