//! [`WorkerLifecycle`] over a remote executor.
//!
//! Every worker owns a runtime directory `<remote_root>/<domain>/<role>/<worker>`
//! holding its pid file and output log. In container mode that path lives
//! inside the worker's container; in process mode it lives on the host.
//!
//! Process mode shares the host with other workers, possibly running the
//! very same command line, so there a worker's process is only ever the
//! one its own pid file names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use fleet_core::{DomainConfig, LifecycleConfig, SandboxMode};
use fleet_transport::{shell, RemoteExecutor, TransportError};

use crate::bootstrap;
use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{LifecycleFuture, WorkerLifecycle};
use crate::probe;
use crate::retry::RetryPolicy;
use crate::workload::Workload;

pub struct HostLifecycle {
    executor: Arc<dyn RemoteExecutor>,
    sandbox: SandboxMode,
    remote_root: String,
    start_policy: RetryPolicy,
    bootstrap_policy: RetryPolicy,
    /// One lock per (host, marker) so concurrent workers bootstrap a host once.
    bootstrap_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HostLifecycle {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        config: &LifecycleConfig,
        remote_root: &str,
    ) -> Self {
        Self {
            executor,
            sandbox: config.sandbox,
            remote_root: remote_root.trim_end_matches('/').to_string(),
            start_policy: RetryPolicy::fixed(config.start_attempts, config.start_backoff()),
            bootstrap_policy: RetryPolicy::fixed(
                config.bootstrap_attempts,
                config.bootstrap_backoff(),
            ),
            bootstrap_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &DomainConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self::new(executor, &config.lifecycle, &config.transport.remote_root)
    }

    /// Override the readiness poll (tests use a zero backoff).
    pub fn with_start_policy(mut self, policy: RetryPolicy) -> Self {
        self.start_policy = policy;
        self
    }

    pub fn with_bootstrap_policy(mut self, policy: RetryPolicy) -> Self {
        self.bootstrap_policy = policy;
        self
    }

    pub fn sandbox(&self) -> SandboxMode {
        self.sandbox
    }

    // ── Layout ────────────────────────────────────────────────────

    pub fn runtime_dir(&self, w: &Workload) -> String {
        let id = &w.identity;
        format!("{}/{}/{}/{}", self.remote_root, id.domain, id.role, id.worker)
    }

    fn pid_file(&self, w: &Workload) -> String {
        format!("{}/pid", self.runtime_dir(w))
    }

    fn log_file(&self, w: &Workload) -> String {
        format!("{}/{}.log", self.runtime_dir(w), w.identity.worker)
    }

    fn work_dir(&self, w: &Workload) -> String {
        w.launch
            .work_dir
            .clone()
            .unwrap_or_else(|| self.runtime_dir(w))
    }

    // ── Scripts ───────────────────────────────────────────────────

    /// Wrap a shell script so it runs inside the worker's sandbox.
    fn in_sandbox(&self, w: &Workload, script: &str) -> String {
        match self.sandbox {
            SandboxMode::Container => format!(
                "docker exec {} sh -c {}",
                shell::quote(&w.container_name()),
                shell::quote(script)
            ),
            SandboxMode::Process => script.to_string(),
        }
    }

    fn start_script(&self, w: &Workload) -> String {
        let runtime = shell::quote(&self.runtime_dir(w));
        let work = shell::quote(&self.work_dir(w));
        let mut launch = vec!["nohup".to_string()];
        if !w.launch.env.is_empty() {
            launch.push("env".to_string());
            launch.extend(
                w.launch
                    .env
                    .iter()
                    .map(|(k, v)| shell::quote(&format!("{k}={v}"))),
            );
        }
        launch.push(shell::quote(&w.launch.command));
        launch.extend(w.launch.args.iter().map(|a| shell::quote(a)));
        format!(
            "mkdir -p {runtime} {work} && cd {work} && {{ {} >> {} 2>&1 < /dev/null & echo $! > {}; }}",
            launch.join(" "),
            shell::quote(&self.log_file(w)),
            shell::quote(&self.pid_file(w)),
        )
    }

    /// Print `<pid> <args>` for the live process named by the pid file.
    fn pid_probe_script(&self, w: &Workload) -> String {
        let pid = shell::quote(&self.pid_file(w));
        format!(
            "pid=$(cat {pid} 2>/dev/null) && kill -0 \"$pid\" 2>/dev/null && echo \"$pid $(ps -o args= -p \"$pid\")\"; true"
        )
    }

    fn stop_script(&self, w: &Workload) -> String {
        let pid = shell::quote(&self.pid_file(w));
        format!("if [ -f {pid} ]; then kill -9 $(cat {pid}) 2>/dev/null; rm -f {pid}; fi; true")
    }

    fn docker_run(&self, w: &Workload) -> LifecycleResult<String> {
        let image = w.placement.image.as_deref().ok_or_else(|| {
            LifecycleError::InvalidPlan(format!("{}: container sandbox needs an image", w.identity))
        })?;
        let mut argv = vec![
            "docker".to_string(),
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            w.container_name(),
            "--network".to_string(),
            "host".to_string(),
        ];
        if let Some(cpus) = w.placement.cpus {
            argv.push("--cpus".to_string());
            argv.push(cpus.to_string());
        }
        if let Some(memory) = w.placement.memory_mb {
            argv.push("--memory".to_string());
            argv.push(format!("{memory}m"));
        }
        for mount in &w.placement.mounts {
            argv.push("-v".to_string());
            argv.push(mount.clone());
        }
        argv.extend([image.to_string(), "sleep".to_string(), "infinity".to_string()]);
        Ok(shell::join(&argv))
    }

    // ── Operations ────────────────────────────────────────────────

    async fn exec(
        &self,
        w: &Workload,
        operation: &'static str,
        command: &str,
    ) -> LifecycleResult<String> {
        self.executor
            .run(w.host(), command)
            .await
            .map_err(|e| LifecycleError::from_remote(&w.identity.to_string(), operation, e))
    }

    /// Run `command`, treating an absent container as success.
    async fn exec_tolerating_absence(
        &self,
        w: &Workload,
        operation: &'static str,
        command: &str,
    ) -> LifecycleResult<()> {
        match self.executor.run(w.host(), command).await {
            Ok(_) => Ok(()),
            Err(e) if container_absent(&e) => {
                debug!(worker = %w.identity, operation, "container absent");
                Ok(())
            }
            Err(e) => Err(LifecycleError::from_remote(&w.identity.to_string(), operation, e)),
        }
    }

    async fn inspect_inner(&self, w: &Workload) -> LifecycleResult<Option<u32>> {
        let script = match self.sandbox {
            // A container's process table holds only its own worker.
            SandboxMode::Container => format!("ps {}", probe::PS_ARGS),
            SandboxMode::Process => self.pid_probe_script(w),
        };
        let command = self.in_sandbox(w, &script);
        match self.executor.run(w.host(), &command).await {
            Ok(table) => Ok(probe::find_pid(&table, &w.launch.command_line())),
            Err(e) if container_absent(&e) => Ok(None),
            Err(e) => Err(LifecycleError::from_remote(&w.identity.to_string(), "inspect", e)),
        }
    }

    async fn stop_inner(&self, w: &Workload) -> LifecycleResult<()> {
        if matches!(self.sandbox, SandboxMode::Container) {
            if let Some(pid) = self.inspect_inner(w).await? {
                let kill = self.in_sandbox(w, &format!("kill -9 {pid} 2>/dev/null; true"));
                self.exec_tolerating_absence(w, "stop_process", &kill).await?;
            }
        }
        let stop = self.in_sandbox(w, &self.stop_script(w));
        self.exec_tolerating_absence(w, "stop_process", &stop).await?;
        debug!(worker = %w.identity, host = w.host(), "process stopped");
        Ok(())
    }

    async fn ensure_container_inner(&self, w: &Workload) -> LifecycleResult<()> {
        match self.sandbox {
            SandboxMode::Container => {
                let run = self.docker_run(w)?;
                let name = shell::quote(&w.container_name());
                self.exec_tolerating_absence(w, "ensure_container", &format!("docker rm -f {name}"))
                    .await?;
                self.exec(w, "ensure_container", &run).await?;
            }
            SandboxMode::Process => {
                self.stop_inner(w).await?;
                let dirs = shell::join([self.runtime_dir(w), self.work_dir(w)]);
                self.exec(w, "ensure_container", &format!("mkdir -p {dirs}"))
                    .await?;
            }
        }
        info!(worker = %w.identity, host = w.host(), sandbox = ?self.sandbox, "sandbox created");
        Ok(())
    }

    async fn start_inner(&self, w: &Workload) -> LifecycleResult<u32> {
        if let Some(pid) = self.inspect_inner(w).await? {
            debug!(worker = %w.identity, pid, "process already running");
            return Ok(pid);
        }
        self.stop_inner(w).await?;
        self.exec(w, "start_process", &self.in_sandbox(w, &self.start_script(w)))
            .await?;

        let attempts = self.start_policy.attempts;
        let pid = self
            .start_policy
            .retry("readiness probe", |_| async move {
                match self.inspect_inner(w).await? {
                    Some(pid) => Ok(pid),
                    None => Err(LifecycleError::NotObserved {
                        worker: w.identity.to_string(),
                        attempts,
                    }),
                }
            })
            .await?;
        info!(worker = %w.identity, host = w.host(), pid, "process started");
        Ok(pid)
    }

    async fn remove_inner(&self, w: &Workload) -> LifecycleResult<()> {
        match self.sandbox {
            SandboxMode::Container => {
                let name = shell::quote(&w.container_name());
                self.exec_tolerating_absence(w, "remove_container", &format!("docker rm -f {name}"))
                    .await?;
            }
            SandboxMode::Process => {
                self.stop_inner(w).await?;
                let dir = shell::quote(&self.runtime_dir(w));
                self.exec(w, "remove_container", &format!("rm -rf {dir}"))
                    .await?;
            }
        }
        info!(worker = %w.identity, host = w.host(), "sandbox removed");
        Ok(())
    }

    fn bootstrap_lock(&self, key: String) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .bootstrap_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(key).or_default().clone()
    }

    async fn bootstrap_inner(&self, w: &Workload) -> LifecycleResult<bool> {
        if w.host_init.is_empty() {
            return Ok(false);
        }
        let host = w.host();
        let marker = bootstrap::marker_path(&self.remote_root, &w.identity.domain, &w.host_init);
        let lock = self.bootstrap_lock(format!("{host}:{marker}"));
        let _guard = lock.lock().await;

        let check = format!("test -f {}", shell::quote(&marker));
        match self.executor.run(host, &check).await {
            Ok(_) => return Ok(false),
            Err(e) if e.is_command_failure() => {}
            Err(e) => return Err(e.into()),
        }

        let steps = bootstrap::steps(&self.remote_root, &w.host_init);
        info!(%host, domain = %w.identity.domain, steps = steps.len(), "bootstrapping host");
        self.bootstrap_policy
            .retry("host bootstrap", |attempt| {
                let steps = &steps;
                async move {
                    for step in steps {
                        if let Err(e) = self.exec(w, "bootstrap_host", step).await {
                            warn!(%host, attempt, step = %step, error = %e, "bootstrap step failed");
                            return Err(e);
                        }
                    }
                    Ok(())
                }
            })
            .await?;

        let dir = shell::quote(&bootstrap::marker_dir(&self.remote_root));
        self.exec(w, "bootstrap_host", &format!("mkdir -p {dir}")).await?;
        self.exec(w, "bootstrap_host", &format!("touch {}", shell::quote(&marker)))
            .await?;
        Ok(true)
    }
}

/// The container runtime reports the sandbox is gone or stopped.
fn container_absent(e: &TransportError) -> bool {
    e.stderr_contains("No such container") || e.stderr_contains("is not running")
}

impl WorkerLifecycle for HostLifecycle {
    fn bootstrap_host<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, bool> {
        Box::pin(self.bootstrap_inner(workload))
    }

    fn ensure_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(self.ensure_container_inner(workload))
    }

    fn start_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, u32> {
        Box::pin(self.start_inner(workload))
    }

    fn stop_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(self.stop_inner(workload))
    }

    fn remove_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(self.remove_inner(workload))
    }

    fn inspect<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, Option<u32>> {
        Box::pin(self.inspect_inner(workload))
    }
}
