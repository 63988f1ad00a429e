//! In-memory [`WorkerLifecycle`] for tests of the layers above.
//!
//! Keeps a model of which sandboxes exist and which processes run, records
//! every call, and can be told to fail per host or per operation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use fleet_transport::TransportError;

use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::{LifecycleFuture, WorkerLifecycle};
use crate::workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Bootstrap,
    EnsureContainer,
    StartProcess,
    StopProcess,
    RemoveContainer,
    Inspect,
}

#[derive(Default)]
struct Model {
    calls: Vec<(Op, String)>,
    containers: HashSet<String>,
    /// worker → (pid, command line)
    running: HashMap<String, (u32, String)>,
    launches: HashMap<String, u32>,
    bootstrapped: HashSet<(String, String)>,
    unreachable: HashSet<String>,
    failing: HashSet<(String, Op)>,
    next_pid: u32,
}

#[derive(Default)]
pub struct RecordingLifecycle {
    model: Mutex<Model>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every operation against `host` fails as unreachable.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut model = self.lock();
        if unreachable {
            model.unreachable.insert(host.to_string());
        } else {
            model.unreachable.remove(host);
        }
    }

    /// `op` fails for the worker named `worker` (the worker id, not the full identity).
    pub fn fail(&self, worker: &str, op: Op) {
        self.lock().failing.insert((worker.to_string(), op));
    }

    pub fn clear_failures(&self) {
        let mut model = self.lock();
        model.failing.clear();
        model.unreachable.clear();
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.lock().calls.clone()
    }

    /// Calls of `op` for the worker named `worker`.
    pub fn count(&self, op: Op, worker: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(o, w)| *o == op && w == worker)
            .count()
    }

    /// Processes actually launched (not no-op starts) for `worker`.
    pub fn launches(&self, worker: &str) -> u32 {
        self.lock().launches.get(worker).copied().unwrap_or(0)
    }

    pub fn is_running(&self, worker: &str) -> bool {
        self.lock().running.contains_key(worker)
    }

    pub fn has_container(&self, worker: &str) -> bool {
        self.lock().containers.contains(worker)
    }

    /// Record the call and apply injected failures.
    fn enter(&self, op: Op, w: &Workload) -> LifecycleResult<std::sync::MutexGuard<'_, Model>> {
        let mut model = self.lock();
        let worker = w.identity.worker.clone();
        model.calls.push((op, worker.clone()));
        if model.unreachable.contains(w.host()) {
            return Err(LifecycleError::Transport(TransportError::Timeout {
                host: w.host().to_string(),
                command: format!("{op:?}"),
                timeout: Duration::ZERO,
            }));
        }
        if model.failing.contains(&(worker, op)) {
            return Err(LifecycleError::Remote {
                worker: w.identity.to_string(),
                operation: "injected",
                source: TransportError::Command {
                    host: w.host().to_string(),
                    command: format!("{op:?}"),
                    code: Some(1),
                    stderr: "injected failure".to_string(),
                },
            });
        }
        Ok(model)
    }

    fn apply<T>(&self, op: Op, w: &Workload, f: impl FnOnce(&mut Model, &str) -> T) -> LifecycleResult<T> {
        let mut model = self.enter(op, w)?;
        Ok(f(&mut model, &w.identity.worker))
    }
}

impl WorkerLifecycle for RecordingLifecycle {
    fn bootstrap_host<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, bool> {
        Box::pin(async move {
            let key = (workload.host().to_string(), workload.host_init.digest());
            let empty = workload.host_init.is_empty();
            self.apply(Op::Bootstrap, workload, |model, _| {
                !empty && model.bootstrapped.insert(key)
            })
        })
    }

    fn ensure_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(async move {
            self.apply(Op::EnsureContainer, workload, |model, worker| {
                model.running.remove(worker);
                model.containers.insert(worker.to_string());
            })
        })
    }

    fn start_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, u32> {
        Box::pin(async move {
            let command_line = workload.launch.command_line();
            self.apply(Op::StartProcess, workload, |model, worker| {
                if let Some((pid, running)) = model.running.get(worker) {
                    if *running == command_line {
                        return *pid;
                    }
                }
                model.next_pid += 1;
                let pid = model.next_pid;
                model.running.insert(worker.to_string(), (pid, command_line));
                *model.launches.entry(worker.to_string()).or_default() += 1;
                pid
            })
        })
    }

    fn stop_process<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(async move {
            self.apply(Op::StopProcess, workload, |model, worker| {
                model.running.remove(worker);
            })
        })
    }

    fn remove_container<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, ()> {
        Box::pin(async move {
            self.apply(Op::RemoveContainer, workload, |model, worker| {
                model.running.remove(worker);
                model.containers.remove(worker);
            })
        })
    }

    fn inspect<'a>(&'a self, workload: &'a Workload) -> LifecycleFuture<'a, Option<u32>> {
        Box::pin(async move {
            self.apply(Op::Inspect, workload, |model, worker| {
                model.running.get(worker).map(|(pid, _)| *pid)
            })
        })
    }
}
