use crate::adapter::{BusRecord, ProcessAdapter, ProcessStatus, StartSpec, SupervisedProcess};
use crate::config::ProcessConfig;
use crate::error::{Result, WardenError};
use crate::process::monitor::ProcessMonitor;
use crate::process::restart::AutoRestart;
use crate::process::spawner::spawn_process;
use crate::process::types::ManagedProcess;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

const BUS_CAPACITY: usize = 1024;
const REAP_INTERVAL: Duration = Duration::from_millis(500);
const STATS_INTERVAL: Duration = Duration::from_secs(2);

struct Registry {
    processes: BTreeMap<String, ManagedProcess>,
    next_id: u32,
    monitor: ProcessMonitor,
}

/// In-process fleet manager built on tokio child processes
///
/// Cloning is cheap; clones share the same fleet and push bus.
#[derive(Clone)]
pub struct LocalProcessManager {
    registry: Arc<RwLock<Registry>>,
    bus: broadcast::Sender<BusRecord>,
    dump_path: Option<PathBuf>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl LocalProcessManager {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            registry: Arc::new(RwLock::new(Registry {
                processes: BTreeMap::new(),
                next_id: 0,
                monitor: ProcessMonitor::new(),
            })),
            bus,
            dump_path: None,
        }
    }

    /// Where `dump` writes the fleet definition
    pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }

    fn emit(&self, name: &str, numeric_id: u32, event: &str) {
        let _ = self.bus.send(BusRecord::lifecycle(name, numeric_id, event));
    }

    async fn launch(bus: &broadcast::Sender<BusRecord>, process: &mut ManagedProcess) -> Result<()> {
        process.status = ProcessStatus::Launching;
        match spawn_process(&process.config, process.numeric_id, bus).await {
            Ok(spawned) => {
                tracing::info!(
                    process = %process.name,
                    pm_id = process.numeric_id,
                    pid = spawned.pid,
                    "process launched"
                );
                process.attach(spawned, now_ms());
                Ok(())
            }
            Err(e) => {
                process.status = ProcessStatus::Errored;
                Err(e)
            }
        }
    }

    pub(crate) fn parse_signal(signal_name: &str) -> Result<Signal> {
        match signal_name {
            "SIGTERM" => Ok(Signal::SIGTERM),
            "SIGINT" => Ok(Signal::SIGINT),
            "SIGQUIT" => Ok(Signal::SIGQUIT),
            "SIGKILL" => Ok(Signal::SIGKILL),
            "SIGHUP" => Ok(Signal::SIGHUP),
            "SIGUSR1" => Ok(Signal::SIGUSR1),
            "SIGUSR2" => Ok(Signal::SIGUSR2),
            _ => Err(WardenError::SignalError(format!(
                "Invalid signal name: {}",
                signal_name
            ))),
        }
    }

    fn exit_details(status: ExitStatus) -> (Option<i32>, Option<String>) {
        let signal = status
            .signal()
            .and_then(|s| Signal::try_from(s).ok())
            .map(|s| s.as_str().to_string());
        (status.code(), signal)
    }

    /// Signal a child and wait for it, escalating to SIGKILL after `timeout`
    async fn wait_for_exit(
        name: &str,
        child: &mut Child,
        pid: Option<u32>,
        stop_signal: Signal,
        timeout: Duration,
    ) -> Result<ExitStatus> {
        let Some(pid) = pid else {
            return child
                .wait()
                .await
                .map_err(|e| WardenError::StopError(name.to_string(), format!("Wait failed: {}", e)));
        };
        let nix_pid = Pid::from_raw(pid as i32);

        signal::kill(nix_pid, stop_signal).map_err(|e| {
            WardenError::StopError(name.to_string(), format!("Failed to send {}: {}", stop_signal, e))
        })?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(WardenError::StopError(
                name.to_string(),
                format!("Wait failed: {}", e),
            )),
            Err(_) => {
                tracing::warn!(
                    process = %name,
                    ?timeout,
                    "process did not exit in time, sending SIGKILL"
                );
                signal::kill(nix_pid, Signal::SIGKILL).map_err(|e| {
                    WardenError::StopError(
                        name.to_string(),
                        format!("Failed to send SIGKILL after timeout: {}", e),
                    )
                })?;
                child.wait().await.map_err(|e| {
                    WardenError::StopError(name.to_string(), format!("Wait failed: {}", e))
                })
            }
        }
    }

    /// Bring a process down without removing it; returns its numeric id
    async fn terminate(&self, name: &str) -> Result<u32> {
        let (numeric_id, mut child, pid, stop_signal, timeout) = {
            let mut registry = self.registry.write().await;
            let process = registry
                .processes
                .get_mut(name)
                .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;

            process.pending_restart = None;
            let stop_signal = Self::parse_signal(&process.config.stop_signal)?;
            let Some(child) = process.child.take() else {
                if process.status != ProcessStatus::Errored {
                    process.status = ProcessStatus::Stopped;
                }
                return Ok(process.numeric_id);
            };
            process.stdin = None;
            process.status = ProcessStatus::Stopping;
            (
                process.numeric_id,
                child,
                process.stats.pid,
                stop_signal,
                process.config.stop_timeout(),
            )
        };

        let outcome = Self::wait_for_exit(name, &mut child, pid, stop_signal, timeout).await;

        let mut registry = self.registry.write().await;
        if let Some(process) = registry.processes.get_mut(name) {
            let (code, sig) = match outcome {
                Ok(status) => Self::exit_details(status),
                Err(_) => (None, None),
            };
            process.stats.record_exit(code, sig, now_ms());
            process.status = ProcessStatus::Stopped;
        }
        drop(registry);

        outcome.map(|_| numeric_id)
    }

    /// Start the reaper and stats refresher; the task runs until aborted
    pub fn supervise(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut reap = tokio::time::interval(REAP_INTERVAL);
            reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stats = tokio::time::interval(STATS_INTERVAL);
            stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = reap.tick() => manager.reap().await,
                    _ = stats.tick() => manager.update_stats().await,
                }
            }
        })
    }

    /// Collect exited children and run any automatic restarts that are due
    pub(crate) async fn reap(&self) {
        let mut events: Vec<(String, u32, &'static str)> = Vec::new();
        {
            let mut registry = self.registry.write().await;
            let now = Instant::now();

            for process in registry.processes.values_mut() {
                if let Some(child) = process.child.as_mut() {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            let (code, sig) = Self::exit_details(status);
                            process.child = None;
                            process.stdin = None;
                            process.stats.record_exit(code, sig, now_ms());
                            process.status = if status.success() {
                                ProcessStatus::Stopped
                            } else {
                                ProcessStatus::Errored
                            };
                            events.push((process.name.clone(), process.numeric_id, "exit"));

                            if let Some(delay) = process.auto_restart.next_delay(now) {
                                process.pending_restart = Some(now + delay);
                            } else if process.config.autorestart {
                                tracing::warn!(
                                    process = %process.name,
                                    "restart limit reached, leaving process down"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(process = %process.name, "failed to poll child: {}", e);
                        }
                    }
                }

                if process.pending_restart.is_some_and(|at| at <= now) {
                    process.auto_restart.record(now);
                    match Self::launch(&self.bus, process).await {
                        Ok(()) => {
                            process.stats.restarts += 1;
                            events.push((process.name.clone(), process.numeric_id, "restart"));
                            events.push((process.name.clone(), process.numeric_id, "online"));
                        }
                        Err(e) => {
                            process.pending_restart = None;
                            tracing::error!(process = %process.name, "automatic restart failed: {}", e);
                        }
                    }
                }
            }
        }

        for (name, id, event) in events {
            self.emit(&name, id, event);
        }
    }

    pub(crate) async fn update_stats(&self) {
        let mut registry = self.registry.write().await;
        let Registry {
            processes, monitor, ..
        } = &mut *registry;
        monitor.update_all_stats(processes.values_mut());
    }

    /// Stop every running process
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .processes
                .values()
                .filter(|p| p.is_running())
                .map(|p| p.name.clone())
                .collect()
        };

        tracing::info!("Stopping {} processes gracefully", names.len());

        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::error!(process = %name, "failed to stop process: {}", e);
            }
        }
    }
}

impl Default for LocalProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessAdapter for LocalProcessManager {
    async fn list(&self) -> Result<Vec<SupervisedProcess>> {
        let registry = self.registry.read().await;
        let mut list: Vec<SupervisedProcess> =
            registry.processes.values().map(|p| p.snapshot()).collect();
        list.sort_by_key(|p| p.numeric_id);
        Ok(list)
    }

    async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>> {
        let registry = self.registry.read().await;
        Ok(registry.processes.get(name).map(|p| p.snapshot()))
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        spec.validate()?;

        let mut launched = Vec::new();
        {
            let mut registry = self.registry.write().await;
            let registry = &mut *registry;

            for instance in spec.expand_instances() {
                let name = instance.name.clone();
                match registry.processes.get(&name).map(|p| p.is_running()) {
                    Some(true) => return Err(WardenError::ProcessAlreadyExists(name)),
                    Some(false) => {
                        if let Some(existing) = registry.processes.get_mut(&name) {
                            existing.auto_restart = AutoRestart::for_config(&instance);
                            existing.config = instance;
                            existing.note = None;
                        }
                    }
                    None => {
                        let id = registry.next_id;
                        registry.next_id += 1;
                        registry
                            .processes
                            .insert(name.clone(), ManagedProcess::new(id, instance, now_ms()));
                    }
                }

                let process = registry
                    .processes
                    .get_mut(&name)
                    .ok_or_else(|| WardenError::ProcessNotFound(name.clone()))?;
                Self::launch(&self.bus, process).await?;
                launched.push((name, process.numeric_id));
            }
        }

        for (name, id) in launched {
            self.emit(&name, id, "online");
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.terminate(name).await?;

        let numeric_id = {
            let mut registry = self.registry.write().await;
            let process = registry
                .processes
                .get_mut(name)
                .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;
            Self::launch(&self.bus, process).await?;
            process.stats.restarts += 1;
            process.numeric_id
        };

        tracing::info!(process = %name, "process restarted");
        self.emit(name, numeric_id, "restart");
        self.emit(name, numeric_id, "online");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let numeric_id = self.terminate(name).await?;
        tracing::info!(process = %name, "process stopped");
        self.emit(name, numeric_id, "stop");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let numeric_id = self.terminate(name).await?;
        self.registry.write().await.processes.remove(name);
        tracing::info!(process = %name, "process deleted");
        self.emit(name, numeric_id, "delete");
        Ok(())
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let process = registry
            .processes
            .get_mut(name)
            .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;

        if key == "note" {
            process.note = Some(value.to_string());
        } else {
            process.config.env.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn send_signal(&self, signal_name: &str, name: &str) -> Result<()> {
        let sig = Self::parse_signal(signal_name)?;
        let pid = {
            let registry = self.registry.read().await;
            let process = registry
                .processes
                .get(name)
                .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;
            process
                .stats
                .pid
                .ok_or_else(|| WardenError::SignalError(format!("{} is not running", name)))?
        };

        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| WardenError::SignalError(format!("Failed to send {} to {}: {}", sig, name, e)))
    }

    async fn send_message(&self, numeric_id: u32, payload: &serde_json::Value) -> Result<()> {
        let stdin = {
            let registry = self.registry.read().await;
            let process = registry
                .processes
                .values()
                .find(|p| p.numeric_id == numeric_id)
                .ok_or_else(|| WardenError::ProcessNotFound(numeric_id.to_string()))?;
            process.stdin.clone().ok_or_else(|| {
                WardenError::call_failed("send_message", format!("{} has no open stdin", process.name))
            })?
        };

        let mut line = serde_json::to_vec(payload)
            .map_err(|e| WardenError::SerializationError(e.to_string()))?;
        line.push(b'\n');

        let mut stdin = stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn dump(&self) -> Result<()> {
        #[derive(Serialize)]
        struct FleetDump<'a> {
            processes: Vec<&'a ProcessConfig>,
        }

        let Some(ref path) = self.dump_path else {
            tracing::debug!("no dump path configured, skipping dump");
            return Ok(());
        };

        let contents = {
            let registry = self.registry.read().await;
            let mut entries: Vec<&ManagedProcess> = registry.processes.values().collect();
            entries.sort_by_key(|p| p.numeric_id);
            let dump = FleetDump {
                processes: entries.iter().map(|p| &p.config).collect(),
            };
            serde_json::to_vec_pretty(&dump)
                .map_err(|e| WardenError::SerializationError(e.to_string()))?
        };

        tokio::fs::write(path, contents).await?;
        tracing::info!(path = %path.display(), "fleet dumped");
        Ok(())
    }

    fn bus(&self) -> Result<broadcast::Receiver<BusRecord>> {
        Ok(self.bus.subscribe())
    }
}
