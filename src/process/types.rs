use crate::adapter::{ProcessStatus, SupervisedProcess};
use crate::config::ProcessConfig;
use crate::process::restart::AutoRestart;
use crate::process::spawner::SpawnedProcess;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

/// A run that ends sooner than this counts as unstable
const MIN_UPTIME_MS: i64 = 1000;

#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub pid: Option<u32>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub restarts: u32,
    pub unstable_restarts: u32,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

impl ProcessStats {
    pub fn new(now_ms: i64) -> Self {
        Self {
            created_at: now_ms,
            ..Default::default()
        }
    }

    pub fn record_start(&mut self, pid: u32, now_ms: i64) {
        self.pid = Some(pid);
        self.started_at = Some(now_ms);
        self.cpu_usage = 0.0;
        self.memory_usage = 0;
        self.exit_code = None;
        self.exit_signal = None;
    }

    pub fn record_exit(&mut self, code: Option<i32>, signal: Option<String>, now_ms: i64) {
        if let Some(started) = self.started_at {
            if now_ms - started < MIN_UPTIME_MS {
                self.unstable_restarts += 1;
            }
        }
        self.pid = None;
        self.cpu_usage = 0.0;
        self.memory_usage = 0;
        self.exit_code = code;
        self.exit_signal = signal;
    }
}

/// One entry of the local fleet
#[derive(Debug)]
pub struct ManagedProcess {
    pub numeric_id: u32,
    pub name: String,
    pub config: ProcessConfig,
    pub status: ProcessStatus,
    pub child: Option<Child>,
    pub stdin: Option<Arc<Mutex<ChildStdin>>>,
    pub stats: ProcessStats,
    pub note: Option<String>,
    pub auto_restart: AutoRestart,
    /// Set when the reaper has scheduled an automatic restart
    pub pending_restart: Option<Instant>,
}

impl ManagedProcess {
    pub fn new(numeric_id: u32, config: ProcessConfig, now_ms: i64) -> Self {
        let auto_restart = AutoRestart::for_config(&config);

        Self {
            numeric_id,
            name: config.name.clone(),
            config,
            status: ProcessStatus::Launching,
            child: None,
            stdin: None,
            stats: ProcessStats::new(now_ms),
            note: None,
            auto_restart,
            pending_restart: None,
        }
    }

    pub fn attach(&mut self, spawned: SpawnedProcess, now_ms: i64) {
        self.stats.record_start(spawned.pid, now_ms);
        self.stdin = spawned.stdin.map(|s| Arc::new(Mutex::new(s)));
        self.child = Some(spawned.child);
        self.pending_restart = None;
        self.status = ProcessStatus::Online;
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Read-only view handed out through the adapter contract
    pub fn snapshot(&self) -> SupervisedProcess {
        let mut env = self.config.env.clone();
        if let Some(ref note) = self.note {
            env.insert("note".to_string(), note.clone());
        }

        SupervisedProcess {
            name: self.name.clone(),
            numeric_id: self.numeric_id,
            exec_mode: self.config.exec_mode,
            status: self.status,
            cpu_percent: f64::from(self.stats.cpu_usage),
            memory_bytes: self.stats.memory_usage,
            pid: self.stats.pid,
            restart_count: self.stats.restarts,
            unstable_restarts: self.stats.unstable_restarts,
            created_at: Some(self.stats.created_at),
            started_at: self.stats.started_at,
            note: self.note.clone(),
            env,
            exit_code: self.stats.exit_code,
            exit_signal: self.stats.exit_signal.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_run_counts_as_unstable() {
        let mut stats = ProcessStats::new(0);
        stats.record_start(42, 1_000);
        stats.record_exit(Some(1), None, 1_200);
        assert_eq!(stats.unstable_restarts, 1);
        assert_eq!(stats.pid, None);
        assert_eq!(stats.exit_code, Some(1));

        stats.record_start(43, 2_000);
        stats.record_exit(None, Some("SIGKILL".to_string()), 10_000);
        assert_eq!(stats.unstable_restarts, 1);
        assert_eq!(stats.exit_signal.as_deref(), Some("SIGKILL"));
    }

    #[test]
    fn test_snapshot_exposes_note_in_env() {
        let config = ProcessConfig::new("bot", "/bin/sleep");
        let mut process = ManagedProcess::new(7, config, 0);
        process.note = Some("stopped-by-user".to_string());

        let snap = process.snapshot();
        assert_eq!(snap.numeric_id, 7);
        assert!(snap.is_stopped_by_user());
        assert_eq!(snap.env_var("note"), Some("stopped-by-user"));
        assert_eq!(snap.status, ProcessStatus::Launching);
    }
}
