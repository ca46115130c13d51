// Process manager adapter - the contract the core uses to see and steer the fleet

mod timed;

#[cfg(test)]
pub(crate) mod fake;

pub use timed::{CallTimeouts, TimedAdapter};

use crate::config::ProcessConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Note value that marks a process as intentionally stopped
pub const STOPPED_BY_USER: &str = "stopped-by-user";

/// Definition accepted by [`ProcessAdapter::start`]
pub type StartSpec = ProcessConfig;

/// How a process is executed by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    #[default]
    #[serde(alias = "fork_mode")]
    Fork,
    #[serde(alias = "cluster_mode")]
    Cluster,
}

impl ExecMode {
    /// Parse the manager's textual mode; anything that is not cluster runs forked
    pub fn parse(value: &str) -> Self {
        match value {
            "cluster" | "cluster_mode" => ExecMode::Cluster,
            _ => ExecMode::Fork,
        }
    }

    pub fn is_cluster(&self) -> bool {
        *self == ExecMode::Cluster
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => write!(f, "fork"),
            ExecMode::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    OneLaunchStatus,
    #[default]
    Unknown,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Online => "online",
            ProcessStatus::Launching => "launching",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
            ProcessStatus::OneLaunchStatus => "one-launch-status",
            ProcessStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Snapshot of one process as reported by the manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisedProcess {
    pub name: String,
    pub numeric_id: u32,
    pub exec_mode: ExecMode,
    pub status: ProcessStatus,
    pub cpu_percent: f64,
    /// Memory the manager accounts to the process, in bytes
    pub memory_bytes: u64,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub unstable_restarts: u32,
    /// Epoch milliseconds
    pub created_at: Option<i64>,
    /// Epoch milliseconds of the current run
    pub started_at: Option<i64>,
    pub note: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

impl SupervisedProcess {
    pub fn is_stopped_by_user(&self) -> bool {
        self.note.as_deref() == Some(STOPPED_BY_USER)
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / 1024.0 / 1024.0
    }

    /// Time since the current run started; zero when not running
    pub fn uptime_ms(&self, now_ms: i64) -> i64 {
        match (self.status, self.started_at) {
            (ProcessStatus::Online, Some(started)) => (now_ms - started).max(0),
            _ => 0,
        }
    }
}

/// Raw record pushed by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub process_name: String,
    pub numeric_id: u32,
    pub payload: BusPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusPayload {
    /// One stdout line
    Log(String),
    /// One stderr line
    ErrorLog(String),
    /// Lifecycle event name such as `online`, `exit`, `restart`
    Lifecycle(String),
}

impl BusRecord {
    pub fn log(name: impl Into<String>, numeric_id: u32, line: impl Into<String>) -> Self {
        Self {
            process_name: name.into(),
            numeric_id,
            payload: BusPayload::Log(line.into()),
        }
    }

    pub fn error_log(name: impl Into<String>, numeric_id: u32, line: impl Into<String>) -> Self {
        Self {
            process_name: name.into(),
            numeric_id,
            payload: BusPayload::ErrorLog(line.into()),
        }
    }

    pub fn lifecycle(name: impl Into<String>, numeric_id: u32, event: impl Into<String>) -> Self {
        Self {
            process_name: name.into(),
            numeric_id,
            payload: BusPayload::Lifecycle(event.into()),
        }
    }
}

/// Operations the core needs from a process manager
///
/// Implementations may be slow; callers wrap them in [`TimedAdapter`].
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    async fn list(&self) -> Result<Vec<SupervisedProcess>>;

    /// `Ok(None)` when no process has that name
    async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>>;

    async fn start(&self, spec: &StartSpec) -> Result<()>;

    async fn restart(&self, name: &str) -> Result<()>;

    /// Zero-downtime restart for cluster processes
    async fn reload(&self, name: &str) -> Result<()> {
        self.restart(name).await
    }

    async fn stop(&self, name: &str) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()>;

    async fn send_signal(&self, signal: &str, name: &str) -> Result<()>;

    async fn send_message(&self, numeric_id: u32, payload: &serde_json::Value) -> Result<()>;

    /// Persist the current process list
    async fn dump(&self) -> Result<()>;

    /// Subscribe to the manager's push channel
    fn bus(&self) -> Result<broadcast::Receiver<BusRecord>>;
}

#[async_trait]
impl<A: ProcessAdapter + ?Sized> ProcessAdapter for Arc<A> {
    async fn list(&self) -> Result<Vec<SupervisedProcess>> {
        (**self).list().await
    }

    async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>> {
        (**self).describe(name).await
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        (**self).start(spec).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        (**self).restart(name).await
    }

    async fn reload(&self, name: &str) -> Result<()> {
        (**self).reload(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        (**self).stop(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()> {
        (**self).set_env(name, key, value).await
    }

    async fn send_signal(&self, signal: &str, name: &str) -> Result<()> {
        (**self).send_signal(signal, name).await
    }

    async fn send_message(&self, numeric_id: u32, payload: &serde_json::Value) -> Result<()> {
        (**self).send_message(numeric_id, payload).await
    }

    async fn dump(&self) -> Result<()> {
        (**self).dump().await
    }

    fn bus(&self) -> Result<broadcast::Receiver<BusRecord>> {
        (**self).bus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_mode_parse() {
        assert_eq!(ExecMode::parse("cluster"), ExecMode::Cluster);
        assert_eq!(ExecMode::parse("cluster_mode"), ExecMode::Cluster);
        assert_eq!(ExecMode::parse("fork_mode"), ExecMode::Fork);
        assert_eq!(ExecMode::parse(""), ExecMode::Fork);
    }

    #[test]
    fn test_exec_mode_serde_alias() {
        let mode: ExecMode = serde_json::from_str("\"cluster_mode\"").unwrap();
        assert!(mode.is_cluster());
        assert_eq!(serde_json::to_string(&ExecMode::Fork).unwrap(), "\"fork\"");
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ProcessStatus::OneLaunchStatus).unwrap(),
            "\"one-launch-status\""
        );
        assert_eq!(ProcessStatus::Errored.to_string(), "errored");
    }

    #[test]
    fn test_stopped_by_user_and_uptime() {
        let mut proc = SupervisedProcess {
            name: "bot".to_string(),
            status: ProcessStatus::Online,
            started_at: Some(1_000),
            memory_bytes: 2 * 1024 * 1024,
            ..Default::default()
        };
        assert!(!proc.is_stopped_by_user());
        assert_eq!(proc.uptime_ms(4_000), 3_000);
        assert_eq!(proc.memory_mb(), 2.0);

        proc.note = Some(STOPPED_BY_USER.to_string());
        proc.status = ProcessStatus::Stopped;
        assert!(proc.is_stopped_by_user());
        assert_eq!(proc.uptime_ms(4_000), 0);
    }
}
