use crate::adapter::ExecMode;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Fatal,
}

/// One logged watchdog occurrence
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchdogEvent {
    WatchdogStarted {
        poll_seconds: u64,
        cpu_limit: f64,
        mem_limit_mb: f64,
        cooldown_seconds: u64,
        max_interventions: usize,
        intervention_window_ms: u64,
        exclude: Vec<String>,
    },
    LimitExceeded {
        process: String,
        pm_id: u32,
        cpu: f64,
        cpu_limit: f64,
        mem_mb: f64,
        mem_limit_mb: f64,
        mode: ExecMode,
        intervention_count: usize,
    },
    MaxInterventionsExceeded {
        process: String,
        intervention_count: usize,
    },
    ProcessDeleted {
        process: String,
    },
    DeleteFailed {
        process: String,
        error: String,
    },
    SignalFailed {
        process: String,
        error: String,
    },
    IpcFailed {
        process: String,
        error: String,
    },
    Reloaded {
        process: String,
    },
    Restarted {
        process: String,
    },
    RestartFailed {
        process: String,
        error: String,
    },
    ProcCheckError {
        process: String,
        error: String,
    },
    PollError {
        error: String,
    },
    StartupFailed {
        error: String,
    },
}

impl WatchdogEvent {
    pub fn level(&self) -> EventLevel {
        match self {
            WatchdogEvent::WatchdogStarted { .. }
            | WatchdogEvent::LimitExceeded { .. }
            | WatchdogEvent::ProcessDeleted { .. }
            | WatchdogEvent::Reloaded { .. }
            | WatchdogEvent::Restarted { .. } => EventLevel::Info,
            WatchdogEvent::SignalFailed { .. } | WatchdogEvent::IpcFailed { .. } => EventLevel::Warn,
            WatchdogEvent::MaxInterventionsExceeded { .. }
            | WatchdogEvent::DeleteFailed { .. }
            | WatchdogEvent::RestartFailed { .. }
            | WatchdogEvent::ProcCheckError { .. }
            | WatchdogEvent::PollError { .. } => EventLevel::Error,
            WatchdogEvent::StartupFailed { .. } => EventLevel::Fatal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WatchdogEvent::WatchdogStarted { .. } => "watchdog_started",
            WatchdogEvent::LimitExceeded { .. } => "limit_exceeded",
            WatchdogEvent::MaxInterventionsExceeded { .. } => "max_interventions_exceeded",
            WatchdogEvent::ProcessDeleted { .. } => "process_deleted",
            WatchdogEvent::DeleteFailed { .. } => "delete_failed",
            WatchdogEvent::SignalFailed { .. } => "signal_failed",
            WatchdogEvent::IpcFailed { .. } => "ipc_failed",
            WatchdogEvent::Reloaded { .. } => "reloaded",
            WatchdogEvent::Restarted { .. } => "restarted",
            WatchdogEvent::RestartFailed { .. } => "restart_failed",
            WatchdogEvent::ProcCheckError { .. } => "proc_check_error",
            WatchdogEvent::PollError { .. } => "poll_error",
            WatchdogEvent::StartupFailed { .. } => "startup_failed",
        }
    }

    /// Process the event concerns, if any
    pub fn process(&self) -> Option<&str> {
        match self {
            WatchdogEvent::LimitExceeded { process, .. }
            | WatchdogEvent::MaxInterventionsExceeded { process, .. }
            | WatchdogEvent::ProcessDeleted { process }
            | WatchdogEvent::DeleteFailed { process, .. }
            | WatchdogEvent::SignalFailed { process, .. }
            | WatchdogEvent::IpcFailed { process, .. }
            | WatchdogEvent::Reloaded { process }
            | WatchdogEvent::Restarted { process }
            | WatchdogEvent::RestartFailed { process, .. }
            | WatchdogEvent::ProcCheckError { process, .. } => Some(process),
            WatchdogEvent::WatchdogStarted { .. }
            | WatchdogEvent::PollError { .. }
            | WatchdogEvent::StartupFailed { .. } => None,
        }
    }
}

/// Receives every watchdog event
pub trait WatchdogSink: Send + Sync {
    fn record(&self, event: &WatchdogEvent);
}

/// Logs each event through `tracing` at the level the event declares
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl WatchdogSink for TracingSink {
    fn record(&self, event: &WatchdogEvent) {
        let detail = serde_json::to_string(event).unwrap_or_default();
        let process = event.process().unwrap_or("");
        match event.level() {
            EventLevel::Info => {
                tracing::info!(event = event.name(), process, "{}", detail)
            }
            EventLevel::Warn => {
                tracing::warn!(event = event.name(), process, "{}", detail)
            }
            EventLevel::Error | EventLevel::Fatal => {
                tracing::error!(event = event.name(), process, level = ?event.level(), "{}", detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = WatchdogEvent::LimitExceeded {
            process: "worker_7".to_string(),
            pm_id: 7,
            cpu: 12.0,
            cpu_limit: 85.0,
            mem_mb: 2048.5,
            mem_limit_mb: 1024.0,
            mode: ExecMode::Fork,
            intervention_count: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "limit_exceeded");
        assert_eq!(json["process"], "worker_7");
        assert_eq!(json["mode"], "fork");
        assert_eq!(event.name(), "limit_exceeded");
        assert_eq!(event.level(), EventLevel::Info);
    }

    #[test]
    fn test_levels() {
        let startup = WatchdogEvent::StartupFailed {
            error: "unreachable".to_string(),
        };
        assert_eq!(startup.level(), EventLevel::Fatal);
        assert_eq!(startup.process(), None);

        let ipc = WatchdogEvent::IpcFailed {
            process: "a".to_string(),
            error: "closed".to_string(),
        };
        assert_eq!(ipc.level(), EventLevel::Warn);
        assert_eq!(ipc.process(), Some("a"));
    }
}
