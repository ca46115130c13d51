// Watchdog control loop - detects processes over their resource limits and remediates

mod events;
mod history;
mod limits;

pub use events::{EventLevel, TracingSink, WatchdogEvent, WatchdogSink};
pub use history::InterventionHistory;
pub use limits::{is_excluded, Measurement, CPU_LIMIT_ENV, MEM_LIMIT_ENV};

use crate::adapter::{ProcessAdapter, SupervisedProcess};
use crate::config::WatchdogConfig;
use crate::error::{Result, WardenError};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

/// Signal asking a process to drop its caches
pub const CLEANUP_SIGNAL: &str = "SIGUSR2";

/// What one remediation ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    Restarted,
    Reloaded,
    RestartFailed,
    Deleted,
    DeleteFailed,
}

pub struct Watchdog {
    adapter: Arc<dyn ProcessAdapter>,
    config: WatchdogConfig,
    sink: Arc<dyn WatchdogSink>,
    history: InterventionHistory,
}

impl Watchdog {
    pub fn new(adapter: Arc<dyn ProcessAdapter>, config: WatchdogConfig) -> Self {
        Self::with_sink(adapter, config, Arc::new(TracingSink))
    }

    pub fn with_sink(
        adapter: Arc<dyn ProcessAdapter>,
        config: WatchdogConfig,
        sink: Arc<dyn WatchdogSink>,
    ) -> Self {
        let history = InterventionHistory::new(config.intervention_window, config.cooldown);
        Self {
            adapter,
            config,
            sink,
            history,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn history(&self) -> &InterventionHistory {
        &self.history
    }

    fn emit(&self, event: WatchdogEvent) {
        self.sink.record(&event);
    }

    /// Verify the process manager is reachable, then tick forever
    ///
    /// Returns only on a startup failure, which callers treat as fatal.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.connect().await {
            self.emit(WatchdogEvent::StartupFailed {
                error: e.to_string(),
            });
            return Err(e);
        }

        self.emit(WatchdogEvent::WatchdogStarted {
            poll_seconds: self.config.poll_interval.as_secs(),
            cpu_limit: self.config.cpu_limit,
            mem_limit_mb: self.config.mem_limit_mb,
            cooldown_seconds: self.config.cooldown.as_secs(),
            max_interventions: self.config.max_interventions,
            intervention_window_ms: self.config.intervention_window.as_millis() as u64,
            exclude: self.config.exclude.clone(),
        });

        tokio::time::sleep(self.config.startup_delay).await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn connect(&self) -> Result<()> {
        // Both the push channel and the list call must answer before the loop starts.
        drop(self.adapter.bus()?);
        self.adapter.list().await?;
        Ok(())
    }

    /// One pass over the fleet; returns the remediations started
    pub async fn tick(&mut self) -> Vec<(String, Remediation)> {
        let processes = match self.adapter.list().await {
            Ok(processes) => processes,
            Err(e) => {
                self.emit(WatchdogEvent::PollError {
                    error: e.to_string(),
                });
                return Vec::new();
            }
        };

        self.history.prune(Instant::now());

        let mut outcomes = Vec::new();
        for process in &processes {
            match self.check(process).await {
                Ok(Some(outcome)) => outcomes.push((process.name.clone(), outcome)),
                Ok(None) => {}
                Err(e) => self.emit(WatchdogEvent::ProcCheckError {
                    process: process.name.clone(),
                    error: e.to_string(),
                }),
            }
        }
        outcomes
    }

    async fn check(&mut self, process: &SupervisedProcess) -> Result<Option<Remediation>> {
        if process.name.is_empty() {
            return Err(WardenError::Internal(format!(
                "process {} has no name",
                process.numeric_id
            )));
        }
        if is_excluded(&process.name, &self.config.exclude) || process.is_stopped_by_user() {
            return Ok(None);
        }

        let measurement = Measurement::of(process, &self.config);
        if !measurement.is_over() || self.history.in_cooldown(&process.name, Instant::now()) {
            return Ok(None);
        }

        Ok(Some(self.intervene(process, &measurement).await))
    }

    async fn intervene(&mut self, process: &SupervisedProcess, measurement: &Measurement) -> Remediation {
        let name = process.name.as_str();
        let now = Instant::now();
        self.history.set_cooldown(name, now);
        let count = self.history.track(name, now);

        self.emit(WatchdogEvent::LimitExceeded {
            process: name.to_string(),
            pm_id: process.numeric_id,
            cpu: measurement.cpu,
            cpu_limit: measurement.cpu_limit,
            mem_mb: (measurement.mem_mb * 10.0).round() / 10.0,
            mem_limit_mb: measurement.mem_limit_mb,
            mode: process.exec_mode,
            intervention_count: count,
        });

        if count > self.config.max_interventions {
            self.emit(WatchdogEvent::MaxInterventionsExceeded {
                process: name.to_string(),
                intervention_count: count,
            });
            return match self.escalate(name).await {
                Ok(()) => {
                    self.emit(WatchdogEvent::ProcessDeleted {
                        process: name.to_string(),
                    });
                    Remediation::Deleted
                }
                Err(e) => {
                    self.emit(WatchdogEvent::DeleteFailed {
                        process: name.to_string(),
                        error: e.to_string(),
                    });
                    Remediation::DeleteFailed
                }
            };
        }

        self.request_cleanup(process).await;

        let cluster = process.exec_mode.is_cluster();
        let result = if cluster {
            self.adapter.reload(name).await
        } else {
            self.adapter.restart(name).await
        };

        match result {
            Ok(()) if cluster => {
                self.emit(WatchdogEvent::Reloaded {
                    process: name.to_string(),
                });
                Remediation::Reloaded
            }
            Ok(()) => {
                self.emit(WatchdogEvent::Restarted {
                    process: name.to_string(),
                });
                Remediation::Restarted
            }
            Err(e) => {
                self.emit(WatchdogEvent::RestartFailed {
                    process: name.to_string(),
                    error: e.to_string(),
                });
                Remediation::RestartFailed
            }
        }
    }

    async fn escalate(&self, name: &str) -> Result<()> {
        self.adapter
            .delete(name)
            .await
            .map_err(|e| WardenError::EscalationDeleteFailed(name.to_string(), e.to_string()))
    }

    /// Best-effort signal and IPC cache cleanup, then a short wait for it to run
    async fn request_cleanup(&self, process: &SupervisedProcess) {
        let name = process.name.as_str();

        if let Err(e) = self.adapter.send_signal(CLEANUP_SIGNAL, name).await {
            self.emit(WatchdogEvent::SignalFailed {
                process: name.to_string(),
                error: e.to_string(),
            });
        }

        let message = serde_json::json!({ "action": "clean-cache" });
        if let Err(e) = self.adapter.send_message(process.numeric_id, &message).await {
            self.emit(WatchdogEvent::IpcFailed {
                process: name.to_string(),
                error: e.to_string(),
            });
        }

        tokio::time::sleep(self.config.cleanup_wait).await;
    }
}
