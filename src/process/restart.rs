use crate::config::ProcessConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const BUDGET_WINDOW: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Crash-restart budget of one local process with exponential backoff
///
/// The reaper asks for a delay when a child exits on its own; `None` leaves the process down.
#[derive(Debug, Clone)]
pub struct AutoRestart {
    enabled: bool,
    budget: usize,
    window: Duration,
    base_delay: Duration,
    history: VecDeque<Instant>,
}

impl AutoRestart {
    pub fn for_config(config: &ProcessConfig) -> Self {
        Self {
            enabled: config.autorestart,
            budget: config.max_restarts,
            window: BUDGET_WINDOW,
            base_delay: config.restart_delay(),
            history: VecDeque::new(),
        }
    }

    /// Delay before relaunching after an exit at `now`, if the budget allows one
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        self.forget_before(now);
        if !self.enabled || self.history.len() >= self.budget {
            return None;
        }

        let exponent = self.history.len().min(16) as u32;
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);
        Some(delay)
    }

    pub fn record(&mut self, at: Instant) {
        self.history.push_back(at);
    }

    /// Restarts still inside the budget window
    pub fn recent(&self, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|&&at| now.duration_since(at) < self.window)
            .count()
    }

    fn forget_before(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) < self.window {
                break;
            }
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crashing(autorestart: bool, max_restarts: usize) -> AutoRestart {
        let mut config = ProcessConfig::new("bot", "/bin/false");
        config.autorestart = autorestart;
        config.max_restarts = max_restarts;
        config.restart_delay_secs = 1;
        AutoRestart::for_config(&config)
    }

    #[test]
    fn test_disabled_never_restarts() {
        assert_eq!(crashing(false, 10).next_delay(Instant::now()), None);
    }

    #[test]
    fn test_budget_and_backoff() {
        let mut auto = crashing(true, 3);
        let now = Instant::now();

        assert_eq!(auto.next_delay(now), Some(Duration::from_secs(1)));
        auto.record(now);
        assert_eq!(auto.next_delay(now), Some(Duration::from_secs(2)));
        auto.record(now);
        assert_eq!(auto.next_delay(now), Some(Duration::from_secs(4)));
        auto.record(now);
        assert_eq!(auto.next_delay(now), None);
        assert_eq!(auto.recent(now), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut auto = crashing(true, 100);
        let now = Instant::now();
        for _ in 0..10 {
            auto.record(now);
        }
        assert_eq!(auto.next_delay(now), Some(MAX_BACKOFF));
    }

    #[test]
    fn test_budget_recovers_after_window() {
        let mut auto = crashing(true, 1);
        let start = Instant::now();
        auto.record(start);
        assert_eq!(auto.next_delay(start), None);

        let later = start + BUDGET_WINDOW;
        assert_eq!(auto.next_delay(later), Some(Duration::from_secs(1)));
        assert_eq!(auto.recent(later), 0);
    }
}
