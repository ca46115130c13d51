use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-process breach timestamps and last-action cooldown
#[derive(Debug, Clone)]
pub struct InterventionHistory {
    window: Duration,
    cooldown: Duration,
    breaches: HashMap<String, Vec<Instant>>,
    last_action: HashMap<String, Instant>,
}

impl InterventionHistory {
    pub fn new(window: Duration, cooldown: Duration) -> Self {
        Self {
            window,
            cooldown,
            breaches: HashMap::new(),
            last_action: HashMap::new(),
        }
    }

    pub fn in_cooldown(&self, name: &str, now: Instant) -> bool {
        self.last_action
            .get(name)
            .is_some_and(|&at| now.duration_since(at) <= self.cooldown)
    }

    pub fn set_cooldown(&mut self, name: &str, now: Instant) {
        self.last_action.insert(name.to_string(), now);
    }

    /// Record a breach and return how many breaches remain inside the window
    pub fn track(&mut self, name: &str, now: Instant) -> usize {
        let window = self.window;
        let history = self.breaches.entry(name.to_string()).or_default();
        history.retain(|&at| now.duration_since(at) < window);
        history.push(now);
        history.len()
    }

    pub fn count(&self, name: &str, now: Instant) -> usize {
        self.breaches.get(name).map_or(0, |history| {
            history
                .iter()
                .filter(|&&at| now.duration_since(at) < self.window)
                .count()
        })
    }

    /// Forget names whose breaches and cooldown have both aged out
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        let cooldown = self.cooldown;
        self.breaches.retain(|_, history| {
            history.retain(|&at| now.duration_since(at) < window);
            !history.is_empty()
        });
        self.last_action
            .retain(|_, &mut at| now.duration_since(at) <= cooldown);
    }

    pub fn tracked(&self) -> usize {
        self.breaches.len()
    }
}
