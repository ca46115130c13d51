use crate::config::RateLimitConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-key window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Open,
    Blocked { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit inside the current window
    Limited,
    /// Serving a penalty block
    Blocked { until: Instant },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    count: u32,
    window_start: Instant,
    state: WindowState,
    last_seen: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            state: WindowState::Open,
            last_seen: now,
        }
    }

    fn check(&mut self, rate: RateLimitConfig, block: Duration, now: Instant) -> RateDecision {
        self.last_seen = now;

        if let WindowState::Blocked { until } = self.state {
            if now < until {
                return RateDecision::Blocked { until };
            }
            self.state = WindowState::Open;
            self.count = 0;
            self.window_start = now;
        }

        if now.duration_since(self.window_start) > rate.window {
            self.window_start = now;
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);

        if self.count > rate.limit.saturating_mul(2) {
            let until = now + block;
            self.state = WindowState::Blocked { until };
            return RateDecision::Blocked { until };
        }

        if self.count <= rate.limit {
            RateDecision::Allowed
        } else {
            RateDecision::Limited
        }
    }
}

/// Key table bounded in size; overflow evicts the oldest inserted key
#[derive(Debug, Default)]
struct KeyTable {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

impl KeyTable {
    fn check(
        &mut self,
        key: &str,
        rate: RateLimitConfig,
        block: Duration,
        max_keys: usize,
        now: Instant,
    ) -> RateDecision {
        if !self.entries.contains_key(key) {
            self.entries.insert(key.to_string(), Entry::new(now));
            self.order.push_back(key.to_string());
            self.enforce_capacity(max_keys);
        }

        match self.entries.get_mut(key) {
            Some(entry) => entry.check(rate, block, now),
            // evicted straight away by a zero capacity; treat as a fresh key
            None => Entry::new(now).check(rate, block, now),
        }
    }

    fn enforce_capacity(&mut self, max_keys: usize) {
        while self.entries.len() > max_keys {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn sweep(&mut self, ttl: Duration, max_keys: usize, now: Instant) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) <= ttl);
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
        self.enforce_capacity(max_keys);
    }
}

/// Sliding-window limiter keyed jointly by client IP and token subject
#[derive(Debug)]
pub struct RateLimiter {
    block_duration: Duration,
    max_keys: usize,
    key_ttl: Duration,
    ips: Mutex<KeyTable>,
    subjects: Mutex<KeyTable>,
}

impl RateLimiter {
    pub fn new(block_duration: Duration, max_keys: usize, key_ttl: Duration) -> Self {
        Self {
            block_duration,
            max_keys,
            key_ttl,
            ips: Mutex::new(KeyTable::default()),
            subjects: Mutex::new(KeyTable::default()),
        }
    }

    pub fn check(&self, ip: &str, subject: &str, rate: RateLimitConfig) -> bool {
        self.check_at(ip, subject, rate, Instant::now())
    }

    /// Both keys are always counted; the request passes only if both allow it
    pub fn check_at(&self, ip: &str, subject: &str, rate: RateLimitConfig, now: Instant) -> bool {
        let ip = if ip.is_empty() { "unknown" } else { ip };
        let subject = if subject.is_empty() { "unknown" } else { subject };

        let by_ip = lock(&self.ips).check(ip, rate, self.block_duration, self.max_keys, now);
        let by_subject =
            lock(&self.subjects).check(subject, rate, self.block_duration, self.max_keys, now);

        if !by_ip.is_allowed() || !by_subject.is_allowed() {
            tracing::debug!(ip, subject, ?by_ip, ?by_subject, "rate limited");
        }
        by_ip.is_allowed() && by_subject.is_allowed()
    }

    /// Drop keys idle beyond the TTL and re-apply the key cap
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        lock(&self.ips).sweep(self.key_ttl, self.max_keys, now);
        lock(&self.subjects).sweep(self.key_ttl, self.max_keys, now);
    }

    /// Tracked (ip, subject) key counts
    pub fn tracked(&self) -> (usize, usize) {
        (lock(&self.ips).entries.len(), lock(&self.subjects).entries.len())
    }

    pub fn ip_state(&self, ip: &str) -> Option<WindowState> {
        lock(&self.ips).entries.get(ip).map(|e| e.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
