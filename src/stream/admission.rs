use super::origin::OriginPolicy;
use super::rate_limit::RateLimiter;
use super::token::{TokenClaims, TokenSigner, DEFAULT_SCOPE};
use crate::config::StreamConfig;
use crate::error::{CapacityScope, Result, WardenError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Subject used when a token request carries no `x-user-id`
pub const FALLBACK_SUBJECT: &str = "dev-user";

#[derive(Debug, Clone, Copy)]
struct SubjectCount {
    active: usize,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct CounterState {
    global: usize,
    subjects: HashMap<String, SubjectCount>,
}

/// Global and per-subject concurrent stream counts
#[derive(Debug)]
pub struct ConnectionCounters {
    max_global: usize,
    max_per_subject: usize,
    idle_ttl: Duration,
    max_subjects: usize,
    state: Mutex<CounterState>,
}

impl ConnectionCounters {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            max_global: config.max_global,
            max_per_subject: config.max_per_subject,
            idle_ttl: config.subject_counter_ttl,
            max_subjects: config.subject_counter_max,
            state: Mutex::new(CounterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_locked(&self, state: &CounterState, subject: &str) -> Result<()> {
        if state.global >= self.max_global {
            return Err(WardenError::CapacityExceeded(CapacityScope::Global));
        }
        let active = state.subjects.get(subject).map_or(0, |c| c.active);
        if active >= self.max_per_subject {
            return Err(WardenError::CapacityExceeded(CapacityScope::Subject));
        }
        Ok(())
    }

    /// Capacity check without taking a slot
    pub fn check(&self, subject: &str) -> Result<()> {
        self.check_locked(&self.lock(), subject)
    }

    /// Take one global and one subject slot; the permit gives both back when dropped
    pub fn acquire(self: &Arc<Self>, subject: &str) -> Result<SessionPermit> {
        let mut state = self.lock();
        self.check_locked(&state, subject)?;

        state.global += 1;
        let now = Instant::now();
        let count = state
            .subjects
            .entry(subject.to_string())
            .or_insert(SubjectCount {
                active: 0,
                last_seen: now,
            });
        count.active += 1;
        count.last_seen = now;

        Ok(SessionPermit {
            counters: Arc::clone(self),
            subject: subject.to_string(),
            held: true,
        })
    }

    fn release(&self, subject: &str) {
        let mut state = self.lock();
        state.global = state.global.saturating_sub(1);
        if let Some(count) = state.subjects.get_mut(subject) {
            count.active = count.active.saturating_sub(1);
            count.last_seen = Instant::now();
        }
    }

    pub fn global(&self) -> usize {
        self.lock().global
    }

    pub fn subject(&self, subject: &str) -> usize {
        self.lock().subjects.get(subject).map_or(0, |c| c.active)
    }

    pub fn tracked_subjects(&self) -> usize {
        self.lock().subjects.len()
    }

    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Forget idle subjects; past the cap the longest-idle inactive subjects go first
    pub fn sweep_at(&self, now: Instant) {
        let mut state = self.lock();
        let ttl = self.idle_ttl;
        state
            .subjects
            .retain(|_, c| c.active > 0 || now.duration_since(c.last_seen) <= ttl);

        let excess = state.subjects.len().saturating_sub(self.max_subjects);
        if excess > 0 {
            let mut idle: Vec<(String, Instant)> = state
                .subjects
                .iter()
                .filter(|(_, c)| c.active == 0)
                .map(|(k, c)| (k.clone(), c.last_seen))
                .collect();
            idle.sort_by_key(|(_, seen)| *seen);
            for (key, _) in idle.into_iter().take(excess) {
                state.subjects.remove(&key);
            }
        }
    }
}

/// One admitted stream's hold on the connection counters
#[derive(Debug)]
pub struct SessionPermit {
    counters: Arc<ConnectionCounters>,
    subject: String,
    held: bool,
}

impl SessionPermit {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if std::mem::take(&mut self.held) {
            self.counters.release(&self.subject);
        }
    }
}

/// Request attributes the admission sequence looks at
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionRequest<'a> {
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub token: Option<&'a str>,
    pub ip: &'a str,
}

#[derive(Debug)]
pub struct Admitted {
    pub claims: TokenClaims,
    pub permit: SessionPermit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub subject: String,
}

/// Origin, token, capacity, rate and scope checks in front of every stream
#[derive(Debug)]
pub struct Gatekeeper {
    config: StreamConfig,
    origins: OriginPolicy,
    signer: TokenSigner,
    counters: Arc<ConnectionCounters>,
    limiter: RateLimiter,
}

impl Gatekeeper {
    pub fn new(config: StreamConfig, signer: TokenSigner) -> Self {
        Self {
            origins: OriginPolicy::new(config.environment, &config.allowed_origins),
            counters: Arc::new(ConnectionCounters::new(&config)),
            limiter: RateLimiter::new(config.block_duration, config.rate_max_keys, config.rate_key_ttl),
            signer,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn counters(&self) -> &Arc<ConnectionCounters> {
        &self.counters
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run the admission sequence; `process` is set for process-scoped streams
    ///
    /// Nothing is acquired unless every check passes.
    pub fn admit(&self, request: &AdmissionRequest<'_>, process: Option<&str>) -> Result<Admitted> {
        if !self.origins.allows(request.origin, request.referer) {
            return Err(WardenError::OriginRejected);
        }

        let claims = self.signer.verify(request.token)?;
        self.counters.check(&claims.subject)?;

        if !self
            .limiter
            .check(request.ip, &claims.subject, self.config.stream_rate)
        {
            return Err(WardenError::RateLimited);
        }

        if let Some(process) = process {
            if !claims.grants(process) {
                return Err(WardenError::Forbidden(format!(
                    "token for '{}' does not cover '{}'",
                    claims.subject, process
                )));
            }
        }

        let permit = self.counters.acquire(&claims.subject)?;
        Ok(Admitted { claims, permit })
    }

    /// Mint a token for the requesting observer
    pub fn issue_token(&self, request: &AdmissionRequest<'_>, subject: Option<&str>) -> Result<IssuedToken> {
        if !self.origins.allows(request.origin, request.referer) {
            return Err(WardenError::OriginRejected);
        }

        let subject = subject
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(FALLBACK_SUBJECT);

        if !self.limiter.check(request.ip, subject, self.config.token_rate) {
            return Err(WardenError::RateLimited);
        }

        let token = self.signer.issue(subject, self.config.token_ttl, DEFAULT_SCOPE)?;
        Ok(IssuedToken {
            token,
            subject: subject.to_string(),
        })
    }

    /// Periodic cleanup of rate-limit keys and idle subject counters
    pub fn sweep(&self) {
        self.limiter.sweep();
        self.counters.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::error::TokenRejection;

    fn config() -> StreamConfig {
        StreamConfig {
            environment: Environment::Production,
            max_global: 3,
            max_per_subject: 2,
            ..StreamConfig::default()
        }
    }

    fn gate(config: StreamConfig) -> Gatekeeper {
        Gatekeeper::new(config, TokenSigner::new("secret"))
    }

    fn token(gate: &Gatekeeper, subject: &str) -> String {
        gate.signer()
            .issue(subject, Duration::from_secs(60), DEFAULT_SCOPE)
            .unwrap()
    }

    fn request<'a>(token: Option<&'a str>, ip: &'a str) -> AdmissionRequest<'a> {
        AdmissionRequest {
            origin: Some("http://localhost:3000"),
            referer: None,
            token,
            ip,
        }
    }

    #[test]
    fn test_permit_releases_exactly_once() {
        let gate = gate(config());
        let counters = gate.counters();
        let permit = counters.acquire("alice").unwrap();
        assert_eq!(counters.global(), 1);
        assert_eq!(counters.subject("alice"), 1);

        drop(permit);
        assert_eq!(counters.global(), 0);
        assert_eq!(counters.subject("alice"), 0);
    }

    #[test]
    fn test_admission_order() {
        let gate = gate(config());
        let alice = token(&gate, "alice");

        let bad_origin = AdmissionRequest {
            origin: Some("http://evil.example"),
            ..request(Some("garbage"), "1.1.1.1")
        };
        assert!(matches!(gate.admit(&bad_origin, None), Err(WardenError::OriginRejected)));

        assert!(matches!(
            gate.admit(&request(None, "1.1.1.1"), None),
            Err(WardenError::InvalidToken(TokenRejection::Missing))
        ));

        let admitted = gate.admit(&request(Some(&alice), "1.1.1.1"), None).unwrap();
        assert_eq!(admitted.claims.subject, "alice");
        assert_eq!(gate.counters().global(), 1);
    }

    #[test]
    fn test_caps_reject_without_taking_slots() {
        let gate = gate(config());
        let alice = token(&gate, "alice");
        let bob = token(&gate, "bob");

        let a1 = gate.admit(&request(Some(&alice), "1.1.1.1"), None).unwrap();
        let a2 = gate.admit(&request(Some(&alice), "1.1.1.1"), None).unwrap();
        assert!(matches!(
            gate.admit(&request(Some(&alice), "1.1.1.1"), None),
            Err(WardenError::CapacityExceeded(CapacityScope::Subject))
        ));
        assert_eq!(gate.counters().subject("alice"), 2);

        let b1 = gate.admit(&request(Some(&bob), "2.2.2.2"), None).unwrap();
        assert!(matches!(
            gate.admit(&request(Some(&bob), "2.2.2.2"), None),
            Err(WardenError::CapacityExceeded(CapacityScope::Global))
        ));
        assert_eq!(gate.counters().global(), 3);

        drop((a1, a2, b1));
        assert_eq!(gate.counters().global(), 0);
    }

    #[test]
    fn test_process_scope() {
        let gate = gate(config());
        let bot = token(&gate, "bot_1");
        assert!(gate.admit(&request(Some(&bot), "1.1.1.1"), Some("bot_1")).is_ok());
        assert!(matches!(
            gate.admit(&request(Some(&bot), "1.1.1.1"), Some("bot_2")),
            Err(WardenError::Forbidden(_))
        ));
        // the scope failure happened before any slot was taken
        assert_eq!(gate.counters().global(), 0);
    }

    #[test]
    fn test_rate_limit_applies_per_stream_request() {
        let mut cfg = config();
        cfg.max_global = 1000;
        cfg.max_per_subject = 1000;
        cfg.stream_rate.limit = 2;
        let gate = gate(cfg);
        let alice = token(&gate, "alice");

        let _a = gate.admit(&request(Some(&alice), "1.1.1.1"), None).unwrap();
        let _b = gate.admit(&request(Some(&alice), "1.1.1.1"), None).unwrap();
        assert!(matches!(
            gate.admit(&request(Some(&alice), "1.1.1.1"), None),
            Err(WardenError::RateLimited)
        ));
        assert_eq!(gate.counters().global(), 2);
    }

    #[test]
    fn test_issue_token_defaults_subject() {
        let gate = gate(config());
        let issued = gate.issue_token(&request(None, "1.1.1.1"), None).unwrap();
        assert_eq!(issued.subject, FALLBACK_SUBJECT);
        let claims = gate.signer().verify(Some(&issued.token)).unwrap();
        assert_eq!(claims.subject, FALLBACK_SUBJECT);

        let issued = gate
            .issue_token(&request(None, "1.1.1.1"), Some("  carol "))
            .unwrap();
        assert_eq!(issued.subject, "carol");
    }

    #[test]
    fn test_sweep_keeps_active_subjects() {
        let cfg = StreamConfig {
            subject_counter_ttl: Duration::from_secs(60),
            subject_counter_max: 1,
            ..config()
        };
        let counters = Arc::new(ConnectionCounters::new(&cfg));
        let held = counters.acquire("busy").unwrap();
        drop(counters.acquire("idle").unwrap());
        drop(counters.acquire("idle2").unwrap());
        assert_eq!(counters.tracked_subjects(), 3);

        counters.sweep_at(Instant::now());
        assert_eq!(counters.tracked_subjects(), 1);
        assert_eq!(counters.subject("busy"), 1);

        drop(held);
        counters.sweep_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(counters.tracked_subjects(), 0);
    }
}
