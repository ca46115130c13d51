use crate::error::{Result, WardenError};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment, read from `FLEETWARDEN_ENV`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Development,
    Production,
    #[default]
    Other,
}

impl Environment {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("development") => Environment::Development,
            Some("production") => Environment::Production,
            _ => Environment::Other,
        }
    }

    pub fn is_development(&self) -> bool {
        *self == Environment::Development
    }

    pub fn is_production(&self) -> bool {
        *self == Environment::Production
    }
}

/// Settings for the resource watchdog
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    /// Default CPU ceiling in percent
    pub cpu_limit: f64,
    /// Default memory ceiling in MiB
    pub mem_limit_mb: f64,
    pub cooldown: Duration,
    pub max_interventions: usize,
    pub intervention_window: Duration,
    pub exclude: Vec<String>,
    /// Pause between connecting and the first tick
    pub startup_delay: Duration,
    /// Pause after the cache-cleanup handshake before restarting
    pub cleanup_wait: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            cpu_limit: 85.0,
            mem_limit_mb: 1024.0,
            cooldown: Duration::from_secs(60),
            max_interventions: 5,
            intervention_window: Duration::from_millis(300_000),
            exclude: Vec::new(),
            startup_delay: Duration::from_secs(3),
            cleanup_wait: Duration::from_secs(2),
        }
    }
}

/// Settings for the event aggregation bus
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub ring_size: usize,
    pub max_tracked: usize,
    pub stats_interval: Duration,
    pub min_immediate_poll_gap: Duration,
    /// Empty means every process is visible
    pub allowed: HashSet<String>,
    pub max_all_subscribers: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ring_size: 500,
            max_tracked: 200,
            stats_interval: Duration::from_millis(3000),
            min_immediate_poll_gap: Duration::from_millis(500),
            allowed: HashSet::new(),
            max_all_subscribers: 1000,
        }
    }
}

impl BusConfig {
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
}

/// Settings for the streaming session layer
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub environment: Environment,
    pub max_global: usize,
    pub max_per_subject: usize,
    pub subject_counter_ttl: Duration,
    pub subject_counter_max: usize,
    pub stream_rate: RateLimitConfig,
    pub token_rate: RateLimitConfig,
    pub block_duration: Duration,
    pub rate_max_keys: usize,
    pub rate_key_ttl: Duration,
    pub token_ttl: Duration,
    pub secret: Option<String>,
    pub allowed_origins: Vec<String>,
    pub heartbeat: Duration,
    pub retry: Duration,
    /// Per-session outbound queue depth; overflow drops events for that observer
    pub session_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Other,
            max_global: 500,
            max_per_subject: 5,
            subject_counter_ttl: Duration::from_secs(600),
            subject_counter_max: 5000,
            stream_rate: RateLimitConfig {
                limit: 40,
                window: Duration::from_secs(60),
            },
            token_rate: RateLimitConfig {
                limit: 20,
                window: Duration::from_secs(60),
            },
            block_duration: Duration::from_secs(300),
            rate_max_keys: 10_000,
            rate_key_ttl: Duration::from_secs(600),
            token_ttl: Duration::from_secs(600),
            secret: None,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            heartbeat: Duration::from_secs(15),
            retry: Duration::from_secs(5),
            session_buffer: 256,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default)]
pub struct WardenConfig {
    pub watchdog: WatchdogConfig,
    pub bus: BusConfig,
    pub stream: StreamConfig,
}

impl WardenConfig {
    /// Build from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let mut config = WardenConfig::default();

        let wd = &mut config.watchdog;
        if let Some(secs) = env.parse::<u64>("WATCHDOG_POLL_SECONDS")? {
            wd.poll_interval = Duration::from_secs(secs);
        }
        if let Some(cpu) = env.parse::<f64>("WATCHDOG_CPU_LIMIT")? {
            wd.cpu_limit = cpu;
        }
        if let Some(mem) = env.parse::<f64>("WATCHDOG_MEM_LIMIT_MB")? {
            wd.mem_limit_mb = mem;
        }
        if let Some(secs) = env.parse::<u64>("WATCHDOG_COOLDOWN_SECONDS")? {
            wd.cooldown = Duration::from_secs(secs);
        }
        if let Some(max) = env.parse::<usize>("WATCHDOG_MAX_INTERVENTIONS")? {
            wd.max_interventions = max;
        }
        if let Some(ms) = env.parse::<u64>("WATCHDOG_INTERVENTION_WINDOW")? {
            wd.intervention_window = Duration::from_millis(ms);
        }
        if let Some(list) = env.list("WATCHDOG_EXCLUDE") {
            wd.exclude = list;
        }

        let bus = &mut config.bus;
        if let Some(size) = env.parse::<usize>("PM2_RING_SIZE")? {
            bus.ring_size = size;
        }
        if let Some(max) = env.parse::<usize>("PM2_MAX_TRACKED")? {
            bus.max_tracked = max.max(50);
        }
        if let Some(ms) = env.parse::<u64>("PM2_STATS_INTERVAL_MS")? {
            bus.stats_interval = Duration::from_millis(ms);
        }
        if let Some(list) = env.list("PM2_ALLOWED_PROCESSES") {
            bus.allowed = list.into_iter().collect();
        }
        if let Some(max) = env.parse::<usize>("MAX_SSE_CONNECTIONS")? {
            bus.max_all_subscribers = max.max(10);
        }

        let stream = &mut config.stream;
        stream.environment = Environment::parse(env.get("FLEETWARDEN_ENV").as_deref());
        if let Some(max) = env.parse::<usize>("MAX_GLOBAL_SSE")? {
            stream.max_global = max.max(10);
        }
        if let Some(max) = env.parse::<usize>("MAX_SUBJECT_SSE")? {
            stream.max_per_subject = max.max(1);
        }
        if let Some(ms) = env.parse::<u64>("SUBJECT_COUNTER_TTL")? {
            stream.subject_counter_ttl = Duration::from_millis(ms.max(60_000));
        }
        if let Some(max) = env.parse::<usize>("SUBJECT_COUNTER_MAX")? {
            stream.subject_counter_max = max.max(1000);
        }
        if let Some(max) = env.parse::<usize>("RATE_LIMIT_MAX_KEYS")? {
            stream.rate_max_keys = max.max(5000);
        }
        if let Some(limit) = env.parse::<u32>("SSE_RATE_LIMIT")? {
            stream.stream_rate.limit = limit.max(1);
        }
        if let Some(ms) = env.parse::<u64>("SSE_RATE_WINDOW_MS")? {
            stream.stream_rate.window = Duration::from_millis(ms);
        }
        if let Some(limit) = env.parse::<u32>("TOKEN_RATE_LIMIT")? {
            stream.token_rate.limit = limit.max(1);
        }
        if let Some(ms) = env.parse::<u64>("TOKEN_RATE_WINDOW_MS")? {
            stream.token_rate.window = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<u64>("SSE_TOKEN_TTL_SECONDS")? {
            stream.token_ttl = Duration::from_secs(secs);
        }
        stream.secret = env.get("INTERNAL_SSE_SECRET").filter(|s| !s.is_empty());
        if let Some(list) = env.list("ALLOWED_ORIGINS") {
            stream.allowed_origins = list;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let wd = &self.watchdog;
        if wd.poll_interval.is_zero() {
            return Err(WardenError::ConfigValidationError(
                "WATCHDOG_POLL_SECONDS must be at least 1".to_string(),
            ));
        }
        if wd.cpu_limit <= 0.0 || wd.mem_limit_mb <= 0.0 {
            return Err(WardenError::ConfigValidationError(
                "watchdog limits must be positive".to_string(),
            ));
        }
        if self.bus.ring_size == 0 {
            return Err(WardenError::ConfigValidationError(
                "PM2_RING_SIZE must be at least 1".to_string(),
            ));
        }
        if self.bus.stats_interval.is_zero() {
            return Err(WardenError::ConfigValidationError(
                "PM2_STATS_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if self.stream.stream_rate.window.is_zero() || self.stream.token_rate.window.is_zero() {
            return Err(WardenError::ConfigValidationError(
                "rate-limit windows must be positive".to_string(),
            ));
        }
        if self.stream.token_ttl.is_zero() {
            return Err(WardenError::ConfigValidationError(
                "token TTL must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                WardenError::ConfigValidationError(format!("{} is not a valid number: {}", key, raw))
            }),
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<WardenConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WardenConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.watchdog.poll_interval, Duration::from_secs(15));
        assert_eq!(config.watchdog.max_interventions, 5);
        assert_eq!(config.bus.ring_size, 500);
        assert_eq!(config.stream.max_per_subject, 5);
        assert_eq!(config.stream.environment, Environment::Other);
        assert!(config.stream.secret.is_none());
    }

    #[test]
    fn test_overrides_and_floors() {
        let config = config_from(&[
            ("WATCHDOG_CPU_LIMIT", "50"),
            ("WATCHDOG_EXCLUDE", "alpha, beta,,"),
            ("PM2_MAX_TRACKED", "3"),
            ("MAX_GLOBAL_SSE", "2"),
            ("PM2_ALLOWED_PROCESSES", "bot_1,bot_2"),
            ("FLEETWARDEN_ENV", "production"),
            ("INTERNAL_SSE_SECRET", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.watchdog.cpu_limit, 50.0);
        assert_eq!(config.watchdog.exclude, vec!["alpha", "beta"]);
        assert_eq!(config.bus.max_tracked, 50);
        assert_eq!(config.stream.max_global, 10);
        assert!(config.bus.is_allowed("bot_1"));
        assert!(!config.bus.is_allowed("bot_3"));
        assert!(config.stream.environment.is_production());
        assert_eq!(config.stream.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_rate_limit_overrides() {
        let config = config_from(&[
            ("SSE_RATE_LIMIT", "0"),
            ("SSE_RATE_WINDOW_MS", "30000"),
            ("TOKEN_RATE_LIMIT", "5"),
        ])
        .unwrap();
        assert_eq!(
            config.stream.stream_rate,
            RateLimitConfig {
                limit: 1,
                window: Duration::from_secs(30),
            }
        );
        assert_eq!(config.stream.token_rate.limit, 5);
        assert_eq!(config.stream.token_rate.window, Duration::from_secs(60));

        assert!(matches!(
            config_from(&[("SSE_RATE_WINDOW_MS", "0")]),
            Err(WardenError::ConfigValidationError(_))
        ));
        assert!(config_from(&[("TOKEN_RATE_WINDOW_MS", "0")]).is_err());
        assert!(config_from(&[("TOKEN_RATE_LIMIT", "-3")]).is_err());
    }

    #[test]
    fn test_invalid_number() {
        let result = config_from(&[("WATCHDOG_POLL_SECONDS", "soon")]);
        assert!(matches!(result, Err(WardenError::ConfigValidationError(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(config_from(&[("WATCHDOG_POLL_SECONDS", "0")]).is_err());
    }
}
