use crate::adapter::SupervisedProcess;
use crate::config::WatchdogConfig;

/// Names the watchdog never touches regardless of configuration
const BUILTIN_EXCLUDES: [&str; 2] = ["watchdog", "pm2-watchdog"];

pub const CPU_LIMIT_ENV: &str = "WATCHDOG_CPU_LIMIT";
pub const MEM_LIMIT_ENV: &str = "WATCHDOG_MEM_LIMIT_MB";

pub fn is_excluded(name: &str, exclude: &[String]) -> bool {
    BUILTIN_EXCLUDES.contains(&name) || exclude.iter().any(|e| e == name)
}

/// A process's current load against its limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub cpu: f64,
    pub mem_mb: f64,
    pub cpu_limit: f64,
    pub mem_limit_mb: f64,
}

impl Measurement {
    /// Limits come from the process's own environment when it sets them, else the defaults
    pub fn of(process: &SupervisedProcess, defaults: &WatchdogConfig) -> Self {
        Self {
            cpu: process.cpu_percent,
            mem_mb: process.memory_mb(),
            cpu_limit: env_limit(process, CPU_LIMIT_ENV).unwrap_or(defaults.cpu_limit),
            mem_limit_mb: env_limit(process, MEM_LIMIT_ENV).unwrap_or(defaults.mem_limit_mb),
        }
    }

    pub fn is_over(&self) -> bool {
        self.cpu > self.cpu_limit || self.mem_mb > self.mem_limit_mb
    }
}

fn env_limit(process: &SupervisedProcess, key: &str) -> Option<f64> {
    let raw = process.env_var(key)?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            tracing::warn!(process = %process.name, key, value = raw, "ignoring unparsable limit override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(cpu: f64, memory_mb: f64) -> SupervisedProcess {
        SupervisedProcess {
            name: "bot".to_string(),
            cpu_percent: cpu,
            memory_bytes: (memory_mb * 1024.0 * 1024.0) as u64,
            ..Default::default()
        }
    }

    #[test]
    fn test_exclusions() {
        let exclude = vec!["batch".to_string()];
        assert!(is_excluded("watchdog", &[]));
        assert!(is_excluded("pm2-watchdog", &[]));
        assert!(is_excluded("batch", &exclude));
        assert!(!is_excluded("worker", &exclude));
    }

    #[test]
    fn test_default_limits() {
        let config = WatchdogConfig::default();
        let m = Measurement::of(&process(10.0, 100.0), &config);
        assert_eq!(m.cpu_limit, 85.0);
        assert_eq!(m.mem_limit_mb, 1024.0);
        assert!(!m.is_over());

        assert!(Measurement::of(&process(90.0, 100.0), &config).is_over());
        assert!(Measurement::of(&process(10.0, 2048.0), &config).is_over());
    }

    #[test]
    fn test_env_override() {
        let config = WatchdogConfig::default();
        let mut p = process(50.0, 300.0);
        p.env.insert(CPU_LIMIT_ENV.to_string(), "40".to_string());
        p.env.insert(MEM_LIMIT_ENV.to_string(), "512".to_string());

        let m = Measurement::of(&p, &config);
        assert_eq!(m.cpu_limit, 40.0);
        assert_eq!(m.mem_limit_mb, 512.0);
        assert!(m.is_over());
    }

    #[test]
    fn test_bad_override_keeps_default() {
        let config = WatchdogConfig::default();
        let mut p = process(50.0, 300.0);
        p.env.insert(CPU_LIMIT_ENV.to_string(), "lots".to_string());
        assert_eq!(Measurement::of(&p, &config).cpu_limit, 85.0);
    }
}
