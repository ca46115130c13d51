// Configuration: fleet definitions loaded from files, runtime settings from the environment

mod env;

pub use env::{BusConfig, Environment, RateLimitConfig, StreamConfig, WardenConfig, WatchdogConfig};

use crate::adapter::ExecMode;
use crate::error::{Result, WardenError};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Signals a fleet entry may use as its stop signal
pub const VALID_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

const MAX_INSTANCES: usize = 100;

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok());

/// One worker the local manager runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unique within the fleet; multi-instance entries get `-<n>` suffixes
    pub name: String,

    pub script: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Passed to the child; `WATCHDOG_CPU_LIMIT` / `WATCHDOG_MEM_LIMIT_MB` here override the watchdog defaults
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Cluster processes are reloaded rather than restarted by the watchdog
    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Relaunch after the child exits on its own
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Crash restarts allowed per minute
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Base backoff before a crash restart, doubled per recent restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period after the stop signal before SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_instances() -> usize {
    1
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_delay() -> u64 {
    1
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

/// Accepted file layouts: a `processes` list or a single bare entry
#[derive(Deserialize)]
#[serde(untagged)]
enum FleetFile {
    Fleet { processes: Vec<ProcessConfig> },
    Single(Box<ProcessConfig>),
}

impl FleetFile {
    fn into_entries(self) -> Result<Vec<ProcessConfig>> {
        match self {
            FleetFile::Single(entry) => Ok(vec![*entry]),
            FleetFile::Fleet { processes } if processes.is_empty() => Err(
                WardenError::InvalidConfig("fleet file lists no processes".to_string()),
            ),
            FleetFile::Fleet { processes } => Ok(processes),
        }
    }
}

impl ProcessConfig {
    /// Minimal definition with defaults for everything but name and script
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            instances: default_instances(),
            exec_mode: ExecMode::default(),
            autorestart: default_autorestart(),
            max_restarts: default_max_restarts(),
            restart_delay_secs: default_restart_delay(),
            stop_signal: default_stop_signal(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }

    /// Load a fleet from `.toml` or `.json`, expanding `$VAR` references and validating every entry
    pub fn from_file(path: &Path) -> Result<Vec<ProcessConfig>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WardenError::ConfigError(format!("cannot read fleet file {}: {}", path.display(), e))
        })?;

        let fleet = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::parse_toml(&contents)?,
            Some("json") => Self::parse_json(&contents)?,
            other => {
                return Err(WardenError::InvalidConfig(format!(
                    "unsupported fleet file format '{}', expected .toml or .json",
                    other.unwrap_or("")
                )))
            }
        };

        fleet
            .into_iter()
            .map(|mut entry| {
                entry.expand_env_vars();
                entry.validate().map(|()| entry)
            })
            .collect()
    }

    fn parse_toml(contents: &str) -> Result<Vec<ProcessConfig>> {
        toml::from_str::<FleetFile>(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("invalid TOML fleet: {}", e)))?
            .into_entries()
    }

    fn parse_json(contents: &str) -> Result<Vec<ProcessConfig>> {
        serde_json::from_str::<FleetFile>(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("invalid JSON fleet: {}", e)))?
            .into_entries()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }
        if self.script.as_os_str().is_empty() {
            return Err(WardenError::MissingConfigField("script".to_string()));
        }

        let problem = if !(1..=MAX_INSTANCES).contains(&self.instances) {
            Some(format!(
                "{}: instances must be between 1 and {}, got {}",
                self.name, MAX_INSTANCES, self.instances
            ))
        } else if !VALID_SIGNALS.contains(&self.stop_signal.as_str()) {
            Some(format!(
                "{}: stop_signal {} is not one of {}",
                self.name,
                self.stop_signal,
                VALID_SIGNALS.join(", ")
            ))
        } else {
            self.cwd
                .as_ref()
                .filter(|cwd| !cwd.is_dir())
                .map(|cwd| format!("{}: cwd {} is not a directory", self.name, cwd.display()))
        };

        match problem {
            Some(message) => Err(WardenError::ConfigValidationError(message)),
            None => Ok(()),
        }
    }

    /// One definition per instance; multi-instance entries get `-<n>` suffixed names
    pub fn expand_instances(&self) -> Vec<ProcessConfig> {
        if self.instances <= 1 {
            return vec![self.clone()];
        }
        (0..self.instances)
            .map(|n| ProcessConfig {
                name: format!("{}-{}", self.name, n),
                instances: 1,
                ..self.clone()
            })
            .collect()
    }

    fn expand_env_vars(&mut self) {
        let lookup = |key: &str| std::env::var(key).ok();

        self.script = PathBuf::from(expand_refs(&self.script.to_string_lossy(), lookup));
        self.cwd = self
            .cwd
            .take()
            .map(|cwd| PathBuf::from(expand_refs(&cwd.to_string_lossy(), lookup)));
        for arg in &mut self.args {
            *arg = expand_refs(arg, lookup);
        }
        for value in self.env.values_mut() {
            *value = expand_refs(value, lookup);
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Replace `$VAR` and `${VAR}`; unknown variables are left as written
fn expand_refs<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Some(pattern) = ENV_REF.as_ref() else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &Captures<'_>| {
            let key = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(key).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_process_config_defaults() {
        let config = ProcessConfig::new("bot", "/bin/echo");
        assert_eq!(config.instances, 1);
        assert!(config.autorestart);
        assert_eq!(config.exec_mode, ExecMode::Fork);
        assert_eq!(config.stop_signal, "SIGTERM");
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let config = ProcessConfig::new("", "/bin/echo");
        assert!(matches!(
            config.validate(),
            Err(WardenError::MissingConfigField(ref f)) if f == "name"
        ));
    }

    #[test]
    fn test_validate_zero_instances() {
        let mut config = ProcessConfig::new("bot", "/bin/echo");
        config.instances = 0;
        assert!(matches!(
            config.validate(),
            Err(WardenError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut config = ProcessConfig::new("bot", "/bin/echo");
        config.stop_signal = "SIGWHATEVER".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_instances() {
        let mut config = ProcessConfig::new("worker", "/bin/sleep");
        config.instances = 3;
        let names: Vec<String> = config
            .expand_instances()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["worker-0", "worker-1", "worker-2"]);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("FLEETWARDEN_TEST_HOME", "/opt/bots");
        let mut config = ProcessConfig::new("bot", "${FLEETWARDEN_TEST_HOME}/run.sh");
        config.args = vec!["$FLEETWARDEN_TEST_HOME".to_string()];
        config.expand_env_vars();
        assert_eq!(config.script, PathBuf::from("/opt/bots/run.sh"));
        assert_eq!(config.args, vec!["/opt/bots"]);
    }

    #[test]
    fn test_expand_refs_leaves_unknown_names() {
        let lookup = |key: &str| (key == "BOT_HOME").then(|| "/srv/bot".to_string());
        assert_eq!(expand_refs("$BOT_HOME/run", lookup), "/srv/bot/run");
        assert_eq!(expand_refs("${BOT_HOME}x", lookup), "/srv/botx");
        assert_eq!(expand_refs("$BOT_HOMEX", lookup), "$BOT_HOMEX");
        assert_eq!(expand_refs("cost: $5", lookup), "cost: $5");
    }

    #[test]
    fn test_parse_toml_single() {
        let configs = ProcessConfig::parse_toml(
            r#"
            name = "bot"
            script = "/bin/sleep"
            args = ["30"]
            exec_mode = "cluster"
            "#,
        )
        .unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].exec_mode, ExecMode::Cluster);
    }

    #[test]
    fn test_parse_toml_multiple() {
        let configs = ProcessConfig::parse_toml(
            r#"
            [[processes]]
            name = "alice_1"
            script = "/bin/sleep"

            [[processes]]
            name = "bob_2"
            script = "/bin/sleep"
            instances = 2
            "#,
        )
        .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].instances, 2);
    }

    #[test]
    fn test_parse_json_multiple() {
        let configs = ProcessConfig::parse_json(
            r#"{"processes":[{"name":"a","script":"/bin/true"},{"name":"b","script":"/bin/true"}]}"#,
        )
        .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "a");
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fleet.yaml");
        fs::write(&path, "name: x").unwrap();
        assert!(matches!(
            ProcessConfig::from_file(&path),
            Err(WardenError::InvalidConfig(_))
        ));
    }
}
