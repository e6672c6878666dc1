//! Configuration parsing for the control-plane daemon.
//!
//! Key=value format, read from `.autopilot/config` or a file given with
//! `--config`. Precedence: CLI flags > `--config` file > `.autopilot/config` > defaults.

use crate::types::Lane;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = ".autopilot/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid float value for {key}: {value}")]
    InvalidFloat { key: String, value: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Control-plane tuning knobs.
///
/// Every threshold used by the scheduler, quality gate and critic monitor
/// lives here so deployments can retune without a rebuild.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Scheduler
    pub global_cap: usize,
    pub interactive_cap: usize,
    pub critical_cap: usize,
    pub background_cap: usize,
    /// Consecutive higher-lane picks allowed while a lower lane waits.
    pub starvation_window: u32,
    pub default_lane: Lane,
    pub tick_interval_ms: u64,

    // Leases
    pub lease_ttl_sec: u64,
    pub reaper_interval_sec: u64,
    pub max_lease_expiries: u32,
    pub expiry_backoff_base_sec: u64,

    // Quality gate
    pub max_resolution_attempts: u32,
    pub require_peer_review: bool,

    // Critic monitor
    pub critic_history_limit: usize,
    pub critic_history_origin: String,
    pub director_consecutive_failures: usize,
    pub director_zero_pass_observations: usize,
    pub autopilot_consecutive_failures: usize,
    pub autopilot_ratio_observations: usize,
    pub autopilot_failure_ratio: f64,
    pub resolve_consecutive_passes: usize,
    pub systemic_min_critics: usize,
    pub systemic_ratio: f64,
    pub director_role: String,
    pub autopilot_role: String,
    pub skip_window_default_sec: u64,
    pub skip_window_advisory_sec: u64,

    // Executor
    /// Shell command run for each dispatched task. Unset means tasks are worked
    /// by external agents reporting back through the API.
    pub agent_cmd: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_cap: 4,
            interactive_cap: 2,
            critical_cap: 2,
            background_cap: 2,
            starvation_window: 4,
            default_lane: Lane::Background,
            tick_interval_ms: 500,
            lease_ttl_sec: 900,
            reaper_interval_sec: 15,
            max_lease_expiries: 3,
            expiry_backoff_base_sec: 30,
            max_resolution_attempts: 3,
            require_peer_review: true,
            critic_history_limit: 12,
            critic_history_origin: "runtime".to_string(),
            director_consecutive_failures: 5,
            director_zero_pass_observations: 6,
            autopilot_consecutive_failures: 3,
            autopilot_ratio_observations: 5,
            autopilot_failure_ratio: 0.8,
            resolve_consecutive_passes: 2,
            systemic_min_critics: 2,
            systemic_ratio: 0.6,
            director_role: "director".to_string(),
            autopilot_role: "autopilot".to_string(),
            skip_window_default_sec: 900,
            skip_window_advisory_sec: 3600,
            agent_cmd: None,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `path` if given, else `.autopilot/config` under `workspace_root` if it exists.
    pub fn discover(path: Option<&Path>, workspace_root: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let default_path = workspace_root.join(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::from_file(&default_path);
        }
        Ok(Self::default())
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)?;
        self.validate()
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "global_cap" => self.global_cap = Self::parse_int(key, value)?,
            "interactive_cap" => self.interactive_cap = Self::parse_int(key, value)?,
            "critical_cap" => self.critical_cap = Self::parse_int(key, value)?,
            "background_cap" => self.background_cap = Self::parse_int(key, value)?,
            "starvation_window" => self.starvation_window = Self::parse_int(key, value)?,
            "default_lane" => {
                self.default_lane = value.parse().map_err(|_| {
                    ConfigError::InvalidLine(format!(
                        "default_lane must be one of interactive, critical, background; \
                         got '{value}'"
                    ))
                })?;
            }
            "tick_interval_ms" => self.tick_interval_ms = Self::parse_int(key, value)?,
            "lease_ttl_sec" => self.lease_ttl_sec = Self::parse_int(key, value)?,
            "reaper_interval_sec" => self.reaper_interval_sec = Self::parse_int(key, value)?,
            "max_lease_expiries" => self.max_lease_expiries = Self::parse_int(key, value)?,
            "expiry_backoff_base_sec" => {
                self.expiry_backoff_base_sec = Self::parse_int(key, value)?;
            }
            "max_resolution_attempts" => {
                self.max_resolution_attempts = Self::parse_int(key, value)?;
            }
            "require_peer_review" => self.require_peer_review = Self::parse_bool(key, value)?,
            "critic_history_limit" => self.critic_history_limit = Self::parse_int(key, value)?,
            "critic_history_origin" => self.critic_history_origin = value.to_string(),
            "director_consecutive_failures" => {
                self.director_consecutive_failures = Self::parse_int(key, value)?;
            }
            "director_zero_pass_observations" => {
                self.director_zero_pass_observations = Self::parse_int(key, value)?;
            }
            "autopilot_consecutive_failures" => {
                self.autopilot_consecutive_failures = Self::parse_int(key, value)?;
            }
            "autopilot_ratio_observations" => {
                self.autopilot_ratio_observations = Self::parse_int(key, value)?;
            }
            "autopilot_failure_ratio" => {
                self.autopilot_failure_ratio = Self::parse_float(key, value)?;
            }
            "resolve_consecutive_passes" => {
                self.resolve_consecutive_passes = Self::parse_int(key, value)?;
            }
            "systemic_min_critics" => self.systemic_min_critics = Self::parse_int(key, value)?,
            "systemic_ratio" => self.systemic_ratio = Self::parse_float(key, value)?,
            "director_role" => self.director_role = value.to_string(),
            "autopilot_role" => self.autopilot_role = value.to_string(),
            "skip_window_default_sec" => {
                self.skip_window_default_sec = Self::parse_int(key, value)?;
            }
            "skip_window_advisory_sec" => {
                self.skip_window_advisory_sec = Self::parse_int(key, value)?;
            }
            "agent_cmd" => {
                self.agent_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            _ => {
                tracing::warn!(key, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    /// Reject combinations the scheduler and monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_cap == 0 {
            return Err(ConfigError::InvalidValue {
                key: "global_cap".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_resolution_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_resolution_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, value) in [
            ("tick_interval_ms", self.tick_interval_ms),
            ("reaper_interval_sec", self.reaper_interval_sec),
            ("lease_ttl_sec", self.lease_ttl_sec),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        for (key, ratio) in [
            ("autopilot_failure_ratio", self.autopilot_failure_ratio),
            ("systemic_ratio", self.systemic_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("must be within 0..=1, got {ratio}"),
                });
            }
        }
        Ok(())
    }

    pub fn lane_cap(&self, lane: Lane) -> usize {
        match lane {
            Lane::Interactive => self.interactive_cap,
            Lane::Critical => self.critical_cap,
            Lane::Background => self.background_cap,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_sec)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_sec)
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_float(key: &str, value: &str) -> Result<f64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidFloat {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Resolve a path relative to a workspace root.
pub fn resolve_path(path: PathBuf, workspace_root: &Path) -> PathBuf {
    if path.is_relative() {
        workspace_root.join(path)
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.global_cap, 4);
        assert_eq!(config.default_lane, Lane::Background);
        assert_eq!(config.lease_ttl(), Duration::from_secs(900));
        assert_eq!(config.max_resolution_attempts, 3);
        assert_eq!(config.critic_history_limit, 12);
        assert_eq!(config.critic_history_origin, "runtime");
        assert!((config.systemic_ratio - 0.6).abs() < f64::EPSILON);
        assert!(config.agent_cmd.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# scheduler
global_cap=8
default_lane="critical"
require_peer_review=off
systemic_ratio=0.5
agent_cmd='./bin/agent --json'
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.global_cap, 8);
        assert_eq!(config.default_lane, Lane::Critical);
        assert!(!config.require_peer_review);
        assert!((config.systemic_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.agent_cmd.as_deref(), Some("./bin/agent --json"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("legacy_mode=1\nglobal_cap=3").unwrap();
        assert_eq!(config.global_cap, 3);
    }

    #[test]
    fn malformed_values_are_errors() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("global_cap=many"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("systemic_ratio=most"),
            Err(ConfigError::InvalidFloat { .. })
        ));
        assert!(matches!(
            config.parse_content("require_peer_review=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("no equals sign"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let config = Config {
            systemic_ratio: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            global_cap: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "lease_ttl_sec=60\nmax_resolution_attempts=5\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.lease_ttl_sec, 60);
        assert_eq!(config.max_resolution_attempts, 5);
        assert_eq!(config.global_cap, 4);
    }

    #[test]
    fn discover_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::discover(None, dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }
}
