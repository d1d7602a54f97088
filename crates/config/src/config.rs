//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder in `probe.args` replaced by the channel URL at launch time.
pub const URL_PLACEHOLDER: &str = "{url}";

/// Longest accepted per-channel duration and grace period: 30 days.
pub const MAX_DURATION_SECS: u64 = 30 * 86_400;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External probe tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Probe executable, resolved through PATH
    #[serde(default = "default_probe_binary")]
    pub binary: String,
    /// Arguments passed to the probe; `{url}` is substituted per channel
    #[serde(default = "default_probe_args")]
    pub args: Vec<String>,
}

fn default_probe_binary() -> String {
    "ffmpeg".to_string()
}

fn default_probe_args() -> Vec<String> {
    [
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "info",
        "-i",
        URL_PLACEHOLDER,
        "-map",
        "0",
        "-c",
        "copy",
        "-f",
        "null",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary: default_probe_binary(),
            args: default_probe_args(),
        }
    }
}

impl ProbeConfig {
    /// Arguments with the URL placeholder substituted
    pub fn args_for(&self, url: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(URL_PLACEHOLDER, url))
            .collect()
    }
}

/// Default run parameters, overridable from the command line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSection {
    /// Seconds each channel is probed per iteration
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// `single`, `count:N` or `infinite`
    #[serde(default = "default_loop_mode")]
    pub loop_mode: String,
}

fn default_duration_secs() -> u64 {
    60
}

fn default_loop_mode() -> String {
    "single".to_string()
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            loop_mode: default_loop_mode(),
        }
    }
}

/// Reconnect and timing policy for the channel test runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Reconnects allowed per channel per iteration before it is marked as an issue
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Extra time past the deadline granted to a probe before it is killed
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Pause before relaunching a probe that exited on its own
    #[serde(default = "default_reprobe_interval_ms")]
    pub reprobe_interval_ms: u64,
}

fn default_max_reconnects() -> u32 {
    5
}

fn default_grace_secs() -> u64 {
    5
}

fn default_reprobe_interval_ms() -> u64 {
    1000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_reconnects: default_max_reconnects(),
            grace_secs: default_grace_secs(),
            reprobe_interval_ms: default_reprobe_interval_ms(),
        }
    }
}

/// HTTP serving configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address for the state/history endpoints
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:9001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Durable output locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Append-only JSON Lines history of completed iterations
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    /// Live snapshot export for file-polling dashboards; `None` disables it
    #[serde(default = "default_results_path")]
    pub results_path: Option<PathBuf>,
}

fn default_history_path() -> PathBuf {
    PathBuf::from("history.jsonl")
}

fn default_results_path() -> Option<PathBuf> {
    Some(PathBuf::from("results.json"))
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_path: default_history_path(),
            results_path: default_results_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot drive a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("probe.binary must not be empty".into()));
        }
        if !self.probe.args.iter().any(|a| a.contains(URL_PLACEHOLDER)) {
            return Err(ConfigError::Invalid(format!(
                "probe.args must contain the {} placeholder",
                URL_PLACEHOLDER
            )));
        }
        if self.run.duration_secs == 0 {
            return Err(ConfigError::Invalid("run.duration_secs must be > 0".into()));
        }
        if self.run.duration_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "run.duration_secs must be at most {}",
                MAX_DURATION_SECS
            )));
        }
        if self.policy.grace_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "policy.grace_secs must be at most {}",
                MAX_DURATION_SECS
            )));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - IPTV_PROBE_BINARY -> probe.binary
    /// - IPTV_DURATION_SECS -> run.duration_secs
    /// - IPTV_LOOP_MODE -> run.loop_mode
    /// - IPTV_MAX_RECONNECTS -> policy.max_reconnects
    /// - IPTV_GRACE_SECS -> policy.grace_secs
    /// - IPTV_REPROBE_INTERVAL_MS -> policy.reprobe_interval_ms
    /// - IPTV_SERVER_BIND -> server.bind
    /// - IPTV_HISTORY_PATH -> store.history_path
    /// - IPTV_RESULTS_PATH -> store.results_path (empty disables the export)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("IPTV_PROBE_BINARY") {
            if !val.trim().is_empty() {
                self.probe.binary = val;
            }
        }

        if let Ok(val) = env::var("IPTV_DURATION_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 && secs <= MAX_DURATION_SECS {
                    self.run.duration_secs = secs;
                }
            }
        }

        if let Ok(val) = env::var("IPTV_LOOP_MODE") {
            if !val.trim().is_empty() {
                self.run.loop_mode = val;
            }
        }

        if let Ok(val) = env::var("IPTV_MAX_RECONNECTS") {
            if let Ok(n) = val.parse::<u32>() {
                self.policy.max_reconnects = n;
            }
        }

        if let Ok(val) = env::var("IPTV_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs <= MAX_DURATION_SECS {
                    self.policy.grace_secs = secs;
                }
            }
        }

        if let Ok(val) = env::var("IPTV_REPROBE_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.policy.reprobe_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("IPTV_SERVER_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("IPTV_HISTORY_PATH") {
            if !val.trim().is_empty() {
                self.store.history_path = PathBuf::from(val);
            }
        }

        // An empty value is meaningful here: it turns the export off
        if let Ok(val) = env::var("IPTV_RESULTS_PATH") {
            self.store.results_path = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but falls back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
