//! Core data model shared by the runner, the loop controller and the serving path.

use iptv_validator_config::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// One named media stream entry from a playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub group: String,
    pub url: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, group: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            url: url.into(),
        }
    }
}

/// Status of a channel within the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Waiting for its turn in this iteration.
    #[default]
    Pending,
    /// Currently being probed.
    Testing,
    /// A stream was observed and no fatal condition occurred.
    Pass,
    /// No stream, a probe failure, or too many disconnects.
    Issue,
}

impl ChannelStatus {
    /// Pass and issue end a channel's iteration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelStatus::Pass | ChannelStatus::Issue)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Pending => write!(f, "pending"),
            ChannelStatus::Testing => write!(f, "testing"),
            ChannelStatus::Pass => write!(f, "pass"),
            ChannelStatus::Issue => write!(f, "issue"),
        }
    }
}

/// Resolution class derived from a width x height observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    Hd1080,
    #[serde(rename = "4K")]
    Uhd4k,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Resolution {
    /// Classify a frame size.
    ///
    /// Both dimensions must reach a class threshold; anything below 1280x720
    /// is reported as unknown.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width >= 3840 && height >= 2160 {
            Resolution::Uhd4k
        } else if width >= 1920 && height >= 1080 {
            Resolution::Hd1080
        } else if width >= 1280 && height >= 720 {
            Resolution::Hd720
        } else {
            Resolution::Unknown
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Hd720 => write!(f, "720p"),
            Resolution::Hd1080 => write!(f, "1080p"),
            Resolution::Uhd4k => write!(f, "4K"),
            Resolution::Unknown => write!(f, "unknown"),
        }
    }
}

/// Per-channel, per-iteration outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IterationResult {
    pub status: ChannelStatus,
    /// Wall-clock seconds spent on this channel in this iteration.
    pub seconds_tested: f64,
    /// Carried across iterations until a new observation replaces it.
    pub resolution: Option<Resolution>,
    /// Human-readable stream info or diagnostic.
    pub detail: String,
}

impl IterationResult {
    /// Fresh result for a channel that is about to be probed.
    pub fn testing(carried: Option<Resolution>) -> Self {
        Self {
            status: ChannelStatus::Testing,
            seconds_tested: 0.0,
            resolution: carried,
            detail: String::new(),
        }
    }

    /// Clear iteration-local fields; the resolution survives.
    pub fn reset_for_next_iteration(&mut self) {
        self.status = ChannelStatus::Pending;
        self.seconds_tested = 0.0;
        self.detail.clear();
    }
}

/// Counters that span the whole run and never decrease while it is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CumulativeMetrics {
    pub total_buffering_events: u64,
    pub total_disconnects: u64,
    pub total_seconds_tested: f64,
}

/// How many times the channel list is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "String", try_from = "String")]
pub enum LoopMode {
    #[default]
    Single,
    Count(u32),
    Infinite,
}

impl LoopMode {
    /// Number of iterations when bounded.
    pub fn total_iterations(&self) -> Option<u32> {
        match self {
            LoopMode::Single => Some(1),
            LoopMode::Count(n) => Some(*n),
            LoopMode::Infinite => None,
        }
    }

    /// Whether another iteration follows the one that just completed.
    pub fn should_continue(&self, completed_iteration: u32) -> bool {
        match self {
            LoopMode::Single => false,
            LoopMode::Count(n) => completed_iteration < *n,
            LoopMode::Infinite => true,
        }
    }
}

/// Error returned when a loop mode string cannot be understood.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid loop mode '{0}': expected single, count:N (N >= 1) or infinite")]
pub struct ParseLoopModeError(pub String);

impl FromStr for LoopMode {
    type Err = ParseLoopModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let count = match normalized.as_str() {
            "single" | "once" => return Ok(LoopMode::Single),
            "infinite" | "forever" => return Ok(LoopMode::Infinite),
            other => other.strip_prefix("count:").unwrap_or(other),
        };
        match count.trim().parse::<u32>() {
            Ok(n) if n >= 1 => Ok(LoopMode::Count(n)),
            _ => Err(ParseLoopModeError(s.to_string())),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Single => write!(f, "single"),
            LoopMode::Count(n) => write!(f, "count:{}", n),
            LoopMode::Infinite => write!(f, "infinite"),
        }
    }
}

impl From<LoopMode> for String {
    fn from(mode: LoopMode) -> Self {
        mode.to_string()
    }
}

impl TryFrom<String> for LoopMode {
    type Error = ParseLoopModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Cancelled)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Running => write!(f, "running"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Timing and reconnect policy applied by the channel test runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerPolicy {
    /// Reconnects allowed per channel per iteration.
    pub max_reconnects: u32,
    /// Slack granted past the deadline before a probe is hard-killed.
    pub grace: Duration,
    /// Pause before relaunching a probe that exited by itself.
    pub reprobe_interval: Duration,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for RunnerPolicy {
    fn from(cfg: &PolicyConfig) -> Self {
        Self {
            max_reconnects: cfg.max_reconnects,
            grace: Duration::from_secs(cfg.grace_secs),
            reprobe_interval: Duration::from_millis(cfg.reprobe_interval_ms),
        }
    }
}

/// Immutable parameters of one run, built once before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Probe time per channel per iteration.
    pub duration: Duration,
    pub loop_mode: LoopMode,
    pub policy: RunnerPolicy,
}

impl RunConfig {
    pub fn new(duration: Duration, loop_mode: LoopMode, policy: RunnerPolicy) -> Self {
        Self {
            duration,
            loop_mode,
            policy,
        }
    }
}

/// Stand-in for deadlines that do not fit in an `Instant`: about 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: tokio::time::Instant, after: Duration) -> tokio::time::Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
