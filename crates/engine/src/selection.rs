//! Channel selection and run parameters.
//!
//! Narrows a playlist down to the channels to test and turns user-facing
//! duration and loop strings into an immutable [`RunConfig`].

use iptv_validator_config::MAX_DURATION_SECS;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Channel, LoopMode, ParseLoopModeError, RunConfig, RunnerPolicy};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("invalid duration '{0}': expected seconds or a number with s, m, h or d suffix")]
    InvalidDuration(String),

    #[error("duration must be greater than zero")]
    ZeroDuration,

    #[error("duration of {0:?} exceeds the {max} second limit", max = MAX_DURATION_SECS)]
    DurationTooLong(Duration),

    #[error(transparent)]
    InvalidLoopMode(#[from] ParseLoopModeError),

    #[error("loop count must be at least 1")]
    ZeroIterations,

    #[error("failed to read selection file: {0}")]
    Read(#[from] std::io::Error),

    #[error("selection file is not a JSON list of channels: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no channels left after selection")]
    NothingSelected,
}

/// Entry of a selection file. Only the URL is used; other fields are ignored.
#[derive(Debug, Deserialize)]
struct SelectedChannel {
    url: Option<String>,
}

/// Filters applied to a playlist. A channel is kept when it matches any
/// filter; with no filters every channel is kept.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Exact group names, compared case-insensitively.
    pub groups: Vec<String>,
    /// Substrings of channel names, compared case-insensitively.
    pub name_patterns: Vec<String>,
    /// URLs listed in a selection file.
    pub urls: HashSet<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.name_patterns.is_empty() && self.urls.is_empty()
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        if self.is_empty() {
            return true;
        }
        let group = channel.group.to_lowercase();
        let name = channel.name.to_lowercase();
        self.groups.iter().any(|g| g.to_lowercase() == group)
            || self
                .name_patterns
                .iter()
                .any(|p| name.contains(&p.to_lowercase()))
            || self.urls.contains(&channel.url)
    }

    /// Keep matching channels in playlist order.
    pub fn apply(&self, channels: Vec<Channel>) -> Result<Vec<Channel>, SelectionError> {
        let selected: Vec<Channel> = channels.into_iter().filter(|c| self.matches(c)).collect();
        if selected.is_empty() {
            Err(SelectionError::NothingSelected)
        } else {
            Ok(selected)
        }
    }
}

/// Read the URLs listed in a selection file (JSON array of objects with `url`).
pub fn load_selection_file(path: &Path) -> Result<HashSet<String>, SelectionError> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<SelectedChannel> = serde_json::from_str(&content)?;
    Ok(entries.into_iter().filter_map(|e| e.url).collect())
}

/// Parse `90`, `45s`, `1.5m`, `2h` or `1d`.
pub fn parse_duration(input: &str) -> Result<Duration, SelectionError> {
    let trimmed = input.trim().to_lowercase();
    let invalid = || SelectionError::InvalidDuration(input.to_string());

    let (number, multiplier) = match trimmed.char_indices().last() {
        Some((idx, 's')) => (&trimmed[..idx], 1.0),
        Some((idx, 'm')) => (&trimmed[..idx], 60.0),
        Some((idx, 'h')) => (&trimmed[..idx], 3600.0),
        Some((idx, 'd')) => (&trimmed[..idx], 86_400.0),
        Some(_) => (trimmed.as_str(), 1.0),
        None => return Err(invalid()),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    let secs = value * multiplier;
    if secs <= 0.0 {
        return Err(SelectionError::ZeroDuration);
    }
    let duration = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
    check_max_duration(duration)?;
    Ok(duration)
}

fn check_max_duration(duration: Duration) -> Result<(), SelectionError> {
    if duration > Duration::from_secs(MAX_DURATION_SECS) {
        Err(SelectionError::DurationTooLong(duration))
    } else {
        Ok(())
    }
}

/// Build the immutable parameters of a run.
pub fn build_run_config(
    duration: Duration,
    loop_mode: LoopMode,
    policy: RunnerPolicy,
) -> Result<RunConfig, SelectionError> {
    if duration.is_zero() {
        return Err(SelectionError::ZeroDuration);
    }
    check_max_duration(duration)?;
    if loop_mode == LoopMode::Count(0) {
        return Err(SelectionError::ZeroIterations);
    }
    Ok(RunConfig::new(duration, loop_mode, policy))
}
