//! Startup checks
//!
//! Preflight checks run before any channel is probed:
//! - the configured probe tool starts and answers `-version`
//! - the probe arguments hand the stream URL to the tool

use iptv_validator_config::{ProbeConfig, URL_PLACEHOLDER};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Upper bound for the `-version` call.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("probe tool '{binary}' not available: {reason}")]
    ProbeUnavailable { binary: String, reason: String },

    #[error("probe arguments never pass the stream url ({0} placeholder missing)")]
    MissingUrlPlaceholder(&'static str),
}

/// Version reported by the probe tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub binary: String,
    /// `None` when the tool ran but printed no recognizable version line.
    pub version: Option<String>,
}

/// Extract the version token from `-version` output.
///
/// Handles the formats ffmpeg and ffprobe print:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed git builds: "ffprobe version n7.0-12-gabcdef ..."
/// - Distro builds: "ffmpeg version 6.1.1-3ubuntu5 ..."
pub fn parse_tool_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;
    let lower = line.to_lowercase();
    let token = lower.split(" version ").nth(1)?.split_whitespace().next()?;
    let token = token.strip_prefix('n').unwrap_or(token);
    token
        .starts_with(|c: char| c.is_ascii_digit())
        .then(|| token.to_string())
}

/// Major version number out of a version token such as `7.1` or `6.1.1-3ubuntu5`.
pub fn major_version(token: &str) -> Option<u32> {
    token.split(['.', '-']).next()?.parse().ok()
}

/// Check that the probe arguments contain the URL placeholder.
pub fn check_probe_args(cfg: &ProbeConfig) -> Result<(), StartupError> {
    if cfg.args.iter().any(|arg| arg.contains(URL_PLACEHOLDER)) {
        Ok(())
    } else {
        Err(StartupError::MissingUrlPlaceholder(URL_PLACEHOLDER))
    }
}

/// Run `<binary> -version` and report what it says.
pub async fn check_probe_available(cfg: &ProbeConfig) -> Result<ToolVersion, StartupError> {
    let unavailable = |reason: String| StartupError::ProbeUnavailable {
        binary: cfg.binary.clone(),
        reason,
    };

    let output = Command::new(&cfg.binary)
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(VERSION_TIMEOUT, output)
        .await
        .map_err(|_| unavailable("-version did not finish in time".to_string()))?
        .map_err(|e| unavailable(format!("is it installed and in PATH? {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("-version exited with {}", output.status)));
    }

    Ok(ToolVersion {
        binary: cfg.binary.clone(),
        version: parse_tool_version(&String::from_utf8_lossy(&output.stdout)),
    })
}

/// Run all startup checks in order
///
/// 1. Probe arguments
/// 2. Probe tool availability
pub async fn run_startup_checks(cfg: &ProbeConfig) -> Result<ToolVersion, StartupError> {
    check_probe_args(cfg)?;
    let tool = check_probe_available(cfg).await?;
    info!(
        binary = %tool.binary,
        version = tool.version.as_deref().unwrap_or("unknown"),
        "probe tool available"
    );
    Ok(tool)
}
