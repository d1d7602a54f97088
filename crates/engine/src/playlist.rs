//! M3U playlist loading.
//!
//! A playlist source is either a local file or an HTTP(S) URL. Remote
//! playlists are fetched with a small retry loop because IPTV providers
//! routinely drop the first request.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::Channel;

pub const UNGROUPED: &str = "Ungrouped";
const USER_AGENT: &str = concat!("iptv-validator/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

static GROUP_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"group-title="([^"]*)""#).expect("valid regex"));

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist '{0}' is neither a readable file nor an http(s) url")]
    UnknownSource(String),

    #[error("failed to read playlist file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to fetch playlist after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    #[error("playlist contains no channels")]
    Empty,
}

/// Retry schedule for remote playlists.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub attempts: u32,
    /// Delay after attempt `n` (1-based) is `backoff * n`.
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Parse an extended M3U document.
///
/// Each `#EXTINF` line is paired with the next non-empty, non-comment line as
/// its URL. Entries without a URL are dropped.
pub fn parse_m3u(text: &str) -> Vec<Channel> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut channels = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        i += 1;
        if !line.starts_with("#EXTINF") {
            continue;
        }

        let name = line
            .split_once(',')
            .map(|(_, name)| name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or("unknown");

        while i < lines.len() && (lines[i].is_empty() || lines[i].starts_with('#')) {
            // Another entry starts before a URL turned up
            if lines[i].starts_with("#EXTINF") {
                break;
            }
            i += 1;
        }
        let Some(url) = lines.get(i).filter(|l| !l.is_empty() && !l.starts_with('#')) else {
            continue;
        };
        i += 1;

        let group = GROUP_TITLE
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| group_from_name(name));

        channels.push(Channel::new(name, group, *url));
    }
    channels
}

/// Guess a group from common naming conventions.
///
/// - `Group | Channel`
/// - `[Group] Channel`
/// - `Group - Channel` when the prefix is short
pub fn group_from_name(name: &str) -> String {
    if let Some((group, _)) = name.split_once(" | ") {
        return non_empty_or_ungrouped(group);
    }
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((group, _)) = rest.split_once(']') {
            return non_empty_or_ungrouped(group);
        }
    }
    if let Some((group, _)) = name.split_once(" - ") {
        if group.chars().count() < 30 {
            return non_empty_or_ungrouped(group);
        }
    }
    UNGROUPED.to_string()
}

fn non_empty_or_ungrouped(group: &str) -> String {
    let group = group.trim();
    if group.is_empty() {
        UNGROUPED.to_string()
    } else {
        group.to_string()
    }
}

/// Fetch a remote document, retrying failures and non-200 responses.
pub async fn fetch_text(url: &str, policy: FetchPolicy) -> Result<String, PlaylistError> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| PlaylistError::Unreachable {
            attempts: 0,
            last_error: e.to_string(),
        })?;

    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.text().await {
                    Ok(text) => return Ok(text),
                    Err(e) => last_error = format!("failed to read body: {}", e),
                }
            }
            Ok(response) => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                last_error = format!("HTTP {} {}", response.status(), content_type)
                    .trim_end()
                    .to_string();
            }
            Err(e) => last_error = e.to_string(),
        }

        warn!(url, attempt, attempts, error = %last_error, "playlist fetch failed");
        if attempt < attempts {
            tokio::time::sleep(policy.backoff * attempt).await;
        }
    }

    Err(PlaylistError::Unreachable {
        attempts,
        last_error,
    })
}

/// Load channels from a local file or an http(s) URL.
pub async fn load_playlist(source: &str, policy: FetchPolicy) -> Result<Vec<Channel>, PlaylistError> {
    let path = Path::new(source);
    let text = if path.is_file() {
        info!(path = %path.display(), "reading local playlist");
        tokio::fs::read_to_string(path).await?
    } else {
        match url::Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                info!(url = source, "fetching playlist");
                fetch_text(source, policy).await?
            }
            _ => return Err(PlaylistError::UnknownSource(source.to_string())),
        }
    };

    let channels = parse_m3u(&text);
    if channels.is_empty() {
        return Err(PlaylistError::Empty);
    }
    info!(channels = channels.len(), "playlist loaded");
    Ok(channels)
}
