//! Mapping from raw probe output lines to typed observations.
//!
//! Understands both ffmpeg's log format (`Stream #0:0: Video: h264 ..., 1920x1080`)
//! and ffprobe's `-show_streams` key/value format (`codec_type=video`,
//! `width=1920`, `height=1080`).

use once_cell::sync::Lazy;
use regex::Regex;

use super::Observation;

static STREAM_VIDEO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Stream #\d+:\d+.*?: Video:").expect("valid regex"));

static STREAM_AUDIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Stream #\d+:\d+.*?: Audio:").expect("valid regex"));

static INLINE_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("valid regex"));

static WIDTH_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^width=(\d+)$").expect("valid regex"));

static HEIGHT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^height=(\d+)$").expect("valid regex"));

static HTTP_CLIENT_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"server returned 4\d\d").expect("valid regex"));

/// Lowercased substrings that mean the probe cannot continue against this URL.
const FATAL_MARKERS: &[&str] = &[
    "error opening input",
    "invalid data found",
    "no such file",
    "protocol not found",
    "connection refused",
];

/// Lowercased substrings that mean the connection dropped mid-stream.
const DISCONNECT_MARKERS: &[&str] = &[
    "connection reset",
    "timed out",
    "timeout",
    "broken pipe",
    "end of file",
    "connection closed",
];

/// Lines mentioning a buffer that describe encoder parameters, not stalls.
const BUFFER_FALSE_POSITIVES: &[&str] = &["buffer size", "bufsize", "cpb:"];

/// Classify a single line that carries no cross-line state.
///
/// Fatal errors shadow every other match on the same line; a disconnect
/// shadows a buffering mention.
pub fn classify_line(line: &str) -> Vec<Observation> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let lower = trimmed.to_lowercase();

    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) || HTTP_CLIENT_ERROR.is_match(&lower) {
        return vec![Observation::Fatal(trimmed.to_string())];
    }

    let mut observations = Vec::new();

    if lower == "codec_type=video" {
        observations.push(Observation::VideoDetected);
    } else if lower == "codec_type=audio" {
        observations.push(Observation::AudioDetected);
    } else if STREAM_VIDEO.is_match(trimmed) {
        observations.push(Observation::VideoDetected);
        if let Some((width, height)) = inline_dimensions(trimmed) {
            observations.push(Observation::Resolution { width, height });
        }
    } else if STREAM_AUDIO.is_match(trimmed) {
        observations.push(Observation::AudioDetected);
    }

    if DISCONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
        observations.push(Observation::Disconnect(trimmed.to_string()));
    } else if lower.contains("buffer") && !BUFFER_FALSE_POSITIVES.iter().any(|m| lower.contains(m)) {
        observations.push(Observation::Buffering(trimmed.to_string()));
    }

    observations
}

/// Extract the first plausible `WxH` token from a video stream description.
fn inline_dimensions(line: &str) -> Option<(u32, u32)> {
    INLINE_SIZE.captures_iter(line).find_map(|caps| {
        let width = caps.get(1)?.as_str().parse::<u32>().ok()?;
        let height = caps.get(2)?.as_str().parse::<u32>().ok()?;
        (width > 0 && height > 0).then_some((width, height))
    })
}

/// Stateful line parser for one output stream of one probe process.
///
/// ffprobe reports width and height on separate lines; the parser pairs them
/// and emits a single resolution observation once both are known.
#[derive(Debug, Default)]
pub struct ObservationParser {
    pending_width: Option<u32>,
    pending_height: Option<u32>,
}

impl ObservationParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<Observation> {
        let trimmed = line.trim();

        if let Some(caps) = WIDTH_KEY.captures(trimmed) {
            self.pending_width = caps.get(1).and_then(|m| m.as_str().parse().ok());
            return self.take_pair().into_iter().collect();
        }
        if let Some(caps) = HEIGHT_KEY.captures(trimmed) {
            self.pending_height = caps.get(1).and_then(|m| m.as_str().parse().ok());
            return self.take_pair().into_iter().collect();
        }

        // A new stream section starts; a half-seen pair belongs to the old one
        if trimmed == "[STREAM]" {
            self.pending_width = None;
            self.pending_height = None;
        }

        classify_line(trimmed)
    }

    fn take_pair(&mut self) -> Option<Observation> {
        match (self.pending_width, self.pending_height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                self.pending_width = None;
                self.pending_height = None;
                Some(Observation::Resolution { width, height })
            }
            _ => None,
        }
    }
}
