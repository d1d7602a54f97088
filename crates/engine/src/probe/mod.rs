//! Stream probe adapter
//!
//! A probe is an external process run against one stream URL. Its text output
//! is translated line by line into [`Observation`]s. The runner only sees the
//! [`StreamProbe`] / [`ProbeSession`] traits, so tests can substitute a
//! scripted probe for the real subprocess.

pub mod parser;
pub mod process;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use parser::{classify_line, ObservationParser};
pub use process::ProcessProbe;

/// Typed event derived from probe output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    VideoDetected,
    AudioDetected,
    Resolution { width: u32, height: u32 },
    /// Raw line that mentioned buffering.
    Buffering(String),
    /// Raw line that indicated a dropped connection.
    Disconnect(String),
    /// Raw line that indicated the stream cannot be opened at all.
    Fatal(String),
}

/// Error raised when a probe cannot be started.
#[derive(Debug, Error)]
pub enum ProbeLaunchError {
    /// The probe executable could not be found
    #[error("probe binary not found: {0}")]
    BinaryNotFound(String),

    /// The stream URL could not be parsed
    #[error("malformed stream url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Any other spawn failure
    #[error("failed to spawn probe: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Launches probe sessions.
#[async_trait]
pub trait StreamProbe: Send + Sync {
    /// Start probing `url`. The session kills itself once `hard_timeout` elapses.
    async fn start(
        &self,
        url: &str,
        hard_timeout: Duration,
    ) -> Result<Box<dyn ProbeSession>, ProbeLaunchError>;
}

/// A live probe. Observations end when the process exits, is terminated or
/// hits its hard timeout.
#[async_trait]
pub trait ProbeSession: Send {
    /// Next observation, or `None` once the probe has ended.
    async fn next_observation(&mut self) -> Option<Observation>;

    /// Kill the probe and wait until the process and its pipes are released.
    /// Safe to call more than once.
    async fn terminate(&mut self);
}
