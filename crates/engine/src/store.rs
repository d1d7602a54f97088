//! Append-only history of completed channel iterations.
//!
//! Records are stored as JSON Lines, one record per completed channel per
//! iteration, in completion order. A record is written with a single
//! `write_all` so a concurrent reader sees at worst a truncated last line,
//! which [`HistoryStore::load`] skips.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::model::{unix_ms, ChannelStatus, LoopMode, Resolution};
use crate::state::StateSnapshot;

/// Errors from reading or writing the history file
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot has no channel at index {0}")]
    MissingChannel(usize),

    #[error("snapshot has no active run")]
    NoRun,
}

/// One completed channel iteration.
///
/// Keyed by run start timestamp, iteration index and channel URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub run_id: Uuid,
    pub run_started_at_unix_ms: i64,
    pub mode: LoopMode,
    pub iteration: u32,
    pub name: String,
    pub group: String,
    pub url: String,
    pub status: ChannelStatus,
    pub resolution: Resolution,
    pub seconds_tested: f64,
    pub detail: String,
    pub total_disconnects: u64,
    pub total_buffering_events: u64,
    pub total_seconds_tested: f64,
    pub completed_at_unix_ms: i64,
}

impl HistoryRecord {
    /// Build the record for channel `index` out of a snapshot.
    pub fn from_snapshot(snapshot: &StateSnapshot, index: usize) -> Result<Self, StoreError> {
        let run = &snapshot.run;
        let (run_id, started) = match (run.run_id, run.started_at_unix_ms) {
            (Some(id), Some(started)) => (id, started),
            _ => return Err(StoreError::NoRun),
        };
        let channel = snapshot
            .channels
            .get(index)
            .ok_or(StoreError::MissingChannel(index))?;

        Ok(Self {
            run_id,
            run_started_at_unix_ms: started,
            mode: run.mode,
            iteration: run.current_iteration,
            name: channel.name.clone(),
            group: channel.group.clone(),
            url: channel.url.clone(),
            status: channel.status,
            resolution: channel.resolution,
            seconds_tested: channel.seconds_tested,
            detail: channel.detail.clone(),
            total_disconnects: channel.total_disconnects,
            total_buffering_events: channel.total_buffering_events,
            total_seconds_tested: channel.total_seconds_tested,
            completed_at_unix_ms: unix_ms(),
        })
    }
}

/// JSON Lines file holding [`HistoryRecord`]s.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one record, creating the file and its parent directory if needed.
    pub async fn append(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&line).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Append the record for channel `index` of `snapshot`.
    pub async fn persist(&self, snapshot: &StateSnapshot, index: usize) -> Result<(), StoreError> {
        let record = HistoryRecord::from_snapshot(snapshot, index)?;
        self.append(&record).await
    }

    /// Read every record. A missing file is an empty history; lines that do not
    /// parse are skipped with a warning.
    pub async fn load(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = number + 1,
                    error = %e,
                    "skipping unreadable history line"
                ),
            }
        }
        Ok(records)
    }
}
