//! Live results export.
//!
//! Writes the current snapshot to a JSON file once per second so static
//! dashboards can poll a file instead of the HTTP endpoint. Every write goes
//! to a sibling temp file first and is renamed over the target.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::{SharedState, StateSnapshot};

const EXPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Temp path next to `target`: `<name>.tmp`.
pub fn temp_path(target: &Path) -> PathBuf {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write `snapshot` to `target` via temp file and rename.
///
/// Readers of `target` see either the previous document or the new one, never
/// a partial write. On failure the temp file is removed.
pub async fn write_snapshot(target: &Path, snapshot: &StateSnapshot) -> Result<(), ExportError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = temp_path(target);

    let result = async {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, target).await
    }
    .await;

    if let Err(source) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ExportError::Write {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Spawn the periodic exporter. It writes once more after `shutdown` fires so
/// the file ends with the terminal state of the run.
pub fn spawn_exporter(
    state: SharedState,
    target: PathBuf,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPORT_INTERVAL);
        let mut failing = false;
        loop {
            let stop = tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = ticker.tick() => false,
            };

            match write_snapshot(&target, &state.snapshot().await).await {
                Ok(()) => {
                    if failing {
                        debug!(path = %target.display(), "results export recovered");
                    }
                    failing = false;
                }
                // Log the first failure of a streak only
                Err(e) if !failing => {
                    warn!(error = %e, "results export failed");
                    failing = true;
                }
                Err(_) => {}
            }

            if stop {
                break;
            }
        }
    })
}
