//! Shared result state
//!
//! One [`SharedState`] per process. The loop controller is its only writer;
//! the HTTP handlers and the results exporter read point-in-time snapshots.
//! Every write happens under a single write lock so a reader never observes
//! a half-applied channel update.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{
    unix_ms, Channel, ChannelStatus, CumulativeMetrics, IterationResult, LoopMode, Resolution,
    RunConfig, RunPhase,
};

/// Per-channel view served to pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSnapshot {
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
}

/// Run-level view served to pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunSnapshot {
    pub run_id: Option<Uuid>,
    pub phase: RunPhase,
    pub mode: LoopMode,
    pub current_iteration: u32,
    pub total_iterations: Option<u32>,
    pub started_at_unix_ms: Option<i64>,
    pub elapsed_secs: f64,
    /// Configured probe time per channel.
    pub duration_secs: f64,
    pub cancelled: bool,
}

/// Complete point-in-time view of the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateSnapshot {
    pub run: RunSnapshot,
    pub channels: Vec<ChannelSnapshot>,
}

impl StateSnapshot {
    pub fn testing_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.status == ChannelStatus::Testing)
            .count()
    }
}

#[derive(Debug)]
struct ChannelEntry {
    channel: Channel,
    result: IterationResult,
    cumulative: CumulativeMetrics,
}

impl ChannelEntry {
    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            name: self.channel.name.clone(),
            group: self.channel.group.clone(),
            url: self.channel.url.clone(),
            status: self.result.status,
            resolution: self.result.resolution.unwrap_or(Resolution::Unknown),
            seconds_tested: self.result.seconds_tested,
            detail: self.result.detail.clone(),
            total_disconnects: self.cumulative.total_disconnects,
            total_buffering_events: self.cumulative.total_buffering_events,
            total_seconds_tested: self.cumulative.total_seconds_tested,
        }
    }
}

#[derive(Debug, Default)]
struct ResultState {
    run_id: Option<Uuid>,
    phase: RunPhase,
    mode: LoopMode,
    current_iteration: u32,
    started_at_unix_ms: Option<i64>,
    started: Option<Instant>,
    /// Set when the run ends; elapsed time stops moving from then on.
    frozen_elapsed: Option<Duration>,
    duration: Duration,
    cancel: CancellationToken,
    channels: Vec<ChannelEntry>,
}

impl ResultState {
    fn elapsed_at(&self, now: Instant) -> Duration {
        match (self.frozen_elapsed, self.started) {
            (Some(frozen), _) => frozen,
            (None, Some(started)) => now.saturating_duration_since(started),
            (None, None) => Duration::ZERO,
        }
    }
}

/// Handle to the shared state. Cloning is cheap and every clone sees the same data.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<ResultState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent snapshot of the run and every channel.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot_at(Instant::now()).await
    }

    /// Snapshot with elapsed time computed against `now`.
    pub async fn snapshot_at(&self, now: Instant) -> StateSnapshot {
        let state = self.inner.read().await;
        StateSnapshot {
            run: RunSnapshot {
                run_id: state.run_id,
                phase: state.phase,
                mode: state.mode,
                current_iteration: state.current_iteration,
                total_iterations: state.mode.total_iterations(),
                started_at_unix_ms: state.started_at_unix_ms,
                elapsed_secs: state.elapsed_at(now).as_secs_f64(),
                duration_secs: state.duration.as_secs_f64(),
                cancelled: state.cancel.is_cancelled(),
            },
            channels: state.channels.iter().map(ChannelEntry::snapshot).collect(),
        }
    }

    /// Snapshot of a single channel, if the index exists.
    pub async fn channel(&self, index: usize) -> Option<ChannelSnapshot> {
        self.inner
            .read()
            .await
            .channels
            .get(index)
            .map(ChannelEntry::snapshot)
    }

    /// Ask the active run to stop. Returns false when no run is active.
    pub async fn request_cancel(&self) -> bool {
        let state = self.inner.read().await;
        if state.phase != RunPhase::Running {
            return false;
        }
        state.cancel.cancel();
        true
    }

    /// Replace any previous run with a fresh one at iteration 1.
    pub(crate) async fn begin_run(
        &self,
        channels: &[Channel],
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Uuid {
        let run_id = Uuid::new_v4();
        let mut state = self.inner.write().await;
        *state = ResultState {
            run_id: Some(run_id),
            phase: RunPhase::Running,
            mode: config.loop_mode,
            current_iteration: 1,
            started_at_unix_ms: Some(unix_ms()),
            started: Some(Instant::now()),
            frozen_elapsed: None,
            duration: config.duration,
            cancel,
            channels: channels
                .iter()
                .map(|channel| ChannelEntry {
                    channel: channel.clone(),
                    result: IterationResult::default(),
                    cumulative: CumulativeMetrics::default(),
                })
                .collect(),
        };
        run_id
    }

    /// Move to `iteration`, resetting per-iteration fields of every channel.
    pub(crate) async fn begin_iteration(&self, iteration: u32) {
        let mut state = self.inner.write().await;
        state.current_iteration = iteration;
        for entry in &mut state.channels {
            entry.result.reset_for_next_iteration();
        }
    }

    /// Publish a channel's current result and counters in one write.
    pub(crate) async fn update_channel(
        &self,
        index: usize,
        result: &IterationResult,
        cumulative: &CumulativeMetrics,
    ) {
        let mut state = self.inner.write().await;
        if let Some(entry) = state.channels.get_mut(index) {
            entry.result = result.clone();
            entry.cumulative = cumulative.clone();
        }
    }

    /// Enter a terminal phase and freeze the elapsed clock.
    pub(crate) async fn finish_run(&self, phase: RunPhase) {
        let now = Instant::now();
        let mut state = self.inner.write().await;
        let elapsed = state.elapsed_at(now);
        state.frozen_elapsed = Some(elapsed);
        state.phase = phase;
    }

    /// Cumulative counters of a channel, used to seed the runner.
    pub(crate) async fn channel_progress(
        &self,
        index: usize,
    ) -> Option<(Option<Resolution>, CumulativeMetrics)> {
        let state = self.inner.read().await;
        state
            .channels
            .get(index)
            .map(|entry| (entry.result.resolution, entry.cumulative.clone()))
    }

    pub(crate) fn reporter(&self, index: usize) -> ChannelReporter {
        ChannelReporter {
            state: self.clone(),
            index,
        }
    }
}

/// Write handle bound to one channel, handed to the runner.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    state: SharedState,
    index: usize,
}

impl ChannelReporter {
    pub async fn publish(&self, result: &IterationResult, cumulative: &CumulativeMetrics) {
        self.state
            .update_channel(self.index, result, cumulative)
            .await;
    }
}
