//! Loop controller
//!
//! Walks the channel list one channel at a time, repeats it according to the
//! loop mode and records every completed channel iteration. It is the only
//! writer of the shared state.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::model::{Channel, ChannelStatus, RunConfig, RunPhase};
use crate::probe::StreamProbe;
use crate::runner::ChannelTestRunner;
use crate::state::SharedState;
use crate::store::HistoryStore;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every requested iteration completed.
    Done { iterations: u32 },
    /// Cancellation was observed during `iteration`.
    Cancelled { iteration: u32 },
}

impl RunOutcome {
    pub fn phase(&self) -> RunPhase {
        match self {
            RunOutcome::Done { .. } => RunPhase::Done,
            RunOutcome::Cancelled { .. } => RunPhase::Cancelled,
        }
    }
}

pub struct LoopController {
    runner: ChannelTestRunner,
    state: SharedState,
    history: Option<HistoryStore>,
}

impl LoopController {
    pub fn new(runner: ChannelTestRunner, state: SharedState) -> Self {
        Self {
            runner,
            state,
            history: None,
        }
    }

    /// Persist each completed channel iteration to `history`.
    pub fn with_history(mut self, history: HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Execute a full run over `channels`.
    ///
    /// Starting a run replaces whatever the shared state held before. `cancel`
    /// is checked between channels and handed to the runner, which kills its
    /// probe when it fires.
    pub async fn run(
        &self,
        channels: &[Channel],
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let run_id = self
            .state
            .begin_run(channels, config, cancel.clone())
            .await;
        info!(
            %run_id,
            channels = channels.len(),
            mode = %config.loop_mode,
            duration_secs = config.duration.as_secs_f64(),
            "run started"
        );

        let mut iteration = 1u32;
        let outcome = 'run: loop {
            if channels.is_empty() {
                break RunOutcome::Done {
                    iterations: iteration,
                };
            }
            info!(iteration, total = ?config.loop_mode.total_iterations(), "iteration started");

            for (index, channel) in channels.iter().enumerate() {
                if cancel.is_cancelled() {
                    break 'run RunOutcome::Cancelled { iteration };
                }

                let Some((carried, mut cumulative)) = self.state.channel_progress(index).await
                else {
                    continue;
                };
                let reporter = self.state.reporter(index);
                let result = self
                    .runner
                    .run(channel, carried, &mut cumulative, &reporter, &cancel)
                    .await;

                if !result.status.is_terminal() {
                    break 'run RunOutcome::Cancelled { iteration };
                }
                self.record(index).await;
            }

            if !config.loop_mode.should_continue(iteration) {
                break RunOutcome::Done {
                    iterations: iteration,
                };
            }
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled { iteration };
            }
            iteration += 1;
            self.state.begin_iteration(iteration).await;
        };

        self.state.finish_run(outcome.phase()).await;
        let snapshot = self.state.snapshot().await;
        let passed = snapshot
            .channels
            .iter()
            .filter(|c| c.status == ChannelStatus::Pass)
            .count();
        let issues = snapshot
            .channels
            .iter()
            .filter(|c| c.status == ChannelStatus::Issue)
            .count();
        info!(
            %run_id,
            outcome = ?outcome,
            passed,
            issues,
            elapsed_secs = snapshot.run.elapsed_secs,
            "run finished"
        );
        outcome
    }

    /// Append the channel's completed iteration to history, if configured.
    async fn record(&self, index: usize) {
        let Some(history) = &self.history else {
            return;
        };
        let snapshot = self.state.snapshot().await;
        if let Err(e) = history.persist(&snapshot, index).await {
            error!(error = %e, path = %history.path().display(), "failed to write history record");
        }
    }
}

/// Build the controller's runner and wire it to `state`.
pub fn controller_for(
    probe: Arc<dyn StreamProbe>,
    config: &RunConfig,
    state: SharedState,
) -> LoopController {
    LoopController::new(ChannelTestRunner::new(probe, config), state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopMode, Resolution, RunnerPolicy};
    use crate::probe::Observation;
    use crate::state::StateSnapshot;
    use crate::testing::{emit, hang, video_1080p, wait_secs, ScriptedProbe};
    use std::time::Duration;
    use tempfile::TempDir;

    fn channels(n: usize) -> Vec<Channel> {
        (0..n)
            .map(|i| {
                Channel::new(
                    format!("Channel {}", i),
                    "Test",
                    format!("http://example.test/{}.ts", i),
                )
            })
            .collect()
    }

    fn config(mode: LoopMode) -> RunConfig {
        RunConfig::new(Duration::from_secs(10), mode, RunnerPolicy::default())
    }

    fn controller(probe: Arc<ScriptedProbe>, mode: LoopMode) -> LoopController {
        controller_for(probe, &config(mode), SharedState::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pass_over_all_channels() {
        let probe = Arc::new(ScriptedProbe::repeating(video_1080p()));
        let ctl = controller(probe.clone(), LoopMode::Single);

        let outcome = ctl
            .run(&channels(3), &config(LoopMode::Single), CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::Done { iterations: 1 });
        let snap = ctl.state().snapshot().await;
        assert_eq!(snap.run.phase, RunPhase::Done);
        assert!(snap.channels.iter().all(|c| c.status == ChannelStatus::Pass));
        assert!(snap
            .channels
            .iter()
            .all(|c| c.resolution == Resolution::Hd1080));
        assert_eq!(probe.start_count(), 3);
        assert_eq!(
            *probe.urls.lock().unwrap(),
            channels(3).into_iter().map(|c| c.url).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_three_freezes_at_three() {
        let probe = Arc::new(ScriptedProbe::repeating(video_1080p()));
        let ctl = controller(probe.clone(), LoopMode::Count(3));

        let outcome = ctl
            .run(&channels(2), &config(LoopMode::Count(3)), CancellationToken::new())
            .await;
        assert_eq!(outcome, RunOutcome::Done { iterations: 3 });
        assert_eq!(probe.start_count(), 6);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let snap = ctl.state().snapshot().await;
        assert_eq!(snap.run.current_iteration, 3);
        assert_eq!(snap.run.phase, RunPhase::Done);
        assert_eq!(snap.run.elapsed_secs, 60.0);
        assert_eq!(probe.start_count(), 6);
        for channel in &snap.channels {
            assert!((channel.total_seconds_tested - 30.0).abs() < 0.01);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_channel_list_completes() {
        let probe = Arc::new(ScriptedProbe::repeating(video_1080p()));
        let ctl = controller(probe.clone(), LoopMode::Infinite);
        let outcome = ctl
            .run(&[], &config(LoopMode::Infinite), CancellationToken::new())
            .await;
        assert_eq!(outcome, RunOutcome::Done { iterations: 1 });
        assert_eq!(ctl.state().snapshot().await.run.phase, RunPhase::Done);
        assert_eq!(probe.start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_monotonic_and_single_testing_channel() {
        let probe = Arc::new(ScriptedProbe::repeating(vec![
            emit(Observation::VideoDetected),
            wait_secs(3),
            emit(Observation::Buffering("buffer underrun".into())),
            wait_secs(3),
            emit(Observation::Disconnect("Connection reset by peer".into())),
        ]));
        let ctl = Arc::new(controller(probe, LoopMode::Count(3)));
        let cancel = CancellationToken::new();
        let worker = {
            let ctl = ctl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ctl.run(&channels(3), &config(LoopMode::Count(3)), cancel)
                    .await
            })
        };

        let mut previous: Option<StateSnapshot> = None;
        let mut saw_second_iteration = false;
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let snap = ctl.state().snapshot().await;
            assert!(snap.testing_count() <= 1);
            saw_second_iteration |= snap.run.current_iteration >= 2;
            if let Some(prev) = &previous {
                assert!(snap.run.current_iteration >= prev.run.current_iteration);
                for (now, before) in snap.channels.iter().zip(&prev.channels) {
                    assert!(now.total_buffering_events >= before.total_buffering_events);
                    assert!(now.total_disconnects >= before.total_disconnects);
                    assert!(now.total_seconds_tested >= before.total_seconds_tested);
                }
            }
            previous = Some(snap);
        }

        let outcome = worker.await.unwrap();
        assert_eq!(outcome, RunOutcome::Done { iterations: 3 });
        assert!(saw_second_iteration);
        let snap = ctl.state().snapshot().await;
        for channel in &snap.channels {
            assert!(channel.total_disconnects >= 3);
            assert!(channel.total_buffering_events >= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_iteration_terminates_probe() {
        let probe = Arc::new(ScriptedProbe::repeating(video_1080p()));
        let ctl = Arc::new(controller(probe.clone(), LoopMode::Infinite));
        let cancel = CancellationToken::new();
        let worker = {
            let ctl = ctl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ctl.run(&channels(3), &config(LoopMode::Infinite), cancel)
                    .await
            })
        };

        // Second channel of the first iteration is mid-probe at t=15s
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(probe.start_count(), 2);
        cancel.cancel();

        let outcome = worker.await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { iteration: 1 });
        assert_eq!(probe.termination_count(), probe.start_count());

        let snap = ctl.state().snapshot().await;
        assert_eq!(snap.run.phase, RunPhase::Cancelled);
        assert!(snap.run.cancelled);
        assert_eq!(snap.testing_count(), 0);
        assert_eq!(snap.channels[0].status, ChannelStatus::Pass);
        assert_eq!(snap.channels[1].status, ChannelStatus::Pending);
        assert_eq!(snap.channels[2].status, ChannelStatus::Pending);
        assert_eq!(probe.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_through_shared_state() {
        let probe = Arc::new(ScriptedProbe::repeating(vec![hang()]));
        let ctl = Arc::new(controller(probe.clone(), LoopMode::Infinite));
        let worker = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.run(&channels(1), &config(LoopMode::Infinite), CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(ctl.state().request_cancel().await);
        let outcome = worker.await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled { iteration: 3 });
        assert_eq!(probe.termination_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_records_each_completed_channel() {
        let dir = TempDir::new().unwrap();
        let history = HistoryStore::new(dir.path().join("history.jsonl"));
        let probe = Arc::new(ScriptedProbe::new(vec![video_1080p(), vec![hang()]]));
        let ctl = controller(probe, LoopMode::Count(2)).with_history(history.clone());

        ctl.run(&channels(2), &config(LoopMode::Count(2)), CancellationToken::new())
            .await;

        let records = history.load().await.unwrap();
        assert_eq!(records.len(), 4);
        let keys: Vec<_> = records
            .iter()
            .map(|r| (r.iteration, r.name.as_str(), r.status))
            .collect();
        assert_eq!(
            keys,
            vec![
                (1, "Channel 0", ChannelStatus::Pass),
                (1, "Channel 1", ChannelStatus::Issue),
                (2, "Channel 0", ChannelStatus::Issue),
                (2, "Channel 1", ChannelStatus::Issue),
            ]
        );
        // Resolution is carried into later iterations
        assert_eq!(records[2].resolution, Resolution::Hd1080);
        assert!(records.iter().all(|r| r.run_id == records[0].run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_does_not_abort_run() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let history = HistoryStore::new(blocker.join("history.jsonl"));

        let probe = Arc::new(ScriptedProbe::repeating(video_1080p()));
        let ctl = controller(probe.clone(), LoopMode::Count(2)).with_history(history);
        let outcome = ctl
            .run(&channels(2), &config(LoopMode::Count(2)), CancellationToken::new())
            .await;

        assert_eq!(outcome, RunOutcome::Done { iterations: 2 });
        assert_eq!(probe.start_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_zeroes_counters() {
        let probe = Arc::new(ScriptedProbe::repeating(vec![
            emit(Observation::VideoDetected),
            emit(Observation::Buffering("buffer".into())),
            hang(),
        ]));
        let ctl = controller(probe, LoopMode::Single);

        ctl.run(&channels(1), &config(LoopMode::Single), CancellationToken::new())
            .await;
        let first = ctl.state().snapshot().await;
        assert_eq!(first.channels[0].total_buffering_events, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        ctl.run(&channels(1), &config(LoopMode::Single), cancel).await;
        let second = ctl.state().snapshot().await;
        assert_ne!(first.run.run_id, second.run.run_id);
        assert_eq!(second.channels[0].total_buffering_events, 0);
        assert_eq!(second.channels[0].total_seconds_tested, 0.0);
        assert_eq!(second.run.phase, RunPhase::Cancelled);
    }
}
