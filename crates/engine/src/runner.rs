//! Channel test runner
//!
//! Drives probe sessions against one channel for a fixed wall-clock budget and
//! turns the observations into an [`IterationResult`]. Disconnects restart the
//! probe up to the reconnect ceiling; a probe that exits by itself is
//! relaunched after the re-probe interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{
    deadline_after, Channel, ChannelStatus, CumulativeMetrics, IterationResult, Resolution, RunConfig,
    RunnerPolicy,
};
use crate::probe::{Observation, ProbeLaunchError, ProbeSession, StreamProbe};
use crate::state::ChannelReporter;

/// How often progress is published while no observation arrives.
const PUBLISH_TICK: Duration = Duration::from_secs(1);

pub const NO_STREAM_DETECTED: &str = "no stream detected";
pub const CANCELLED: &str = "cancelled";

/// Why one probe session stopped.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Deadline,
    /// The probe ended on its own.
    Exited,
    Disconnected(String),
    Fatal(String),
}

/// Why the whole iteration stopped.
#[derive(Debug)]
enum Outcome {
    Deadline,
    Cancelled,
    ReconnectCeilingExceeded { disconnects: u32, line: String },
    Fatal(String),
    LaunchFailed(ProbeLaunchError),
}

/// Mutable per-iteration bookkeeping.
struct Progress {
    result: IterationResult,
    started: Instant,
    accounted: Duration,
    video: bool,
    audio: bool,
    frame_size: Option<(u32, u32)>,
    buffering: u32,
    last_buffering: Option<String>,
    disconnects: u32,
}

impl Progress {
    fn new(carried: Option<Resolution>) -> Self {
        Self {
            result: IterationResult::testing(carried),
            started: Instant::now(),
            accounted: Duration::ZERO,
            video: false,
            audio: false,
            frame_size: None,
            buffering: 0,
            last_buffering: None,
            disconnects: 0,
        }
    }

    /// Bring seconds tested up to now and add the delta to the run totals.
    fn account(&mut self, cumulative: &mut CumulativeMetrics) {
        let elapsed = self.started.elapsed();
        let delta = elapsed.saturating_sub(self.accounted);
        cumulative.total_seconds_tested += delta.as_secs_f64();
        self.accounted = elapsed;
        self.result.seconds_tested = elapsed.as_secs_f64();
    }

    fn observe(
        &mut self,
        observation: Observation,
        cumulative: &mut CumulativeMetrics,
    ) -> Option<SessionEnd> {
        let end = match observation {
            Observation::VideoDetected => {
                self.video = true;
                None
            }
            Observation::AudioDetected => {
                self.audio = true;
                None
            }
            Observation::Resolution { width, height } => {
                self.video = true;
                self.frame_size = Some((width, height));
                self.result.resolution = Some(Resolution::from_dimensions(width, height));
                None
            }
            Observation::Buffering(line) => {
                self.buffering += 1;
                cumulative.total_buffering_events += 1;
                debug!(%line, "buffering");
                self.last_buffering = Some(line);
                None
            }
            Observation::Disconnect(line) => {
                self.disconnects += 1;
                cumulative.total_disconnects += 1;
                Some(SessionEnd::Disconnected(line))
            }
            Observation::Fatal(line) => Some(SessionEnd::Fatal(line)),
        };
        self.result.detail = self.describe();
        end
    }

    fn stream_seen(&self) -> bool {
        self.video || self.audio
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        match (self.video, self.audio) {
            (true, true) => parts.push("video+audio".to_string()),
            (true, false) => parts.push("video".to_string()),
            (false, true) => parts.push("audio only".to_string()),
            (false, false) => {}
        }
        if let Some((width, height)) = self.frame_size {
            parts.push(format!("{}x{}", width, height));
        }
        match &self.last_buffering {
            Some(line) => parts.push(format!("buffering x{}: {}", self.buffering, line)),
            None if self.buffering > 0 => parts.push(format!("buffering x{}", self.buffering)),
            None => {}
        }
        if self.disconnects > 0 {
            parts.push(format!("disconnects x{}", self.disconnects));
        }
        parts.join(", ")
    }

    /// `headline` followed by whatever was observed so far.
    fn describe_with(&self, headline: &str) -> String {
        let observed = self.describe();
        if observed.is_empty() {
            headline.to_string()
        } else {
            format!("{} ({})", headline, observed)
        }
    }
}

/// Runs one channel for one iteration.
pub struct ChannelTestRunner {
    probe: Arc<dyn StreamProbe>,
    duration: Duration,
    policy: RunnerPolicy,
}

impl ChannelTestRunner {
    pub fn new(probe: Arc<dyn StreamProbe>, config: &RunConfig) -> Self {
        Self {
            probe,
            duration: config.duration,
            policy: config.policy.clone(),
        }
    }

    /// Probe `channel` until the duration elapses, the probe fails or `cancel`
    /// fires.
    ///
    /// # Arguments
    /// * `carried` - Resolution from earlier iterations, kept unless re-detected
    /// * `cumulative` - Run totals for this channel, updated in place
    /// * `reporter` - Receives progress on every observation and once per second
    ///
    /// # Returns
    /// The iteration result. A cancelled iteration reports `pending` with
    /// detail `cancelled`.
    pub async fn run(
        &self,
        channel: &Channel,
        carried: Option<Resolution>,
        cumulative: &mut CumulativeMetrics,
        reporter: &ChannelReporter,
        cancel: &CancellationToken,
    ) -> IterationResult {
        let mut progress = Progress::new(carried);
        let deadline = deadline_after(progress.started, self.duration);
        reporter.publish(&progress.result, cumulative).await;
        info!(channel = %channel.name, url = %channel.url, "testing channel");

        let outcome = loop {
            if cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Outcome::Deadline;
            }

            let mut session = match self
                .probe
                .start(&channel.url, remaining.saturating_add(self.policy.grace))
                .await
            {
                Ok(session) => session,
                Err(e) => break Outcome::LaunchFailed(e),
            };
            let end = drive(
                session.as_mut(),
                deadline,
                &mut progress,
                cumulative,
                reporter,
                cancel,
            )
            .await;
            session.terminate().await;

            match end {
                SessionEnd::Cancelled => break Outcome::Cancelled,
                SessionEnd::Deadline => break Outcome::Deadline,
                SessionEnd::Fatal(line) => break Outcome::Fatal(line),
                SessionEnd::Disconnected(line) => {
                    if progress.disconnects > self.policy.max_reconnects {
                        break Outcome::ReconnectCeilingExceeded {
                            disconnects: progress.disconnects,
                            line,
                        };
                    }
                    warn!(
                        channel = %channel.name,
                        attempt = progress.disconnects,
                        max = self.policy.max_reconnects,
                        %line,
                        "disconnected, reconnecting"
                    );
                }
                SessionEnd::Exited => {
                    let resume = deadline_after(Instant::now(), self.policy.reprobe_interval).min(deadline);
                    debug!(channel = %channel.name, "probe exited, re-probing");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Outcome::Cancelled,
                        _ = sleep_until(resume) => {}
                    }
                }
            }
        };

        progress.account(cumulative);
        let (status, detail) = match outcome {
            Outcome::Deadline if progress.stream_seen() => (ChannelStatus::Pass, progress.describe()),
            Outcome::Deadline => (
                ChannelStatus::Issue,
                progress.describe_with(NO_STREAM_DETECTED),
            ),
            Outcome::Cancelled => (ChannelStatus::Pending, CANCELLED.to_string()),
            Outcome::ReconnectCeilingExceeded { disconnects, line } => (
                ChannelStatus::Issue,
                format!(
                    "reconnect limit exceeded after {} disconnects: {}",
                    disconnects, line
                ),
            ),
            Outcome::Fatal(line) => (ChannelStatus::Issue, line),
            Outcome::LaunchFailed(e) => {
                (ChannelStatus::Issue, format!("probe launch failed: {}", e))
            }
        };
        progress.result.status = status;
        progress.result.detail = detail;
        let result = progress.result.clone();
        reporter.publish(&result, cumulative).await;

        match result.status {
            ChannelStatus::Pass => info!(
                channel = %channel.name,
                resolution = ?result.resolution,
                seconds = result.seconds_tested,
                detail = %result.detail,
                "channel pass"
            ),
            ChannelStatus::Issue => warn!(
                channel = %channel.name,
                seconds = result.seconds_tested,
                detail = %result.detail,
                "channel issue"
            ),
            _ => info!(channel = %channel.name, "channel test cancelled"),
        }
        result
    }
}

/// Pump one session until it ends, the deadline passes or cancellation.
async fn drive(
    session: &mut dyn ProbeSession,
    deadline: Instant,
    progress: &mut Progress,
    cumulative: &mut CumulativeMetrics,
    reporter: &ChannelReporter,
    cancel: &CancellationToken,
) -> SessionEnd {
    let mut ticker = interval_at(Instant::now() + PUBLISH_TICK, PUBLISH_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = sleep_until(deadline) => return SessionEnd::Deadline,
            _ = ticker.tick() => {
                progress.account(cumulative);
                reporter.publish(&progress.result, cumulative).await;
            }
            observation = session.next_observation() => {
                let Some(observation) = observation else {
                    return SessionEnd::Exited;
                };
                progress.account(cumulative);
                let end = progress.observe(observation, cumulative);
                reporter.publish(&progress.result, cumulative).await;
                if let Some(end) = end {
                    return end;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopMode, RunConfig};
    use crate::state::SharedState;
    use crate::testing::{emit, hang, video_1080p, wait_secs, ScriptedProbe};

    const DURATION: Duration = Duration::from_secs(30);

    fn policy(max_reconnects: u32) -> RunnerPolicy {
        RunnerPolicy {
            max_reconnects,
            grace: Duration::from_secs(5),
            reprobe_interval: Duration::from_secs(1),
        }
    }

    struct Harness {
        probe: Arc<ScriptedProbe>,
        runner: ChannelTestRunner,
        state: SharedState,
        channel: Channel,
    }

    async fn harness(probe: ScriptedProbe, max_reconnects: u32) -> Harness {
        let probe = Arc::new(probe);
        let config = RunConfig::new(DURATION, LoopMode::Single, policy(max_reconnects));
        let channel = Channel::new("Sports HD", "Sports", "http://example.test/sports.ts");
        let state = SharedState::new();
        state
            .begin_run(std::slice::from_ref(&channel), &config, CancellationToken::new())
            .await;
        Harness {
            runner: ChannelTestRunner::new(probe.clone(), &config),
            probe,
            state,
            channel,
        }
    }

    impl Harness {
        async fn run(&self, cumulative: &mut CumulativeMetrics) -> IterationResult {
            self.runner
                .run(
                    &self.channel,
                    None,
                    cumulative,
                    &self.state.reporter(0),
                    &CancellationToken::new(),
                )
                .await
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.01
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_1080p_stream_passes() {
        let h = harness(ScriptedProbe::new(vec![video_1080p()]), 5).await;
        let mut cumulative = CumulativeMetrics::default();
        let result = h.run(&mut cumulative).await;

        assert_eq!(result.status, ChannelStatus::Pass);
        assert_eq!(result.resolution, Some(Resolution::Hd1080));
        assert!(approx(result.seconds_tested, 30.0));
        assert!(approx(cumulative.total_seconds_tested, 30.0));
        assert_eq!(cumulative.total_disconnects, 0);
        assert_eq!(cumulative.total_buffering_events, 0);
        assert!(result.detail.contains("1920x1080"));
        assert_eq!(h.probe.start_count(), 1);
        assert_eq!(h.probe.termination_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_is_remaining_plus_grace() {
        let h = harness(ScriptedProbe::new(vec![video_1080p()]), 5).await;
        h.run(&mut CumulativeMetrics::default()).await;

        let timeouts = h.probe.hard_timeouts.lock().unwrap().clone();
        assert_eq!(timeouts, vec![DURATION + Duration::from_secs(5)]);
        assert_eq!(
            *h.probe.urls.lock().unwrap(),
            vec!["http://example.test/sports.ts".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_disconnects_then_stream_passes() {
        let probe = ScriptedProbe::new(vec![
            vec![wait_secs(5), emit(Observation::Disconnect("Connection reset by peer".into()))],
            vec![wait_secs(5), emit(Observation::Disconnect("Connection timed out".into()))],
            vec![emit(Observation::VideoDetected), emit(Observation::AudioDetected), hang()],
        ]);
        let h = harness(probe, 5).await;
        let mut cumulative = CumulativeMetrics::default();
        let result = h.run(&mut cumulative).await;

        assert_eq!(result.status, ChannelStatus::Pass);
        assert_eq!(cumulative.total_disconnects, 2);
        assert!(approx(result.seconds_tested, 30.0));
        assert_eq!(h.probe.start_count(), 3);
        assert_eq!(h.probe.termination_count(), 3);

        // Later launches only get what is left of the budget
        let timeouts = h.probe.hard_timeouts.lock().unwrap().clone();
        assert_eq!(timeouts[1], Duration::from_secs(25 + 5));
        assert_eq!(timeouts[2], Duration::from_secs(20 + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stream_is_an_issue() {
        let h = harness(ScriptedProbe::new(vec![vec![hang()]]), 5).await;
        let result = h.run(&mut CumulativeMetrics::default()).await;

        assert_eq!(result.status, ChannelStatus::Issue);
        assert!(result.detail.contains(NO_STREAM_DETECTED));
        assert!(approx(result.seconds_tested, 30.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_ceiling_ends_iteration_early() {
        let probe = ScriptedProbe::repeating(vec![
            emit(Observation::VideoDetected),
            wait_secs(2),
            emit(Observation::Disconnect("Broken pipe".into())),
        ]);
        let h = harness(probe, 2).await;
        let mut cumulative = CumulativeMetrics::default();
        let result = h.run(&mut cumulative).await;

        assert_eq!(result.status, ChannelStatus::Issue);
        assert!(result.detail.starts_with("reconnect limit exceeded after 3"));
        assert_eq!(cumulative.total_disconnects, 3);
        assert_eq!(h.probe.start_count(), 3);
        assert!(approx(result.seconds_tested, 6.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_line_ends_iteration() {
        let line = "http://example.test/sports.ts: Server returned 404 Not Found";
        let probe = ScriptedProbe::new(vec![vec![
            wait_secs(1),
            emit(Observation::Fatal(line.to_string())),
            hang(),
        ]]);
        let h = harness(probe, 5).await;
        let result = h.run(&mut CumulativeMetrics::default()).await;

        assert_eq!(result.status, ChannelStatus::Issue);
        assert_eq!(result.detail, line);
        assert!(approx(result.seconds_tested, 1.0));
        assert_eq!(h.probe.termination_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_an_issue() {
        let h = harness(ScriptedProbe::failing(), 5).await;
        let result = h.run(&mut CumulativeMetrics::default()).await;

        assert_eq!(result.status, ChannelStatus::Issue);
        assert!(result.detail.starts_with("probe launch failed"));
        assert!(result.detail.contains("ffmpeg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_probe_is_relaunched_without_counting_disconnect() {
        let probe = ScriptedProbe::new(vec![
            vec![emit(Observation::VideoDetected), wait_secs(3)],
            vec![emit(Observation::VideoDetected), hang()],
        ]);
        let h = harness(probe, 0).await;
        let mut cumulative = CumulativeMetrics::default();
        let result = h.run(&mut cumulative).await;

        assert_eq!(result.status, ChannelStatus::Pass);
        assert_eq!(cumulative.total_disconnects, 0);
        assert_eq!(h.probe.start_count(), 2);
        // 3s probe plus the 1s re-probe pause
        let timeouts = h.probe.hard_timeouts.lock().unwrap().clone();
        assert_eq!(timeouts[1], Duration::from_secs(26 + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffering_counts_accumulate() {
        let probe = ScriptedProbe::new(vec![vec![
            emit(Observation::VideoDetected),
            emit(Observation::Buffering("buffer underflow".into())),
            wait_secs(4),
            emit(Observation::Buffering("[hls] circular buffer overrun".into())),
            hang(),
        ]]);
        let h = harness(probe, 5).await;
        let mut cumulative = CumulativeMetrics {
            total_buffering_events: 7,
            total_disconnects: 1,
            total_seconds_tested: 60.0,
        };
        let result = h.run(&mut cumulative).await;

        assert_eq!(result.status, ChannelStatus::Pass);
        assert_eq!(cumulative.total_buffering_events, 9);
        assert_eq!(cumulative.total_disconnects, 1);
        assert!(approx(cumulative.total_seconds_tested, 90.0));
        assert!(result
            .detail
            .contains("buffering x2: [hls] circular buffer overrun"));
        assert!(!result.detail.contains("underflow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_carried_resolution_survives() {
        let probe = ScriptedProbe::new(vec![vec![emit(Observation::AudioDetected), hang()]]);
        let h = harness(probe, 5).await;
        let result = h
            .runner
            .run(
                &h.channel,
                Some(Resolution::Hd720),
                &mut CumulativeMetrics::default(),
                &h.state.reporter(0),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ChannelStatus::Pass);
        assert_eq!(result.resolution, Some(Resolution::Hd720));
        assert_eq!(result.detail, "audio only");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_resolution_wins() {
        let probe = ScriptedProbe::new(vec![vec![
            emit(Observation::Resolution { width: 3840, height: 2160 }),
            wait_secs(1),
            emit(Observation::Resolution { width: 1280, height: 720 }),
            hang(),
        ]]);
        let h = harness(probe, 5).await;
        let result = h.run(&mut CumulativeMetrics::default()).await;
        assert_eq!(result.resolution, Some(Resolution::Hd720));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_terminates_probe() {
        let h = harness(ScriptedProbe::new(vec![video_1080p()]), 5).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let mut cumulative = CumulativeMetrics::default();
        let result = h
            .runner
            .run(&h.channel, None, &mut cumulative, &h.state.reporter(0), &cancel)
            .await;

        assert_eq!(result.status, ChannelStatus::Pending);
        assert_eq!(result.detail, CANCELLED);
        assert!(approx(result.seconds_tested, 10.0));
        assert_eq!(h.probe.termination_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_duration_runs_until_cancelled() {
        let probe = Arc::new(ScriptedProbe::new(vec![video_1080p()]));
        let config = RunConfig::new(Duration::MAX, LoopMode::Single, policy(5));
        let channel = Channel::new("Sports HD", "Sports", "http://example.test/sports.ts");
        let state = SharedState::new();
        state
            .begin_run(std::slice::from_ref(&channel), &config, CancellationToken::new())
            .await;
        let runner = ChannelTestRunner::new(probe.clone(), &config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let mut cumulative = CumulativeMetrics::default();
        let result = runner
            .run(&channel, None, &mut cumulative, &state.reporter(0), &cancel)
            .await;

        assert_eq!(result.status, ChannelStatus::Pending);
        assert!(approx(result.seconds_tested, 10.0));
        let timeouts = probe.hard_timeouts.lock().unwrap().clone();
        assert_eq!(timeouts.len(), 1);
        assert!(timeouts[0] > Duration::from_secs(365 * 86_400));
        assert_eq!(probe.termination_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_visible_while_testing() {
        let h = Arc::new(harness(ScriptedProbe::new(vec![video_1080p()]), 5).await);
        let worker = {
            let h = h.clone();
            tokio::spawn(async move { h.run(&mut CumulativeMetrics::default()).await })
        };

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        let snap = h.state.snapshot().await;
        assert_eq!(snap.testing_count(), 1);
        assert_eq!(snap.channels[0].resolution, Resolution::Hd1080);
        assert!(snap.channels[0].seconds_tested >= 12.0);

        let result = worker.await.unwrap();
        assert_eq!(result.status, ChannelStatus::Pass);
        let snap = h.state.snapshot().await;
        assert_eq!(snap.testing_count(), 0);
        assert_eq!(snap.channels[0].status, ChannelStatus::Pass);
    }
}
