//! Scripted in-memory probe for runner and controller tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::probe::{Observation, ProbeLaunchError, ProbeSession, StreamProbe};

#[derive(Debug, Clone)]
pub enum Step {
    Emit(Observation),
    Wait(Duration),
}

pub fn emit(observation: Observation) -> Step {
    Step::Emit(observation)
}

pub fn wait_secs(secs: u64) -> Step {
    Step::Wait(Duration::from_secs(secs))
}

/// Never yields again within any test's duration.
pub fn hang() -> Step {
    Step::Wait(Duration::from_secs(24 * 3600))
}

pub fn video_1080p() -> Vec<Step> {
    vec![
        emit(Observation::VideoDetected),
        emit(Observation::Resolution {
            width: 1920,
            height: 1080,
        }),
        hang(),
    ]
}

/// Probe that hands out pre-scripted sessions in order. Once the queue is
/// exhausted it falls back to `fallback` for every further start.
pub struct ScriptedProbe {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fallback: Vec<Step>,
    fail_launch: bool,
    pub starts: AtomicUsize,
    pub terminations: Arc<AtomicUsize>,
    pub hard_timeouts: Mutex<Vec<Duration>>,
    pub urls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: vec![hang()],
            fail_launch: false,
            starts: AtomicUsize::new(0),
            terminations: Arc::new(AtomicUsize::new(0)),
            hard_timeouts: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// Every session runs `script`.
    pub fn repeating(script: Vec<Step>) -> Self {
        let mut probe = Self::new(Vec::new());
        probe.fallback = script;
        probe
    }

    pub fn failing() -> Self {
        let mut probe = Self::new(Vec::new());
        probe.fail_launch = true;
        probe
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamProbe for ScriptedProbe {
    async fn start(
        &self,
        url: &str,
        hard_timeout: Duration,
    ) -> Result<Box<dyn ProbeSession>, ProbeLaunchError> {
        if self.fail_launch {
            return Err(ProbeLaunchError::BinaryNotFound("ffmpeg".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.hard_timeouts.lock().unwrap().push(hard_timeout);
        self.urls.lock().unwrap().push(url.to_string());

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Box::new(ScriptedSession {
            steps: steps.into(),
            resume_at: None,
            terminated: false,
            terminations: self.terminations.clone(),
        }))
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    /// Kept across calls so a dropped `next_observation` future resumes the same wait.
    resume_at: Option<Instant>,
    terminated: bool,
    terminations: Arc<AtomicUsize>,
}

#[async_trait]
impl ProbeSession for ScriptedSession {
    async fn next_observation(&mut self) -> Option<Observation> {
        loop {
            if self.terminated {
                return None;
            }
            if let Some(until) = self.resume_at {
                sleep_until(until).await;
                self.resume_at = None;
            }
            match self.steps.pop_front() {
                Some(Step::Emit(observation)) => return Some(observation),
                Some(Step::Wait(duration)) => self.resume_at = Some(Instant::now() + duration),
                None => return None,
            }
        }
    }

    async fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }
}
