//! Subprocess-backed probe.
//!
//! Spawns the configured probe tool with stdout and stderr piped. One reader
//! task per pipe turns lines into observations and forwards them over a
//! bounded channel to the session.

use async_trait::async_trait;
use iptv_validator_config::ProbeConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::model::deadline_after;

use super::{Observation, ObservationParser, ProbeLaunchError, ProbeSession, StreamProbe};

const OBSERVATION_BUFFER: usize = 256;

/// Probe that runs an external tool such as ffmpeg or ffprobe.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    config: ProbeConfig,
}

impl ProcessProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn binary(&self) -> &str {
        &self.config.binary
    }

    fn build_command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.config.args_for(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl StreamProbe for ProcessProbe {
    async fn start(
        &self,
        url: &str,
        hard_timeout: Duration,
    ) -> Result<Box<dyn ProbeSession>, ProbeLaunchError> {
        Ok(Box::new(self.spawn_session(url, hard_timeout)?))
    }
}

impl ProcessProbe {
    fn spawn_session(
        &self,
        url: &str,
        hard_timeout: Duration,
    ) -> Result<ProcessSession, ProbeLaunchError> {
        url::Url::parse(url).map_err(|e| ProbeLaunchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut child = self.build_command(url).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeLaunchError::BinaryNotFound(self.config.binary.clone())
            } else {
                ProbeLaunchError::Spawn(e)
            }
        })?;
        debug!(binary = %self.config.binary, url, pid = ?child.id(), "probe started");

        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone(), "stderr"));
        }
        drop(tx);

        Ok(ProcessSession {
            child,
            rx,
            readers,
            deadline: deadline_after(Instant::now(), hard_timeout),
            kill_sent: false,
            released: false,
        })
    }
}

/// Read one pipe to EOF, forwarding parsed observations.
///
/// Lines are decoded lossily; stream metadata is not guaranteed to be UTF-8.
fn spawn_reader<R>(
    stream: R,
    tx: mpsc::Sender<Observation>,
    label: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut parser = ObservationParser::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    trace!(pipe = label, line = %line.trim_end(), "probe output");
                    for observation in parser.parse_line(&line) {
                        if tx.send(observation).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!(pipe = label, error = %e, "probe pipe read failed");
                    break;
                }
            }
        }
    })
}

struct ProcessSession {
    child: Child,
    rx: mpsc::Receiver<Observation>,
    readers: Vec<JoinHandle<()>>,
    deadline: Instant,
    /// The kill signal went out; cleanup may still be pending.
    kill_sent: bool,
    /// Process reaped and pipe readers finished.
    released: bool,
}

#[async_trait]
impl ProbeSession for ProcessSession {
    async fn next_observation(&mut self) -> Option<Observation> {
        if self.released {
            return None;
        }
        if self.kill_sent {
            // A previous terminate was interrupted; finish it
            self.terminate().await;
            return None;
        }
        tokio::select! {
            observation = self.rx.recv() => match observation {
                Some(observation) => Some(observation),
                None => {
                    // Both pipes closed: the process is gone or about to be
                    self.terminate().await;
                    None
                }
            },
            _ = sleep_until(self.deadline) => {
                warn!(pid = ?self.child.id(), "probe hit its hard timeout, killing");
                self.terminate().await;
                None
            }
        }
    }

    /// Every step can be resumed if the future is dropped part way through.
    async fn terminate(&mut self) {
        if self.released {
            return;
        }
        if !self.kill_sent {
            if let Err(e) = self.child.start_kill() {
                trace!(error = %e, "probe already exited");
            }
            self.kill_sent = true;
        }
        match self.child.wait().await {
            Ok(status) => debug!(%status, "probe reaped"),
            Err(e) => warn!(error = %e, "failed to reap probe"),
        }

        // Grandchildren may still hold the pipes open; drop our ends regardless
        self.rx.close();
        for reader in &self.readers {
            reader.abort();
        }
        while let Some(reader) = self.readers.last_mut() {
            let _ = reader.await;
            self.readers.pop();
        }
        self.released = true;
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
