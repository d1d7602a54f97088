//! Validator startup and run orchestration
//!
//! Wires the probe, the loop controller, the HTTP server and the results
//! exporter together around one shared state.

use iptv_validator_config::{Config, ConfigError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::controller::{controller_for, RunOutcome};
use crate::export::spawn_exporter;
use crate::model::{Channel, RunConfig};
use crate::playlist::PlaylistError;
use crate::probe::{ProcessProbe, StreamProbe};
use crate::selection::SelectionError;
use crate::server::{self, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError, ToolVersion};
use crate::state::SharedState;
use crate::store::HistoryStore;

/// Error type for validator operations
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

/// Runtime components shared by one process.
pub struct Validator {
    config: Config,
    probe: Arc<dyn StreamProbe>,
    state: SharedState,
    history: HistoryStore,
}

impl Validator {
    /// Validator that probes with the configured external tool.
    pub fn new(config: Config) -> Self {
        let probe = Arc::new(ProcessProbe::new(config.probe.clone()));
        Self::with_probe(config, probe)
    }

    /// Validator with a caller-supplied probe.
    pub fn with_probe(config: Config, probe: Arc<dyn StreamProbe>) -> Self {
        let history = HistoryStore::new(config.store.history_path.clone());
        Self {
            config,
            probe,
            state: SharedState::new(),
            history,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Check that the probe tool is usable.
    pub async fn startup_checks(&self) -> Result<ToolVersion, ValidatorError> {
        Ok(run_startup_checks(&self.config.probe).await?)
    }

    /// Serve results and run the loop controller until it finishes or
    /// `cancel` fires.
    ///
    /// # Arguments
    /// * `channels` - Channels to test, in order
    /// * `run_config` - Duration, loop mode and policy of this run
    /// * `cancel` - Cancels the run; the HTTP `/cancel` route fires the same token
    ///
    /// # Returns
    /// * `Ok(RunOutcome)` - The run reached `done` or `cancelled`
    /// * `Err(ValidatorError)` - The server address could not be bound
    pub async fn run(
        &self,
        channels: &[Channel],
        run_config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ValidatorError> {
        let addr = server::parse_bind(&self.config.server.bind)?;
        let listener = server::bind(addr).await?;

        let shutdown = CancellationToken::new();
        let app = AppState {
            state: self.state.clone(),
            history: self.history.clone(),
        };
        let server_task = tokio::spawn(server::serve(listener, app, shutdown.clone()));

        let exporter = self.config.store.results_path.clone().map(|path| {
            info!(path = %path.display(), "exporting live results");
            spawn_exporter(self.state.clone(), path, shutdown.clone())
        });

        let controller = controller_for(self.probe.clone(), run_config, self.state.clone())
            .with_history(self.history.clone());
        let outcome = controller.run(channels, run_config, cancel).await;

        shutdown.cancel();
        if let Some(exporter) = exporter {
            if let Err(e) = exporter.await {
                error!(error = %e, "results exporter task failed");
            }
        }
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "http server stopped with an error"),
            Err(e) => error!(error = %e, "http server task failed"),
        }
        Ok(outcome)
    }
}
