//! CLI entry point for the IPTV stream validator
//!
//! Loads the playlist, applies the channel selection and runs the validator
//! until the loop completes or the process is interrupted.

use clap::Parser;
use iptv_validator::model::{LoopMode, RunnerPolicy};
use iptv_validator::{
    build_run_config, load_playlist, load_selection_file, parse_duration, Channel, Config,
    FetchPolicy, RunConfig, RunOutcome, Selection, SelectionError, Validator, ValidatorError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// IPTV stream validator - sequential per-channel stream health checks
#[derive(Parser, Debug)]
#[command(name = "iptv-validator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Playlist to validate: a local M3U file or an http(s) URL
    source: String,

    /// Path to the configuration file (optional; defaults apply when missing)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Test duration per channel, e.g. 90, 45s, 1.5m, 2h
    #[arg(short, long)]
    duration: Option<String>,

    /// Loop mode: single, count:N or infinite
    #[arg(short = 'l', long = "loop")]
    loop_mode: Option<String>,

    /// Only test channels in this group (repeatable)
    #[arg(short, long = "group")]
    groups: Vec<String>,

    /// Only test channels whose name contains this text (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// JSON file listing the channels to test by url
    #[arg(long)]
    selection_file: Option<PathBuf>,

    /// Address of the results server, overrides server.bind
    #[arg(long)]
    bind: Option<String>,

    /// Skip the probe tool check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("iptv_validator=info,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_config(args: &Args, config: &Config) -> Result<RunConfig, SelectionError> {
    let duration = match &args.duration {
        Some(raw) => parse_duration(raw)?,
        None => Duration::from_secs(config.run.duration_secs),
    };
    let loop_mode: LoopMode = args
        .loop_mode
        .as_deref()
        .unwrap_or(&config.run.loop_mode)
        .parse()?;
    build_run_config(duration, loop_mode, RunnerPolicy::from(&config.policy))
}

async fn selected_channels(args: &Args) -> Result<Vec<Channel>, ValidatorError> {
    let playlist = load_playlist(&args.source, FetchPolicy::default()).await?;
    let total = playlist.len();

    let mut selection = Selection {
        groups: args.groups.clone(),
        name_patterns: args.channels.clone(),
        ..Selection::default()
    };
    if let Some(path) = &args.selection_file {
        selection.urls = load_selection_file(path)?;
    }

    let channels = selection.apply(playlist)?;
    info!(selected = channels.len(), total, "channels selected");
    Ok(channels)
}

/// Everything that can fail before the first channel is probed.
async fn prepare(args: &Args) -> Result<(Validator, Vec<Channel>, RunConfig), ValidatorError> {
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    let run_config = run_config(args, &config)?;

    let validator = Validator::new(config);
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else {
        validator.startup_checks().await?;
    }

    let channels = selected_channels(args).await?;
    Ok((validator, channels, run_config))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let (validator, channels, run_config) = match prepare(&args).await {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    info!(
        bind = %validator.config().server.bind,
        history = %validator.history().path().display(),
        "serving results"
    );

    match validator.run(&channels, &run_config, cancel).await {
        Ok(RunOutcome::Done { iterations }) => {
            info!(iterations, "validation finished");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Cancelled { iteration }) => {
            info!(iteration, "validation cancelled");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "validator failed");
            ExitCode::FAILURE
        }
    }
}
