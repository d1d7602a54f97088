//! IPTV stream validator
//!
//! Tests the channels of an M3U playlist one at a time against an external
//! probe tool, repeats the sweep according to a loop mode, and serves live
//! per-channel results over HTTP.

pub mod controller;
pub mod export;
pub mod model;
pub mod playlist;
pub mod probe;
pub mod runner;
pub mod selection;
pub mod server;
pub mod startup;
pub mod state;
pub mod store;
pub mod validator;

#[cfg(test)]
mod testing;

pub use iptv_validator_config as config;
pub use iptv_validator_config::Config;
pub use controller::{controller_for, LoopController, RunOutcome};
pub use export::{spawn_exporter, write_snapshot, ExportError};
pub use model::{
    Channel, ChannelStatus, CumulativeMetrics, IterationResult, LoopMode, Resolution, RunConfig,
    RunPhase, RunnerPolicy,
};
pub use playlist::{load_playlist, parse_m3u, FetchPolicy, PlaylistError};
pub use probe::{Observation, ProbeLaunchError, ProbeSession, ProcessProbe, StreamProbe};
pub use runner::ChannelTestRunner;
pub use selection::{build_run_config, load_selection_file, parse_duration, Selection, SelectionError};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, StartupError, ToolVersion};
pub use state::{ChannelSnapshot, RunSnapshot, SharedState, StateSnapshot};
pub use store::{HistoryRecord, HistoryStore, StoreError};
pub use validator::{Validator, ValidatorError};
