//! IPTV validator dashboard
//!
//! Terminal interface that follows a running validator.
//! Polls `GET /state` on the validator's results server once per second.

use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_SERVER: &str = "http://127.0.0.1:9001";
const POLL_INTERVAL_MS: u64 = 1000;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

/// IPTV validator dashboard
#[derive(Parser, Debug)]
#[command(name = "iptv-dash")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the validator's results server
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    server: String,
}

// ============================================================================
// Data Models (mirroring the validator's /state payload)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelView {
    pub name: String,
    pub group: String,
    pub url: String,
    pub status: String,
    pub resolution: String,
    pub seconds_tested: f64,
    pub detail: String,
    pub total_disconnects: u64,
    pub total_buffering_events: u64,
    pub total_seconds_tested: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunView {
    pub run_id: Option<String>,
    pub phase: String,
    pub mode: String,
    pub current_iteration: u32,
    pub total_iterations: Option<u32>,
    pub started_at_unix_ms: Option<i64>,
    pub elapsed_secs: f64,
    pub duration_secs: f64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateView {
    pub run: RunView,
    pub channels: Vec<ChannelView>,
}

impl StateView {
    fn count_status(&self, status: &str) -> usize {
        self.channels.iter().filter(|c| c.status == status).count()
    }
}

/// Event log lines for everything that changed between two polls.
///
/// Channels are matched by position; a new run id resets the comparison.
pub fn detect_transitions(previous: Option<&StateView>, current: &StateView) -> Vec<String> {
    let mut events = Vec::new();
    let previous = match previous {
        Some(prev) if prev.run.run_id == current.run.run_id => prev,
        _ => {
            if current.run.run_id.is_some() {
                events.push(format!(
                    "Run started: {} channels, mode {}",
                    current.channels.len(),
                    current.run.mode
                ));
            }
            return events;
        }
    };

    if current.run.current_iteration != previous.run.current_iteration {
        events.push(format!("Iteration {} started", current.run.current_iteration));
    }

    for (prev, next) in previous.channels.iter().zip(&current.channels) {
        if prev.status == next.status {
            continue;
        }
        let line = match next.status.as_str() {
            "pass" => format!("{}: pass ({})", next.name, next.resolution),
            "issue" => format!("{}: issue ({})", next.name, next.detail),
            other => format!("{}: {}", next.name, other),
        };
        events.push(line);
    }

    if current.run.phase != previous.run.phase {
        events.push(format!("Run {}", current.run.phase));
    }
    events
}

// ============================================================================
// App State
// ============================================================================

pub struct App {
    /// Latest snapshot from the validator
    pub state: Option<StateView>,
    pub event_log: VecDeque<String>,
    pub connected: bool,
    base_url: String,
    client: reqwest::Client,
}

impl App {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            state: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            connected: false,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Replace the current snapshot, logging what changed.
    pub fn apply(&mut self, snapshot: StateView) {
        for event in detect_transitions(self.state.as_ref(), &snapshot) {
            self.log_event(event);
        }
        self.state = Some(snapshot);
    }

    pub async fn fetch_state(&mut self) {
        let url = format!("{}/state", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<StateView>().await {
                    Ok(snapshot) => {
                        if !self.connected {
                            self.log_event(format!("Connected to {}", self.base_url));
                        }
                        self.connected = true;
                        self.apply(snapshot);
                    }
                    Err(e) => {
                        self.log_event(format!("JSON parse error: {}", e));
                        self.connected = false;
                    }
                }
            }
            Ok(response) => {
                self.log_event(format!("HTTP error: {}", response.status()));
                self.connected = false;
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    pub async fn request_cancel(&mut self) {
        let url = format!("{}/cancel", self.base_url);
        match self.client.post(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::ACCEPTED => {
                self.log_event("Cancellation requested".to_string());
            }
            Ok(response) if response.status() == reqwest::StatusCode::CONFLICT => {
                self.log_event("No active run to cancel".to_string());
            }
            Ok(response) => self.log_event(format!("Cancel failed: {}", response.status())),
            Err(e) => self.log_event(format!("Cancel failed: {}", e)),
        }
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn status_color(status: &str) -> Color {
    match status {
        "pass" => Color::Green,
        "issue" => Color::Red,
        "testing" => Color::Yellow,
        _ => Color::Gray,
    }
}

fn phase_color(phase: &str) -> Color {
    match phase {
        "running" => Color::Cyan,
        "done" => Color::Green,
        "cancelled" => Color::Red,
        _ => Color::Gray,
    }
}

/// Format seconds as `1h 2m`, `3m 4s` or `5s`.
fn format_duration(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn iteration_label(run: &RunView) -> String {
    match run.total_iterations {
        Some(total) => format!("{}/{}", run.current_iteration, total),
        None => format!("{}/\u{221e}", run.current_iteration),
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let line = match &app.state {
        Some(state) => {
            let run = &state.run;
            Line::from(vec![
                Span::styled(
                    format!(" {} ", run.phase.to_uppercase()),
                    Style::default()
                        .fg(phase_color(&run.phase))
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw(format!(
                    " Mode: {} | Iteration: {} | Elapsed: {} | Per channel: {}",
                    run.mode,
                    iteration_label(run),
                    format_duration(run.elapsed_secs),
                    format_duration(run.duration_secs),
                )),
            ])
        }
        None => Line::from(" Waiting for validator... "),
    };

    let title = if app.connected {
        " Run "
    } else {
        " Run (Disconnected) "
    };
    let paragraph =
        Paragraph::new(line).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(paragraph, area);
}

fn render_channel_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = [
        "Channel", "Group", "Status", "Res", "Tested", "Disc", "Buf", "Detail",
    ]
    .iter()
    .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .state
        .as_ref()
        .map(|state| {
            state
                .channels
                .iter()
                .map(|c| {
                    Row::new(vec![
                        Cell::from(c.name.clone()),
                        Cell::from(c.group.clone()),
                        Cell::from(c.status.clone())
                            .style(Style::default().fg(status_color(&c.status))),
                        Cell::from(c.resolution.clone()),
                        Cell::from(format!("{:.0}s", c.seconds_tested)),
                        Cell::from(c.total_disconnects.to_string()),
                        Cell::from(c.total_buffering_events.to_string()),
                        Cell::from(c.detail.clone()),
                    ])
                })
                .collect()
        })
        .unwrap_or_default();

    let widths = [
        Constraint::Percentage(22),
        Constraint::Percentage(12),
        Constraint::Length(8),
        Constraint::Length(8),
        Constraint::Length(8),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Min(10),
    ];

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(" Channels "));
    f.render_widget(table, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = match &app.state {
        Some(state) => format!(
            " Pass: {} | Issue: {} | Testing: {} | Pending: {} | 'c' cancel run | 'q' quit ",
            state.count_status("pass"),
            state.count_status("issue"),
            state.count_status("testing"),
            state.count_status("pending"),
        ),
        None => format!(" Connecting to {}... | 'q' quit ", app.base_url),
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Percentage(65),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(f.area());

    render_header(f, chunks[0], app);
    render_channel_table(f, chunks[1], app);
    render_event_log(f, chunks[2], app);
    render_status_bar(f, chunks[3], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();
    let mut terminal = setup_terminal()?;

    let mut app = App::new(args.server);
    app.log_event("Dashboard started".to_string());

    let result = run_app(&mut terminal, &mut app).await;
    restore_terminal(&mut terminal)?;
    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |at| at.elapsed() >= poll_interval) {
            app.fetch_state().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                            return Ok(());
                        }
                        KeyCode::Char('c') | KeyCode::Char('C') => {
                            app.request_cancel().await;
                            last_fetch = None;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
