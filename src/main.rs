use crate::config::Config;
use crate::driver::{SimProfile, SimStation, WifiDriver};
use crate::state::{CoordinatorState, LinkInfo, SharedState};
use crate::stats::StatsDelta;
use crate::suspend::{SuspendResumeController, WakeReason};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

mod config;
mod driver;
mod link;
mod monitor;
mod probe;
mod state;
mod stats;
mod suspend;

use clap::{Parser, Subcommand};

// TUI Imports
use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, Row, Table},
};

/// netdoze: keeps the host in deep sleep while the Wi-Fi link is idle
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the suspend/resume coordinator
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        /// Output path for the configuration
        #[arg(long, default_value = "config.toml")]
        path: String,
    },
    /// Show current coordinator state
    Show {
        /// Watch mode (interactive TUI)
        #[arg(short, long)]
        watch: bool,
        /// API URL (default: http://127.0.0.1:3030)
        #[arg(long, default_value = "http://127.0.0.1:3030")]
        api: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: "config.toml".to_string(),
    }) {
        Commands::Run { config } => run_daemon(&config).await,
        Commands::Validate { config } => validate_config(&config),
        Commands::Init { path } => init_config(&path),
        Commands::Show { watch, api } => show_state(watch, &api).await,
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("SSID: {}", cfg.wifi.ssid);
            info!(
                "Monitor: interval {}ms, idle window {}ms, max wait {}",
                cfg.monitor.interval_ms,
                cfg.monitor.idle_window_ms,
                cfg.monitor
                    .max_wait_ms
                    .map_or("unbounded".to_string(), |ms| format!("{}ms", ms))
            );
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

fn init_config(path: &str) -> anyhow::Result<()> {
    if std::path::Path::new(path).exists() {
        return Err(anyhow::anyhow!(
            "'{}' already exists; refusing to overwrite",
            path
        ));
    }
    std::fs::write(path, config::SAMPLE_CONFIG)?;
    info!("Wrote starter config to '{}'", path);
    Ok(())
}

async fn run_daemon(config_path: &str) -> anyhow::Result<()> {
    // 1. Load Config. A contradictory policy is fatal here, before any
    // monitoring begins.
    let config = Config::load(config_path)
        .map_err(|e| anyhow::anyhow!("configuration rejected: {}", e))?;

    info!("=====================================================");
    info!("netdoze: network-activity suspend/resume coordinator");
    info!("=====================================================");
    info!("Packet classes matched by the WLAN discard filter never reach the");
    info!("host, so the host sleeps straight through them. Filter rules are");
    info!("installed out-of-band at initialization; only the surviving traffic");
    info!("stream is monitored here.");

    // 2. Bring up the station.
    let station = SimStation::new(SimProfile::default());
    station.spawn_traffic();

    link::connect_station(station.as_ref(), &config.wifi)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to connect to AP ({}); check wifi credentials in {}",
                e,
                config_path
            )
        })?;

    // 3. Shared state, external-wake channel, API.
    let shared = CoordinatorState::shared();
    let (wake_tx, wake_rx) = mpsc::channel(4);

    if let Some(addr) = config.monitor.api_listen {
        let api = ApiState {
            state: shared.clone(),
            wake: wake_tx.clone(),
        };
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/state", axum::routing::get(get_state))
                .route("/wake", axum::routing::post(post_wake))
                .with_state(api);
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("API server error: {}", e);
                    }
                }
                Err(e) => error!("Failed to bind API port: {}", e),
            }
        });
        info!("State API running at http://{}/state", addr);
    }

    // Uptime and link details for the API, refreshed off the hot path.
    let start_time = std::time::Instant::now();
    let refresh_state = shared.clone();
    let refresh_station = station.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mut s = refresh_state.lock().await;
            s.uptime_secs = start_time.elapsed().as_secs();
            s.link = LinkInfo {
                status: refresh_station.connection_status(),
                ip: refresh_station.ip_address().map(|a| a.to_string()),
                mac: Some(refresh_station.mac_address()),
                rssi: Some(refresh_station.rssi()),
            };
        }
    });

    // 4. Signals ride the external-wake path: the first SIGINT/SIGTERM
    // wakes the coordinator (even out of deep sleep) and stops the loop.
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("Received shutdown signal, waking the coordinator...");
            if wake_tx.send(WakeReason::Shutdown).await.is_err() {
                break;
            }
        }
    });

    // 5. Precondition gate. This is the only failure exit the daemon has:
    // the link never reached an Up state. The operator resets the device.
    link::await_link_up(station.as_ref(), config.monitor.link_retry(), 60)
        .await
        .map_err(|e| anyhow::anyhow!("{}; reset the device and try again", e))?;

    // 6. Suspend the network stack forever; every wake prints its report
    // and monitoring starts over.
    let mut controller =
        SuspendResumeController::new(station.as_ref(), &config.monitor, wake_rx, shared);
    let reason = controller.run().await;
    info!("Coordinator stopped: {}", reason);
    Ok(())
}

async fn show_state(watch: bool, api_url: &str) -> anyhow::Result<()> {
    if watch {
        run_tui(api_url).await
    } else {
        match reqwest::get(format!("{}/state", api_url)).await {
            Ok(resp) => {
                let state = resp.json::<CoordinatorState>().await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            Err(e) => eprintln!("Failed to connect to API: {}", e),
        }
        Ok(())
    }
}

fn counter_rows(delta: &StatsDelta) -> Vec<(&'static str, u64)> {
    vec![
        ("tx_total", delta.tx_total),
        ("rx_total", delta.rx_total),
        ("tx_no_mem", delta.tx_no_mem),
        ("rx_no_mem", delta.rx_no_mem),
        ("tx_fail", delta.tx_fail),
        ("no_credit", delta.no_credit),
        ("flow_control", delta.flow_control),
        ("cmd52_reads", delta.cmd52_reads),
        ("cmd52_writes", delta.cmd52_writes),
        ("cmd53_reads", delta.cmd53_reads),
        ("cmd53_writes", delta.cmd53_writes),
        ("cmd52_fails", delta.cmd52_fails),
        ("cmd53_fails", delta.cmd53_fails),
        ("oob_intrs", delta.oob_intrs),
        ("sdio_intrs", delta.sdio_intrs),
        ("error_intrs", delta.error_intrs),
    ]
}

async fn run_tui(api_url: &str) -> anyhow::Result<()> {
    std::io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;

    loop {
        let state_opt = match reqwest::get(format!("{}/state", api_url)).await {
            Ok(r) => r.json::<CoordinatorState>().await.ok(),
            Err(_) => None,
        };

        terminal.draw(|frame| {
            let layout = Layout::default()
                .direction(Direction::Vertical)
                .constraints(vec![Constraint::Length(3), Constraint::Min(0)])
                .split(frame.area());

            if let Some(state) = &state_opt {
                let title = Paragraph::new(format!(
                    "netdoze | Phase: {:?} | Uptime: {}s | Cycles: {} | Slept: {:.1}s | Last: {}",
                    state.phase,
                    state.uptime_secs,
                    state.cycles,
                    state.total_sleep_ms as f64 / 1000.0,
                    state
                        .last_cycle
                        .as_ref()
                        .map(|c| c.outcome.as_str())
                        .unwrap_or("-"),
                ))
                .block(Block::default().borders(Borders::ALL).title("Status"));
                frame.render_widget(title, layout[0]);

                let rows: Vec<Row> = match &state.last_cycle {
                    Some(cycle) => {
                        let mut rows = vec![Row::new(vec![
                            "sleep_ms".to_string(),
                            cycle.delta.sleep_ms.to_string(),
                        ])];
                        rows.extend(counter_rows(&cycle.delta).into_iter().map(
                            |(name, value)| Row::new(vec![name.to_string(), value.to_string()]),
                        ));
                        rows
                    }
                    None => vec![Row::new(vec![
                        "no completed cycle yet".to_string(),
                        String::new(),
                    ])],
                };

                let table = Table::new(
                    rows,
                    [Constraint::Percentage(40), Constraint::Percentage(60)],
                )
                .header(Row::new(vec!["Counter", "Last Cycle Delta"]))
                .block(Block::default().borders(Borders::ALL).title("Suspend Cycle"));

                frame.render_widget(table, layout[1]);
            } else {
                frame.render_widget(
                    Paragraph::new("Connecting to coordinator API..."),
                    layout[0],
                );
            }
        })?;

        if event::poll(std::time::Duration::from_millis(1000))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && key.code == KeyCode::Char('q') {
                    break;
                }
            }
        }
    }

    disable_raw_mode()?;
    std::io::stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

#[derive(Clone)]
struct ApiState {
    state: SharedState,
    wake: mpsc::Sender<WakeReason>,
}

async fn get_state(
    axum::extract::State(api): axum::extract::State<ApiState>,
) -> axum::Json<CoordinatorState> {
    let s = api.state.lock().await;
    axum::Json(s.clone())
}

/// User-triggered wake: ends a low-power wait without waiting for traffic.
async fn post_wake(axum::extract::State(api): axum::extract::State<ApiState>) -> &'static str {
    let _ = api.wake.send(WakeReason::UserRequest).await;
    "waking\n"
}
