use crate::config::Config;
use crate::protocol::Frame;
use crate::state::MetricReport;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

mod bridge;
mod config;
mod protocol;
mod relay;
mod serial;
mod signal;
mod state;
mod stats;
mod transport;

use clap::{Parser, Subcommand};
use rcgen::generate_simple_self_signed;

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

/// Wireline: serial lines bridged over a peer-to-peer QUIC channel, with
/// relay-assisted session setup and live telemetry mirroring.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an endpoint bridge
    Peer {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Run the session relay
    Relay {
        /// Listen address for peer and dashboard connections
        #[arg(short, long, default_value = "0.0.0.0:8765")]
        listen: SocketAddr,
    },
    /// Watch live telemetry from a relay (interactive TUI)
    Watch {
        /// Relay address (HOST:PORT)
        #[arg(long, default_value = "127.0.0.1:8765")]
        relay: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a new private key for the channel endpoint
    GenKeys {
        /// Output path for the private key
        #[arg(long, default_value = "key.pem")]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Peer { config } => {
            let cfg = Config::load(&config)?;
            with_shutdown(bridge::run_peer(cfg)).await
        }
        Commands::Relay { listen } => with_shutdown(relay::run(listen)).await,
        Commands::Watch { relay } => watch(&relay).await,
        Commands::Validate { config } => validate_config(&config),
        Commands::GenKeys { key } => generate_keys(&key),
    }
}

async fn with_shutdown(task: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        res = task => res,
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    }
}

fn generate_keys(key_path: &str) -> anyhow::Result<()> {
    let cert = generate_simple_self_signed(vec![
        "localhost".to_string(),
        "wireline-peer".to_string(),
    ])?;

    std::fs::write(key_path, cert.serialize_private_key_pem())?;

    info!("Generated private key at '{}'", key_path);
    Ok(())
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!("Configuration '{}' is valid.", path);
            info!("Peer: {} (target {})", cfg.peer.id, cfg.peer.target);
            info!("Serial: {} @ {} baud", cfg.serial.port, cfg.serial.baud);
            info!("Relay: {}", cfg.relay.addr);
            Ok(())
        }
        Err(e) => {
            error!("Configuration '{}' is INVALID: {}", path, e);
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

/// Connects to the relay as a dashboard and renders the latest METRIC frame
/// per peer.
async fn watch(relay_addr: &str) -> anyhow::Result<()> {
    let client = signal::RelayClient::connect(relay_addr, relay::DASHBOARD_HELLO).await?;
    let metrics: Arc<Mutex<BTreeMap<String, MetricReport>>> = Arc::new(Mutex::new(BTreeMap::new()));

    // Keep the writer half alive so the relay keeps the connection open.
    let _outbound = client.outbound;
    let mut inbound = client.inbound;
    let collector = metrics.clone();
    tokio::spawn(async move {
        while let Some(line) = inbound.recv().await {
            if let Ok(Frame::Metric(report)) = Frame::decode(&line) {
                collector
                    .lock()
                    .unwrap()
                    .insert(report.from.clone(), report);
            }
        }
    });

    std::io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(std::io::stdout()))?;

    loop {
        let snapshot: Vec<MetricReport> = metrics.lock().unwrap().values().cloned().collect();

        terminal.draw(|frame| {
            let layout = Layout::default()
                .direction(Direction::Vertical)
                .constraints(vec![Constraint::Length(3), Constraint::Min(0)])
                .split(frame.area());

            let title = Paragraph::new(format!(
                "Wireline Dashboard | Relay: {} | Peers: {}",
                relay_addr,
                snapshot.len()
            ))
            .block(Block::default().borders(Borders::ALL).title("Status"));
            frame.render_widget(title, layout[0]);

            let rows: Vec<Row> = snapshot
                .iter()
                .map(|m| {
                    Row::new(vec![
                        m.from.clone(),
                        m.rtt_ms
                            .map(|v| format!("{v:.1} ms"))
                            .unwrap_or_else(|| "-".to_string()),
                        format!("{:.2} kbps", m.tx_kbps),
                        format!("{:.2} kbps", m.rx_kbps),
                        format!("{:.1} %", m.loss_pct),
                        format!("{}/{}", m.msgs_sent, m.msgs_recv),
                        m.link_state.clone(),
                    ])
                })
                .collect();

            let table = Table::new(
                rows,
                [
                    Constraint::Percentage(10),
                    Constraint::Percentage(12),
                    Constraint::Percentage(14),
                    Constraint::Percentage(14),
                    Constraint::Percentage(10),
                    Constraint::Percentage(14),
                    Constraint::Percentage(26),
                ],
            )
            .header(Row::new(vec![
                "Peer", "RTT", "Tx", "Rx", "Loss", "Msgs", "Link",
            ]))
            .block(Block::default().borders(Borders::ALL).title("Peers"));

            frame.render_widget(table, layout[1]);
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
