//! stompview - STOMP test client
//!
//! Connects to a broker, sends a data request, and keeps a live table of the
//! snapshot and upsert messages that come back.

mod commands;
mod render;

use clap::Parser;
use colored::Colorize;
use commands::{ShellCommand, HELP};
use std::path::PathBuf;
use std::sync::Arc;
use stompview_client::{Config, SessionController, SessionState, StompTransport, SubmitOutcome};
use stompview_core::ReconciliationStore;
use stompview_protocol::DataRequest;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

type Controller = SessionController<StompTransport>;

#[derive(Parser)]
#[command(name = "stompview")]
#[command(about = "STOMP test client that keeps a live table of snapshot and upsert messages")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "STOMPVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Broker endpoint (tcp://host:port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Destination for request messages
    #[arg(long)]
    send_dest: Option<String>,

    /// Destination to subscribe to
    #[arg(long)]
    subscribe_dest: Option<String>,

    /// Trader for the initial request
    #[arg(short, long)]
    trader: Option<String>,

    /// Comma-separated book owners for the initial request
    #[arg(short, long)]
    book_owners: Option<String>,

    /// Field that identifies a row
    #[arg(long)]
    id_field: Option<String>,

    /// Don't connect until told to
    #[arg(long)]
    no_connect: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.session.endpoint = endpoint.clone();
        }
        if let Some(dest) = &self.send_dest {
            config.session.send_destination = dest.clone();
        }
        if let Some(dest) = &self.subscribe_dest {
            config.session.subscribe_destination = dest.clone();
        }
        if let Some(trader) = &self.trader {
            config.request.trader = trader.clone();
        }
        if let Some(owners) = &self.book_owners {
            config.request.book_owners = owners.clone();
        }
        if let Some(field) = &self.id_field {
            config.store.identity_field = field.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load_from(cli.config.clone()).map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    tracing::info!("Starting stompview");
    tracing::info!("  Endpoint: {}", config.session.endpoint);
    tracing::info!("  Send destination: {}", config.session.send_destination);
    tracing::info!("  Subscribe destination: {}", config.session.subscribe_destination);
    tracing::info!("  Identity field: {}", config.store.identity_field);

    let store = Arc::new(ReconciliationStore::new(config.store_config()));
    let renderer = tokio::spawn(render::run(Arc::clone(&store), store.subscribe_changes()));

    let controller = SessionController::new(
        StompTransport::new(config.stomp_config()),
        Arc::clone(&store),
        config.session_config(),
    );
    let mut status = controller.watch_status();

    if !cli.no_connect {
        connect(&controller, &config, &config.data_request()).await;
    }
    eprintln!("{}", "Type 'help' for commands, Ctrl+C to stop...".dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&controller, &config, &line).await {
                            break;
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.state == SessionState::Failed {
                    eprintln!(
                        "{}: {}",
                        "Session failed".red(),
                        current.last_error.unwrap_or_default()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }

    controller.disconnect().await?;
    renderer.abort();
    tracing::info!("stompview stopped");

    Ok(())
}

async fn connect(controller: &Controller, config: &Config, request: &DataRequest) {
    match controller.connect(&config.session.endpoint, request).await {
        Ok(outcome) => {
            eprintln!(
                "{} to {} (session {}, request {})",
                "Connected".green(),
                config.session.endpoint.cyan(),
                outcome.generation,
                outcome.request_id
            );
        }
        Err(e) => eprintln!("{}: {}", "Connection failed".red(), e),
    }
}

/// Returns false when the user asked to quit.
async fn handle_line(controller: &Controller, config: &Config, line: &str) -> bool {
    let command = match commands::parse(line, &config.request) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            return true;
        }
    };

    match command {
        ShellCommand::Submit(request) => {
            let endpoint = &config.session.endpoint;
            match controller.submit_or_connect(endpoint, &request).await {
                Ok(SubmitOutcome::Sent { request_id }) => {
                    eprintln!("{} request {}", "Sent".green(), request_id);
                }
                Ok(SubmitOutcome::Connected(outcome)) => eprintln!(
                    "{} to {} (session {}, request {})",
                    "Connected".green(),
                    endpoint.cyan(),
                    outcome.generation,
                    outcome.request_id
                ),
                Err(e) => eprintln!("{}: {}", "Error".red(), e),
            }
        }
        ShellCommand::Connect(request) => connect(controller, config, &request).await,
        ShellCommand::Disconnect => match controller.disconnect().await {
            Ok(()) => eprintln!("{}", "Disconnected".green()),
            Err(e) => eprintln!("{}: {}", "Error".red(), e),
        },
        ShellCommand::Status => {
            let status = controller.status();
            let counters = controller.counters();
            let store_stats = controller.store().stats();
            eprintln!(
                "{} {} (session {})",
                "State:".bold(),
                status.state.to_string().yellow(),
                status.generation
            );
            if let Some(error) = status.last_error {
                eprintln!("{} {}", "Last error:".bold(), error.red());
            }
            eprintln!(
                "  frames received {}, applied {}, stale {}",
                counters.frames_received, counters.frames_applied, counters.stale_frames
            );
            eprintln!(
                "  decode errors {}, unrecognized {}, missing identity {}, skipped elements {}",
                counters.decode_errors,
                counters.unrecognized,
                counters.missing_identity,
                counters.skipped_elements
            );
            eprintln!(
                "  rows {} (inserted {}, updated {}, snapshots {})",
                controller.store().len(),
                store_stats.rows_inserted(),
                store_stats.rows_updated(),
                store_stats.snapshots_applied()
            );
        }
        ShellCommand::Table => print!("{}", render::format_table(&controller.store().snapshot())),
        ShellCommand::Help => eprintln!("{}", HELP),
        ShellCommand::Quit => return false,
    }
    true
}
