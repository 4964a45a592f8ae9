use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use configuration::{Settings, init_tracing, load_config, load_config_from};
use core_types::NormalizedEvent;
use hub_client::{HubClient, consumer, names};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// The main entry point for the StockHub client.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the token may come from the real environment.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    let _log_guard = init_tracing(&settings.logging)?;

    match cli.command {
        Commands::Watch { events } => handle_watch(&settings, events).await,
        Commands::Invoke { method, args } => handle_invoke(&settings, &method, &args).await,
        Commands::Status => handle_status(&settings).await,
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Streams real-time market updates from the stock hub.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a config file (defaults to ./config.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to hub events and print every broadcast event as a JSON line.
    Watch {
        /// Hub event to subscribe to; repeatable. Defaults to every known feed.
        #[arg(long = "event")]
        events: Vec<String>,
    },
    /// Call a hub method and print the outcome.
    Invoke {
        /// The hub method name (e.g. "JoinGroup").
        method: String,
        /// Arguments as JSON; bare words are sent as strings.
        args: Vec<String>,
    },
    /// Connect once and show the connection status.
    Status,
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn handle_watch(settings: &Settings, events: Vec<String>) -> anyhow::Result<()> {
    let client = HubClient::with_live_transport(settings)?;
    let mut broadcast = client.events();
    client.connect().await?;

    let events = if events.is_empty() {
        names::ALL.iter().map(|name| name.to_string()).collect()
    } else {
        events
    };
    for event in &events {
        client.subscribe(
            event,
            consumer(|event: NormalizedEvent| async move {
                tracing::info!(event = %event.event, exchange = %event.exchange, message = %event.message, "Hub update.");
                Ok(())
            }),
        );
    }
    tracing::info!(count = events.len(), "Watching hub events. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = broadcast.recv() => match received {
                Ok(event) => match event.to_json() {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Could not serialize broadcast event."),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind the broadcast channel.");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn handle_invoke(settings: &Settings, method: &str, args: &[String]) -> anyhow::Result<()> {
    let client = HubClient::with_live_transport(settings)?;
    let arguments = args.iter().map(|arg| parse_argument(arg)).collect();

    let outcome = client.invoke(method, arguments).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    client.shutdown().await;
    Ok(())
}

async fn handle_status(settings: &Settings) -> anyhow::Result<()> {
    let client = HubClient::with_live_transport(settings)?;
    let connected = client.connect().await;
    let status = client.is_connected();

    let mut table = Table::new();
    let last_error = client
        .session()
        .last_error()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "-".to_string());
    table.set_header(vec!["Endpoint", "Phase", "Active", "Failed", "Attempts", "Last error"]);
    table.add_row(vec![
        Cell::new(&client.session().config().endpoint),
        Cell::new(status.phase),
        Cell::new(status.active),
        Cell::new(status.failed),
        Cell::new(format!("{}/{}", status.attempts, status.max_attempts)),
        Cell::new(last_error),
    ]);
    println!("{table}");

    if let Err(e) = connected {
        eprintln!("Connection failed: {}", e);
    }
    client.shutdown().await;
    Ok(())
}

/// Reads a CLI argument as JSON, falling back to a plain string.
fn parse_argument(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}
