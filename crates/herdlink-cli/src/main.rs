//! herdlink - command-line access to a herd management API.
//!
//! Every command goes through the same gateway a UI would use, so cached
//! reads work offline and writes made with `--offline` are queued until
//! `herdlink queue replay`.

use std::io;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use herdlink_core::resource::parse_pairs;
use herdlink_core::{Gateway, GatewayConfig, WriteOutcome};

/// Environment variable overriding the configured API base URL
const BASE_URL_ENV: &str = "HERDLINK_BASE_URL";

#[derive(Parser)]
#[command(name = "herdlink", version, about = "Offline-tolerant client for the herd API")]
struct Cli {
    /// API base URL (overrides the config file and HERDLINK_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Do not touch the network: serve reads from cache, queue writes
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// POST a JSON credentials body to the login route
    Login { credentials: String },
    /// Forget the stored credential and the cache
    Logout,
    /// List a resource
    List {
        resource: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
        /// Return one normalized page instead of the bare list
        #[arg(long)]
        paged: bool,
    },
    /// Show one record
    Show { resource: String, id: String },
    /// Create a record from a JSON body
    Create { resource: String, body: String },
    /// Replace a record
    Update { resource: String, id: String, body: String },
    /// Partially update a record
    Patch { resource: String, id: String, body: String },
    /// Delete a record
    Delete { resource: String, id: String },
    /// Search a resource
    Search {
        resource: String,
        query: String,
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Count and validators without the payload
    Meta { resource: String },
    /// Fetch changes since the last sync (or everything with --full)
    Sync {
        resource: String,
        #[arg(long)]
        full: bool,
    },
    /// Inspect or replay writes queued while offline
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Manage the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    List,
    Replay,
    /// Drop a queued write without sending it
    Discard { id: u64 },
}

#[derive(Subcommand)]
enum CacheAction {
    Clear,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=herdlink_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn parse_body(body: &str) -> Result<Value> {
    serde_json::from_str(body).with_context(|| format!("Body is not valid JSON: {}", body))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: WriteOutcome) -> Result<()> {
    match outcome {
        WriteOutcome::Applied(value) => print_json(&value),
        WriteOutcome::Queued { id, payload } => {
            eprintln!("Offline: write queued as #{}", id);
            print_json(&payload)
        }
    }
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::load()?;
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.base_url = base_url;
    }
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    info!(base_url = %config.base_url, "herdlink starting");
    let gateway = Gateway::from_config(config)
        .await
        .context("Failed to initialize gateway")?;
    if cli.offline {
        gateway.set_online(false);
    }

    run(&gateway, cli.command).await
}

async fn run(gateway: &Gateway, command: Command) -> Result<()> {
    match command {
        Command::Login { credentials } => {
            print_json(&gateway.login(parse_body(&credentials)?).await?)?;
        }
        Command::Logout => {
            gateway.logout().await?;
            eprintln!("Logged out");
        }
        Command::List {
            resource,
            params,
            paged,
        } => {
            let params = parse_pairs(params.iter().map(String::as_str))?;
            let client = gateway.resource(&resource);
            if paged {
                print_json(&client.get_paginated(&params).await?)?;
            } else {
                print_json(&client.get(&params).await?)?;
            }
        }
        Command::Show { resource, id } => {
            print_json(&gateway.resource(&resource).get_by_id(&id).await?)?;
        }
        Command::Create { resource, body } => {
            print_outcome(gateway.resource(&resource).create(parse_body(&body)?).await?)?;
        }
        Command::Update { resource, id, body } => {
            print_outcome(
                gateway
                    .resource(&resource)
                    .update(&id, parse_body(&body)?)
                    .await?,
            )?;
        }
        Command::Patch { resource, id, body } => {
            print_outcome(
                gateway
                    .resource(&resource)
                    .patch(&id, parse_body(&body)?)
                    .await?,
            )?;
        }
        Command::Delete { resource, id } => {
            print_outcome(gateway.resource(&resource).delete(&id).await?)?;
        }
        Command::Search {
            resource,
            query,
            params,
        } => {
            let params = parse_pairs(params.iter().map(String::as_str))?;
            print_json(&gateway.resource(&resource).search(&query, &params).await?)?;
        }
        Command::Meta { resource } => {
            print_json(&gateway.resource(&resource).get_metadata().await?)?;
        }
        Command::Sync { resource, full } => {
            let sync = gateway.sync_client(&resource);
            if full {
                let items = sync.full_sync().await?;
                eprintln!("Synced {} records", items.len());
                print_json(&items)?;
            } else {
                let changes = sync.sync_since(None).await?;
                if changes.has_more {
                    eprintln!("More changes remain beyond page {}", changes.page);
                }
                print_json(&changes)?;
            }
        }
        Command::Queue { action } => match action {
            QueueAction::List => {
                print_json(&gateway.queued_writes().await?)?;
            }
            QueueAction::Replay => {
                let report = gateway.replay_offline_queue().await?;
                eprintln!("Replayed {}, {} remaining", report.replayed, report.remaining);
                if let Some((id, error)) = report.halted {
                    anyhow::bail!("Replay halted at #{}: {}", id, error);
                }
            }
            QueueAction::Discard { id } => {
                if !gateway.discard_queued(id).await? {
                    anyhow::bail!("No queued write #{}", id);
                }
            }
        },
        Command::Cache { action } => match action {
            CacheAction::Clear => {
                gateway.clear_cache().await?;
                eprintln!("Cache cleared");
            }
        },
    }
    Ok(())
}
