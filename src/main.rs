//! Trade Mirror
//!
//! Replicates trading activity from one master account onto any number of
//! child accounts, with durable position mapping and per-pair copy rules.

mod config;
mod copier;
mod db;
mod error;
mod gateway;
mod models;
mod sync;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{ConfigHandle, CopyConfig, PairBook};
use crate::copier::Copier;
use crate::db::MappingStore;
use crate::gateway::{SimGateway, TerminalGateway};

/// Trade mirroring CLI.
#[derive(Parser)]
#[command(name = "trademirror")]
#[command(about = "Mirror trades from a master account onto child accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./trademirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start replicating the master account onto the children
    Run {
        /// Configuration file (JSON)
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Master account login
        #[arg(short, long, default_value = "master-1")]
        master: String,

        /// Child account login (repeatable)
        #[arg(long = "child", default_value = "child-1")]
        children: Vec<String>,

        /// Run against simulated gateways (no terminal required)
        #[arg(long)]
        dry_run: bool,
    },

    /// Show mapping and activity status
    Status,

    /// Show the effective configuration
    Config {
        /// Configuration file (JSON)
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },

    /// List pair rules and their validity
    Pairs {
        /// Configuration file (JSON)
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            config,
            master,
            children,
            dry_run,
        } => {
            if !dry_run {
                bail!("no live terminal bridge is configured yet; run with --dry-run");
            }
            if children.is_empty() {
                bail!("at least one --child account is required");
            }

            let config_handle = ConfigHandle::load(&config).await?;
            let store = Arc::new(MappingStore::new(&cli.database).await?);

            let master_gateway: Arc<dyn TerminalGateway> = Arc::new(SimGateway::new(&master));
            let child_gateways: Vec<Arc<dyn TerminalGateway>> = children
                .iter()
                .map(|account| Arc::new(SimGateway::new(account)) as Arc<dyn TerminalGateway>)
                .collect();

            let effective = config_handle.current().await;
            println!("\n=== Trade Mirror ===");
            println!("Master:       {}", master);
            println!("Children:     {}", children.join(", "));
            println!("Pairs:        {}", effective.pairs.len());
            println!("Interval:     {}ms", effective.settings.copy_interval);
            println!("Mode:         DRY RUN (simulated gateways)");
            println!("\nPress Ctrl+C to stop.\n");

            info!(master = %master, children = children.len(), "Starting replication");

            let copier = Copier::new(master_gateway, child_gateways, store, config_handle);
            copier.run().await?;
        }

        Commands::Status => {
            let store = MappingStore::new(&cli.database).await?;

            let counts = store.count_by_status().await?;
            println!("\n=== Mapping Rows ===");
            if counts.is_empty() {
                println!("No mapping rows yet.");
            } else {
                for (status, count) in &counts {
                    println!("{:<10} {:>6}", status, count);
                }
            }

            let activity = store.recent_activity(20).await?;
            println!("\n=== Recent Activity ===");
            if activity.is_empty() {
                println!("No activity recorded yet.");
            } else {
                println!(
                    "{:<26} {:<12} {:<8} {:<8} {:>10} {:>10}  {}",
                    "TIME", "CHILD", "ACTION", "OUTCOME", "MASTER", "CHILD#", "DETAIL"
                );
                for row in &activity {
                    println!(
                        "{:<26} {:<12} {:<8} {:<8} {:>10} {:>10}  {}",
                        row.timestamp,
                        row.child_account,
                        row.action,
                        row.outcome,
                        row.master_ticket
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        row.child_ticket
                            .map(|t| t.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        row.detail
                    );
                }
            }
        }

        Commands::Config { config } => {
            let handle = ConfigHandle::load(&config).await?;
            let config: Arc<CopyConfig> = handle.current().await;
            let settings = &config.settings;

            println!("\n=== Copy Settings ===");
            println!("Copy Interval:    {}ms", settings.copy_interval);
            println!(
                "Effective:        {}ms",
                settings.effective_interval().as_millis()
            );
            println!("Retry Attempts:   {}", settings.retry_attempts);
            println!("Slippage:         {} points", settings.slippage);
            println!("Filling Mode:     {:?}", settings.filling_mode);
            println!("Copy Closes:      {}", settings.copy_closes);
            println!("Comment Tracking: {}", settings.comment_tracking);
            println!("\nPairs:            {}", config.pairs.len());
        }

        Commands::Pairs { config } => {
            let handle = ConfigHandle::load(&config).await?;
            let config = handle.current().await;

            if config.pairs.is_empty() {
                println!("No pairs configured.");
                return Ok(());
            }

            let book = PairBook::from_pairs(&config.pairs);

            println!(
                "\n{:<10} {:<10} {:>10} {:>6} {:>9} {:<8}",
                "MASTER", "CHILD", "MULT", "FLIP", "MAX SLIP", "STATE"
            );
            println!("{}", "-".repeat(58));
            for pair in &config.pairs {
                let state = match (book.resolve(&pair.master_symbol).map(|p| p.enabled), pair.validate()) {
                    (_, Err(reason)) => format!("invalid: {reason}"),
                    (Some(true), _) => "enabled".to_string(),
                    _ => "disabled".to_string(),
                };
                println!(
                    "{:<10} {:<10} {:>10} {:>6} {:>9} {:<8}",
                    pair.master_symbol,
                    pair.resolved_symbol(),
                    pair.lot_multiplier.to_string(),
                    if pair.direction_flip { "yes" } else { "no" },
                    pair.max_slippage_points,
                    state
                );
            }
        }
    }

    Ok(())
}
