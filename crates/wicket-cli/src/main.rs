//! wicket CLI
//!
//! Thin client over the gate state machine: connect to a configured gate
//! profile and attach the active pane to the local terminal. The heavy
//! lifting (transport selection, retry, layout restoration) lives in the
//! gate and transport crates.

mod attach;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use output::{print_error, print_info, print_success};
use wicket_core::config::{self, GateConfig, WicketConfig};
use wicket_gate::{Gate, Notifier};
use wicket_transport::TransportFactory;

#[derive(Parser)]
#[command(name = "wicket")]
#[command(author, version, about = "Resilient multiplexed remote terminals")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a gate and attach the active pane
    /// Alias: c
    #[command(alias = "c")]
    Connect {
        /// Gate profile name
        gate: String,

        /// Command to run in new panes (overrides the profile)
        #[arg(short = 'e', long)]
        command: Option<String>,
    },

    /// List configured gate profiles
    #[command(alias = "ls")]
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let config: WicketConfig = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!("Loaded {} gate profiles", config.gates.len());

    match cli.command {
        Commands::Profiles => {
            if config.gates.is_empty() {
                print_info("No gate profiles configured");
            } else {
                let mut profiles: Vec<_> = config.gates.iter().collect();
                profiles.sort_by(|a, b| a.0.cmp(b.0));
                for (name, gate) in profiles {
                    println!("{:<20} {:<8} {}", name, gate.transport, gate.address);
                }
            }
            Ok(())
        }
        Commands::Connect { gate, command } => {
            let mut profile = config.gate(&gate)?.clone();
            if command.is_some() {
                profile.command = command;
            }
            connect_command(&gate, profile).await
        }
    }
}

async fn connect_command(name: &str, profile: GateConfig) -> Result<()> {
    profile.validate()?;

    let factory = Arc::new(TransportFactory::new(profile.clone()));
    let notifier: Notifier = Arc::new(|message: String| print_info(&message));
    let gate = Gate::new(name, profile, factory, notifier);

    print_info(&format!("Connecting to {}...", name));
    if let Err(e) = gate.connect().await {
        print_error(&format!("Failed to connect: {}", e));
        return Err(e.into());
    }

    let pane = gate.active_pane().await.context("gate has no panes")?;
    print_success("Connected. Press Ctrl+] to disengage.");

    attach::attach(&gate, pane).await?;

    gate.disengage().await?;
    print_success(&format!("Disengaged from {}", name));
    Ok(())
}
