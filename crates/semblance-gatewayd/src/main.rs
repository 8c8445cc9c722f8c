//! Semblance Gateway daemon
//!
//! Hosts the validation pipeline for the core process:
//! - `serve`: NDJSON requests on stdin, replies on stdout
//! - `verify`: walk the audit chain and report tampering
//! - `log`: print the most recent completed actions
//!
//! Logs go to stderr; stdout belongs to the protocol.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use semblance_gateway::Gateway;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod ipc;

use config::DaemonConfig;

/// Semblance Gateway CLI
#[derive(Parser)]
#[command(name = "semblance-gatewayd")]
#[command(about = "Semblance Gateway - validation and audit for outbound actions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SEMBLANCE_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "SEMBLANCE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "SEMBLANCE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the IPC protocol on stdio (default)
    Serve,

    /// Verify the audit chain; exits non-zero if it is broken
    Verify,

    /// Print recent completed actions as JSON
    Log {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Verify => verify(config).await,
        Command::Log { limit, offset } => log(config, limit, offset).await,
    }
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    let key = config.key.resolve()?;
    let audit = config.audit.open().await?;
    let gateway = Arc::new(
        Gateway::builder(config.gateway, key)
            .audit(audit)
            .build()
            .await
            .context("building gateway")?,
    );

    info!(version = env!("CARGO_PKG_VERSION"), "Serving on stdio");

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = ipc::serve(gateway, stdin, stdout) => {
            if let Err(e) = &result {
                error!(error = %e, "IPC loop failed");
            }
            result?;
            info!("Input closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}

async fn verify(config: DaemonConfig) -> anyhow::Result<()> {
    let audit = config.audit.open().await?;
    let report = audit.verify();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.valid {
        anyhow::bail!(
            "audit chain broken: {} of {} entries fail verification",
            report.broken.len(),
            report.total_entries
        );
    }
    Ok(())
}

async fn log(config: DaemonConfig, limit: usize, offset: usize) -> anyhow::Result<()> {
    let audit = config.audit.open().await?;
    let entries = audit.action_log(limit, offset);
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
