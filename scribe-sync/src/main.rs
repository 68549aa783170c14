//! scribe-sync - command-line sync client
//!
//! Loads one owner's sessions, keeps them reconciled with push updates and
//! drives backend jobs from the terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scribe_common::config::TomlConfig;
use scribe_sync::transport::StaticToken;
use scribe_sync::SyncClient;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Command-line arguments for scribe-sync
#[derive(Parser, Debug)]
#[command(name = "scribe-sync")]
#[command(about = "Session sync client for the scribe backend")]
#[command(version)]
struct Args {
    /// Config file (TOML); falls back to SCRIBE_CONFIG, then the user config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Owner (user id) whose sessions to sync
    #[arg(short, long, env = "SCRIBE_OWNER")]
    owner: String,

    /// Bearer token for the backend
    #[arg(long, env = "SCRIBE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the session list whenever it changes, until Ctrl-C
    Watch,
    /// Generate the summary of a session and print the job result
    Summarize { session_id: Uuid },
    /// Start the client and print channel health
    Channels,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::resolve(args.config.as_deref()).context("Failed to load config")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting scribe-sync v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Backend: {}", config.api_base_url);

    let client = SyncClient::new(config, args.owner, Arc::new(StaticToken(args.token)))?;
    client.start().await.context("Failed to start sync client")?;

    let outcome = match args.command {
        Command::Watch => watch(&client).await,
        Command::Summarize { session_id } => summarize(&client, session_id).await,
        Command::Channels => {
            let health = client.channel_health();
            println!("{} active channel(s)", health.active);
            for name in &health.names {
                println!("  {}", name);
            }
            for warning in &health.warnings {
                println!("warning: {}", warning);
            }
            Ok(())
        }
    };

    client.shutdown().await;
    outcome
}

async fn summarize(client: &SyncClient, session_id: Uuid) -> Result<()> {
    let result = tokio::select! {
        result = client.request_summary(session_id) => {
            result.with_context(|| format!("Summary for {} failed", session_id))?
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, abandoning summary job");
            return Ok(());
        }
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn watch(client: &SyncClient) -> Result<()> {
    let mut snapshots = client.subscribe();
    print_sessions(&snapshots.borrow_and_update());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping");
                return Ok(());
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                print_sessions(&snapshots.borrow_and_update());
            }
        }
    }
}

fn print_sessions(snapshot: &scribe_sync::reconciler::SessionSnapshot) {
    if snapshot.loading {
        return;
    }
    println!("--- {} session(s) ---", snapshot.sessions.len());
    for session in snapshot.sessions.iter() {
        let marker = if snapshot.is_reprocessing(session.id) {
            " (reprocessing)"
        } else {
            ""
        };
        println!(
            "{}  {:<10} {}{}",
            session.id,
            format!("{:?}", session.status).to_lowercase(),
            session.title,
            marker
        );
    }
}
