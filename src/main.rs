//! Clawgate - Supervising edge gateway for the OpenClaw worker
//!
//! CLI entry point for the gateway.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod middleware;
mod proxy;
mod server;
mod websocket;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clawgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = cli::Cli::parse();

    if cli.command.is_some() {
        info!("Clawgate v{}", env!("CARGO_PKG_VERSION"));
    }

    cli::run(cli).await
}
