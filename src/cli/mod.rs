//! CLI module for Clawgate
//!
//! Provides the operator commands:
//! - `serve`: run the gateway (supervisor, proxy, terminal, backup)
//! - `doctor`: environment diagnostics before going live

use clap::{Parser, Subcommand};

pub mod doctor;

/// Clawgate edge gateway CLI
#[derive(Parser, Debug)]
#[command(name = "clawgate")]
#[command(about = "Supervising edge gateway for the OpenClaw worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run environment diagnostics
    Doctor,
    /// Start the gateway (default)
    Serve,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Doctor) => doctor::run().await,
        Some(Commands::Serve) => crate::server::run().await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}
