// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! MxLink CLI
//!
//! Command-line interface for the mxlink host/co-processor transport.

use clap::{Parser, Subcommand};

mod commands;

/// MxLink - Shared-memory transport between a host and a co-processor
#[derive(Parser)]
#[command(name = "mxlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "mxlink.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Run every transport against a simulated co-processor
    Loopback {
        /// Messages each peer sends per transport
        #[arg(short, long, default_value_t = 1000)]
        messages: u64,

        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the wire descriptors the co-processor would be handed
    Descriptors {
        /// Emit JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Validate { file } => commands::validate::execute(&file).await,
        Commands::Loopback { messages, timeout } => {
            commands::loopback::execute(&cli.config, messages, timeout).await
        }
        Commands::Descriptors { json } => commands::descriptors::execute(&cli.config, json).await,
    }
}
