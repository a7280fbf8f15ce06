// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Eidetic CLI
//!
//! The `eidetic` binary mounts a source directory as a versioned,
//! self-describing filesystem served over NFSv3.
//!
//! ## Commands
//!
//! - `eidetic mount [SOURCE]` - Serve the overlay until interrupted
//! - `eidetic config show|validate|generate` - Inspect and scaffold manifests
//!
//! Once mounted, attach it with:
//!
//! ```text
//! mount -t nfs -o nfsvers=3,tcp,nolock,port=2049,mountport=2049 127.0.0.1:/ /mnt/eidetic
//! ```

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ConfigCommand, MountArgs};

/// Eidetic - a filesystem that remembers every version and explains itself
#[derive(Parser)]
#[command(name = "eidetic", version, about, propagate_version = true)]
struct Cli {
    /// Mount manifest to use instead of the discovered one
    #[arg(short, long, global = true, env = "EIDETIC_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log line format
    #[arg(long, global = true, env = "EIDETIC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a source directory and serve it over NFS
    Mount(MountArgs),

    /// Inspect, check or scaffold a mount manifest
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

impl Cli {
    /// `RUST_LOG` wins; otherwise a long-running mount logs at info and
    /// one-shot commands stay at warn so their output is readable.
    fn log_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let base = match &self.command {
            Some(Commands::Mount(_)) => 2,
            _ => 1,
        };
        let level = if self.quiet {
            "error"
        } else {
            match base + self.verbose {
                1 => "warn",
                2 => "info",
                3 => "debug",
                _ => "trace",
            }
        };
        EnvFilter::try_new(level).context("Failed to create log filter")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let filter = cli.log_filter()?;
    let logs = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match cli.log_format {
        LogFormat::Compact => logs.compact().init(),
        LogFormat::Json => logs.json().init(),
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        std::process::exit(2);
    };

    match command {
        Commands::Mount(args) => commands::mount::execute(args, cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
    }
}
