// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `eidetic mount` - serve a source directory until interrupted

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use eidetic_core::application::mount_gateway::MountGateway;
use eidetic_core::domain::mount_config::{MountConfigManifest, MountSpec};

#[derive(Args, Debug, Default)]
pub struct MountArgs {
    /// Source directory to overlay (default: from config)
    #[arg(value_name = "SOURCE")]
    pub source: Option<PathBuf>,

    /// NFS listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// NFS bind address
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Keep the source tree untouched; changes live only in the store
    #[arg(long)]
    pub no_mirror: bool,
}

pub async fn execute(args: MountArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut manifest = MountConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    apply_args(&mut manifest.spec, &args);
    manifest.validate().context("Configuration validation failed")?;

    let spec = manifest.spec;
    print_summary(&manifest.metadata.name, &spec);

    let gateway = MountGateway::new(spec);
    gateway.start().await.context("Failed to start mount")?;

    println!("{}", "✓ Mount is being served".green());
    println!(
        "  mount -t nfs -o nfsvers=3,tcp,nolock,port={port},mountport={port} {addr}:/ <mountpoint>",
        port = gateway.bind_port(),
        addr = gateway.spec().nfs.bind_address
    );
    println!("{}", "Press Ctrl+C to stop".dimmed());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    gateway.stop().await.context("Failed to stop mount cleanly")?;
    println!("{}", "✓ Mount stopped".green());
    Ok(())
}

/// Command-line flags win over file and environment settings.
fn apply_args(spec: &mut MountSpec, args: &MountArgs) {
    if let Some(source) = &args.source {
        spec.source = source.clone();
    }
    if let Some(port) = args.port {
        spec.nfs.port = port;
    }
    if let Some(bind) = &args.bind {
        spec.nfs.bind_address = bind.clone();
    }
    if args.no_mirror {
        spec.mirror_writes = false;
    }
}

fn print_summary(name: &str, spec: &MountSpec) {
    println!("{} {}", "Mounting".bold(), name);
    println!("  Source: {}", spec.source.display());
    println!("  NFS: {}:{}", spec.nfs.bind_address, spec.nfs.port);
    println!("  Vault: {} (secret from ${})", spec.vault.root, spec.vault.secret_env);
    println!(
        "  Analysis: {} workers, queue {}",
        spec.analysis.workers, spec.analysis.queue_capacity
    );
    if !spec.mirror_writes {
        println!("  {}", "Source tree mirroring disabled".yellow());
    }
    println!();
}
