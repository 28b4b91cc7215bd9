//! sysboot binary entry point.
//!
//! As PID 1 it runs both boot stages in order. The stage subcommands
//! exist for initramfs layouts that re-exec the binary per stage, and
//! `--root`/`--no-pid1` let operators and tests drive a staged tree.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sysboot_init::{first_stage, Init, InitConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sysboot", about = "User-space process-1 for Linux-class devices", version)]
struct Cli {
    /// Filesystem root to operate on
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Don't require running as PID 1
    #[arg(long)]
    no_pid1: bool,

    /// Don't mount virtual filesystems in the first stage
    #[arg(long)]
    no_mount: bool,

    #[command(subcommand)]
    stage: Option<Stage>,
}

#[derive(Subcommand)]
enum Stage {
    /// Run only the first stage: mounts, boot config, kernel modules
    FirstStage,
    /// Run only the second stage: properties, policy, services
    SecondStage,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = InitConfig {
        root: cli.root,
        require_pid1: !cli.no_pid1,
        mount_filesystems: !cli.no_mount,
        persist_file: None,
    };

    match cli.stage {
        Some(Stage::FirstStage) => {
            first_stage(&config);
        }
        Some(Stage::SecondStage) => {
            let mut init = Init::new(config)?;
            init.run().await?;
        }
        None => {
            first_stage(&config);
            let mut init = Init::new(config)?;
            init.run().await?;
            info!("init exiting");
        }
    }

    Ok(())
}
