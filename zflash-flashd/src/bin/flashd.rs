//! Main entry point for the flashd daemon.
//!
//! Headless command-line front end over the orchestrator: one-shot and
//! batch flashing, hotplug monitor mode, device listing, and history
//! queries. A graphical front end consumes the same daemon events and
//! commands; it lives outside this crate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use zflash_flashd::config::Config;
use zflash_flashd::daemon::{Daemon, DaemonEvent};
use zflash_flashd::tracing::{self, prelude::*};

#[derive(Parser)]
#[command(name = "flashd", about = "Parallel ESP32 flash daemon")]
struct Cli {
    /// Configuration file path (default: config.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flash a specific device, or all connected devices
    Flash {
        /// Specific port to flash (default: all devices)
        #[arg(short, long)]
        port: Option<String>,

        /// Firmware file path (overrides config)
        #[arg(short, long)]
        firmware: Option<PathBuf>,
    },

    /// Monitor and auto-flash devices as they connect
    Monitor,

    /// List connected devices
    List,

    /// Show flash statistics
    Stats,

    /// Export flash history to a CSV file
    Export { path: PathBuf },

    /// Erase a device's entire flash
    Erase {
        #[arg(short, long)]
        port: String,
    },

    /// Clear all flash history
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let (daemon, events) = Daemon::new(config).context("failed to start daemon")?;

    match cli.command {
        Command::Flash {
            port: Some(port),
            firmware,
        } => {
            tokio::spawn(drain_events(events));
            let result = daemon.flash_device(&port, firmware.as_deref()).await?;
            std::process::exit(if result.success { 0 } else { 1 });
        }

        Command::Flash {
            port: None,
            firmware,
        } => {
            tokio::spawn(drain_events(events));
            let results = daemon.flash_all(firmware.as_deref()).await;
            for (port, result) in &results {
                match (&result.success, &result.error_msg) {
                    (true, _) => println!("{port}: ok"),
                    (false, Some(msg)) => println!("{port}: FAILED ({msg})"),
                    (false, None) => println!("{port}: FAILED"),
                }
            }
            let all_ok = results.values().all(|r| r.success);
            std::process::exit(if all_ok { 0 } else { 1 });
        }

        Command::Monitor => {
            tokio::spawn(drain_events(events));

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            let shutdown = daemon.shutdown_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigint.recv() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                shutdown.cancel();
            });

            daemon.monitor_mode().await;
        }

        Command::List => {
            drop(events);
            let devices = daemon.registry().scan();
            println!("Found {} device(s):", devices.len());
            for device in &devices {
                println!("  - {device}");
            }
        }

        Command::Stats => {
            drop(events);
            let stats = daemon.history().statistics(None)?;
            println!("Total flashes:  {}", stats.total);
            println!("Successful:     {}", stats.success);
            println!("Failed:         {}", stats.fail);
            if stats.total > 0 {
                let rate = stats.success as f64 / stats.total as f64 * 100.0;
                println!("Success rate:   {rate:.1}%");
            }
        }

        Command::Export { path } => {
            drop(events);
            let count = daemon.history().export_csv(&path, None)?;
            if count == 0 {
                println!("No records to export");
            } else {
                println!("Exported {count} record(s) to {}", path.display());
            }
        }

        Command::Erase { port } => {
            drop(events);
            if daemon.flasher().erase_flash(&port).await {
                println!("{port}: flash erased");
            } else {
                println!("{port}: erase FAILED");
                std::process::exit(1);
            }
        }

        Command::Reset => {
            drop(events);
            daemon.history().reset()?;
            println!("Flash history cleared");
        }
    }

    Ok(())
}

/// Keep the daemon's event channel drained when running headless.
///
/// Chip identities are worth surfacing; progress and terminal outcomes
/// are already logged by the orchestrator.
async fn drain_events(mut events: mpsc::Receiver<DaemonEvent>) {
    while let Some(event) = events.recv().await {
        if let DaemonEvent::ChipInfo {
            port,
            chip_type: Some(chip_type),
            mac,
        } = event
        {
            info!(port = %port, chip = %chip_type, mac = ?mac, "chip identified");
        }
    }
}
