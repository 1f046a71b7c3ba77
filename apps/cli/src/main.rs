//! NTFS Manager CLI - command line front end for the drive engine.
//!
//! Every subcommand builds one [`DriveManager`], refreshes the inventory and
//! runs a single operation. `monitor` keeps running and prints drive events
//! until interrupted.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ntfs_manager_core::{DriveManager, DriveRecord, Result, Settings};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt};

/// NTFS Manager CLI tool.
#[derive(Parser)]
#[command(name = "ntfs-manager-cli")]
#[command(about = "Manage block devices and mount NTFS volumes", long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.config/ntfs-manager/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all drives and partitions.
    List,
    /// Show every field of one drive.
    Info { name: String },
    /// Mount a drive. NTFS volumes go through driver fallback.
    Mount {
        name: String,
        /// Mount at this directory instead of the volume manager's choice.
        #[arg(long)]
        at: Option<PathBuf>,
        /// Mount options replacing the per-driver defaults.
        #[arg(short, long)]
        options: Option<String>,
    },
    /// Unmount a drive.
    Unmount { name: String },
    /// Create a new filesystem (ntfs, ext4, fat32).
    Format {
        name: String,
        fstype: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Repair the filesystem of an unmounted drive.
    Repair { name: String },
    /// List processes holding a path open.
    Busy { path: String },
    /// Unmount every partition of a disk and power it off.
    Eject { name: String },
    /// Run the filesystem and SMART checks.
    Check { name: String },
    /// Show NTFS volume details.
    NtfsInfo { name: String },
    /// Show selected SMART attributes.
    Smart { name: String },
    /// Mount all internal NTFS partitions.
    AutoMount,
    /// Watch for hot-plug events and print drive events.
    Monitor,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "ntfs_manager=info,ntfs_manager_core=info,warn",
        1 => "ntfs_manager=debug,ntfs_manager_core=debug,info",
        _ => "trace",
    };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path),
        None => Settings::load_default(),
    }
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Failed to serialize output: {e}"),
        }
    } else {
        println!("{value:#?}");
    }
}

fn print_table(drives: &[DriveRecord]) {
    println!(
        "{:<12} {:>10} {:<8} {:<16} {:<10} {:<22} MOUNT",
        "NAME", "SIZE", "FSTYPE", "LABEL", "HEALTH", "STATUS"
    );
    for drive in drives {
        println!(
            "{:<12} {:>10} {:<8} {:<16} {:<10} {:<22} {}",
            drive.name,
            drive.size_display(),
            drive.filesystem_type,
            drive.label,
            drive.health_status,
            drive.status(),
            drive.mount_point
        );
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_ref())?;
    let manager = DriveManager::new(settings);
    manager.refresh().await?;
    let json = cli.json;

    match cli.command {
        Commands::List => {
            let drives = manager.list_all();
            if json {
                print(true, &drives);
            } else {
                print_table(&drives);
            }
        }
        Commands::Info { name } => print(json, &manager.get(&name)?),
        Commands::Mount { name, at, options } => {
            let outcome = manager
                .mount_with_retry(&name, at.as_deref(), options.as_deref())
                .await?;
            print(json, &outcome);
            outcome.into_result(&name)?;
        }
        Commands::Unmount { name } => print(json, &manager.unmount(&name).await?),
        Commands::Format { name, fstype, label } => {
            print(json, &manager.format(&name, &fstype, label.as_deref()).await?);
        }
        Commands::Repair { name } => print(json, &manager.repair(&name).await?),
        Commands::Busy { path } => print(json, &manager.check_busy(&path).await),
        Commands::Eject { name } => {
            manager.safe_eject(&name).await?;
            println!("{name} can be safely removed");
        }
        Commands::Check { name } => print(json, &manager.run_disk_check(&name).await?),
        Commands::NtfsInfo { name } => print(json, &manager.ntfs_volume_info(&name).await?),
        Commands::Smart { name } => print(json, &manager.smart_attributes(&name).await?),
        Commands::AutoMount => {
            for (name, result) in manager.auto_mount_internal().await {
                match result {
                    Ok(outcome) => println!(
                        "{name}: {:?} {}",
                        outcome.status,
                        outcome.mount_point.unwrap_or_default()
                    ),
                    Err(e) => println!("{name}: {e}"),
                }
            }
        }
        Commands::Monitor => {
            let mut events = manager.bus().channel();
            manager.start_monitor().await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => print(json, &event),
                        None => break,
                    },
                }
            }
            tracing::info!("Received shutdown signal");
            manager.stop_monitor().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error ({}): {}", e.reason(), e);
        std::process::exit(1);
    }
}
