//! SUMS daemon
//!
//! Allocates storage units, batches them to tape and reclaims disk space.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use sums::service::{CancelToken, RobotWorker, SimulatedDrive, SumsService};
use sums::SumsConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sumsd")]
#[command(about = "Storage unit management daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "/etc/sums/sums.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inventory the library, then serve archive ticks and reclaim passes
    Run {
        /// First storage unit number to hand out
        #[arg(long, default_value = "1")]
        first_sunum: u64,
    },

    /// Print library occupancy as JSON
    Inventory,

    /// Print a TAS file's header and block index
    TasInfo {
        file: PathBuf,
    },

    /// Rewrite a TAS file without unused heap space
    Defrag {
        file: PathBuf,

        /// Directory for the scratch copy
        #[arg(long)]
        scratch: Option<PathBuf>,
    },

    /// Reclaim delete-pending space
    Reclaim {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match &args.command {
        Command::TasInfo { file } => {
            let (header, index) = sums::tas::info(file)
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&header)?);
            for (block, entry) in index.iter().enumerate() {
                println!(
                    "{:6} offset={} length={} adler32={:#010x}{}",
                    block,
                    entry.offset,
                    entry.length,
                    entry.adler32,
                    if entry.is_sparse() { " (sparse)" } else { "" }
                );
            }
            return Ok(());
        }
        Command::Defrag { file, scratch } => {
            let changed = sums::tas::defragment(file, scratch.as_deref())
                .with_context(|| format!("defragmenting {}", file.display()))?;
            info!(
                "{} {}",
                file.display(),
                if changed { "defragmented" } else { "already compact" }
            );
            return Ok(());
        }
        _ => {}
    }

    let config = SumsConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("Configuration loaded from {}", args.config.display());

    match args.command {
        Command::Inventory => {
            let robot = RobotWorker::start(&config.library)?;
            let snapshot = robot.inventory().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Reclaim { once } => {
            let (drive, _events) = SimulatedDrive::new("NONE");
            let service = Arc::new(SumsService::new(config, 1, Arc::new(drive), None)?);
            loop {
                let report = service.reclaim().await?;
                info!(
                    "Reclaim removed {} units, {} bytes",
                    report.removed.len(),
                    report.bytes_freed
                );
                if once {
                    break;
                }
                let sleep = service.config().reclaim.sleep_secs.max(1);
                tokio::time::sleep(std::time::Duration::from_secs(sleep)).await;
            }
        }
        Command::Run { first_sunum } => {
            let robot = RobotWorker::start(&config.library)?;
            let snapshot = robot.inventory().await?;
            info!(
                "Library: {} drives, {} slots, {} empty",
                snapshot.drives.len(),
                snapshot.slots.len(),
                snapshot.empty_slots
            );

            // Tape writes complete in process until a drive manager is attached
            let (drive, events) = SimulatedDrive::new("SIM000");
            let service = Arc::new(SumsService::new(
                config,
                first_sunum,
                Arc::new(drive),
                Some(robot),
            )?);

            let cancel = CancelToken::new();
            let stop = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, shutting down...");
                    stop.cancel();
                }
            });

            info!("SUMS daemon running");
            service.run(events, cancel).await?;
        }
        Command::TasInfo { .. } | Command::Defrag { .. } => {}
    }

    info!("Shutting down gracefully...");
    Ok(())
}
