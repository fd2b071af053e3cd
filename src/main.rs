//! smell_daq command line front end.
//!
//! Thin driver over [`SessionDirectory`]: discover ports, query a device, set
//! its fan, or record a test while printing every captured sample as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::spawn_blocking;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use smell_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use smell_daq::link::{Command, SerialPortOpener};
use smell_daq::ports::{platform_discovery, PortRegistry};
use smell_daq::sink::BroadcastSink;
use smell_daq::store::DataStore;
use smell_daq::SessionDirectory;

#[derive(Parser)]
#[command(name = "smell_daq")]
#[command(version)]
#[command(about = "Acquisition pipeline for SmellInspector sensing units", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate serial ports
    Ports {
        /// Driver hint overriding the configured one
        #[arg(long)]
        hint: Option<String>,
    },

    /// Register a device and print its metadata
    Info {
        /// Device nickname
        #[arg(short, long)]
        name: String,

        /// Serial port to try before discovery
        #[arg(short, long)]
        port: Option<String>,
    },

    /// Set the fan speed of a device
    Fan {
        /// Device nickname
        #[arg(short, long)]
        name: String,

        /// Fan level
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=3))]
        level: u8,

        /// Serial port to try before discovery
        #[arg(short, long)]
        port: Option<String>,
    },

    /// Record a test, printing samples until Ctrl-C or the duration elapses
    Record {
        /// Device nickname
        #[arg(short, long)]
        name: String,

        /// Test name, must never have been used before
        #[arg(short, long)]
        test: String,

        /// Serial port to try before discovery
        #[arg(short, long)]
        port: Option<String>,

        /// Substance to record instead of ambient air
        #[arg(short, long)]
        substance: Option<String>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(feature = "storage_csv")]
fn open_store(settings: &Settings) -> Result<Arc<dyn DataStore>> {
    let data_dir = &settings.storage.data_dir;
    let store = smell_daq::store::CsvStore::open(data_dir)
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "storage_csv"))]
fn open_store(_settings: &Settings) -> Result<Arc<dyn DataStore>> {
    warn!("Built without storage_csv, samples are kept in memory only");
    Ok(Arc::new(smell_daq::store::MemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_tracing(&settings.application.log_level);
    info!(app = %settings.application.name, "Starting");

    let registry = Arc::new(PortRegistry::new(platform_discovery(
        settings.serial.vendor_id,
    )));

    if let Commands::Ports { hint } = &cli.command {
        let hint = hint.clone().unwrap_or_else(|| settings.serial.driver_hint.clone());
        let ports = spawn_blocking(move || registry.discover(&hint)).await??;
        for port in ports {
            println!("{port}");
        }
        return Ok(());
    }

    let sink = Arc::new(BroadcastSink::new(256));
    let directory = Arc::new(SessionDirectory::new(
        registry,
        Arc::new(SerialPortOpener),
        open_store(&settings)?,
        sink.clone(),
        settings,
    )?);

    let outcome = run(cli.command, directory.clone(), sink).await;

    spawn_blocking(move || directory.shutdown()).await?;
    outcome
}

async fn register(
    directory: &Arc<SessionDirectory>,
    name: &str,
    port: Option<String>,
) -> Result<smell_daq::link::DeviceInfo> {
    let dir = directory.clone();
    let name = name.to_string();
    let info = spawn_blocking(move || dir.register(&name, port.as_deref())).await??;
    Ok(info)
}

async fn run(
    command: Commands,
    directory: Arc<SessionDirectory>,
    sink: Arc<BroadcastSink>,
) -> Result<()> {
    match command {
        Commands::Ports { .. } => Ok(()),

        Commands::Info { name, port } => {
            let info = register(&directory, &name, port).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }

        Commands::Fan { name, level, port } => {
            register(&directory, &name, port).await?;
            let command = Command::fan(level).context("fan level out of range")?;
            let dir = directory.clone();
            let reply = spawn_blocking(move || dir.write_command(&name, command.as_str())).await??;
            println!("{reply}");
            Ok(())
        }

        Commands::Record {
            name,
            test,
            port,
            substance,
            duration,
        } => {
            register(&directory, &name, port).await?;
            let mut rx = sink.subscribe();

            let dir = directory.clone();
            let test_name = test.clone();
            spawn_blocking(move || -> Result<()> {
                dir.start_session(&test_name, &name)?;
                if let Some(substance) = substance {
                    dir.change_substance(&test_name, &substance)?;
                }
                Ok(())
            })
            .await??;
            info!(test = %test, "Recording, press Ctrl-C to stop");

            let stop = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!(error = %e, "Unable to listen for Ctrl-C");
                        }
                    }
                }
            };
            tokio::pin!(stop);
            let mut watchdog = tokio::time::interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = watchdog.tick() => {
                        if directory.list_active().iter().all(|t| t.test_name != test) {
                            warn!(test = %test, "Test is no longer running");
                            break;
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(sample) => println!("{}", serde_json::to_string(&sample)?),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Sample printer lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            let dir = directory.clone();
            spawn_blocking(move || dir.stop_session(&test, None)).await??;
            Ok(())
        }
    }
}
