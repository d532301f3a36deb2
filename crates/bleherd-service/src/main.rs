//! bleherd - supervise BLE plant sensors and locator tags.
//!
//! Run with: `cargo run -p bleherd-service -- run`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bleherd_core::{BtleTransport, CalibrationSet, Driver};
use bleherd_service::{Config, output};

/// Supervise BLE plant sensors and locator tags.
#[derive(Parser, Debug)]
#[command(name = "bleherd")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track peripherals and print events as JSON lines (default).
    Run,

    /// Buzz a locator tag once it has been found.
    Identify {
        /// Address of the tag.
        address: String,

        /// Seconds to wait for the tag to show up.
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = match &args.config {
        Some(path) => Config::load_validated(path)?,
        None => {
            let config = Config::load_default()?;
            config.validate()?;
            config
        }
    };

    let calibration = load_calibration(&config)?;
    let transport = BtleTransport::new()
        .await
        .context("Bluetooth adapter unavailable")?;
    let driver = Driver::new(Arc::new(transport), calibration, config.driver_config())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(driver).await,
        Command::Identify { address, timeout } => {
            identify(driver, &address, Duration::from_secs(timeout)).await
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("bleherd_core=debug,bleherd_service=debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("bleherd_core=info,bleherd_service=info"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_calibration(config: &Config) -> Result<CalibrationSet> {
    let paths = &config.calibration;
    let calibration = CalibrationSet::load(&paths.illuminance, &paths.moisture, &paths.temperature)
        .inspect_err(|e| error!("Cannot load calibration tables: {}", e))?;

    for (kind, missing) in calibration.gaps() {
        warn!(
            "{} table is missing {} keys (first: {:?}); those readings will publish 0.0",
            kind,
            missing.len(),
            missing.first()
        );
    }
    Ok(calibration)
}

async fn run(driver: Driver) -> Result<()> {
    let printer = tokio::spawn(output::write_events(driver.events(), std::io::stdout()));

    driver.start().await?;
    info!("Scanning; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    driver.shutdown().await;
    drop(driver);

    match tokio::time::timeout(Duration::from_secs(1), printer).await {
        Ok(Ok(Ok(lines))) => info!("Wrote {} events", lines),
        Ok(Ok(Err(e))) => warn!("Event output failed: {}", e),
        Ok(Err(e)) => warn!("Event output task failed: {}", e),
        Err(_) => {}
    }
    Ok(())
}

async fn identify(driver: Driver, address: &str, timeout: Duration) -> Result<()> {
    driver.start().await?;

    let deadline = Instant::now() + timeout;
    while driver.session(address).await.is_none() {
        if Instant::now() >= deadline {
            driver.shutdown().await;
            bail!("{} was not seen within {:?}", address, timeout);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    info!("Found {}, buzzing", address);
    let result = driver.identify(address).await;
    driver.shutdown().await;

    result.with_context(|| format!("Could not identify {}", address))?;
    println!("{} identified", address);
    Ok(())
}
