//! CLI entry point for labstream.
//!
//! Provides a small command-line frontend over the acquisition engine:
//!
//! List the built-in drivers:
//! ```bash
//! labstream drivers
//! ```
//!
//! Capture from the demo device into a value change dump:
//! ```bash
//! labstream capture --samples 10000 --samplerate 200000 -o capture.vcd
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use labstream::driver::DriverRegistry;
use labstream::drivers::demo::DemoDriver;
use labstream::output::vcd::VcdWriter;
use labstream::{ConfigKey, ConfigValue, DriverKind, ScanOptions, Session};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "labstream")]
#[command(about = "Instrument acquisition engine with VCD output", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in drivers
    Drivers,

    /// Capture demo-device data to a VCD file
    Capture {
        /// Output file path
        #[arg(short, long, default_value = "capture.vcd")]
        output: PathBuf,

        /// Number of samples to acquire
        #[arg(long, default_value = "10000")]
        samples: u64,

        /// Sample rate in Hz
        #[arg(long, default_value = "200000")]
        samplerate: u64,

        /// Logic pattern (inc, random, all-low, all-high)
        #[arg(long, default_value = "inc")]
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Drivers => list_drivers(),
        Commands::Capture {
            output,
            samples,
            samplerate,
            pattern,
        } => capture(output, samples, samplerate, pattern).await,
    }
}

fn list_drivers() -> Result<()> {
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(DemoDriver::new()))?;
    registry.register(Box::new(labstream::drivers::relay::RelayDriver::new()))?;
    registry.register(Box::new(labstream::drivers::dmm::DmmDriver::new()))?;
    for kind in registry.kinds() {
        println!("{}", kind.id());
    }
    Ok(())
}

async fn capture(output: PathBuf, samples: u64, samplerate: u64, pattern: String) -> Result<()> {
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(DemoDriver::new()))?;

    let ids = registry
        .scan(DriverKind::Demo, &ScanOptions::default())
        .await?;
    let id = *ids.first().context("demo scan found no device")?;

    let device = registry.device_mut(id).context("device vanished")?;
    device.open().await?;
    device
        .config_set(ConfigKey::Samplerate, ConfigValue::UInt(samplerate), None)
        .await?;
    device
        .config_set(ConfigKey::LimitSamples, ConfigValue::UInt(samples), None)
        .await?;
    device
        .config_set(
            ConfigKey::PatternMode,
            ConfigValue::Str(pattern),
            Some("Logic"),
        )
        .await?;

    let file = File::create(&output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let writer = VcdWriter::new(BufWriter::new(file), device.info())?;

    let mut session = Session::new();
    session.add_sink(Box::new(writer));
    session.start(device).await?;
    session.run().await?;

    let device = registry.device_mut(id).context("device vanished")?;
    device.stop().await?;
    session.pump();
    device.close().await?;

    tracing::info!(path = %output.display(), samples, "capture finished");
    Ok(())
}
