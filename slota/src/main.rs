//! OTA firmware update tool for BLE peripherals
//!
//! Scans for devices and pushes firmware images over the slota GATT service.

use clap::{Parser, Subcommand};
use slota_ble::{BleLink, ble};
use slota_ota::{
    FirmwareImage, Notice, OtaConfig, Phase, ProgressReporter, TransferOutcome, Updater,
    cancel_pair, config_path, event_channel,
};
use slota_proto::DeviceAddress;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slota")]
#[command(about = "OTA firmware updates for BLE peripherals")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file, defaults to $SLOTA_HOME/config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Upload a firmware image to a device
    Update {
        /// Device address, e.g. 0C:43:14:F2:A1:9B
        #[arg(short, long)]
        address: String,
        /// Firmware image file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_file = cli.config.unwrap_or_else(config_path);
    let config = OtaConfig::load_or_default(&config_file)?;

    match cli.command {
        Commands::Scan { duration } => {
            scan_devices(duration).await?;
        }
        Commands::Update { address, file } => {
            update_device(config, &address, &file).await?;
        }
        Commands::Config => {
            eprintln!("# {}", config_file.display());
            println!("{}", config.to_json()?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn scan_devices(duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for BLE devices ({} seconds)...", duration);

    let adapter = ble::get_adapter().await?;
    let devices = ble::scan(&adapter, Duration::from_secs(duration)).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.advertises_ota { " [OTA]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }

    Ok(())
}

async fn update_device(
    config: OtaConfig,
    address: &str,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let address: DeviceAddress = address.parse()?;
    let image = FirmwareImage::load(file).await?;
    println!("Updating {} with {} ({} bytes)", address, file.display(), image.len());

    let adapter = ble::get_adapter().await?;
    let (sink, events) = event_channel();
    let link = BleLink::new(adapter, sink, config.link.clone()).await?;
    let updater = Updater::new(Arc::new(link), events, config, Arc::new(ConsoleReporter));

    let (cancel, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling...");
            cancel.cancel();
        }
    });

    updater
        .run(address, image, token)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Prints transfer progress to stdout
struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn phase_changed(&self, phase: Phase) {
        match phase {
            Phase::Ready | Phase::Aborted => {}
            phase => println!("-> {}", phase),
        }
    }

    fn notice(&self, notice: &Notice) {
        println!("{}", notice);
    }

    fn upload_progress(&self, sent: usize, total: usize) {
        let percent = sent * 100 / total.max(1);
        println!("   {}/{} bytes ({}%)", sent, total, percent);
    }

    fn finished(&self, outcome: &TransferOutcome) {
        if let Ok(summary) = outcome {
            let mtu = if summary.mtu_negotiated { "negotiated" } else { "requested" };
            println!(
                "\nUpdated {}: {} bytes in {} frames of {} bytes ({} retries, MTU {} {}) in {:.1}s",
                summary.device,
                summary.bytes,
                summary.frames,
                summary.frame_size,
                summary.frame_retries,
                summary.mtu,
                mtu,
                summary.elapsed.as_secs_f32()
            );
        }
    }
}
