//! scope-usb
//!
//! Diagnostic front end for the oscilloscope USB transport: lists
//! candidate instruments, connects one, and performs raw capture reads on a
//! dedicated worker thread.

mod config;
mod logging;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use config::ProbeConfig;
use logging::setup_logging;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use transport::{
    ChunkingMode, DeviceEvent, DeviceFinder, DeviceIdentity, RawDevice, RusbBackend, ScopeDevice,
    TransferError,
};

#[derive(Parser, Debug)]
#[command(name = "scope-usb")]
#[command(author, version, about = "Connect to Hantek-family USB oscilloscopes")]
#[command(long_about = "
Lists, connects and reads from Hantek-family USB oscilloscopes.

EXAMPLES:
    # List supported instruments on the bus
    scope-usb --list-devices

    # Connect one instrument and show its interface details
    scope-usb --connect 1200000004B50210

    # Read 1 MiB of capture data in one transfer
    scope-usb --connect 1200000004B50210 --read 1048576 --bulk

    # Exercise the software-only demo device
    scope-usb --demo --read 4096

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/scope-usb/config.toml
    3. /etc/scope-usb/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List supported instruments and exit
    #[arg(long)]
    list_devices: bool,

    /// Connect the instrument with this identifier (hex)
    #[arg(long, value_name = "ID")]
    connect: Option<String>,

    /// Read this many bytes of capture data after connecting
    #[arg(long, value_name = "BYTES")]
    read: Option<usize>,

    /// Read in small chunks (interactive capture)
    #[arg(long, conflicts_with = "bulk")]
    chunked: bool,

    /// Read in a single transfer (fast capture)
    #[arg(long)]
    bulk: bool,

    /// Use the software-only demo device
    #[arg(long)]
    demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ProbeConfig::default();
        let path = ProbeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ProbeConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        ProbeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("scope-usb v{}", env!("CARGO_PKG_VERSION"));

    let mode = if args.bulk {
        ChunkingMode::Bulk
    } else if args.chunked {
        ChunkingMode::Chunked
    } else {
        ChunkingMode::from_small_blocks(config.capture.chunked)
    };

    if args.demo {
        let device = ScopeDevice::<transport::RusbDevice>::demo()
            .with_timing(config.transfer.clone());
        print_device(device.identity(), &device);
        if let Some(length) = args.read {
            read_mode(device, length, mode).await?;
        }
        return Ok(());
    }

    let backend = RusbBackend::new()
        .map_err(|e| anyhow!("Failed to initialise libusb: {}", e))?;
    let mut finder = DeviceFinder::new(backend).with_timing(config.transfer.clone());
    finder
        .update_device_list()
        .map_err(|e| anyhow!("Failed to enumerate USB devices: {}", e))?;

    if args.list_devices {
        list_devices_mode(&finder, config.device.model.as_deref());
        return Ok(());
    }

    let target = match args.connect.as_deref() {
        Some(id) => Some(
            id.parse::<DeviceIdentity>()
                .map_err(|e| anyhow!("Invalid device identifier '{}': {}", id, e))?,
        ),
        None => config.device.identity()?,
    };
    let Some(target) = target.or_else(|| first_usable(&finder, config.device.model.as_deref()))
    else {
        println!("No supported instrument found.");
        return Ok(());
    };

    let mut device = finder
        .take_device(target)
        .ok_or_else(|| anyhow!("Device {} not found", target))?;

    device
        .connect()
        .with_context(|| format!("Failed to connect {} {}", device.model().name, target))?;
    print_device(target, &device);

    if let Some(length) = args.read {
        read_mode(device, length, mode).await?;
    }

    Ok(())
}

/// List supported instruments and exit
fn list_devices_mode(finder: &DeviceFinder<RusbBackend>, model: Option<&str>) {
    let devices: Vec<_> = finder
        .devices()
        .filter(|(_, device)| matches_model(device, model))
        .collect();

    if devices.is_empty() {
        println!("No supported instruments found.");
        return;
    }

    println!("Found {} instrument(s):\n", devices.len());
    for (identity, device) in devices {
        println!("  [{}] {} - {}", identity, device.model().name, device.state());
        println!(
            "      Address {}  Port path {}",
            device.address_string(),
            device
                .topology()
                .map_or_else(|| "-".to_string(), ToString::to_string)
        );
        println!();
    }
}

fn matches_model<D: RawDevice>(device: &ScopeDevice<D>, model: Option<&str>) -> bool {
    model.is_none_or(|name| device.model().name.eq_ignore_ascii_case(name))
}

/// First instrument that does not need firmware
fn first_usable(finder: &DeviceFinder<RusbBackend>, model: Option<&str>) -> Option<DeviceIdentity> {
    finder
        .devices()
        .find(|(_, device)| !device.needs_firmware() && matches_model(device, model))
        .map(|(identity, _)| identity)
}

fn print_device<D: RawDevice>(identity: DeviceIdentity, device: &ScopeDevice<D>) {
    println!("Device {} ({})", identity, device.model().name);
    println!("  State:      {}", device.state());
    println!("  Address:    {}", device.address_string());
    let serial = device.serial_number();
    println!(
        "  Serial:     {}",
        if serial.is_empty() { "-" } else { serial }
    );
    if let Some(interface) = device.claimed_interface() {
        println!("  Interface:  {}", interface);
    }
    println!(
        "  Packets:    in {} / out {} bytes",
        device.in_max_packet_size(),
        device.out_max_packet_size()
    );
}

/// Read capture data on a worker thread until done, stopped or lost
async fn read_mode<D>(mut device: ScopeDevice<D>, length: usize, mode: ChunkingMode) -> Result<()>
where
    D: RawDevice + 'static,
{
    let stop = device.stop_flag();
    let events = device.subscribe();
    let attempts = device.timing().read_attempts;

    info!("Reading {} bytes ({:?} mode), Ctrl+C to stop", length, mode);

    let (tx, mut rx) = oneshot::channel();
    let worker = std::thread::Builder::new()
        .name("capture-worker".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; length];
            let result = device.bulk_read_multi(&mut buffer, length, mode, attempts);
            let _ = tx.send(result);
            device
        })
        .context("Failed to spawn capture worker")?;

    let mut events_open = true;
    let result = loop {
        tokio::select! {
            result = &mut rx => {
                break result.map_err(|_| anyhow!("Capture worker exited without a result"))?;
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping capture...");
                stop.request();
            }
            event = events.recv(), if events_open => match event {
                Ok(DeviceEvent::Disconnected { identity, serial_number }) => {
                    warn!("Device {} (serial '{}') disconnected", identity, serial_number);
                }
                Err(_) => events_open = false,
            },
        }
    };

    let mut device = match worker.join() {
        Ok(device) => device,
        Err(e) => {
            error!("Capture worker panicked: {:?}", e);
            return Err(anyhow!("Capture worker panicked"));
        }
    };

    match result {
        Ok(received) => println!("Received {} of {} bytes", received, length),
        Err(TransferError::DeviceGone) => println!("Device was disconnected during the read"),
        Err(e) => return Err(e).context("Capture read failed"),
    }

    device.disconnect();
    Ok(())
}
