//! usb-bridge
//!
//! Runs the USB bridge on the local libusb host. By default a monitoring
//! daemon logs the attached devices and re-enumerates on every hotplug
//! notice until Ctrl+C.

use anyhow::{Context, Result, anyhow};
use bridge::host::{LibusbHost, UsbHost};
use bridge::{BridgeConfig, Daemon, DaemonService, IdentityTable, UsbBridge};
use clap::Parser;
use common::setup_logging;
use protocol::{BridgeCallbacks, DeviceDescriptor, TransferCompletion};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-bridge")]
#[command(author, version, about = "USB device bridge for native daemons")]
#[command(long_about = "
Enumerates USB devices, negotiates access, and pumps asynchronous transfers
on behalf of a native daemon.

EXAMPLES:
    # Monitor devices with default config
    usb-bridge

    # List USB devices as JSON and exit
    usb-bridge --list-devices --json

    # Run with debug logging
    usb-bridge --log-level debug

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-bridge/bridge.toml
    3. /etc/usb-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON (with --list-devices)
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(BridgeConfig::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let host: Arc<dyn UsbHost> =
        Arc::new(LibusbHost::new().context("Failed to initialize libusb")?);

    let (hotplug_tx, hotplug_rx) = async_channel::unbounded();
    let callbacks = Arc::new(MonitorCallbacks { hotplug_tx });

    let bridge = Arc::new(
        UsbBridge::start(host, callbacks, &config, Arc::new(IdentityTable::new()))
            .context("Failed to start USB bridge")?,
    );

    let result = if args.list_devices {
        list_devices_mode(&bridge, args.json)
    } else {
        run_monitor(Arc::clone(&bridge), hotplug_rx).await
    };

    bridge.shutdown();
    result
}

/// List USB devices and exit
fn list_devices_mode(bridge: &UsbBridge, json: bool) -> Result<()> {
    let devices = bridge.enumerate();

    if json {
        let out = serde_json::to_string_pretty(&devices).context("Failed to serialize devices")?;
        println!("{}", out);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in &devices {
            print_device(device);
        }
    }

    Ok(())
}

fn print_device(device: &DeviceDescriptor) {
    println!(
        "  {} {:04x}:{:04x}",
        device.name, device.vendor_id, device.product_id
    );
    println!(
        "      Bus {:03} Device {:03}",
        device.bus_number, device.device_address
    );
    for (index, interface) in device.interfaces.iter().enumerate() {
        println!(
            "      Interface {}: endpoints {:02x?}",
            index, interface.endpoint_addresses
        );
    }
    println!();
}

/// Run the monitoring daemon until Ctrl+C
async fn run_monitor(bridge: Arc<UsbBridge>, hotplug: async_channel::Receiver<()>) -> Result<()> {
    let daemon = Arc::new(MonitorDaemon { hotplug });
    let service = DaemonService::new(bridge, daemon);

    service
        .start()
        .map_err(|e| anyhow!("Failed to start monitor: {}", e))?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    tokio::task::spawn_blocking(move || service.stop())
        .await
        .context("Monitor shutdown task failed")?;

    Ok(())
}

/// Forwards hotplug notices to the monitor
struct MonitorCallbacks {
    hotplug_tx: async_channel::Sender<()>,
}

impl BridgeCallbacks for MonitorCallbacks {
    fn on_transfer_completed(&self, completion: TransferCompletion) {
        debug!(
            "Transfer {:?} on endpoint {:#04x} finished: {:?}, {} bytes",
            completion.token, completion.endpoint, completion.status, completion.bytes_transferred
        );
    }

    fn on_hotplug_event(&self) {
        if self.hotplug_tx.try_send(()).is_err() {
            debug!("Hotplug notice dropped: monitor not running");
        }
    }
}

/// Logs the device list at start and after every hotplug notice
struct MonitorDaemon {
    hotplug: async_channel::Receiver<()>,
}

impl Daemon for MonitorDaemon {
    fn run(&self, bridge: Arc<UsbBridge>) {
        loop {
            let devices = bridge.enumerate();
            info!("{} USB device(s) attached", devices.len());
            for device in &devices {
                info!(
                    "  {} {:04x}:{:04x} (bus {:03} device {:03})",
                    device.name,
                    device.vendor_id,
                    device.product_id,
                    device.bus_number,
                    device.device_address
                );
            }

            if self.hotplug.recv_blocking().is_err() {
                break;
            }

            // Collapse a burst of notices into one enumeration
            while self.hotplug.try_recv().is_ok() {}
        }
    }

    fn interrupt(&self) {
        if !self.hotplug.close() {
            warn!("Monitor channel already closed");
        }
    }
}
