//! uvc-monitor
//!
//! Watches for USB cameras, asks the OS for access when one is plugged in,
//! and reports every lifecycle change on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use common::{HostBridge, HostCommand, create_host_bridge, setup_logging};
use monitor::config::{self, MonitorConfig};
use monitor::host::{self, RusbHost, UvcClaimTransport, spawn_host_worker};
use monitor::lifecycle::{CameraFilter, LifecycleController, LifecycleEvent};
use monitor::CaptureConfig;
use std::sync::{Arc, Weak};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "uvc-monitor")]
#[command(author, version, about = "USB camera connection lifecycle monitor")]
#[command(long_about = "
Tracks USB cameras as they are plugged in and out, requests access to each
one, and prints attach, permission and detach events.

EXAMPLES:
    # Run with default config
    uvc-monitor

    # Emit one JSON object per event
    uvc-monitor --json

    # Claim the video interfaces of every camera once access is granted
    uvc-monitor --auto-open

    # List USB devices and exit
    uvc-monitor --list-devices

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/uvc-monitor/monitor.toml
    3. /etc/uvc-monitor/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration (to --config or the default location) and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print events and device lists as JSON
    #[arg(long)]
    json: bool,

    /// Open every camera as soon as access is granted
    #[arg(long)]
    auto_open: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = args
            .config
            .as_deref()
            .map(config::expand_path)
            .unwrap_or_else(MonitorConfig::default_path);
        MonitorConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("uvc-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (bridge, worker) = create_host_bridge();
    let host_handle = spawn_host_worker(worker).context("Failed to spawn USB host thread")?;

    let result = if args.list_devices {
        list_devices_mode(&bridge, &config, args.json).await
    } else {
        run_monitor(&config, bridge.clone(), &args).await
    };

    info!("Shutting down USB host...");
    if let Err(e) = bridge.send_command(HostCommand::Shutdown).await {
        // The thread may already have stopped on its own
        warn!("Could not send shutdown to USB host: {}", e);
    }
    match host_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB host thread failed: {}", e),
        Err(e) => error!("USB host thread panicked: {:?}", e),
    }

    result
}

/// List USB devices and exit
async fn list_devices_mode(bridge: &HostBridge, config: &MonitorConfig, json: bool) -> Result<()> {
    let devices = host::list_devices(bridge)
        .await
        .context("Failed to receive device list")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let filter = config.camera_filter()?;
    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let marker = if CameraFilter::is_camera_class(&device) {
            "camera"
        } else if filter.admits(&device) {
            "allowed"
        } else {
            "-"
        };
        println!(
            "  [{:<7}] {:04x}:{:04x} - {} {}",
            marker,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03} Class {:02x}/{:02x}",
            device.bus_number, device.device_address, device.class, device.subclass
        );
    }

    Ok(())
}

/// Run the lifecycle controller until Ctrl+C
async fn run_monitor(config: &MonitorConfig, bridge: HostBridge, args: &Args) -> Result<()> {
    let options = config.controller_options()?;
    info!(
        "Prompt policy: {:?}, {} allow-list filter(s)",
        options.prompt_policy,
        options.filter.allow_list().len()
    );

    let controller = Arc::new(LifecycleController::new(
        Arc::new(RusbHost::new(bridge.clone())),
        Arc::new(UvcClaimTransport::new()),
        options,
    ));

    let json = args.json;
    controller.subscribe_fn(move |event: &LifecycleEvent| {
        print_event(event, json)
    });

    if args.auto_open || config.capture.auto_open {
        info!("Auto-open enabled");
        let capture = config.capture.config.clone();
        let observer = auto_open_observer(Arc::downgrade(&controller), capture);
        controller.subscribe_fn(observer);
    }

    let mut pump = tokio::spawn(host::pump_events(bridge, controller.clone()));

    info!("Press Ctrl+C to shutdown");
    let result = tokio::select! {
        received = signal::ctrl_c() => {
            match received {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            pump.abort();
            Ok(())
        }
        // The pump only ends when the host thread has exited
        _ = &mut pump => {
            error!("USB host thread stopped unexpectedly");
            Err(anyhow::anyhow!("USB host thread stopped"))
        }
    };

    controller.shutdown();
    info!("Monitor shutdown complete");
    result
}

fn print_event(event: &LifecycleEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        LifecycleEvent::PermissionDenied { device, reason } => {
            println!("{:<20} {} ({:?})", event.kind(), device, reason)
        }
        _ => println!("{:<20} {}", event.kind(), event.device()),
    }
    Ok(())
}

/// Observer that opens a capture session on every granted device
///
/// Holds a weak reference so the controller's subscriber list does not keep
/// the controller alive.
fn auto_open_observer(
    controller: Weak<LifecycleController>,
    capture: CaptureConfig,
) -> impl Fn(&LifecycleEvent) -> Result<()> + Send + Sync + 'static {
    move |event: &LifecycleEvent| {
        let LifecycleEvent::PermissionGranted { device } = event else {
            return Ok(());
        };
        let Some(controller) = controller.upgrade() else {
            return Ok(());
        };
        controller
            .open(device.id(), &capture)
            .with_context(|| format!("Auto-open of {} failed", device))
    }
}
