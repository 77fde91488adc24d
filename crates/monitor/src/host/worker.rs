//! USB host thread
//!
//! Dedicated thread owning the libusb context. It runs the
//! `handle_events()` loop, turns hot-plug callbacks into [`HostEvent`]s and
//! answers permission access checks. It talks to the async side only through
//! the [`HostWorker`] channel pair.

use crate::host::device::{RusbControlBlock, describe_device};
use common::{DeviceIdentity, HostCommand, HostEvent, HostWorker, RawDevice};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// libusb event timeout per loop iteration
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Rescan period when the platform has no hot-plug support
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Hot-plug notification queued by the libusb callback, keyed by (bus, address)
enum PlugEvent {
    Arrived(u8, u8),
    Left(u8, u8),
}

/// USB host thread state
pub struct HostWorkerThread {
    context: Context,
    worker: HostWorker,
    /// Connected devices by (bus, address)
    devices: HashMap<(u8, u8), (Device<Context>, RawDevice)>,
    plug_tx: async_channel::Sender<PlugEvent>,
    plug_rx: async_channel::Receiver<PlugEvent>,
    registration: Option<Registration<Context>>,
    last_rescan: Instant,
}

impl HostWorkerThread {
    /// Create the libusb context, report present devices and register hot-plug
    pub fn new(worker: HostWorker) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (plug_tx, plug_rx) = async_channel::unbounded();

        let mut thread = Self {
            context,
            worker,
            devices: HashMap::new(),
            plug_tx,
            plug_rx,
            registration: None,
            last_rescan: Instant::now(),
        };

        thread.enumerate_devices()?;
        thread.register_hotplug()?;

        info!(
            "USB host initialized with {} devices",
            thread.devices.len()
        );
        Ok(thread)
    }

    fn enumerate_devices(&mut self) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;
        for device in devices.iter() {
            self.device_arrived(device);
        }
        debug!("Enumerated {} devices", self.devices.len());
        Ok(())
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        if !rusb::has_hotplug() {
            warn!(
                "Hot-plug not supported, rescanning every {:?}",
                RESCAN_INTERVAL
            );
            return Ok(());
        }

        let callback = HotplugCallback {
            plug_tx: self.plug_tx.clone(),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;

        self.registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Run until a Shutdown command arrives or the consumer side goes away
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB host thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(HostCommand::Shutdown) => {
                    info!("USB host thread shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            while let Ok(event) = self.plug_rx.try_recv() {
                match event {
                    PlugEvent::Arrived(bus, address) => self.lookup_arrived(bus, address),
                    PlugEvent::Left(bus, address) => self.device_left(bus, address),
                }
            }

            if self.registration.is_none() && self.last_rescan.elapsed() >= RESCAN_INTERVAL {
                self.rescan();
            }

            if self.worker.is_closed() {
                info!("Event receiver dropped, stopping USB host thread");
                break;
            }
        }

        self.registration = None;
        info!("USB host thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: HostCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if result.is_err() {
            error!("Panic in USB host command handler");
        }
    }

    fn handle_command_inner(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::RequestPermission { device } => {
                let event = self.check_access(device);
                self.emit(event);
            }

            HostCommand::ListDevices { response } => {
                let mut devices: Vec<RawDevice> =
                    self.devices.values().map(|(_, raw)| raw.clone()).collect();
                devices.sort_by_key(|raw| (raw.bus_number, raw.device_address));
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            // Handled in the main loop
            HostCommand::Shutdown => {}
        }
    }

    /// Try to open the device; the outcome is the permission decision
    fn check_access(&self, identity: DeviceIdentity) -> HostEvent {
        let key = (identity.bus_number(), identity.device_address());
        let Some((device, _)) = self.devices.get(&key) else {
            debug!("Access check for {} which is gone", identity);
            return HostEvent::PermissionCancelled(identity);
        };

        match device.open() {
            Ok(handle) => {
                debug!("Opened {} for permission grant", identity);
                HostEvent::PermissionGranted {
                    channel: Box::new(RusbControlBlock::new(identity.id(), handle)),
                    device: identity,
                }
            }
            Err(rusb::Error::Access) => {
                info!("Access to {} denied by the OS", identity);
                HostEvent::PermissionDenied(identity)
            }
            Err(e) => {
                warn!("Failed to open {}: {}", identity, e);
                HostEvent::PermissionCancelled(identity)
            }
        }
    }

    /// Resolve a hot-plugged (bus, address) against the current device list
    fn lookup_arrived(&mut self, bus: u8, address: u8) {
        let found = self.context.devices().map(|list| {
            list.iter()
                .find(|d| d.bus_number() == bus && d.address() == address)
        });

        match found {
            Ok(Some(device)) => self.device_arrived(device),
            Ok(None) => debug!("Device {:03}/{:03} gone before lookup", bus, address),
            Err(e) => warn!("Failed to list USB devices: {}", e),
        }
    }

    fn device_arrived(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());
        if self.devices.contains_key(&key) {
            debug!("Device {:03}/{:03} already tracked", key.0, key.1);
            return;
        }

        match describe_device(&device) {
            Ok(raw) => {
                debug!(
                    "Device arrived: {:04x}:{:04x} at {}",
                    raw.vendor_id,
                    raw.product_id,
                    raw.node_path()
                );
                self.devices.insert(key, (device, raw.clone()));
                self.emit(HostEvent::Attached(raw));
            }
            Err(e) => warn!(
                "Failed to read descriptors of {:03}/{:03}: {}",
                key.0, key.1, e
            ),
        }
    }

    fn device_left(&mut self, bus: u8, address: u8) {
        match self.devices.remove(&(bus, address)) {
            Some((_, raw)) => {
                debug!("Device left: {}", raw.node_path());
                self.emit(HostEvent::Detached(raw));
            }
            None => debug!("Untracked device {:03}/{:03} left", bus, address),
        }
    }

    /// Diff the current bus against the tracked devices
    fn rescan(&mut self) {
        self.last_rescan = Instant::now();
        let present = match self.context.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                return;
            }
        };

        let mut seen = HashSet::new();
        for device in present.iter() {
            seen.insert((device.bus_number(), device.address()));
            self.device_arrived(device);
        }

        let gone: Vec<(u8, u8)> = self
            .devices
            .keys()
            .filter(|key| !seen.contains(*key))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.device_left(bus, address);
        }
    }

    fn emit(&self, event: HostEvent) {
        let kind = event.kind();
        let device = event.device_id();
        if let Err(e) = self.worker.send_event(event) {
            warn!("Dropping {} event for device {}: {}", kind, device, e);
        }
    }
}

/// Hot-plug callback
///
/// libusb runs it inside `handle_events()` on the host thread. It only
/// queues the bus position; the thread loop does the actual bookkeeping.
struct HotplugCallback {
    plug_tx: async_channel::Sender<PlugEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self
            .plug_tx
            .try_send(PlugEvent::Arrived(device.bus_number(), device.address()));
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self
            .plug_tx
            .try_send(PlugEvent::Left(device.bus_number(), device.address()));
    }
}

/// Spawn the USB host thread
///
/// The thread runs until a Shutdown command is received, the event receiver
/// is dropped, or libusb initialization fails.
pub fn spawn_host_worker(
    worker: HostWorker,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-host".to_string())
        .spawn(move || {
            let thread = HostWorkerThread::new(worker)?;
            thread.run()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_host_bridge;

    #[test]
    fn test_host_worker_creation() {
        let (_bridge, worker) = create_host_bridge();

        // libusb may be unavailable in the test environment
        match HostWorkerThread::new(worker) {
            Ok(thread) => {
                for (_, raw) in thread.devices.values() {
                    assert_eq!(
                        raw.id,
                        common::DeviceId::from_bus_address(raw.bus_number, raw.device_address)
                    );
                }
            }
            Err(e) => eprintln!("USB host creation failed (expected without libusb): {}", e),
        }
    }
}
