//! libusb host backend
//!
//! [`spawn_host_worker`] starts the `usb-host` thread. [`RusbHost`] is the
//! [`HostSubsystem`] the controller prompts through, and [`pump_events`]
//! feeds the thread's notifications back into the controller.

pub mod device;
pub mod transport;
pub mod worker;

pub use device::{RusbControlBlock, describe_device};
pub use transport::UvcClaimTransport;
pub use worker::{HostWorkerThread, spawn_host_worker};

use crate::lifecycle::{HostSubsystem, LifecycleController};
use common::{DeviceIdentity, HostBridge, HostCommand, RawDevice};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::{debug, info};

/// Permission subsystem backed by the USB host thread
///
/// A prompt is an access-check command: the thread tries to open the device and
/// reports the result as a permission event.
pub struct RusbHost {
    bridge: HostBridge,
}

impl RusbHost {
    pub fn new(bridge: HostBridge) -> Self {
        Self { bridge }
    }
}

impl HostSubsystem for RusbHost {
    fn request_permission(&self, identity: &DeviceIdentity) -> common::Result<()> {
        self.bridge.try_send_command(HostCommand::RequestPermission {
            device: identity.clone(),
        })
    }

    fn has_permission(&self, identity: &DeviceIdentity) -> bool {
        let path = identity.node_path();
        let accessible = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .is_ok();
        debug!("Device node {} accessible: {}", path, accessible);
        accessible
    }
}

/// Forward host events to the controller until the host thread stops
pub async fn pump_events(bridge: HostBridge, controller: Arc<LifecycleController>) {
    while let Ok(event) = bridge.recv_event().await {
        controller.handle_host_event(event);
    }
    info!("Host event stream closed");
}

/// Every device the host thread currently sees, cameras or not
pub async fn list_devices(bridge: &HostBridge) -> common::Result<Vec<RawDevice>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(HostCommand::ListDevices { response: tx })
        .await?;
    rx.await
        .map_err(|e| common::Error::Channel(format!("device list: {}", e)))
}
