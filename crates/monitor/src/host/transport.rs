//! UVC interface claiming transport
//!
//! Opens a capture session by taking the video interfaces of a granted
//! device away from the kernel driver. Streaming itself is left to the
//! consumer holding the session.

use crate::capture::{CaptureConfig, CaptureSession, CaptureTransport, TransportError};
use crate::host::device::RusbControlBlock;
use common::usb_types::class;
use common::{ControlBlock, DeviceId, DeviceIdentity};
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// Claims the Video class interfaces of a device
#[derive(Debug, Default, Clone, Copy)]
pub struct UvcClaimTransport;

impl UvcClaimTransport {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureTransport for UvcClaimTransport {
    fn open(
        &self,
        identity: &DeviceIdentity,
        channel: &dyn ControlBlock,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSession>, TransportError> {
        let block = channel
            .as_any()
            .downcast_ref::<RusbControlBlock>()
            .ok_or_else(|| {
                TransportError::new(format!("unsupported control channel: {}", channel.describe()))
            })?;

        let handle = block.handle();
        let config_descriptor = handle
            .device()
            .active_config_descriptor()
            .map_err(|e| TransportError::new(format!("failed to get config descriptor: {}", e)))?;

        let video_interfaces: Vec<u8> = config_descriptor
            .interfaces()
            .filter(|interface| {
                interface
                    .descriptors()
                    .any(|alt| alt.class_code() == class::VIDEO)
            })
            .map(|interface| interface.number())
            .collect();

        if video_interfaces.is_empty() {
            return Err(TransportError::new("device has no video interfaces"));
        }

        let mut session = UvcSession {
            device_id: identity.id(),
            handle,
            claimed: Vec::new(),
            detached: Vec::new(),
            width: config.preview_width,
            height: config.preview_height,
        };

        for interface in video_interfaces {
            session.claim(interface)?;
        }

        Ok(Box::new(session))
    }
}

/// Video interfaces claimed on one device
struct UvcSession {
    device_id: DeviceId,
    handle: Arc<DeviceHandle<Context>>,
    claimed: Vec<u8>,
    /// Interfaces whose kernel driver we detached
    detached: Vec<u8>,
    width: u32,
    height: u32,
}

impl UvcSession {
    fn claim(&mut self, interface: u8) -> Result<(), TransportError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on device {}",
                    interface, self.device_id
                );
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        // A failed claim leaves the session partially claimed; dropping it
        // releases what was taken so far
        self.handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            TransportError::new(format!("failed to claim interface {}: {}", interface, e))
        })?;

        debug!("Claimed interface {} on device {}", interface, self.device_id);
        self.claimed.push(interface);
        Ok(())
    }

    fn release(&mut self) {
        for interface in self.claimed.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }

        for interface in self.detached.drain(..) {
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!(
                    "Reattached kernel driver to interface {} on device {}",
                    interface, self.device_id
                ),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }
    }
}

impl CaptureSession for UvcSession {
    fn describe(&self) -> String {
        format!(
            "uvc session ({} interfaces, {}x{})",
            self.claimed.len(),
            self.width,
            self.height
        )
    }

    fn close(mut self: Box<Self>) {
        self.release();
    }
}

impl Drop for UvcSession {
    fn drop(&mut self) {
        self.release();
    }
}
