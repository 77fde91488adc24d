//! Async channel bridge between consumers and the USB host thread

use crate::usb_types::{ControlBlock, DeviceId, DeviceIdentity, RawDevice};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Channel capacity for both directions
const BRIDGE_CAPACITY: usize = 256;

/// Commands from the lifecycle side to the USB host thread
#[derive(Debug)]
pub enum HostCommand {
    /// Ask the OS for access to a device (fire-and-forget)
    ///
    /// The outcome comes back as one of the permission events.
    RequestPermission {
        /// Device to prompt for
        device: DeviceIdentity,
    },

    /// List all connected USB devices, cameras or not
    ListDevices {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<RawDevice>>,
    },

    /// Shutdown the host thread gracefully
    Shutdown,
}

/// Raw notifications raised by the host OS
#[derive(Debug)]
pub enum HostEvent {
    /// Device hot-plugged (or present at startup)
    Attached(RawDevice),

    /// Device unplugged
    Detached(RawDevice),

    /// User (or OS policy) granted access
    PermissionGranted {
        /// Device the grant is for
        device: DeviceIdentity,
        /// Control channel opened for the device
        channel: Box<dyn ControlBlock>,
    },

    /// User denied access
    PermissionDenied(DeviceIdentity),

    /// Prompt was dismissed or failed before the user decided
    PermissionCancelled(DeviceIdentity),

    /// Previously granted control channel was closed by the OS
    ChannelLost(DeviceIdentity),
}

impl HostEvent {
    /// Device this event refers to
    pub fn device_id(&self) -> DeviceId {
        match self {
            HostEvent::Attached(raw) | HostEvent::Detached(raw) => raw.id,
            HostEvent::PermissionGranted { device, .. }
            | HostEvent::PermissionDenied(device)
            | HostEvent::PermissionCancelled(device)
            | HostEvent::ChannelLost(device) => device.id(),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::Attached(_) => "attached",
            HostEvent::Detached(_) => "detached",
            HostEvent::PermissionGranted { .. } => "permission-granted",
            HostEvent::PermissionDenied(_) => "permission-denied",
            HostEvent::PermissionCancelled(_) => "permission-cancelled",
            HostEvent::ChannelLost(_) => "channel-lost",
        }
    }
}

/// Handle for the consumer side (async)
#[derive(Clone)]
pub struct HostBridge {
    cmd_tx: Sender<HostCommand>,
    event_rx: Receiver<HostEvent>,
}

impl HostBridge {
    /// Send a command to the host thread
    pub async fn send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command without waiting for capacity
    ///
    /// Used from synchronous code paths that must never block.
    pub fn try_send_command(&self, cmd: HostCommand) -> crate::Result<()> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Closed(_) => crate::Error::HostStopped,
            TrySendError::Full(_) => crate::Error::Channel("host command queue full".to_string()),
        })
    }

    /// Receive an event from the host thread
    pub async fn recv_event(&self) -> crate::Result<HostEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB host thread (blocking)
pub struct HostWorker {
    cmd_rx: Receiver<HostCommand>,
    event_tx: Sender<HostEvent>,
}

impl HostWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> crate::Result<HostCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<HostCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to the consumer side (blocking)
    pub fn send_event(&self, event: HostEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the consumer side dropped its event receiver
    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Create the channel bridge between consumers and the USB host thread
///
/// Returns (HostBridge for the consumer side, HostWorker for the host thread)
pub fn create_host_bridge() -> (HostBridge, HostWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (event_tx, event_rx) = bounded(BRIDGE_CAPACITY);

    (
        HostBridge { cmd_tx, event_rx },
        HostWorker { cmd_rx, event_tx },
    )
}
