//! Lifecycle error types

use common::DeviceId;
use thiserror::Error;

/// Errors surfaced to callers of the lifecycle core
///
/// None of these are fatal. Expected races (late permission outcomes,
/// detach of an unknown device, duplicate attach) are absorbed by the
/// controller and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Device is not (or no longer) registered
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Open attempted without a permission grant
    #[error("Permission not granted for device {0}")]
    NotPermitted(DeviceId),

    /// Device already has an open capture session
    #[error("Device {0} is already open")]
    AlreadyOpen(DeviceId),

    /// Capture transport refused to open the device
    #[error("Transport error on device {device}: {message}")]
    Transport { device: DeviceId, message: String },
}

/// Type alias for lifecycle results
pub type Result<T> = std::result::Result<T, LifecycleError>;
