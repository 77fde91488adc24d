//! Common utilities for uvc-monitor
//!
//! This crate provides the pieces shared between the lifecycle core and the
//! host backends: device identity types, the async channel bridge for the
//! USB host thread, error handling and logging setup.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{HostBridge, HostCommand, HostEvent, HostWorker, create_host_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{ControlBlock, DeviceId, DeviceIdentity, InterfaceClass, RawDevice};
