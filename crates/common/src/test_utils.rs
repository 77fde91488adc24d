//! Test utilities for uvc-monitor
//!
//! Provides mock implementations and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_raw_camera;
//!
//! # fn main() {
//! let camera = mock_raw_camera(1, 0x046d, 0x0825);
//! assert_eq!(camera.vendor_id, 0x046d);
//! # }
//! ```

use crate::usb_types::{ControlBlock, DeviceId, InterfaceClass, RawDevice, class};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock RawDevice with no interfaces and the given device class
pub fn mock_raw_device(id: u32, vendor_id: u16, product_id: u16, device_class: u8) -> RawDevice {
    RawDevice {
        id: DeviceId(id),
        bus_number: 1,
        device_address: (id % 128) as u8,
        vendor_id,
        product_id,
        class: device_class,
        subclass: 0x00,
        protocol: 0x00,
        interfaces: Vec::new(),
        manufacturer: Some(format!("Test Manufacturer {}", id)),
        product: Some(format!("Test Product {}", id)),
    }
}

/// Create a mock UVC camera
///
/// Class is defined per interface, with one VideoControl and one
/// VideoStreaming interface.
pub fn mock_raw_camera(id: u32, vendor_id: u16, product_id: u16) -> RawDevice {
    let mut raw = mock_raw_device(id, vendor_id, product_id, class::PER_INTERFACE);
    raw.interfaces = vec![
        InterfaceClass {
            number: 0,
            class: class::VIDEO,
            subclass: class::VIDEO_CONTROL,
        },
        InterfaceClass {
            number: 1,
            class: class::VIDEO,
            subclass: class::VIDEO_STREAMING,
        },
    ];
    raw.product = Some(format!("Test Camera {}", id));
    raw
}

/// Create a mock composite camera (misc class with IAD, video plus audio)
pub fn mock_raw_composite_camera(id: u32, vendor_id: u16, product_id: u16) -> RawDevice {
    let mut raw = mock_raw_camera(id, vendor_id, product_id);
    raw.class = class::MISCELLANEOUS;
    raw.subclass = class::MISC_COMMON;
    raw.protocol = class::MISC_IAD;
    raw.interfaces.push(InterfaceClass {
        number: 2,
        class: 0x01,
        subclass: 0x01,
    });
    raw
}

/// Create a mock mass storage device
pub fn mock_raw_mass_storage(id: u32) -> RawDevice {
    let mut raw = mock_raw_device(id, 0x0781, 0x5567, class::PER_INTERFACE);
    raw.interfaces = vec![InterfaceClass {
        number: 0,
        class: class::MASS_STORAGE,
        subclass: 0x06,
    }];
    raw
}

/// Control block that records whether it has been released
#[derive(Debug)]
pub struct MockControlBlock {
    device_id: DeviceId,
    released: Arc<AtomicBool>,
}

impl MockControlBlock {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that flips to true when the block is dropped
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl ControlBlock for MockControlBlock {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn describe(&self) -> String {
        format!("mock control block for {}", self.device_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MockControlBlock {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Run a future with timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn my_test() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
///     assert_eq!(result.unwrap(), 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test operation times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
