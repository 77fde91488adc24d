//! USB device identity types
//!
//! [`RawDevice`] is what a host backend reports on hot-plug. The lifecycle
//! core turns it into a [`DeviceIdentity`], the stable key used by the
//! registry, the permission gate and every lifecycle event.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

/// USB class codes used for camera detection
pub mod class {
    /// Class is defined per interface
    pub const PER_INTERFACE: u8 = 0x00;
    /// Video (UVC)
    pub const VIDEO: u8 = 0x0E;
    /// Miscellaneous, used by composite devices with an Interface Association Descriptor
    pub const MISCELLANEOUS: u8 = 0xEF;
    /// Mass storage
    pub const MASS_STORAGE: u8 = 0x08;
    /// Human interface device
    pub const HID: u8 = 0x03;
    /// Hub
    pub const HUB: u8 = 0x09;

    /// Video subclass: VideoControl interface
    pub const VIDEO_CONTROL: u8 = 0x01;
    /// Video subclass: VideoStreaming interface
    pub const VIDEO_STREAMING: u8 = 0x02;

    /// Miscellaneous subclass "common class"
    pub const MISC_COMMON: u8 = 0x02;
    /// Miscellaneous protocol "interface association descriptor"
    pub const MISC_IAD: u8 = 0x01;
}

/// Opaque platform device identifier
///
/// Stable for the lifetime of one physical connection. A device that is
/// unplugged and plugged back in may receive a different id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Derive an id from the bus topology, as libusb hosts do
    pub fn from_bus_address(bus_number: u8, device_address: u8) -> Self {
        DeviceId(((bus_number as u32) << 8) | device_address as u32)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Class triple of a single interface in the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceClass {
    /// bInterfaceNumber
    pub number: u8,
    /// bInterfaceClass
    pub class: u8,
    /// bInterfaceSubClass
    pub subclass: u8,
}

/// Raw device information as delivered by a host backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    /// Platform device id
    pub id: DeviceId,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// bDeviceClass
    pub class: u8,
    /// bDeviceSubClass
    pub subclass: u8,
    /// bDeviceProtocol
    pub protocol: u8,
    /// Interfaces of the active configuration (may be empty if unreadable)
    pub interfaces: Vec<InterfaceClass>,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
}

impl RawDevice {
    /// Device node path, e.g. `/dev/bus/usb/001/004`
    pub fn node_path(&self) -> String {
        node_path(self.bus_number, self.device_address)
    }

    /// Whether any interface reports the given class
    pub fn has_interface_class(&self, class: u8) -> bool {
        self.interfaces.iter().any(|i| i.class == class)
    }
}

fn node_path(bus_number: u8, device_address: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus_number, device_address)
}

/// Stable identity of a physical device
///
/// Equality and hashing consider the device id only, so two identities built
/// from different snapshots of the same connected device compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    id: DeviceId,
    vendor_id: u16,
    product_id: u16,
    name: String,
    bus_number: u8,
    device_address: u8,
}

impl DeviceIdentity {
    /// Build an identity from a raw hot-plug notification
    pub fn from_raw(raw: &RawDevice) -> Self {
        let name = match (&raw.manufacturer, &raw.product) {
            (_, Some(product)) if !product.trim().is_empty() => product.trim().to_string(),
            (Some(manufacturer), _) if !manufacturer.trim().is_empty() => {
                manufacturer.trim().to_string()
            }
            _ => raw.node_path(),
        };

        Self {
            id: raw.id,
            vendor_id: raw.vendor_id,
            product_id: raw.product_id,
            name,
            bus_number: raw.bus_number,
            device_address: raw.device_address,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Human-readable name (product string, else manufacturer, else node path)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    pub fn node_path(&self) -> String {
        node_path(self.bus_number, self.device_address)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x}) @ {}",
            self.name,
            self.vendor_id,
            self.product_id,
            self.node_path()
        )
    }
}

/// Control channel to a device, handed over by the host when permission is granted
///
/// The lifecycle core never looks inside; it stores the block on the registry
/// record and passes it to the capture transport. Dropping the block releases
/// the underlying OS resource.
pub trait ControlBlock: Send + fmt::Debug {
    /// Device this channel belongs to
    fn device_id(&self) -> DeviceId;

    /// Short description for logs
    fn describe(&self) -> String;

    /// Downcast support for transports that know the concrete backend
    fn as_any(&self) -> &dyn Any;
}
