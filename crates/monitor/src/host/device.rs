//! rusb device description and control channel

use common::{ControlBlock, DeviceId, InterfaceClass, RawDevice};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Read the descriptors of a device into a [`RawDevice`]
///
/// String descriptors need an open handle. When the device cannot be opened
/// (usually missing permission) they are left empty.
pub fn describe_device(device: &Device<Context>) -> Result<RawDevice, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let bus_number = device.bus_number();
    let device_address = device.address();

    let interfaces = match device.active_config_descriptor() {
        Ok(config) => config
            .interfaces()
            .filter_map(|interface| {
                interface.descriptors().next().map(|alt| InterfaceClass {
                    number: interface.number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                })
            })
            .collect(),
        Err(e) => {
            debug!(
                "No active configuration for {:03}/{:03}: {}",
                bus_number, device_address, e
            );
            Vec::new()
        }
    };

    let (manufacturer, product) = device
        .open()
        .map(|handle| read_strings(&handle, &descriptor))
        .unwrap_or((None, None));

    Ok(RawDevice {
        id: DeviceId::from_bus_address(bus_number, device_address),
        bus_number,
        device_address,
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        interfaces,
        manufacturer,
        product,
    })
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (manufacturer, product)
}

/// Open libusb handle delivered with a permission grant
///
/// The handle is shared with capture sessions opened on top of it; the
/// device is closed once the last clone is dropped.
pub struct RusbControlBlock {
    device_id: DeviceId,
    handle: Arc<DeviceHandle<Context>>,
}

impl RusbControlBlock {
    pub fn new(device_id: DeviceId, handle: DeviceHandle<Context>) -> Self {
        Self {
            device_id,
            handle: Arc::new(handle),
        }
    }

    pub fn handle(&self) -> Arc<DeviceHandle<Context>> {
        self.handle.clone()
    }
}

impl ControlBlock for RusbControlBlock {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn describe(&self) -> String {
        let device = self.handle.device();
        format!(
            "libusb handle {:03}/{:03}",
            device.bus_number(),
            device.address()
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for RusbControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusbControlBlock")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}
