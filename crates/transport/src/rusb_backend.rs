//! rusb implementation of the driver seam

use crate::backend::{
    EndpointInfo, InterfaceInfo, OpenHandle, RawDescriptor, RawDevice, UsbBackend, is_in,
};
use crate::error::UsbError;
use crate::identity::UsbTopology;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Enumerates devices through a private libusb context
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for RusbBackend {
    type Device = RusbDevice;

    fn devices(&self) -> Result<Vec<RusbDevice>, UsbError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut devices = Vec::with_capacity(list.len());
        for device in list.iter() {
            match RusbDevice::new(device) {
                Ok(device) => devices.push(device),
                Err(e) => debug!("Skipping device without descriptor: {}", e),
            }
        }
        Ok(devices)
    }
}

/// Reference-counted libusb device
///
/// `rusb::Device` takes a libusb reference when created or cloned and
/// releases it on drop, so a `RusbDevice` pins the device for exactly as
/// long as it lives.
pub struct RusbDevice {
    device: Device<Context>,
    descriptor: RawDescriptor,
}

impl RusbDevice {
    /// Wrap a device, reading and caching its descriptor
    pub fn new(device: Device<Context>) -> Result<Self, UsbError> {
        let desc = device.device_descriptor().map_err(map_rusb_error)?;
        let descriptor = RawDescriptor {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: version_to_bcd(desc.device_version()),
            serial_number_index: desc.serial_number_string_index(),
        };
        Ok(Self { device, descriptor })
    }
}

impl RawDevice for RusbDevice {
    type Handle = RusbHandle;

    fn descriptor(&self) -> RawDescriptor {
        self.descriptor
    }

    fn topology(&self) -> UsbTopology {
        let ports = self.device.port_numbers().unwrap_or_else(|e| {
            debug!("Could not read port path: {}", e);
            Vec::new()
        });
        UsbTopology::new(self.device.bus_number(), ports)
    }

    fn address(&self) -> u8 {
        self.device.address()
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, UsbError> {
        let config = self.device.config_descriptor(0).map_err(map_rusb_error)?;

        let interfaces = config
            .interfaces()
            .filter_map(|interface| {
                // Only the first altsetting is considered
                let desc = interface.descriptors().next()?;
                Some(InterfaceInfo {
                    number: desc.interface_number(),
                    class: desc.class_code(),
                    subclass: desc.sub_class_code(),
                    protocol: desc.protocol_code(),
                    endpoints: desc
                        .endpoint_descriptors()
                        .map(|ep| EndpointInfo {
                            address: ep.address(),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                })
            })
            .collect();

        Ok(interfaces)
    }

    fn open(&self) -> Result<RusbHandle, UsbError> {
        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;
        Ok(RusbHandle { handle })
    }
}

/// Open libusb handle; closed when dropped
pub struct RusbHandle {
    handle: DeviceHandle<Context>,
}

impl OpenHandle for RusbHandle {
    fn read_string(&self, index: u8) -> Result<String, UsbError> {
        self.handle
            .read_string_descriptor_ascii(index)
            .map(|s| s.trim().to_string())
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.handle
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let result = if is_in(request_type) {
            self.handle
                .read_control(request_type, request, value, index, data, timeout)
        } else {
            self.handle
                .write_control(request_type, request, value, index, data, timeout)
        };
        result.map_err(map_rusb_error)
    }

    fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let result = if is_in(endpoint) {
            self.handle.read_bulk(endpoint, data, timeout)
        } else {
            self.handle.write_bulk(endpoint, data, timeout)
        };
        result.map_err(map_rusb_error)
    }
}

/// Reassemble the raw bcdDevice value rusb decoded into a `Version`
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Map rusb::Error to UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
