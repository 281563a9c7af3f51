//! Driver seam
//!
//! The transport never talks to libusb directly. It goes through these
//! traits so the same lifecycle and transfer code runs against rusb in
//! production and against the scripted driver in [`crate::test_utils`].

use crate::error::UsbError;
use crate::identity::UsbTopology;
use std::time::Duration;

/// Interface class of the instrument's data interface
pub const CLASS_VENDOR_SPEC: u8 = 0xFF;

/// Device descriptor fields read before any driver interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice, the firmware release number
    pub device_version: u16,
    pub serial_number_index: Option<u8>,
}

/// One endpoint of an interface's first altsetting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
}

/// First altsetting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    /// Vendor-specific class with zero subclass and protocol
    pub fn is_vendor_data_interface(&self) -> bool {
        self.class == CLASS_VENDOR_SPEC && self.subclass == 0 && self.protocol == 0
    }
}

/// Source of raw device references for one discovery cycle
pub trait UsbBackend {
    type Device: RawDevice;

    fn devices(&self) -> Result<Vec<Self::Device>, UsbError>;
}

/// Reference to one physical device
///
/// Holding a value keeps the driver's reference on the device alive;
/// dropping it releases that reference exactly once.
pub trait RawDevice: Send {
    type Handle: OpenHandle;

    fn descriptor(&self) -> RawDescriptor;

    fn topology(&self) -> UsbTopology;

    /// OS-assigned address on the bus
    fn address(&self) -> u8;

    /// First altsetting of every interface in configuration 0
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, UsbError>;

    fn open(&self) -> Result<Self::Handle, UsbError>;
}

/// An open device handle
pub trait OpenHandle: Send {
    fn read_string(&self, index: u8) -> Result<String, UsbError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    /// Direction is taken from bit 7 of `request_type`; for IN transfers
    /// `data` receives the response.
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Direction is taken from bit 7 of `endpoint`.
    fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;
}

/// Whether an endpoint address or request type denotes device-to-host
pub fn is_in(direction_bits: u8) -> bool {
    (direction_bits & 0x80) != 0
}
