//! Device handle
//!
//! Owns the open handle and the claimed-interface state of one physical
//! device. A `DeviceHandle` starts unopened; `open` followed by
//! `claim_interface` makes it ready for transfers, and `close` returns it
//! to the unopened state.

use crate::backend::{OpenHandle, RawDescriptor, RawDevice};
use crate::error::{ClaimError, OpenError};
use crate::identity::{DeviceIdentity, UsbTopology};
use crate::model::DeviceModel;
use tracing::{debug, warn};

/// Packet sizes negotiated while claiming the data interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketSizes {
    pub interface: u8,
    pub in_max_packet_size: u16,
    pub out_max_packet_size: u16,
}

pub struct DeviceHandle<D: RawDevice> {
    device: D,
    descriptor: RawDescriptor,
    topology: UsbTopology,
    identity: DeviceIdentity,
    handle: Option<D::Handle>,
    claimed_interface: Option<u8>,
    in_max_packet_size: u16,
    out_max_packet_size: u16,
    serial_number: String,
}

impl<D: RawDevice> DeviceHandle<D> {
    /// Wrap a discovered device without opening it
    pub fn new(device: D) -> Self {
        let descriptor = device.descriptor();
        let topology = device.topology();
        let identity =
            DeviceIdentity::compute(&topology, descriptor.vendor_id, descriptor.device_version);

        Self {
            device,
            descriptor,
            topology,
            identity,
            handle: None,
            claimed_interface: None,
            in_max_packet_size: 0,
            out_max_packet_size: 0,
            serial_number: String::new(),
        }
    }

    pub fn descriptor(&self) -> &RawDescriptor {
        &self.descriptor
    }

    pub fn topology(&self) -> &UsbTopology {
        &self.topology
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// `bus:address` as shown by `lsusb`
    pub fn address_string(&self) -> String {
        format!("{:03}:{:03}", self.topology.bus, self.device.address())
    }

    /// Serial number read at open time; empty if unavailable
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.claimed_interface
    }

    pub fn in_max_packet_size(&self) -> u16 {
        self.in_max_packet_size
    }

    pub fn out_max_packet_size(&self) -> u16 {
        self.out_max_packet_size
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut D::Handle> {
        self.handle.as_mut()
    }

    /// Whether the device must receive firmware before it can be used
    ///
    /// True if the reported vendor or product ID is not the expected one,
    /// or the firmware release is older than the model's minimum.
    pub fn needs_firmware(&self, model: &DeviceModel) -> bool {
        self.descriptor.vendor_id != model.vendor_id
            || self.descriptor.product_id != model.product_id
            || self.descriptor.device_version < model.firmware_version
    }

    /// Open the device
    ///
    /// Opening an already open device is a no-op. The serial number is
    /// read on a best-effort basis.
    pub fn open(&mut self) -> Result<(), OpenError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(OpenError::from)?;

        self.serial_number = self
            .descriptor
            .serial_number_index
            .and_then(|idx| match handle.read_string(idx) {
                Ok(serial) => Some(serial),
                Err(e) => {
                    debug!("Could not read serial number: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        debug!(
            "Opened device {} at {} (serial '{}')",
            self.identity,
            self.address_string(),
            self.serial_number
        );

        self.handle = Some(handle);
        Ok(())
    }

    /// Claim the first vendor-specific data interface
    ///
    /// Records the max packet size of the endpoints at `endpoint_in` and
    /// `endpoint_out`. Only one interface is ever claimed; calling this
    /// again returns the sizes already negotiated.
    pub fn claim_interface(
        &mut self,
        endpoint_in: u8,
        endpoint_out: u8,
    ) -> Result<PacketSizes, ClaimError> {
        if let Some(interface) = self.claimed_interface {
            return Ok(PacketSizes {
                interface,
                in_max_packet_size: self.in_max_packet_size,
                out_max_packet_size: self.out_max_packet_size,
            });
        }

        let handle = self.handle.as_mut().ok_or(ClaimError::NotOpen)?;

        let interfaces = self.device.interfaces()?;
        let interface = interfaces
            .iter()
            .find(|iface| iface.is_vendor_data_interface())
            .ok_or(ClaimError::NoMatchingInterface)?;

        handle.claim_interface(interface.number).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface.number, e);
            ClaimError::Usb(e)
        })?;

        self.claimed_interface = Some(interface.number);
        self.in_max_packet_size = 0;
        self.out_max_packet_size = 0;
        for endpoint in &interface.endpoints {
            if endpoint.address == endpoint_in {
                self.in_max_packet_size = endpoint.max_packet_size;
            } else if endpoint.address == endpoint_out {
                self.out_max_packet_size = endpoint.max_packet_size;
            }
        }

        debug!(
            "Claimed interface {} on device {} (in {} / out {} bytes)",
            interface.number, self.identity, self.in_max_packet_size, self.out_max_packet_size
        );

        Ok(PacketSizes {
            interface: interface.number,
            in_max_packet_size: self.in_max_packet_size,
            out_max_packet_size: self.out_max_packet_size,
        })
    }

    /// Release the claimed interface and close the handle
    ///
    /// Safe to call on a closed handle.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Some(interface) = self.claimed_interface
                && let Err(e) = handle.release_interface(interface)
            {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            drop(handle);
            debug!("Closed device {}", self.identity);
        }
        self.claimed_interface = None;
    }
}

impl<D: RawDevice> Drop for DeviceHandle<D> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CLASS_VENDOR_SPEC, EndpointInfo, InterfaceInfo};
    use crate::error::UsbError;
    use crate::model::{DSO_6022BE, EP_IN, EP_OUT};
    use crate::test_utils::MockDevice;

    fn handle_for(device: MockDevice) -> DeviceHandle<MockDevice> {
        DeviceHandle::new(device)
    }

    #[test]
    fn test_needs_firmware_boundaries() {
        let ok = handle_for(MockDevice::builder().firmware(0x0210).build());
        assert!(!ok.needs_firmware(&DSO_6022BE));

        let newer = handle_for(MockDevice::builder().firmware(0x0300).build());
        assert!(!newer.needs_firmware(&DSO_6022BE));

        let old = handle_for(MockDevice::builder().firmware(0x020F).build());
        assert!(old.needs_firmware(&DSO_6022BE));

        let bare = handle_for(MockDevice::builder().ids(0x04B4, 0x6022).build());
        assert!(bare.needs_firmware(&DSO_6022BE));

        let other_product = handle_for(MockDevice::builder().ids(0x04B5, 0x602A).build());
        assert!(other_product.needs_firmware(&DSO_6022BE));
    }

    #[test]
    fn test_open_is_idempotent() {
        let device = MockDevice::builder().serial("SN0042").build();
        let state = device.state();
        let mut handle = handle_for(device);

        handle.open().unwrap();
        handle.open().unwrap();
        assert!(handle.is_open());
        assert_eq!(state.open_count(), 1);
        assert_eq!(handle.serial_number(), "SN0042");
    }

    #[test]
    fn test_open_error_mapping() {
        let mut handle = handle_for(MockDevice::builder().open_error(UsbError::Access).build());
        assert_eq!(handle.open(), Err(OpenError::AccessDenied {
            source: UsbError::Access
        }));
        assert!(!handle.is_open());

        let mut handle = handle_for(MockDevice::builder().open_error(UsbError::Busy).build());
        assert_eq!(handle.open(), Err(OpenError::Busy {
            source: UsbError::Busy
        }));
    }

    #[test]
    fn test_serial_failure_is_not_fatal() {
        let mut handle = handle_for(MockDevice::builder().serial_error().build());
        handle.open().unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.serial_number(), "");
    }

    #[test]
    fn test_claim_records_packet_sizes() {
        let mut handle = handle_for(MockDevice::builder().build());
        handle.open().unwrap();

        let sizes = handle.claim_interface(EP_IN, EP_OUT).unwrap();
        assert_eq!(sizes.interface, 0);
        assert_eq!(sizes.in_max_packet_size, 512);
        assert_eq!(sizes.out_max_packet_size, 512);
        assert_eq!(handle.claimed_interface(), Some(0));
    }

    #[test]
    fn test_claim_picks_first_vendor_interface() {
        let interfaces = vec![
            InterfaceInfo {
                number: 0,
                class: 0x03,
                subclass: 0,
                protocol: 0,
                endpoints: Vec::new(),
            },
            InterfaceInfo {
                number: 1,
                class: CLASS_VENDOR_SPEC,
                subclass: 0,
                protocol: 0,
                endpoints: vec![
                    EndpointInfo {
                        address: EP_IN,
                        max_packet_size: 64,
                    },
                    EndpointInfo {
                        address: EP_OUT,
                        max_packet_size: 32,
                    },
                ],
            },
            InterfaceInfo {
                number: 2,
                class: CLASS_VENDOR_SPEC,
                subclass: 0,
                protocol: 0,
                endpoints: Vec::new(),
            },
        ];
        let device = MockDevice::builder().interfaces(interfaces).build();
        let state = device.state();
        let mut handle = handle_for(device);
        handle.open().unwrap();

        let sizes = handle.claim_interface(EP_IN, EP_OUT).unwrap();
        assert_eq!(sizes.interface, 1);
        assert_eq!(sizes.in_max_packet_size, 64);
        assert_eq!(sizes.out_max_packet_size, 32);
        assert_eq!(state.claimed(), vec![1]);
    }

    #[test]
    fn test_claim_without_vendor_interface() {
        let device = MockDevice::builder()
            .interfaces(vec![InterfaceInfo {
                number: 0,
                class: 0x08,
                subclass: 6,
                protocol: 0x50,
                endpoints: Vec::new(),
            }])
            .build();
        let mut handle = handle_for(device);
        handle.open().unwrap();

        assert_eq!(
            handle.claim_interface(EP_IN, EP_OUT),
            Err(ClaimError::NoMatchingInterface)
        );
        assert_eq!(handle.claimed_interface(), None);
    }

    #[test]
    fn test_claim_requires_open_handle() {
        let mut handle = handle_for(MockDevice::builder().build());
        assert_eq!(
            handle.claim_interface(EP_IN, EP_OUT),
            Err(ClaimError::NotOpen)
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let device = MockDevice::builder().build();
        let state = device.state();
        let mut handle = handle_for(device);
        handle.open().unwrap();
        handle.claim_interface(EP_IN, EP_OUT).unwrap();

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert_eq!(handle.claimed_interface(), None);
        assert_eq!(state.released(), vec![0]);
        assert_eq!(state.close_count(), 1);
    }
}
