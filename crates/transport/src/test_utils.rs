//! Test utilities
//!
//! A scripted in-memory driver implementing the backend traits. Transfers
//! return queued results (or succeed with the full buffer length once the
//! queue is empty), and every call is recorded in a shared state object the
//! test keeps after handing the device to the code under test.
//!
//! # Example
//!
//! ```
//! use transport::test_utils::MockDevice;
//! use transport::{DeviceHandle, UsbError};
//!
//! let device = MockDevice::builder().firmware(0x0210).build();
//! let state = device.state();
//! state.push_bulk(Err(UsbError::Timeout));
//!
//! let mut handle = DeviceHandle::new(device);
//! handle.open().unwrap();
//! assert_eq!(state.open_count(), 1);
//! ```

use crate::backend::{
    CLASS_VENDOR_SPEC, EndpointInfo, InterfaceInfo, OpenHandle, RawDescriptor, RawDevice,
    UsbBackend,
};
use crate::error::UsbError;
use crate::identity::UsbTopology;
use crate::model::{EP_IN, EP_OUT, FIRMWARE_VERSION};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type BulkHook = Box<dyn FnMut(usize) + Send>;

#[derive(Default)]
struct Inner {
    live_refs: usize,
    open_count: usize,
    close_count: usize,
    claimed: Vec<u8>,
    released: Vec<u8>,
    control_script: VecDeque<Result<usize, UsbError>>,
    bulk_script: VecDeque<Result<usize, UsbError>>,
    control_attempts: usize,
    control_timeouts: Vec<Duration>,
    bulk_attempts: usize,
    bulk_lengths: Vec<usize>,
    bulk_timeouts: Vec<Duration>,
    bulk_hook: Option<BulkHook>,
}

/// Shared record of everything a [`MockDevice`] was asked to do
#[derive(Clone, Default)]
pub struct MockState {
    inner: Arc<Mutex<Inner>>,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the state from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the result of the next control transfer attempt
    pub fn push_control(&self, result: Result<usize, UsbError>) {
        self.lock().control_script.push_back(result);
    }

    /// Queue the result of the next bulk transfer attempt
    pub fn push_bulk(&self, result: Result<usize, UsbError>) {
        self.lock().bulk_script.push_back(result);
    }

    /// Run `hook` with the attempt index after every bulk transfer
    pub fn on_bulk(&self, hook: impl FnMut(usize) + Send + 'static) {
        self.lock().bulk_hook = Some(Box::new(hook));
    }

    /// Driver references currently held on the device
    pub fn live_refs(&self) -> usize {
        self.lock().live_refs
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.lock().claimed.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.lock().released.clone()
    }

    pub fn control_attempts(&self) -> usize {
        self.lock().control_attempts
    }

    pub fn bulk_attempts(&self) -> usize {
        self.lock().bulk_attempts
    }

    /// Buffer length passed to every bulk attempt
    pub fn bulk_lengths(&self) -> Vec<usize> {
        self.lock().bulk_lengths.clone()
    }

    /// Timeout passed to every control attempt
    pub fn control_timeouts(&self) -> Vec<Duration> {
        self.lock().control_timeouts.clone()
    }

    /// Timeout passed to every bulk attempt
    pub fn bulk_timeouts(&self) -> Vec<Duration> {
        self.lock().bulk_timeouts.clone()
    }
}

/// In-memory device reference
///
/// Cloning takes another driver reference and dropping releases one, like
/// `rusb::Device`.
pub struct MockDevice {
    descriptor: RawDescriptor,
    topology: UsbTopology,
    address: u8,
    interfaces: Vec<InterfaceInfo>,
    open_error: Option<UsbError>,
    serial: Result<String, UsbError>,
    state: MockState,
}

impl MockDevice {
    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder::default()
    }

    pub fn state(&self) -> MockState {
        self.state.clone()
    }
}

impl Clone for MockDevice {
    fn clone(&self) -> Self {
        self.state.lock().live_refs += 1;
        Self {
            descriptor: self.descriptor,
            topology: self.topology.clone(),
            address: self.address,
            interfaces: self.interfaces.clone(),
            open_error: self.open_error.clone(),
            serial: self.serial.clone(),
            state: self.state.clone(),
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut inner = self.state.lock();
        inner.live_refs = inner.live_refs.saturating_sub(1);
    }
}

impl RawDevice for MockDevice {
    type Handle = MockHandle;

    fn descriptor(&self) -> RawDescriptor {
        self.descriptor
    }

    fn topology(&self) -> UsbTopology {
        self.topology.clone()
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, UsbError> {
        Ok(self.interfaces.clone())
    }

    fn open(&self) -> Result<MockHandle, UsbError> {
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        self.state.lock().open_count += 1;
        Ok(MockHandle {
            serial: self.serial.clone(),
            state: self.state.clone(),
        })
    }
}

pub struct MockHandle {
    serial: Result<String, UsbError>,
    state: MockState,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.lock().close_count += 1;
    }
}

impl OpenHandle for MockHandle {
    fn read_string(&self, _index: u8) -> Result<String, UsbError> {
        self.serial.clone()
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.state.lock().claimed.push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.state.lock().released.push(interface);
        Ok(())
    }

    fn control_transfer(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut inner = self.state.lock();
        inner.control_attempts += 1;
        inner.control_timeouts.push(timeout);
        inner
            .control_script
            .pop_front()
            .unwrap_or(Ok(data.len()))
    }

    fn bulk_transfer(
        &mut self,
        _endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let (result, attempt, hook) = {
            let mut inner = self.state.lock();
            let attempt = inner.bulk_attempts;
            inner.bulk_attempts += 1;
            inner.bulk_lengths.push(data.len());
            inner.bulk_timeouts.push(timeout);
            let result = inner
                .bulk_script
                .pop_front()
                .unwrap_or(Ok(data.len()))
                .map(|n| n.min(data.len()));
            (result, attempt, inner.bulk_hook.take())
        };

        // The hook runs unlocked so it may touch shared test state freely
        if let Some(mut hook) = hook {
            hook(attempt);
            self.state.lock().bulk_hook = Some(hook);
        }

        result
    }
}

/// Builder for [`MockDevice`]
///
/// Defaults describe a DSO-6022BE with current firmware on bus 1, port 2.
pub struct MockDeviceBuilder {
    descriptor: RawDescriptor,
    topology: UsbTopology,
    address: u8,
    interfaces: Vec<InterfaceInfo>,
    open_error: Option<UsbError>,
    serial: Result<String, UsbError>,
}

impl Default for MockDeviceBuilder {
    fn default() -> Self {
        Self {
            descriptor: RawDescriptor {
                vendor_id: 0x04B5,
                product_id: 0x6022,
                device_version: FIRMWARE_VERSION,
                serial_number_index: Some(3),
            },
            topology: UsbTopology::new(1, [2]),
            address: 5,
            interfaces: vec![InterfaceInfo {
                number: 0,
                class: CLASS_VENDOR_SPEC,
                subclass: 0,
                protocol: 0,
                endpoints: vec![
                    EndpointInfo {
                        address: EP_OUT,
                        max_packet_size: 512,
                    },
                    EndpointInfo {
                        address: EP_IN,
                        max_packet_size: 512,
                    },
                ],
            }],
            open_error: None,
            serial: Ok("SN0001".to_string()),
        }
    }
}

impl MockDeviceBuilder {
    pub fn ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.descriptor.vendor_id = vendor_id;
        self.descriptor.product_id = product_id;
        self
    }

    pub fn firmware(mut self, device_version: u16) -> Self {
        self.descriptor.device_version = device_version;
        self
    }

    pub fn topology(mut self, bus: u8, ports: impl Into<Vec<u8>>) -> Self {
        self.topology = UsbTopology::new(bus, ports);
        self
    }

    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn interfaces(mut self, interfaces: Vec<InterfaceInfo>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn open_error(mut self, err: UsbError) -> Self {
        self.open_error = Some(err);
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = Ok(serial.to_string());
        self
    }

    pub fn serial_error(mut self) -> Self {
        self.serial = Err(UsbError::Pipe);
        self
    }

    pub fn build(self) -> MockDevice {
        let state = MockState::default();
        state.lock().live_refs = 1;
        MockDevice {
            descriptor: self.descriptor,
            topology: self.topology,
            address: self.address,
            interfaces: self.interfaces,
            open_error: self.open_error,
            serial: self.serial,
            state,
        }
    }
}

/// Mutable set of plugged-in mock devices
#[derive(Clone, Default)]
pub struct MockBackend {
    devices: Arc<Mutex<Vec<MockDevice>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, device: MockDevice) {
        self.lock().push(device);
    }

    /// Remove every device at the given bus and port path
    pub fn unplug(&self, bus: u8, ports: &[u8]) {
        self.lock()
            .retain(|device| !(device.topology.bus == bus && device.topology.ports == ports));
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MockDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;

    fn devices(&self) -> Result<Vec<MockDevice>, UsbError> {
        Ok(self.lock().iter().cloned().collect())
    }
}
