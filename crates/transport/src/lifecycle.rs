//! Connection lifecycle
//!
//! A [`ScopeDevice`] is the single owner of one instrument's
//! [`DeviceHandle`]. It decides whether the instrument can be used at all
//! (firmware check), connects and disconnects it, and tells subscribers when
//! the connection is lost.

use crate::backend::RawDevice;
use crate::error::ConnectError;
use crate::handle::DeviceHandle;
use crate::identity::{DeviceIdentity, UsbTopology};
use crate::model::{self, DeviceModel};
use crate::transfer::{StopFlag, TransferTiming};
use async_channel::{Receiver, Sender, TrySendError};
use std::fmt;
use tracing::{debug, info, warn};

/// Capacity of each subscriber's event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reported IDs or firmware do not match the model; unusable until the
    /// device re-enumerates with firmware loaded
    NeedsFirmware,
    Disconnected,
    Connected,
    /// Software-only stand-in; always connected, never does I/O
    Demo,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::NeedsFirmware => "needs firmware",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Demo => "demo",
        };
        f.write_str(text)
    }
}

/// Notification sent to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device left the connected state, explicitly or because it
    /// vanished during a transfer
    Disconnected {
        identity: DeviceIdentity,
        serial_number: String,
    },
}

pub struct ScopeDevice<D: RawDevice> {
    model: &'static DeviceModel,
    /// `None` for the demo device
    handle: Option<DeviceHandle<D>>,
    state: ConnectionState,
    timing: TransferTiming,
    stop: StopFlag,
    subscribers: Vec<Sender<DeviceEvent>>,
}

impl<D: RawDevice> ScopeDevice<D> {
    /// Take ownership of a discovered device
    pub fn new(model: &'static DeviceModel, device: D) -> Self {
        let handle = DeviceHandle::new(device);
        let state = if handle.needs_firmware(model) {
            ConnectionState::NeedsFirmware
        } else {
            ConnectionState::Disconnected
        };

        debug!(
            "Tracking {} {} at {} ({})",
            model.name,
            handle.identity(),
            handle.topology(),
            state
        );

        Self {
            model,
            handle: Some(handle),
            state,
            timing: TransferTiming::default(),
            stop: StopFlag::new(),
            subscribers: Vec::new(),
        }
    }

    /// Software-only device for running without hardware
    pub fn demo() -> Self {
        Self {
            model: &model::DEMO,
            handle: None,
            state: ConnectionState::Demo,
            timing: TransferTiming::default(),
            stop: StopFlag::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn with_timing(mut self, timing: TransferTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn model(&self) -> &'static DeviceModel {
        self.model
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn timing(&self) -> &TransferTiming {
        &self.timing
    }

    pub fn is_demo(&self) -> bool {
        self.state == ConnectionState::Demo
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.handle
            .as_ref()
            .map_or(DeviceIdentity::DEMO, DeviceHandle::identity)
    }

    pub fn topology(&self) -> Option<&UsbTopology> {
        self.handle.as_ref().map(DeviceHandle::topology)
    }

    /// `bus:address`, or "demo" without hardware
    pub fn address_string(&self) -> String {
        self.handle
            .as_ref()
            .map_or_else(|| "demo".to_string(), DeviceHandle::address_string)
    }

    pub fn serial_number(&self) -> &str {
        self.handle.as_ref().map_or("", DeviceHandle::serial_number)
    }

    pub fn in_max_packet_size(&self) -> u16 {
        self.handle
            .as_ref()
            .map_or(0, DeviceHandle::in_max_packet_size)
    }

    pub fn out_max_packet_size(&self) -> u16 {
        self.handle
            .as_ref()
            .map_or(0, DeviceHandle::out_max_packet_size)
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.handle.as_ref().and_then(DeviceHandle::claimed_interface)
    }

    /// Shared stop flag consulted by [`ScopeDevice::bulk_read_multi`]
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn needs_firmware(&self) -> bool {
        self.state == ConnectionState::NeedsFirmware
    }

    pub fn is_connected(&self) -> bool {
        match self.state {
            ConnectionState::Demo => true,
            ConnectionState::Connected => self.handle.as_ref().is_some_and(DeviceHandle::is_open),
            _ => false,
        }
    }

    /// Register for lifecycle events
    pub fn subscribe(&mut self) -> Receiver<DeviceEvent> {
        let (tx, rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Open the device and claim its data interface
    ///
    /// A no-op if already connected. On failure the device is left
    /// disconnected with its handle closed.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let address = handle.address_string();

        if self.state == ConnectionState::NeedsFirmware {
            warn!("Device {} at {} needs firmware", handle.identity(), address);
            return Err(ConnectError::FirmwareMismatch { address });
        }

        if let Err(source) = handle.open() {
            warn!("Failed to open device at {}: {}", address, source);
            self.state = ConnectionState::Disconnected;
            return Err(ConnectError::Open { source, address });
        }

        if let Err(source) = handle.claim_interface(self.model.endpoint_in, self.model.endpoint_out)
        {
            warn!("Failed to claim interface at {}: {}", address, source);
            handle.close();
            self.state = ConnectionState::Disconnected;
            return Err(ConnectError::Claim { source, address });
        }

        self.state = ConnectionState::Connected;
        info!(
            "Connected to {} {} at {} (serial '{}')",
            self.model.name,
            handle.identity(),
            address,
            handle.serial_number()
        );
        Ok(())
    }

    /// Close the device
    ///
    /// Always succeeds and may be called repeatedly. Subscribers are told
    /// once per transition out of the connected state.
    pub fn disconnect(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        handle.close();

        let was_connected = self.state == ConnectionState::Connected;
        if self.state != ConnectionState::NeedsFirmware {
            self.state = ConnectionState::Disconnected;
        }

        if was_connected {
            info!("Disconnected from {} {}", self.model.name, self.identity());
            let event = DeviceEvent::Disconnected {
                identity: self.identity(),
                serial_number: self.serial_number().to_string(),
            };
            self.notify(event);
        }
    }

    pub(crate) fn open_handle(&mut self) -> Option<&mut D::Handle> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.handle.as_mut().and_then(DeviceHandle::handle_mut)
    }

    fn notify(&mut self, event: DeviceEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event subscriber is not keeping up, dropping {:?}", event);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

impl<D: RawDevice> Drop for ScopeDevice<D> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClaimError, OpenError, UsbError};
    use crate::model::DSO_6022BE;
    use crate::test_utils::MockDevice;

    #[test]
    fn test_initial_state() {
        let ready = ScopeDevice::new(&DSO_6022BE, MockDevice::builder().build());
        assert_eq!(ready.state(), ConnectionState::Disconnected);
        assert!(!ready.is_connected());

        let bare = ScopeDevice::new(
            &DSO_6022BE,
            MockDevice::builder().ids(0x04B4, 0x6022).firmware(0).build(),
        );
        assert_eq!(bare.state(), ConnectionState::NeedsFirmware);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let device = MockDevice::builder().build();
        let state = device.state();
        let mut scope = ScopeDevice::new(&DSO_6022BE, device);
        let events = scope.subscribe();

        scope.connect().unwrap();
        assert!(scope.is_connected());
        assert_eq!(scope.state(), ConnectionState::Connected);
        assert_eq!(scope.in_max_packet_size(), 512);
        assert_eq!(scope.serial_number(), "SN0001");

        // Second connect is a no-op
        scope.connect().unwrap();
        assert_eq!(state.open_count(), 1);

        scope.disconnect();
        assert!(!scope.is_connected());
        assert_eq!(scope.claimed_interface(), None);
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::Disconnected {
            identity: scope.identity(),
            serial_number: "SN0001".to_string(),
        });

        // Repeated disconnect does not notify again
        scope.disconnect();
        assert!(events.try_recv().is_err());
        assert_eq!(state.close_count(), 1);
    }

    #[test]
    fn test_firmware_mismatch() {
        let device = MockDevice::builder().firmware(0x0100).build();
        let state = device.state();
        let mut scope = ScopeDevice::new(&DSO_6022BE, device);

        assert!(scope.needs_firmware());
        assert!(matches!(
            scope.connect(),
            Err(ConnectError::FirmwareMismatch { .. })
        ));
        assert_eq!(state.open_count(), 0);
        assert_eq!(scope.state(), ConnectionState::NeedsFirmware);
    }

    #[test]
    fn test_open_failure_carries_address() {
        let device = MockDevice::builder()
            .topology(3, [1])
            .address(17)
            .open_error(UsbError::Access)
            .build();
        let mut scope = ScopeDevice::new(&DSO_6022BE, device);

        let err = scope.connect().unwrap_err();
        assert_eq!(err, ConnectError::Open {
            source: OpenError::AccessDenied {
                source: UsbError::Access
            },
            address: "003:017".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("003:017"));
        assert!(msg.contains("Access denied (insufficient permissions)"));
        assert_eq!(scope.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_claim_failure_closes_handle() {
        let device = MockDevice::builder().interfaces(Vec::new()).build();
        let state = device.state();
        let mut scope = ScopeDevice::new(&DSO_6022BE, device);

        assert!(matches!(
            scope.connect(),
            Err(ConnectError::Claim {
                source: ClaimError::NoMatchingInterface,
                ..
            })
        ));
        assert!(!scope.is_connected());
        assert_eq!(state.close_count(), 1);
    }

    #[test]
    fn test_demo_device() {
        let mut demo: ScopeDevice<MockDevice> = ScopeDevice::demo();
        let events = demo.subscribe();
        assert!(demo.is_connected());
        assert!(demo.connect().is_ok());
        demo.disconnect();
        assert!(demo.is_connected());
        assert_eq!(demo.identity(), DeviceIdentity::DEMO);
        assert_eq!(demo.address_string(), "demo");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_drop_releases_device_reference() {
        let device = MockDevice::builder().build();
        let state = device.state();
        let mut scope = ScopeDevice::new(&DSO_6022BE, device);
        let events = scope.subscribe();
        scope.connect().unwrap();
        assert_eq!(state.live_refs(), 1);

        drop(scope);
        assert_eq!(state.live_refs(), 0);
        assert_eq!(state.close_count(), 1);
        assert!(matches!(
            events.try_recv(),
            Ok(DeviceEvent::Disconnected { .. })
        ));
    }

    #[test]
    fn test_closed_subscriber_is_pruned() {
        let mut scope = ScopeDevice::new(&DSO_6022BE, MockDevice::builder().build());
        drop(scope.subscribe());
        let live = scope.subscribe();

        scope.connect().unwrap();
        scope.disconnect();
        assert!(live.try_recv().is_ok());
        assert_eq!(scope.subscribers.len(), 1);
    }
}
