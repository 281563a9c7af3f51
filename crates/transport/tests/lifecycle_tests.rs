//! Connection lifecycle integration tests
//!
//! Covers firmware gating, connect/disconnect, event delivery to an async
//! consumer while transfers run on a worker thread, and discovery across
//! re-plugs.
//!
//! Run with: `cargo test -p transport --test lifecycle_tests`

use std::thread;
use std::time::Duration;
use transport::model::{DSO_6022BE, EP_IN};
use transport::test_utils::{MockBackend, MockDevice};
use transport::{
    Attempts, ConnectError, ConnectionState, DeviceEvent, DeviceFinder, DeviceIdentity,
    ScopeDevice, TransferError, UsbError,
};

#[test]
fn test_old_firmware_cannot_connect() {
    let device = MockDevice::builder()
        .ids(0x04B5, 0x6022)
        .firmware(0x0100)
        .build();
    let state = device.state();
    let mut scope = ScopeDevice::new(&DSO_6022BE, device);

    assert!(scope.needs_firmware());
    assert!(matches!(
        scope.connect(),
        Err(ConnectError::FirmwareMismatch { .. })
    ));
    assert!(!scope.is_connected());
    assert_eq!(state.open_count(), 0);
}

#[test]
fn test_firmware_at_minimum_connects() {
    let device = MockDevice::builder().firmware(0x0210).build();
    let mut scope = ScopeDevice::new(&DSO_6022BE, device);

    assert!(!scope.needs_firmware());
    assert!(scope.connect().is_ok());
    assert_eq!(scope.state(), ConnectionState::Connected);
}

#[test]
fn test_reconnect_after_device_gone() {
    let device = MockDevice::builder().build();
    let state = device.state();
    let mut scope = ScopeDevice::new(&DSO_6022BE, device);
    let events = scope.subscribe();

    scope.connect().unwrap();
    state.push_bulk(Err(UsbError::NoDevice));
    let mut data = [0u8; 64];
    assert_eq!(
        scope.bulk_transfer(EP_IN, &mut data, Attempts::Bounded(3), Duration::from_millis(10)),
        Err(TransferError::DeviceGone)
    );
    assert_eq!(scope.state(), ConnectionState::Disconnected);

    scope.connect().unwrap();
    assert!(scope.is_connected());
    assert_eq!(state.open_count(), 2);

    scope.disconnect();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_event_reaches_async_consumer() {
    let device = MockDevice::builder().serial("SCOPE42").build();
    let state = device.state();
    let mut scope = ScopeDevice::new(&DSO_6022BE, device);
    let events = scope.subscribe();
    scope.connect().unwrap();
    let identity = scope.identity();

    state.push_bulk(Err(UsbError::NoDevice));
    let worker = thread::spawn(move || {
        let mut data = vec![0u8; 1024];
        scope.bulk_transfer(EP_IN, &mut data, Attempts::Bounded(1), Duration::from_millis(10))
    });

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    assert_eq!(event, DeviceEvent::Disconnected {
        identity,
        serial_number: "SCOPE42".to_string(),
    });

    let result = worker.join().expect("worker thread");
    assert_eq!(result, Err(TransferError::DeviceGone));
}

#[test]
fn test_identity_survives_replug_into_same_port() {
    let backend = MockBackend::new();
    backend.plug(MockDevice::builder().topology(1, [3, 2]).address(9).build());
    let mut finder = DeviceFinder::new(backend.clone());
    finder.update_device_list().unwrap();
    let (first, _) = finder.devices().next().unwrap();

    backend.unplug(1, &[3, 2]);
    finder.update_device_list().unwrap();
    assert!(finder.is_empty());

    // New OS address, same physical slot
    backend.plug(MockDevice::builder().topology(1, [3, 2]).address(14).build());
    finder.update_device_list().unwrap();
    let (second, _) = finder.devices().next().unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_firmware_upload_changes_identity() {
    let backend = MockBackend::new();
    backend.plug(
        MockDevice::builder()
            .ids(0x04B4, 0x6022)
            .firmware(0x0000)
            .topology(1, [4])
            .build(),
    );
    let mut finder = DeviceFinder::new(backend.clone());
    finder.update_device_list().unwrap();
    let (bare, device) = finder.devices().next().unwrap();
    assert_eq!(device.state(), ConnectionState::NeedsFirmware);

    // Firmware uploaded: the device re-enumerates with new IDs
    backend.unplug(1, &[4]);
    backend.plug(MockDevice::builder().topology(1, [4]).build());
    assert_eq!(finder.update_device_list().unwrap(), 2);

    let (loaded, device) = finder.devices().next().unwrap();
    assert_ne!(bare, loaded);
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(loaded, DeviceIdentity::compute(&transport::UsbTopology::new(1, [4]), 0x04B5, 0x0210));
}
