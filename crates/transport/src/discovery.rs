//! Discovery cycle
//!
//! Keeps the set of supported instruments on the bus up to date. Every
//! call to [`DeviceFinder::update_device_list`] is one heartbeat: devices
//! seen again keep their [`ScopeDevice`], new ones are added, and devices
//! missing from the bus are dropped, which closes them and releases the
//! driver reference.

use crate::backend::{RawDevice, UsbBackend};
use crate::error::UsbError;
use crate::identity::DeviceIdentity;
use crate::lifecycle::ScopeDevice;
use crate::model;
use crate::transfer::TransferTiming;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Linux Foundation, i.e. root hubs
const VID_LINUX_FOUNDATION: u16 = 0x1D6B;

struct Entry<D: RawDevice> {
    device: ScopeDevice<D>,
    find_iteration: u64,
}

pub struct DeviceFinder<B: UsbBackend> {
    backend: B,
    devices: BTreeMap<DeviceIdentity, Entry<B::Device>>,
    find_iteration: u64,
    timing: TransferTiming,
}

impl<B: UsbBackend> DeviceFinder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            devices: BTreeMap::new(),
            find_iteration: 0,
            timing: TransferTiming::default(),
        }
    }

    /// Timing handed to every device found from now on
    pub fn with_timing(mut self, timing: TransferTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one discovery cycle
    ///
    /// Returns the number of devices added plus devices removed.
    pub fn update_device_list(&mut self) -> Result<usize, UsbError> {
        let raw_devices = self.backend.devices()?;
        self.find_iteration += 1;
        let mut changes = 0;

        for raw in raw_devices {
            let descriptor = raw.descriptor();
            if descriptor.vendor_id == VID_LINUX_FOUNDATION {
                continue;
            }

            let identity = DeviceIdentity::compute(
                &raw.topology(),
                descriptor.vendor_id,
                descriptor.device_version,
            );

            if let Some(entry) = self.devices.get_mut(&identity) {
                // Already tracked; the extra reference in `raw` is released here
                entry.find_iteration = self.find_iteration;
                continue;
            }

            let Some(model) = model::find_model(descriptor.vendor_id, descriptor.product_id) else {
                continue;
            };

            let device = ScopeDevice::new(model, raw).with_timing(self.timing.clone());
            info!(
                "Found {} {} ({})",
                model.name,
                identity,
                device.state()
            );
            self.devices.insert(identity, Entry {
                device,
                find_iteration: self.find_iteration,
            });
            changes += 1;
        }

        let current = self.find_iteration;
        let before = self.devices.len();
        self.devices.retain(|identity, entry| {
            let present = entry.find_iteration == current;
            if !present {
                info!("Device {} left the bus", identity);
            }
            present
        });
        changes += before - self.devices.len();

        debug!(
            "Discovery cycle {}: {} device(s), {} change(s)",
            current,
            self.devices.len(),
            changes
        );
        Ok(changes)
    }

    /// Devices currently known, ordered by identity
    pub fn devices(&self) -> impl Iterator<Item = (DeviceIdentity, &ScopeDevice<B::Device>)> {
        self.devices
            .iter()
            .map(|(identity, entry)| (*identity, &entry.device))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Hand one device over to the caller
    pub fn take_device(&mut self, identity: DeviceIdentity) -> Option<ScopeDevice<B::Device>> {
        self.devices.remove(&identity).map(|entry| entry.device)
    }
}
