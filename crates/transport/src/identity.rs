//! Stable device identity
//!
//! A physical instrument is recognised across enumeration cycles by where it
//! is plugged in and what it reports, not by the address the OS hands out.
//! The identifier packs, from the most significant nibble down:
//!
//! ```text
//! bpppppppVVVVFFFF
//! ^                 bus number (4 bits)
//!  ^^^^^^^          port path as shown by `lsusb -t`, 7 x 4 bits, zero padded
//!         ^^^^      vendor ID (changes when firmware is uploaded)
//!             ^^^^  firmware version, bcdDevice (changes with a firmware update)
//! ```
//!
//! A firmware upload therefore yields a new identity.

use std::fmt;

/// Maximum depth of the port path that fits into the identifier
pub const MAX_PORT_DEPTH: usize = 7;

/// Physical position of a device in the USB tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UsbTopology {
    pub bus: u8,
    /// Port numbers from the root hub down to the device
    pub ports: Vec<u8>,
}

impl UsbTopology {
    pub fn new(bus: u8, ports: impl Into<Vec<u8>>) -> Self {
        Self {
            bus,
            ports: ports.into(),
        }
    }
}

impl fmt::Display for UsbTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bus)?;
        for (i, port) in self.ports.iter().enumerate() {
            let sep = if i == 0 { '-' } else { '.' };
            write!(f, "{}{}", sep, port)?;
        }
        Ok(())
    }
}

/// Opaque 64-bit identifier of a physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIdentity(u64);

impl DeviceIdentity {
    /// Identity of the software-only demo device
    pub const DEMO: DeviceIdentity = DeviceIdentity(0);

    /// Compute the identifier for a device
    ///
    /// Bus and port numbers are truncated to 4 bits; ports beyond
    /// [`MAX_PORT_DEPTH`] are ignored.
    pub fn compute(topology: &UsbTopology, vendor_id: u16, firmware_version: u16) -> Self {
        let mut uid = u64::from(topology.bus & 0x0F);
        for depth in 0..MAX_PORT_DEPTH {
            uid <<= 4;
            if let Some(port) = topology.ports.get(depth) {
                uid |= u64::from(port & 0x0F);
            }
        }
        uid <<= 16;
        uid |= u64::from(vendor_id);
        uid <<= 16;
        uid |= u64::from(firmware_version);
        DeviceIdentity(uid)
    }

    /// Reconstruct an identity from its raw value
    pub fn from_raw(raw: u64) -> Self {
        DeviceIdentity(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn bus(&self) -> u8 {
        (self.0 >> 60) as u8
    }

    pub fn vendor_id(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn firmware_version(&self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl std::str::FromStr for DeviceIdentity {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim_start_matches("0x").trim_start_matches("0X");
        u64::from_str_radix(hex, 16).map(DeviceIdentity)
    }
}
