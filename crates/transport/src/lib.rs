//! USB transport for Hantek-family oscilloscopes
//!
//! This crate covers everything between libusb and the instrument protocol:
//! - Stable device identity across enumeration cycles
//! - Opening a device and claiming its vendor-specific data interface
//! - Control and bulk transfers with retry on timeout
//! - Chunked or single-shot capture reads with cooperative cancellation
//! - The connection lifecycle, including automatic disconnection when a
//!   device vanishes mid-transfer
//!
//! All calls are blocking. Run transfers for a device on one dedicated
//! worker thread.

pub mod backend;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod identity;
pub mod lifecycle;
pub mod model;
pub mod rusb_backend;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;

pub use backend::{OpenHandle, RawDescriptor, RawDevice, UsbBackend};
pub use discovery::DeviceFinder;
pub use error::{ClaimError, ConnectError, OpenError, TransferError, UsbError};
pub use handle::{DeviceHandle, PacketSizes};
pub use identity::{DeviceIdentity, UsbTopology};
pub use lifecycle::{ConnectionState, DeviceEvent, ScopeDevice};
pub use model::DeviceModel;
pub use rusb_backend::{RusbBackend, RusbDevice};
pub use transfer::{Attempts, CHUNK_SIZE, ChunkingMode, StopFlag, TransferTiming};
