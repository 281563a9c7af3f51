//! Transport error types

use thiserror::Error;

/// Driver-level USB error
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    #[error("Operation timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("Pipe error")]
    Pipe,
    /// Device was disconnected
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    /// Device or endpoint not found
    #[error("Entity not found")]
    NotFound,
    /// Device is busy
    #[error("Resource busy")]
    Busy,
    /// Buffer overflow
    #[error("Overflow")]
    Overflow,
    /// I/O error
    #[error("Input/Output error")]
    Io,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("Access denied (insufficient permissions)")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// Whether a transfer failing with this error may be retried
    pub fn is_timeout(&self) -> bool {
        matches!(self, UsbError::Timeout)
    }

    /// Whether this error means the device has left the bus
    pub fn is_no_device(&self) -> bool {
        matches!(self, UsbError::NoDevice)
    }
}

/// Failure to open a device handle
///
/// The driver error is kept so its wording reaches the user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("Couldn't open device: device not found: {source}")]
    NotFound { source: UsbError },

    #[error("Couldn't open device: access denied: {source}")]
    AccessDenied { source: UsbError },

    #[error("Couldn't open device: device busy: {source}")]
    Busy { source: UsbError },

    #[error("Couldn't open device: {message}")]
    Other { message: String },
}

impl From<UsbError> for OpenError {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::NotFound | UsbError::NoDevice => OpenError::NotFound { source: err },
            UsbError::Access => OpenError::AccessDenied { source: err },
            UsbError::Busy => OpenError::Busy { source: err },
            other => OpenError::Other {
                message: other.to_string(),
            },
        }
    }
}

/// Failure to claim the instrument's data interface
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClaimError {
    /// No vendor-specific interface in the configuration
    #[error("No matching vendor-specific interface")]
    NoMatchingInterface,

    /// The handle is not open
    #[error("Device is not open")]
    NotOpen,

    #[error(transparent)]
    Usb(#[from] UsbError),
}

/// Failure to bring a device into the connected state
///
/// `address` is the `bus:address` pair of the device, so that several
/// identical instruments can be told apart in an error message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Device needs firmware upload ({address})")]
    FirmwareMismatch { address: String },

    #[error("{source} ({address})")]
    Open { source: OpenError, address: String },

    #[error("{source} ({address})")]
    Claim { source: ClaimError, address: String },
}

/// Failure of a control or bulk transfer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Every permitted attempt timed out
    #[error("Transfer timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    /// The device left the bus; the lifecycle has been forced to disconnected
    #[error("Device is gone")]
    DeviceGone,

    /// No open handle
    #[error("Device is not connected")]
    NotConnected,

    #[error(transparent)]
    Usb(UsbError),
}
