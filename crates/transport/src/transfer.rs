//! USB transfer execution
//!
//! Control and bulk transfers with bounded retry on timeout, and the
//! chunked/bulk read used by capture code. All calls block the invoking
//! thread for up to their timeout; a device must only ever be driven by one
//! worker thread at a time.
//!
//! Retry policy: a timeout is retried until the attempt budget is spent;
//! any other error aborts at once. A `NoDevice` error forces the owning
//! [`ScopeDevice`] into the disconnected state before it is returned.

use crate::backend::{OpenHandle, RawDevice};
use crate::error::{TransferError, UsbError};
use crate::lifecycle::ScopeDevice;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bytes per chunk in chunked mode; 100 chunks cover one screen width
/// of samples at the reference depth
pub const CHUNK_SIZE: usize = 512 * 78;

/// Packet size assumed when the IN endpoint reported none
const FALLBACK_PACKET_SIZE: u64 = 512;

/// How many times a transfer may be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AttemptsRepr", into = "AttemptsRepr")]
pub enum Attempts {
    /// At most this many attempts; zero is treated as one
    Bounded(u32),
    /// Retry timeouts forever
    Unbounded,
}

impl Attempts {
    /// Whether attempt number `made + 1` is still permitted
    fn permits(&self, made: u32) -> bool {
        match self {
            Attempts::Bounded(max) => made < (*max).max(1),
            Attempts::Unbounded => true,
        }
    }
}

impl fmt::Display for Attempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempts::Bounded(n) => write!(f, "{}", n),
            Attempts::Unbounded => write!(f, "unbounded"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AttemptsRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<AttemptsRepr> for Attempts {
    type Error = String;

    fn try_from(repr: AttemptsRepr) -> Result<Self, Self::Error> {
        match repr {
            AttemptsRepr::Count(n) => Ok(Attempts::Bounded(n)),
            AttemptsRepr::Keyword(s) if s.eq_ignore_ascii_case("unbounded") => {
                Ok(Attempts::Unbounded)
            }
            AttemptsRepr::Keyword(s) => Err(format!(
                "invalid attempts '{}', expected a number or \"unbounded\"",
                s
            )),
        }
    }
}

impl From<Attempts> for AttemptsRepr {
    fn from(attempts: Attempts) -> Self {
        match attempts {
            Attempts::Bounded(n) => AttemptsRepr::Count(n),
            Attempts::Unbounded => AttemptsRepr::Keyword("unbounded".to_string()),
        }
    }
}

/// Whether a read is split into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMode {
    /// Fixed-size chunks, cancellable between chunks (slow captures)
    Chunked,
    /// One transfer for the whole length (fast captures)
    Bulk,
}

impl ChunkingMode {
    pub fn from_small_blocks(capture_small_blocks: bool) -> Self {
        if capture_small_blocks {
            ChunkingMode::Chunked
        } else {
            ChunkingMode::Bulk
        }
    }
}

/// Shared "stop requested" flag
///
/// Any thread may request a stop. Chunked reads check it before every
/// chunk; bulk reads check it once before their single transfer.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Timeouts and attempt budgets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTiming {
    /// Timeout of a single control transfer attempt
    #[serde(default = "TransferTiming::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Unit from which bulk read timeouts are derived
    #[serde(default = "TransferTiming::default_timeout_multi_ms")]
    pub timeout_multi_ms: u64,
    /// Attempts for control and single bulk transfers
    #[serde(default = "TransferTiming::default_attempts")]
    pub attempts: Attempts,
    /// Attempts per transfer when reading capture data
    #[serde(default = "TransferTiming::default_read_attempts")]
    pub read_attempts: Attempts,
}

impl Default for TransferTiming {
    fn default() -> Self {
        Self {
            control_timeout_ms: Self::default_control_timeout_ms(),
            timeout_multi_ms: Self::default_timeout_multi_ms(),
            attempts: Self::default_attempts(),
            read_attempts: Self::default_read_attempts(),
        }
    }
}

impl TransferTiming {
    fn default_control_timeout_ms() -> u64 {
        500
    }

    fn default_timeout_multi_ms() -> u64 {
        10
    }

    fn default_attempts() -> Attempts {
        Attempts::Bounded(3)
    }

    fn default_read_attempts() -> Attempts {
        Attempts::Bounded(1)
    }

    /// Per-attempt control timeout; a configured zero is raised to 1 ms
    /// since libusb reads zero as "wait forever"
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms.max(1))
    }

    /// Per-chunk timeout in chunked mode, independent of the chunk count
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_multi_ms.max(1).saturating_mul(10))
    }

    /// Timeout for a single bulk read of `length` bytes
    ///
    /// One timeout unit plus one unit per IN packet, computed at nanosecond
    /// resolution: strictly increasing in `length` and never zero (libusb
    /// reads a zero timeout as "wait forever").
    pub fn bulk_read_timeout(&self, length: usize, in_max_packet_size: u16) -> Duration {
        let packet = match u64::from(in_max_packet_size) {
            0 => FALLBACK_PACKET_SIZE,
            n => n,
        };
        let unit_ns = u128::from(self.timeout_multi_ms.max(1)) * 1_000_000;
        let nanos = unit_ns + unit_ns * length as u128 / u128::from(packet);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent
///
/// Returns the final result and the number of attempts made.
pub fn retry_while<T, E>(
    attempts: Attempts,
    is_retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> (Result<T, E>, u32) {
    let mut made = 0u32;
    loop {
        let result = op();
        made = made.saturating_add(1);
        match &result {
            Err(e) if is_retryable(e) && attempts.permits(made) => {
                trace!("Retrying after attempt {} of {}", made, attempts);
            }
            _ => return (result, made),
        }
    }
}

impl<D: RawDevice> ScopeDevice<D> {
    /// Control transfer with retry on timeout
    ///
    /// Returns the number of bytes actually transferred, which may be less
    /// than `data.len()`.
    pub fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        data: &mut [u8],
        value: u16,
        index: u16,
        attempts: Attempts,
    ) -> Result<usize, TransferError> {
        if self.is_demo() {
            return Ok(0);
        }
        let timeout = self.timing().control_timeout();
        let handle = self.open_handle().ok_or(TransferError::NotConnected)?;

        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
            request_type,
            request,
            value,
            index,
            data.len()
        );

        let outcome = retry_while(attempts, UsbError::is_timeout, || {
            handle.control_transfer(request_type, request, value, index, data, timeout)
        });
        self.finish_transfer("Control", outcome)
    }

    /// Bulk transfer with retry on timeout
    pub fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &mut [u8],
        attempts: Attempts,
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        if self.is_demo() {
            return Ok(0);
        }
        let handle = self.open_handle().ok_or(TransferError::NotConnected)?;

        trace!(
            "Bulk transfer: endpoint={:#x}, data_len={}, timeout={}ms",
            endpoint,
            data.len(),
            timeout.as_millis()
        );

        let outcome = retry_while(attempts, UsbError::is_timeout, || {
            handle.bulk_transfer(endpoint, data, timeout)
        });
        self.finish_transfer("Bulk", outcome)
    }

    /// Read up to `requested` bytes of capture data from the IN endpoint
    ///
    /// In [`ChunkingMode::Chunked`] the read is split into [`CHUNK_SIZE`]
    /// transfers; it ends early when a stop is requested or a chunk comes
    /// back short. In [`ChunkingMode::Bulk`] one transfer covers the whole
    /// length and the stop flag is only consulted before it starts. A stop
    /// seen there returns `Ok(0)` and leaves the flag set for the caller;
    /// otherwise the flag is cleared once the transfer finishes.
    pub fn bulk_read_multi(
        &mut self,
        data: &mut [u8],
        requested: usize,
        mode: ChunkingMode,
        attempts: Attempts,
    ) -> Result<usize, TransferError> {
        if self.is_demo() {
            return Ok(0);
        }
        if !self.is_connected() {
            return Err(TransferError::NotConnected);
        }

        let requested = requested.min(data.len());
        let endpoint = self.model().endpoint_in;
        let stop = self.stop_flag();

        match mode {
            ChunkingMode::Chunked => {
                let timeout = self.timing().chunk_timeout();
                let mut received = 0;
                let mut chunks = 0;
                while received < requested {
                    if stop.is_requested() {
                        debug!("Stop requested after {} chunk(s)", chunks);
                        break;
                    }
                    let len = (requested - received).min(CHUNK_SIZE);
                    let n = self.bulk_transfer(
                        endpoint,
                        &mut data[received..received + len],
                        attempts,
                        timeout,
                    )?;
                    received += n;
                    chunks += 1;
                    if n < CHUNK_SIZE {
                        break;
                    }
                }
                debug!("Chunked read: {} chunk(s), {} bytes", chunks, received);
                Ok(received)
            }
            ChunkingMode::Bulk => {
                if stop.is_requested() {
                    debug!("Stop requested before bulk read");
                    return Ok(0);
                }
                let timeout = self
                    .timing()
                    .bulk_read_timeout(requested, self.in_max_packet_size());
                let result = self.bulk_transfer(endpoint, &mut data[..requested], attempts, timeout);
                stop.clear();
                result
            }
        }
    }

    /// Map the outcome of a retried transfer, disconnecting on device loss
    fn finish_transfer(
        &mut self,
        kind: &str,
        outcome: (Result<usize, UsbError>, u32),
    ) -> Result<usize, TransferError> {
        match outcome {
            (Ok(n), _) => {
                trace!("{} transfer succeeded: {} bytes", kind, n);
                Ok(n)
            }
            (Err(UsbError::Timeout), made) => {
                warn!("{} transfer timed out after {} attempt(s)", kind, made);
                Err(TransferError::Timeout { attempts: made })
            }
            (Err(UsbError::NoDevice), _) => {
                warn!("{} transfer failed: device {} is gone", kind, self.identity());
                self.disconnect();
                Err(TransferError::DeviceGone)
            }
            (Err(e), _) => {
                warn!("{} transfer failed: {}", kind, e);
                Err(TransferError::Usb(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_stops_on_success() {
        let mut calls = 0;
        let (result, made) = retry_while(Attempts::Bounded(5), UsbError::is_timeout, || {
            calls += 1;
            if calls < 3 {
                Err(UsbError::Timeout)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
        assert_eq!(made, 3);
    }

    #[test]
    fn test_retry_exhausts_budget() {
        let (result, made) = retry_while(Attempts::Bounded(3), UsbError::is_timeout, || {
            Err::<(), _>(UsbError::Timeout)
        });
        assert_eq!(result, Err(UsbError::Timeout));
        assert_eq!(made, 3);
    }

    #[test]
    fn test_retry_aborts_on_other_error() {
        let (result, made) = retry_while(Attempts::Unbounded, UsbError::is_timeout, || {
            Err::<(), _>(UsbError::Pipe)
        });
        assert_eq!(result, Err(UsbError::Pipe));
        assert_eq!(made, 1);
    }

    #[test]
    fn test_unbounded_retries_until_success() {
        let mut calls = 0;
        let (result, made) = retry_while(Attempts::Unbounded, UsbError::is_timeout, || {
            calls += 1;
            if calls < 50 { Err(UsbError::Timeout) } else { Ok(()) }
        });
        assert!(result.is_ok());
        assert_eq!(made, 50);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let (_, made) = retry_while(Attempts::Bounded(0), UsbError::is_timeout, || {
            Err::<(), _>(UsbError::Timeout)
        });
        assert_eq!(made, 1);
    }

    #[test]
    fn test_bulk_read_timeout_strictly_increasing() {
        let timing = TransferTiming::default();
        let mut previous = timing.bulk_read_timeout(0, 512);
        assert!(previous > Duration::ZERO);
        for length in [1usize, 2, 511, 512, 513, 40_000, 1 << 20, 4 << 20] {
            let timeout = timing.bulk_read_timeout(length, 512);
            assert!(timeout > previous, "timeout not increasing at {}", length);
            previous = timeout;
        }
    }

    #[test]
    fn test_bulk_read_timeout_scale() {
        let timing = TransferTiming::default();
        // 1 MiB at 512-byte packets: 2048 units of 10 ms plus one
        assert_eq!(
            timing.bulk_read_timeout(1 << 20, 512),
            Duration::from_millis(10 * 2049)
        );
        assert_eq!(
            timing.bulk_read_timeout(1 << 20, 0),
            timing.bulk_read_timeout(1 << 20, 512)
        );
    }

    #[test]
    fn test_chunk_timeout() {
        let timing = TransferTiming::default();
        assert_eq!(timing.chunk_timeout(), Duration::from_millis(100));
        assert_eq!(timing.control_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_timeouts_are_never_emitted() {
        let timing: TransferTiming =
            toml::from_str("control_timeout_ms = 0\ntimeout_multi_ms = 0\n").unwrap();
        assert_eq!(timing.control_timeout(), Duration::from_millis(1));
        assert_eq!(timing.chunk_timeout(), Duration::from_millis(10));
        assert!(timing.bulk_read_timeout(0, 512) > Duration::ZERO);
    }

    #[test]
    fn test_attempts_serde() {
        #[derive(Deserialize, Serialize)]
        struct Wrapper {
            attempts: Attempts,
        }

        let bounded: Wrapper = toml::from_str("attempts = 4").unwrap();
        assert_eq!(bounded.attempts, Attempts::Bounded(4));

        let unbounded: Wrapper = toml::from_str("attempts = \"unbounded\"").unwrap();
        assert_eq!(unbounded.attempts, Attempts::Unbounded);

        assert!(toml::from_str::<Wrapper>("attempts = \"forever\"").is_err());

        let text = toml::to_string(&Wrapper {
            attempts: Attempts::Unbounded,
        })
        .unwrap();
        assert!(text.contains("unbounded"));
    }

    #[test]
    fn test_stop_flag_shared() {
        let flag = StopFlag::new();
        let other = flag.clone();
        other.request();
        assert!(flag.is_requested());
        flag.clear();
        assert!(!other.is_requested());
    }

    #[test]
    fn test_chunking_mode_from_flag() {
        assert_eq!(ChunkingMode::from_small_blocks(true), ChunkingMode::Chunked);
        assert_eq!(ChunkingMode::from_small_blocks(false), ChunkingMode::Bulk);
    }
}
