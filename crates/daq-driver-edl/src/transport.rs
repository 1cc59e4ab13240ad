//! Byte-level link to the device.
//!
//! The [`Transport`] trait abstracts the USB bridge the amplifier sits
//! behind. The session drives it through connection setup, command writes,
//! queue-status polling and sample reads. [`SimulatedDevice`] implements it
//! for tests and for running without hardware.
//!
//! Reads and writes must return within a bounded time. A read that finds
//! nothing queued returns `Ok(0)` rather than waiting.
//!
//! [`SimulatedDevice`]: crate::mock::SimulatedDevice

use std::time::Duration;

use thiserror::Error;

/// Identifier reported by device enumeration (typically a serial number).
pub type DeviceId = String;

/// Failures reported by a [`Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is gone (unplugged, closed underneath us).
    #[error("Link disconnected")]
    Disconnected,

    /// The operation could not run right now; retrying may succeed.
    #[error("Transport busy")]
    Busy,

    /// No device with this serial number.
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// The operation did not finish in time.
    #[error("Operation timed out")]
    Timeout,

    /// Any other driver failure.
    #[error("{0}")]
    Io(String),
}

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Information returned when a link is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Serial number of the opened device
    pub device: DeviceId,
    /// Product description reported by the bridge
    pub description: String,
    /// Firmware reports an expired licence.
    pub expired: bool,
}

/// Queue snapshot reported by the device.
///
/// The two flags are read-to-clear: reporting them resets them on the
/// device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Bytes waiting in the receive queue
    pub queued_bytes: usize,
    /// The device queue overflowed since the last query
    pub buffer_overflow: bool,
    /// Samples were dropped since the last query
    pub lost_data: bool,
}

/// Byte-stream link to an amplifier.
pub trait Transport: Send {
    /// List devices that could be opened.
    fn enumerate(&mut self) -> TransportResult<Vec<DeviceId>>;

    /// Open a link to `device`.
    fn open(&mut self, device: &str) -> TransportResult<LinkInfo>;

    /// Set the USB latency timer.
    fn set_latency(&mut self, latency: Duration) -> TransportResult<()>;

    /// Set read/write timeouts of the open link.
    fn set_usb_parameters(
        &mut self,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> TransportResult<()>;

    /// Set USB transfer sizes in bytes.
    fn set_transfer_size(&mut self, in_bytes: u32, out_bytes: u32) -> TransportResult<()>;

    /// Discard everything queued in either direction.
    fn purge(&mut self) -> TransportResult<()>;

    /// Write bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> TransportResult<usize>;

    /// Read up to `buf.len()` bytes without blocking.
    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Report queued byte count and consume the sticky flags.
    fn queue_status(&mut self) -> TransportResult<QueueStatus>;

    /// Close the link. May fail with [`TransportError::Busy`] while teardown
    /// is in progress.
    fn close(&mut self) -> TransportResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn enumerate(&mut self) -> TransportResult<Vec<DeviceId>> {
        (**self).enumerate()
    }

    fn open(&mut self, device: &str) -> TransportResult<LinkInfo> {
        (**self).open(device)
    }

    fn set_latency(&mut self, latency: Duration) -> TransportResult<()> {
        (**self).set_latency(latency)
    }

    fn set_usb_parameters(
        &mut self,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> TransportResult<()> {
        (**self).set_usb_parameters(read_timeout, write_timeout)
    }

    fn set_transfer_size(&mut self, in_bytes: u32, out_bytes: u32) -> TransportResult<()> {
        (**self).set_transfer_size(in_bytes, out_bytes)
    }

    fn purge(&mut self) -> TransportResult<()> {
        (**self).purge()
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        (**self).read(buf)
    }

    fn queue_status(&mut self) -> TransportResult<QueueStatus> {
        (**self).queue_status()
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }
}
