//! Device status queries and advisory telemetry.
//!
//! The device reports two sticky flags alongside its queue size: the
//! hardware buffer overflowed, or samples were lost on the link. Reading
//! the status clears both, so each flag event is seen by exactly one query.
//! The session logs and counts them but never fails because of them.

use tracing::{trace, warn};

use crate::error::{EdlError, Result};
use crate::session::EdlSession;
use crate::transport::{QueueStatus, Transport, TransportError};

/// Snapshot returned by [`EdlSession::device_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Whole packets ready to read.
    pub available_packets: usize,
    /// Buffer overflowed since the previous query.
    pub buffer_overflow: bool,
    /// Samples were lost since the previous query.
    pub lost_data: bool,
}

/// Cumulative status counters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounters {
    /// Status queries made
    pub queries: u64,
    /// Queries that reported a buffer overflow
    pub overflow_events: u64,
    /// Queries that reported lost data
    pub lost_data_events: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatusMonitor {
    counters: StatusCounters,
}

impl StatusMonitor {
    pub(crate) fn record(&mut self, status: &QueueStatus, packets: usize) {
        self.counters.queries += 1;

        if status.buffer_overflow {
            self.counters.overflow_events += 1;
            warn!(
                events = self.counters.overflow_events,
                available = packets,
                "Device buffer overflow"
            );
        }
        if status.lost_data {
            self.counters.lost_data_events += 1;
            warn!(
                events = self.counters.lost_data_events,
                available = packets,
                "Device reported lost data"
            );
        }
    }

    pub(crate) fn counters(&self) -> StatusCounters {
        self.counters
    }

    pub(crate) fn reset(&mut self) {
        self.counters = StatusCounters::default();
    }
}

impl<T: Transport> EdlSession<T> {
    /// Query the queue size and consume the overflow/lost-data flags.
    ///
    /// Partial packet bytes already held by the session count towards the
    /// available packets.
    pub fn device_status(&mut self) -> Result<DeviceStatus> {
        self.ensure_connected()?;

        let raw = match self.transport.queue_status() {
            Ok(raw) => raw,
            Err(TransportError::Disconnected) => return Err(self.link_lost()),
            Err(e) => {
                return Err(EdlError::Unknown {
                    message: format!("status query failed: {}", e),
                })
            }
        };

        let packet_bytes = self.config.acquisition.packet_bytes();
        let available_packets = (raw.queued_bytes + self.carry.len()) / packet_bytes;
        self.monitor.record(&raw, available_packets);

        trace!(
            queued_bytes = raw.queued_bytes,
            carry_bytes = self.carry.len(),
            available_packets,
            "Device status"
        );

        Ok(DeviceStatus {
            available_packets,
            buffer_overflow: raw.buffer_overflow,
            lost_data: raw.lost_data,
        })
    }

    /// Status counters since the current connection was opened.
    pub fn status_counters(&self) -> StatusCounters {
        self.monitor.counters()
    }
}
