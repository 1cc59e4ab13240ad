//! Bounded sample acquisition.
//!
//! A read polls the device status and pulls packets once enough are queued:
//!
//! 1. query status (consuming the advisory flags)
//! 2. if at least `min(min_batch_packets, remaining)` packets are queued,
//!    pull `min(available, remaining)` of them
//! 3. otherwise wait one `poll_interval`
//!
//! until the request is met or the [`ReadBudget`] runs out. A read never
//! returns more packets than requested. Falling short is not an error: the
//! outcome carries the packets that were read plus a
//! [`NotEnoughAvailableData`](EdlError::NotEnoughAvailableData) advisory.
//!
//! Packets are `channels` little-endian `f32` values. Bytes of an incomplete
//! packet stay in the session and are completed by the next pull, so a
//! short transport read never shifts the channel order.
//!
//! # Example
//!
//! ```no_run
//! use daq_driver_edl::mock::{SimulatedDevice, SimulatorConfig};
//! use daq_driver_edl::{EdlSession, ReadBudget, SessionConfig};
//! use std::time::Duration;
//!
//! # fn example() -> daq_driver_edl::Result<()> {
//! let mut session = EdlSession::new(
//!     SimulatedDevice::new(SimulatorConfig::default()),
//!     SessionConfig::default(),
//! );
//! session.connect("E4-SIM-0")?;
//!
//! let outcome = session.read_data_with(1000, &ReadBudget::timeout(Duration::from_secs(1)))?;
//! for packet in outcome.packets()? {
//!     println!("{} mV {:?}", packet.voltage(), packet.currents());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::config::AcquisitionConfig;
use crate::error::{EdlError, Result};
use crate::session::EdlSession;
use crate::sink::{PacketSink, VecSink};
use crate::transport::{Transport, TransportError};

/// Fallback poll count when a configuration bounds neither polls nor time.
const FALLBACK_MAX_POLLS: u32 = 1000;

/// Largest single transport read while pulling packets.
const READ_CHUNK: usize = 64 * 1024;

/// How the session waits between polls.
pub trait Pacer: Send {
    /// Wait for about `interval`.
    fn pause(&mut self, interval: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Pacer for ThreadSleep {
    fn pause(&mut self, interval: Duration) {
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
}

/// Returns immediately. For simulators and tests, where nothing is gained
/// by waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPause;

impl Pacer for NoPause {
    fn pause(&mut self, _interval: Duration) {}
}

/// Shared flag that stops a read at its next poll.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not yet raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag; every clone sees it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All requested packets were delivered.
    Complete,
    /// The poll budget ran out.
    PollsExhausted,
    /// The deadline passed.
    DeadlineReached,
    /// The cancel flag was raised.
    Cancelled,
}

/// Bounds on a single read call.
///
/// Every constructor bounds the read by polls or time; cancellation can be
/// added on top.
#[derive(Debug, Clone)]
pub struct ReadBudget {
    max_polls: Option<u32>,
    deadline: Option<Instant>,
    cancel: Option<CancelFlag>,
}

impl ReadBudget {
    /// At most `max_polls` status queries.
    pub fn polls(max_polls: u32) -> Self {
        Self {
            max_polls: Some(max_polls),
            deadline: None,
            cancel: None,
        }
    }

    /// Stop once `timeout` has elapsed from now.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            max_polls: None,
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// Budget described by the acquisition configuration.
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        let deadline = config
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let max_polls = match (config.max_polls, deadline) {
            (None, None) => Some(FALLBACK_MAX_POLLS),
            (polls, _) => polls,
        };
        Self {
            max_polls,
            deadline,
            cancel: None,
        }
    }

    /// Also stop after `max_polls` status polls.
    pub fn with_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    /// Also stop at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Also stop when `cancel` is raised.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn exhausted(&self, polls: u32) -> Option<StopReason> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Some(StopReason::Cancelled);
        }
        if self.max_polls.is_some_and(|max| polls >= max) {
            return Some(StopReason::PollsExhausted);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::DeadlineReached);
        }
        None
    }
}

/// One packet: channel 0 is the command voltage in mV, the rest are currents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePacket<'a>(&'a [f32]);

impl<'a> SamplePacket<'a> {
    /// Command voltage (channel 0) in mV.
    pub fn voltage(&self) -> f32 {
        self.0[0]
    }

    /// The current channels.
    pub fn currents(&self) -> &'a [f32] {
        &self.0[1..]
    }

    /// One channel, `None` past the end.
    pub fn channel(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// All channels, voltage first.
    pub fn values(&self) -> &'a [f32] {
        self.0
    }
}

/// Split a flat sample stream into packets.
pub fn frame_packets(samples: &[f32], channels: usize) -> Result<Vec<SamplePacket<'_>>> {
    if channels == 0 || samples.len() % channels != 0 {
        return Err(EdlError::MisalignedFrame {
            len: samples.len(),
            channels,
        });
    }
    Ok(samples.chunks_exact(channels).map(SamplePacket).collect())
}

/// Summary of a read into a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReport {
    /// Packets asked for
    pub requested: usize,
    /// Packets delivered to the sink
    pub actual: usize,
    /// Status polls made
    pub polls: u32,
    /// Why the loop ended
    pub stop: StopReason,
    /// An overflow flag was consumed during the read.
    pub overflow_seen: bool,
    /// A lost-data flag was consumed during the read.
    pub lost_data_seen: bool,
}

impl ReadReport {
    /// Every requested packet arrived.
    pub fn is_complete(&self) -> bool {
        self.actual >= self.requested
    }

    /// `NotEnoughAvailableData` when the read fell short.
    pub fn advisory(&self) -> Option<EdlError> {
        (!self.is_complete()).then_some(EdlError::NotEnoughAvailableData {
            requested: self.requested,
            available: self.actual,
        })
    }
}

/// Packets returned by [`EdlSession::read_data`].
#[derive(Debug)]
pub struct ReadOutcome {
    /// Packets asked for
    pub requested: usize,
    /// Packets read
    pub actual: usize,
    /// `actual * channels` values, packet after packet.
    pub samples: Vec<f32>,
    /// Channels per packet
    pub channels: usize,
    /// Set when fewer packets than requested were read.
    pub advisory: Option<EdlError>,
    /// An overflow flag was consumed during the read.
    pub overflow_seen: bool,
    /// A lost-data flag was consumed during the read.
    pub lost_data_seen: bool,
    /// Why the loop ended
    pub stop: StopReason,
}

impl ReadOutcome {
    fn new(report: ReadReport, samples: Vec<f32>, channels: usize) -> Self {
        Self {
            requested: report.requested,
            actual: report.actual,
            samples,
            channels,
            advisory: report.advisory(),
            overflow_seen: report.overflow_seen,
            lost_data_seen: report.lost_data_seen,
            stop: report.stop,
        }
    }

    /// View the samples as packets.
    pub fn packets(&self) -> Result<Vec<SamplePacket<'_>>> {
        frame_packets(&self.samples, self.channels)
    }

    /// Every requested packet arrived.
    pub fn is_complete(&self) -> bool {
        self.advisory.is_none()
    }
}

impl<T: Transport> EdlSession<T> {
    /// Read up to `requested` packets within the configured budget.
    pub fn read_data(&mut self, requested: usize) -> Result<ReadOutcome> {
        let budget = ReadBudget::from_config(&self.config.acquisition);
        self.read_data_with(requested, &budget)
    }

    /// Read up to `requested` packets within `budget`.
    pub fn read_data_with(&mut self, requested: usize, budget: &ReadBudget) -> Result<ReadOutcome> {
        let channels = self.config.acquisition.channels;
        let mut sink = VecSink::with_capacity(requested.min(READ_CHUNK) * channels);
        let report = self.read_into(requested, budget, &mut sink)?;
        Ok(ReadOutcome::new(report, sink.into_samples(), channels))
    }

    /// Read up to `requested` packets into `sink`.
    ///
    /// The sink is flushed when the read ends. If the read fails (link lost,
    /// sink error) the sink is finalized before the error is returned.
    pub fn read_into(
        &mut self,
        requested: usize,
        budget: &ReadBudget,
        sink: &mut dyn PacketSink,
    ) -> Result<ReadReport> {
        self.ensure_connected()?;

        match self.acquire(requested, budget, sink) {
            Ok(report) => {
                sink.flush()?;
                debug!(
                    requested = report.requested,
                    actual = report.actual,
                    polls = report.polls,
                    stop = ?report.stop,
                    "Read finished"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(sink_err) = sink.finalize() {
                    debug!(error = %sink_err, "Sink finalize after failed read");
                }
                Err(e)
            }
        }
    }

    fn acquire(
        &mut self,
        requested: usize,
        budget: &ReadBudget,
        sink: &mut dyn PacketSink,
    ) -> Result<ReadReport> {
        let min_batch = self.config.acquisition.min_batch_packets.max(1);
        let interval = self.config.acquisition.poll_interval();

        let mut report = ReadReport {
            requested,
            actual: 0,
            polls: 0,
            stop: StopReason::Complete,
            overflow_seen: false,
            lost_data_seen: false,
        };

        while report.actual < requested {
            if let Some(stop) = budget.exhausted(report.polls) {
                report.stop = stop;
                break;
            }
            report.polls += 1;

            let status = self.device_status()?;
            report.overflow_seen |= status.buffer_overflow;
            report.lost_data_seen |= status.lost_data;

            let remaining = requested - report.actual;
            if status.available_packets > 0 && status.available_packets >= min_batch.min(remaining) {
                report.actual += self.pull(status.available_packets.min(remaining), sink)?;
            } else {
                self.pause(interval);
            }
        }

        // Take whatever is left below the batch threshold before giving up.
        if matches!(
            report.stop,
            StopReason::PollsExhausted | StopReason::DeadlineReached
        ) {
            let status = self.device_status()?;
            report.overflow_seen |= status.buffer_overflow;
            report.lost_data_seen |= status.lost_data;
            let remaining = requested - report.actual;
            if status.available_packets > 0 {
                report.actual += self.pull(status.available_packets.min(remaining), sink)?;
            }
        }

        Ok(report)
    }

    /// Pull up to `packets` whole packets and hand them to `sink`.
    ///
    /// Returns the number of packets delivered. Trailing bytes of a packet
    /// that has not fully arrived are kept for the next pull.
    fn pull(&mut self, packets: usize, sink: &mut dyn PacketSink) -> Result<usize> {
        let channels = self.config.acquisition.channels;
        let packet_bytes = self.config.acquisition.packet_bytes();
        let stall_limit = self.config.acquisition.stalled_reads.max(1);
        let target = packets * packet_bytes;

        let mut buf: BytesMut = std::mem::take(&mut self.carry);
        let mut scratch = vec![0u8; target.saturating_sub(buf.len()).min(READ_CHUNK)];
        let mut stalls = 0;

        while buf.len() < target {
            let want = (target - buf.len()).min(scratch.len());
            match self.transport.read(&mut scratch[..want]) {
                Ok(0) | Err(TransportError::Busy) | Err(TransportError::Timeout) => {
                    stalls += 1;
                    if stalls >= stall_limit {
                        trace!(have = buf.len(), target, "Transport stalled mid-pull");
                        break;
                    }
                }
                Ok(n) => {
                    buf.extend_from_slice(&scratch[..n]);
                    stalls = 0;
                }
                Err(TransportError::Disconnected) => return Err(self.link_lost()),
                Err(e) => {
                    self.carry = buf;
                    return Err(EdlError::Unknown {
                        message: format!("read failed: {}", e),
                    });
                }
            }
        }

        let whole = buf.len() / packet_bytes;
        let mut data = buf.split_to(whole * packet_bytes);
        self.carry = buf;

        if whole == 0 {
            return Ok(0);
        }

        let mut samples = Vec::with_capacity(whole * channels);
        while data.has_remaining() {
            samples.push(data.get_f32_le());
        }
        sink.accept(&samples, channels)?;

        trace!(
            packets = whole,
            carry_bytes = self.carry.len(),
            "Pulled packets"
        );
        Ok(whole)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_packets() {
        let samples = [1.0, 10.0, 11.0, 2.0, 20.0, 21.0];
        let packets = frame_packets(&samples, 3).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].voltage(), 2.0);
        assert_eq!(packets[1].currents(), &[20.0, 21.0]);
        assert_eq!(packets[0].channel(2), Some(11.0));
        assert_eq!(packets[0].channel(3), None);

        let err = frame_packets(&samples[..5], 3).unwrap_err();
        assert!(matches!(err, EdlError::MisalignedFrame { len: 5, channels: 3 }));
    }

    #[test]
    fn test_budget_bounds() {
        let budget = ReadBudget::polls(3);
        assert_eq!(budget.exhausted(2), None);
        assert_eq!(budget.exhausted(3), Some(StopReason::PollsExhausted));

        let cancel = CancelFlag::new();
        let budget = ReadBudget::polls(100).with_cancel(cancel.clone());
        assert_eq!(budget.exhausted(0), None);
        cancel.cancel();
        assert_eq!(budget.exhausted(0), Some(StopReason::Cancelled));

        let budget = ReadBudget::timeout(Duration::ZERO);
        assert_eq!(budget.exhausted(0), Some(StopReason::DeadlineReached));
    }

    #[test]
    fn test_budget_from_config_is_never_unbounded() {
        let config = AcquisitionConfig {
            max_polls: None,
            timeout_ms: None,
            ..Default::default()
        };
        let budget = ReadBudget::from_config(&config);
        assert_eq!(budget.max_polls, Some(FALLBACK_MAX_POLLS));

        let config = AcquisitionConfig {
            max_polls: None,
            timeout_ms: Some(50),
            ..Default::default()
        };
        let budget = ReadBudget::from_config(&config);
        assert_eq!(budget.max_polls, None);
        assert!(budget.deadline.is_some());
    }

    #[test]
    fn test_report_advisory() {
        let report = ReadReport {
            requested: 1000,
            actual: 400,
            polls: 1000,
            stop: StopReason::PollsExhausted,
            overflow_seen: false,
            lost_data_seen: false,
        };
        let advisory = report.advisory().unwrap();
        assert_eq!(advisory.code(), 0x0205);
        assert!(ReadReport { actual: 1000, ..report }.advisory().is_none());
    }
}
