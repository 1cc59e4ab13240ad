//! Background acquisition.
//!
//! [`AcquisitionWorker`] moves a connected session onto a reader thread and
//! streams fixed-size batches to a bounded tokio channel, so a caller can
//! consume samples asynchronously while deciding when to stop:
//!
//! ```text
//!   ┌──────────────┐   read_data_with   ┌──────────────┐   mpsc    ┌──────────┐
//!   │  EdlSession  │ ─────────────────▶ │ reader thread│ ────────▶ │ consumer │
//!   └──────────────┘                    └──────────────┘           └──────────┘
//! ```
//!
//! Stopping sets a flag that also cancels the read in progress. Joining the
//! worker hands the session back, still connected unless the link was lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::acquisition::{frame_packets, CancelFlag, ReadBudget, SamplePacket};
use crate::error::{EdlError, Result};
use crate::session::EdlSession;
use crate::transport::Transport;

/// Pause between delivery attempts while the channel is full.
const FULL_CHANNEL_BACKOFF: Duration = Duration::from_millis(1);

/// Packets read by the worker in one go.
#[derive(Debug, Clone)]
pub struct PacketBatch {
    /// Values packet after packet.
    pub samples: Vec<f32>,
    /// Channels per packet
    pub channels: usize,
    /// Batch number, starting at 0.
    pub sequence: u64,
    /// Index of the first packet of this batch in the worker's stream.
    pub first_packet: u64,
    /// An overflow flag was consumed while reading this batch.
    pub overflow_before: bool,
    /// A lost-data flag was consumed while reading this batch.
    pub lost_before: bool,
    /// When the batch was handed to the channel
    pub timestamp: Instant,
}

impl PacketBatch {
    /// Whole packets in the batch.
    pub fn n_packets(&self) -> usize {
        if self.channels > 0 {
            self.samples.len() / self.channels
        } else {
            0
        }
    }

    /// View the batch as packets.
    pub fn packets(&self) -> Result<Vec<SamplePacket<'_>>> {
        frame_packets(&self.samples, self.channels)
    }

    /// Values of one channel across the batch.
    pub fn channel_data(&self, channel: usize) -> Vec<f32> {
        if channel >= self.channels {
            return Vec::new();
        }
        self.samples
            .iter()
            .skip(channel)
            .step_by(self.channels)
            .copied()
            .collect()
    }
}

/// Receiving end of a worker's batch stream.
pub type BatchReceiver = mpsc::Receiver<PacketBatch>;

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Packets requested per read
    pub batch_packets: usize,
    /// Channel capacity in batches
    pub channel_capacity: usize,
    /// Drop batches when the consumer falls behind instead of waiting
    pub drop_on_full: bool,
    /// Stop after this many batches
    pub max_batches: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_packets: 1000,
            channel_capacity: 100,
            drop_on_full: false,
            max_batches: None,
        }
    }
}

/// Counters of a running worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Batches delivered to the receiver
    pub batches_sent: u64,
    /// Batches dropped because the channel was full
    pub batches_dropped: u64,
    /// Packets read from the device
    pub packets_read: u64,
    /// Overflow flags consumed
    pub overflow_events: u64,
    /// Lost-data flags consumed
    pub lost_data_events: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
    packets_read: AtomicU64,
    overflow_events: AtomicU64,
    lost_data_events: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            batches_sent: self.batches_sent.load(Ordering::SeqCst),
            batches_dropped: self.batches_dropped.load(Ordering::SeqCst),
            packets_read: self.packets_read.load(Ordering::SeqCst),
            overflow_events: self.overflow_events.load(Ordering::SeqCst),
            lost_data_events: self.lost_data_events.load(Ordering::SeqCst),
        }
    }
}

/// What a finished worker hands back.
#[derive(Debug)]
pub struct WorkerReport<T: Transport> {
    /// The session, still connected unless the link was lost
    pub session: EdlSession<T>,
    /// Final counters
    pub stats: WorkerStats,
    /// The error that ended the worker, if any.
    pub error: Option<EdlError>,
}

/// Reader thread owning a session.
pub struct AcquisitionWorker<T: Transport + 'static> {
    handle: JoinHandle<(EdlSession<T>, Option<EdlError>)>,
    stop: CancelFlag,
    counters: Arc<Counters>,
}

impl<T: Transport + 'static> AcquisitionWorker<T> {
    /// Start streaming from `session`.
    ///
    /// A session that is not connected ends the worker immediately with
    /// `DeviceNotConnected`.
    pub fn spawn(session: EdlSession<T>, config: WorkerConfig) -> (Self, BatchReceiver) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stop = CancelFlag::new();
        let counters = Arc::new(Counters::default());

        let thread_stop = stop.clone();
        let thread_counters = Arc::clone(&counters);
        let handle = thread::spawn(move || {
            run(session, config, tx, thread_stop, thread_counters)
        });

        (
            Self {
                handle,
                stop,
                counters,
            },
            rx,
        )
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Snapshot of the counters so far.
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Stop the worker and wait for it, returning the session.
    pub fn join(self) -> Result<WorkerReport<T>> {
        self.stop.cancel();
        match self.handle.join() {
            Ok((session, error)) => {
                let stats = self.counters.snapshot();
                info!(
                    batches = stats.batches_sent,
                    dropped = stats.batches_dropped,
                    packets = stats.packets_read,
                    "Acquisition worker stopped"
                );
                Ok(WorkerReport {
                    session,
                    stats,
                    error,
                })
            }
            Err(e) => {
                error!("Acquisition worker panicked: {:?}", e);
                Err(EdlError::Unknown {
                    message: "acquisition worker panicked".to_string(),
                })
            }
        }
    }
}

fn run<T: Transport>(
    mut session: EdlSession<T>,
    config: WorkerConfig,
    tx: mpsc::Sender<PacketBatch>,
    stop: CancelFlag,
    counters: Arc<Counters>,
) -> (EdlSession<T>, Option<EdlError>) {
    if !session.is_connected() {
        return (session, Some(EdlError::DeviceNotConnected));
    }

    let channels = session.config().acquisition.channels;
    let mut sequence = 0u64;
    let mut next_packet = 0u64;
    debug!(batch_packets = config.batch_packets, "Acquisition worker started");

    while !stop.is_cancelled() {
        if config.max_batches.is_some_and(|max| sequence >= max) {
            break;
        }

        let budget = ReadBudget::from_config(&session.config().acquisition).with_cancel(stop.clone());
        let outcome = match session.read_data_with(config.batch_packets, &budget) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Acquisition worker read failed");
                return (session, Some(e));
            }
        };

        if outcome.overflow_seen {
            counters.overflow_events.fetch_add(1, Ordering::SeqCst);
        }
        if outcome.lost_data_seen {
            counters.lost_data_events.fetch_add(1, Ordering::SeqCst);
        }
        if outcome.actual == 0 {
            continue;
        }

        counters
            .packets_read
            .fetch_add(outcome.actual as u64, Ordering::SeqCst);

        let batch = PacketBatch {
            samples: outcome.samples,
            channels,
            sequence,
            first_packet: next_packet,
            overflow_before: outcome.overflow_seen,
            lost_before: outcome.lost_data_seen,
            timestamp: Instant::now(),
        };
        sequence += 1;
        next_packet += outcome.actual as u64;

        if !deliver(&tx, batch, &config, &stop, &counters) {
            debug!("Batch receiver closed");
            break;
        }
    }

    debug!("Acquisition worker exiting");
    (session, None)
}

/// Hand a batch to the consumer. Returns false once the receiver is gone.
fn deliver(
    tx: &mpsc::Sender<PacketBatch>,
    batch: PacketBatch,
    config: &WorkerConfig,
    stop: &CancelFlag,
    counters: &Counters,
) -> bool {
    let mut batch = batch;
    loop {
        match tx.try_send(batch) {
            Ok(()) => {
                counters.batches_sent.fetch_add(1, Ordering::SeqCst);
                return true;
            }
            Err(mpsc::error::TrySendError::Full(returned)) => {
                if config.drop_on_full {
                    counters.batches_dropped.fetch_add(1, Ordering::SeqCst);
                    trace!(sequence = returned.sequence, "Dropped batch (channel full)");
                    return true;
                }
                if stop.is_cancelled() {
                    warn!(sequence = returned.sequence, "Discarding batch on stop");
                    return true;
                }
                batch = returned;
                thread::sleep(FULL_CHANNEL_BACKOFF);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(samples: Vec<f32>, channels: usize) -> PacketBatch {
        PacketBatch {
            samples,
            channels,
            sequence: 0,
            first_packet: 0,
            overflow_before: false,
            lost_before: false,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_batch_channel_data() {
        let b = batch(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], 3);
        assert_eq!(b.n_packets(), 3);
        assert_eq!(b.channel_data(0), vec![1.0, 4.0, 7.0]);
        assert_eq!(b.channel_data(2), vec![3.0, 6.0, 9.0]);
        assert!(b.channel_data(5).is_empty());
        assert_eq!(b.packets().unwrap()[1].voltage(), 4.0);
    }

    #[test]
    fn test_deliver_drops_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let counters = Counters::default();
        let config = WorkerConfig {
            drop_on_full: true,
            ..Default::default()
        };
        let stop = CancelFlag::new();
        assert!(deliver(&tx, batch(vec![0.0; 5], 5), &config, &stop, &counters));
        assert!(deliver(&tx, batch(vec![0.0; 5], 5), &config, &stop, &counters));
        let stats = counters.snapshot();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_dropped, 1);
    }

    #[test]
    fn test_deliver_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let counters = Counters::default();
        let stop = CancelFlag::new();
        assert!(!deliver(
            &tx,
            batch(vec![0.0; 5], 5),
            &WorkerConfig::default(),
            &stop,
            &counters
        ));
    }
}
