//! Background acquisition worker against the simulated amplifier.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_worker_streams_ordered_batches` | Batches arrive in order and back to back |
//! | `test_worker_stop_returns_session` | Stopping hands back a connected session |
//! | `test_worker_link_loss` | A lost link ends the stream with an error |
//! | `test_worker_requires_connection` | A disconnected session ends at once |
//! | `test_worker_drops_when_full` | Drop mode never blocks on a slow consumer |

mod common;

use std::time::Duration;

use common::{assert_sequence, connected, connected_with, disconnected_with, expected};
use daq_driver_edl::mock::{FaultPlan, FaultScenario, Operation, SimulatorConfig};
use daq_driver_edl::*;

const CHANNELS: usize = 5;

async fn drain(rx: &mut BatchReceiver) -> Vec<PacketBatch> {
    let mut batches = Vec::new();
    let collect = async {
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("worker did not close its channel");
    batches
}

// =============================================================================
// Streaming
// =============================================================================

/// Batches carry consecutive packets with increasing sequence numbers.
#[tokio::test]
async fn test_worker_streams_ordered_batches() {
    let (session, _handle) = connected(SimulatorConfig {
        packets_per_poll: 50,
        ..Default::default()
    });

    let (worker, mut rx) = AcquisitionWorker::spawn(
        session,
        WorkerConfig {
            batch_packets: 100,
            max_batches: Some(5),
            ..Default::default()
        },
    );

    let batches = drain(&mut rx).await;
    assert_eq!(batches.len(), 5);

    let mut next = 0u64;
    for (i, batch) in batches.iter().enumerate() {
        assert_eq!(batch.sequence, i as u64);
        assert_eq!(batch.first_packet, next);
        assert_eq!(batch.n_packets(), 100);
        assert_eq!(batch.channels, CHANNELS);
        assert_eq!(batch.channel_data(1)[0], expected(next, 1));
        assert_sequence(&batch.samples, CHANNELS, next);
        next += batch.n_packets() as u64;
    }

    let report = worker.join().unwrap();
    assert!(report.error.is_none());
    assert!(report.session.is_connected());
    assert_eq!(report.stats.batches_sent, 5);
    assert_eq!(report.stats.packets_read, 500);
}

/// Stopping a worker returns the session, still connected.
#[tokio::test]
async fn test_worker_stop_returns_session() {
    let (session, handle) = connected(SimulatorConfig {
        packets_per_poll: 20,
        ..Default::default()
    });

    let (worker, mut rx) = AcquisitionWorker::spawn(
        session,
        WorkerConfig {
            batch_packets: 40,
            ..Default::default()
        },
    );

    for _ in 0..2 {
        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("batch in time")
            .expect("worker running");
        assert_eq!(batch.n_packets(), 40);
    }

    worker.stop();
    drain(&mut rx).await;

    let report = worker.join().unwrap();
    assert!(report.error.is_none());
    assert!(report.stats.batches_sent >= 2);

    let mut session = report.session;
    assert!(session.is_connected());
    session.disconnect().unwrap();
    assert!(!handle.is_open());
}

// =============================================================================
// Failures
// =============================================================================

/// A lost link ends the worker and the session comes back disconnected.
#[tokio::test]
async fn test_worker_link_loss() {
    let (session, handle) = connected_with(
        SimulatorConfig {
            packets_per_poll: 10,
            ..Default::default()
        },
        FaultPlan::scenario(FaultScenario::LinkLossAfter {
            operation: Operation::QueueStatus,
            count: 10,
        }),
        SessionConfig::default(),
    );

    let (worker, mut rx) = AcquisitionWorker::spawn(
        session,
        WorkerConfig {
            batch_packets: 20,
            ..Default::default()
        },
    );

    let batches = drain(&mut rx).await;
    assert!(!batches.is_empty());

    let report = worker.join().unwrap();
    assert!(report.error.expect("link loss reported").is_not_connected());
    assert!(!report.session.is_connected());
    assert!(report.stats.packets_read > 0);
    assert!(!handle.is_open());
}

/// A worker given a disconnected session stops straight away.
#[tokio::test]
async fn test_worker_requires_connection() {
    let (session, _handle) = disconnected_with(
        SimulatorConfig::default(),
        FaultPlan::none(),
        SessionConfig::default(),
    );

    let (worker, mut rx) = AcquisitionWorker::spawn(session, WorkerConfig::default());
    assert!(drain(&mut rx).await.is_empty());

    let report = worker.join().unwrap();
    assert!(report.error.expect("not connected").is_not_connected());
    assert_eq!(report.stats, WorkerStats::default());
}

/// With drop mode a consumer that never reads loses batches instead of
/// stalling the reader.
#[tokio::test]
async fn test_worker_drops_when_full() {
    let (session, _handle) = connected(SimulatorConfig::default());

    let (worker, mut rx) = AcquisitionWorker::spawn(
        session,
        WorkerConfig {
            batch_packets: 25,
            channel_capacity: 1,
            drop_on_full: true,
            max_batches: Some(10),
        },
    );

    let finished = async {
        while !worker.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), finished)
        .await
        .expect("worker finished");

    let stats = worker.stats();
    assert_eq!(stats.batches_sent, 1);
    assert_eq!(stats.batches_dropped, 9);

    let batches = drain(&mut rx).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].sequence, 0);

    worker.join().unwrap();
}
