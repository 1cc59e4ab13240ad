//! Acquisition routines: recording to a file and streaming through the
//! background worker.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use daq_driver_edl::{
    AcquisitionWorker, EdlError, FileSink, PacketSink, ReadBudget, ReadReport, Transport,
    WorkerConfig,
};
use tracing::{debug, info};

use super::{ProcedureReport, Rig};

/// A finished recording.
#[derive(Debug)]
pub struct Recording {
    /// File the packets were written to
    pub path: PathBuf,
    /// Outcome of the read loop
    pub read: ReadReport,
    /// Timed steps
    pub procedure: ProcedureReport,
}

/// Totals of a streaming run.
#[derive(Debug, Default)]
pub struct StreamSummary {
    /// Batches received
    pub batches: u64,
    /// Packets received
    pub packets: u64,
    /// Batches the worker dropped
    pub dropped_batches: u64,
    /// Overflow flags seen
    pub overflow_events: u64,
    /// Lost-data flags seen
    pub lost_data_events: u64,
    /// Mean of each channel over the whole run
    pub channel_means: Vec<f64>,
    /// Error that ended the stream early
    pub error: Option<EdlError>,
}

impl<T: Transport> Rig<T> {
    /// Let the protocol settle, purge, and record up to `packets` packets.
    ///
    /// `path` is resolved against `recording.output_dir` when relative.
    /// Falling short of `packets` is a warning in the report, not an error.
    /// If the link drops mid-recording the file is closed with whatever
    /// arrived and the error is returned.
    pub fn record_to_file(&mut self, path: &Path, packets: usize) -> Result<Recording> {
        let mut procedure = ProcedureReport::new("record to file");
        let path = self.config.recording.resolve(path);
        let settle = self.config.procedures.settle;

        procedure.step("settle", || {
            self.pause(settle);
            Ok(())
        })?;
        procedure.step("purge", || Ok(self.session.purge_data()?))?;

        let mut sink = procedure.step("open file", || {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            Ok(FileSink::create(&path)?)
        })?;

        let budget = ReadBudget::from_config(&self.session.config().acquisition);
        let read = procedure.step("acquire", || {
            Ok(self.session.read_into(packets, &budget, &mut sink)?)
        })?;
        procedure.detail(format!(
            "{} of {} packets in {} polls ({:?})",
            read.actual, read.requested, read.polls, read.stop
        ));

        procedure.step("close file", || Ok(sink.finalize()?))?;

        if let Some(advisory) = read.advisory() {
            procedure.warn(advisory.to_string());
        }
        if read.overflow_seen {
            procedure.warn("device buffer overflowed during the recording");
        }
        if read.lost_data_seen {
            procedure.warn("device reported lost data during the recording");
        }

        info!(
            path = %path.display(),
            packets = read.actual,
            "Recording finished"
        );

        Ok(Recording {
            path,
            read,
            procedure: procedure.finish(),
        })
    }

    /// Stream `worker.max_batches` batches through an [`AcquisitionWorker`].
    ///
    /// The rig is handed back afterwards. A link lost mid-stream ends the
    /// run and is reported in [`StreamSummary::error`].
    pub async fn stream(self, worker: WorkerConfig) -> Result<(Self, StreamSummary)>
    where
        T: 'static,
    {
        let Rig {
            session,
            config,
            pacer,
        } = self;
        let channels = session.config().acquisition.channels;

        let (worker, mut rx) = AcquisitionWorker::spawn(session, worker);

        let mut summary = StreamSummary {
            channel_means: vec![0.0; channels],
            ..Default::default()
        };
        let mut sums = vec![0.0f64; channels];

        while let Some(batch) = rx.recv().await {
            summary.batches += 1;
            summary.packets += batch.n_packets() as u64;
            for packet in batch.samples.chunks_exact(channels) {
                for (sum, value) in sums.iter_mut().zip(packet) {
                    *sum += f64::from(*value);
                }
            }
            debug!(
                sequence = batch.sequence,
                first_packet = batch.first_packet,
                packets = batch.n_packets(),
                "Batch received"
            );
        }

        let report = tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("joining acquisition worker")??;

        if summary.packets > 0 {
            for (mean, sum) in summary.channel_means.iter_mut().zip(&sums) {
                *mean = sum / summary.packets as f64;
            }
        }
        summary.dropped_batches = report.stats.batches_dropped;
        summary.overflow_events = report.stats.overflow_events;
        summary.lost_data_events = report.stats.lost_data_events;
        summary.error = report.error;

        let rig = Rig {
            session: report.session,
            config,
            pacer,
        };
        Ok((rig, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::procedures::tests::{rig, rig_with};
    use daq_driver_edl::mock::{FaultPlan, FaultScenario, Operation};
    use daq_driver_edl::read_packet_file;

    #[test]
    fn test_record_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.recording.output_dir = dir.path().join("runs");
        let (mut rig, _handle) = rig_with(config, FaultPlan::none());
        rig.bring_up().unwrap();

        let recording = rig.record_to_file(Path::new("a.f32"), 300).unwrap();
        assert_eq!(recording.path, dir.path().join("runs/a.f32"));
        assert_eq!(recording.read.actual, 300);
        assert!(recording.procedure.warnings.is_empty());
        assert_eq!(
            recording.procedure.step_names(),
            vec!["settle", "purge", "open file", "acquire", "close file"]
        );

        let samples = read_packet_file(&recording.path, 5).unwrap();
        assert_eq!(samples.len(), 300 * 5);
    }

    #[test]
    fn test_short_recording_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.simulator.total_packets = Some(40);
        config.session.acquisition.max_polls = Some(20);
        let (mut rig, _handle) = rig_with(config, FaultPlan::none());
        rig.bring_up().unwrap();

        let recording = rig
            .record_to_file(&dir.path().join("short.f32"), 100)
            .unwrap();
        assert_eq!(recording.read.actual, 40);
        assert_eq!(recording.procedure.warnings.len(), 1);
        assert!(recording.procedure.warnings[0].contains("only 40"));
    }

    #[test]
    fn test_link_loss_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lost.f32");
        let (mut rig, _handle) = rig_with(
            AppConfig::default(),
            FaultPlan::scenario(FaultScenario::LinkLossAfter {
                operation: Operation::Read,
                count: 2,
            }),
        );
        rig.bring_up().unwrap();

        let err = rig.record_to_file(&path, 1000).unwrap_err();
        assert!(format!("{:#}", err).contains("acquire failed"));
        assert!(!rig.session().is_connected());

        let samples = read_packet_file(&path, 5).unwrap();
        assert_eq!(samples.len(), 2 * 25 * 5);
    }

    #[tokio::test]
    async fn test_stream_hands_rig_back() {
        let (mut rig, _handle) = rig();
        rig.bring_up().unwrap();

        let worker = WorkerConfig {
            batch_packets: 50,
            max_batches: Some(4),
            ..Default::default()
        };
        let (mut rig, summary) = rig.stream(worker).await.unwrap();

        assert_eq!(summary.batches, 4);
        assert_eq!(summary.packets, 200);
        assert!(summary.error.is_none());
        // Channel 1 of packet k is k + 0.1; mean over k = 0..200.
        assert!((summary.channel_means[1] - 99.6).abs() < 1e-3);

        assert!(rig.session().is_connected());
        rig.shutdown().unwrap();
    }
}
