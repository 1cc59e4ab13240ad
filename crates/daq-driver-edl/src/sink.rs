//! Destinations for acquired packets.
//!
//! The recording format is the raw packet stream: little-endian `f32`
//! values, one per channel, packets in acquisition order, no header.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info};

use crate::error::{EdlError, Result};

/// Receives packets from a read.
pub trait PacketSink {
    /// Take `samples.len() / channels` whole packets.
    fn accept(&mut self, samples: &[f32], channels: usize) -> Result<()>;

    /// Make accepted packets durable.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush and release the sink. Later `accept` calls fail.
    fn finalize(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Collects samples in memory.
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    samples: Vec<f32>,
}

impl VecSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty sink with room for `values` samples.
    pub fn with_capacity(values: usize) -> Self {
        Self {
            samples: Vec::with_capacity(values),
        }
    }

    /// Samples collected so far, channel-major per packet.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Take the collected samples.
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

impl PacketSink for VecSink {
    fn accept(&mut self, samples: &[f32], _channels: usize) -> Result<()> {
        self.samples.extend_from_slice(samples);
        Ok(())
    }
}

/// Writes packets to a recording file.
///
/// The file is closed by [`finalize`](PacketSink::finalize), including when
/// a read fails because the device went away.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    scratch: BytesMut,
    packets: u64,
}

impl FileSink {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        debug!(path = %path.display(), "Opened recording file");
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            scratch: BytesMut::new(),
            packets: 0,
        })
    }

    /// Path of the recording file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole packets written so far.
    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    /// Whether the file has been finalized.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl PacketSink for FileSink {
    fn accept(&mut self, samples: &[f32], channels: usize) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(closed)?;

        self.scratch.clear();
        self.scratch.reserve(samples.len() * 4);
        for value in samples {
            self.scratch.put_f32_le(*value);
        }
        writer.write_all(&self.scratch)?;

        if channels > 0 {
            self.packets += (samples.len() / channels) as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                path = %self.path.display(),
                packets = self.packets,
                "Closed recording file"
            );
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::error!("Error closing recording file on drop: {}", e);
        }
    }
}

fn closed() -> EdlError {
    EdlError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "recording file is closed",
    ))
}

/// Load a recording written by [`FileSink`].
pub fn read_packet_file(path: impl AsRef<Path>, channels: usize) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    let packet_bytes = channels * 4;
    if packet_bytes == 0 || bytes.len() % packet_bytes != 0 {
        return Err(EdlError::MisalignedFrame {
            len: bytes.len() / 4,
            channels,
        });
    }

    let mut data = bytes.as_slice();
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while data.has_remaining() {
        samples.push(data.get_f32_le());
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_layout_is_le_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.bin");
        let mut sink = FileSink::create(&path).unwrap();
        sink.accept(&[1.5, -2.0, 0.25, 3.0, 4.0], 5).unwrap();
        sink.finalize().unwrap();
        assert!(sink.is_closed());
        assert_eq!(sink.packets_written(), 1);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-2.0f32).to_le_bytes());

        let samples = read_packet_file(&path, 5).unwrap();
        assert_eq!(samples, vec![1.5, -2.0, 0.25, 3.0, 4.0]);
    }

    #[test]
    fn test_closed_sink_rejects_packets() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path().join("rec.bin")).unwrap();
        sink.finalize().unwrap();
        assert!(matches!(
            sink.accept(&[0.0; 5], 5).unwrap_err(),
            EdlError::Io(_)
        ));
        sink.finalize().unwrap();
    }

    #[test]
    fn test_misaligned_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 24]).unwrap();
        let err = read_packet_file(&path, 5).unwrap_err();
        assert!(matches!(err, EdlError::MisalignedFrame { len: 6, channels: 5 }));
    }
}
