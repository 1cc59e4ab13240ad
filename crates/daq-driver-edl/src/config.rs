//! Session configuration.
//!
//! All sections deserialize from TOML with defaults for every field, so a
//! host application can embed them in its own configuration file:
//!
//! ```toml
//! [connection]
//! latency_ms = 2
//! disconnect_attempts = 1000
//!
//! [acquisition]
//! channels = 5
//! min_batch_packets = 10
//! poll_interval_ms = 1
//! max_polls = 1000
//!
//! [limits]
//! voltage_mv = 500.0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Channel count of the E4 amplifier: one voltage, four currents.
pub const DEFAULT_CHANNELS: usize = 5;

/// Top-level configuration for an [`EdlSession`](crate::session::EdlSession).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Link setup and teardown
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Read loop and packet layout
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Bounds checked before a protocol is written
    #[serde(default)]
    pub limits: ProtocolLimits,
}

impl SessionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.acquisition.channels < 2 {
            return Err(format!(
                "At least 2 channels are required (got {})",
                self.acquisition.channels
            ));
        }
        if self.acquisition.min_batch_packets == 0 {
            return Err("min_batch_packets must be greater than 0".to_string());
        }
        if self.acquisition.max_polls.is_none() && self.acquisition.timeout_ms.is_none() {
            return Err("Either max_polls or timeout_ms must bound the read loop".to_string());
        }
        if self.connection.disconnect_attempts == 0 {
            return Err("disconnect_attempts must be greater than 0".to_string());
        }
        if self.limits.voltage_mv <= 0.0 || self.limits.offset_mv <= 0.0 {
            return Err("Voltage limits must be positive".to_string());
        }
        Ok(())
    }
}

/// Link setup and teardown parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// USB latency timer in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Read timeout set on the link in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout set on the link in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    /// USB IN transfer size in bytes
    #[serde(default = "default_transfer_size")]
    pub in_transfer_size: u32,
    /// USB OUT transfer size in bytes
    #[serde(default = "default_transfer_size")]
    pub out_transfer_size: u32,
    /// Close attempts before giving up on disconnect
    #[serde(default = "default_disconnect_attempts")]
    pub disconnect_attempts: u32,
    /// Pause between close attempts in milliseconds
    #[serde(default = "default_disconnect_backoff_ms")]
    pub disconnect_backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            in_transfer_size: default_transfer_size(),
            out_transfer_size: default_transfer_size(),
            disconnect_attempts: default_disconnect_attempts(),
            disconnect_backoff_ms: default_disconnect_backoff_ms(),
        }
    }
}

impl ConnectionConfig {
    /// USB latency timer as a duration.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Pause between close attempts.
    pub fn disconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.disconnect_backoff_ms)
    }
}

/// Acquisition loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Values per packet (voltage channel first)
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Packets that must be queued before a pull is worth the transport call
    #[serde(default = "default_min_batch_packets")]
    pub min_batch_packets: usize,
    /// Pause between status polls when too little is queued
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Status polls per read call
    #[serde(default = "default_max_polls")]
    pub max_polls: Option<u32>,
    /// Wall-clock bound per read call
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Consecutive empty transport reads tolerated while pulling a chunk
    #[serde(default = "default_stalled_reads")]
    pub stalled_reads: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            min_batch_packets: default_min_batch_packets(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            timeout_ms: None,
            stalled_reads: default_stalled_reads(),
        }
    }
}

impl AcquisitionConfig {
    /// Bytes in one packet on the wire (little-endian `f32` per channel).
    pub fn packet_bytes(&self) -> usize {
        self.channels * std::mem::size_of::<f32>()
    }

    /// Sleep between status polls that find too little data.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Device validity limits for protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolLimits {
    /// Largest absolute command voltage in mV
    #[serde(default = "default_voltage_mv")]
    pub voltage_mv: f64,
    /// Largest absolute per-channel offset in mV
    #[serde(default = "default_offset_mv")]
    pub offset_mv: f64,
    /// Longest duration parameter in ms
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: f64,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            voltage_mv: default_voltage_mv(),
            offset_mv: default_offset_mv(),
            max_duration_ms: default_max_duration_ms(),
        }
    }
}

fn default_latency_ms() -> u64 {
    2
}

fn default_io_timeout_ms() -> u64 {
    100
}

fn default_transfer_size() -> u32 {
    65536
}

fn default_disconnect_attempts() -> u32 {
    1000
}

fn default_disconnect_backoff_ms() -> u64 {
    1
}

fn default_channels() -> usize {
    DEFAULT_CHANNELS
}

fn default_min_batch_packets() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_max_polls() -> Option<u32> {
    Some(1000)
}

fn default_stalled_reads() -> u32 {
    16
}

fn default_voltage_mv() -> f64 {
    500.0
}

fn default_offset_mv() -> f64 {
    100.0
}

fn default_max_duration_ms() -> f64 {
    60_000.0
}
