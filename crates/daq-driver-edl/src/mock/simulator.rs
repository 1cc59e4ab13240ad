//! In-process E4 device simulator.
//!
//! [`SimulatedDevice`] implements [`Transport`] over shared state that a
//! [`SimulatorHandle`] can inspect and poke from the test (or CLI) side:
//! every write is decoded and logged, samples are produced on each status
//! query, and the sticky flags can be raised on demand.
//!
//! Produced packets are deterministic when noise is off:
//!
//! - channel 0 is the command voltage of the applied protocol (holding
//!   voltage, or the triangular wave once a triangular protocol is applied)
//! - channel `c >= 1` of packet `k` is `k + c / 10`
//!
//! so tests can check packet order and channel layout exactly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::faults::{FaultPlan, FaultScenario, Operation};
use super::rng::SimRng;
use crate::codec::{self, Frame};
use crate::command::{Command, CommandId, Payload, SamplingRate};
use crate::config::DEFAULT_CHANNELS;
use crate::transport::{DeviceId, LinkInfo, QueueStatus, Transport, TransportError, TransportResult};

/// Simulator behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Serial numbers reported by enumeration
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceId>,
    /// Devices whose licence has expired
    #[serde(default)]
    pub expired: Vec<DeviceId>,
    /// Channels per packet
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Packets produced per status query
    #[serde(default = "default_packets_per_poll")]
    pub packets_per_poll: usize,
    /// Stop producing after this many packets
    #[serde(default)]
    pub total_packets: Option<u64>,
    /// Device queue size; older packets are dropped beyond it
    #[serde(default = "default_capacity_packets")]
    pub capacity_packets: usize,
    /// Largest number of bytes a single read returns
    #[serde(default)]
    pub max_read_bytes: Option<usize>,
    /// Uniform noise amplitude added to current channels
    #[serde(default)]
    pub noise: f32,
    /// Noise seed; `None` seeds from entropy
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            expired: Vec::new(),
            channels: default_channels(),
            packets_per_poll: default_packets_per_poll(),
            total_packets: None,
            capacity_packets: default_capacity_packets(),
            max_read_bytes: None,
            noise: 0.0,
            seed: None,
        }
    }
}

fn default_devices() -> Vec<DeviceId> {
    vec!["E4-SIM-0".to_string()]
}

fn default_channels() -> usize {
    DEFAULT_CHANNELS
}

fn default_packets_per_poll() -> usize {
    25
}

fn default_capacity_packets() -> usize {
    16_384
}

/// Link parameters the host configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkParams {
    /// USB latency timer
    pub latency: Duration,
    /// Link read timeout
    pub read_timeout: Duration,
    /// Link write timeout
    pub write_timeout: Duration,
    /// USB IN transfer size in bytes
    pub in_transfer_size: u32,
    /// USB OUT transfer size in bytes
    pub out_transfer_size: u32,
}

#[derive(Debug)]
struct SimState {
    config: SimulatorConfig,
    faults: FaultPlan,
    rng: SimRng,
    open: Option<DeviceId>,
    params: LinkParams,
    queue: BytesMut,
    produced: u64,
    overflow: bool,
    lost_data: bool,
    writes: Vec<Bytes>,
    batches: Vec<Vec<Command>>,
    probes: usize,
    close_attempts: u32,
    /// Values received since the last apply.
    pending_values: BTreeMap<CommandId, f64>,
    /// Values of the running protocol.
    active_values: BTreeMap<CommandId, f64>,
    sampling_rate: SamplingRate,
}

impl SimState {
    fn new(config: SimulatorConfig, faults: FaultPlan) -> Self {
        let rng = SimRng::new(config.seed);
        Self {
            config,
            faults,
            rng,
            open: None,
            params: LinkParams::default(),
            queue: BytesMut::new(),
            produced: 0,
            overflow: false,
            lost_data: false,
            writes: Vec::new(),
            batches: Vec::new(),
            probes: 0,
            close_attempts: 0,
            pending_values: BTreeMap::new(),
            active_values: BTreeMap::new(),
            sampling_rate: SamplingRate::default(),
        }
    }

    fn packet_bytes(&self) -> usize {
        self.config.channels * 4
    }

    fn require_open(&self) -> TransportResult<()> {
        if self.open.is_some() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn produce(&mut self, packets: usize, bounded: bool) {
        let packets = match (bounded, self.config.total_packets) {
            (true, Some(total)) => packets.min(total.saturating_sub(self.produced) as usize),
            _ => packets,
        };

        for _ in 0..packets {
            let k = self.produced;
            self.queue.put_f32_le(self.command_voltage(k));
            for c in 1..self.config.channels {
                let value = k as f32 + c as f32 / 10.0 + self.rng.noise(self.config.noise);
                self.queue.put_f32_le(value);
            }
            self.produced += 1;
        }

        let packet_bytes = self.packet_bytes();
        let capacity = self.config.capacity_packets * packet_bytes;
        if self.queue.len() > capacity {
            let excess = self.queue.len() - capacity;
            let drop = excess.div_ceil(packet_bytes) * packet_bytes;
            self.queue.advance(drop.min(self.queue.len()));
            self.overflow = true;
            trace!(dropped_bytes = drop, "Simulator queue overflow");
        }
    }

    fn command_voltage(&self, k: u64) -> f32 {
        let get = |id| self.active_values.get(&id).copied().unwrap_or(0.0);
        let vhold = get(CommandId::Vhold);

        if get(CommandId::MainTrial) == 1.0 {
            let period_ms = get(CommandId::TPeriod);
            if period_ms > 0.0 {
                let t_ms = k as f64 * 1000.0 / self.sampling_rate.hz();
                let phase = (t_ms % period_ms) / period_ms;
                let tri = 1.0 - 4.0 * (phase - 0.5).abs();
                return (vhold + get(CommandId::Vamp) * tri) as f32;
            }
        }
        vhold as f32
    }

    fn apply(&mut self, commands: &[Command]) {
        for command in commands {
            match (command.id, command.payload) {
                (CommandId::SamplingRate, Payload::Radio(idx)) => {
                    if let Some(rate) = SamplingRate::from_radio_id(idx) {
                        self.sampling_rate = rate;
                    }
                }
                (CommandId::ApplyProtocol, Payload::Button(true)) => {
                    self.active_values
                        .extend(std::mem::take(&mut self.pending_values));
                }
                (id, Payload::Value(v)) => {
                    self.pending_values.insert(id, v);
                }
                _ => {}
            }
        }
    }
}

/// Simulated amplifier behind a [`Transport`].
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// A fault-free simulator.
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_faults(config, FaultPlan::none())
    }

    /// A simulator that consults `faults` before every operation.
    pub fn with_faults(config: SimulatorConfig, faults: FaultPlan) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config, faults))),
        }
    }

    /// Handle for inspecting and driving the simulator.
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for SimulatedDevice {
    fn enumerate(&mut self) -> TransportResult<Vec<DeviceId>> {
        let mut state = self.state.lock();
        state.faults.check(Operation::Enumerate)?;
        Ok(state.config.devices.clone())
    }

    fn open(&mut self, device: &str) -> TransportResult<LinkInfo> {
        let mut state = self.state.lock();
        state.faults.check(Operation::Open)?;
        if state.open.is_some() {
            return Err(TransportError::Busy);
        }
        if !state.config.devices.iter().any(|d| d == device) {
            return Err(TransportError::NotFound(device.to_string()));
        }

        state.open = Some(device.to_string());
        state.queue.clear();
        state.overflow = false;
        state.lost_data = false;
        state.pending_values.clear();
        state.active_values.clear();
        state.sampling_rate = SamplingRate::default();
        debug!(device, "Simulator opened");

        Ok(LinkInfo {
            device: device.to_string(),
            description: "E4 simulator".to_string(),
            expired: state.config.expired.iter().any(|d| d == device),
        })
    }

    fn set_latency(&mut self, latency: Duration) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.faults.check(Operation::SetLatency)?;
        state.require_open()?;
        state.params.latency = latency;
        Ok(())
    }

    fn set_usb_parameters(
        &mut self,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.faults.check(Operation::SetUsbParameters)?;
        state.require_open()?;
        state.params.read_timeout = read_timeout;
        state.params.write_timeout = write_timeout;
        Ok(())
    }

    fn set_transfer_size(&mut self, in_bytes: u32, out_bytes: u32) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.faults.check(Operation::SetTransferSize)?;
        state.require_open()?;
        state.params.in_transfer_size = in_bytes;
        state.params.out_transfer_size = out_bytes;
        Ok(())
    }

    fn purge(&mut self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.faults.check(Operation::Purge)?;
        state.require_open()?;
        state.queue.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> TransportResult<usize> {
        let mut state = self.state.lock();
        state.faults.check(Operation::Write)?;
        state.require_open()?;

        let frames = codec::decode_frames(data)
            .map_err(|e| TransportError::Io(format!("malformed frames: {}", e)))?;

        let mut commands = Vec::with_capacity(frames.len());
        for frame in frames {
            match frame {
                Frame::Probe => state.probes += 1,
                Frame::Command(c) => commands.push(c),
            }
        }

        state.writes.push(Bytes::copy_from_slice(data));
        if !commands.is_empty() {
            state.apply(&commands);
            trace!(commands = commands.len(), "Simulator received batch");
            state.batches.push(commands);
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut state = self.state.lock();
        state.faults.check(Operation::Read)?;
        state.require_open()?;

        let mut n = buf.len().min(state.queue.len());
        if let Some(max) = state.config.max_read_bytes {
            n = n.min(max);
        }
        state.queue.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }

    fn queue_status(&mut self) -> TransportResult<QueueStatus> {
        let mut state = self.state.lock();
        state.faults.check(Operation::QueueStatus)?;
        state.require_open()?;

        let per_poll = state.config.packets_per_poll;
        state.produce(per_poll, true);

        let status = QueueStatus {
            queued_bytes: state.queue.len(),
            buffer_overflow: state.overflow,
            lost_data: state.lost_data,
        };
        state.overflow = false;
        state.lost_data = false;
        Ok(status)
    }

    fn close(&mut self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.close_attempts += 1;
        state.faults.check(Operation::Close)?;
        if let Some(device) = state.open.take() {
            debug!(device = %device, "Simulator closed");
        }
        Ok(())
    }
}

/// Shared view of a [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    /// Number of transport writes, probes included.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Raw bytes of every write.
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    /// Decoded command batches, one per write that carried commands.
    pub fn batches(&self) -> Vec<Vec<Command>> {
        self.state.lock().batches.clone()
    }

    /// Probe frames received.
    pub fn probes(&self) -> usize {
        self.state.lock().probes
    }

    /// Whether the host has the link open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }

    /// Close calls received, including failed ones.
    pub fn close_attempts(&self) -> u32 {
        self.state.lock().close_attempts
    }

    /// Link parameters from the last connection.
    pub fn link_params(&self) -> LinkParams {
        self.state.lock().params
    }

    /// Packets produced since the simulator was created.
    pub fn produced(&self) -> u64 {
        self.state.lock().produced
    }

    /// Bytes waiting to be read.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Value of a protocol parameter the device is running.
    pub fn active_value(&self, id: CommandId) -> Option<f64> {
        self.state.lock().active_values.get(&id).copied()
    }

    /// Produce `packets` immediately, ignoring `total_packets`.
    pub fn push_packets(&self, packets: usize) {
        self.state.lock().produce(packets, false);
    }

    /// Change how many packets each status query produces.
    pub fn set_packets_per_poll(&self, packets: usize) {
        self.state.lock().config.packets_per_poll = packets;
    }

    /// Raise the overflow flag for the next status query.
    pub fn inject_overflow(&self) {
        self.state.lock().overflow = true;
    }

    /// Raise the lost-data flag for the next status query.
    pub fn inject_lost_data(&self) {
        self.state.lock().lost_data = true;
    }

    /// Add a fault scenario while the device is in use.
    pub fn add_fault(&self, scenario: FaultScenario) {
        self.state.lock().faults.push(scenario);
    }

    /// Replace the fault plan.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandConfig, RadioSelection};

    fn open(config: SimulatorConfig) -> (SimulatedDevice, SimulatorHandle) {
        let mut device = SimulatedDevice::new(config);
        let handle = device.handle();
        device.open("E4-SIM-0").unwrap();
        (device, handle)
    }

    #[test]
    fn test_production_pattern() {
        let (mut device, _handle) = open(SimulatorConfig {
            packets_per_poll: 3,
            ..Default::default()
        });
        let status = device.queue_status().unwrap();
        assert_eq!(status.queued_bytes, 3 * 20);

        let mut buf = vec![0u8; 60];
        assert_eq!(device.read(&mut buf).unwrap(), 60);
        let mut data = &buf[20..40];
        assert_eq!(data.get_f32_le(), 0.0);
        assert_eq!(data.get_f32_le(), 1.1);
        assert_eq!(data.get_f32_le(), 1.2);
    }

    #[test]
    fn test_total_packets_and_short_reads() {
        let (mut device, handle) = open(SimulatorConfig {
            packets_per_poll: 10,
            total_packets: Some(15),
            max_read_bytes: Some(7),
            ..Default::default()
        });
        device.queue_status().unwrap();
        device.queue_status().unwrap();
        device.queue_status().unwrap();
        assert_eq!(handle.produced(), 15);

        let mut buf = vec![0u8; 100];
        assert_eq!(device.read(&mut buf).unwrap(), 7);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let (mut device, handle) = open(SimulatorConfig {
            packets_per_poll: 0,
            capacity_packets: 4,
            ..Default::default()
        });
        handle.push_packets(6);
        let status = device.queue_status().unwrap();
        assert!(status.buffer_overflow);
        assert_eq!(status.queued_bytes, 4 * 20);
        assert!(!device.queue_status().unwrap().buffer_overflow);

        let mut buf = vec![0u8; 8];
        device.read(&mut buf).unwrap();
        let mut data = &buf[4..];
        assert_eq!(data.get_f32_le(), 2.1);
    }

    #[test]
    fn test_writes_are_decoded() {
        let (mut device, handle) = open(SimulatorConfig::default());
        let batch = codec::encode_batch(&[
            RadioSelection::SamplingRate(SamplingRate::Khz5).into(),
            Command::from_config(CommandId::Vhold, &CommandConfig::value(-20.0)).unwrap(),
        ]);
        device.write(&codec::probe_frame()).unwrap();
        device.write(&batch).unwrap();

        assert_eq!(handle.write_count(), 2);
        assert_eq!(handle.probes(), 1);
        assert_eq!(handle.batches().len(), 1);
        assert_eq!(handle.active_value(CommandId::Vhold), None);

        device
            .write(&codec::encode_batch(&[Command::apply_protocol()]))
            .unwrap();
        assert_eq!(handle.active_value(CommandId::Vhold), Some(-20.0));
        assert!(device.write(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_closed_link_reports_disconnect() {
        let (mut device, handle) = open(SimulatorConfig::default());
        device.close().unwrap();
        assert!(!handle.is_open());
        assert_eq!(device.queue_status(), Err(TransportError::Disconnected));
    }
}
