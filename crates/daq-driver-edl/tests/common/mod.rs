//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use daq_driver_edl::mock::{FaultPlan, SimulatedDevice, SimulatorConfig, SimulatorHandle};
use daq_driver_edl::{EdlSession, NoPause, SessionConfig};

pub const DEVICE: &str = "E4-SIM-0";

/// A session connected to a simulator with the given settings.
pub fn connected_with(
    sim: SimulatorConfig,
    faults: FaultPlan,
    config: SessionConfig,
) -> (EdlSession<SimulatedDevice>, SimulatorHandle) {
    let (mut session, handle) = disconnected_with(sim, faults, config);
    session.connect(DEVICE).expect("connect to simulator");
    (session, handle)
}

pub fn connected(sim: SimulatorConfig) -> (EdlSession<SimulatedDevice>, SimulatorHandle) {
    connected_with(sim, FaultPlan::none(), SessionConfig::default())
}

pub fn disconnected_with(
    sim: SimulatorConfig,
    faults: FaultPlan,
    config: SessionConfig,
) -> (EdlSession<SimulatedDevice>, SimulatorHandle) {
    let device = SimulatedDevice::with_faults(sim, faults);
    let handle = device.handle();
    let session = EdlSession::new(device, config).with_pacer(NoPause);
    (session, handle)
}

/// Simulator with no background production; packets come from `push_packets`.
pub fn quiet() -> SimulatorConfig {
    SimulatorConfig {
        packets_per_poll: 0,
        ..Default::default()
    }
}

/// Value the simulator puts on current channel `c` of packet `k`.
pub fn expected(k: u64, c: usize) -> f32 {
    k as f32 + c as f32 / 10.0
}

/// Assert `samples` hold packets `first..` in order, current channels only.
pub fn assert_sequence(samples: &[f32], channels: usize, first: u64) {
    assert_eq!(samples.len() % channels, 0, "partial packet in output");
    for (i, packet) in samples.chunks(channels).enumerate() {
        let k = first + i as u64;
        for (c, value) in packet.iter().enumerate().skip(1) {
            assert_eq!(*value, expected(k, c), "packet {} channel {}", k, c);
        }
    }
}
