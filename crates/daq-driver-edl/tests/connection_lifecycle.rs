//! Connection lifecycle against the simulated amplifier.
//!
//! Covers detection, the connect sequence and the error each failing step
//! maps to, disconnect retries, and what a session refuses to do while it
//! is not connected.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_detect_devices` | Enumeration with one or no devices |
//! | `test_connect_configures_link` | Link parameters and probe frame |
//! | `test_connect_step_failures` | Each failing step maps to its own code |
//! | `test_expired_device` | Expired licence closes the link |
//! | `test_already_connected` | Second connect and detect are refused |
//! | `test_disconnect_retries_busy_close` | Busy close is retried |
//! | `test_disconnect_gives_up` | Exhausted retries keep the session |
//! | `test_operations_require_connection` | Nothing is written while disconnected |
//! | `test_reconnect_resets_state` | A new session starts clean |
//! | `test_drop_closes_link` | Dropping a session closes the device |

mod common;

use std::time::Duration;

use common::{connected, connected_with, disconnected_with, DEVICE};
use daq_driver_edl::command::{CurrentRange, RadioSelection};
use daq_driver_edl::mock::{FaultPlan, FaultScenario, Operation, SimulatorConfig};
use daq_driver_edl::*;

// =============================================================================
// Detection
// =============================================================================

/// Detection lists the simulator's devices, or reports none.
#[test]
fn test_detect_devices() {
    let (mut session, _handle) = disconnected_with(
        SimulatorConfig::default(),
        FaultPlan::none(),
        SessionConfig::default(),
    );
    assert_eq!(session.detect_devices().unwrap(), vec![DEVICE.to_string()]);

    let empty = SimulatorConfig {
        devices: Vec::new(),
        ..Default::default()
    };
    let (mut session, _handle) =
        disconnected_with(empty, FaultPlan::none(), SessionConfig::default());
    let err = session.detect_devices().unwrap_err();
    assert!(matches!(err, EdlError::NoDevices));
    assert_eq!(err.code(), 0x0001);

    let (mut session, _handle) = disconnected_with(
        SimulatorConfig::default(),
        FaultPlan::scenario(FaultScenario::Fail {
            operation: Operation::Enumerate,
        }),
        SessionConfig::default(),
    );
    assert!(matches!(
        session.detect_devices().unwrap_err(),
        EdlError::NoDevices
    ));
}

// =============================================================================
// Connect
// =============================================================================

/// Connecting applies the configured link settings and writes one probe.
#[test]
fn test_connect_configures_link() {
    let mut config = SessionConfig::default();
    config.connection.latency_ms = 3;
    config.connection.in_transfer_size = 8192;

    let (session, handle) = connected_with(SimulatorConfig::default(), FaultPlan::none(), config);

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.device().unwrap().device, DEVICE);

    let params = handle.link_params();
    assert_eq!(params.latency, Duration::from_millis(3));
    assert_eq!(params.in_transfer_size, 8192);
    assert_eq!(
        params.read_timeout,
        Duration::from_millis(session.config().connection.read_timeout_ms)
    );

    assert_eq!(handle.probes(), 1);
    assert_eq!(handle.write_count(), 1);
    assert!(handle.batches().is_empty());
}

/// Every connect step has its own error, and a failed connect leaves the
/// link closed.
#[test]
fn test_connect_step_failures() {
    let cases = [
        (Operation::Open, 0x0101),
        (Operation::SetLatency, 0x0103),
        (Operation::SetUsbParameters, 0x0104),
        (Operation::SetTransferSize, 0x0105),
        (Operation::Purge, 0x0106),
        (Operation::Write, 0x0107),
    ];

    for (operation, code) in cases {
        let (mut session, handle) = disconnected_with(
            SimulatorConfig::default(),
            FaultPlan::scenario(FaultScenario::Fail { operation }),
            SessionConfig::default(),
        );

        let err = session.connect(DEVICE).unwrap_err();
        assert_eq!(err.code(), code, "{:?} failure gave {}", operation, err);
        assert_eq!(err.family(), ErrorFamily::Connection);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.device().is_none());
        assert!(!handle.is_open(), "{:?} failure left the link open", operation);
    }
}

/// Opening an unknown serial fails as a connection error.
#[test]
fn test_connect_unknown_device() {
    let (mut session, handle) = disconnected_with(
        SimulatorConfig::default(),
        FaultPlan::none(),
        SessionConfig::default(),
    );
    let err = session.connect("E4-NOPE").unwrap_err();
    assert!(matches!(err, EdlError::DeviceConnection { ref device, .. } if device == "E4-NOPE"));
    assert!(!handle.is_open());
}

/// An expired device is closed again and reported as expired.
#[test]
fn test_expired_device() {
    let sim = SimulatorConfig {
        expired: vec![DEVICE.to_string()],
        ..Default::default()
    };
    let (mut session, handle) =
        disconnected_with(sim, FaultPlan::none(), SessionConfig::default());

    let err = session.connect(DEVICE).unwrap_err();
    assert!(matches!(err, EdlError::DeviceExpired { .. }));
    assert_eq!(err.code(), 0x0003);
    assert!(!session.is_connected());
    assert!(!handle.is_open());
    assert_eq!(handle.probes(), 0);
}

/// A connected session refuses a second connect and further detection.
#[test]
fn test_already_connected() {
    let (mut session, handle) = connected(SimulatorConfig::default());

    let err = session.connect(DEVICE).unwrap_err();
    assert_eq!(err.code(), 0x0102);
    let err = session.detect_devices().unwrap_err();
    assert!(matches!(err, EdlError::DeviceAlreadyConnected { .. }));

    assert!(session.is_connected());
    assert!(handle.is_open());
    assert_eq!(handle.probes(), 1);
}

// =============================================================================
// Disconnect
// =============================================================================

/// A busy close is retried until it goes through.
#[test]
fn test_disconnect_retries_busy_close() {
    let (mut session, handle) = connected_with(
        SimulatorConfig::default(),
        FaultPlan::scenario(FaultScenario::Busy {
            operation: Operation::Close,
            times: 5,
        }),
        SessionConfig::default(),
    );

    session.disconnect().unwrap();
    assert_eq!(handle.close_attempts(), 6);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!handle.is_open());
}

/// When every close attempt fails the session stays connected.
#[test]
fn test_disconnect_gives_up() {
    let mut config = SessionConfig::default();
    config.connection.disconnect_attempts = 3;

    let (mut session, handle) = connected_with(
        SimulatorConfig::default(),
        FaultPlan::scenario(FaultScenario::Busy {
            operation: Operation::Close,
            times: 10,
        }),
        config,
    );

    let err = session.disconnect().unwrap_err();
    assert!(matches!(err, EdlError::DeviceDisconnection { attempts: 3, .. }));
    assert_eq!(err.code(), 0x0108);
    assert_eq!(handle.close_attempts(), 3);
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(handle.is_open());
}

// =============================================================================
// Connection gating
// =============================================================================

/// Every device operation fails with `DeviceNotConnected` and writes nothing.
#[test]
fn test_operations_require_connection() {
    let (mut session, handle) = disconnected_with(
        SimulatorConfig::default(),
        FaultPlan::none(),
        SessionConfig::default(),
    );
    let range = RadioSelection::Range(CurrentRange::Range2nA);

    let results = [
        session
            .set_command(CommandId::Range, &CommandConfig::radio(1), true)
            .map(|_| ()),
        session
            .set_command_raw(99, &CommandConfig::radio(1), false)
            .map(|_| ()),
        session.stage(StagedCommand::Radio(range)).map(|_| ()),
        session.send(ImmediateCommand::Radio(range)).map(|_| ()),
        session.apply_protocol().map(|_| ()),
        session.device_status().map(|_| ()),
        session.read_data(10).map(|_| ()),
        session.purge_data(),
        session.disconnect(),
    ];

    for result in results {
        assert!(result.unwrap_err().is_not_connected());
    }
    assert_eq!(handle.write_count(), 0);
    assert!(session.staged().is_empty());
}

/// Reconnecting after a disconnect starts with nothing staged or applied.
#[test]
fn test_reconnect_resets_state() {
    let (mut session, handle) = connected(SimulatorConfig::default());
    session
        .stage(StagedCommand::Value(ValueCommand::Vhold, -40.0))
        .unwrap();
    session
        .send(ImmediateCommand::Radio(RadioSelection::Range(
            CurrentRange::Range20nA,
        )))
        .unwrap();
    assert_eq!(session.settings().range, Some(CurrentRange::Range20nA));
    assert_eq!(session.applied_protocol().get(CommandId::Vhold), Some(-40.0));

    session.disconnect().unwrap();
    session.connect(DEVICE).unwrap();

    assert!(session.staged().is_empty());
    assert!(session.applied_protocol().is_empty());
    assert_eq!(session.settings(), DeviceSettings::default());
    assert_eq!(handle.probes(), 2);
}

/// Dropping a connected session closes the device.
#[test]
fn test_drop_closes_link() {
    let (session, handle) = connected(SimulatorConfig::default());
    assert!(handle.is_open());
    drop(session);
    assert!(!handle.is_open());
}
