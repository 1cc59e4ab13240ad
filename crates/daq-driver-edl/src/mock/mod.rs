//! Simulated E4 hardware.
//!
//! Used by the tests and by the command-line tool when no amplifier is
//! attached. Behaviour is configured with [`SimulatorConfig`] and failures
//! are scripted with a [`FaultPlan`].

pub mod faults;
pub mod rng;
pub mod simulator;

pub use faults::{FaultPlan, FaultScenario, Operation};
pub use rng::SimRng;
pub use simulator::{LinkParams, SimulatedDevice, SimulatorConfig, SimulatorHandle};
