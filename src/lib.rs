//! # EDL DAQ
//!
//! Host application for E4 electrophysiology amplifiers. The device protocol
//! lives in the `daq-driver-edl` crate; this crate wraps it into the
//! routines a bench operator runs, with configuration and logging around
//! them.
//!
//! ## Crate Structure
//!
//! - **`config`**: `AppConfig`, loaded from TOML and `EDL_DAQ_*` environment
//!   variables with Figment, embedding the driver's `SessionConfig` and the
//!   simulator settings.
//! - **`logging`**: installs the `tracing-subscriber` stack (env filter plus
//!   pretty, compact or JSON output).
//! - **`procedures`**: the `Rig` and its routines: bring-up, working
//!   modality, offset compensation, triangular potential, recording,
//!   streaming and shutdown.

pub mod config;
pub mod logging;
pub mod procedures;

pub use daq_driver_edl as driver;
