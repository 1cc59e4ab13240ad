//! Host procedures for an E4 amplifier
//!
//! A [`Rig`] owns one driver session and runs the bench routines an
//! experimenter strings together:
//!
//! ```text
//!   bring_up ─▶ configure_working_modality ─▶ compensate_digital_offset
//!                                                     │
//!   shutdown ◀── record_to_file / stream ◀── set_triangular_potential
//! ```
//!
//! Each routine returns a [`ProcedureReport`] and turns driver errors into
//! `anyhow` errors naming the step that failed.
//!
//! # Example
//!
//! ```no_run
//! use edl_daq::config::AppConfig;
//! use edl_daq::procedures::Rig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let (mut rig, _sim) = Rig::simulated(&config);
//! rig.bring_up()?;
//! rig.configure_working_modality(Default::default())?;
//! rig.set_triangular_potential(Default::default())?;
//! let recording = rig.record_to_file("run.f32".as_ref(), 5_000)?;
//! println!("{}", recording.procedure);
//! rig.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod modality;
pub mod recording;
pub mod report;

use std::time::Duration;

use anyhow::{Context, Result};
use daq_driver_edl::mock::{SimulatedDevice, SimulatorHandle};
use daq_driver_edl::{EdlSession, Pacer, ThreadSleep, Transport};
use tracing::info;

use crate::config::AppConfig;

pub use modality::{TriangularWave, WorkingModality};
pub use recording::{Recording, StreamSummary};
pub use report::{ProcedureReport, StepRecord};

/// One amplifier and the settings the procedures run with.
pub struct Rig<T: Transport> {
    session: EdlSession<T>,
    config: AppConfig,
    pacer: Box<dyn Pacer>,
}

impl Rig<SimulatedDevice> {
    /// A rig on the simulator described by `config`.
    pub fn simulated(config: &AppConfig) -> (Self, SimulatorHandle) {
        let device = SimulatedDevice::new(config.simulator.clone());
        let handle = device.handle();
        let session = EdlSession::new(device, config.session.clone());
        (Self::new(session, config.clone()), handle)
    }
}

impl<T: Transport> Rig<T> {
    /// Rig around a session, paced by a real sleep.
    pub fn new(session: EdlSession<T>, config: AppConfig) -> Self {
        Self {
            session,
            config,
            pacer: Box::new(ThreadSleep),
        }
    }

    /// Replace how procedure waits (compensation hold, settle) are spent.
    pub fn with_pacer(mut self, pacer: impl Pacer + 'static) -> Self {
        self.pacer = Box::new(pacer);
        self
    }

    /// The driver session.
    pub fn session(&self) -> &EdlSession<T> {
        &self.session
    }

    /// The driver session, mutably.
    pub fn session_mut(&mut self) -> &mut EdlSession<T> {
        &mut self.session
    }

    /// Application configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Give the session back.
    pub fn into_session(self) -> EdlSession<T> {
        self.session
    }

    /// Detect devices, connect to the first one and purge stale data.
    pub fn bring_up(&mut self) -> Result<ProcedureReport> {
        let mut report = ProcedureReport::new("bring-up");

        let devices = report.step("detect devices", || {
            Ok(self.session.detect_devices()?)
        })?;
        report.detail(devices.join(", "));

        let device = devices
            .first()
            .cloned()
            .context("device list was empty")?;
        let link = report.step("connect", || Ok(self.session.connect(&device)?))?;
        report.detail(format!("{} ({})", link.device, link.description));

        report.step("purge", || Ok(self.session.purge_data()?))?;

        info!(device = %device, "Rig is up");
        Ok(report.finish())
    }

    /// Close the session; the driver retries a busy close.
    ///
    /// Succeeds without doing anything when no device is connected.
    pub fn shutdown(&mut self) -> Result<ProcedureReport> {
        let mut report = ProcedureReport::new("shutdown");
        if !self.session.is_connected() {
            report.warn("no device connected");
            return Ok(report.finish());
        }

        report.step("disconnect", || Ok(self.session.disconnect()?))?;
        Ok(report.finish())
    }

    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            self.pacer.pause(duration);
        }
    }
}
