//! Amplifier set-up routines: working modality, offset compensation and the
//! holding potential.

use anyhow::Result;
use daq_driver_edl::command::{
    CurrentRange, FinalBandwidth, SamplingRate, BUTTON_PRESSED, BUTTON_RELEASED,
};
use daq_driver_edl::{
    ButtonCommand, ImmediateCommand, RadioSelection, StagedCommand, Transport, ValueCommand,
};
use serde::{Deserialize, Serialize};

use super::{ProcedureReport, Rig};

/// Sampling rate, current range and final bandwidth, committed together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkingModality {
    /// Sampling rate
    pub sampling_rate: SamplingRate,
    /// Current range
    pub range: CurrentRange,
    /// Final bandwidth
    pub bandwidth: FinalBandwidth,
}

impl Default for WorkingModality {
    /// 5 kHz, 200 pA, filters off (bandwidth at half the sampling rate).
    fn default() -> Self {
        Self {
            sampling_rate: SamplingRate::Khz5,
            range: CurrentRange::Range200pA,
            bandwidth: FinalBandwidth::SrHalf,
        }
    }
}

/// Triangular voltage protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriangularWave {
    /// Centre of the wave in mV
    pub vhold_mv: f64,
    /// Half the peak-to-peak swing in mV
    pub vamp_mv: f64,
    /// Period of one triangle in ms
    pub period_ms: f64,
}

impl Default for TriangularWave {
    fn default() -> Self {
        Self {
            vhold_mv: 0.0,
            vamp_mv: 50.0,
            period_ms: 100.0,
        }
    }
}

const CONSTANT_PROTOCOL: f64 = 0.0;
const TRIANGULAR_PROTOCOL: f64 = 1.0;

impl<T: Transport> Rig<T> {
    /// Stage sampling rate and range, then send the bandwidth with them in
    /// a single write.
    pub fn configure_working_modality(
        &mut self,
        modality: WorkingModality,
    ) -> Result<ProcedureReport> {
        let mut report = ProcedureReport::new("configure working modality");

        report.step("stage sampling rate", || {
            self.session.stage(StagedCommand::Radio(RadioSelection::SamplingRate(
                modality.sampling_rate,
            )))?;
            Ok(())
        })?;
        report.step("stage current range", || {
            self.session
                .stage(StagedCommand::Radio(RadioSelection::Range(modality.range)))?;
            Ok(())
        })?;
        let commit = report.step("send final bandwidth", || {
            Ok(self.session.send(ImmediateCommand::Radio(
                RadioSelection::FinalBandwidth(modality.bandwidth),
            ))?)
        })?;
        let cutoff = self
            .session
            .settings()
            .cutoff_hz()
            .map(|hz| format!(", cut-off {:.0} Hz", hz))
            .unwrap_or_default();
        report.detail(format!(
            "{} commands in one write{}",
            commit.commands.len(),
            cutoff
        ));

        Ok(report.finish())
    }

    /// Hold the amplifier at 0 mV and run the digital offset compensation.
    ///
    /// CompAll is pressed, held for `procedures.compensation_hold`, then
    /// released.
    pub fn compensate_digital_offset(&mut self) -> Result<ProcedureReport> {
        let mut report = ProcedureReport::new("compensate digital offset");
        let hold = self.config.procedures.compensation_hold;

        report.step("apply constant protocol at 0 mV", || {
            self.session.stage(StagedCommand::Value(
                ValueCommand::MainTrial,
                CONSTANT_PROTOCOL,
            ))?;
            self.session
                .stage(StagedCommand::Value(ValueCommand::Vhold, 0.0))?;
            Ok(self.session.apply_protocol()?)
        })?;

        report.step("press CompAll", || {
            Ok(self.session.send(ImmediateCommand::Button(
                ButtonCommand::CompAll,
                BUTTON_PRESSED,
            ))?)
        })?;

        report.step("hold", || {
            self.pause(hold);
            Ok(())
        })?;

        report.step("release CompAll", || {
            Ok(self.session.send(ImmediateCommand::Button(
                ButtonCommand::CompAll,
                BUTTON_RELEASED,
            ))?)
        })?;

        Ok(report.finish())
    }

    /// Apply a triangular voltage protocol.
    pub fn set_triangular_potential(&mut self, wave: TriangularWave) -> Result<ProcedureReport> {
        let mut report = ProcedureReport::new("set triangular potential");

        report.step("stage protocol values", || {
            for (command, value) in [
                (ValueCommand::MainTrial, TRIANGULAR_PROTOCOL),
                (ValueCommand::Vhold, wave.vhold_mv),
                (ValueCommand::Vamp, wave.vamp_mv),
                (ValueCommand::TPeriod, wave.period_ms),
            ] {
                self.session.stage(StagedCommand::Value(command, value))?;
            }
            Ok(())
        })?;

        let commit = report.step("apply protocol", || Ok(self.session.apply_protocol()?))?;
        if let Some(protocol) = commit.protocol {
            report.detail(format!("{} protocol running", protocol));
        }

        Ok(report.finish())
    }
}
