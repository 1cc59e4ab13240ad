//! Stimulation protocols and their validity rules.
//!
//! The `MainTrial` value selects a protocol; the other value commands are
//! its parameters. The device only accepts a parameter set as a whole, so
//! the session validates the effective set (parameters already applied,
//! overridden by the staged ones) before committing anything.
//!
//! | MainTrial | Protocol   | Required parameters                        |
//! |-----------|------------|--------------------------------------------|
//! | 0         | Constant   | Vhold                                      |
//! | 1         | Triangular | Vhold, Vamp, TPeriod                       |
//! | 2         | Pulse      | Vhold, Vpulse, Thold, Tpulse, N            |
//! | 3         | Step (I-V) | Vhold, Vmin, Vmax, Vstep, Thold, Tstep, N  |
//! | 4         | Ramp       | Vhold, Vmin, Vmax, Slope, Thold, NR        |

use std::collections::BTreeMap;
use std::fmt;

use crate::command::{Command, CommandId, CommandKind};
use crate::config::ProtocolLimits;
use crate::error::{EdlError, Result};

/// Protocol selected by `MainTrial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialProtocol {
    /// Hold at Vhold.
    Constant,
    /// Triangle wave around Vhold.
    Triangular,
    /// Pulse train from Vhold to Vpulse.
    Pulse,
    /// Voltage steps from Vmin to Vmax (I-V curve).
    Step,
    /// Voltage ramps between Vmin and Vmax.
    Ramp,
}

impl TrialProtocol {
    /// Protocol for a `MainTrial` value; only whole numbers 0 to 4 select one.
    pub fn from_selector(value: f64) -> Option<Self> {
        if value.fract() != 0.0 {
            return None;
        }
        match value as i64 {
            0 => Some(Self::Constant),
            1 => Some(Self::Triangular),
            2 => Some(Self::Pulse),
            3 => Some(Self::Step),
            4 => Some(Self::Ramp),
            _ => None,
        }
    }

    /// `MainTrial` value selecting this protocol.
    pub fn selector(self) -> u32 {
        match self {
            Self::Constant => 0,
            Self::Triangular => 1,
            Self::Pulse => 2,
            Self::Step => 3,
            Self::Ramp => 4,
        }
    }

    /// Parameters the protocol cannot run without.
    pub fn required(self) -> &'static [CommandId] {
        use CommandId::*;
        match self {
            Self::Constant => &[Vhold],
            Self::Triangular => &[Vhold, Vamp, TPeriod],
            Self::Pulse => &[Vhold, Vpulse, Thold, Tpulse, N],
            Self::Step => &[Vhold, Vmin, Vmax, Vstep, Thold, Tstep, N],
            Self::Ramp => &[Vhold, Vmin, Vmax, Slope, Thold, NR],
        }
    }
}

impl fmt::Display for TrialProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Constant => "constant",
            Self::Triangular => "triangular",
            Self::Pulse => "pulse",
            Self::Step => "step",
            Self::Ramp => "ramp",
        };
        write!(f, "{}", label)
    }
}

/// A set of protocol parameter values keyed by command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolParameters {
    values: BTreeMap<CommandId, f64>,
}

impl ProtocolParameters {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one parameter, if set.
    pub fn get(&self, id: CommandId) -> Option<f64> {
        self.values.get(&id).copied()
    }

    /// Set a value command's parameter. Non-value commands are ignored.
    pub fn set(&mut self, command: &Command) {
        if command.kind() != CommandKind::Value {
            return;
        }
        if let Some(value) = command.value() {
            self.values.insert(command.id, value);
        }
    }

    /// Number of parameters set.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// This set overridden by `staged`.
    pub fn merged<'a>(&self, staged: impl IntoIterator<Item = &'a Command>) -> Self {
        let mut merged = self.clone();
        for command in staged {
            merged.set(command);
        }
        merged
    }

    /// The protocol selected by `MainTrial`, if set and valid.
    pub fn protocol(&self) -> Option<TrialProtocol> {
        self.get(CommandId::MainTrial)
            .and_then(TrialProtocol::from_selector)
    }

    /// Check the set against the device validity rules.
    ///
    /// Returns the selected protocol, or `ViolatedTrialRule` naming the first
    /// broken rule.
    pub fn validate(&self, limits: &ProtocolLimits) -> Result<TrialProtocol> {
        for (id, value) in &self.values {
            if !value.is_finite() {
                return Err(EdlError::violated(format!("{} must be finite", id)));
            }
        }

        let selector = self
            .get(CommandId::MainTrial)
            .ok_or_else(|| EdlError::violated("MainTrial is not set"))?;
        let protocol = TrialProtocol::from_selector(selector).ok_or_else(|| {
            EdlError::violated(format!("MainTrial {} does not select a protocol", selector))
        })?;

        for id in protocol.required() {
            if self.get(*id).is_none() {
                return Err(EdlError::violated(format!(
                    "{} protocol requires {}",
                    protocol, id
                )));
            }
        }

        self.check_common(limits)?;

        let v = |id| self.get(id).unwrap_or_default();
        let vhold = v(CommandId::Vhold);
        within(CommandId::Vhold, vhold, limits.voltage_mv)?;

        match protocol {
            TrialProtocol::Constant => {}
            TrialProtocol::Triangular => {
                let vamp = v(CommandId::Vamp);
                positive(CommandId::Vamp, vamp)?;
                duration(CommandId::TPeriod, v(CommandId::TPeriod), limits)?;
                if vhold.abs() + vamp > limits.voltage_mv {
                    return Err(EdlError::violated(format!(
                        "|Vhold| + Vamp ({} mV) exceeds {} mV",
                        vhold.abs() + vamp,
                        limits.voltage_mv
                    )));
                }
            }
            TrialProtocol::Pulse => {
                within(CommandId::Vpulse, v(CommandId::Vpulse), limits.voltage_mv)?;
                duration(CommandId::Thold, v(CommandId::Thold), limits)?;
                duration(CommandId::Tpulse, v(CommandId::Tpulse), limits)?;
                count(CommandId::N, v(CommandId::N))?;
            }
            TrialProtocol::Step => {
                let (vmin, vmax) = self.voltage_window(limits)?;
                let vstep = v(CommandId::Vstep);
                positive(CommandId::Vstep, vstep)?;
                if vstep > vmax - vmin {
                    return Err(EdlError::violated(format!(
                        "Vstep ({} mV) exceeds Vmax - Vmin ({} mV)",
                        vstep,
                        vmax - vmin
                    )));
                }
                duration(CommandId::Thold, v(CommandId::Thold), limits)?;
                duration(CommandId::Tstep, v(CommandId::Tstep), limits)?;
                count(CommandId::N, v(CommandId::N))?;
            }
            TrialProtocol::Ramp => {
                self.voltage_window(limits)?;
                if v(CommandId::Slope) == 0.0 {
                    return Err(EdlError::violated("Slope must be non-zero"));
                }
                duration(CommandId::Thold, v(CommandId::Thold), limits)?;
                count(CommandId::NR, v(CommandId::NR))?;
            }
        }

        Ok(protocol)
    }

    /// Check a set that is uploaded without being applied.
    ///
    /// Once `MainTrial` is known the full [`validate`](Self::validate) rules
    /// apply. Before that each value present is checked on its own bounds,
    /// and `None` is returned.
    pub fn validate_upload(&self, limits: &ProtocolLimits) -> Result<Option<TrialProtocol>> {
        if self.get(CommandId::MainTrial).is_some() {
            return self.validate(limits).map(Some);
        }

        for (&id, &value) in &self.values {
            if !value.is_finite() {
                return Err(EdlError::violated(format!("{} must be finite", id)));
            }
            match id {
                CommandId::Vhold
                | CommandId::Vpulse
                | CommandId::Vmin
                | CommandId::Vmax
                | CommandId::Vamp => within(id, value, limits.voltage_mv)?,
                CommandId::Thold | CommandId::Tpulse | CommandId::Tstep | CommandId::TPeriod => {
                    duration(id, value, limits)?
                }
                CommandId::N | CommandId::NR => count(id, value)?,
                _ => {}
            }
        }
        self.check_common(limits)?;
        Ok(None)
    }

    /// Rules that apply whatever the protocol.
    fn check_common(&self, limits: &ProtocolLimits) -> Result<()> {
        for id in [
            CommandId::VoffsetCh1,
            CommandId::VoffsetCh2,
            CommandId::VoffsetCh3,
            CommandId::VoffsetCh4,
        ] {
            if let Some(offset) = self.get(id) {
                within(id, offset, limits.offset_mv)?;
            }
        }
        if let Some(amp) = self.get(CommandId::PulseAmplitude) {
            within(CommandId::PulseAmplitude, amp, limits.voltage_mv)?;
        }
        if let Some(len) = self.get(CommandId::PulseDuration) {
            duration(CommandId::PulseDuration, len, limits)?;
        }
        Ok(())
    }

    fn voltage_window(&self, limits: &ProtocolLimits) -> Result<(f64, f64)> {
        let vmin = self.get(CommandId::Vmin).unwrap_or_default();
        let vmax = self.get(CommandId::Vmax).unwrap_or_default();
        within(CommandId::Vmin, vmin, limits.voltage_mv)?;
        within(CommandId::Vmax, vmax, limits.voltage_mv)?;
        if vmin >= vmax {
            return Err(EdlError::violated(format!(
                "Vmin ({} mV) must be below Vmax ({} mV)",
                vmin, vmax
            )));
        }
        Ok((vmin, vmax))
    }
}

fn within(id: CommandId, value: f64, limit: f64) -> Result<()> {
    if value.abs() > limit {
        return Err(EdlError::violated(format!(
            "{} ({} mV) is outside ±{} mV",
            id, value, limit
        )));
    }
    Ok(())
}

fn positive(id: CommandId, value: f64) -> Result<()> {
    if value <= 0.0 {
        return Err(EdlError::violated(format!("{} must be positive", id)));
    }
    Ok(())
}

fn duration(id: CommandId, value: f64, limits: &ProtocolLimits) -> Result<()> {
    positive(id, value)?;
    if value > limits.max_duration_ms {
        return Err(EdlError::violated(format!(
            "{} ({} ms) exceeds {} ms",
            id, value, limits.max_duration_ms
        )));
    }
    Ok(())
}

fn count(id: CommandId, value: f64) -> Result<()> {
    if value < 1.0 || value.fract() != 0.0 {
        return Err(EdlError::violated(format!(
            "{} must be a whole number of at least 1",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandConfig;

    fn params(values: &[(CommandId, f64)]) -> ProtocolParameters {
        let mut p = ProtocolParameters::new();
        for (id, value) in values {
            p.set(&Command::from_config(*id, &CommandConfig::value(*value)).unwrap());
        }
        p
    }

    #[test]
    fn test_constant_protocol() {
        let p = params(&[(CommandId::MainTrial, 0.0), (CommandId::Vhold, 0.0)]);
        assert_eq!(p.validate(&ProtocolLimits::default()).unwrap(), TrialProtocol::Constant);
    }

    #[test]
    fn test_triangular_protocol() {
        let p = params(&[
            (CommandId::MainTrial, 1.0),
            (CommandId::Vhold, 0.0),
            (CommandId::Vamp, 50.0),
            (CommandId::TPeriod, 100.0),
        ]);
        assert_eq!(
            p.validate(&ProtocolLimits::default()).unwrap(),
            TrialProtocol::Triangular
        );

        let p = params(&[
            (CommandId::MainTrial, 1.0),
            (CommandId::Vhold, 480.0),
            (CommandId::Vamp, 50.0),
            (CommandId::TPeriod, 100.0),
        ]);
        assert!(p.validate(&ProtocolLimits::default()).is_err());
    }

    #[test]
    fn test_step_requires_consistent_window() {
        let base = [
            (CommandId::MainTrial, 3.0),
            (CommandId::Vhold, -70.0),
            (CommandId::Vmin, -100.0),
            (CommandId::Vmax, 50.0),
            (CommandId::Vstep, 10.0),
            (CommandId::Thold, 100.0),
            (CommandId::Tstep, 50.0),
            (CommandId::N, 15.0),
        ];
        let limits = ProtocolLimits::default();
        assert_eq!(params(&base).validate(&limits).unwrap(), TrialProtocol::Step);

        let mut inverted = base;
        inverted[2] = (CommandId::Vmin, 60.0);
        let err = params(&inverted).validate(&limits).unwrap_err();
        assert!(err.to_string().contains("Vmin"));

        let mut wide_step = base;
        wide_step[4] = (CommandId::Vstep, 200.0);
        assert!(params(&wide_step).validate(&limits).is_err());

        let mut fractional = base;
        fractional[7] = (CommandId::N, 2.5);
        assert!(params(&fractional).validate(&limits).is_err());
    }

    #[test]
    fn test_missing_selector_and_parameters() {
        let limits = ProtocolLimits::default();
        let err = params(&[(CommandId::Vhold, 0.0)]).validate(&limits).unwrap_err();
        assert!(err.to_string().contains("MainTrial"));

        let err = params(&[(CommandId::MainTrial, 1.0), (CommandId::Vhold, 0.0)])
            .validate(&limits)
            .unwrap_err();
        assert!(err.to_string().contains("Vamp"));

        let err = params(&[(CommandId::MainTrial, 9.0), (CommandId::Vhold, 0.0)])
            .validate(&limits)
            .unwrap_err();
        assert!(matches!(err, EdlError::ViolatedTrialRule { .. }));
    }

    #[test]
    fn test_offsets_and_non_finite_values() {
        let limits = ProtocolLimits::default();
        let p = params(&[
            (CommandId::MainTrial, 0.0),
            (CommandId::Vhold, 0.0),
            (CommandId::VoffsetCh2, 150.0),
        ]);
        assert!(p.validate(&limits).is_err());

        let p = params(&[(CommandId::MainTrial, 0.0), (CommandId::Vhold, f64::NAN)]);
        assert!(p.validate(&limits).is_err());
    }

    #[test]
    fn test_upload_without_selector_checks_each_value() {
        let limits = ProtocolLimits::default();
        let p = params(&[(CommandId::Vhold, -10.0), (CommandId::Thold, 20.0)]);
        assert_eq!(p.validate_upload(&limits).unwrap(), None);

        let err = params(&[(CommandId::Vhold, 700.0)])
            .validate_upload(&limits)
            .unwrap_err();
        assert!(err.to_string().contains("Vhold"));
        assert!(params(&[(CommandId::N, 0.5)]).validate_upload(&limits).is_err());
        assert!(params(&[(CommandId::TPeriod, 0.0)])
            .validate_upload(&limits)
            .is_err());

        // With a selector the whole protocol has to hold.
        let err = params(&[(CommandId::MainTrial, 1.0), (CommandId::Vhold, 0.0)])
            .validate_upload(&limits)
            .unwrap_err();
        assert!(err.to_string().contains("Vamp"));
        let p = params(&[(CommandId::MainTrial, 0.0), (CommandId::Vhold, 0.0)]);
        assert_eq!(p.validate_upload(&limits).unwrap(), Some(TrialProtocol::Constant));
    }

    #[test]
    fn test_merge_overrides_applied_values() {
        let applied = params(&[(CommandId::MainTrial, 0.0), (CommandId::Vhold, 0.0)]);
        let staged = [Command::from_config(CommandId::Vhold, &CommandConfig::value(-40.0)).unwrap()];
        let merged = applied.merged(staged.iter());
        assert_eq!(merged.get(CommandId::Vhold), Some(-40.0));
        assert_eq!(applied.get(CommandId::Vhold), Some(0.0));
        assert_eq!(merged.protocol(), Some(TrialProtocol::Constant));
    }
}
