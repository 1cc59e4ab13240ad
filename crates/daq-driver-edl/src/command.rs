//! Command identifiers, kinds and payloads.
//!
//! A command is described along three axes:
//!
//! - **what** it changes: a [`CommandId`] from the fixed device table
//! - **how**: a [`CommandConfig`] payload, of which only the field matching
//!   the command's [`CommandKind`] is read
//! - **when**: staged for a later commit, or sent now
//!
//! The flag-based entry point ([`EdlSession::set_command`]) takes all three
//! at runtime. The typed entry points take a [`StagedCommand`] or an
//! [`ImmediateCommand`], which cannot express the illegal combinations
//! (a staged push button, an immediately sent protocol value).
//!
//! [`EdlSession::set_command`]: crate::session::EdlSession::set_command

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EdlError, Result};

/// How a command's payload is interpreted and when it may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Selects one of a fixed set of options. Stageable or immediate.
    Radio,
    /// On/off setting. Stageable or immediate.
    Checkbox,
    /// Event, never stageable.
    PushButton,
    /// Protocol parameter, only stageable; applied by `ApplyProtocol`.
    Value,
}

impl CommandKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Radio => 1,
            Self::Checkbox => 2,
            Self::PushButton => 3,
            Self::Value => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Radio),
            2 => Some(Self::Checkbox),
            3 => Some(Self::PushButton),
            4 => Some(Self::Value),
            _ => None,
        }
    }
}

/// Device command table.
///
/// Discriminants are the ids the device firmware uses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandId {
    /// Current range (radio)
    Range = 0,
    /// Sampling rate (radio)
    SamplingRate = 1,
    /// Final bandwidth (radio)
    FinalBandwidth = 2,
    /// Zap all channels (button)
    ZapAllChannels = 3,
    /// Digital offset compensation on all channels (button)
    CompAll = 4,
    /// Reset the compensation (button)
    ResetComp = 5,
    /// Device reset (checkbox)
    Reset = 6,
    /// Pulse amplitude in mV
    PulseAmplitude = 7,
    /// Pulse duration in ms
    PulseDuration = 8,
    /// Fire a voltage pulse (button)
    Pulse = 9,
    /// Voltage offset of channel 1 in mV
    VoffsetCh1 = 10,
    /// Voltage offset of channel 2 in mV
    VoffsetCh2 = 11,
    /// Voltage offset of channel 3 in mV
    VoffsetCh3 = 12,
    /// Voltage offset of channel 4 in mV
    VoffsetCh4 = 13,
    /// Validate and start the staged protocol (button)
    ApplyProtocol = 14,
    /// Protocol selector, 0 to 4
    MainTrial = 15,
    /// Holding potential in mV
    Vhold = 16,
    /// Pulse potential in mV
    Vpulse = 17,
    /// Step increment in mV
    Vstep = 18,
    /// Upper potential in mV
    Vmax = 19,
    /// Lower potential in mV
    Vmin = 20,
    /// Holding time in ms
    Thold = 21,
    /// Pulse time in ms
    Tpulse = 22,
    /// Step time in ms
    Tstep = 23,
    /// Repetitions of the pulse or step sequence
    N = 24,
    /// Number of ramps
    NR = 25,
    /// Ramp slope
    Slope = 26,
    /// Triangle amplitude in mV
    Vamp = 27,
    /// Triangle period in ms
    TPeriod = 28,
}

impl CommandId {
    /// Number of valid command ids.
    pub const COUNT: u32 = 29;

    /// Every command, in id order.
    pub const ALL: [CommandId; 29] = [
        Self::Range,
        Self::SamplingRate,
        Self::FinalBandwidth,
        Self::ZapAllChannels,
        Self::CompAll,
        Self::ResetComp,
        Self::Reset,
        Self::PulseAmplitude,
        Self::PulseDuration,
        Self::Pulse,
        Self::VoffsetCh1,
        Self::VoffsetCh2,
        Self::VoffsetCh3,
        Self::VoffsetCh4,
        Self::ApplyProtocol,
        Self::MainTrial,
        Self::Vhold,
        Self::Vpulse,
        Self::Vstep,
        Self::Vmax,
        Self::Vmin,
        Self::Thold,
        Self::Tpulse,
        Self::Tstep,
        Self::N,
        Self::NR,
        Self::Slope,
        Self::Vamp,
        Self::TPeriod,
    ];

    /// Resolve a raw id.
    pub fn from_raw(raw: u32) -> Result<Self> {
        usize::try_from(raw)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or(EdlError::CommandIdOutOfRange {
                raw,
                max: Self::COUNT,
            })
    }

    /// Wire id.
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Fixed kind of this command.
    pub fn kind(self) -> CommandKind {
        match self {
            Self::Range | Self::SamplingRate | Self::FinalBandwidth => CommandKind::Radio,
            Self::Reset => CommandKind::Checkbox,
            Self::ZapAllChannels
            | Self::CompAll
            | Self::ResetComp
            | Self::Pulse
            | Self::ApplyProtocol => CommandKind::PushButton,
            _ => CommandKind::Value,
        }
    }

    /// Number of radio options, for radio commands.
    pub fn radio_options(self) -> Option<u32> {
        match self {
            Self::Range => Some(CurrentRange::ALL.len() as u32),
            Self::SamplingRate => Some(SamplingRate::ALL.len() as u32),
            Self::FinalBandwidth => Some(FinalBandwidth::ALL.len() as u32),
            _ => None,
        }
    }

    /// Engineering unit of a value command's payload.
    pub fn unit(self) -> Option<&'static str> {
        match self {
            Self::PulseAmplitude
            | Self::VoffsetCh1
            | Self::VoffsetCh2
            | Self::VoffsetCh3
            | Self::VoffsetCh4
            | Self::Vhold
            | Self::Vpulse
            | Self::Vstep
            | Self::Vmax
            | Self::Vmin
            | Self::Vamp => Some("mV"),
            Self::PulseDuration | Self::Thold | Self::Tpulse | Self::Tstep | Self::TPeriod => {
                Some("ms")
            }
            Self::Slope => Some("mV/ms"),
            _ => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Current range radio selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CurrentRange {
    /// ±200 pA full scale
    #[default]
    Range200pA,
    /// ±2 nA full scale
    Range2nA,
    /// ±20 nA full scale
    Range20nA,
    /// ±200 nA full scale
    Range200nA,
}

impl CurrentRange {
    /// Every range, in radio order.
    pub const ALL: [CurrentRange; 4] = [
        Self::Range200pA,
        Self::Range2nA,
        Self::Range20nA,
        Self::Range200nA,
    ];

    /// Radio index on the wire.
    pub fn radio_id(self) -> u32 {
        self as u32
    }

    /// Selection for a radio index.
    pub fn from_radio_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Full-scale current in the unit reported by [`unit`](Self::unit).
    pub fn full_scale(self) -> f32 {
        match self {
            Self::Range200pA => 200.0,
            Self::Range2nA => 2.0,
            Self::Range20nA => 20.0,
            Self::Range200nA => 200.0,
        }
    }

    /// Unit of the current channels under this range.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Range200pA => "pA",
            _ => "nA",
        }
    }
}

/// Sampling rate radio selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SamplingRate {
    /// 1.25 kHz
    #[default]
    Khz1_25,
    /// 5 kHz
    Khz5,
    /// 10 kHz
    Khz10,
    /// 20 kHz
    Khz20,
    /// 50 kHz
    Khz50,
    /// 100 kHz
    Khz100,
    /// 200 kHz
    Khz200,
}

impl SamplingRate {
    /// Every rate, in radio order.
    pub const ALL: [SamplingRate; 7] = [
        Self::Khz1_25,
        Self::Khz5,
        Self::Khz10,
        Self::Khz20,
        Self::Khz50,
        Self::Khz100,
        Self::Khz200,
    ];

    /// Radio index on the wire.
    pub fn radio_id(self) -> u32 {
        self as u32
    }

    /// Selection for a radio index.
    pub fn from_radio_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Packet rate in Hz.
    pub fn hz(self) -> f64 {
        match self {
            Self::Khz1_25 => 1_250.0,
            Self::Khz5 => 5_000.0,
            Self::Khz10 => 10_000.0,
            Self::Khz20 => 20_000.0,
            Self::Khz50 => 50_000.0,
            Self::Khz100 => 100_000.0,
            Self::Khz200 => 200_000.0,
        }
    }
}

/// Final bandwidth radio selection, as a fraction of the sampling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FinalBandwidth {
    /// Half the sampling rate (filters off)
    #[default]
    SrHalf,
    /// An eighth of the sampling rate
    SrEighth,
    /// A tenth of the sampling rate
    SrTenth,
    /// A twentieth of the sampling rate
    SrTwentieth,
}

impl FinalBandwidth {
    /// Every bandwidth, in radio order.
    pub const ALL: [FinalBandwidth; 4] = [
        Self::SrHalf,
        Self::SrEighth,
        Self::SrTenth,
        Self::SrTwentieth,
    ];

    /// Radio index on the wire.
    pub fn radio_id(self) -> u32 {
        self as u32
    }

    /// Selection for a radio index.
    pub fn from_radio_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Sampling rate divided by this gives the cut-off.
    pub fn divisor(self) -> u32 {
        match self {
            Self::SrHalf => 2,
            Self::SrEighth => 8,
            Self::SrTenth => 10,
            Self::SrTwentieth => 20,
        }
    }

    /// Cut-off frequency for a given sampling rate.
    pub fn cutoff_hz(self, rate: SamplingRate) -> f64 {
        rate.hz() / self.divisor() as f64
    }
}

/// Checkbox state: checked.
pub const CHECKBOX_CHECKED: bool = true;
/// Checkbox state: unchecked.
pub const CHECKBOX_UNCHECKED: bool = false;
/// Button state: pressed.
pub const BUTTON_PRESSED: bool = true;
/// Button state: released.
pub const BUTTON_RELEASED: bool = false;

/// Payload record for the flag-based command API.
///
/// Up to one field is relevant, depending on the command's kind.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Index of the radio option to select.
    pub radio_id: u32,
    /// Whether to check a checkbox.
    pub checkbox_checked: bool,
    /// Whether to press a button.
    pub button_pressed: bool,
    /// Value for a numeric field, in the command's engineering unit.
    pub value: f64,
}

impl CommandConfig {
    /// Payload selecting radio option `radio_id`.
    pub fn radio(radio_id: u32) -> Self {
        Self {
            radio_id,
            ..Default::default()
        }
    }

    /// Payload for a checkbox.
    pub fn checkbox(checked: bool) -> Self {
        Self {
            checkbox_checked: checked,
            ..Default::default()
        }
    }

    /// Payload for a push button.
    pub fn button(pressed: bool) -> Self {
        Self {
            button_pressed: pressed,
            ..Default::default()
        }
    }

    /// Payload for a value command.
    pub fn value(value: f64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }
}

/// Kind-checked payload of a resolved command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// Selected option index
    Radio(u32),
    /// Checked state
    Checkbox(bool),
    /// Pressed state
    Button(bool),
    /// Numeric value
    Value(f64),
}

/// A command whose payload has been read according to its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    /// Which command
    pub id: CommandId,
    /// What it carries
    pub payload: Payload,
}

impl Command {
    /// Resolve a command from the flag-based payload record.
    ///
    /// Reads only the field matching the command's kind. Radio indices are
    /// checked against the command's option set.
    pub fn from_config(id: CommandId, config: &CommandConfig) -> Result<Self> {
        let payload = match id.kind() {
            CommandKind::Radio => {
                let options = id.radio_options().unwrap_or(0);
                if config.radio_id >= options {
                    return Err(EdlError::InvalidRadioSelection {
                        command: id,
                        index: config.radio_id,
                        options,
                    });
                }
                Payload::Radio(config.radio_id)
            }
            CommandKind::Checkbox => Payload::Checkbox(config.checkbox_checked),
            CommandKind::PushButton => Payload::Button(config.button_pressed),
            CommandKind::Value => Payload::Value(config.value),
        };
        Ok(Self { id, payload })
    }

    /// Kind of the command, from the command table.
    pub fn kind(&self) -> CommandKind {
        self.id.kind()
    }

    /// The numeric value, for value commands.
    pub fn value(&self) -> Option<f64> {
        match self.payload {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn apply_protocol() -> Self {
        Self {
            id: CommandId::ApplyProtocol,
            payload: Payload::Button(BUTTON_PRESSED),
        }
    }
}

// =============================================================================
// Typed commands
// =============================================================================

/// A radio selection, carrying its option type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioSelection {
    /// Current range
    Range(CurrentRange),
    /// Sampling rate
    SamplingRate(SamplingRate),
    /// Final bandwidth
    FinalBandwidth(FinalBandwidth),
}

impl From<RadioSelection> for Command {
    fn from(selection: RadioSelection) -> Self {
        let (id, radio) = match selection {
            RadioSelection::Range(r) => (CommandId::Range, r.radio_id()),
            RadioSelection::SamplingRate(r) => (CommandId::SamplingRate, r.radio_id()),
            RadioSelection::FinalBandwidth(r) => (CommandId::FinalBandwidth, r.radio_id()),
        };
        Command {
            id,
            payload: Payload::Radio(radio),
        }
    }
}

/// Checkbox commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckboxCommand {
    /// Device reset
    Reset,
}

impl CheckboxCommand {
    /// Entry in the command table.
    pub fn id(self) -> CommandId {
        match self {
            Self::Reset => CommandId::Reset,
        }
    }
}

/// Push-button commands that fire as events.
///
/// `ApplyProtocol` is not listed; it has its own entry point because it
/// validates and commits the staged protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonCommand {
    /// Zap all channels
    ZapAllChannels,
    /// Digital offset compensation on all channels
    CompAll,
    /// Reset the compensation
    ResetComp,
    /// Fire a voltage pulse
    Pulse,
}

impl ButtonCommand {
    /// Entry in the command table.
    pub fn id(self) -> CommandId {
        match self {
            Self::ZapAllChannels => CommandId::ZapAllChannels,
            Self::CompAll => CommandId::CompAll,
            Self::ResetComp => CommandId::ResetComp,
            Self::Pulse => CommandId::Pulse,
        }
    }
}

/// Protocol value parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueCommand {
    /// Pulse amplitude in mV
    PulseAmplitude,
    /// Pulse duration in ms
    PulseDuration,
    /// Voltage offset of channel 1 in mV
    VoffsetCh1,
    /// Voltage offset of channel 2 in mV
    VoffsetCh2,
    /// Voltage offset of channel 3 in mV
    VoffsetCh3,
    /// Voltage offset of channel 4 in mV
    VoffsetCh4,
    /// Protocol selector, 0 to 4
    MainTrial,
    /// Holding potential in mV
    Vhold,
    /// Pulse potential in mV
    Vpulse,
    /// Step increment in mV
    Vstep,
    /// Upper potential in mV
    Vmax,
    /// Lower potential in mV
    Vmin,
    /// Holding time in ms
    Thold,
    /// Pulse time in ms
    Tpulse,
    /// Step time in ms
    Tstep,
    /// Repetitions of the pulse or step sequence
    N,
    /// Number of ramps
    NR,
    /// Ramp slope
    Slope,
    /// Triangle amplitude in mV
    Vamp,
    /// Triangle period in ms
    TPeriod,
}

impl ValueCommand {
    /// Entry in the command table.
    pub fn id(self) -> CommandId {
        match self {
            Self::PulseAmplitude => CommandId::PulseAmplitude,
            Self::PulseDuration => CommandId::PulseDuration,
            Self::VoffsetCh1 => CommandId::VoffsetCh1,
            Self::VoffsetCh2 => CommandId::VoffsetCh2,
            Self::VoffsetCh3 => CommandId::VoffsetCh3,
            Self::VoffsetCh4 => CommandId::VoffsetCh4,
            Self::MainTrial => CommandId::MainTrial,
            Self::Vhold => CommandId::Vhold,
            Self::Vpulse => CommandId::Vpulse,
            Self::Vstep => CommandId::Vstep,
            Self::Vmax => CommandId::Vmax,
            Self::Vmin => CommandId::Vmin,
            Self::Thold => CommandId::Thold,
            Self::Tpulse => CommandId::Tpulse,
            Self::Tstep => CommandId::Tstep,
            Self::N => CommandId::N,
            Self::NR => CommandId::NR,
            Self::Slope => CommandId::Slope,
            Self::Vamp => CommandId::Vamp,
            Self::TPeriod => CommandId::TPeriod,
        }
    }
}

/// A command that may be staged for a later commit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StagedCommand {
    /// A radio selection
    Radio(RadioSelection),
    /// A checkbox and its state
    Checkbox(CheckboxCommand, bool),
    /// A protocol value
    Value(ValueCommand, f64),
}

impl From<StagedCommand> for Command {
    fn from(cmd: StagedCommand) -> Self {
        match cmd {
            StagedCommand::Radio(sel) => sel.into(),
            StagedCommand::Checkbox(c, checked) => Command {
                id: c.id(),
                payload: Payload::Checkbox(checked),
            },
            StagedCommand::Value(v, value) => Command {
                id: v.id(),
                payload: Payload::Value(value),
            },
        }
    }
}

/// A command that may be sent immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImmediateCommand {
    /// A radio selection, carrying staged commands with it
    Radio(RadioSelection),
    /// A checkbox and its state, carrying staged commands with it
    Checkbox(CheckboxCommand, bool),
    /// A button and its state, sent alone
    Button(ButtonCommand, bool),
}

impl From<ImmediateCommand> for Command {
    fn from(cmd: ImmediateCommand) -> Self {
        match cmd {
            ImmediateCommand::Radio(sel) => sel.into(),
            ImmediateCommand::Checkbox(c, checked) => Command {
                id: c.id(),
                payload: Payload::Checkbox(checked),
            },
            ImmediateCommand::Button(b, pressed) => Command {
                id: b.id(),
                payload: Payload::Button(pressed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_covers_table() {
        for (idx, id) in CommandId::ALL.iter().enumerate() {
            assert_eq!(CommandId::from_raw(idx as u32).unwrap(), *id);
            assert_eq!(id.raw() as usize, idx);
        }
        let err = CommandId::from_raw(29).unwrap_err();
        assert!(matches!(
            err,
            EdlError::CommandIdOutOfRange { raw: 29, max: 29 }
        ));
        assert!(CommandId::from_raw(u32::MAX).is_err());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(CommandId::Range.kind(), CommandKind::Radio);
        assert_eq!(CommandId::Reset.kind(), CommandKind::Checkbox);
        assert_eq!(CommandId::CompAll.kind(), CommandKind::PushButton);
        assert_eq!(CommandId::ApplyProtocol.kind(), CommandKind::PushButton);
        assert_eq!(CommandId::TPeriod.kind(), CommandKind::Value);
        assert_eq!(CommandId::VoffsetCh3.kind(), CommandKind::Value);
    }

    #[test]
    fn test_radio_constants() {
        assert_eq!(CurrentRange::Range200pA.radio_id(), 0);
        assert_eq!(CurrentRange::Range200nA.radio_id(), 3);
        assert_eq!(SamplingRate::Khz5.radio_id(), 1);
        assert_eq!(SamplingRate::Khz200.radio_id(), 6);
        assert_eq!(FinalBandwidth::SrTwentieth.radio_id(), 3);
        assert_eq!(FinalBandwidth::SrHalf.cutoff_hz(SamplingRate::Khz5), 2_500.0);
    }

    #[test]
    fn test_from_config_reads_only_kind_field() {
        let config = CommandConfig {
            radio_id: 2,
            checkbox_checked: true,
            button_pressed: false,
            value: 12.5,
        };
        let cmd = Command::from_config(CommandId::Vhold, &config).unwrap();
        assert_eq!(cmd.payload, Payload::Value(12.5));
        let cmd = Command::from_config(CommandId::Range, &config).unwrap();
        assert_eq!(cmd.payload, Payload::Radio(2));
        let cmd = Command::from_config(CommandId::Reset, &config).unwrap();
        assert_eq!(cmd.payload, Payload::Checkbox(true));
        let cmd = Command::from_config(CommandId::Pulse, &config).unwrap();
        assert_eq!(cmd.payload, Payload::Button(false));
    }

    #[test]
    fn test_radio_index_out_of_set() {
        let err = Command::from_config(CommandId::SamplingRate, &CommandConfig::radio(7))
            .unwrap_err();
        assert!(matches!(
            err,
            EdlError::InvalidRadioSelection { options: 7, .. }
        ));
    }

    #[test]
    fn test_typed_commands_resolve_to_table_ids() {
        let cmd: Command = StagedCommand::Radio(RadioSelection::SamplingRate(SamplingRate::Khz5)).into();
        assert_eq!(cmd.id, CommandId::SamplingRate);
        assert_eq!(cmd.payload, Payload::Radio(1));

        let cmd: Command = StagedCommand::Value(ValueCommand::Vamp, 50.0).into();
        assert_eq!(cmd.id, CommandId::Vamp);
        assert_eq!(cmd.value(), Some(50.0));

        let cmd: Command = ImmediateCommand::Button(ButtonCommand::CompAll, BUTTON_PRESSED).into();
        assert_eq!(cmd.kind(), CommandKind::PushButton);
    }
}
