//! Error types for E4 device operations.
//!
//! Every fallible operation returns [`EdlError`]. Each variant carries the
//! stable numeric code the device library has always reported, so host
//! bindings can keep comparing against the historical code table.

use std::fmt;
use thiserror::Error;

use crate::command::CommandId;

/// Result type alias for E4 operations.
pub type Result<T> = std::result::Result<T, EdlError>;

/// Broad category of an [`EdlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// Detection, connection setup and teardown.
    Connection,
    /// Rejected command configurations. State is never mutated.
    Command,
    /// Sample availability and framing.
    Data,
    /// Failures writing to the underlying link.
    Transport,
    /// Anything unclassified.
    Unknown,
}

impl fmt::Display for ErrorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connection => "connection",
            Self::Command => "command",
            Self::Data => "data",
            Self::Transport => "transport",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Errors that can occur when working with an E4 device.
#[derive(Error, Debug)]
pub enum EdlError {
    /// Enumeration found no devices (or the USB driver is missing).
    #[error("No devices detected")]
    NoDevices,

    /// An operation other than detection/connection was called without a session.
    #[error("No device is connected")]
    DeviceNotConnected,

    /// The device firmware licence has expired.
    #[error("Device '{device}' has expired")]
    DeviceExpired {
        /// Serial number of the expired device
        device: String,
    },

    /// A command write did not reach the device.
    #[error("Failed to write to device: {message}")]
    WriteToFtdi {
        /// Transport failure or short-write description
        message: String,
    },

    /// The communication channel could not be opened.
    #[error("Failed to open device '{device}': {message}")]
    DeviceConnection {
        /// Device that failed to open
        device: String,
        /// Transport failure
        message: String,
    },

    /// `connect` was called while a session is already open.
    #[error("A device is already connected ('{device}')")]
    DeviceAlreadyConnected {
        /// Device the open session belongs to
        device: String,
    },

    /// Setting link latency failed during connection.
    #[error("Failed to set connection latency: {message}")]
    DeviceConnectionLatency {
        /// Transport failure
        message: String,
    },

    /// Setting USB parameters failed during connection.
    #[error("Failed to set USB parameters: {message}")]
    DeviceConnectionSetUsb {
        /// Transport failure
        message: String,
    },

    /// Setting the USB transfer size failed during connection.
    #[error("Failed to set USB transfer size: {message}")]
    DeviceConnectionTransferSize {
        /// Transport failure
        message: String,
    },

    /// Purging the freshly opened channel failed.
    #[error("Failed to purge USB channel: {message}")]
    DeviceConnectionPurge {
        /// Transport failure
        message: String,
    },

    /// The probe write on a new channel failed.
    #[error("Test write on new channel failed: {message}")]
    DeviceConnectionFirstWrite {
        /// Transport failure
        message: String,
    },

    /// Closing the channel failed after every retry.
    #[error("Failed to close device after {attempts} attempts: {message}")]
    DeviceDisconnection {
        /// Close attempts made
        attempts: u32,
        /// Failure of the last attempt
        message: String,
    },

    /// Raw command id outside the known set.
    #[error("Command id {raw} is out of range (valid ids are 0..{max})")]
    CommandIdOutOfRange {
        /// Id as received
        raw: u32,
        /// Number of valid ids
        max: u32,
    },

    /// A protocol value command was sent immediately instead of staged.
    #[error("Protocol value command {command} must be staged, not sent")]
    TrialValueSendNotDisabled {
        /// The value command
        command: CommandId,
    },

    /// A push-button command was staged instead of sent.
    #[error("Push-button command {command} must be sent immediately")]
    PushButtonSendDisabled {
        /// The button command
        command: CommandId,
    },

    /// The staged protocol breaks a device validity rule.
    #[error("Protocol rule violated: {rule}")]
    ViolatedTrialRule {
        /// First rule found broken
        rule: String,
    },

    /// Fewer packets were available than requested.
    ///
    /// Advisory only: reads return this alongside the packets that were read.
    #[error("Requested {requested} packets but only {available} were available")]
    NotEnoughAvailableData {
        /// Packets asked for
        requested: usize,
        /// Packets delivered
        available: usize,
    },

    /// Radio index outside the command's selection set.
    #[error("Radio index {index} is not valid for {command} ({options} options)")]
    InvalidRadioSelection {
        /// The radio command
        command: CommandId,
        /// Index as given
        index: u32,
        /// Number of selections the command has
        options: u32,
    },

    /// Sample stream length does not divide into whole packets.
    #[error("Misaligned sample stream: {len} values for {channels} channels")]
    MisalignedFrame {
        /// Number of sample values
        len: usize,
        /// Channels per packet
        channels: usize,
    },

    /// Sink or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unclassified failure.
    #[error("Unknown error: {message}")]
    Unknown {
        /// What went wrong
        message: String,
    },
}

impl EdlError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::NoDevices => 0x0001,
            Self::DeviceNotConnected => 0x0002,
            Self::DeviceExpired { .. } => 0x0003,
            Self::WriteToFtdi { .. } => 0x0004,
            Self::DeviceConnection { .. } => 0x0101,
            Self::DeviceAlreadyConnected { .. } => 0x0102,
            Self::DeviceConnectionLatency { .. } => 0x0103,
            Self::DeviceConnectionSetUsb { .. } => 0x0104,
            Self::DeviceConnectionTransferSize { .. } => 0x0105,
            Self::DeviceConnectionPurge { .. } => 0x0106,
            Self::DeviceConnectionFirstWrite { .. } => 0x0107,
            Self::DeviceDisconnection { .. } => 0x0108,
            Self::CommandIdOutOfRange { .. } => 0x0201,
            Self::TrialValueSendNotDisabled { .. } => 0x0202,
            Self::PushButtonSendDisabled { .. } => 0x0203,
            Self::ViolatedTrialRule { .. } => 0x0204,
            Self::NotEnoughAvailableData { .. } => 0x0205,
            Self::InvalidRadioSelection { .. } => 0x0206,
            Self::MisalignedFrame { .. } => 0x0301,
            Self::Io(_) => 0x0302,
            Self::Unknown { .. } => 0xFFFF,
        }
    }

    /// Category of this error.
    pub fn family(&self) -> ErrorFamily {
        match self {
            Self::NoDevices
            | Self::DeviceNotConnected
            | Self::DeviceExpired { .. }
            | Self::DeviceConnection { .. }
            | Self::DeviceAlreadyConnected { .. }
            | Self::DeviceConnectionLatency { .. }
            | Self::DeviceConnectionSetUsb { .. }
            | Self::DeviceConnectionTransferSize { .. }
            | Self::DeviceConnectionPurge { .. }
            | Self::DeviceConnectionFirstWrite { .. }
            | Self::DeviceDisconnection { .. } => ErrorFamily::Connection,
            Self::CommandIdOutOfRange { .. }
            | Self::TrialValueSendNotDisabled { .. }
            | Self::PushButtonSendDisabled { .. }
            | Self::ViolatedTrialRule { .. }
            | Self::InvalidRadioSelection { .. } => ErrorFamily::Command,
            Self::NotEnoughAvailableData { .. } | Self::MisalignedFrame { .. } | Self::Io(_) => {
                ErrorFamily::Data
            }
            Self::WriteToFtdi { .. } => ErrorFamily::Transport,
            Self::Unknown { .. } => ErrorFamily::Unknown,
        }
    }

    /// Whether the caller can correct the input and retry on the same session.
    ///
    /// Connection and transport failures are not recoverable locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CommandIdOutOfRange { .. }
                | Self::TrialValueSendNotDisabled { .. }
                | Self::PushButtonSendDisabled { .. }
                | Self::ViolatedTrialRule { .. }
                | Self::InvalidRadioSelection { .. }
                | Self::NotEnoughAvailableData { .. }
        )
    }

    /// Check if this is the "not connected" error.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::DeviceNotConnected)
    }

    pub(crate) fn violated(rule: impl Into<String>) -> Self {
        Self::ViolatedTrialRule { rule: rule.into() }
    }
}
