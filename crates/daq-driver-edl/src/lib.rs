//! Host-side driver for E4 electrophysiology amplifiers.
//!
//! The amplifier sits behind a USB bridge and speaks a small command
//! protocol: 29 commands that either select a setting, fire an event, or
//! set a parameter of the stimulation protocol. This crate owns the host
//! half of that protocol:
//!
//! - [`command`] / [`codec`] - the command table and its 8-byte wire frames
//! - [`stager`] - staging versus immediate send, and protocol commits
//! - [`protocol`] - validity rules a protocol must meet before it is applied
//! - [`status`] - queue size and the sticky overflow/lost-data flags
//! - [`acquisition`] - the bounded read loop and packet framing
//! - [`sink`] - in-memory and file destinations for packets
//! - [`continuous`] - a reader thread streaming batches over a channel
//! - [`session`] - the [`EdlSession`] that ties it together for one device
//! - [`mock`] - a simulated device implementing [`Transport`]
//!
//! # Example
//!
//! ```no_run
//! use daq_driver_edl::command::{
//!     CurrentRange, FinalBandwidth, ImmediateCommand, RadioSelection, SamplingRate, StagedCommand,
//! };
//! use daq_driver_edl::mock::{SimulatedDevice, SimulatorConfig};
//! use daq_driver_edl::{EdlSession, SessionConfig};
//!
//! # fn example() -> daq_driver_edl::Result<()> {
//! let mut session = EdlSession::new(
//!     SimulatedDevice::new(SimulatorConfig::default()),
//!     SessionConfig::default(),
//! );
//! let devices = session.detect_devices()?;
//! session.connect(&devices[0])?;
//!
//! session.stage(StagedCommand::Radio(RadioSelection::SamplingRate(SamplingRate::Khz5)))?;
//! session.stage(StagedCommand::Radio(RadioSelection::Range(CurrentRange::Range200pA)))?;
//! session.send(ImmediateCommand::Radio(RadioSelection::FinalBandwidth(FinalBandwidth::SrHalf)))?;
//!
//! session.purge_data()?;
//! let outcome = session.read_data(1000)?;
//! if let Some(advisory) = &outcome.advisory {
//!     println!("{advisory}");
//! }
//!
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod codec;
pub mod command;
pub mod config;
pub mod continuous;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod stager;
pub mod status;
pub mod transport;

pub use acquisition::{
    frame_packets, CancelFlag, NoPause, Pacer, ReadBudget, ReadOutcome, ReadReport, SamplePacket,
    StopReason, ThreadSleep,
};
pub use command::{
    ButtonCommand, CheckboxCommand, Command, CommandConfig, CommandId, CommandKind,
    ImmediateCommand, RadioSelection, StagedCommand, ValueCommand,
};
pub use config::{AcquisitionConfig, ConnectionConfig, ProtocolLimits, SessionConfig};
pub use continuous::{
    AcquisitionWorker, BatchReceiver, PacketBatch, WorkerConfig, WorkerReport, WorkerStats,
};
pub use error::{EdlError, ErrorFamily, Result};
pub use protocol::{ProtocolParameters, TrialProtocol};
pub use session::{ConnectionState, DeviceSettings, EdlSession};
pub use sink::{read_packet_file, FileSink, PacketSink, VecSink};
pub use stager::{CommitReport, StageReceipt, StagingState};
pub use status::{DeviceStatus, StatusCounters};
pub use transport::{DeviceId, LinkInfo, QueueStatus, Transport, TransportError};
