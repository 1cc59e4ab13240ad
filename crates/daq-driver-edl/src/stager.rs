//! Command staging and commit.
//!
//! Commands reach the device in one of two ways:
//!
//! | kind             | stage                    | send now                              |
//! |------------------|--------------------------|---------------------------------------|
//! | Value            | staged                   | rejected (`TrialValueSendNotDisabled`) |
//! | PushButton       | rejected (`PushButtonSendDisabled`) | written alone, staging untouched |
//! | Radio / Checkbox | staged                   | check values, then everything staged + this one, one write |
//! | ApplyProtocol    | rejected                 | validate, then settings + values + apply, one write |
//!
//! Any commit that carries staged values checks them against the protocol
//! rules first. Values uploaded by a setting commit are held by the device
//! and only start running on `ApplyProtocol`. A rejected call never changes
//! staging, and staging is only cleared once the write that carries it has
//! succeeded.

use tracing::{debug, info};

use crate::codec;
use crate::command::{
    Command, CommandConfig, CommandId, CommandKind, CurrentRange, FinalBandwidth,
    ImmediateCommand, Payload, SamplingRate, StagedCommand,
};
use crate::error::{EdlError, Result};
use crate::protocol::TrialProtocol;
use crate::session::EdlSession;
use crate::transport::{Transport, TransportError};

/// Commands waiting for a commit.
///
/// Settings (radio and checkbox) and protocol values are kept apart because
/// they are released by different commits. Staging a command again replaces
/// the earlier entry in place.
#[derive(Debug, Clone, Default)]
pub struct StagingState {
    settings: Vec<Command>,
    protocol: Vec<Command>,
}

impl StagingState {
    /// Stage `command`, returning whether it replaced an earlier entry.
    pub fn stage(&mut self, command: Command) -> bool {
        let queue = match command.kind() {
            CommandKind::Value => &mut self.protocol,
            _ => &mut self.settings,
        };
        replace_or_push(queue, command)
    }

    /// Staged radio and checkbox commands, in staging order.
    pub fn settings(&self) -> &[Command] {
        &self.settings
    }

    /// Staged protocol values, in staging order.
    pub fn protocol(&self) -> &[Command] {
        &self.protocol
    }

    /// Total number of staged commands.
    pub fn len(&self) -> usize {
        self.settings.len() + self.protocol.len()
    }

    /// `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty() && self.protocol.is_empty()
    }

    /// Drop everything staged.
    pub fn clear(&mut self) {
        self.settings.clear();
        self.protocol.clear();
    }
}

fn replace_or_push(queue: &mut Vec<Command>, command: Command) -> bool {
    match queue.iter_mut().find(|c| c.id == command.id) {
        Some(existing) => {
            *existing = command;
            true
        }
        None => {
            queue.push(command);
            false
        }
    }
}

/// Result of staging a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageReceipt {
    /// The command as staged
    pub command: Command,
    /// An earlier staged entry for the same command was replaced.
    pub replaced: bool,
    /// Commands staged after this call.
    pub pending: usize,
}

/// Result of a write to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    /// Commands written, in wire order.
    pub commands: Vec<Command>,
    /// Bytes handed to the transport
    pub bytes_written: usize,
    /// Protocol now running, for protocol commits.
    pub protocol: Option<TrialProtocol>,
}

impl<T: Transport> EdlSession<T> {
    /// Flag-based command entry point.
    ///
    /// `commit_now = false` stages the command, `true` sends it (see the
    /// module table for what each kind allows).
    pub fn set_command(
        &mut self,
        id: CommandId,
        config: &CommandConfig,
        commit_now: bool,
    ) -> Result<()> {
        self.ensure_connected()?;
        let command = Command::from_config(id, config)?;

        match (command.kind(), commit_now) {
            (CommandKind::Value, false) => self.stage_command(command).map(|_| ()),
            (CommandKind::Value, true) => Err(EdlError::TrialValueSendNotDisabled { command: id }),
            (CommandKind::PushButton, false) => Err(EdlError::PushButtonSendDisabled { command: id }),
            (CommandKind::PushButton, true) if id == CommandId::ApplyProtocol => {
                self.apply_protocol().map(|_| ())
            }
            (CommandKind::PushButton, true) => self.fire(command).map(|_| ()),
            (CommandKind::Radio | CommandKind::Checkbox, false) => {
                self.stage_command(command).map(|_| ())
            }
            (CommandKind::Radio | CommandKind::Checkbox, true) => {
                self.commit_settings(command).map(|_| ())
            }
        }
    }

    /// [`set_command`](Self::set_command) with a raw command id.
    pub fn set_command_raw(
        &mut self,
        raw_id: u32,
        config: &CommandConfig,
        commit_now: bool,
    ) -> Result<()> {
        self.ensure_connected()?;
        let id = CommandId::from_raw(raw_id)?;
        self.set_command(id, config, commit_now)
    }

    /// Stage a radio, checkbox or protocol value command.
    pub fn stage(&mut self, command: StagedCommand) -> Result<StageReceipt> {
        self.ensure_connected()?;
        self.stage_command(command.into())
    }

    /// Send a radio, checkbox or button command now.
    ///
    /// Radio and checkbox commands carry everything staged with them.
    pub fn send(&mut self, command: ImmediateCommand) -> Result<CommitReport> {
        self.ensure_connected()?;
        let command = Command::from(command);
        match command.kind() {
            CommandKind::PushButton => self.fire(command),
            _ => self.commit_settings(command),
        }
    }

    /// Validate and apply the staged protocol.
    ///
    /// The protocol checked is the one currently applied, overridden by the
    /// staged values. On a rule violation nothing is written and staging is
    /// kept. On success staged settings, staged values and the apply command
    /// go out in one write and staging is cleared.
    pub fn apply_protocol(&mut self) -> Result<CommitReport> {
        self.ensure_connected()?;

        let effective = self.applied.merged(self.staging.protocol());
        let protocol = effective.validate(&self.config.limits)?;

        let mut batch = Vec::with_capacity(self.staging.len() + 1);
        batch.extend_from_slice(self.staging.settings());
        batch.extend_from_slice(self.staging.protocol());
        batch.push(Command::apply_protocol());

        let bytes_written = self.write_batch(&batch)?;

        self.record_settings(&batch);
        self.applied = effective;
        self.staging.clear();

        info!(
            protocol = %protocol,
            commands = batch.len(),
            bytes = bytes_written,
            "Applied protocol"
        );

        Ok(CommitReport {
            commands: batch,
            bytes_written,
            protocol: Some(protocol),
        })
    }

    /// Commands currently staged.
    pub fn staged(&self) -> &StagingState {
        &self.staging
    }

    fn stage_command(&mut self, command: Command) -> Result<StageReceipt> {
        if command.kind() == CommandKind::PushButton {
            return Err(EdlError::PushButtonSendDisabled {
                command: command.id,
            });
        }

        let replaced = self.staging.stage(command);
        let pending = self.staging.len();
        debug!(command = %command.id, replaced, pending, "Staged command");

        Ok(StageReceipt {
            command,
            replaced,
            pending,
        })
    }

    fn commit_settings(&mut self, command: Command) -> Result<CommitReport> {
        let values = self.staging.protocol();
        let effective = self.applied.merged(values);
        if !values.is_empty() {
            effective.validate_upload(&self.config.limits)?;
        }

        let mut batch = Vec::with_capacity(self.staging.len() + 1);
        batch.extend(
            self.staging
                .settings()
                .iter()
                .filter(|c| c.id != command.id)
                .copied(),
        );
        batch.extend_from_slice(values);
        batch.push(command);

        let bytes_written = self.write_batch(&batch)?;

        let uploaded = self.staging.protocol().len();
        self.record_settings(&batch);
        self.applied = effective;
        self.staging.clear();

        debug!(
            command = %command.id,
            commands = batch.len(),
            values = uploaded,
            bytes = bytes_written,
            "Committed staged commands"
        );

        Ok(CommitReport {
            commands: batch,
            bytes_written,
            protocol: None,
        })
    }

    fn fire(&mut self, command: Command) -> Result<CommitReport> {
        let batch = vec![command];
        let bytes_written = self.write_batch(&batch)?;
        debug!(command = %command.id, payload = ?command.payload, "Sent button command");
        Ok(CommitReport {
            commands: batch,
            bytes_written,
            protocol: None,
        })
    }

    /// Write a batch of commands in one transport call.
    fn write_batch(&mut self, commands: &[Command]) -> Result<usize> {
        let frames = codec::encode_batch(commands);
        match self.transport.write(&frames) {
            Ok(n) if n == frames.len() => Ok(n),
            Ok(n) => Err(EdlError::WriteToFtdi {
                message: format!("short write: {} of {} bytes", n, frames.len()),
            }),
            Err(TransportError::Disconnected) => Err(self.link_lost()),
            Err(e) => Err(EdlError::WriteToFtdi {
                message: e.to_string(),
            }),
        }
    }

    fn record_settings(&mut self, commands: &[Command]) {
        for command in commands {
            match (command.id, command.payload) {
                (CommandId::Range, Payload::Radio(idx)) => {
                    self.settings.range = CurrentRange::from_radio_id(idx);
                }
                (CommandId::SamplingRate, Payload::Radio(idx)) => {
                    self.settings.sampling_rate = SamplingRate::from_radio_id(idx);
                }
                (CommandId::FinalBandwidth, Payload::Radio(idx)) => {
                    self.settings.bandwidth = FinalBandwidth::from_radio_id(idx);
                }
                (CommandId::Reset, Payload::Checkbox(on)) => {
                    self.settings.reset = Some(on);
                }
                _ => {}
            }
        }
    }
}
