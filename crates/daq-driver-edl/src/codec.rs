//! Wire encoding for device commands.
//!
//! Every command travels as a fixed 8-byte frame:
//!
//! ```text
//! ┌──────┬────────┬──────┬──────────────────────┬──────────┐
//! │ 0xE4 │ cmd id │ kind │ payload (4 bytes LE) │ checksum │
//! └──────┴────────┴──────┴──────────────────────┴──────────┘
//! ```
//!
//! - radio payloads are the option index as `u32`
//! - checkbox/button payloads are `0` or `1` as `u32`
//! - value payloads are the engineering value as `f32`
//! - the checksum is the XOR of the seven preceding bytes
//!
//! A batch is the concatenation of frames and is written to the transport
//! in a single call. The link probe sent during connection uses the reserved
//! id `0xFF`.
//!
//! Encoding is pure: no I/O is performed here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::command::{Command, CommandConfig, CommandId, CommandKind, Payload};
use crate::error::Result;

/// Frame start byte.
pub const SYNC: u8 = 0xE4;

/// Length of one encoded frame.
pub const FRAME_LEN: usize = 8;

const PROBE_ID: u8 = 0xFF;

/// Errors decoding a frame stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// The stream ends inside a frame.
    #[error("Truncated frame: {len} trailing bytes")]
    Truncated {
        /// Bytes left over after the last whole frame
        len: usize,
    },

    /// A frame does not start with the sync byte.
    #[error("Bad sync byte 0x{found:02X} at offset {offset}")]
    BadSync {
        /// Byte offset of the frame
        offset: usize,
        /// Byte found instead
        found: u8,
    },

    /// The XOR checksum does not match the frame body.
    #[error("Checksum mismatch at offset {offset}")]
    BadChecksum {
        /// Byte offset of the frame
        offset: usize,
    },

    /// The id byte is outside the command table.
    #[error("Unknown command id {id} at offset {offset}")]
    UnknownCommand {
        /// Byte offset of the frame
        offset: usize,
        /// Id byte as received
        id: u8,
    },

    /// The kind tag disagrees with the command table.
    #[error("Kind tag {tag} does not match command {id}")]
    KindMismatch {
        /// Decoded command
        id: CommandId,
        /// Tag byte as received
        tag: u8,
    },
}

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    /// Link probe written during connection.
    Probe,
    /// A device command.
    Command(Command),
}

/// Encode a command from its raw id and payload record.
///
/// Fails with `CommandIdOutOfRange` for ids outside the device table.
pub fn encode_raw(raw_id: u32, config: &CommandConfig) -> Result<Bytes> {
    let id = CommandId::from_raw(raw_id)?;
    let command = Command::from_config(id, config)?;
    Ok(encode_batch(std::slice::from_ref(&command)))
}

/// Encode a single command into `buf`.
pub fn encode_into(command: &Command, buf: &mut BytesMut) {
    let payload = match command.payload {
        Payload::Radio(idx) => idx.to_le_bytes(),
        Payload::Checkbox(on) | Payload::Button(on) => u32::from(on).to_le_bytes(),
        Payload::Value(v) => (v as f32).to_le_bytes(),
    };
    put_frame(buf, command.id.raw(), command.kind().tag(), payload);
}

/// Encode a batch of commands as one contiguous write.
pub fn encode_batch(commands: &[Command]) -> Bytes {
    let mut buf = BytesMut::with_capacity(commands.len() * FRAME_LEN);
    for command in commands {
        encode_into(command, &mut buf);
    }
    buf.freeze()
}

/// The link probe frame.
pub fn probe_frame() -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    put_frame(&mut buf, PROBE_ID, 0, [0; 4]);
    buf.freeze()
}

/// Decode a stream of frames.
pub fn decode_frames(data: &[u8]) -> std::result::Result<Vec<Frame>, FrameError> {
    if data.len() % FRAME_LEN != 0 {
        return Err(FrameError::Truncated {
            len: data.len() % FRAME_LEN,
        });
    }

    data.chunks_exact(FRAME_LEN)
        .enumerate()
        .map(|(n, chunk)| decode_frame(chunk, n * FRAME_LEN))
        .collect()
}

fn decode_frame(chunk: &[u8], offset: usize) -> std::result::Result<Frame, FrameError> {
    if chunk[0] != SYNC {
        return Err(FrameError::BadSync {
            offset,
            found: chunk[0],
        });
    }
    if checksum(&chunk[..FRAME_LEN - 1]) != chunk[FRAME_LEN - 1] {
        return Err(FrameError::BadChecksum { offset });
    }

    let raw_id = chunk[1];
    if raw_id == PROBE_ID {
        return Ok(Frame::Probe);
    }
    let id = CommandId::from_raw(u32::from(raw_id))
        .map_err(|_| FrameError::UnknownCommand { offset, id: raw_id })?;
    let tag = chunk[2];
    let kind = CommandKind::from_tag(tag).filter(|k| *k == id.kind());
    let Some(kind) = kind else {
        return Err(FrameError::KindMismatch { id, tag });
    };

    let mut payload = &chunk[3..7];
    let payload = match kind {
        CommandKind::Radio => Payload::Radio(payload.get_u32_le()),
        CommandKind::Checkbox => Payload::Checkbox(payload.get_u32_le() != 0),
        CommandKind::PushButton => Payload::Button(payload.get_u32_le() != 0),
        CommandKind::Value => Payload::Value(f64::from(payload.get_f32_le())),
    };

    Ok(Frame::Command(Command { id, payload }))
}

fn put_frame(buf: &mut BytesMut, id: u8, tag: u8, payload: [u8; 4]) {
    let start = buf.len();
    buf.put_u8(SYNC);
    buf.put_u8(id);
    buf.put_u8(tag);
    buf.put_slice(&payload);
    let sum = checksum(&buf[start..]);
    buf.put_u8(sum);
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}
