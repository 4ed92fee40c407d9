//! # Frame Codec
//!
//! Length-prefixed JSON frames: a `u32` big-endian payload length followed
//! by one serialized message. The peer proxy reads and writes frames over
//! blocking streams; the worker reads the prefix and payload with its own
//! I/O and decodes through `decode_payload`.
//!
//! Oversized length prefixes are rejected before any allocation so a
//! corrupt or hostile peer cannot force a huge buffer.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{GkvError, GkvResult};

/// Upper bound on a single frame payload (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serializes `msg` into a complete frame (prefix + payload).
pub fn encode_frame<T: Serialize>(msg: &T) -> GkvResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(msg).map_err(|err| GkvError::Protocol(format!("encode: {err}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(GkvError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes a frame payload (without the length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> GkvResult<T> {
    serde_json::from_slice(payload).map_err(|err| GkvError::Protocol(format!("decode: {err}")))
}

/// Validates a length prefix against the frame limit.
pub fn check_frame_len(len: usize) -> GkvResult<usize> {
    if len > MAX_FRAME_LEN {
        return Err(GkvError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    Ok(len)
}

/// Writes one frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> GkvResult<()> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from a blocking stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> GkvResult<T> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = check_frame_len(u32::from_be_bytes(prefix) as usize)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_payload(&payload)
}
