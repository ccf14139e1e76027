//! Frame codec for child-process worker channels.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte prefix.
//!
//! The first parent→child frame is always [`FRAME_STARTUP`]; everything after
//! that, in both directions, is a [`FRAME_MESSAGE`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::message::WorkerMessage;

/// Frame kind: startup payload of a worker.
pub const FRAME_STARTUP: u8 = 0x01;
/// Frame kind: channel envelope.
pub const FRAME_MESSAGE: u8 = 0x02;

/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 5 * 1024 * 1024;

/// Read one frame. Returns `None` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {frame_len} bytes"),
        ));
    }
    if frame_len < 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too short: missing kind byte",
        ));
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).await?;
    let payload = frame.split_off(1);

    Ok(Some((frame[0], payload)))
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("msgpack encode: {e}"))
    })
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    rmp_serde::from_slice(payload).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("msgpack decode: {e}"))
    })
}

/// Encode and write a value as a frame of the given kind.
pub async fn write_value<W, T>(writer: &mut W, kind: u8, value: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = encode(value)?;
    write_frame(writer, kind, &payload).await
}

pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &WorkerMessage,
) -> io::Result<()> {
    write_value(writer, FRAME_MESSAGE, message).await
}

/// Read the next frame and decode it as `T`, checking its kind.
pub async fn read_value<R, T>(reader: &mut R, kind: u8, max_frame_bytes: u32) -> io::Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader, max_frame_bytes).await? {
        None => Ok(None),
        Some((found, payload)) if found == kind => decode(&payload).map(Some),
        Some((found, _)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected frame kind 0x{found:02x}, wanted 0x{kind:02x}"),
        )),
    }
}

pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<WorkerMessage>> {
    read_value(reader, FRAME_MESSAGE, max_frame_bytes).await
}
