//! # Frame Codec
//!
//! Wire format of every frame:
//!
//! ```text
//! +--------+-----------+---------------------------+
//! | "TSRA" | len (u32) | bincode(NetworkMessage)   |
//! | 4 B    | 4 B, BE   | len bytes, <= 1 MiB       |
//! +--------+-----------+---------------------------+
//! ```
//!
//! The magic is checked before the length so that random traffic on the
//! P2P port is rejected without allocating.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{FRAME_MAGIC, MAX_FRAME_SIZE};
use crate::message::NetworkMessage;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("message encoding failed: {0}")]
    Encode(String),

    #[error("message decoding failed: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// The peer closed the connection cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Encodes one message into a complete frame.
pub fn encode(message: &NetworkMessage) -> Result<Bytes, CodecError> {
    let body = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_slice(&FRAME_MAGIC);
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Writes one frame and flushes.
pub async fn write_message<W>(writer: &mut W, message: &NetworkMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
pub async fn read_message<R>(reader: &mut R) -> Result<NetworkMessage, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != FRAME_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| CodecError::Decode(e.to_string()))
}
