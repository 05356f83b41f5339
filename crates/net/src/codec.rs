//! Frame codec for peer connections.
//!
//! # Wire Format
//!
//! ```text
//! [length: u64 big-endian][payload: length bytes]
//! ```
//!
//! Frames above 1 MiB are rejected on both the write and the read side; an
//! oversized inbound length is treated as a terminal decoding error by the
//! connection that observes it.

use crate::NetworkError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload length.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Length prefix size in bytes.
const LEN_PREFIX: usize = 8;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LEN_PREFIX];
    reader.read_exact(&mut len_bytes).await?;
    let len = u64::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
