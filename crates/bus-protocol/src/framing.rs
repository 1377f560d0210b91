//! Length-prefixed frame codec.
//!
//! A frame is a 4-byte big-endian unsigned length header followed by exactly
//! that many payload bytes.  Writers emit header + payload as one contiguous
//! write so frames from concurrent writers (serialised by a per-connection
//! write lock) never interleave.  Readers loop on short reads until the frame
//! is complete.

use crate::envelope::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (10 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Failure modes surfaced by the codec.
///
/// `Closed` is a clean end-of-stream (the peer shut down between frames);
/// `UnexpectedEof` means the stream died with a frame in flight and the
/// connection can no longer be trusted to be frame-aligned.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("frame of {len} bytes exceeds maximum {max}")]
    Oversize { len: usize, max: usize },
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one frame payload.
///
/// Reads exactly [`HEADER_LEN`] bytes, interprets them as a big-endian
/// unsigned length, then reads that many payload bytes.  An oversize header
/// is rejected *before* any payload byte is consumed.
pub async fn read_frame<R>(source: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = source.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::UnexpectedEof
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(FrameError::Oversize { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        source.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::UnexpectedEof
            } else {
                FrameError::Io(e)
            }
        })?;
    }
    Ok(payload)
}

/// Write one frame: header and payload in a single contiguous write.
pub async fn write_frame<W>(sink: &mut W, payload: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len {
        return Err(FrameError::Oversize {
            len: payload.len(),
            max: max_len,
        });
    }
    let header = u32::try_from(payload.len())
        .map_err(|_| FrameError::Oversize {
            len: payload.len(),
            max: max_len,
        })?
        .to_be_bytes();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    sink.write_all(&frame).await?;
    sink.flush().await?;
    Ok(())
}

/// Read one frame and decode the envelope inside it.
pub async fn read_envelope<R>(source: &mut R, max_len: usize) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(source, max_len).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode an envelope and write it as one frame.
pub async fn write_envelope<W>(
    sink: &mut W,
    envelope: &Envelope,
    max_len: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(envelope)?;
    write_frame(sink, &payload, max_len).await
}
