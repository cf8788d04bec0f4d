//! Length-prefixed JSON frame codec.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON body. The
//! length bounds a single read so a misbehaving peer cannot make the
//! scheduler buffer unbounded input.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::frame::Frame;

/// Maximum frame length accepted on the wire.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Read one frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Closed);
        }
        return Err(FrameError::Io(e));
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut body).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(FrameError::Closed);
        }
        return Err(FrameError::Io(e));
    }

    serde_json::from_slice(&body).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Write one frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let body = serde_json::to_vec(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
