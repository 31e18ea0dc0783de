//! Length-prefixed framing: `u32_be length ‖ payload[length]`.
//!
//! This is the outermost layer of the wire format — it wraps whatever
//! obfuscation already produced, so the length prefix always covers the
//! obfuscated bytes, not the inner message.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// A frame whose declared length exceeds this is rejected as `Protocol`,
/// per the "boundaries" testable property.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame. A declared length of 0 is valid and
/// yields an empty vector.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Protocol(format!("frame length {len} exceeds {MAX_FRAME_LEN}")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::Protocol(format!("frame length {} exceeds {MAX_FRAME_LEN}", payload.len())));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_arbitrary_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let out = read_frame(&mut cursor).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn zero_length_frame_is_valid() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[]).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let out = read_frame(&mut cursor).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }
}
