//! Frame encoding and decoding.
//!
//! Every message travels inside one frame:
//!
//! ```text
//! ┌──────────┬───────────────────┬───────────┬──────────┐
//! │ size_len │ payload_len       │ payload   │ checksum │
//! │ 1 byte   │ size_len bytes BE │ N bytes   │ 2 bytes  │
//! └──────────┴───────────────────┴───────────┴──────────┘
//! ```
//!
//! `size_len` is the minimum number of bytes able to represent
//! `payload_len` (at least 1); the checksum is the low 2 bytes of the
//! SHA-1 digest of the payload. The decoder accepts any `size_len`,
//! minimal or not.
//!
//! A checksum mismatch is not an error here: it surfaces as
//! [`DecodedFrame::Corrupt`] and the call site decides what a corrupted
//! frame means for its connection. A short read is always
//! [`FleetwireError::ConnectionClosed`].

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FleetwireError, Result};

/// Outcome of reading one frame from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Payload arrived with a matching checksum.
    Intact(Bytes),
    /// Payload arrived but the checksum did not match.
    Corrupt,
}

/// Low 2 bytes of the SHA-1 digest of `payload`.
pub fn checksum(payload: &[u8]) -> [u8; 2] {
    let digest = Sha1::digest(payload);
    [digest[18], digest[19]]
}

/// Minimum number of bytes needed to represent `len`, at least 1.
fn size_len_for(len: usize) -> usize {
    let bits = (usize::BITS - len.leading_zeros()) as usize;
    bits.div_ceil(8).max(1)
}

/// Encode `payload` into a complete frame.
///
/// # Example
///
/// ```
/// use fleetwire::protocol::encode_frame;
///
/// let frame = encode_frame(b"hi");
/// assert_eq!(frame[0], 1); // one length byte suffices
/// assert_eq!(frame[1], 2); // payload length
/// assert_eq!(&frame[2..4], b"hi");
/// assert_eq!(frame.len(), 1 + 1 + 2 + 2);
/// ```
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let payload_len = payload.len();
    let size_len = size_len_for(payload_len);

    let mut buf = Vec::with_capacity(1 + size_len + payload_len + 2);
    buf.push(size_len as u8);
    buf.extend_from_slice(&payload_len.to_be_bytes()[std::mem::size_of::<usize>() - size_len..]);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&checksum(payload));
    buf
}

/// Read exactly `buf.len()` bytes, mapping end-of-stream to the
/// distinct connection-closed condition.
async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FleetwireError::ConnectionClosed)
        }
        Err(err) => Err(err.into()),
    }
}

/// Read one complete frame from `reader`.
///
/// Returns [`DecodedFrame::Corrupt`] (after logging the discrepancy)
/// when the checksum does not match; the payload is consumed either
/// way, so the stream stays framed.
pub async fn read_frame<R>(reader: &mut R) -> Result<DecodedFrame>
where
    R: AsyncRead + Unpin,
{
    let mut size_len = [0u8; 1];
    read_exact_or_closed(reader, &mut size_len).await?;

    let mut len_field = vec![0u8; size_len[0] as usize];
    read_exact_or_closed(reader, &mut len_field).await?;

    let mut payload_len: u64 = 0;
    for &byte in &len_field {
        if payload_len > u64::MAX >> 8 {
            return Err(FleetwireError::Protocol(
                "length field overflows u64".to_string(),
            ));
        }
        payload_len = (payload_len << 8) | u64::from(byte);
    }
    let payload_len = usize::try_from(payload_len)
        .map_err(|_| FleetwireError::Protocol("length field exceeds address space".to_string()))?;

    let mut payload = vec![0u8; payload_len];
    read_exact_or_closed(reader, &mut payload).await?;

    let mut received = [0u8; 2];
    read_exact_or_closed(reader, &mut received).await?;

    let expected = checksum(&payload);
    if expected != received {
        tracing::error!(
            "bad read! payload_len={} verifiers: should={:02x?} real={:02x?}",
            payload_len,
            expected,
            received
        );
        return Ok(DecodedFrame::Corrupt);
    }

    Ok(DecodedFrame::Intact(Bytes::from(payload)))
}

/// Encode `payload` and write the frame out, flushing when done.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}
