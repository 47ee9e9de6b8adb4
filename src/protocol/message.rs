//! Request and response messages carried in frame payloads.
//!
//! A request is `method ++ 0x00 ++ content`; a response is
//! `status_byte ++ content`. Parsing never allocates: both halves are
//! zero-copy slices of the frame payload.

use bytes::Bytes;

use crate::error::{FleetwireError, Result};
use crate::protocol::NULL;

/// Response status byte.
///
/// The values read like HTTP status codes with the middle digit
/// dropped: 0x20 ~ 200, 0x44 ~ 404, 0x50 ~ 500, 0x52 ~ 502.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The method succeeded.
    Ok = 0x20,
    /// No handler registered for the method.
    Miss = 0x44,
    /// The serving loop failed while handling the request.
    Crash = 0x50,
    /// The user handler failed to execute properly.
    Error = 0x52,
}

impl Status {
    /// Wire byte for this status.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte, `None` if it is not a known status.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(Status::Ok),
            0x44 => Some(Status::Miss),
            0x50 => Some(Status::Crash),
            0x52 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Build a request payload from method and content.
///
/// The method must not contain the `0x00` separator.
pub fn build_request(method: &[u8], content: &[u8]) -> Result<Vec<u8>> {
    if method.contains(&NULL) {
        return Err(FleetwireError::Protocol(format!(
            "method contains the separator byte: {:?}",
            method
        )));
    }
    let mut payload = Vec::with_capacity(method.len() + 1 + content.len());
    payload.extend_from_slice(method);
    payload.push(NULL);
    payload.extend_from_slice(content);
    Ok(payload)
}

/// Split a request payload into method and content.
///
/// Returns `None` (after logging) when the separator is absent, which
/// also covers the empty payload a corrupted frame degrades to.
pub fn parse_request(payload: &Bytes) -> Option<(Bytes, Bytes)> {
    let Some(pos) = payload.iter().position(|&b| b == NULL) else {
        tracing::error!("bad request! no separator found: {:?}", payload);
        return None;
    };
    Some((payload.slice(..pos), payload.slice(pos + 1..)))
}

/// Build a response payload from status and content.
pub fn build_response(status: Status, content: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + content.len());
    payload.push(status.as_byte());
    payload.extend_from_slice(content);
    payload
}

/// Split a response payload into status and content.
///
/// An empty payload or an unknown status byte is a protocol error;
/// neither can come from a conforming peer once framing succeeded.
pub fn parse_response(payload: &Bytes) -> Result<(Status, Bytes)> {
    let Some(&first) = payload.first() else {
        return Err(FleetwireError::Protocol(
            "empty response payload".to_string(),
        ));
    };
    let status = Status::from_byte(first).ok_or_else(|| {
        FleetwireError::Protocol(format!("unknown status byte 0x{:02x}", first))
    })?;
    Ok((status, payload.slice(1..)))
}
