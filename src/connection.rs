//! A single protocol connection and its bookkeeping.
//!
//! A [`Connection`] owns one framed duplex byte stream plus the state
//! that outlives individual requests: the peer address (cached at
//! creation), an optional logical name (set by the login/registration
//! system handlers), and an optional finish gate that keeps the stream
//! open after its serving loop has ended, until the registry releases
//! it.
//!
//! The stream sits behind an async mutex and is locked for the whole
//! of each request/response exchange. That one lock is the protocol's
//! single-flight discipline: there is no correlation ID on the wire,
//! so at most one exchange may be outstanding per connection.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::error::{FleetwireError, Result};
use crate::protocol::{build_request, parse_response, read_frame, write_frame, DecodedFrame, Status};

/// Byte stream a connection can run over. Type-erased so tests can
/// substitute in-memory duplex pipes for TCP sockets.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// One live connection: stream, peer identity, optional name, and an
/// optional finish gate.
pub struct Connection {
    /// The framed stream; locked per exchange / per loop iteration.
    pub(crate) io: Mutex<Box<dyn Io>>,
    /// Peer address, cached at creation time.
    peer: String,
    /// Logical name, set once after login or callback registration.
    name: StdMutex<Option<String>>,
    /// Armed to keep the stream open after the serving loop exits.
    gate: StdMutex<Option<Arc<Notify>>>,
}

impl Connection {
    /// Wrap an accepted or connected TCP stream.
    pub(crate) fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown-address>".to_string());
        Self::from_stream(Box::new(stream), peer)
    }

    /// Wrap an arbitrary byte stream (tests use duplex pipes).
    pub(crate) fn from_stream(io: Box<dyn Io>, peer: impl Into<String>) -> Self {
        Self {
            io: Mutex::new(io),
            peer: peer.into(),
            name: StdMutex::new(None),
            gate: StdMutex::new(None),
        }
    }

    /// Peer address as cached at creation time.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Logical name, if login or registration has happened.
    pub fn name(&self) -> Option<String> {
        self.name.lock().expect("poisoned lock").clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.lock().expect("poisoned lock") = Some(name.to_string());
    }

    /// Arm the finish gate: cleanup will wait for a release before
    /// closing the stream.
    pub(crate) fn block_finishing(&self) {
        *self.gate.lock().expect("poisoned lock") = Some(Arc::new(Notify::new()));
    }

    /// Release an armed finish gate. A release that arrives before the
    /// wait is not lost (the notify permit is stored).
    pub(crate) fn release_finishing(&self) {
        if let Some(gate) = self.gate.lock().expect("poisoned lock").as_ref() {
            gate.notify_one();
        }
    }

    /// Clean up: wait on the gate if armed, then shut the stream down.
    pub(crate) async fn finish(&self) -> Result<()> {
        let gate = self.gate.lock().expect("poisoned lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
            *self.gate.lock().expect("poisoned lock") = None;
        }

        let mut io = self.io.lock().await;
        io.shutdown().await?;
        Ok(())
    }

    /// Perform one full request/response exchange, holding the stream
    /// for its whole duration.
    pub(crate) async fn exchange(&self, method: &[u8], content: &[u8]) -> Result<(Status, Bytes)> {
        let payload = build_request(method, content)?;

        let mut io = self.io.lock().await;
        write_frame(&mut *io, &payload).await?;

        match read_frame(&mut *io).await? {
            DecodedFrame::Intact(response) => parse_response(&response),
            DecodedFrame::Corrupt => Err(FleetwireError::Protocol(
                "corrupt response frame".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("name", &self.name())
            .finish()
    }
}
