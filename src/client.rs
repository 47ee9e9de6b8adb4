//! Client builder and lifecycle.
//!
//! [`ClientBuilder`] provides a fluent API for registering push
//! handlers and connecting. [`Client`] manages the lifecycle:
//! 1. Open the forward connection
//! 2. Handshake (HOLA) and login (LOGIN)
//! 3. If handlers were registered: open the callback connection, send
//!    CALLBACK, and run a serving loop on it so the server can push
//! 4. `request` / `close`
//!
//! # Example
//!
//! ```ignore
//! use fleetwire::Client;
//!
//! let client = Client::builder("device-7")
//!     .handler("BLINK", |_client, content| async move {
//!         println!("server pushed: {:?}", content);
//!         Ok(Vec::new())
//!     })
//!     .connect("10.0.0.1:9000")
//!     .await?;
//!
//! let (status, content) = client.request("REPORT", b"").await?;
//! client.close().await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::Result;
use crate::handler::HandlerMap;
use crate::protocol::{methods, Status, VERSION};
use crate::serve::{serve_connection, SystemTable};

/// Builder for configuring and connecting a client.
pub struct ClientBuilder {
    name: String,
    handlers: HandlerMap,
}

impl ClientBuilder {
    /// Create a builder for a client with the given logical name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HandlerMap::new(),
        }
    }

    /// Register a handler for server-initiated pushes.
    ///
    /// Registering at least one handler makes `connect` open the
    /// callback connection.
    pub fn handler<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Option<String>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        self.handlers.register(method, handler);
        self
    }

    /// Connect to a server: handshake, login, and (if handlers were
    /// registered) callback registration.
    pub async fn connect(self, addr: impl ToSocketAddrs + Clone) -> Result<Client> {
        let name = self.name;

        let stream = TcpStream::connect(addr.clone()).await?;
        let forward = Arc::new(Connection::new(stream));
        tracing::debug!("client: connected to {}", forward.peer());

        // initial handshake to know server capabilities
        match forward.exchange(methods::HOLA, VERSION).await? {
            (Status::Ok, content) => {
                if content.as_ref() == VERSION {
                    tracing::debug!("client: handshake OK; server version {:?}", content);
                } else {
                    tracing::warn!(
                        "client: handshake OK; server version {:?}, ours {:?}",
                        content,
                        VERSION
                    );
                }
            }
            (status, content) => tracing::error!(
                "client: handshake problem; response 0x{:02x} {:?}",
                status.as_byte(),
                content
            ),
        }

        // standard login
        match forward.exchange(methods::LOGIN, name.as_bytes()).await? {
            (Status::Ok, _) => tracing::debug!("client: login OK"),
            (status, content) => tracing::error!(
                "client: login rejected; response 0x{:02x} {:?}",
                status.as_byte(),
                content
            ),
        }

        // if needed, indicate we can receive callbacks through a new
        // connection; registration is the only request the client ever
        // sends on it, the rest of its life is answering pushes
        let (callback, callback_task) = if self.handlers.is_empty() {
            (None, None)
        } else {
            let stream = TcpStream::connect(addr).await?;
            let callback = Arc::new(Connection::new(stream));
            match callback.exchange(methods::CALLBACK, name.as_bytes()).await? {
                (Status::Ok, _) => tracing::debug!("client: register callback OK"),
                (status, content) => tracing::error!(
                    "client: register problem; response 0x{:02x} {:?}",
                    status.as_byte(),
                    content
                ),
            }

            let task = tokio::spawn(serve_connection(
                callback.clone(),
                Arc::new(SystemTable::new()),
                Arc::new(self.handlers),
                None,
            ));
            (Some(callback), Some(task))
        };

        Ok(Client {
            name,
            forward,
            callback,
            callback_task,
        })
    }
}

/// A connected client.
pub struct Client {
    name: String,
    forward: Arc<Connection>,
    callback: Option<Arc<Connection>>,
    callback_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a client builder.
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    /// The client's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one request on the forward connection and await its
    /// response.
    ///
    /// At most one request is in flight at a time: the connection is
    /// held for the whole exchange, so concurrent callers serialize. A
    /// non-OK status is logged and returned for inspection, not raised.
    pub async fn request(&self, method: &str, payload: &[u8]) -> Result<(Status, Bytes)> {
        let (status, content) = self.forward.exchange(method.as_bytes(), payload).await?;
        if status != Status::Ok {
            tracing::error!(
                "client: bad response! status=0x{:02x} content={:?}",
                status.as_byte(),
                content
            );
        }
        Ok((status, content))
    }

    /// Tear down: send CHAU, stop the callback loop, and close both
    /// streams.
    pub async fn close(mut self) -> Result<()> {
        tracing::debug!("client: closing main connection");
        match self.forward.exchange(methods::CHAU, b"").await {
            Ok((Status::Ok, _)) => tracing::debug!("client: teardown OK"),
            Ok((status, content)) => tracing::error!(
                "client: teardown problem; response 0x{:02x} {:?}",
                status.as_byte(),
                content
            ),
            Err(err) => tracing::error!("client: teardown failed: {}", err),
        }

        // aborting the loop task is what frees the callback stream for
        // shutdown; closing the stream is the only cancellation there is
        if let Some(task) = self.callback_task.take() {
            task.abort();
            let _ = task.await;
        }

        let _ = self.forward.finish().await;
        if let Some(callback) = self.callback.take() {
            let _ = callback.finish().await;
        }

        tracing::debug!("client: gone");
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("peer", &self.forward.peer())
            .field("push_capable", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = ClientBuilder::new("device-1");
        assert!(builder.handlers.is_empty());
    }

    #[test]
    fn test_builder_method_chaining() {
        let builder = Client::builder("device-1")
            .handler("ECHO", |_client, content| async move { Ok(content.to_vec()) })
            .handler("PING", |_client, _content| async move { Ok(Vec::new()) });

        assert_eq!(builder.handlers.len(), 2);
        assert!(builder.handlers.get(b"ECHO").is_some());
        assert!(builder.handlers.get(b"PING").is_some());
    }
}
