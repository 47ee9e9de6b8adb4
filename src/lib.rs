//! # fleetwire
//!
//! Minimal bidirectional RPC over TCP for a fleet of embedded nodes
//! and their management node.
//!
//! The protocol is a hand-rolled binary framing format with a content
//! checksum, a request/response discipline with no transaction IDs
//! (strictly one request in flight per connection), and a push
//! mechanism that lets the *server* initiate calls into a *client*
//! over a dedicated reverse connection.
//!
//! ## Architecture
//!
//! - **Forward connection**: a client sends requests to the server.
//! - **Callback connection**: a second connection the client opens and
//!   registers so the server can push requests back into it. Pushes
//!   are ordinary request/response exchanges with the roles swapped.
//!
//! ## Example
//!
//! ```ignore
//! use fleetwire::{Client, HandlerMap, Server};
//!
//! // management side
//! let mut handlers = HandlerMap::new();
//! handlers.register("LEN", |_client, content| async move {
//!     Ok(content.len().to_string().into_bytes())
//! });
//! let mut server = Server::new(handlers);
//! server.listen("0.0.0.0:9000").await?;
//!
//! // device side
//! let client = Client::builder("device-7")
//!     .handler("BLINK", |_client, content| async move {
//!         // react to a server push
//!         Ok(Vec::new())
//!     })
//!     .connect("10.0.0.1:9000")
//!     .await?;
//!
//! let (status, content) = client.request("LEN", b"hello").await?;
//! server.push("device-7", "BLINK", b"fast");
//! ```

pub mod error;
pub mod handler;
pub mod protocol;

mod client;
mod connection;
mod serve;
mod server;

pub use client::{Client, ClientBuilder};
pub use connection::Connection;
pub use error::FleetwireError;
pub use handler::{Handler, HandlerMap};
pub use protocol::Status;
pub use server::Server;
