//! The communication server.
//!
//! Accepts TCP connections and runs a request-serving loop per
//! connection, with the system table bound to the four reserved
//! methods (HOLA, LOGIN, CALLBACK, CHAU) and the user table supplied
//! by the caller. Keeps a registry of named clients so that
//! [`Server::push`] can initiate requests *into* clients that
//! registered a callback connection.
//!
//! # Example
//!
//! ```ignore
//! use fleetwire::{HandlerMap, Server};
//!
//! let mut handlers = HandlerMap::new();
//! handlers.register("LEN", |_client, content| async move {
//!     Ok(content.len().to_string().into_bytes())
//! });
//!
//! let mut server = Server::new(handlers);
//! server.listen("0.0.0.0:9000").await?;
//! // ... later, deliver a job to a registered device:
//! server.push("device-7", "BLINK", b"fast");
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{FleetwireError, Result};
use crate::handler::{BoxFuture, HandlerMap};
use crate::protocol::{methods, Status, VERSION};
use crate::serve::{serve_connection, CleanupFn, SystemHandler, SystemTable};

/// Registry entry for a client name.
enum Registered {
    /// Logged in with no callback connection: reachable for requests
    /// it initiates, not for pushes.
    Unidirectional,
    /// Holds a live callback connection reserved for pushes.
    Callback(Arc<Connection>),
}

/// Resolution of a client name at push time. Missing and
/// unidirectional are both failures, but different ones.
enum PushTarget {
    Missing,
    Unidirectional,
    Connected(Arc<Connection>),
}

/// State shared between the accept loop, the per-connection system
/// handlers, and in-flight pushes.
struct ServerShared {
    handlers: Arc<HandlerMap>,
    registry: StdMutex<HashMap<String, Registered>>,
}

impl ServerShared {
    fn lookup(&self, name: &str) -> PushTarget {
        let registry = self.registry.lock().expect("poisoned lock");
        match registry.get(name) {
            None => PushTarget::Missing,
            Some(Registered::Unidirectional) => PushTarget::Unidirectional,
            Some(Registered::Callback(conn)) => PushTarget::Connected(conn.clone()),
        }
    }

    /// HOLA: log the peer's version, answer with ours, keep looping.
    async fn handshake(&self, conn: &Connection, content: Bytes) -> Result<(Vec<u8>, bool)> {
        if content.as_ref() == VERSION {
            tracing::debug!(
                "server: handshake with client {} version {:?}",
                conn.peer(),
                content
            );
        } else {
            tracing::warn!(
                "server: handshake with client {}: peer version {:?}, ours {:?}",
                conn.peer(),
                content,
                VERSION
            );
        }
        Ok((VERSION.to_vec(), false))
    }

    /// LOGIN: name the connection and note the client as reachable
    /// (unidirectionally). A repeated name overwrites: last login wins.
    async fn login(&self, conn: &Connection, content: Bytes) -> Result<(Vec<u8>, bool)> {
        let name = decode_name(&content)?;
        conn.set_name(&name);
        tracing::debug!("server: client {} login; name={:?}", conn.peer(), name);
        self.registry
            .lock()
            .expect("poisoned lock")
            .insert(name, Registered::Unidirectional);
        Ok((b"OK".to_vec(), false))
    }

    /// CALLBACK: reserve this connection as the push target for the
    /// name. The loop ends after the response, but the armed gate
    /// keeps the stream open until the registry lets go of it.
    async fn register_callback(
        &self,
        conn: &Arc<Connection>,
        content: Bytes,
    ) -> Result<(Vec<u8>, bool)> {
        let name = decode_name(&content)?;
        conn.set_name(&name);
        tracing::debug!(
            "server: client {} registers callbacks; name={:?}",
            conn.peer(),
            name
        );
        conn.block_finishing();
        self.registry
            .lock()
            .expect("poisoned lock")
            .insert(name, Registered::Callback(conn.clone()));
        Ok((b"OK".to_vec(), true))
    }

    /// CHAU: answer and end the loop.
    async fn teardown(&self, conn: &Connection, _content: Bytes) -> Result<(Vec<u8>, bool)> {
        tracing::debug!("server: client {} teardown", conn.peer());
        Ok((b"OK".to_vec(), true))
    }

    /// Connection cleanup: let go of the name's push target, releasing
    /// its finish gate. Unidirectional entries are left alone; their
    /// connections die with their own streams.
    fn forget(&self, name: Option<String>) {
        let Some(name) = name else { return };
        let mut registry = self.registry.lock().expect("poisoned lock");
        if let Some(Registered::Callback(conn)) = registry.get(&name) {
            conn.release_finishing();
            registry.remove(&name);
        }
    }

    /// The actual push exchange; runs as its own task.
    async fn push_now(&self, name: &str, method: &str, payload: &[u8]) -> bool {
        let conn = match self.lookup(name) {
            PushTarget::Missing => {
                tracing::error!("server: cannot push, client {:?} is missing", name);
                return false;
            }
            PushTarget::Unidirectional => {
                tracing::error!("server: cannot push, client {:?} is unidirectional", name);
                return false;
            }
            PushTarget::Connected(conn) => conn,
        };

        match conn.exchange(method.as_bytes(), payload).await {
            Ok((Status::Ok, _)) => true,
            Ok((status, content)) => {
                tracing::error!(
                    "server: bad push response! status=0x{:02x} content={:?}",
                    status.as_byte(),
                    content
                );
                false
            }
            Err(err) => {
                tracing::error!("server: push to {:?} failed: {}", name, err);
                false
            }
        }
    }
}

/// Decode a LOGIN/CALLBACK name; a non-UTF-8 name is loop-fatal.
fn decode_name(content: &Bytes) -> Result<String> {
    std::str::from_utf8(content)
        .map(str::to_string)
        .map_err(|_| FleetwireError::Protocol("client name is not valid UTF-8".to_string()))
}

/// Build the system callback table over the shared state.
fn system_table(shared: &Arc<ServerShared>) -> SystemTable {
    fn entry<F>(f: F) -> Box<dyn SystemHandler>
    where
        F: Fn(&Arc<Connection>, Bytes) -> BoxFuture<'static, Result<(Vec<u8>, bool)>>
            + Send
            + Sync
            + 'static,
    {
        Box::new(f)
    }

    type SystemFuture = BoxFuture<'static, Result<(Vec<u8>, bool)>>;

    let mut table = SystemTable::new();

    let s = shared.clone();
    table.insert(
        methods::HOLA,
        entry(move |conn: &Arc<Connection>, content: Bytes| -> SystemFuture {
            let s = s.clone();
            let conn = conn.clone();
            Box::pin(async move { s.handshake(&conn, content).await })
        }),
    );

    let s = shared.clone();
    table.insert(
        methods::LOGIN,
        entry(move |conn: &Arc<Connection>, content: Bytes| -> SystemFuture {
            let s = s.clone();
            let conn = conn.clone();
            Box::pin(async move { s.login(&conn, content).await })
        }),
    );

    let s = shared.clone();
    table.insert(
        methods::CALLBACK,
        entry(move |conn: &Arc<Connection>, content: Bytes| -> SystemFuture {
            let s = s.clone();
            let conn = conn.clone();
            Box::pin(async move { s.register_callback(&conn, content).await })
        }),
    );

    let s = shared.clone();
    table.insert(
        methods::CHAU,
        entry(move |conn: &Arc<Connection>, content: Bytes| -> SystemFuture {
            let s = s.clone();
            let conn = conn.clone();
            Box::pin(async move { s.teardown(&conn, content).await })
        }),
    );

    table
}

/// Accept-loop bookkeeping while the server is live.
struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The communication server.
pub struct Server {
    shared: Arc<ServerShared>,
    system: Arc<SystemTable>,
    listening: Option<Listening>,
}

impl Server {
    /// Create a server with the given user callback table.
    pub fn new(handlers: HandlerMap) -> Self {
        let shared = Arc::new(ServerShared {
            handlers: Arc::new(handlers),
            registry: StdMutex::new(HashMap::new()),
        });
        let system = Arc::new(system_table(&shared));
        Self {
            shared,
            system,
            listening: None,
        }
    }

    /// Bind and start accepting connections.
    pub async fn listen(&mut self, addr: impl ToSocketAddrs) -> Result<()> {
        if self.listening.is_some() {
            return Err(FleetwireError::Protocol(
                "server is already listening".to_string(),
            ));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!("server: listening on {}", local_addr);

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let system = self.system.clone();
        let handlers = self.shared.handlers.clone();
        let cleanup: CleanupFn = {
            let shared = self.shared.clone();
            Arc::new(move |name| shared.forget(name))
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let conn = Arc::new(Connection::new(stream));
                            tokio::spawn(serve_connection(
                                conn,
                                system.clone(),
                                handlers.clone(),
                                Some(cleanup.clone()),
                            ));
                        }
                        Err(err) => {
                            tracing::error!("server: accept failed: {}", err);
                        }
                    },
                }
            }
        });

        self.listening = Some(Listening {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Address the server is bound to, while listening. Useful when
    /// binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    /// Schedule a push to a named client and return immediately.
    ///
    /// The returned handle resolves to whether the push succeeded
    /// (client known, callback-registered, and answered OK); failures
    /// are logged, never raised. The handle can be dropped for pure
    /// fire-and-forget.
    pub fn push(&self, client_name: &str, method: &str, payload: &[u8]) -> JoinHandle<bool> {
        let shared = self.shared.clone();
        let client_name = client_name.to_string();
        let method = method.to_string();
        let payload = payload.to_vec();
        tokio::spawn(async move { shared.push_now(&client_name, &method, &payload).await })
    }

    /// Stop accepting new connections and wait for the listening
    /// socket to close. Existing connections are left to the clients.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(listening) = self.listening.take() else {
            return Err(FleetwireError::Protocol(
                "tried to stop a server that is not listening".to_string(),
            ));
        };
        let _ = listening.shutdown.send(());
        let _ = listening.task.await;
        tracing::debug!("server: stopped listening on {}", listening.local_addr);
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn shared() -> Arc<ServerShared> {
        Arc::new(ServerShared {
            handlers: Arc::new(HandlerMap::new()),
            registry: StdMutex::new(HashMap::new()),
        })
    }

    fn test_conn() -> Arc<Connection> {
        let (side, _other) = duplex(64);
        Arc::new(Connection::from_stream(Box::new(side), "test-peer"))
    }

    #[tokio::test]
    async fn test_login_registers_unidirectional() {
        let shared = shared();
        let conn = test_conn();

        let (response, done) = shared
            .login(&conn, Bytes::from_static(b"node-1"))
            .await
            .unwrap();
        assert_eq!(response, b"OK");
        assert!(!done);
        assert_eq!(conn.name(), Some("node-1".to_string()));
        assert!(matches!(shared.lookup("node-1"), PushTarget::Unidirectional));
    }

    #[tokio::test]
    async fn test_register_callback_arms_gate_and_ends_loop() {
        let shared = shared();
        let conn = test_conn();

        let (response, done) = shared
            .register_callback(&conn, Bytes::from_static(b"node-1"))
            .await
            .unwrap();
        assert_eq!(response, b"OK");
        assert!(done);
        assert!(matches!(shared.lookup("node-1"), PushTarget::Connected(_)));
    }

    #[tokio::test]
    async fn test_login_is_last_write_wins() {
        let shared = shared();
        let first = test_conn();
        let second = test_conn();

        shared
            .register_callback(&first, Bytes::from_static(b"dup"))
            .await
            .unwrap();
        shared
            .login(&second, Bytes::from_static(b"dup"))
            .await
            .unwrap();

        // the second login silently replaced the push registration
        assert!(matches!(shared.lookup("dup"), PushTarget::Unidirectional));
    }

    #[tokio::test]
    async fn test_non_utf8_name_is_fatal() {
        let shared = shared();
        let conn = test_conn();
        let result = shared.login(&conn, Bytes::from_static(b"\xFF\xFE")).await;
        assert!(matches!(result, Err(FleetwireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_forget_removes_push_target_and_releases_gate() {
        let shared = shared();
        let conn = test_conn();
        shared
            .register_callback(&conn, Bytes::from_static(b"node-1"))
            .await
            .unwrap();

        shared.forget(Some("node-1".to_string()));
        assert!(matches!(shared.lookup("node-1"), PushTarget::Missing));
        // gate was released: finish() must not hang
        conn.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_leaves_unidirectional_entries() {
        let shared = shared();
        let conn = test_conn();
        shared
            .login(&conn, Bytes::from_static(b"node-1"))
            .await
            .unwrap();

        shared.forget(Some("node-1".to_string()));
        assert!(matches!(shared.lookup("node-1"), PushTarget::Unidirectional));
    }

    #[tokio::test]
    async fn test_push_now_missing_and_unidirectional_fail() {
        let shared = shared();
        assert!(!shared.push_now("ghost", "X", b"").await);

        let conn = test_conn();
        shared
            .login(&conn, Bytes::from_static(b"node-1"))
            .await
            .unwrap();
        assert!(!shared.push_now("node-1", "X", b"").await);
    }

    #[tokio::test]
    async fn test_stop_without_listen_is_an_error() {
        let mut server = Server::new(HandlerMap::new());
        assert!(matches!(
            server.stop().await,
            Err(FleetwireError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_and_stop() {
        let mut server = Server::new(HandlerMap::new());
        server.listen("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        server.stop().await.unwrap();
        assert!(server.local_addr().is_none());
    }
}
