//! User callback table for dispatching requests by method name.
//!
//! A [`HandlerMap`] maps method names to asynchronous handlers. Both
//! the server (for requests from clients) and the client (for pushes
//! arriving on its callback connection) consume one.
//!
//! # Example
//!
//! ```
//! use fleetwire::HandlerMap;
//!
//! let mut handlers = HandlerMap::new();
//! handlers.register("LEN", |_client, content| async move {
//!     Ok(content.len().to_string().into_bytes())
//! });
//!
//! assert!(handlers.get(b"LEN").is_some());
//! assert!(handlers.get(b"NOPE").is_none());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::Result;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for user request handlers.
///
/// `client` is the logical name of the peer the request came from
/// (`None` until it has logged in; always `None` on a client's own
/// callback connection). The returned bytes become the content of an
/// OK response; an error becomes the content of an error-status
/// response and does not end the connection.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, client: Option<String>, content: Bytes) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Wrapper implementing [`Handler`] for async closures.
struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Option<String>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    fn call(&self, client: Option<String>, content: Bytes) -> BoxFuture<'static, Result<Vec<u8>>> {
        Box::pin((self.handler)(client, content))
    }
}

/// Registry mapping method names to user handlers.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<Vec<u8>, Box<dyn Handler>>,
}

impl HandlerMap {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a method name.
    ///
    /// Re-registering a name replaces the previous handler.
    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Option<String>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        self.handlers
            .insert(method.as_bytes().to_vec(), Box::new(FnHandler { handler }));
    }

    /// Get a handler by method name.
    pub fn get(&self, method: &[u8]) -> Option<&dyn Handler> {
        self.handlers.get(method).map(|h| h.as_ref())
    }

    /// Whether any handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("methods", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetwireError;

    #[tokio::test]
    async fn test_register_and_call() {
        let mut map = HandlerMap::new();
        map.register("ECHO", |_client, content| async move {
            Ok(content.to_vec())
        });

        let handler = map.get(b"ECHO").unwrap();
        let result = handler
            .call(Some("node-1".to_string()), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(result, b"hi");
    }

    #[tokio::test]
    async fn test_handler_receives_client_name() {
        let mut map = HandlerMap::new();
        map.register("WHO", |client, _content| async move {
            Ok(client.unwrap_or_else(|| "anonymous".to_string()).into_bytes())
        });

        let handler = map.get(b"WHO").unwrap();
        let named = handler
            .call(Some("node-7".to_string()), Bytes::new())
            .await
            .unwrap();
        assert_eq!(named, b"node-7");

        let anonymous = handler.call(None, Bytes::new()).await.unwrap();
        assert_eq!(anonymous, b"anonymous");
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let mut map = HandlerMap::new();
        map.register("FAIL", |_client, _content| async move {
            Err(FleetwireError::Handler("oops".to_string()))
        });

        let handler = map.get(b"FAIL").unwrap();
        let result = handler.call(None, Bytes::new()).await;
        assert!(matches!(result, Err(FleetwireError::Handler(_))));
    }

    #[test]
    fn test_missing_handler() {
        let map = HandlerMap::new();
        assert!(map.get(b"nonexistent").is_none());
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_reregister_replaces() {
        let mut map = HandlerMap::new();
        map.register("M", |_c, _b| async { Ok(b"first".to_vec()) });
        map.register("M", |_c, _b| async { Ok(b"second".to_vec()) });
        assert_eq!(map.len(), 1);
    }
}
