//! The request-serving loop shared by server connections and client
//! callback connections.
//!
//! Each iteration reads one request, dispatches it (system table
//! first, then user table), writes one response, and decides whether
//! to keep looping. Per-request failures (no handler, handler error)
//! are answered and survived; only end-of-stream and loop-level
//! failures end the loop. Cleanup always runs on exit: wait on the
//! finish gate if armed, shut the stream down, then tell the owner via
//! the cleanup callback.
//!
//! The stream mutex is held for a whole read→dispatch→respond
//! iteration. That keeps the connection strictly half-duplex and
//! guarantees that a push scheduled while a registration request is
//! being handled cannot write before the registration response.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{FleetwireError, Result};
use crate::handler::{BoxFuture, HandlerMap};
use crate::protocol::{build_response, parse_request, read_frame, write_frame, DecodedFrame, Status};

/// Protocol-internal handler: unlike user handlers it sees the
/// connection itself and decides whether the loop should stop.
pub(crate) trait SystemHandler: Send + Sync {
    fn call(
        &self,
        conn: &Arc<Connection>,
        content: Bytes,
    ) -> BoxFuture<'static, Result<(Vec<u8>, bool)>>;
}

impl<F> SystemHandler for F
where
    F: Fn(&Arc<Connection>, Bytes) -> BoxFuture<'static, Result<(Vec<u8>, bool)>> + Send + Sync,
{
    fn call(
        &self,
        conn: &Arc<Connection>,
        content: Bytes,
    ) -> BoxFuture<'static, Result<(Vec<u8>, bool)>> {
        self(conn, content)
    }
}

/// System callback table, consulted before the user table.
pub(crate) type SystemTable = HashMap<&'static [u8], Box<dyn SystemHandler>>;

/// Invoked with the connection's name once cleanup is done.
pub(crate) type CleanupFn = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Handle all requests from one connection, then clean up.
pub(crate) async fn serve_connection(
    conn: Arc<Connection>,
    system: Arc<SystemTable>,
    handlers: Arc<HandlerMap>,
    cleanup: Option<CleanupFn>,
) {
    tracing::debug!("handler: connection established from {}", conn.peer());

    loop {
        match handle_one_request(&conn, &system, &handlers).await {
            Ok(false) => {}
            Ok(true) => break,
            Err(FleetwireError::ConnectionClosed) => {
                tracing::debug!("handler: connection closed from {}", conn.peer());
                break;
            }
            Err(err) => {
                tracing::error!("handler: unexpected error: {}", err);
                let crash = build_response(Status::Crash, err.to_string().as_bytes());
                let mut io = conn.io.lock().await;
                let _ = write_frame(&mut *io, &crash).await;
                break;
            }
        }
    }

    if let Err(err) = conn.finish().await {
        tracing::debug!(
            "handler: error closing connection from {}: {}",
            conn.peer(),
            err
        );
    }
    if let Some(cleanup) = cleanup {
        cleanup(conn.name());
    }
}

/// Handle one request. Returns whether the loop is done.
async fn handle_one_request(
    conn: &Arc<Connection>,
    system: &SystemTable,
    handlers: &HandlerMap,
) -> Result<bool> {
    let mut io = conn.io.lock().await;

    let payload = match read_frame(&mut *io).await? {
        DecodedFrame::Intact(payload) => payload,
        // a corrupted frame degrades to an empty message, which fails
        // request parsing below and is answered as a bad request
        DecodedFrame::Corrupt => Bytes::new(),
    };

    let Some((method, content)) = parse_request(&payload) else {
        write_frame(&mut *io, &build_response(Status::Miss, b"")).await?;
        return Ok(false);
    };

    tracing::debug!(
        "handler: request method={:?} content_len={}",
        method,
        content.len()
    );

    // system callbacks take precedence and may end the loop
    if let Some(cb) = system.get(method.as_ref()) {
        let (response, done) = cb.call(conn, content).await?;
        write_frame(&mut *io, &build_response(Status::Ok, &response)).await?;
        return Ok(done);
    }

    let Some(cb) = handlers.get(&method) else {
        tracing::error!("handler: handler not found for {:?}", method);
        write_frame(&mut *io, &build_response(Status::Miss, &method)).await?;
        return Ok(false);
    };

    let (status, response) = match cb.call(conn.name(), content).await {
        Ok(response) => {
            tracing::debug!("handler: response size {}", response.len());
            (Status::Ok, response)
        }
        Err(err) => {
            tracing::error!("error when calling callback: {}", err);
            (Status::Error, err.to_string().into_bytes())
        }
    };
    write_frame(&mut *io, &build_response(status, &response)).await?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_request, checksum, encode_frame, parse_response};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn spawn_loop(
        handlers: HandlerMap,
        system: SystemTable,
        cleanup: Option<CleanupFn>,
    ) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (ours, theirs) = duplex(4096);
        let conn = Arc::new(Connection::from_stream(Box::new(theirs), "test-peer"));
        let task = tokio::spawn(serve_connection(
            conn,
            Arc::new(system),
            Arc::new(handlers),
            cleanup,
        ));
        (ours, task)
    }

    async fn roundtrip(io: &mut DuplexStream, method: &[u8], content: &[u8]) -> (Status, Bytes) {
        let request = build_request(method, content).unwrap();
        write_frame(io, &request).await.unwrap();
        let payload = match read_frame(io).await.unwrap() {
            DecodedFrame::Intact(payload) => payload,
            DecodedFrame::Corrupt => panic!("corrupt response"),
        };
        parse_response(&payload).unwrap()
    }

    fn echo_handlers() -> HandlerMap {
        let mut handlers = HandlerMap::new();
        handlers.register("ECHO", |_client, content| async move {
            Ok(content.to_vec())
        });
        handlers.register("BOOM", |_client, _content| async move {
            Err(FleetwireError::Handler("oops".to_string()))
        });
        handlers
    }

    #[tokio::test]
    async fn test_dispatch_ok() {
        let (mut io, _task) = spawn_loop(echo_handlers(), SystemTable::new(), None);
        let (status, content) = roundtrip(&mut io, b"ECHO", b"hello").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(&content[..], b"hello");
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_fatal() {
        let (mut io, _task) = spawn_loop(echo_handlers(), SystemTable::new(), None);

        let (status, content) = roundtrip(&mut io, b"FOO", b"").await;
        assert_eq!(status, Status::Miss);
        assert_eq!(&content[..], b"FOO");

        // the connection is still usable
        let (status, content) = roundtrip(&mut io, b"ECHO", b"still here").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(&content[..], b"still here");
    }

    #[tokio::test]
    async fn test_handler_error_is_not_fatal() {
        let (mut io, _task) = spawn_loop(echo_handlers(), SystemTable::new(), None);

        let (status, content) = roundtrip(&mut io, b"BOOM", b"").await;
        assert_eq!(status, Status::Error);
        assert_eq!(&content[..], b"oops");

        let (status, _) = roundtrip(&mut io, b"ECHO", b"alive").await;
        assert_eq!(status, Status::Ok);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_bad_request() {
        let (mut io, _task) = spawn_loop(echo_handlers(), SystemTable::new(), None);

        // valid request frame with one payload bit flipped
        let mut frame = encode_frame(&build_request(b"ECHO", b"x").unwrap());
        frame[2] ^= 0x01;
        io.write_all(&frame).await.unwrap();
        io.flush().await.unwrap();

        let payload = match read_frame(&mut io).await.unwrap() {
            DecodedFrame::Intact(payload) => payload,
            DecodedFrame::Corrupt => panic!("corrupt response"),
        };
        let (status, content) = parse_response(&payload).unwrap();
        assert_eq!(status, Status::Miss);
        assert!(content.is_empty());

        // the loop survived
        let (status, _) = roundtrip(&mut io, b"ECHO", b"next").await;
        assert_eq!(status, Status::Ok);
    }

    #[tokio::test]
    async fn test_request_without_separator_is_bad_request() {
        let (mut io, _task) = spawn_loop(echo_handlers(), SystemTable::new(), None);

        // frame with a valid checksum but no separator in the payload
        let mut frame = vec![1u8, 3];
        frame.extend_from_slice(b"LEN");
        frame.extend_from_slice(&checksum(b"LEN"));
        io.write_all(&frame).await.unwrap();
        io.flush().await.unwrap();

        let payload = match read_frame(&mut io).await.unwrap() {
            DecodedFrame::Intact(payload) => payload,
            DecodedFrame::Corrupt => panic!("corrupt response"),
        };
        let (status, content) = parse_response(&payload).unwrap();
        assert_eq!(status, Status::Miss);
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_runs_cleanup() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let cleanup: CleanupFn = Arc::new(move |_name| {
            flag.store(true, Ordering::SeqCst);
        });

        let (io, task) = spawn_loop(echo_handlers(), SystemTable::new(), Some(cleanup));
        drop(io);

        task.await.unwrap();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_system_handler_can_end_loop() {
        let mut system = SystemTable::new();
        system.insert(b"BYE".as_slice(), Box::new(|_conn: &Arc<Connection>, _content: Bytes| {
            let fut: BoxFuture<'static, Result<(Vec<u8>, bool)>> =
                Box::pin(async move { Ok((b"OK".to_vec(), true)) });
            fut
        }));

        let (mut io, task) = spawn_loop(echo_handlers(), system, None);

        let (status, content) = roundtrip(&mut io, b"BYE", b"").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(&content[..], b"OK");

        // loop exits and (with no gate armed) the stream closes
        task.await.unwrap();
        assert!(matches!(
            read_frame(&mut io).await,
            Err(FleetwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_system_handler_takes_precedence() {
        let mut handlers = HandlerMap::new();
        handlers.register("PING", |_c, _b| async { Ok(b"user".to_vec()) });

        let mut system = SystemTable::new();
        system.insert(b"PING".as_slice(), Box::new(|_conn: &Arc<Connection>, _content: Bytes| {
            let fut: BoxFuture<'static, Result<(Vec<u8>, bool)>> =
                Box::pin(async move { Ok((b"system".to_vec(), false)) });
            fut
        }));

        let (mut io, _task) = spawn_loop(handlers, system, None);
        let (status, content) = roundtrip(&mut io, b"PING", b"").await;
        assert_eq!(status, Status::Ok);
        assert_eq!(&content[..], b"system");
    }
}
