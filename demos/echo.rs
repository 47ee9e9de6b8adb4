//! Request/response walkthrough: a server and a client in one process.
//!
//! This demo shows:
//! - Creating a server with a user callback table
//! - Connecting a named client (handshake + login happen inside)
//! - Ordinary requests, a missing method, and a failing handler
//!
//! ```sh
//! cargo run --example echo
//! ```

use fleetwire::{Client, FleetwireError, HandlerMap, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // management side: a server with a couple of methods
    let mut handlers = HandlerMap::new();
    handlers.register("LEN", |_client, content| async move {
        Ok(content.len().to_string().into_bytes())
    });
    handlers.register("UPPER", |_client, content| async move {
        let text = String::from_utf8_lossy(&content).to_uppercase();
        Ok(text.into_bytes())
    });
    handlers.register("FAIL", |_client, _content| async move {
        Err(FleetwireError::Handler("this method always fails".to_string()))
    });

    let mut server = Server::new(handlers);
    server.listen("127.0.0.1:0").await?;
    let addr = server.local_addr().expect("server is listening");
    println!("serving on {addr}");

    // device side
    let client = Client::builder("testdevice-123").connect(addr).await?;

    let (status, content) = client.request("LEN", b"hello there").await?;
    println!("LEN -> {:?} {:?}", status, String::from_utf8_lossy(&content));

    let (status, content) = client.request("UPPER", b"quiet bytes").await?;
    println!("UPPER -> {:?} {:?}", status, String::from_utf8_lossy(&content));

    // a method nobody registered: MISS, connection stays up
    let (status, content) = client.request("NOPE", b"").await?;
    println!("NOPE -> {:?} {:?}", status, String::from_utf8_lossy(&content));

    // a failing handler: ERROR with the failure text, connection stays up
    let (status, content) = client.request("FAIL", b"").await?;
    println!("FAIL -> {:?} {:?}", status, String::from_utf8_lossy(&content));

    client.close().await?;
    server.stop().await?;
    Ok(())
}
