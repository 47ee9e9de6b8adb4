//! Push walkthrough: the server calls back into a registered client.
//!
//! This demo shows:
//! - A client registering push handlers (which opens the callback
//!   connection during connect)
//! - The server scheduling pushes by client name
//! - Both push failure modes: unknown name and unidirectional client
//!
//! ```sh
//! cargo run --example push
//! ```

use fleetwire::{Client, HandlerMap, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut server = Server::new(HandlerMap::new());
    server.listen("127.0.0.1:0").await?;
    let addr = server.local_addr().expect("server is listening");

    // this client can be pushed to: it registers an ECHO handler
    let reachable = Client::builder("device-echo")
        .handler("ECHO", |_client, content| async move {
            println!("device-echo got a push: {:?}", String::from_utf8_lossy(&content));
            Ok(content.to_vec())
        })
        .connect(addr)
        .await?;

    // this one only logs in; it cannot be pushed to
    let unidirectional = Client::builder("device-mute").connect(addr).await?;

    let delivered = server.push("device-echo", "ECHO", b"blink twice").await?;
    println!("push to device-echo delivered: {delivered}");

    let delivered = server.push("device-mute", "ECHO", b"anyone home?").await?;
    println!("push to device-mute delivered: {delivered}");

    let delivered = server.push("device-ghost", "ECHO", b"hello?").await?;
    println!("push to device-ghost delivered: {delivered}");

    reachable.close().await?;
    unidirectional.close().await?;
    server.stop().await?;
    Ok(())
}
