//! Minimal chat client: join a room, print inbound messages, push stdin
//! lines as `new_msg` events.
//!
//! ```bash
//! cargo run --example chat -- ws://localhost:4000/socket
//! ```

use anyhow::Result;
use beacon_client::{Socket, SocketConfig};
use serde_json::json;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:4000/socket".to_string());

    let socket = Socket::new(url, SocketConfig::default());
    socket.connect();

    let channel = socket.channel("room:lobby", json!({"name": "beacon"}));
    channel.on("new_msg", |payload, _| {
        println!("{}", payload["body"].as_str().unwrap_or("<no body>"));
    });

    channel
        .join(None)?
        .receive("ok", |_| println!("joined room:lobby"))
        .receive("error", |reason| eprintln!("join rejected: {reason}"));

    let mut lines = BufReader::new(stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        channel.push("new_msg", json!({"body": line}))?;
    }

    socket.disconnect(None, None).await;
    Ok(())
}
