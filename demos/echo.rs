//! Talks to a WebSocket echo endpoint through a self-healing connection.
//!
//! Sends a few JSON messages once connected, prints whatever comes back, and restarts
//! the connection once to show a fresh transport being opened.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=debug cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use resilient_ws::ws::config::Config;
use resilient_ws::ws::{ConnectionManager, Payload, WsConnector};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let config = Config::builder()
        .retry_delay(Duration::from_secs(2))
        .max_retries(5)
        .debug_logging(true)
        .build();
    let mut manager = ConnectionManager::new(
        endpoint,
        Some(vec!["echo-protocol".to_owned()]),
        config,
        WsConnector,
    );

    let mut restarted = false;
    manager.on_open(move |manager, event| {
        info!(url = ?manager.url(), protocol = %event.protocol, "Connected");
        manager.send(&json!({ "type": "greeting", "text": "Hello!" }));
        manager.send(&json!({ "type": "data", "numbers": [1, 2, 3, 4, 5] }));

        if !restarted {
            restarted = true;
            if let Err(e) = manager.restart() {
                warn!(error = %e, "Unable to restart");
            }
        }
    });

    let mut received = 0_u32;
    manager.on_message(move |manager, payload, _| {
        match payload {
            Payload::Decoded(value) => info!(%value, "Received JSON"),
            Payload::Raw(frame) => info!(?frame, "Received raw frame"),
            _ => {}
        }

        received += 1;
        if received >= 4 {
            manager.close();
        }
    });

    manager.on_close(|_, event| info!(code = event.code, reason = %event.reason, "Closed"));
    manager.on_error(|_, event| warn!(message = %event.message, "Transport error"));

    manager.connect()?;
    manager.run().await?;

    info!(lifecycle = ?manager.lifecycle(), "Done");

    Ok(())
}
