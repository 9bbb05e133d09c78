//! Relay binary.
//!
//! Run with: cargo run -p pylon-relay
//!
//! Listens on `PYLON_RELAY_PORT` (default 9393).

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pylon_relay::{RelayConfig, RelayHub, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::default();
    let hub = Arc::new(RelayHub::new());
    serve(hub, config).await?;
    Ok(())
}
