//! Outbound relay link.
//!
//! Maintains one WebSocket connection to the relay, reconnecting
//! forever on a fixed backoff. The first frame after every (re)connect
//! is the `identify` envelope; nothing else is sent until it goes out.
//! Connectivity is published through a `watch` channel so the rest of
//! the host can announce `relay_status` transitions.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use pylon_core::{Envelope, envelope::types};

/// Transport-level error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send attempted while the relay link is down. Reported to the
    /// caller, never silently dropped.
    #[error("Relay is not connected")]
    NotConnected,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub url: String,
    pub device_id: String,
    /// Human-readable pylon name sent in `identify`.
    pub name: String,
    /// Delay between reconnect attempts. Fixed, not exponential.
    pub backoff: Duration,
}

impl RelayClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            name: name.into(),
            backoff: Duration::from_secs(3),
        }
    }
}

/// Persistent client for the relay link.
pub struct RelayClient {
    config: RelayClientConfig,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

impl RelayClient {
    #[must_use]
    pub fn new(config: RelayClientConfig) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            config,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            connected_tx,
            connected_rx,
        }
    }

    /// Relay URL this client targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Whether the link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch for connectivity transitions.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Queue an envelope for the relay.
    ///
    /// # Errors
    /// Returns `NotConnected` while the link is down.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let json = serde_json::to_string(envelope)?;
        self.out_tx
            .send(json)
            .map_err(|_| TransportError::NotConnected)
    }

    /// Run the connect loop forever, handing inbound frames to
    /// `inbound`. Call once, usually via `tokio::spawn`.
    ///
    /// # Panics
    /// Panics if called twice; the outbound queue has a single consumer.
    pub async fn run(&self, inbound: mpsc::UnboundedSender<String>) {
        let mut out_rx = self
            .out_rx
            .lock()
            .await
            .take()
            .expect("RelayClient::run called twice");

        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _)) => {
                    tracing::info!("Connected to relay at {}", self.config.url);
                    let (mut sink, mut source) = stream.split();

                    let identify = Envelope::with_payload(
                        types::IDENTIFY,
                        serde_json::json!({
                            "deviceId": self.config.device_id,
                            "deviceType": "pylon",
                            "name": self.config.name,
                        }),
                    );
                    let frame = match serde_json::to_string(&identify) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to serialize identify: {e}");
                            return;
                        }
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        tracing::warn!("Relay dropped before identify");
                        tokio::time::sleep(self.config.backoff).await;
                        continue;
                    }
                    let _ = self.connected_tx.send(true);

                    loop {
                        tokio::select! {
                            outgoing = out_rx.recv() => {
                                let Some(json) = outgoing else { return };
                                if sink.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            incoming = source.next() => {
                                match incoming {
                                    Some(Ok(Message::Text(text))) => {
                                        let _ = inbound.send(text.to_string());
                                    }
                                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        tracing::warn!("Relay read error: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    let _ = self.connected_tx.send(false);
                    tracing::warn!("Relay link lost; retrying in {:?}", self.config.backoff);
                }
                Err(e) => {
                    tracing::debug!("Relay connect failed: {e}");
                }
            }
            tokio::time::sleep(self.config.backoff).await;
        }
    }
}
