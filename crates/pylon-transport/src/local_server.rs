//! Local fan-out server.
//!
//! Accepts WebSocket connections from local clients on the loopback
//! interface and fans envelopes out to all of them. Each new client is
//! greeted with a `connected` envelope carrying the last-known relay
//! status.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use pylon_core::{Envelope, envelope::types};

use crate::dispatch::{Dispatcher, Origin};

/// Envelope types too chatty to log on fan-out.
const LOG_EXCLUDED: [&str; 3] = [types::CLAUDE_EVENT, types::BLOB_CHUNK, types::PONG];

/// Local server configuration.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub bind_addr: SocketAddr,
    /// This pylon's device id, echoed in the `connected` greeting.
    pub device_id: String,
}

impl LocalConfig {
    /// Loopback bind on `PYLON_PORT` (default 9395).
    #[must_use]
    pub fn from_env(device_id: impl Into<String>) -> Self {
        let port = std::env::var("PYLON_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(9395);
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            device_id: device_id.into(),
        }
    }
}

/// Set of live local client senders.
#[derive(Default)]
pub struct LocalFanout {
    clients: Mutex<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl LocalFanout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a client; returns its id for later removal.
    pub fn add(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.clients.lock().unwrap().insert(id, tx);
        id
    }

    pub fn remove(&self, id: Uuid) {
        self.clients.lock().unwrap().remove(&id);
    }

    /// Number of connected local clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send an envelope to every connected local client.
    pub fn broadcast(&self, envelope: &Envelope) {
        if !LOG_EXCLUDED.contains(&envelope.kind.as_str()) {
            tracing::debug!("Fan-out {} to {} clients", envelope.kind, self.len());
        }
        let Ok(json) = serde_json::to_string(envelope) else {
            tracing::error!("Failed to serialize {} envelope", envelope.kind);
            return;
        };
        for tx in self.clients.lock().unwrap().values() {
            // A closed receiver just means the client is going away.
            let _ = tx.send(json.clone());
        }
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    device_id: String,
}

/// Bind and serve the local fan-out endpoint until the process exits.
///
/// # Errors
/// Returns error if the listener cannot bind; startup treats this as
/// fatal.
pub async fn serve_local(dispatcher: Arc<Dispatcher>, config: LocalConfig) -> std::io::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState {
            dispatcher,
            device_id: config.device_id,
        });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Local server listening on {}", config.bind_addr);
    axum::serve(listener, app).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = state.dispatcher.fanout().add(tx.clone());

    let greeting = Envelope::with_payload(
        types::CONNECTED,
        serde_json::json!({
            "deviceId": state.device_id,
            "relayConnected": state.dispatcher.relay_connected(),
        }),
    );
    if let Ok(json) = serde_json::to_string(&greeting) {
        let _ = tx.send(json);
    }

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("Local WebSocket error: {e}");
                break;
            }
        };
        state
            .dispatcher
            .handle(&text, &Origin::Local(tx.clone()))
            .await;
    }

    state.dispatcher.fanout().remove(client_id);
    send_task.abort();
}
