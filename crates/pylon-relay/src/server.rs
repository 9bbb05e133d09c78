//! WebSocket front door for the hub.

use std::{net::SocketAddr, sync::Arc};

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

use crate::hub::RelayHub;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address for the WebSocket server.
    pub bind_addr: SocketAddr,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let port = std::env::var("PYLON_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(9393);

        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<RelayHub>,
    max_message_size: usize,
}

/// Bind and serve the relay until the process exits.
///
/// # Errors
/// Returns error if the listener cannot bind; this is fatal by design
/// of the caller.
pub async fn serve(hub: Arc<RelayHub>, config: RelayConfig) -> std::io::Result<()> {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState {
            hub,
            max_message_size: config.max_message_size,
        });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Relay listening on {}", config.bind_addr);
    axum::serve(listener, app).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(|socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = hub.connect(tx);

    // Forward hub output to the socket.
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
                tracing::error!("WebSocket error on {conn_id}: {e}");
                break;
            }
        };
        hub.handle_text(conn_id, &text);
    }

    hub.disconnect(conn_id);
    send_task.abort();
}
