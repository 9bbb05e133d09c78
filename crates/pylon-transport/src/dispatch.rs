//! The Pylon's application command surface.
//!
//! One dispatcher handles envelopes from both transports: local
//! clients and inbound relay traffic. Replies go back to wherever the
//! request came from; relay-origin replies are addressed to the
//! requesting device.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use pylon_agent::{PermissionDecision, SessionEngine, SessionEvent};
use pylon_blob::{BlobEngine, ChunkPayload, EndPayload, RequestPayload, StartPayload};
use pylon_core::{DeviceRef, Envelope, MessageStore, envelope::types};
use pylon_tasks::{Task, TaskRunner, WorkspaceStore};

use crate::local_server::LocalFanout;
use crate::relay_client::{RelayClient, TransportError};

/// Where an envelope came from, and how to answer it.
#[derive(Clone)]
pub enum Origin {
    /// A local client; replies go straight down its socket.
    Local(mpsc::UnboundedSender<String>),
    /// The relay; replies are addressed back to the requester.
    Relay(Option<DeviceRef>),
}

/// Command dispatcher shared by both transports.
pub struct Dispatcher {
    device_id: String,
    fanout: Arc<LocalFanout>,
    relay: Arc<RelayClient>,
    engine: Arc<SessionEngine>,
    store: Arc<MessageStore>,
    blobs: Arc<BlobEngine>,
    workspaces: Arc<WorkspaceStore>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        fanout: Arc<LocalFanout>,
        relay: Arc<RelayClient>,
        engine: Arc<SessionEngine>,
        store: Arc<MessageStore>,
        blobs: Arc<BlobEngine>,
        workspaces: Arc<WorkspaceStore>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            fanout,
            relay,
            engine,
            store,
            blobs,
            workspaces,
        }
    }

    /// The local client set.
    #[must_use]
    pub fn fanout(&self) -> &Arc<LocalFanout> {
        &self.fanout
    }

    /// Last-known relay connectivity, for `connected` greetings.
    #[must_use]
    pub fn relay_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Spawn the session-event and relay-status pumps.
    pub fn spawn_pumps(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut events = self.engine.subscribe();
        tokio::spawn(async move {
            while let Ok(desk_event) = events.recv().await {
                this.publish_event(&desk_event.desk_id, &desk_event.event);
            }
        });

        let this = Arc::clone(self);
        let mut connectivity = self.relay.connectivity();
        tokio::spawn(async move {
            while connectivity.changed().await.is_ok() {
                let connected = *connectivity.borrow();
                tracing::info!("Relay status changed: connected={connected}");
                this.fanout.broadcast(&Envelope::with_payload(
                    types::RELAY_STATUS,
                    serde_json::json!({
                        "connected": connected,
                        "url": this.relay.url(),
                    }),
                ));
            }
        });
    }

    /// Run the relay link: connect loop plus inbound frame handling.
    /// Never returns.
    pub async fn run_relay(self: Arc<Self>) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move { relay.run(inbound_tx).await });

        while let Some(text) = inbound_rx.recv().await {
            self.handle_relay_frame(&text).await;
        }
    }

    async fn handle_relay_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Malformed relay frame: {e}");
                return;
            }
        };

        match envelope.kind.as_str() {
            types::REGISTERED => tracing::info!("Registered with relay"),
            types::DEVICE_STATUS | types::DEVICE_LIST | types::PONG => {
                tracing::debug!("Relay {}", envelope.kind);
            }
            _ => {
                // Observing local clients see raw relay traffic too.
                if let Ok(inner) = serde_json::to_value(&envelope) {
                    self.fanout
                        .broadcast(&Envelope::with_payload(types::FROM_RELAY, inner));
                }
                self.handle(text, &Origin::Relay(envelope.from.clone())).await;
            }
        }
    }

    /// Handle one inbound envelope from either transport.
    ///
    /// Malformed JSON is answered with an `error` envelope to the
    /// sender only; the connection survives.
    pub async fn handle(&self, text: &str, origin: &Origin) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Malformed envelope: {e}");
                self.reply(origin, Envelope::error(format!("Invalid message: {e}")));
                return;
            }
        };
        let payload = envelope.payload;

        match envelope.kind.as_str() {
            types::ECHO => {
                self.reply(origin, Envelope::with_payload(types::ECHO, payload).stamped());
            }
            types::PING => {
                self.reply(origin, Envelope::new(types::PONG).stamped());
            }
            types::TO_RELAY => match serde_json::from_value::<Envelope>(payload) {
                Ok(inner) => {
                    if let Err(e) = self.relay.send(&inner) {
                        self.reply(origin, Envelope::error(e.to_string()));
                    }
                }
                Err(e) => {
                    self.reply(origin, Envelope::error(format!("Invalid toRelay payload: {e}")));
                }
            },
            types::DESK_LIST => self.reply(origin, self.desk_list_result()),
            types::DESK_CREATE => {
                let name = payload["name"].as_str().unwrap_or("Untitled");
                let Some(working_dir) = payload["workingDir"].as_str() else {
                    self.reply(origin, Envelope::error("desk_create requires workingDir"));
                    return;
                };
                let workspace = self.workspaces.ensure_workspace(name, working_dir);
                self.workspaces.add_conversation(&workspace.id, name);
                self.reply(origin, self.desk_list_result());
            }
            types::DESK_STATUS => {
                let desk_id = payload["deskId"].as_str().unwrap_or_default();
                let Some(desk) = self
                    .workspaces
                    .desk_list()
                    .into_iter()
                    .find(|d| d.desk_id == desk_id)
                else {
                    self.reply(origin, Envelope::error(format!("Unknown desk {desk_id}")));
                    return;
                };
                self.reply(
                    origin,
                    Envelope::with_payload(
                        types::DESK_STATUS,
                        serde_json::json!({ "deskId": desk.desk_id, "status": desk.status }),
                    ),
                );
            }
            types::CLAUDE_SEND => self.claude_send(&payload, origin).await,
            types::CLAUDE_PERMISSION => {
                let tool_use_id = payload["toolUseId"].as_str().unwrap_or_default();
                let Some(decision) = parse_decision(&payload) else {
                    self.reply(origin, Envelope::error("Invalid permission decision"));
                    return;
                };
                if !self.engine.respond_permission(tool_use_id, decision) {
                    tracing::debug!("No pending permission for toolUseId {tool_use_id}");
                }
            }
            types::CLAUDE_ANSWER => {
                let tool_use_id = payload["toolUseId"].as_str().unwrap_or_default();
                let text = payload["text"].as_str().unwrap_or_default().to_string();
                if !self.engine.answer_question(tool_use_id, text) {
                    tracing::debug!("No pending question for toolUseId {tool_use_id}");
                }
            }
            types::CLAUDE_CONTROL => self.claude_control(&payload, origin).await,
            types::MESSAGE_HISTORY => {
                let desk_id = payload["deskId"].as_str().unwrap_or_default();
                self.reply(
                    origin,
                    Envelope::with_payload(
                        types::MESSAGE_HISTORY,
                        serde_json::json!({
                            "deskId": desk_id,
                            "messages": self.store.history(desk_id),
                        }),
                    ),
                );
            }
            types::BLOB_START => match serde_json::from_value::<StartPayload>(payload) {
                Ok(start) => match self.blobs.start(start) {
                    Ok(ack) => self.reply(origin, ack_envelope(types::BLOB_START, &ack)),
                    Err(e) => self.reply(origin, Envelope::error(e.to_string())),
                },
                Err(e) => self.reply(origin, Envelope::error(format!("Invalid blob_start: {e}"))),
            },
            types::BLOB_CHUNK => match serde_json::from_value::<ChunkPayload>(payload) {
                Ok(chunk) => {
                    if let Err(e) = self.blobs.chunk(chunk) {
                        self.reply(origin, Envelope::error(e.to_string()));
                    }
                }
                Err(e) => self.reply(origin, Envelope::error(format!("Invalid blob_chunk: {e}"))),
            },
            types::BLOB_END => match serde_json::from_value::<EndPayload>(payload) {
                Ok(end) => match self.blobs.end(end).await {
                    Ok(ack) => self.reply(origin, ack_envelope(types::BLOB_END, &ack)),
                    Err(e) => self.reply(origin, Envelope::error(e.to_string())),
                },
                Err(e) => self.reply(origin, Envelope::error(format!("Invalid blob_end: {e}"))),
            },
            types::BLOB_REQUEST => match serde_json::from_value::<RequestPayload>(payload) {
                Ok(request) => {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    match self.blobs.request(request, &tx).await {
                        Ok(_) => {
                            drop(tx);
                            while let Some(frame) = rx.recv().await {
                                self.reply(origin, frame);
                            }
                        }
                        Err(e) => self.reply(origin, Envelope::error(e.to_string())),
                    }
                }
                Err(e) => {
                    self.reply(origin, Envelope::error(format!("Invalid blob_request: {e}")));
                }
            },
            other => tracing::debug!("Ignoring unknown envelope type {other}"),
        }
    }

    async fn claude_send(&self, payload: &serde_json::Value, origin: &Origin) {
        let desk_id = payload["deskId"].as_str().unwrap_or_default().to_string();
        let message = payload["message"].as_str().unwrap_or_default().to_string();
        let permission_mode = payload["permissionMode"].as_str().map(String::from);

        let Some(workspace) = self.workspaces.workspace_of(&desk_id) else {
            self.reply(origin, Envelope::error(format!("Unknown desk {desk_id}")));
            return;
        };

        self.store.append(
            &desk_id,
            "chat",
            serde_json::json!({ "role": "user", "text": message }),
        );
        if let Err(e) = self
            .engine
            .send(&desk_id, message, PathBuf::from(&workspace.working_dir), permission_mode)
            .await
        {
            self.reply(origin, Envelope::error(e.to_string()));
        }
    }

    async fn claude_control(&self, payload: &serde_json::Value, origin: &Origin) {
        let desk_id = payload["deskId"].as_str().unwrap_or_default().to_string();
        match payload["action"].as_str() {
            Some("stop") => self.engine.stop(&desk_id).await,
            Some("new_session") => {
                self.engine.new_session(&desk_id);
                self.workspaces.update_conversation(&desk_id, |c| {
                    c.claude_session_id = None;
                });
            }
            Some("resume") => {
                let Some(session_id) = payload["sessionId"].as_str() else {
                    self.reply(origin, Envelope::error("resume requires sessionId"));
                    return;
                };
                self.engine.resume(&desk_id, session_id.to_string());
                self.workspaces.update_conversation(&desk_id, |c| {
                    c.claude_session_id = Some(session_id.to_string());
                });
            }
            other => {
                let action = other.unwrap_or("<missing>");
                self.reply(
                    origin,
                    Envelope::error(format!("Unknown claude_control action {action}")),
                );
            }
        }
    }

    /// Dispatch one outward session event to both transports and fold
    /// it into the desk's persisted view.
    fn publish_event(&self, desk_id: &str, event: &SessionEvent) {
        match event {
            SessionEvent::Init { session_id } => {
                let session_id = session_id.clone();
                self.workspaces.update_conversation(desk_id, move |c| {
                    c.claude_session_id = Some(session_id);
                });
            }
            SessionEvent::StateUpdate { state, .. } => {
                let status = serde_json::to_value(state)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "idle".to_string());
                self.workspaces.update_conversation(desk_id, move |c| {
                    c.status = status;
                });
            }
            SessionEvent::TextComplete { text } => {
                let active_desk = self.workspaces.active().map(|(_, conv)| conv);
                if active_desk.as_deref() != Some(desk_id) {
                    self.workspaces.update_conversation(desk_id, |c| {
                        c.unread = true;
                    });
                    // Background desks surface completed turns as a
                    // banner for local clients.
                    let preview: String = text.chars().take(120).collect();
                    self.fanout.broadcast(&Envelope::with_payload(
                        types::NOTIFICATION,
                        serde_json::json!({ "deskId": desk_id, "text": preview }),
                    ));
                }
            }
            _ => {}
        }

        let Ok(mut payload) = serde_json::to_value(event) else {
            tracing::error!("Failed to serialize session event");
            return;
        };
        payload["deskId"] = serde_json::Value::String(desk_id.to_string());
        let envelope = Envelope::with_payload(types::CLAUDE_EVENT, payload);

        self.fanout.broadcast(&envelope);
        match self.relay.send(&envelope) {
            Ok(()) | Err(TransportError::NotConnected) => {}
            Err(e) => tracing::warn!("Failed to forward event to relay: {e}"),
        }
    }

    fn desk_list_result(&self) -> Envelope {
        Envelope::with_payload(
            types::DESK_LIST_RESULT,
            serde_json::json!({ "desks": self.workspaces.desk_list() }),
        )
    }

    fn reply(&self, origin: &Origin, mut envelope: Envelope) {
        match origin {
            Origin::Local(tx) => match serde_json::to_string(&envelope) {
                Ok(json) => {
                    let _ = tx.send(json);
                }
                Err(e) => tracing::error!("Failed to serialize reply: {e}"),
            },
            Origin::Relay(from) => {
                envelope.to = from.clone();
                envelope.from = Some(DeviceRef::new(
                    self.device_id.clone(),
                    pylon_core::DeviceType::Pylon,
                ));
                if let Err(e) = self.relay.send(&envelope) {
                    tracing::warn!("Failed to reply via relay: {e}");
                }
            }
        }
    }
}

fn parse_decision(payload: &serde_json::Value) -> Option<PermissionDecision> {
    match payload["decision"].as_str()? {
        "allow" => Some(PermissionDecision::Allow),
        "allowAll" => Some(PermissionDecision::AllowAll),
        "deny" => Some(PermissionDecision::Deny {
            reason: payload["reason"]
                .as_str()
                .unwrap_or("Denied by user")
                .to_string(),
        }),
        _ => None,
    }
}

fn ack_envelope<T: serde::Serialize>(kind: &str, ack: &T) -> Envelope {
    match serde_json::to_value(ack) {
        Ok(payload) => Envelope::with_payload(kind, payload),
        Err(e) => Envelope::error(format!("Failed to serialize acknowledgement: {e}")),
    }
}

/// Drives queued tasks into the session engine.
pub struct SessionTaskRunner {
    engine: Arc<SessionEngine>,
    workspaces: Arc<WorkspaceStore>,
}

impl SessionTaskRunner {
    #[must_use]
    pub fn new(engine: Arc<SessionEngine>, workspaces: Arc<WorkspaceStore>) -> Self {
        Self { engine, workspaces }
    }
}

#[async_trait]
impl TaskRunner for SessionTaskRunner {
    async fn run(&self, task: &Task) -> Result<(), String> {
        let workspace = self
            .workspaces
            .workspace(&task.workspace_id)
            .ok_or_else(|| format!("unknown workspace {}", task.workspace_id))?;

        // Prefer the active desk when it belongs to this workspace.
        let desk_id = self
            .workspaces
            .active()
            .filter(|(ws, _)| *ws == workspace.id)
            .map(|(_, conv)| conv)
            .or_else(|| workspace.conversations.first().map(|c| c.id.clone()));
        let desk_id = match desk_id {
            Some(id) => id,
            None => self
                .workspaces
                .add_conversation(&workspace.id, &task.title)
                .ok_or_else(|| format!("unknown workspace {}", task.workspace_id))?
                .id,
        };

        let permission_mode = workspace
            .conversations
            .iter()
            .find(|c| c.id == desk_id)
            .and_then(|c| c.permission_mode.clone());
        let instruction = format!("Work on this task: {}\n\n{}", task.title, task.body);

        self.engine
            .send(
                &desk_id,
                instruction,
                PathBuf::from(&workspace.working_dir),
                permission_mode,
            )
            .await
            .map_err(|e| e.to_string())
    }
}
