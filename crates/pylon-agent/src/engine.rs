//! Per-desk session state machine.
//!
//! Translates the upstream `AgentEvent` stream into the outward
//! `SessionEvent` vocabulary, arbitrates permissions and questions, and
//! enforces the one-live-session-per-desk invariant. Every outward event
//! is durably logged before dispatch.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use pylon_core::MessageStore;

use crate::arbitrator::{Arbitrator, PendingKind, PermissionDecision, Resolution, Verdict};
use crate::backend::{AgentBackend, AgentReply, AgentRequest};
use crate::events::{AgentEvent, DeskState, SessionEvent, Usage};

/// Session engine error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Agent backend failed: {0}")]
    Backend(String),
    #[error("Desk {0} is waiting on a pending decision")]
    Busy(String),
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grace delay between tearing down a superseded session and
    /// starting its replacement.
    pub replace_grace: Duration,
    /// If the source emits no ready signal within this window, assume
    /// the session started anyway.
    pub init_fallback: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replace_grace: Duration::from_millis(100),
            init_fallback: Duration::from_secs(30),
        }
    }
}

/// An outward event tagged with its owning desk.
#[derive(Debug, Clone)]
pub struct DeskEvent {
    pub desk_id: String,
    pub event: SessionEvent,
}

struct ActiveSession {
    run_id: Uuid,
    session_id: Option<String>,
    interrupt_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Logs an outward event, then dispatches it to subscribers.
#[derive(Clone)]
struct EventSink {
    store: Arc<MessageStore>,
    tx: broadcast::Sender<DeskEvent>,
}

impl EventSink {
    fn emit(&self, desk_id: &str, event: SessionEvent) {
        match serde_json::to_value(&event) {
            Ok(value) => {
                self.store.append(desk_id, event.kind(), value);
            }
            Err(e) => tracing::error!("Failed to serialize session event: {e}"),
        }
        let _ = self.tx.send(DeskEvent {
            desk_id: desk_id.to_string(),
            event,
        });
    }
}

/// Streaming-to-event translator and state machine, one per engine.
pub struct SessionEngine {
    backend: Arc<dyn AgentBackend>,
    arbitrator: Arc<Arbitrator>,
    sink: EventSink,
    config: EngineConfig,
    active: Arc<Mutex<HashMap<String, ActiveSession>>>,
    /// Desk -> continuation token surviving session teardown.
    resume_ids: Arc<StdMutex<HashMap<String, String>>>,
}

impl SessionEngine {
    #[must_use]
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        arbitrator: Arc<Arbitrator>,
        store: Arc<MessageStore>,
    ) -> Self {
        Self::with_config(backend, arbitrator, store, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(
        backend: Arc<dyn AgentBackend>,
        arbitrator: Arc<Arbitrator>,
        store: Arc<MessageStore>,
        config: EngineConfig,
    ) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            backend,
            arbitrator,
            sink: EventSink { store, tx },
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
            resume_ids: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Subscribe to outward events for all desks.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.sink.tx.subscribe()
    }

    /// The arbitrator backing this engine.
    #[must_use]
    pub fn arbitrator(&self) -> &Arc<Arbitrator> {
        &self.arbitrator
    }

    /// Whether a desk has a live session.
    pub async fn is_active(&self, desk_id: &str) -> bool {
        self.active.lock().await.contains_key(desk_id)
    }

    /// The desk's current continuation token, if any.
    #[must_use]
    pub fn session_id(&self, desk_id: &str) -> Option<String> {
        self.resume_ids.lock().unwrap().get(desk_id).cloned()
    }

    /// Send a message to a desk, opening a new session.
    ///
    /// Any prior live session for the desk is stopped first and its
    /// teardown awaited, with a short grace delay before the
    /// replacement starts. A send superseded by a newer send (or a
    /// stop) while its backend is still starting discards its stream
    /// and returns `Ok`.
    ///
    /// # Errors
    /// Returns `Busy` while a permission/question is pending for the
    /// desk, or `Backend` if the streaming source cannot start.
    pub async fn send(
        &self,
        desk_id: &str,
        message: String,
        working_dir: PathBuf,
        permission_mode: Option<String>,
    ) -> Result<(), SessionError> {
        if self.arbitrator.has_pending(desk_id) {
            return Err(SessionError::Busy(desk_id.to_string()));
        }

        // Reserve the desk in the same lock acquisition that removes the
        // prior session, so a concurrent send finds this reservation and
        // supersedes it instead of racing the backend start below.
        let run_id = Uuid::new_v4();
        let existing = {
            let mut active = self.active.lock().await;
            let existing = active.remove(desk_id);
            active.insert(
                desk_id.to_string(),
                ActiveSession {
                    run_id,
                    session_id: None,
                    interrupt_tx: None,
                    task: None,
                },
            );
            existing
        };
        if let Some(session) = existing {
            self.teardown(desk_id, session).await;
            tokio::time::sleep(self.config.replace_grace).await;
        }

        self.sink.emit(
            desk_id,
            SessionEvent::StateUpdate {
                state: DeskState::Working,
                partial_text: String::new(),
                permission: false,
            },
        );

        let resume_session_id = self.resume_ids.lock().unwrap().get(desk_id).cloned();
        let request = AgentRequest {
            desk_id: desk_id.to_string(),
            message,
            working_dir,
            resume_session_id,
            permission_mode,
        };

        let mut stream = match self.backend.start(request).await {
            Ok(s) => s,
            Err(e) => {
                let mut active = self.active.lock().await;
                if active.get(desk_id).is_some_and(|s| s.run_id == run_id) {
                    active.remove(desk_id);
                }
                drop(active);
                self.sink.emit(desk_id, SessionEvent::Error { message: e.to_string() });
                self.sink.emit(
                    desk_id,
                    SessionEvent::StateUpdate {
                        state: DeskState::Idle,
                        partial_text: String::new(),
                        permission: false,
                    },
                );
                return Err(e);
            }
        };

        {
            let mut active = self.active.lock().await;
            match active.get_mut(desk_id) {
                Some(session) if session.run_id == run_id => {
                    session.interrupt_tx = stream.interrupt_tx.take();
                }
                _ => {
                    // Superseded or stopped while the backend was
                    // starting; discard the stream without running it.
                    if let Some(tx) = stream.interrupt_tx.take() {
                        let _ = tx.send(());
                    }
                    return Ok(());
                }
            }
        }

        let translator = Translator {
            desk_id: desk_id.to_string(),
            run_id,
            sink: self.sink.clone(),
            arbitrator: Arc::clone(&self.arbitrator),
            active: Arc::clone(&self.active),
            resume_ids: Arc::clone(&self.resume_ids),
            reply_tx: stream.reply_tx,
            init_fallback: self.config.init_fallback,
            state: DeskState::Working,
            partial: String::new(),
            pending_tools: VecDeque::new(),
            usage: Usage::default(),
            got_init: false,
        };
        let task = tokio::spawn(translator.run(stream.events));

        match self.active.lock().await.get_mut(desk_id) {
            Some(session) if session.run_id == run_id => session.task = Some(task),
            // Stopped before we finished wiring; nothing to keep running.
            _ => task.abort(),
        }

        Ok(())
    }

    /// Stop a desk's session: abort the stream, resolve all of its
    /// pending requests as denied, and emit a terminal idle state.
    /// Idempotent when no session is live.
    pub async fn stop(&self, desk_id: &str) {
        let existing = self.active.lock().await.remove(desk_id);
        if let Some(session) = existing {
            self.teardown(desk_id, session).await;
        } else {
            self.arbitrator.stop_all(Some(desk_id));
            self.sink.emit(
                desk_id,
                SessionEvent::StateUpdate {
                    state: DeskState::Idle,
                    partial_text: String::new(),
                    permission: false,
                },
            );
        }
    }

    /// Re-establish only the continuation token; the next `send` uses it.
    /// Never invokes the streaming source.
    pub fn resume(&self, desk_id: &str, session_id: String) {
        self.resume_ids
            .lock()
            .unwrap()
            .insert(desk_id.to_string(), session_id);
    }

    /// Forget a desk's continuation token so the next send starts fresh.
    pub fn new_session(&self, desk_id: &str) {
        self.resume_ids.lock().unwrap().remove(desk_id);
    }

    /// Resolve a pending permission request.
    pub fn respond_permission(&self, tool_use_id: &str, decision: PermissionDecision) -> bool {
        self.arbitrator.respond(tool_use_id, decision)
    }

    /// Resolve a pending question.
    pub fn answer_question(&self, tool_use_id: &str, text: String) -> bool {
        self.arbitrator.answer(tool_use_id, text)
    }

    async fn teardown(&self, desk_id: &str, mut session: ActiveSession) {
        if let Some(tx) = session.interrupt_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = session.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.arbitrator.stop_all(Some(desk_id));
        self.sink.emit(
            desk_id,
            SessionEvent::StateUpdate {
                state: DeskState::Idle,
                partial_text: String::new(),
                permission: false,
            },
        );
    }
}

pub(crate) struct PendingTool {
    pub tool_use_id: Option<String>,
    pub name: String,
}

/// Correlate a tool completion with its start.
///
/// Prefers an exact id match; otherwise falls back to the oldest
/// unmatched start with the same name, then to plain FIFO. Best-effort:
/// the upstream stream does not guarantee ids on both ends.
pub(crate) fn take_matching(
    pending: &mut VecDeque<PendingTool>,
    tool_use_id: Option<&str>,
    name: Option<&str>,
) -> Option<PendingTool> {
    if let Some(id) = tool_use_id {
        if let Some(pos) = pending
            .iter()
            .position(|t| t.tool_use_id.as_deref() == Some(id))
        {
            return pending.remove(pos);
        }
    }
    if let Some(name) = name {
        if let Some(pos) = pending.iter().position(|t| t.name == name) {
            return pending.remove(pos);
        }
    }
    pending.pop_front()
}

struct Translator {
    desk_id: String,
    run_id: Uuid,
    sink: EventSink,
    arbitrator: Arc<Arbitrator>,
    active: Arc<Mutex<HashMap<String, ActiveSession>>>,
    resume_ids: Arc<StdMutex<HashMap<String, String>>>,
    reply_tx: Option<mpsc::UnboundedSender<AgentReply>>,
    init_fallback: Duration,
    state: DeskState,
    partial: String,
    pending_tools: VecDeque<PendingTool>,
    usage: Usage,
    got_init: bool,
}

impl Translator {
    async fn run(mut self, mut events: BoxStream<'static, AgentEvent>) {
        loop {
            let next = if self.got_init {
                events.next().await
            } else {
                match tokio::time::timeout(self.init_fallback, events.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        // No ready signal; assume the start succeeded.
                        tracing::warn!(
                            "Desk {} saw no init within {:?}, assuming live",
                            self.desk_id,
                            self.init_fallback
                        );
                        self.on_init("unknown".to_string(), false);
                        continue;
                    }
                }
            };

            let Some(event) = next else { break };
            if !self.handle(event) {
                break;
            }
        }
        self.finish().await;
    }

    /// Returns false when the session should wind down.
    fn handle(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::Init { session_id } => self.on_init(session_id, true),
            AgentEvent::Thinking { text } => {
                self.state = DeskState::Thinking;
                self.partial.push_str(&text);
                self.emit_state();
            }
            AgentEvent::TextDelta { text } => {
                self.state = DeskState::Responding;
                self.partial.push_str(&text);
                self.emit_state();
                self.emit(SessionEvent::Text { text });
            }
            AgentEvent::TextComplete { text } => {
                let full = if text.is_empty() {
                    std::mem::take(&mut self.partial)
                } else {
                    self.partial.clear();
                    text
                };
                self.emit(SessionEvent::TextComplete { text: full });
            }
            AgentEvent::ToolStart {
                tool_use_id,
                name,
                input,
            } => {
                self.state = DeskState::Tool;
                self.pending_tools.push_back(PendingTool {
                    tool_use_id,
                    name: name.clone(),
                });
                self.emit_state();
                let summary = summarize_input(&input);
                self.emit(SessionEvent::ToolInfo { name, summary });
            }
            AgentEvent::ToolEnd {
                tool_use_id,
                name,
                is_error,
            } => {
                let matched = take_matching(
                    &mut self.pending_tools,
                    tool_use_id.as_deref(),
                    name.as_deref(),
                );
                let resolved = matched
                    .map(|t| t.name)
                    .or(name)
                    .unwrap_or_else(|| "unknown".to_string());
                self.emit(SessionEvent::ToolComplete {
                    name: resolved,
                    is_error,
                });
            }
            AgentEvent::Question {
                tool_use_id,
                question,
                options,
            } => {
                let rx = self.arbitrator.escalate(
                    PendingKind::Question,
                    &self.desk_id,
                    &tool_use_id,
                    "AskUserQuestion",
                );
                self.emit_state();
                self.emit(SessionEvent::AskQuestion {
                    tool_use_id: tool_use_id.clone(),
                    question,
                    options,
                });
                self.spawn_waiter(tool_use_id, rx);
            }
            AgentEvent::PermissionRequest {
                tool_use_id,
                name,
                input,
            } => match self.arbitrator.evaluate(&name, &input) {
                Verdict::Allow => {
                    self.reply(AgentReply::Permission {
                        tool_use_id,
                        decision: PermissionDecision::Allow,
                    });
                }
                Verdict::Deny(reason) => {
                    self.reply(AgentReply::Permission {
                        tool_use_id,
                        decision: PermissionDecision::Deny { reason },
                    });
                }
                Verdict::Escalate => {
                    let rx = self.arbitrator.escalate(
                        PendingKind::Permission,
                        &self.desk_id,
                        &tool_use_id,
                        &name,
                    );
                    self.emit_state();
                    self.emit(SessionEvent::PermissionRequest {
                        tool_use_id: tool_use_id.clone(),
                        name,
                        input,
                    });
                    self.spawn_waiter(tool_use_id, rx);
                }
            },
            AgentEvent::UsageDelta {
                input_tokens,
                output_tokens,
            } => {
                self.usage.accumulate(input_tokens, output_tokens);
            }
            AgentEvent::Result {
                input_tokens,
                output_tokens,
                cost_usd,
                duration_ms,
                is_error: _,
            } => {
                self.usage
                    .apply_final(input_tokens, output_tokens, cost_usd, duration_ms);
                self.emit(SessionEvent::Result { usage: self.usage });
            }
            AgentEvent::Error { message } => {
                self.emit(SessionEvent::Error { message });
                return false;
            }
        }
        true
    }

    fn on_init(&mut self, session_id: String, record: bool) {
        self.got_init = true;
        if record {
            self.resume_ids
                .lock()
                .unwrap()
                .insert(self.desk_id.clone(), session_id.clone());
            let active = Arc::clone(&self.active);
            let desk_id = self.desk_id.clone();
            let run_id = self.run_id;
            let sid = session_id.clone();
            tokio::spawn(async move {
                if let Some(session) = active.lock().await.get_mut(&desk_id) {
                    if session.run_id == run_id {
                        session.session_id = Some(sid);
                    }
                }
            });
        }
        self.emit(SessionEvent::Init { session_id });
    }

    fn spawn_waiter(&self, tool_use_id: String, rx: oneshot::Receiver<Resolution>) {
        let Some(reply_tx) = self.reply_tx.clone() else {
            return;
        };
        tokio::spawn(async move {
            let reply = match rx.await {
                Ok(Resolution::Permission(decision)) => AgentReply::Permission {
                    tool_use_id,
                    decision,
                },
                Ok(Resolution::Answer(text)) => AgentReply::Answer { tool_use_id, text },
                Ok(Resolution::Aborted) | Err(_) => AgentReply::Permission {
                    tool_use_id,
                    decision: PermissionDecision::Deny {
                        reason: "Session stopped".to_string(),
                    },
                },
            };
            let _ = reply_tx.send(reply);
        });
    }

    fn reply(&self, reply: AgentReply) {
        if let Some(tx) = &self.reply_tx {
            let _ = tx.send(reply);
        }
    }

    fn emit_state(&self) {
        self.emit(SessionEvent::StateUpdate {
            state: self.state,
            partial_text: self.partial.clone(),
            permission: self.arbitrator.has_pending(&self.desk_id),
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.sink.emit(&self.desk_id, event);
    }

    async fn finish(self) {
        {
            let mut active = self.active.lock().await;
            if active
                .get(&self.desk_id)
                .is_some_and(|s| s.run_id == self.run_id)
            {
                active.remove(&self.desk_id);
            }
        }
        self.arbitrator.stop_all(Some(&self.desk_id));
        self.sink.emit(
            &self.desk_id,
            SessionEvent::StateUpdate {
                state: DeskState::Idle,
                partial_text: String::new(),
                permission: false,
            },
        );
    }
}

fn summarize_input(input: &serde_json::Value) -> String {
    let text = input
        .get("command")
        .or_else(|| input.get("file_path"))
        .or_else(|| input.get("path"))
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| input.to_string(), str::to_string);
    if text.chars().count() > 120 {
        let truncated: String = text.chars().take(120).collect();
        format!("{truncated}…")
    } else {
        text
    }
}
