//! Seam to the opaque streaming agent source.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::engine::SessionError;
use crate::events::AgentEvent;

/// Request to open a streaming agent session.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub desk_id: String,
    pub message: String,
    pub working_dir: PathBuf,
    /// Continuation token from a previous session, if resuming.
    pub resume_session_id: Option<String>,
    /// Desk-level permission mode override.
    pub permission_mode: Option<String>,
}

/// Decision sent back into the agent stream.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Permission {
        tool_use_id: String,
        decision: crate::arbitrator::PermissionDecision,
    },
    Answer {
        tool_use_id: String,
        text: String,
    },
}

/// A live agent stream with its control handles.
pub struct AgentStream {
    /// Typed upstream events, in emission order.
    pub events: BoxStream<'static, AgentEvent>,
    /// Graceful interrupt; dropping it without sending is a no-op.
    pub interrupt_tx: Option<oneshot::Sender<()>>,
    /// Channel for permission/question resolutions, when the source
    /// supports them.
    pub reply_tx: Option<mpsc::UnboundedSender<AgentReply>>,
}

/// The opaque streaming agent source.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Open a new streaming session.
    ///
    /// # Errors
    /// Returns `SessionError::Backend` if the source cannot be started.
    async fn start(&self, req: AgentRequest) -> Result<AgentStream, SessionError>;
}

/// Development backend that echoes the prompt back as a response.
///
/// Useful for wiring and tests when no real agent is available.
#[derive(Debug, Default, Clone)]
pub struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn start(&self, req: AgentRequest) -> Result<AgentStream, SessionError> {
        let session_id = req
            .resume_session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let text = req.message;
        let out_tokens = text.split_whitespace().count() as u64;

        let events = vec![
            AgentEvent::Init { session_id },
            AgentEvent::TextDelta { text: text.clone() },
            AgentEvent::TextComplete { text },
            AgentEvent::Result {
                input_tokens: 1,
                output_tokens: out_tokens.max(1),
                cost_usd: 0.0,
                duration_ms: 0,
                is_error: false,
            },
        ];

        Ok(AgentStream {
            events: futures::stream::iter(events).boxed(),
            interrupt_tx: None,
            reply_tx: None,
        })
    }
}
