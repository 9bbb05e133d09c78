//! Upstream and outward event vocabularies.
//!
//! The upstream agent API is an open-ended, dynamically-shaped stream;
//! `AgentEvent` pins it down to a typed tagged-union at the boundary so
//! its shape never leaks past the engine. `SessionEvent` is the stable
//! outward vocabulary desks render.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Desk activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeskState {
    Idle,
    Working,
    Thinking,
    Responding,
    Tool,
}

/// Aggregated token/cost/duration counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl Usage {
    /// Fold an intermediate delta into the running totals.
    pub fn accumulate(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
    }

    /// Apply the terminal result message; its totals are authoritative
    /// where supplied and take precedence over accumulated deltas.
    pub fn apply_final(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64, duration_ms: u64) {
        if input_tokens > 0 {
            self.input_tokens = input_tokens;
        }
        if output_tokens > 0 {
            self.output_tokens = output_tokens;
        }
        self.cost_usd = cost_usd;
        self.duration_ms = duration_ms;
    }
}

/// Typed event emitted by the upstream streaming agent source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// Session established; carries the continuation token.
    Init { session_id: String },
    /// Thinking text delta.
    Thinking { text: String },
    /// Response text delta.
    TextDelta { text: String },
    /// Final response text for the current turn.
    TextComplete { text: String },
    /// Tool invocation started.
    ToolStart {
        tool_use_id: Option<String>,
        name: String,
        input: Value,
    },
    /// Tool invocation finished. Ids are not always present on both ends.
    ToolEnd {
        tool_use_id: Option<String>,
        name: Option<String>,
        is_error: bool,
    },
    /// The agent asks the human a question.
    Question {
        tool_use_id: String,
        question: String,
        options: Vec<String>,
    },
    /// The agent requests permission to run a tool.
    PermissionRequest {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    /// Intermediate usage delta.
    UsageDelta {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Terminal result with authoritative totals.
    Result {
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        duration_ms: u64,
        is_error: bool,
    },
    /// Streaming-source failure.
    Error { message: String },
}

/// Stable outward event dispatched to desks as `claude_event` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    Init {
        session_id: String,
    },
    StateUpdate {
        state: DeskState,
        partial_text: String,
        permission: bool,
    },
    Text {
        text: String,
    },
    TextComplete {
        text: String,
    },
    ToolInfo {
        name: String,
        summary: String,
    },
    ToolComplete {
        name: String,
        is_error: bool,
    },
    AskQuestion {
        tool_use_id: String,
        question: String,
        options: Vec<String>,
    },
    #[serde(rename = "permission_request")]
    PermissionRequest {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    Result {
        usage: Usage,
    },
    Error {
        message: String,
    },
}

impl SessionEvent {
    /// Event kind string as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::StateUpdate { .. } => "stateUpdate",
            Self::Text { .. } => "text",
            Self::TextComplete { .. } => "textComplete",
            Self::ToolInfo { .. } => "toolInfo",
            Self::ToolComplete { .. } => "toolComplete",
            Self::AskQuestion { .. } => "askQuestion",
            Self::PermissionRequest { .. } => "permission_request",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}
