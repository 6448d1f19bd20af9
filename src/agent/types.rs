//! NDJSON protocol types for agent process communication
//!
//! Defines:
//! - Agent → Bridge frames (NDJSON, newline-delimited JSON)
//! - Bridge → Agent frame builders
//! - Session records, lifecycle states, launch options and the typed
//!   notifications the router emits per session

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Agent → Bridge frames (NDJSON)
// =============================================================================

/// One parsed inbound frame
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    System(SystemFrame),
    Assistant(AssistantFrame),
    Result(ResultFrame),
    StreamEvent(StreamEventFrame),
    ControlRequest(ControlRequestFrame),
    KeepAlive,
    /// Any other frame kind; ignored by the router
    #[serde(other)]
    Other,
}

impl Frame {
    /// Frame kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::System(_) => "system",
            Frame::Assistant(_) => "assistant",
            Frame::Result(_) => "result",
            Frame::StreamEvent(_) => "stream_event",
            Frame::ControlRequest(_) => "control_request",
            Frame::KeepAlive => "keep_alive",
            Frame::Other => "other",
        }
    }
}

/// System frame (subtype "init" carries the agent's own session metadata)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFrame {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(rename = "permissionMode", default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub claude_code_version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Assistant frame (one complete model message)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantFrame {
    pub message: AssistantMessage,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of an assistant frame, kept as sent by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_assistant_role")]
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

/// Result frame (terminal signal of one turn)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Option<Vec<Value>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ResultFrame {
    /// Human-readable failure description for an `is_error` result
    pub fn error_message(&self) -> String {
        if let Some(errors) = &self.errors {
            let joined: Vec<String> = errors
                .iter()
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            if !joined.is_empty() {
                return joined.join("; ");
            }
        }
        self.result
            .clone()
            .or_else(|| self.subtype.clone())
            .unwrap_or_else(|| "unknown agent error".to_string())
    }
}

/// Partial stream event (raw model streaming event)
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventFrame {
    pub event: Value,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Control request (permission prompt and friends)
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestFrame {
    pub request_id: String,
    pub request: ControlRequestBody,
}

/// Body of a control request
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub permission_suggestions: Option<Vec<Value>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Token usage as reported by the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Read a usage object leniently (missing or null counters are zero)
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let count = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            input_tokens: count("input_tokens"),
            output_tokens: count("output_tokens"),
            cache_creation_input_tokens: count("cache_creation_input_tokens"),
            cache_read_input_tokens: count("cache_read_input_tokens"),
        })
    }
}

// =============================================================================
// Session records
// =============================================================================

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Record created, process launch requested, no transport yet
    Starting,
    /// Transport attached, waiting for the agent's init frame
    Connected,
    /// Initialized and idle
    Ready,
    /// A turn is in flight
    Busy,
    /// Terminal
    Exited,
}

impl SessionState {
    /// Whether the state machine allows `self → next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Exited, _) => false,
            (_, Exited) => true,
            (Starting, Connected) | (Connected, Ready) | (Ready, Busy) | (Busy, Ready) => true,
            _ => false,
        }
    }

    pub fn is_live(self) -> bool {
        self != SessionState::Exited
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Connected => "connected",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Permission policy handed to the agent at launch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    BypassPermissions,
    AcceptEdits,
    #[default]
    Default,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Default => "default",
        }
    }
}

/// Per-session launch parameters
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub cwd: Option<String>,
    /// Credential injected into the agent environment
    pub api_key: Option<String>,
}

/// Snapshot of one session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// External (caller-facing) session id
    pub session_id: String,
    /// Session id assigned by the agent on init
    pub agent_session_id: Option<String>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub state: SessionState,
    pub cwd: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Milliseconds since UNIX epoch
    pub created_at: i64,
    /// Milliseconds since UNIX epoch
    pub last_activity: i64,
}

/// Typed notification emitted per session by the router and registry
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Agent initialized; carries the init payload
    Ready(SystemFrame),
    /// Complete assistant message
    Assistant(AssistantFrame),
    /// Terminal result of the current turn
    Result(ResultFrame),
    /// Raw partial stream event
    Stream(Value),
    /// Transport-level failure affecting the current turn
    Error(String),
    /// Agent process is gone
    Exited { code: Option<i32> },
}

// =============================================================================
// Helper functions
// =============================================================================

/// Parse NDJSON data into frames, skipping malformed lines
pub fn parse_ndjson(data: &str) -> Vec<Frame> {
    data.split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            serde_json::from_str::<Frame>(line)
                .map_err(|e| {
                    tracing::warn!("NDJSON parse error: {} (line: {})", e, preview(line, 200));
                })
                .ok()
        })
        .collect()
}

/// First `max` characters of `text`, cut on a char boundary
pub fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Serialize a frame as one NDJSON line
pub fn to_ndjson_line(frame: &Value) -> String {
    format!("{}\n", frame)
}

/// Build a `user` frame
pub fn user_message_frame(content: Value, agent_session_id: Option<&str>) -> Value {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
        "parent_tool_use_id": null,
        "session_id": agent_session_id.unwrap_or_default(),
    })
}

/// Build a `control_response` that allows a tool use
pub fn permission_allow_frame(request_id: &str, updated_input: &Value) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "allow",
                "updatedInput": updated_input,
            }
        }
    })
}

/// Build a `control_response` that denies a tool use
pub fn permission_deny_frame(request_id: &str, message: &str) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "deny",
                "message": message,
            }
        }
    })
}

/// Build an `interrupt` control request
pub fn interrupt_frame() -> Value {
    serde_json::json!({
        "type": "control_request",
        "request_id": uuid::Uuid::new_v4().to_string(),
        "request": {
            "subtype": "interrupt",
        }
    })
}
