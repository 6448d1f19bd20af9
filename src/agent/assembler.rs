//! Response assembly for one dispatched turn
//!
//! Turns the per-session notifications of a single turn into either one
//! aggregate message ([`collect_turn`]) or an ordered sequence of streaming
//! events ([`stream_turn`]) in the Anthropic Messages API shape:
//!
//! ```text
//! message_start
//! content_block_start(i) content_block_delta(i)* content_block_stop(i)   (per block)
//! message_delta(stop_reason) message_stop
//! ```
//!
//! The first terminal notification wins (result, error, exit or timeout). A
//! listener that falls behind the session channel fails the turn rather than
//! skipping events. Dropping the receiver tears down the listener for that
//! call.

use crate::agent::types::{AssistantFrame, ResultFrame, SessionEvent, Usage};
use crate::error::{Error, Result};
use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const DEFAULT_STOP_REASON: &str = "end_turn";

/// Aggregate (non-streaming) response for one turn
#[derive(Debug, Clone, Serialize)]
pub struct AssembledResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub object: String,
    pub role: String,
    pub model: Option<String>,
    pub content: Vec<Value>,
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    pub session_id: String,
}

/// Wait for the turn's result and combine it with the assistant message.
pub async fn collect_turn(
    session_id: &str,
    mut events: broadcast::Receiver<SessionEvent>,
    turn_timeout: Duration,
) -> Result<AssembledResponse> {
    let wait = async {
        let mut assistant: Option<AssistantFrame> = None;
        loop {
            match events.recv().await {
                Ok(SessionEvent::Assistant(frame)) => merge_assistant(&mut assistant, frame),
                Ok(SessionEvent::Result(result)) => {
                    return assemble(session_id, assistant, result);
                }
                Ok(SessionEvent::Error(message)) => return Err(Error::Transport(message)),
                Ok(SessionEvent::Exited { code }) => return Err(Error::ProcessExited { code }),
                Ok(SessionEvent::Ready(_)) | Ok(SessionEvent::Stream(_)) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(session_id, lagged = n, "Turn listener lagged");
                    return Err(Error::Transport(format!(
                        "turn listener fell {} events behind",
                        n
                    )));
                }
                Err(RecvError::Closed) => return Err(Error::ProcessExited { code: None }),
            }
        }
    };

    match tokio::time::timeout(turn_timeout, wait).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                session_id,
                timeout_secs = turn_timeout.as_secs(),
                "Turn result did not arrive in time"
            );
            Err(Error::TurnTimeout(session_id.to_string()))
        }
    }
}

/// Keep the latest assistant message; frames sharing a message id are
/// pieces of one message and are concatenated.
fn merge_assistant(current: &mut Option<AssistantFrame>, frame: AssistantFrame) {
    match current {
        Some(existing)
            if existing.message.id.is_some() && existing.message.id == frame.message.id =>
        {
            existing.message.content.extend(frame.message.content);
            if frame.message.stop_reason.is_some() {
                existing.message.stop_reason = frame.message.stop_reason;
            }
            if frame.message.usage.is_some() {
                existing.message.usage = frame.message.usage;
            }
        }
        _ => *current = Some(frame),
    }
}

fn assemble(
    session_id: &str,
    assistant: Option<AssistantFrame>,
    result: ResultFrame,
) -> Result<AssembledResponse> {
    if result.is_error {
        return Err(Error::Agent(result.error_message()));
    }

    let message = assistant.map(|a| a.message);
    let usage = result
        .usage
        .as_ref()
        .and_then(Usage::from_value)
        .or_else(|| {
            message
                .as_ref()
                .and_then(|m| m.usage.as_ref())
                .and_then(Usage::from_value)
        })
        .unwrap_or_default();
    let stop_reason = result
        .stop_reason
        .clone()
        .or_else(|| message.as_ref().and_then(|m| m.stop_reason.clone()))
        .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());

    let (id, model, content) = match message {
        Some(m) => (m.id.unwrap_or_else(new_message_id), m.model, m.content),
        None => (new_message_id(), None, Vec::new()),
    };

    Ok(AssembledResponse {
        id,
        object: "message".to_string(),
        role: "assistant".to_string(),
        model,
        content,
        stop_reason,
        stop_sequence: None,
        usage,
        total_cost_usd: result.total_cost_usd,
        session_id: session_id.to_string(),
    })
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

// =============================================================================
// Streaming
// =============================================================================

/// One streaming event sent to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { message: Value },
    ContentBlockStart { index: usize, content_block: Value },
    ContentBlockDelta { index: usize, delta: Value },
    ContentBlockStop { index: usize },
    MessageDelta { delta: Value, usage: Usage },
    MessageStop,
    Error { error: Value },
}

impl StreamEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    fn error(kind: &str, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: json!({"type": kind, "message": message.into()}),
        }
    }
}

/// Translates one turn's notifications into streaming events.
///
/// Partial stream events are forwarded with block indices re-based onto a
/// single running index. Assistant messages whose blocks were already
/// streamed are suppressed; blocks that were not are synthesized as
/// start/delta/stop triples.
pub struct StreamTranslator {
    message_id: String,
    model: Option<String>,
    next_index: usize,
    /// Agent block index → emitted index, for the current API message
    index_map: HashMap<u64, usize>,
    /// Blocks streamed but not yet matched by an assistant message
    streamed_pending: usize,
    last_usage: Option<Usage>,
    last_stop_reason: Option<String>,
    done: bool,
}

impl StreamTranslator {
    pub fn new(model: Option<String>) -> Self {
        Self {
            message_id: new_message_id(),
            model,
            next_index: 0,
            index_map: HashMap::new(),
            streamed_pending: 0,
            last_usage: None,
            last_stop_reason: None,
            done: false,
        }
    }

    /// Whether the sequence has terminated
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Opening `message_start`
    pub fn start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: json!({
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": Usage::default(),
            }),
        }
    }

    /// Terminate with an error event
    pub fn fail(&mut self, kind: &str, message: impl Into<String>) -> StreamEvent {
        self.done = true;
        StreamEvent::error(kind, message)
    }

    /// Translate one notification
    pub fn translate(&mut self, event: SessionEvent) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        match event {
            SessionEvent::Stream(raw) => self.translate_stream(&raw),
            SessionEvent::Assistant(frame) => self.translate_assistant(frame),
            SessionEvent::Result(result) => self.translate_result(result),
            SessionEvent::Error(message) => vec![self.fail("transport_error", message)],
            SessionEvent::Exited { code } => vec![self.fail(
                "process_exited_error",
                format!("Agent process exited (code: {:?})", code),
            )],
            SessionEvent::Ready(_) => Vec::new(),
        }
    }

    fn translate_stream(&mut self, raw: &Value) -> Vec<StreamEvent> {
        let event_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        let source_index = raw.get("index").and_then(Value::as_u64);

        match (event_type, source_index) {
            ("message_start", _) => {
                self.index_map.clear();
                Vec::new()
            }
            ("content_block_start", Some(source)) => {
                let index = self.next_index;
                self.next_index += 1;
                self.index_map.insert(source, index);
                self.streamed_pending += 1;
                vec![StreamEvent::ContentBlockStart {
                    index,
                    content_block: raw.get("content_block").cloned().unwrap_or(Value::Null),
                }]
            }
            ("content_block_delta", Some(source)) => match self.index_map.get(&source) {
                Some(&index) => vec![StreamEvent::ContentBlockDelta {
                    index,
                    delta: raw.get("delta").cloned().unwrap_or(Value::Null),
                }],
                None => Vec::new(),
            },
            ("content_block_stop", Some(source)) => match self.index_map.get(&source) {
                Some(&index) => vec![StreamEvent::ContentBlockStop { index }],
                None => Vec::new(),
            },
            ("message_delta", _) => {
                if let Some(reason) = raw
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    self.last_stop_reason = Some(reason.to_string());
                }
                Vec::new()
            }
            // message_stop, ping: the final pair is emitted on the result
            _ => Vec::new(),
        }
    }

    fn translate_assistant(&mut self, frame: AssistantFrame) -> Vec<StreamEvent> {
        let message = frame.message;
        if let Some(usage) = message.usage.as_ref().and_then(Usage::from_value) {
            self.last_usage = Some(usage);
        }
        if message.stop_reason.is_some() {
            self.last_stop_reason = message.stop_reason.clone();
        }
        if self.model.is_none() {
            self.model = message.model.clone();
        }

        let skip = self.streamed_pending.min(message.content.len());
        self.streamed_pending -= skip;

        let mut out = Vec::new();
        for block in message.content.into_iter().skip(skip) {
            let index = self.next_index;
            self.next_index += 1;
            out.extend(synthesize_block(index, block));
        }
        out
    }

    fn translate_result(&mut self, result: ResultFrame) -> Vec<StreamEvent> {
        if result.is_error {
            return vec![self.fail("agent_error", result.error_message())];
        }
        self.done = true;

        let usage = result
            .usage
            .as_ref()
            .and_then(Usage::from_value)
            .or(self.last_usage)
            .unwrap_or_default();
        let stop_reason = result
            .stop_reason
            .or_else(|| self.last_stop_reason.take())
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());

        vec![
            StreamEvent::MessageDelta {
                delta: json!({"stop_reason": stop_reason, "stop_sequence": null}),
                usage,
            },
            StreamEvent::MessageStop,
        ]
    }
}

/// start/delta/stop for one complete content block
fn synthesize_block(index: usize, block: Value) -> Vec<StreamEvent> {
    let kind = block
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| block.get("text").map(|_| "text"))
        .unwrap_or_default()
        .to_string();

    let (content_block, delta) = match kind.as_str() {
        "text" => (
            json!({"type": "text", "text": ""}),
            Some(json!({"type": "text_delta", "text": block.get("text").cloned().unwrap_or_default()})),
        ),
        "thinking" => (
            json!({"type": "thinking", "thinking": ""}),
            Some(json!({"type": "thinking_delta", "thinking": block.get("thinking").cloned().unwrap_or_default()})),
        ),
        "tool_use" => {
            let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
            (
                json!({
                    "type": "tool_use",
                    "id": block.get("id").cloned().unwrap_or_default(),
                    "name": block.get("name").cloned().unwrap_or_default(),
                    "input": {},
                }),
                Some(json!({"type": "input_json_delta", "partial_json": input.to_string()})),
            )
        }
        _ => (block, None),
    };

    let mut events = vec![StreamEvent::ContentBlockStart {
        index,
        content_block,
    }];
    if let Some(delta) = delta {
        events.push(StreamEvent::ContentBlockDelta { index, delta });
    }
    events.push(StreamEvent::ContentBlockStop { index });
    events
}

/// Stream one turn: `message_start` at once, then translated events until
/// the result, an error, process exit, or the turn timeout.
pub fn stream_turn(
    session_id: String,
    mut events: broadcast::Receiver<SessionEvent>,
    mut translator: StreamTranslator,
    turn_timeout: Duration,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        yield translator.start();

        let deadline = tokio::time::Instant::now() + turn_timeout;
        while !translator.is_done() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => {
                    for out in translator.translate(event) {
                        yield out;
                    }
                }
                Ok(Err(RecvError::Lagged(n))) => {
                    tracing::warn!(session_id = %session_id, lagged = n, "Stream listener lagged");
                    yield translator.fail(
                        "transport_error",
                        format!("stream fell {} events behind", n),
                    );
                }
                Ok(Err(RecvError::Closed)) => {
                    yield translator.fail("process_exited_error", "session closed");
                }
                Err(_) => {
                    tracing::warn!(session_id = %session_id, "Streaming turn timed out");
                    yield translator.fail("turn_timeout_error", "timed out waiting for the turn result");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn assistant(content: Value, usage: Value) -> SessionEvent {
        SessionEvent::Assistant(
            serde_json::from_value(json!({
                "message": {"id": "msg_1", "model": "m", "content": content, "usage": usage}
            }))
            .unwrap(),
        )
    }

    fn result(value: Value) -> SessionEvent {
        SessionEvent::Result(serde_json::from_value(value).unwrap())
    }

    fn stream(value: Value) -> SessionEvent {
        SessionEvent::Stream(value)
    }

    async fn run_stream(events: Vec<SessionEvent>) -> Vec<StreamEvent> {
        let (tx, rx) = broadcast::channel(64);
        for event in events {
            tx.send(event).unwrap();
        }
        stream_turn(
            "s1".to_string(),
            rx,
            StreamTranslator::new(Some("m".to_string())),
            Duration::from_secs(5),
        )
        .collect()
        .await
    }

    fn types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_type).collect()
    }

    #[tokio::test]
    async fn test_collect_combines_assistant_and_result() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(assistant(json!([{"text": "hi"}]), json!({"input_tokens": 3, "output_tokens": 1})))
            .unwrap();
        tx.send(result(json!({"subtype": "success", "stop_reason": "end_turn", "total_cost_usd": 0.002})))
            .unwrap();

        let response = collect_turn("s1", rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.role, "assistant");
        assert_eq!(response.content, vec![json!({"text": "hi"})]);
        assert_eq!(response.usage.input_tokens, 3);
        assert_eq!(response.usage.output_tokens, 1);
        assert_eq!(response.stop_reason, "end_turn");
        assert_eq!(response.total_cost_usd, Some(0.002));
        assert_eq!(response.session_id, "s1");

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["type"], "message");
    }

    #[tokio::test]
    async fn test_collect_concatenates_pieces_of_one_message() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(assistant(json!([{"type": "thinking", "thinking": "hmm"}]), Value::Null))
            .unwrap();
        tx.send(assistant(json!([{"type": "text", "text": "done"}]), Value::Null))
            .unwrap();
        tx.send(result(json!({"usage": {"input_tokens": 9, "output_tokens": 4}})))
            .unwrap();

        let response = collect_turn("s1", rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.usage.input_tokens, 9);
    }

    #[tokio::test]
    async fn test_collect_failures() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(SessionEvent::Exited { code: Some(1) }).unwrap();
        assert!(matches!(
            collect_turn("s1", rx, Duration::from_secs(1)).await,
            Err(Error::ProcessExited { code: Some(1) })
        ));

        let (tx, rx) = broadcast::channel(16);
        tx.send(SessionEvent::Error("transport closed".into())).unwrap();
        assert!(matches!(
            collect_turn("s1", rx, Duration::from_secs(1)).await,
            Err(Error::Transport(_))
        ));

        let (tx, rx) = broadcast::channel(16);
        tx.send(result(json!({"is_error": true, "errors": ["rate limited"]})))
            .unwrap();
        match collect_turn("s1", rx, Duration::from_secs(1)).await {
            Err(Error::Agent(message)) => assert_eq!(message, "rate limited"),
            other => panic!("Expected agent error, got {:?}", other),
        }

        let (_tx, rx) = broadcast::channel::<SessionEvent>(16);
        assert!(matches!(
            collect_turn("s1", rx, Duration::from_millis(50)).await,
            Err(Error::TurnTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_from_assistant_and_result() {
        let events = run_stream(vec![
            assistant(json!([{"text": "hi"}]), json!({"input_tokens": 3, "output_tokens": 1})),
            result(json!({"subtype": "success", "stop_reason": "end_turn"})),
        ])
        .await;

        assert_eq!(
            types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            events[2],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: json!({"type": "text_delta", "text": "hi"}),
            }
        );
        match &events[4] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta["stop_reason"], "end_turn");
                assert_eq!(usage.output_tokens, 1);
            }
            other => panic!("Expected message_delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streamed_blocks_are_not_repeated() {
        let events = run_stream(vec![
            stream(json!({"type": "message_start", "message": {}})),
            stream(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            stream(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}})),
            stream(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}})),
            stream(json!({"type": "content_block_stop", "index": 0})),
            stream(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}})),
            stream(json!({"type": "message_stop"})),
            assistant(json!([{"type": "text", "text": "Hello"}]), Value::Null),
            result(json!({"subtype": "success"})),
        ])
        .await;

        assert_eq!(
            types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_indices_are_rebased_across_messages() {
        let events = run_stream(vec![
            stream(json!({"type": "message_start", "message": {}})),
            stream(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}}})),
            stream(json!({"type": "content_block_stop", "index": 0})),
            assistant(json!([{"type": "tool_use", "id": "t1", "name": "Bash", "input": {}}]), Value::Null),
            stream(json!({"type": "message_start", "message": {}})),
            stream(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            stream(json!({"type": "content_block_stop", "index": 0})),
            result(json!({"subtype": "success"})),
        ])
        .await;

        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_tool_use_block_is_synthesized_as_json_delta() {
        let events = run_stream(vec![
            assistant(
                json!([{"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "a.rs"}}]),
                Value::Null,
            ),
            result(json!({"subtype": "success", "stop_reason": "tool_use"})),
        ])
        .await;

        match &events[2] {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                assert_eq!(delta["type"], "input_json_delta");
                let input: Value = serde_json::from_str(delta["partial_json"].as_str().unwrap()).unwrap();
                assert_eq!(input, json!({"path": "a.rs"}));
            }
            other => panic!("Expected delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_ends_without_final_pair_on_exit() {
        let events = run_stream(vec![
            assistant(json!([{"text": "partial"}]), Value::Null),
            SessionEvent::Exited { code: Some(137) },
            result(json!({"subtype": "success"})),
        ])
        .await;

        assert_eq!(types(&events).last(), Some(&"error"));
        assert!(!types(&events).contains(&"message_delta"));
    }

    #[tokio::test]
    async fn test_collect_fails_when_listener_lags() {
        let (tx, rx) = broadcast::channel(2);
        for _ in 0..3 {
            tx.send(assistant(json!([{"text": "hi"}]), Value::Null)).unwrap();
        }
        tx.send(result(json!({"subtype": "success"}))).unwrap();

        assert!(matches!(
            collect_turn("s1", rx, Duration::from_secs(1)).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_fails_when_listener_lags() {
        let (tx, rx) = broadcast::channel(4);
        tx.send(stream(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})))
            .unwrap();
        for i in 0..8 {
            tx.send(stream(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": i.to_string()}})))
                .unwrap();
        }
        tx.send(stream(json!({"type": "content_block_stop", "index": 0})))
            .unwrap();
        tx.send(result(json!({"subtype": "success"}))).unwrap();

        let events: Vec<StreamEvent> = stream_turn(
            "s1".to_string(),
            rx,
            StreamTranslator::new(None),
            Duration::from_secs(1),
        )
        .collect()
        .await;

        assert_eq!(types(&events), vec!["message_start", "error"]);
        match &events[1] {
            StreamEvent::Error { error } => assert_eq!(error["type"], "transport_error"),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_times_out() {
        let (_tx, rx) = broadcast::channel::<SessionEvent>(4);
        let events: Vec<StreamEvent> = stream_turn(
            "s1".to_string(),
            rx,
            StreamTranslator::new(None),
            Duration::from_millis(50),
        )
        .collect()
        .await;

        assert_eq!(types(&events), vec!["message_start", "error"]);
        match &events[1] {
            StreamEvent::Error { error } => assert_eq!(error["type"], "turn_timeout_error"),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_event_serialization() {
        let event = StreamEvent::ContentBlockStop { index: 2 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "content_block_stop", "index": 2})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::MessageStop).unwrap(),
            json!({"type": "message_stop"})
        );
    }
}
