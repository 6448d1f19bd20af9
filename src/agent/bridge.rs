//! Message router between agent transports and the session registry
//!
//! Dispatches each inbound frame by kind into registry state changes and
//! per-session notifications. Answers tool permission requests through a
//! pluggable [`PermissionPolicy`]; the default approves everything.

use crate::agent::registry::SessionRegistry;
use crate::agent::types::*;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of a tool permission request
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Let the tool run with this input
    Allow { updated_input: Value },
    /// Refuse with a message shown to the agent
    Deny { message: String },
}

/// Decides `can_use_tool` control requests
#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    async fn decide(
        &self,
        session_id: &str,
        request_id: &str,
        request: &ControlRequestBody,
    ) -> PermissionDecision;
}

/// Approves every tool use with the input the agent proposed
pub struct AutoApprove;

#[async_trait]
impl PermissionPolicy for AutoApprove {
    async fn decide(
        &self,
        _session_id: &str,
        _request_id: &str,
        request: &ControlRequestBody,
    ) -> PermissionDecision {
        PermissionDecision::Allow {
            updated_input: request.input.clone().unwrap_or(Value::Null),
        }
    }
}

/// Routes inbound frames for every session
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn PermissionPolicy>,
}

impl MessageRouter {
    /// Create a router with the auto-approve policy
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_policy(registry, Arc::new(AutoApprove))
    }

    pub fn with_policy(registry: Arc<SessionRegistry>, policy: Arc<dyn PermissionPolicy>) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parse a chunk of NDJSON and route every frame in order
    pub async fn route_ndjson(&self, session_id: &str, data: &str) {
        for frame in parse_ndjson(data) {
            self.route(session_id, frame).await;
        }
    }

    /// Route one frame
    pub async fn route(&self, session_id: &str, frame: Frame) {
        tracing::trace!(session_id, kind = frame.kind(), "Routing frame");
        match frame {
            Frame::System(system) => self.handle_system(session_id, system).await,
            Frame::Assistant(assistant) => {
                self.registry
                    .publish(session_id, SessionEvent::Assistant(assistant))
                    .await;
            }
            Frame::Result(result) => {
                self.registry.finish_turn(session_id, result).await;
            }
            Frame::StreamEvent(stream) => {
                self.registry
                    .publish(session_id, SessionEvent::Stream(stream.event))
                    .await;
            }
            Frame::ControlRequest(request) => {
                self.handle_control_request(session_id, request).await;
            }
            Frame::KeepAlive | Frame::Other => {}
        }
    }

    async fn handle_system(&self, session_id: &str, system: SystemFrame) {
        if system.subtype == "init" {
            self.registry.mark_ready(session_id, system).await;
        } else {
            tracing::debug!(
                session_id,
                subtype = %system.subtype,
                status = ?system.status,
                "Ignoring system frame"
            );
        }
    }

    async fn handle_control_request(&self, session_id: &str, request: ControlRequestFrame) {
        if request.request.subtype != "can_use_tool" {
            tracing::info!(
                session_id,
                request_id = %request.request_id,
                subtype = %request.request.subtype,
                "Ignoring control request"
            );
            return;
        }

        let decision = self
            .policy
            .decide(session_id, &request.request_id, &request.request)
            .await;

        let response = match &decision {
            PermissionDecision::Allow { updated_input } => {
                permission_allow_frame(&request.request_id, updated_input)
            }
            PermissionDecision::Deny { message } => {
                permission_deny_frame(&request.request_id, message)
            }
        };

        tracing::info!(
            session_id,
            request_id = %request.request_id,
            tool = ?request.request.tool_name,
            allowed = matches!(decision, PermissionDecision::Allow { .. }),
            "Answered permission request"
        );

        if let Err(e) = self.registry.send(session_id, &response).await {
            tracing::warn!(session_id, "Failed to send permission response: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::launcher::FixedCommand;
    use crate::agent::registry::{connect_fake_agent, test_config};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn setup(
        policy: Arc<dyn PermissionPolicy>,
    ) -> (MessageRouter, mpsc::UnboundedReceiver<String>) {
        let launcher = Arc::new(FixedCommand::new("sleep", &["30"]));
        let registry = SessionRegistry::new(test_config(), launcher, "ws://127.0.0.1:0");
        let reg = registry.clone();
        let create = tokio::spawn(async move {
            reg.get_or_create(Some("s1".to_string()), LaunchOptions::default())
                .await
        });
        let rx = connect_fake_agent(&registry, "s1").await;
        create.await.unwrap().unwrap();
        (MessageRouter::with_policy(registry, policy), rx)
    }

    fn control_request(subtype: &str) -> String {
        serde_json::json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {
                "subtype": subtype,
                "tool_name": "Bash",
                "input": {"command": "ls -la", "timeout": 5000},
                "tool_use_id": "tu-1"
            }
        })
        .to_string()
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<String>) {
        let next = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    #[tokio::test]
    async fn test_can_use_tool_gets_exactly_one_allow() {
        let (router, mut rx) = setup(Arc::new(AutoApprove)).await;
        router.route_ndjson("s1", &control_request("can_use_tool")).await;

        let line = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(frame["type"], "control_response");
        assert_eq!(frame["response"]["request_id"], "req-1");
        assert_eq!(frame["response"]["response"]["behavior"], "allow");
        assert_eq!(
            frame["response"]["response"]["updatedInput"],
            serde_json::json!({"command": "ls -la", "timeout": 5000})
        );
        assert_silent(&mut rx).await;

        router.registry().kill("s1").await;
    }

    #[tokio::test]
    async fn test_other_control_subtypes_are_not_answered() {
        let (router, mut rx) = setup(Arc::new(AutoApprove)).await;
        router.route_ndjson("s1", &control_request("hook_callback")).await;
        assert_silent(&mut rx).await;
        router.registry().kill("s1").await;
    }

    struct DenyAll;

    #[async_trait]
    impl PermissionPolicy for DenyAll {
        async fn decide(&self, _: &str, _: &str, _: &ControlRequestBody) -> PermissionDecision {
            PermissionDecision::Deny {
                message: "not allowed".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_custom_policy_denies() {
        let (router, mut rx) = setup(Arc::new(DenyAll)).await;
        router.route_ndjson("s1", &control_request("can_use_tool")).await;

        let frame: Value = serde_json::from_str(rx.recv().await.unwrap().trim_end()).unwrap();
        assert_eq!(frame["response"]["response"]["behavior"], "deny");
        assert_eq!(frame["response"]["response"]["message"], "not allowed");
        router.registry().kill("s1").await;
    }

    #[tokio::test]
    async fn test_assistant_and_stream_frames_are_published_in_order() {
        let (router, _rx) = setup(Arc::new(AutoApprove)).await;
        let mut events = router.registry().subscribe("s1").await.unwrap();

        let data = concat!(
            r#"{"type":"stream_event","event":{"type":"message_start","message":{}}}"#,
            "\n",
            r#"{"type":"keep_alive"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            "\n",
        );
        router.route_ndjson("s1", data).await;

        match events.recv().await.unwrap() {
            SessionEvent::Stream(event) => assert_eq!(event["type"], "message_start"),
            other => panic!("Expected Stream, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            SessionEvent::Assistant(a) => assert_eq!(a.message.content[0]["text"], "hi"),
            other => panic!("Expected Assistant, got {:?}", other),
        }
        router.registry().kill("s1").await;
    }

    #[tokio::test]
    async fn test_result_frame_finishes_turn() {
        let (router, mut rx) = setup(Arc::new(AutoApprove)).await;
        let mut events = router
            .registry()
            .start_turn("s1", Value::String("hi".into()))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        router
            .route_ndjson(
                "s1",
                r#"{"type":"result","subtype":"success","is_error":false,"stop_reason":"end_turn"}"#,
            )
            .await;

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Result(_)));
        assert_eq!(
            router.registry().get("s1").await.unwrap().state,
            SessionState::Ready
        );
        router.registry().kill("s1").await;
    }

    #[tokio::test]
    async fn test_init_frame_marks_connected_session_ready() {
        let launcher = Arc::new(FixedCommand::new("sleep", &["30"]));
        let registry = SessionRegistry::new(test_config(), launcher, "ws://127.0.0.1:0");
        let router = MessageRouter::new(registry.clone());
        let reg = registry.clone();
        let create = tokio::spawn(async move {
            reg.get_or_create(Some("s1".to_string()), LaunchOptions::default())
                .await
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        while registry.attach_transport("s1", tx.clone()).await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Connected);

        // Status frames do not make the session ready
        router
            .route_ndjson("s1", r#"{"type":"system","subtype":"status","status":"compacting"}"#)
            .await;
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Connected);

        router
            .route_ndjson(
                "s1",
                r#"{"type":"system","subtype":"init","session_id":"cli-42","model":"m1"}"#,
            )
            .await;
        let (_, info, _) = create.await.unwrap().unwrap();
        assert_eq!(info.state, SessionState::Ready);
        assert_eq!(info.agent_session_id.as_deref(), Some("cli-42"));
        assert_eq!(info.model.as_deref(), Some("m1"));
        registry.kill("s1").await;
    }
}
