//! Transport endpoint for agent processes
//!
//! Agents dial back to `ws://<host>:<socket_port>/ws/cli/<session-id>`. A
//! connection is attached to its session as the transport handle; every text
//! message is NDJSON and is routed line by line in arrival order.

use crate::agent::bridge::MessageRouter;
use crate::agent::registry::validate_session_id;
use crate::error::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Uri,
    response::IntoResponse,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Path prefix agents connect on; the session id follows it
pub const TRANSPORT_PATH_PREFIX: &str = "/ws/cli/";

/// Close code for a path that does not match the transport pattern
pub const CLOSE_MALFORMED_PATH: u16 = 4000;

/// Close code for a session id with no session waiting for a transport
pub const CLOSE_UNKNOWN_SESSION: u16 = 4004;

/// Extract the session id from a transport path
pub fn parse_session_path(path: &str) -> Option<&str> {
    let session_id = path.strip_prefix(TRANSPORT_PATH_PREFIX)?;
    validate_session_id(session_id).ok()?;
    Some(session_id)
}

/// Router accepting agent connections on any path
pub fn transport_router(router: Arc<MessageRouter>) -> Router {
    Router::new().fallback(agent_upgrade).with_state(router)
}

/// Serve the transport endpoint on an already-bound listener
pub async fn serve(listener: TcpListener, router: Arc<MessageRouter>) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Agent transport listening on ws://{}{}<session-id>", addr, TRANSPORT_PATH_PREFIX);
    axum::serve(listener, transport_router(router)).await?;
    Ok(())
}

async fn agent_upgrade(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(router): State<Arc<MessageRouter>>,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| handle_agent_socket(socket, path, router))
}

async fn reject(mut ws_sender: SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Handle one agent connection (NDJSON protocol)
async fn handle_agent_socket(socket: WebSocket, path: String, router: Arc<MessageRouter>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(session_id) = parse_session_path(&path).map(str::to_string) else {
        tracing::warn!(path = %path, "Rejecting agent connection: malformed path");
        reject(ws_sender, CLOSE_MALFORMED_PATH, "malformed path").await;
        return;
    };

    // Channel for registry → agent NDJSON lines
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Err(e) = router.registry().attach_transport(&session_id, tx).await {
        tracing::warn!(session_id = %session_id, "Rejecting agent connection: {}", e);
        reject(ws_sender, CLOSE_UNKNOWN_SESSION, "unknown session").await;
        return;
    }
    tracing::info!(session_id = %session_id, "Agent connected");

    let send_session_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(line)).await {
                tracing::warn!(session_id = %send_session_id, "Agent socket send failed: {}", e);
                return;
            }
        }
        // Registry dropped the writer (session exited)
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let recv_router = router.clone();
    let recv_session_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    recv_router.route_ndjson(&recv_session_id, &text).await;
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => recv_router.route_ndjson(&recv_session_id, &text).await,
                    Err(e) => {
                        tracing::warn!(session_id = %recv_session_id, "Dropping non-UTF-8 agent message: {}", e);
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(session_id = %recv_session_id, close = ?frame, "Agent closed transport");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %recv_session_id, "Agent socket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    router.registry().detach_transport(&session_id).await;
    tracing::info!(session_id = %session_id, "Agent disconnected");
}
