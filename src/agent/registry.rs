//! Session registry and lifecycle state machine
//!
//! The registry is the only owner of session records. Everything else (the
//! transport endpoint, the router, the reaper, the HTTP layer) goes through
//! its operations. Records are keyed by the external session id because the
//! agent process is spawned before its transport connection exists.
//!
//! ```text
//! starting ──▶ connected ──▶ ready ◀──▶ busy
//!     │            │           │          │
//!     └────────────┴───────────┴──────────┴──▶ exited
//! ```

use crate::agent::launcher::{LaunchCommand, ManagedProcess, ProcessEvent, ProcessEventKind, ProcessSupervisor};
use crate::agent::queue::OutboundQueue;
use crate::agent::transport::TRANSPORT_PATH_PREFIX;
use crate::agent::types::{
    interrupt_frame, to_ndjson_line, user_message_frame, LaunchOptions, ResultFrame, SessionEvent,
    SessionInfo, SessionState, SystemFrame,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, RwLock};

/// Longest accepted session id
const MAX_SESSION_ID_LEN: usize = 128;

/// Check that a caller-supplied session id can be used as a path segment
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(Error::InvalidSessionId(format!(
            "session id must be 1-{} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidSessionId(format!(
            "session id {:?} may only contain letters, digits, '-' and '_'",
            session_id
        )));
    }
    Ok(())
}

/// Milliseconds since UNIX epoch
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Internal per-session record
struct SessionEntry {
    info: SessionInfo,
    /// Handle to the agent process once launched
    process: Option<ManagedProcess>,
    /// Writer for the attached transport (NDJSON lines)
    transport: Option<mpsc::UnboundedSender<String>>,
    /// Set once an attached transport has gone away; it cannot reattach
    transport_closed: bool,
    /// Frames waiting for a transport
    queue: OutboundQueue,
    /// Per-session notifications
    events: broadcast::Sender<SessionEvent>,
    /// Lifecycle state, observable by waiters
    state_tx: watch::Sender<SessionState>,
}

impl SessionEntry {
    /// Apply a state transition if the state machine allows it
    fn transition(&mut self, next: SessionState) -> bool {
        let current = self.info.state;
        if !current.can_transition_to(next) {
            tracing::debug!(
                session_id = %self.info.session_id,
                from = %current,
                to = %next,
                "Rejected state transition"
            );
            return false;
        }
        self.info.state = next;
        self.state_tx.send_replace(next);
        tracing::debug!(session_id = %self.info.session_id, from = %current, to = %next, "Session state changed");
        true
    }

    /// Whether the session can still take new turns
    fn usable(&self) -> bool {
        self.info.state.is_live() && !self.transport_closed
    }

    /// Move to `exited` and notify subscribers. Returns false if already exited.
    fn exit(&mut self, code: Option<i32>) -> bool {
        if self.info.state == SessionState::Exited {
            return false;
        }
        self.info.exit_code = code;
        self.transport = None;
        self.transition(SessionState::Exited);
        self.emit(SessionEvent::Exited { code });
        true
    }

    fn closed_error(&self) -> Error {
        Error::Transport(format!("transport for {} is closed", self.info.session_id))
    }

    fn touch(&mut self) {
        self.info.last_activity = now_ms();
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine: nobody is waiting on this session right now
        let _ = self.events.send(event);
    }

    /// Write a line to the transport, or queue it if none has attached yet
    fn deliver(&mut self, line: String) -> Result<()> {
        if let Some(tx) = &self.transport {
            if tx.send(line).is_ok() {
                return Ok(());
            }
            tracing::warn!(session_id = %self.info.session_id, "Transport writer closed");
            self.transport = None;
            self.transport_closed = true;
            return Err(self.closed_error());
        }
        if self.transport_closed {
            return Err(self.closed_error());
        }
        self.queue
            .push(line)
            .map_err(|_| Error::QueueFull(self.info.session_id.clone()))
    }
}

/// Owner of every session record
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    supervisor: ProcessSupervisor,
    launcher: Arc<dyn LaunchCommand>,
    /// Base URL of the transport endpoint, e.g. `ws://127.0.0.1:8765`
    endpoint_base: String,
    config: SessionConfig,
}

impl SessionRegistry {
    /// Create a registry and start consuming process lifecycle events
    pub fn new(
        config: SessionConfig,
        launcher: Arc<dyn LaunchCommand>,
        endpoint_base: impl Into<String>,
    ) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ProcessEvent>();
        let registry = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            supervisor: ProcessSupervisor::new(events_tx, config.stop_grace()),
            launcher,
            endpoint_base: endpoint_base.into(),
            config,
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.handle_process_event(event).await;
            }
        });

        registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Transport endpoint URL an agent for `session_id` dials back to
    pub fn endpoint_url(&self, session_id: &str) -> String {
        format!(
            "{}{}{}",
            self.endpoint_base.trim_end_matches('/'),
            TRANSPORT_PATH_PREFIX,
            session_id
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Return the live session named `session_id`, or create and launch one.
    ///
    /// Blocks until the session is ready or the readiness timeout elapses. A
    /// session that times out stays registered. A session whose transport
    /// has closed is stopped and replaced by a fresh launch.
    pub async fn get_or_create(
        &self,
        session_id: Option<String>,
        options: LaunchOptions,
    ) -> Result<(String, SessionInfo, bool)> {
        let session_id = match session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let (state_rx, is_new, stale) = {
            let mut sessions = self.sessions.write().await;
            let existing = sessions
                .get(&session_id)
                .filter(|entry| entry.usable())
                .map(|entry| entry.state_tx.subscribe());
            match existing {
                Some(state_rx) => (state_rx, false, None),
                None => {
                    let stale = sessions.remove(&session_id).and_then(|mut old| {
                        tracing::debug!(
                            session_id = %session_id,
                            state = %old.info.state,
                            "Replacing unusable session record"
                        );
                        old.exit(None);
                        old.process
                    });
                    let now = now_ms();
                    let (events, _) = broadcast::channel(self.config.event_capacity);
                    let (state_tx, state_rx) = watch::channel(SessionState::Starting);
                    sessions.insert(
                        session_id.clone(),
                        SessionEntry {
                            info: SessionInfo {
                                session_id: session_id.clone(),
                                agent_session_id: None,
                                model: options.model.clone(),
                                permission_mode: options.permission_mode,
                                state: SessionState::Starting,
                                cwd: options.cwd.clone(),
                                pid: None,
                                exit_code: None,
                                created_at: now,
                                last_activity: now,
                            },
                            process: None,
                            transport: None,
                            transport_closed: false,
                            queue: OutboundQueue::new(self.config.max_queued_frames),
                            events,
                            state_tx,
                        },
                    );
                    (state_rx, true, stale)
                }
            }
        };

        if let Some(old) = stale {
            tracing::info!(session_id = %session_id, pid = ?old.pid(), "Stopping agent of replaced session");
            self.supervisor.stop(&old).await;
        }

        if is_new {
            tracing::info!(session_id = %session_id, model = ?options.model, "Creating session");
            self.launch(&session_id, &options).await?;
        } else {
            tracing::debug!(session_id = %session_id, "Reusing existing session");
        }

        self.wait_ready(&session_id, state_rx).await?;
        let info = self
            .get(&session_id)
            .await
            .ok_or(Error::ProcessExited { code: None })?;
        Ok((session_id, info, is_new))
    }

    /// Spawn the agent for a starting record. The spawn happens under the
    /// write lock so the record carries its pid before any process event
    /// for it can be handled.
    async fn launch(&self, session_id: &str, options: &LaunchOptions) -> Result<()> {
        let endpoint = self.endpoint_url(session_id);
        let spec = match self.launcher.build(session_id, &endpoint, options) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to build agent command");
                self.mark_exited(session_id, None).await;
                return Err(e);
            }
        };

        let mut sessions = self.sessions.write().await;
        let entry = match sessions.get_mut(session_id) {
            Some(entry) if entry.info.state.is_live() => entry,
            // Killed before the launch got here
            _ => return Err(Error::ProcessExited { code: None }),
        };

        match self.supervisor.launch(session_id, spec) {
            Ok(process) => {
                entry.info.pid = process.pid();
                entry.process = Some(process);
                Ok(())
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to launch agent");
                entry.exit(None);
                Err(e)
            }
        }
    }

    async fn wait_ready(
        &self,
        session_id: &str,
        mut state_rx: watch::Receiver<SessionState>,
    ) -> Result<()> {
        let waited = tokio::time::timeout(self.config.ready_timeout(), async {
            state_rx
                .wait_for(|s| {
                    matches!(
                        s,
                        SessionState::Ready | SessionState::Busy | SessionState::Exited
                    )
                })
                .await
                .map(|s| *s)
        })
        .await;

        match waited {
            Ok(Ok(SessionState::Exited)) | Ok(Err(_)) => {
                let code = self.get(session_id).await.and_then(|info| info.exit_code);
                Err(Error::ProcessExited { code })
            }
            Ok(Ok(_)) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    session_id,
                    timeout_secs = self.config.ready_timeout_secs,
                    "Session did not become ready in time"
                );
                Err(Error::ReadinessTimeout(session_id.to_string()))
            }
        }
    }

    /// Terminate a session's process and remove its record. No-op if unknown.
    pub async fn kill(&self, session_id: &str) {
        let process = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(entry) => entry.process.clone(),
                None => return,
            }
        };

        tracing::info!(session_id, "Killing session");
        let code = match &process {
            Some(process) => self.supervisor.stop(process).await,
            None => None,
        };
        self.mark_exited(session_id, code).await;

        let removed = {
            let mut sessions = self.sessions.write().await;
            let exited = sessions
                .get(session_id)
                .map(|entry| entry.info.state == SessionState::Exited)
                .unwrap_or(false);
            if exited {
                sessions.remove(session_id)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            tracing::info!(session_id, "Session removed");
            // Launched after the handle was read above
            if let (None, Some(late)) = (&process, &entry.process) {
                self.supervisor.stop(late).await;
            }
        }
    }

    /// Kill every session (shutdown)
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        futures::future::join_all(ids.iter().map(|id| self.kill(id))).await;
    }

    /// Move a session to `exited` and notify subscribers. Idempotent.
    pub async fn mark_exited(&self, session_id: &str, code: Option<i32>) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.exit(code) {
                tracing::info!(session_id, exit_code = ?code, "Session exited");
            }
        }
    }

    async fn handle_process_event(&self, event: ProcessEvent) {
        let ProcessEvent {
            session_id,
            pid,
            kind,
        } = event;

        // Ignore events about a process that no longer backs this id
        let current = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|entry| entry.info.pid == pid);
        if current != Some(true) {
            tracing::debug!(session_id = %session_id, pid = ?pid, "Ignoring stale process event");
            return;
        }

        match kind {
            ProcessEventKind::SpawnFailed(message) => {
                tracing::error!(session_id = %session_id, "{}", message);
                self.mark_exited(&session_id, None).await;
            }
            ProcessEventKind::Exited { code } => {
                tracing::warn!(session_id = %session_id, exit_code = ?code, "Agent process exited unexpectedly");
                self.mark_exited(&session_id, code).await;
            }
            ProcessEventKind::Stopped { code } => {
                self.mark_exited(&session_id, code).await;
            }
        }
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Attach a transport writer to a starting session and flush its queue
    pub async fn attach_transport(
        &self,
        session_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .filter(|entry| entry.info.state == SessionState::Starting)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let mut pending = entry.queue.drain().into_iter();
        let mut flushed = 0usize;
        while let Some(line) = pending.next() {
            if let Err(mpsc::error::SendError(line)) = sender.send(line) {
                let mut rest = vec![line];
                rest.extend(pending);
                entry.queue.requeue_front(rest);
                tracing::warn!(session_id, flushed, "Transport closed while flushing queue");
                return Err(Error::Transport(format!(
                    "transport for {} closed during flush",
                    session_id
                )));
            }
            flushed += 1;
        }

        entry.transport = Some(sender);
        entry.touch();
        entry.transition(SessionState::Connected);
        tracing::info!(session_id, flushed, "Transport attached");
        Ok(())
    }

    /// Clear a session's transport; the record is kept but takes no new
    /// turns, and `get_or_create` replaces it with a fresh launch
    pub async fn detach_transport(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.transport = None;
            entry.transport_closed = true;
            if entry.info.state == SessionState::Busy {
                entry.emit(SessionEvent::Error(
                    "transport closed while a turn was in flight".to_string(),
                ));
            }
            tracing::info!(session_id, state = %entry.info.state, "Transport detached");
        }
    }

    /// Send a frame now, or queue it until the first transport attaches
    pub async fn send(&self, session_id: &str, frame: &Value) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .filter(|entry| entry.info.state.is_live())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        entry.deliver(to_ndjson_line(frame))
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Dispatch one user turn to a ready session.
    ///
    /// The returned receiver is subscribed before the frame is sent.
    pub async fn start_turn(
        &self,
        session_id: &str,
        content: Value,
    ) -> Result<broadcast::Receiver<SessionEvent>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        match entry.info.state {
            SessionState::Ready => {}
            SessionState::Exited => {
                return Err(Error::ProcessExited {
                    code: entry.info.exit_code,
                })
            }
            _ => return Err(Error::SessionBusy(session_id.to_string())),
        }
        if entry.transport_closed {
            return Err(entry.closed_error());
        }

        let events = entry.events.subscribe();
        let frame = user_message_frame(content, entry.info.agent_session_id.as_deref());
        entry.transition(SessionState::Busy);
        entry.touch();
        if let Err(e) = entry.deliver(to_ndjson_line(&frame)) {
            entry.transition(SessionState::Ready);
            return Err(e);
        }
        tracing::debug!(session_id, "Turn dispatched");
        Ok(events)
    }

    /// Ask the agent to abandon its current turn; completion is not awaited
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        tracing::info!(session_id, "Interrupting session");
        self.send(session_id, &interrupt_frame()).await
    }

    /// Record the agent's init frame: `connected → ready`
    pub async fn mark_ready(&self, session_id: &str, init: SystemFrame) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        if entry.info.state != SessionState::Connected {
            tracing::debug!(session_id, state = %entry.info.state, "Ignoring init frame");
            return;
        }
        entry.info.agent_session_id = init.session_id.clone();
        if init.model.is_some() {
            entry.info.model = init.model.clone();
        }
        entry.touch();
        entry.transition(SessionState::Ready);
        tracing::info!(
            session_id,
            agent_session_id = ?init.session_id,
            model = ?init.model,
            "Session ready"
        );
        entry.emit(SessionEvent::Ready(init));
    }

    /// Record a turn's terminal result: `busy → ready`
    pub async fn finish_turn(&self, session_id: &str, result: ResultFrame) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.info.state == SessionState::Busy {
                entry.transition(SessionState::Ready);
            }
            entry.touch();
            tracing::debug!(
                session_id,
                is_error = result.is_error,
                cost_usd = ?result.total_cost_usd,
                "Turn finished"
            );
            entry.emit(SessionEvent::Result(result));
        }
    }

    /// Refresh last activity and notify subscribers
    pub async fn publish(&self, session_id: &str, event: SessionEvent) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.touch();
            entry.emit(event);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.info.clone())
    }

    /// Snapshot of every record, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.events.subscribe())
    }

    /// Drop a record without touching its process
    pub async fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|entry| entry.info)
    }

    pub async fn queued_frames(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.queue.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, session_id: &str, by_ms: i64) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.info.last_activity -= by_ms;
        }
    }
}

/// Init frame as an agent would send it
#[cfg(test)]
pub(crate) fn init_frame(agent_session_id: &str) -> SystemFrame {
    SystemFrame {
        subtype: "init".to_string(),
        session_id: Some(agent_session_id.to_string()),
        cwd: None,
        model: Some("test-model".to_string()),
        tools: None,
        permission_mode: None,
        claude_code_version: None,
        status: None,
    }
}

/// Play the agent side of the handshake once `session_id` is starting:
/// attach an in-memory transport and send init. Returns the transport's
/// receiving end.
#[cfg(test)]
pub(crate) async fn connect_fake_agent(
    registry: &SessionRegistry,
    session_id: &str,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    for _ in 0..200 {
        if registry.attach_transport(session_id, tx.clone()).await.is_ok() {
            registry
                .mark_ready(session_id, init_frame(&format!("agent-{}", session_id)))
                .await;
            return rx;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session {} never reached starting", session_id);
}

#[cfg(test)]
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        ready_timeout_secs: 5,
        stop_grace_secs: 1,
        ..SessionConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::launcher::FixedCommand;
    use std::time::Duration;

    fn sleeper() -> Arc<FixedCommand> {
        Arc::new(FixedCommand::new("sleep", &["30"]))
    }

    async fn ready_session(registry: &Arc<SessionRegistry>, id: &str) -> mpsc::UnboundedReceiver<String> {
        let reg = registry.clone();
        let id_owned = id.to_string();
        let create = tokio::spawn(async move {
            reg.get_or_create(Some(id_owned), LaunchOptions::default())
                .await
        });
        let rx = connect_fake_agent(registry, id).await;
        let (_, info, is_new) = create.await.unwrap().unwrap();
        assert!(is_new);
        assert_eq!(info.state, SessionState::Ready);
        rx
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-DEF_123").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id(&"x".repeat(129)).is_err());
        assert!(validate_session_id(&"x".repeat(128)).is_ok());
    }

    #[tokio::test]
    async fn test_endpoint_url() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:8765/");
        assert_eq!(registry.endpoint_url("s1"), "ws://127.0.0.1:8765/ws/cli/s1");
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_session() {
        let launcher = sleeper();
        let registry = SessionRegistry::new(test_config(), launcher.clone(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;

        let (id, info, is_new) = registry
            .get_or_create(Some("s1".to_string()), LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(id, "s1");
        assert!(!is_new);
        assert_eq!(info.agent_session_id.as_deref(), Some("agent-s1"));
        assert_eq!(launcher.launch_count(), 1);
        assert!(info.pid.is_some());

        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_get_or_create_generates_id() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let reg = registry.clone();
        let create = tokio::spawn(async move { reg.get_or_create(None, LaunchOptions::default()).await });

        let id = loop {
            if let Some(info) = registry.list().await.into_iter().next() {
                break info.session_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let _rx = connect_fake_agent(&registry, &id).await;
        let (created, _, is_new) = create.await.unwrap().unwrap();
        assert_eq!(created, id);
        assert!(is_new);
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        registry.kill(&id).await;
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_bad_id() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let err = registry
            .get_or_create(Some("../etc".to_string()), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSessionId(_)));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_keeps_session() {
        let config = SessionConfig {
            ready_timeout_secs: 1,
            ..test_config()
        };
        let registry = SessionRegistry::new(config, sleeper(), "ws://127.0.0.1:0");
        let err = registry
            .get_or_create(Some("slow".to_string()), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout(_)));

        let info = registry.get("slow").await.unwrap();
        assert_eq!(info.state, SessionState::Starting);

        // Still completes later
        let _rx = connect_fake_agent(&registry, "slow").await;
        assert_eq!(registry.get("slow").await.unwrap().state, SessionState::Ready);
        registry.kill("slow").await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let launcher = Arc::new(FixedCommand::new("/nonexistent/agent", &[]));
        let registry = SessionRegistry::new(test_config(), launcher, "ws://127.0.0.1:0");
        let err = registry
            .get_or_create(Some("s1".to_string()), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Exited);
    }

    #[tokio::test]
    async fn test_process_exit_fails_waiter() {
        let launcher = Arc::new(FixedCommand::new("sh", &["-c", "exit 7"]));
        let registry = SessionRegistry::new(test_config(), launcher, "ws://127.0.0.1:0");
        let err = registry
            .get_or_create(Some("s1".to_string()), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessExited { code: Some(7) }));
    }

    #[tokio::test]
    async fn test_queued_frames_flush_in_order_on_attach() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let reg = registry.clone();
        let create = tokio::spawn(async move {
            reg.get_or_create(Some("s1".to_string()), LaunchOptions::default())
                .await
        });

        while registry.get("s1").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for i in 0..3 {
            registry
                .send("s1", &serde_json::json!({"type": "user", "n": i}))
                .await
                .unwrap();
        }
        assert_eq!(registry.queued_frames("s1").await, 3);

        let mut rx = connect_fake_agent(&registry, "s1").await;
        create.await.unwrap().unwrap();
        for i in 0..3 {
            let line = rx.recv().await.unwrap();
            let frame: Value = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(frame["n"], i);
        }
        assert_eq!(registry.queued_frames("s1").await, 0);

        // Attached: goes straight to the transport
        registry.send("s1", &serde_json::json!({"n": 3})).await.unwrap();
        assert!(rx.recv().await.unwrap().contains("\"n\":3"));

        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let config = SessionConfig {
            max_queued_frames: Some(1),
            ..test_config()
        };
        let registry = SessionRegistry::new(config, sleeper(), "ws://127.0.0.1:0");
        let reg = registry.clone();
        let _create = tokio::spawn(async move {
            reg.get_or_create(Some("s1".to_string()), LaunchOptions::default())
                .await
        });
        while registry.get("s1").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.send("s1", &serde_json::json!({"n": 1})).await.unwrap();
        let err = registry.send("s1", &serde_json::json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_second_attach_is_refused() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            registry.attach_transport("s1", tx.clone()).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(registry.attach_transport("missing", tx).await.is_err());
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_turn_requires_ready() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let reg = registry.clone();
        let _create = tokio::spawn(async move {
            reg.get_or_create(Some("s1".to_string()), LaunchOptions::default())
                .await
        });
        while registry.get("s1").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Still starting
        let err = registry.start_turn("s1", "hi".into()).await.unwrap_err();
        assert!(matches!(err, Error::SessionBusy(_)));

        let mut rx = connect_fake_agent(&registry, "s1").await;
        let _events = registry.start_turn("s1", "hi".into()).await.unwrap();
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Busy);

        let line = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(frame["type"], "user");
        assert_eq!(frame["message"]["content"], "hi");
        assert_eq!(frame["session_id"], "agent-s1");

        // Busy rejects a second turn
        assert!(matches!(
            registry.start_turn("s1", "again".into()).await,
            Err(Error::SessionBusy(_))
        ));
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_finish_turn_returns_to_ready_and_emits() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        let mut events = registry.start_turn("s1", "hi".into()).await.unwrap();

        let result: ResultFrame =
            serde_json::from_value(serde_json::json!({"subtype": "success", "stop_reason": "end_turn"}))
                .unwrap();
        registry.finish_turn("s1", result).await;
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Ready);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Result(_)));
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_detach_while_busy_emits_error() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        let mut events = registry.start_turn("s1", "hi".into()).await.unwrap();

        registry.detach_transport("s1").await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Error(_)));
        // Record retained
        assert!(registry.get("s1").await.is_some());
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_turns_and_is_replaced() {
        let launcher = sleeper();
        let registry = SessionRegistry::new(test_config(), launcher.clone(), "ws://127.0.0.1:0");
        let rx = ready_session(&registry, "s1").await;
        let old_pid = registry.get("s1").await.unwrap().pid;

        drop(rx);
        registry.detach_transport("s1").await;

        let err = registry.start_turn("s1", "hi".into()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(registry.get("s1").await.unwrap().state, SessionState::Ready);
        assert_eq!(registry.queued_frames("s1").await, 0);

        // Same id gets a fresh process instead of the dead one
        let mut rx = ready_session(&registry, "s1").await;
        assert_eq!(launcher.launch_count(), 2);
        let info = registry.get("s1").await.unwrap();
        assert_ne!(info.pid, old_pid);
        assert_eq!(info.state, SessionState::Ready);

        let _events = registry.start_turn("s1", "hi".into()).await.unwrap();
        let frame: Value = serde_json::from_str(rx.recv().await.unwrap().trim_end()).unwrap();
        assert_eq!(frame["message"]["content"], "hi");

        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_send_to_dropped_writer_fails() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let rx = ready_session(&registry, "s1").await;
        drop(rx);

        let err = registry
            .send("s1", &serde_json::json!({"type": "keep_alive"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(matches!(
            registry.start_turn("s1", "hi".into()).await,
            Err(Error::Transport(_))
        ));
        registry.kill("s1").await;
    }

    #[tokio::test]
    async fn test_kill_removes_and_is_idempotent() {
        let registry = SessionRegistry::new(test_config(), sleeper(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        let mut events = registry.subscribe("s1").await.unwrap();

        registry.kill("s1").await;
        assert!(registry.get("s1").await.is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Exited { .. }
        ));

        registry.kill("s1").await;
        registry.kill("never-existed").await;
    }

    #[tokio::test]
    async fn test_kill_forces_stubborn_process() {
        let launcher = Arc::new(FixedCommand::new("sh", &["-c", "trap '' TERM; sleep 30"]));
        let config = SessionConfig {
            stop_grace_secs: 1,
            ..test_config()
        };
        let registry = SessionRegistry::new(config, launcher, "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        registry.kill("s1").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_exited_and_recreates() {
        let launcher = Arc::new(FixedCommand::new("sleep", &["1"]));
        let registry = SessionRegistry::new(test_config(), launcher.clone(), "ws://127.0.0.1:0");
        let _rx = ready_session(&registry, "s1").await;
        let mut events = registry.subscribe("s1").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Exited { code: Some(0) }
        ));
        let info = registry.get("s1").await.unwrap();
        assert_eq!(info.state, SessionState::Exited);
        assert_eq!(info.exit_code, Some(0));

        // An exited record is replaced by a fresh launch
        let _rx = ready_session(&registry, "s1").await;
        assert_eq!(launcher.launch_count(), 2);
        registry.kill("s1").await;
    }
}
