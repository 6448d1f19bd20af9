//! Agent process lifecycle management
//!
//! Launches one agent process per session, drains its stdout/stderr into the
//! log, watches for exit, and stops it gracefully (signal, grace period, then
//! forced kill). Each process dials back to the bridge through the transport
//! endpoint URL it is launched with.

use crate::agent::types::LaunchOptions;
use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};

/// Upper bound on waiting for a force-killed process to be reaped
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Fully resolved command line for one agent process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Builds the command line that starts an agent bound to a transport endpoint
pub trait LaunchCommand: Send + Sync {
    fn build(
        &self,
        session_id: &str,
        endpoint_url: &str,
        options: &LaunchOptions,
    ) -> Result<LaunchSpec>;
}

/// Launch command for the Claude Code CLI in SDK (`--sdk-url`) mode
pub struct ClaudeCommand {
    config: LauncherConfig,
}

impl ClaudeCommand {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    /// Binary this command would run
    pub fn binary(&self) -> Result<PathBuf> {
        match &self.config.binary {
            Some(path) => Ok(path.clone()),
            None => resolve_claude_binary(),
        }
    }
}

impl LaunchCommand for ClaudeCommand {
    fn build(
        &self,
        _session_id: &str,
        endpoint_url: &str,
        options: &LaunchOptions,
    ) -> Result<LaunchSpec> {
        let program = self.binary()?;

        let mut args = vec![
            "--sdk-url".to_string(),
            endpoint_url.to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if self.config.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        if let Some(model) = options.model.as_ref().or(self.config.default_model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--permission-mode".to_string());
        args.push(options.permission_mode.as_str().to_string());
        args.extend(self.config.extra_args.iter().cloned());

        // Headless mode with empty prompt; turns arrive over the transport
        args.push("-p".to_string());
        args.push(String::new());

        let mut env: Vec<(String, String)> = vec![("CLAUDECODE".to_string(), "1".to_string())];
        env.extend(
            self.config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if let Some(key) = &options.api_key {
            env.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
        }

        Ok(LaunchSpec {
            program,
            args,
            env,
            cwd: options.cwd.as_ref().map(PathBuf::from),
        })
    }
}

/// Lifecycle notification from the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub session_id: String,
    /// Pid of the process the event is about (unset for spawn failures)
    pub pid: Option<u32>,
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    /// Binary missing or failed to start
    SpawnFailed(String),
    /// Exited without being asked to
    Exited { code: Option<i32> },
    /// Exited after a stop request
    Stopped { code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessStatus {
    Running,
    Exited(Option<i32>),
}

/// Handle to one running (or finished) agent process
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    session_id: String,
    pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
    force_kill: Arc<Notify>,
    stop_requested: Arc<AtomicBool>,
}

impl ManagedProcess {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        matches!(*self.status.borrow(), ProcessStatus::Exited(_))
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&self) -> Option<i32> {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|s| matches!(s, ProcessStatus::Exited(_)))
            .await
            .map(|s| *s);
        match result {
            Ok(ProcessStatus::Exited(code)) => code,
            _ => None,
        }
    }
}

/// Starts and stops agent processes
pub struct ProcessSupervisor {
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor reporting lifecycle events on `events_tx`
    pub fn new(events_tx: mpsc::UnboundedSender<ProcessEvent>, stop_grace: Duration) -> Self {
        Self {
            events_tx,
            stop_grace,
        }
    }

    /// Spawn the process described by `spec` for `session_id`
    pub fn launch(&self, session_id: &str, spec: LaunchSpec) -> Result<ManagedProcess> {
        let spawn_start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        tracing::info!(
            session_id = session_id,
            program = %spec.program.display(),
            cwd = ?spec.cwd,
            "Spawning agent process"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "Failed to spawn agent process at {}: {}",
                    spec.program.display(),
                    e
                );
                tracing::error!(session_id = session_id, error = %e, "Agent spawn failed");
                let _ = self.events_tx.send(ProcessEvent {
                    session_id: session_id.to_string(),
                    pid: None,
                    kind: ProcessEventKind::SpawnFailed(message.clone()),
                });
                return Err(Error::Spawn(message));
            }
        };

        let pid = child.id();
        tracing::info!(
            session_id = session_id,
            pid = ?pid,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "Agent process spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            spawn_output_logger(session_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_logger(session_id.to_string(), "stderr", stderr);
        }

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let force_kill = Arc::new(Notify::new());
        let stop_requested = Arc::new(AtomicBool::new(false));

        // Exit monitor owns the child
        let monitor_session = session_id.to_string();
        let monitor_kill = force_kill.clone();
        let monitor_stop = stop_requested.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = monitor_kill.notified() => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(session_id = %monitor_session, "Force kill failed: {}", e);
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(session_id = %monitor_session, "Failed to read exit status: {}", e);
                    None
                }
            };
            let requested = monitor_stop.load(Ordering::SeqCst);

            tracing::info!(
                session_id = %monitor_session,
                exit_code = ?code,
                requested,
                uptime_ms = spawn_start.elapsed().as_millis() as u64,
                "Agent process exited"
            );

            let _ = status_tx.send(ProcessStatus::Exited(code));
            let kind = if requested {
                ProcessEventKind::Stopped { code }
            } else {
                ProcessEventKind::Exited { code }
            };
            let _ = events_tx.send(ProcessEvent {
                session_id: monitor_session,
                pid,
                kind,
            });
        });

        Ok(ManagedProcess {
            session_id: session_id.to_string(),
            pid,
            status: status_rx,
            force_kill,
            stop_requested,
        })
    }

    /// Stop a process: termination signal, grace period, then forced kill.
    ///
    /// Always returns; returns at once for a process that already exited.
    pub async fn stop(&self, process: &ManagedProcess) -> Option<i32> {
        if process.has_exited() {
            return process.wait().await;
        }
        process.stop_requested.store(true, Ordering::SeqCst);

        let signalled = process.pid.map(send_terminate).unwrap_or(false);
        if signalled {
            tracing::info!(session_id = %process.session_id, pid = ?process.pid, "Stopping agent process");
            if let Ok(code) = tokio::time::timeout(self.stop_grace, process.wait()).await {
                return code;
            }
            tracing::warn!(
                session_id = %process.session_id,
                grace_ms = self.stop_grace.as_millis() as u64,
                "Agent process ignored termination signal, force killing"
            );
        }

        process.force_kill.notify_one();
        match tokio::time::timeout(FORCE_KILL_WAIT, process.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::error!(session_id = %process.session_id, "Agent process did not die after kill");
                None
            }
        }
    }
}

/// Log every line a child writes on one of its output streams
fn spawn_output_logger<R>(session_id: String, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_count: u64 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            if stream == "stderr" {
                tracing::info!(session_id = %session_id, "agent stderr: {}", line);
            } else {
                tracing::debug!(session_id = %session_id, "agent stdout: {}", line);
            }
        }
        tracing::debug!(session_id = %session_id, stream, total_lines = line_count, "agent output ended");
    });
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

/// Resolve the Claude Code CLI binary path
fn resolve_claude_binary() -> Result<PathBuf> {
    if let Some(found) = find_in_path(std::env::var_os("PATH").as_deref(), "claude") {
        return Ok(found);
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".claude").join("local").join("claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }

    Err(Error::Spawn(
        "Claude Code CLI not found. Install it from https://claude.ai/code".to_string(),
    ))
}

/// First regular file named `name` in a PATH-style directory list
fn find_in_path(paths: Option<&OsStr>, name: &str) -> Option<PathBuf> {
    std::env::split_paths(paths?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Launch command returning the same spec every time, counting launches
#[cfg(test)]
pub(crate) struct FixedCommand {
    pub spec: LaunchSpec,
    pub launches: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FixedCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            spec: LaunchSpec::new(program, args.iter().map(|a| a.to_string()).collect()),
            launches: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl LaunchCommand for FixedCommand {
    fn build(&self, _: &str, _: &str, _: &LaunchOptions) -> Result<LaunchSpec> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(self.spec.clone())
    }
}
