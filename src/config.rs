//! Agent Bridge configuration management

use crate::agent::types::PermissionMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main Agent Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listener configuration
    pub server: ServerConfig,

    /// Session lifecycle configuration
    pub session: SessionConfig,

    /// Agent process launch configuration
    pub launcher: LauncherConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 || self.server.socket_port == 0 {
            return Err(Error::Config("ports must be non-zero".to_string()));
        }
        if self.server.http_port == self.server.socket_port {
            return Err(Error::Config(format!(
                "http_port and socket_port must differ (both {})",
                self.server.http_port
            )));
        }
        let s = &self.session;
        for (name, value) in [
            ("idle_timeout_secs", s.idle_timeout_secs),
            ("reap_interval_secs", s.reap_interval_secs),
            ("ready_timeout_secs", s.ready_timeout_secs),
            ("turn_timeout_secs", s.turn_timeout_secs),
            ("stop_grace_secs", s.stop_grace_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("session.{} must be non-zero", name)));
            }
        }
        if s.event_capacity == 0 {
            return Err(Error::Config(
                "session.event_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind both listeners to
    pub host: String,

    /// Port of the HTTP API
    pub http_port: u16,

    /// Port the agent processes dial back to
    pub socket_port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8080,
            socket_port: 8765,
            cors_origins: Vec::new(),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are killed by the reaper
    pub idle_timeout_secs: u64,

    /// Reaper pass interval
    pub reap_interval_secs: u64,

    /// How long `get_or_create` waits for a new session to become ready
    pub ready_timeout_secs: u64,

    /// How long a non-streaming caller waits for a turn result
    pub turn_timeout_secs: u64,

    /// Grace period between the termination signal and a forced kill
    pub stop_grace_secs: u64,

    /// Maximum frames queued while no transport is attached (unset = unbounded)
    pub max_queued_frames: Option<usize>,

    /// Per-session notification channel capacity
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 60,
            ready_timeout_secs: 60,
            turn_timeout_secs: 5 * 60,
            stop_grace_secs: 5,
            max_queued_frames: None,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Agent process launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Agent binary (unset = resolve `claude` from PATH and known locations)
    pub binary: Option<PathBuf>,

    /// Model used when the caller does not name one
    pub default_model: Option<String>,

    /// Permission policy used when the caller does not name one
    pub default_permission_mode: PermissionMode,

    /// Ask the agent for partial stream events (needed for token streaming)
    pub include_partial_messages: bool,

    /// Extra arguments appended to every launch
    pub extra_args: Vec<String>,

    /// Extra environment variables for every launch
    pub env: HashMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            binary: None,
            default_model: None,
            default_permission_mode: PermissionMode::Default,
            include_partial_messages: true,
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}
