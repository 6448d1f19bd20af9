//! Gateway server implementation
//!
//! Binds the agent transport listener and the HTTP listener, creates the
//! session registry, and runs the idle reaper.

use crate::agent::bridge::{AutoApprove, MessageRouter, PermissionPolicy};
use crate::agent::launcher::{ClaudeCommand, LaunchCommand};
use crate::agent::reaper::IdleReaper;
use crate::agent::registry::SessionRegistry;
use crate::agent::transport;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::gateway::handler::{api_router, ApiState};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Everything that exists only while the gateway runs
struct Running {
    registry: Arc<SessionRegistry>,
    http_addr: SocketAddr,
    socket_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// Agent Bridge gateway
pub struct Gateway {
    config: BridgeConfig,
    launcher: Arc<dyn LaunchCommand>,
    policy: Arc<dyn PermissionPolicy>,
    state: Arc<RwLock<GatewayState>>,
    running: RwLock<Option<Running>>,
}

impl Gateway {
    /// Create a gateway that launches agents with the configured CLI
    pub fn new(config: BridgeConfig) -> Self {
        let launcher = Arc::new(ClaudeCommand::new(config.launcher.clone()));
        Self::with_parts(config, launcher, Arc::new(AutoApprove))
    }

    fn with_parts(
        config: BridgeConfig,
        launcher: Arc<dyn LaunchCommand>,
        policy: Arc<dyn PermissionPolicy>,
    ) -> Self {
        Self {
            config,
            launcher,
            policy,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            running: RwLock::new(None),
        }
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start both listeners and the reaper
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Internal("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        match self.bind_and_spawn().await {
            Ok(running) => {
                tracing::info!(
                    http = %running.http_addr,
                    socket = %running.socket_addr,
                    "Agent Bridge gateway started"
                );
                *self.running.write().await = Some(running);
                *self.state.write().await = GatewayState::Running;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = GatewayState::Stopped;
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(&self) -> Result<Running> {
        let server = &self.config.server;
        let session = &self.config.session;

        let socket_listener = TcpListener::bind((server.host.as_str(), server.socket_port))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "Failed to bind agent socket {}:{}: {}",
                    server.host, server.socket_port, e
                ))
            })?;
        let socket_addr = socket_listener.local_addr()?;

        let registry = SessionRegistry::new(
            session.clone(),
            self.launcher.clone(),
            endpoint_base(socket_addr),
        );
        let router = Arc::new(MessageRouter::with_policy(
            registry.clone(),
            self.policy.clone(),
        ));

        let http_listener = TcpListener::bind((server.host.as_str(), server.http_port))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "Failed to bind HTTP {}:{}: {}",
                    server.host, server.http_port, e
                ))
            })?;
        let http_addr = http_listener.local_addr()?;

        let transport_task = tokio::spawn(async move {
            if let Err(e) = transport::serve(socket_listener, router).await {
                tracing::error!("Agent transport stopped: {}", e);
            }
        });

        let app = api_router(
            ApiState {
                registry: registry.clone(),
                default_permission_mode: self.config.launcher.default_permission_mode,
                turn_timeout: session.turn_timeout(),
            },
            &server.cors_origins,
        );
        let http_task = tokio::spawn(async move {
            tracing::info!("HTTP API listening on http://{}", http_addr);
            if let Err(e) = axum::serve(http_listener, app).await {
                tracing::error!("HTTP server stopped: {}", e);
            }
        });

        let reaper_task = IdleReaper::new(
            registry.clone(),
            session.reap_interval(),
            session.idle_timeout(),
        )
        .spawn();

        Ok(Running {
            registry,
            http_addr,
            socket_addr,
            tasks: vec![transport_task, http_task, reaper_task],
        })
    }

    /// Stop the gateway, terminating every session
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping Agent Bridge gateway");

        if let Some(running) = self.running.write().await.take() {
            for task in &running.tasks {
                task.abort();
            }
            let count = running.registry.len().await;
            running.registry.kill_all().await;
            tracing::info!(sessions = count, "All sessions terminated");
        }

        *self.state.write().await = GatewayState::Stopped;
        tracing::info!("Agent Bridge gateway stopped");
        Ok(())
    }

    /// Session registry, while running
    pub async fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.running
            .read()
            .await
            .as_ref()
            .map(|r| r.registry.clone())
    }

    /// Bound HTTP address, while running
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.running.read().await.as_ref().map(|r| r.http_addr)
    }

    /// Bound agent socket address, while running
    pub async fn socket_addr(&self) -> Option<SocketAddr> {
        self.running.read().await.as_ref().map(|r| r.socket_addr)
    }

    /// Get gateway status information
    pub async fn status(&self) -> GatewayStatus {
        let state = *self.state.read().await;
        let running = self.running.read().await;
        let session_count = match running.as_ref() {
            Some(r) => r.registry.len().await,
            None => 0,
        };

        GatewayStatus {
            state,
            http_addr: running.as_ref().map(|r| r.http_addr.to_string()),
            socket_addr: running.as_ref().map(|r| r.socket_addr.to_string()),
            session_count,
        }
    }
}

/// Base URL agents dial back to; wildcard binds are reached over loopback
fn endpoint_base(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        }
    } else {
        addr.ip()
    };
    format!("ws://{}", SocketAddr::new(ip, addr.port()))
}

/// Gateway status information
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Current state
    pub state: GatewayState,
    /// Bound HTTP address
    pub http_addr: Option<String>,
    /// Bound agent socket address
    pub socket_addr: Option<String>,
    /// Number of session records
    pub session_count: usize,
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: BridgeConfig,
    launcher: Option<Arc<dyn LaunchCommand>>,
    policy: Option<Arc<dyn PermissionPolicy>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            launcher: None,
            policy: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the bind host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    /// Set the HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.server.http_port = port;
        self
    }

    /// Set the agent socket port
    pub fn socket_port(mut self, port: u16) -> Self {
        self.config.server.socket_port = port;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Replace the agent launch command
    pub fn launcher(mut self, launcher: Arc<dyn LaunchCommand>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Replace the tool permission policy
    pub fn permission_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Gateway {
        let launcher = self
            .launcher
            .unwrap_or_else(|| {
                Arc::new(ClaudeCommand::new(self.config.launcher.clone())) as Arc<dyn LaunchCommand>
            });
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(AutoApprove) as Arc<dyn PermissionPolicy>);
        Gateway::with_parts(self.config, launcher, policy)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
