//! Agent Bridge - request/response API in front of long-running agent processes

use agent_bridge::{
    agent::ClaudeCommand,
    config::BridgeConfig,
    gateway::GatewayBuilder,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-bridge")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Request/response API in front of long-running agent processes")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge (HTTP API, agent transport and reaper)
    Serve {
        /// Host to bind both listeners to
        #[arg(long)]
        host: Option<String>,

        /// HTTP API port
        #[arg(long)]
        http_port: Option<u16>,

        /// Port agent processes connect back to
        #[arg(long)]
        socket_port: Option<u16>,

        /// Kill sessions idle for longer than this many seconds
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agent_bridge={},tower_http={}", log_level, log_level).into());
    let subscriber = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            http_port,
            socket_port,
            idle_timeout,
        } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = http_port {
                config.server.http_port = port;
            }
            if let Some(port) = socket_port {
                config.server.socket_port = port;
            }
            if let Some(secs) = idle_timeout {
                config.session.idle_timeout_secs = secs;
            }
            config.validate()?;
            run_serve(config).await?;
        }
        Commands::Doctor => {
            run_doctor(&config);
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_serve(config: BridgeConfig) -> Result<()> {
    tracing::info!("Starting Agent Bridge");

    let gateway = GatewayBuilder::new().config(config).build();
    gateway.start().await?;

    tracing::info!("Agent Bridge is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;

    Ok(())
}

fn run_doctor(config: &BridgeConfig) {
    println!("Agent Bridge Doctor");
    println!();

    println!("Checking agent binary...");
    match ClaudeCommand::new(config.launcher.clone()).binary() {
        Ok(path) if path.exists() => println!("  ✓ Found {}", path.display()),
        Ok(path) => println!("  ✗ Configured binary does not exist: {}", path.display()),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking configuration...");
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration is valid"),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking ports...");
    for (name, port) in [
        ("HTTP", config.server.http_port),
        ("agent socket", config.server.socket_port),
    ] {
        match std::net::TcpListener::bind((config.server.host.as_str(), port)) {
            Ok(_) => println!("  ✓ {} port {} is free", name, port),
            Err(e) => println!("  ✗ {} port {} unavailable: {}", name, port, e),
        }
    }

    println!();
    println!("Doctor check complete!");
}

fn show_config(config: Option<&BridgeConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
