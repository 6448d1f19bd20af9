//! Agent Bridge - request/response API in front of long-running agent processes
//!
//! Agent Bridge runs one Claude Code CLI process per conversation session and
//! talks to it over a persistent NDJSON channel. Callers see a plain
//! Messages-style HTTP API (aggregate JSON or SSE streaming); the session id
//! they get back continues the same process on the next call without
//! resending history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Agent Bridge Gateway                      │
//! │                                                              │
//! │  HTTP API (:8080)                 Agent transport (:8765)     │
//! │  POST /v1/messages                ws /ws/cli/:session-id      │
//! │        │                                   ▲                  │
//! │        ▼                                   │ NDJSON           │
//! │  ┌──────────────┐   launch   ┌─────────────┴──────────────┐  │
//! │  │   Session    │──────────▶│  agent process per session   │  │
//! │  │   Registry   │◀──────────│  (claude --sdk-url ...)      │  │
//! │  └──────┬───────┘   exit     └────────────────────────────┘  │
//! │         │ session events                                      │
//! │         ▼                                                     │
//! │  Response Assembler ──▶ JSON / SSE                            │
//! │                                                              │
//! │  Idle Reaper: kills idle sessions, drops exited ones          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: process supervision, session registry, frame routing,
//!   transport endpoint, reaper and response assembly
//! - [`gateway`]: listeners, HTTP API and lifecycle
//! - [`config`]: configuration management

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;

pub use config::BridgeConfig;
pub use error::{Error, Result};
