//! Agent module: process supervision and the NDJSON session bridge
//!
//! One agent process per session. Each process is launched with the URL of
//! the transport endpoint and dials back to it; frames then flow both ways
//! as NDJSON over that connection.
//!
//! ## Architecture
//!
//! ```text
//! HTTP caller ──▶ registry.get_or_create ──▶ launcher ──spawn──▶ agent process
//!                        │                                          │
//!                        │ start_turn (user frame)                  │ --sdk-url
//!                        ▼                                          ▼
//!                  outbound queue ──flush──▶ transport ◀── ws /ws/cli/:id
//!                                                │
//!                                                ▼
//!                 assembler ◀── session events ◀── router (bridge)
//! ```
//!
//! - `types`: frame model and frame builders
//! - `launcher`: agent process start/stop
//! - `registry`: session records and the lifecycle state machine
//! - `bridge`: inbound frame routing and permission answers
//! - `transport`: the socket endpoint agents connect to
//! - `reaper`: idle session cleanup
//! - `assembler`: aggregate and streaming responses for one turn

pub mod assembler;
pub mod bridge;
pub mod launcher;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod transport;
pub mod types;

pub use assembler::{collect_turn, stream_turn, AssembledResponse, StreamEvent, StreamTranslator};
pub use bridge::{AutoApprove, MessageRouter, PermissionDecision, PermissionPolicy};
pub use launcher::{ClaudeCommand, LaunchCommand, LaunchSpec, ProcessSupervisor};
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;
pub use types::{LaunchOptions, PermissionMode, SessionEvent, SessionInfo, SessionState};
