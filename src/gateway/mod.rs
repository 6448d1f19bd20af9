//! Gateway server for Agent Bridge
//!
//! Owns the two listeners (HTTP API and agent transport) and the background
//! reaper for one bridge instance.

mod handler;
mod server;

pub use handler::{api_router, ApiState, API_KEY_HEADER, SESSION_HEADER};
pub use server::{Gateway, GatewayBuilder, GatewayState, GatewayStatus};
