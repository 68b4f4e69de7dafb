//! playback-agent-host library
//!
//! Control plane for an out-of-process playback agent:
//! - Endpoint and session negotiation for the agent process
//! - Process supervision with stdout readiness detection
//! - Correlating WebSocket RPC transport with an HTTP side channel
//! - Typed playback commands and event projection into observable state

pub mod catalog;
pub mod commands;
pub mod config;
pub mod console;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod projector;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod traffic;
pub mod transport;
