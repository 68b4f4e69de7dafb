//! Error types for the agent control plane.
//!
//! Transport and command failures are recovered locally by callers (logged),
//! while [`SessionError`] covers the failures that make a session unusable.

use std::time::Duration;

use thiserror::Error;

/// Failures of the duplex RPC transport and the HTTP side channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A request was issued before the duplex handshake completed.
    #[error("transport not ready: duplex connection to the agent is not established")]
    NotReady,

    /// The agent could not be reached at all (nothing listening, bind race lost).
    #[error("agent unreachable at {endpoint}: {reason}")]
    AgentUnreachable { endpoint: String, reason: String },

    /// The connection went away while the call was pending.
    #[error("transport closed before a response arrived")]
    Closed,

    /// No correlated response arrived within the request timeout.
    #[error("request to {route} timed out after {after:?}")]
    Timeout { route: String, after: Duration },

    /// A request id collided with one that is still pending.
    #[error("request id {0} is already pending")]
    DuplicateRequestId(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("side channel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid header value for {name}")]
    InvalidHeader { name: &'static str },
}

impl TransportError {
    /// Whether this error means nothing was listening on the agent endpoint.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::AgentUnreachable { .. } => true,
            Self::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

/// Failures while launching or stopping the agent process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent {exec}: {source}")]
    Spawn {
        exec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent did not report readiness within {0:?}")]
    ReadyTimeout(Duration),

    #[error("agent exited before reporting readiness")]
    ExitedBeforeReady,

    #[error("agent {0} pipe was not captured")]
    MissingPipe(&'static str),

    /// Launch arguments can only change before the process is spawned.
    #[error("cannot set {0}: agent process already started")]
    ArgvFrozen(&'static str),

    #[error("failed to wait for agent exit: {0}")]
    Wait(#[source] std::io::Error),

    /// The supervisor is single-use; a finished agent is not respawned.
    #[error("agent process already terminated")]
    Terminated,
}

impl SupervisorError {
    /// Whether the agent never became reachable (spawn failure, no readiness).
    pub const fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::ReadyTimeout(_) | Self::ExitedBeforeReady
        )
    }
}

/// Session-level failures. These are the only errors surfaced to the user.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to reserve a local port for the agent: {0}")]
    Endpoint(#[source] std::io::Error),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
