//! Transport layer for host ↔ agent communication.
//!
//! Provides the `Transport` trait and the callback pool that correlates
//! responses with the requests that are waiting for them.
//! `WsTransport` is the duplex channel; `HttpSideChannel` carries lifecycle
//! calls that must work even when the duplex channel is wedged.

pub mod http;
pub mod protocol;
pub mod websocket;

pub use http::HttpSideChannel;
pub use protocol::{
    AgentEvent, Body, Envelope, EnvelopeError, EventEnvelope, InboundMessage, MediaParams,
    PlaybackStatus, RequestEnvelope, ResponseEnvelope,
};
pub use websocket::WsTransport;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::error::TransportError;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<ResponseEnvelope, TransportError>;

type Completion = oneshot::Sender<CallResult>;

/// Abstraction over the request/response channel to the agent.
///
/// Implementations handle connection details; the command facade works with
/// this uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its correlated response.
    ///
    /// Fails immediately with [`TransportError::NotReady`] if the channel is
    /// not connected yet. Concurrent callers do not serialize.
    async fn request(&self, route: &str, body: Body) -> CallResult;

    /// Whether requests can currently be sent.
    fn is_ready(&self) -> bool;

    /// Close the channel. Pending calls fail with [`TransportError::Closed`].
    async fn close(&self);
}

/// Pending calls keyed by request id.
///
/// A single mutex covers registration, lookup and removal, so a call is
/// completed exactly once: by its response, or by teardown, never both.
/// After teardown the pool refuses new calls until it is reopened.
#[derive(Debug)]
pub struct CallbackPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    calls: HashMap<String, Completion>,
    open: bool,
}

impl Default for CallbackPool {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                calls: HashMap::new(),
                open: true,
            }),
        }
    }
}

impl CallbackPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return the receiver its caller awaits.
    pub async fn register(
        &self,
        request_id: &str,
    ) -> Result<oneshot::Receiver<CallResult>, TransportError> {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Err(TransportError::Closed);
        }
        if inner.calls.contains_key(request_id) {
            return Err(TransportError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    pub async fn is_pending(&self, request_id: &str) -> bool {
        self.inner.lock().await.calls.contains_key(request_id)
    }

    /// Remove and return the completion for `request_id`, if pending.
    async fn take(&self, request_id: &str) -> Option<Completion> {
        self.inner.lock().await.calls.remove(request_id)
    }

    /// Complete the call for `request_id` with `response`.
    ///
    /// Returns `false` if no such call is pending.
    pub async fn resolve(&self, request_id: &str, response: ResponseEnvelope) -> bool {
        match self.take(request_id).await {
            Some(tx) => {
                // The caller may have stopped waiting; the call is still consumed.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop a call without completing it (timeout, send failure).
    pub async fn forget(&self, request_id: &str) -> bool {
        self.take(request_id).await.is_some()
    }

    /// Close the pool and fail every pending call with [`TransportError::Closed`].
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut inner = self.inner.lock().await;
            inner.open = false;
            inner.calls.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(TransportError::Closed));
        }
        count
    }

    /// Accept new calls again after a reconnect.
    pub async fn reopen(&self) {
        self.inner.lock().await.open = true;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
