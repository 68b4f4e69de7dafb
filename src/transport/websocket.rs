//! Duplex WebSocket transport to the agent.
//!
//! One connection per session, shared by every caller. A writer task drains
//! an mpsc queue into the socket and a reader task classifies inbound frames:
//! frames whose `requestId` is pending complete that call, everything else is
//! decoded as an event and broadcast to subscribers in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::protocol::{
    AgentEvent, Body, Envelope, EnvelopeError, InboundMessage, RequestEnvelope,
};
use super::{CallResult, CallbackPool, Transport};
use crate::error::TransportError;
use crate::session::AgentSession;
use crate::traffic::{Direction, TrafficKind, TrafficRecorder};

/// Events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Correlating request/response channel over a single WebSocket.
pub struct WsTransport {
    url: String,
    headers: Vec<(&'static str, String)>,
    default_body: Body,
    request_timeout: Option<Duration>,
    pool: Arc<CallbackPool>,
    ready: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<AgentEvent>,
    traffic: TrafficRecorder,
}

impl WsTransport {
    /// Create an unconnected transport for `session`.
    pub fn new(session: &AgentSession, traffic: TrafficRecorder) -> Self {
        Self {
            url: session.ws_url(),
            headers: session
                .auth_headers()
                .iter()
                .map(|(name, value)| (*name, (*value).to_string()))
                .collect(),
            default_body: Body::new(),
            request_timeout: None,
            pool: Arc::new(CallbackPool::new()),
            ready: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
            events: broadcast::channel(EVENT_CAPACITY).0,
            traffic,
        }
    }

    /// Fields merged into every request body.
    #[must_use]
    pub fn with_default_body(mut self, body: Body) -> Self {
        self.default_body = body;
        self
    }

    /// Give up on a call after `timeout`. `None` waits indefinitely.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Receive every event the agent pushes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub const fn traffic(&self) -> &TrafficRecorder {
        &self.traffic
    }

    /// Number of calls still waiting for a response.
    pub async fn pending(&self) -> usize {
        self.pool.len().await
    }

    /// Open the duplex connection. Requests are accepted once this returns.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_ready() {
            debug!(url = %self.url, "Transport already connected");
            return Ok(());
        }

        let mut request = self.url.as_str().into_client_request()?;
        for &(name, ref value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader { name })?;
            let value =
                HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader { name })?;
            request.headers_mut().insert(header, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| self.classify_connect_error(e))?;

        let (sink, stream) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Failed to write to agent socket");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Ready before the reader runs, so a connection that dies at once is
        // torn down by the reader rather than marked ready afterwards.
        *self.outbound.lock().await = Some(tx);
        self.pool.reopen().await;
        self.ready.store(true, Ordering::Release);

        let inbound = Inbound {
            pool: Arc::clone(&self.pool),
            ready: Arc::clone(&self.ready),
            events: self.events.clone(),
            traffic: self.traffic.clone(),
        };
        let reader = tokio::spawn(inbound.run(stream));
        if let Some(previous) = self.reader.lock().await.replace(reader) {
            previous.abort();
        }

        info!(url = %self.url, "Connected to agent");
        Ok(())
    }

    fn classify_connect_error(&self, error: tungstenite::Error) -> TransportError {
        match error {
            tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                TransportError::AgentUnreachable {
                    endpoint: self.url.clone(),
                    reason: io.to_string(),
                }
            }
            other => TransportError::WebSocket(other),
        }
    }

    async fn await_response(
        &self,
        route: &str,
        request_id: &str,
        mut rx: tokio::sync::oneshot::Receiver<CallResult>,
    ) -> CallResult {
        let received = match self.request_timeout {
            Some(after) => match tokio::time::timeout(after, &mut rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    if self.pool.forget(request_id).await {
                        warn!(route, request_id, ?after, "Agent did not answer in time");
                        return Err(TransportError::Timeout {
                            route: route.to_string(),
                            after,
                        });
                    }
                    // Completed while the timer fired.
                    rx.try_recv().ok()
                }
            },
            None => rx.await.ok(),
        };
        received.unwrap_or(Err(TransportError::Closed))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, route: &str, body: Body) -> CallResult {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotReady)?;

        let request_id = Uuid::new_v4().to_string();
        let request = RequestEnvelope::new(route, request_id.clone(), &self.default_body, body);
        let text = request.to_json()?;

        let rx = self.pool.register(&request_id).await?;
        self.traffic
            .record_envelope(Direction::Send, &Envelope::Request(request), &text);

        if outbound.send(Message::Text(text.into())).is_err() {
            self.pool.forget(&request_id).await;
            return Err(TransportError::Closed);
        }
        trace!(route, request_id = %request_id, "Request sent");

        self.await_response(route, &request_id, rx).await
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.ready.store(false, Ordering::Release);

        if let Some(tx) = self.outbound.lock().await.take() {
            // Dropping the sender afterwards lets the writer flush and exit.
            let _ = tx.send(Message::Close(None));
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }

        let failed = self.pool.fail_all().await;
        if failed > 0 {
            warn!(failed, "Failed pending agent calls on close");
        }
        debug!(url = %self.url, "Transport closed");
    }
}

/// State shared with the reader task.
struct Inbound {
    pool: Arc<CallbackPool>,
    ready: Arc<AtomicBool>,
    events: broadcast::Sender<AgentEvent>,
    traffic: TrafficRecorder,
}

impl Inbound {
    async fn run(self, mut stream: futures_util::stream::SplitStream<WsStream>) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_frame(text.as_str()).await {
                        warn!(error = %e, "Dropping inbound frame from agent");
                    }
                }
                Ok(Message::Close(reason)) => {
                    debug!(?reason, "Agent closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Agent connection failed");
                    break;
                }
            }
        }

        self.ready.store(false, Ordering::Release);
        let failed = self.pool.fail_all().await;
        info!(failed, "Agent connection ended");
    }

    /// Classify, record and dispatch one text frame.
    async fn handle_frame(&self, text: &str) -> Result<Envelope, EnvelopeError> {
        let envelope = match self.classify(text).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.traffic
                    .record(Direction::Receive, TrafficKind::Malformed, None, text);
                return Err(e);
            }
        };
        self.traffic
            .record_envelope(Direction::Receive, &envelope, text);

        match &envelope {
            Envelope::Response(response) => {
                if !self.pool.resolve(&response.request_id, response.clone()).await {
                    debug!(request_id = %response.request_id, "Response arrived after its caller gave up");
                }
            }
            Envelope::Event(event) => {
                if let AgentEvent::Unknown { name } = &event.event {
                    debug!(event = %name, "Ignoring unrecognised agent event");
                }
                // No subscribers is fine.
                let _ = self.events.send(event.event.clone());
            }
            Envelope::Request(_) => {}
        }
        Ok(envelope)
    }

    /// A frame is a response if its `requestId` is pending, otherwise an event.
    async fn classify(&self, text: &str) -> Result<Envelope, EnvelopeError> {
        let message = InboundMessage::parse(text)?;
        if let Some(request_id) = message.request_id.clone() {
            if self.pool.is_pending(&request_id).await {
                return Ok(Envelope::Response(message.into_response(request_id)));
            }
        }
        Ok(Envelope::Event(message.into_event()?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::future::Future;

    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    use super::*;
    use crate::session::{SessionContext, SESSION_HEADER, USER_AGENT_HEADER};
    use crate::transport::PlaybackStatus;

    type ServerWs = WebSocketStream<TcpStream>;

    #[derive(Debug)]
    struct Handshake {
        path: String,
        session_id: Option<String>,
        user_agent: Option<String>,
    }

    /// Accept one connection and hand it to `handler`.
    async fn fake_agent<F, Fut>(handler: F) -> (u16, oneshot::Receiver<Handshake>)
    where
        F: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hs_tx, hs_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                move |req: &Request, resp: Response| {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let _ = hs_tx.send(Handshake {
                        path: req.uri().path().to_string(),
                        session_id: header(SESSION_HEADER),
                        user_agent: header(USER_AGENT_HEADER),
                    });
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            handler(ws).await;
        });

        (port, hs_rx)
    }

    async fn next_request(ws: &mut ServerWs) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut ServerWs, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    fn transport_for(port: u16) -> (WsTransport, AgentSession) {
        let session = SessionContext::new("test-agent-ua").create(port, "{}");
        (WsTransport::new(&session, TrafficRecorder::default()), session)
    }

    #[tokio::test]
    async fn request_before_connect_is_not_ready() {
        let (transport, _) = transport_for(1);

        let err = transport.request("/play", Body::new()).await.unwrap_err();

        assert!(matches!(err, TransportError::NotReady));
        assert!(!transport.is_ready());
        assert!(transport.traffic().is_empty());
        assert_eq!(transport.pending().await, 0);
    }

    #[tokio::test]
    async fn connect_presents_session_headers() {
        let (port, handshake) = fake_agent(|mut ws| async move {
            let _ = ws.next().await;
        })
        .await;
        let (transport, session) = transport_for(port);

        transport.connect().await.unwrap();
        assert!(transport.is_ready());

        let hs = handshake.await.unwrap();
        assert_eq!(hs.path, "/ws");
        assert_eq!(hs.session_id.as_deref(), Some(session.session_id()));
        assert_eq!(hs.user_agent.as_deref(), Some("test-agent-ua"));
    }

    #[tokio::test]
    async fn connect_refused_is_unreachable() {
        let port = crate::endpoint::allocate().unwrap();
        let (transport, _) = transport_for(port);

        let err = transport.connect().await.unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {err}");
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn request_roundtrip_clears_pool() {
        let (port, _) = fake_agent(|mut ws| async move {
            let req = next_request(&mut ws).await;
            assert_eq!(req["route"], "/open-airplay-picker");
            assert_eq!(req["x"], 10);
            send_json(
                &mut ws,
                json!({"requestId": req["requestId"], "supportsAirPlay": true}),
            )
            .await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        let mut body = Body::new();
        body.insert("x".into(), json!(10));
        let resp = transport.request("/open-airplay-picker", body).await.unwrap();

        assert_eq!(resp.get_bool("supportsAirPlay"), Some(true));
        assert_eq!(transport.pending().await, 0);

        let records = transport.traffic().snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Send);
        assert_eq!(records[0].kind, TrafficKind::Request);
        assert_eq!(records[1].direction, Direction::Receive);
        assert_eq!(records[1].kind, TrafficKind::Response);
        assert_eq!(records[0].request_id, records[1].request_id);
    }

    #[tokio::test]
    async fn agent_dropping_right_after_handshake_leaves_transport_not_ready() {
        let (port, _) = fake_agent(|ws| async move {
            drop(ws);
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.request("/play", Body::new()),
        )
        .await
        .expect("call must not hang on a dead connection");
        assert!(
            matches!(result, Err(TransportError::Closed | TransportError::NotReady)),
            "unexpected result: {result:?}"
        );

        for _ in 0..100 {
            if !transport.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.is_ready());
        assert_eq!(transport.pending().await, 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_the_right_calls() {
        let (port, _) = fake_agent(|mut ws| async move {
            let a = next_request(&mut ws).await;
            let b = next_request(&mut ws).await;
            send_json(&mut ws, json!({"requestId": b["requestId"], "route": b["route"]})).await;
            send_json(&mut ws, json!({"requestId": a["requestId"], "route": a["route"]})).await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        let (a, b) = tokio::join!(
            transport.request("/pause", Body::new()),
            transport.request("/stop", Body::new()),
        );

        assert_eq!(a.unwrap().body["route"], "/pause");
        assert_eq!(b.unwrap().body["route"], "/stop");
        assert_eq!(transport.pending().await, 0);
    }

    #[tokio::test]
    async fn concurrent_request_ids_are_unique() {
        const N: usize = 50;
        let (port, _) = fake_agent(|mut ws| async move {
            for _ in 0..N {
                let req = next_request(&mut ws).await;
                send_json(&mut ws, json!({"requestId": req["requestId"]})).await;
            }
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        let calls = (0..N).map(|_| transport.request("/next", Body::new()));
        let results = futures_util::future::join_all(calls).await;
        assert!(results.iter().all(Result::is_ok));

        let ids: HashSet<_> = transport
            .traffic()
            .snapshot()
            .into_iter()
            .filter(|r| r.direction == Direction::Send)
            .filter_map(|r| r.request_id)
            .collect();
        assert_eq!(ids.len(), N);
    }

    #[tokio::test]
    async fn events_are_broadcast_in_order() {
        let (port, _) = fake_agent(|mut ws| async move {
            send_json(
                &mut ws,
                json!({"requestId": "push-1", "eventName": "playbackStateDidChange", "playbackState": "playing"}),
            )
            .await;
            send_json(
                &mut ws,
                json!({"eventName": "playbackDurationDidChange", "duration": 180}),
            )
            .await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            AgentEvent::PlaybackStateDidChange(PlaybackStatus::Playing)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            AgentEvent::PlaybackDurationDidChange { duration: 180.0 }
        );
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let (port, _) = fake_agent(|mut ws| async move {
            ws.send(Message::Text("definitely not json".into())).await.unwrap();
            send_json(&mut ws, json!({"requestId": "nobody-waits"})).await;
            let req = next_request(&mut ws).await;
            send_json(&mut ws, json!({"requestId": req["requestId"]})).await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        assert!(transport.request("/pause", Body::new()).await.is_ok());
        assert!(transport.is_ready());
    }

    #[tokio::test]
    async fn pending_calls_fail_when_agent_disconnects() {
        let (port, _) = fake_agent(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            ws.close(None).await.unwrap();
        })
        .await;
        let (transport, _) = transport_for(port);
        transport.connect().await.unwrap();

        let err = transport.request("/play", Body::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(!transport.is_ready());
        assert_eq!(transport.pending().await, 0);
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (port, _) = fake_agent(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        let transport = transport.with_request_timeout(Some(Duration::from_millis(100)));
        transport.connect().await.unwrap();

        let err = transport.request("/stop", Body::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref route, .. } if route == "/stop"));
        assert_eq!(transport.pending().await, 0);
    }

    #[tokio::test]
    async fn close_fails_in_flight_calls() {
        let (port, _) = fake_agent(|mut ws| async move {
            let _ = next_request(&mut ws).await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        let transport = Arc::new(transport);
        transport.connect().await.unwrap();

        let call = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("/play", Body::new()).await })
        };
        while transport.pending().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        transport.close().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(matches!(
            transport.request("/play", Body::new()).await,
            Err(TransportError::NotReady)
        ));
    }

    #[tokio::test]
    async fn default_body_is_merged() {
        let (port, _) = fake_agent(|mut ws| async move {
            let req = next_request(&mut ws).await;
            send_json(&mut ws, json!({"requestId": req["requestId"], "client": req["client"]})).await;
            let _ = ws.next().await;
        })
        .await;
        let (transport, _) = transport_for(port);
        let mut defaults = Body::new();
        defaults.insert("client".into(), json!("host"));
        let transport = transport.with_default_body(defaults);
        transport.connect().await.unwrap();

        let resp = transport.request("/play", Body::new()).await.unwrap();
        assert_eq!(resp.body["client"], "host");
    }

    #[tokio::test]
    async fn handle_frame_classifies_without_a_socket() {
        let pool = Arc::new(CallbackPool::new());
        let inbound = Inbound {
            pool: Arc::clone(&pool),
            ready: Arc::new(AtomicBool::new(true)),
            events: broadcast::channel(4).0,
            traffic: TrafficRecorder::default(),
        };
        let rx = pool.register("r1").await.unwrap();

        let response = inbound.handle_frame(r#"{"requestId":"r1"}"#).await.unwrap();
        assert!(matches!(response, Envelope::Response(_)));
        assert!(rx.await.unwrap().is_ok());

        // Same id again is no longer pending and carries no event name.
        assert!(matches!(
            inbound.handle_frame(r#"{"requestId":"r1"}"#).await,
            Err(EnvelopeError::Uncorrelated)
        ));

        let event = inbound
            .handle_frame(r#"{"requestId":"r2","eventName":"somethingNew"}"#)
            .await
            .unwrap();
        assert!(matches!(
            event,
            Envelope::Event(ref e) if e.event.name() == "somethingNew"
        ));

        let kinds: Vec<_> = inbound.traffic.snapshot().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [TrafficKind::Response, TrafficKind::Malformed, TrafficKind::Event]
        );
        assert!(pool.is_empty().await);
    }
}
