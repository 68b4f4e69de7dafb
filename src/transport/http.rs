//! One-shot HTTP side channel to the agent.
//!
//! Lifecycle calls (currently only `shutdown`) go over plain HTTP on the same
//! port as the duplex channel, so they still work when the WebSocket is
//! wedged or was never opened. Requests carry the session headers.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::debug;

use crate::error::TransportError;
use crate::session::AgentSession;

/// Upper bound for a single side-channel call.
const SIDE_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpSideChannel {
    client: Client,
    session: AgentSession,
}

impl HttpSideChannel {
    pub fn new(session: AgentSession) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in session.auth_headers() {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader { name })?;
            let value =
                HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader { name })?;
            headers.insert(header, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(session.user_agent())
            .timeout(SIDE_CHANNEL_TIMEOUT)
            .build()?;

        Ok(Self { client, session })
    }

    /// `GET /<route>` and return the response body.
    ///
    /// Any HTTP status counts as delivered; the agent only needs the hit.
    pub async fn request(&self, route: &str) -> Result<String, TransportError> {
        let url = self.session.http_url(route);
        debug!(%url, "Side channel request");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::AgentUnreachable {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            } else {
                TransportError::Http(e)
            }
        })?;

        let status = response.status();
        let body = response.text().await?;
        debug!(%url, %status, "Side channel response");
        Ok(body)
    }
}
