//! Agent session identity.
//!
//! A session is minted once per run, before the agent starts. Its token and
//! user agent are handed to the agent on the command line and presented back
//! as headers on every WebSocket and HTTP request; the agent rejects traffic
//! that does not carry both.

use uuid::Uuid;

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "Agent-Session-ID";

/// Header carrying the fixed user agent.
pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Loopback host the agent binds to.
pub const AGENT_HOST: &str = "127.0.0.1";

/// Immutable identity of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSession {
    port: u16,
    session_id: String,
    user_agent: String,
    process_args: Vec<String>,
}

impl AgentSession {
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Negotiated launch arguments, in order.
    pub fn process_args(&self) -> &[String] {
        &self.process_args
    }

    /// The header pair the agent authenticates against.
    pub fn auth_headers(&self) -> [(&'static str, &str); 2] {
        [
            (SESSION_HEADER, self.session_id.as_str()),
            (USER_AGENT_HEADER, self.user_agent.as_str()),
        ]
    }

    /// Duplex endpoint, `ws://127.0.0.1:<port>/ws`.
    pub fn ws_url(&self) -> String {
        format!("ws://{AGENT_HOST}:{}/ws", self.port)
    }

    /// Side channel endpoint for a lifecycle route such as `shutdown`.
    pub fn http_url(&self, route: &str) -> String {
        format!(
            "http://{AGENT_HOST}:{}/{}",
            self.port,
            route.trim_start_matches('/')
        )
    }
}

/// Mints [`AgentSession`]s.
#[derive(Debug, Clone)]
pub struct SessionContext {
    user_agent: String,
}

impl SessionContext {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    /// Create a session bound to `port` with a fresh random token.
    ///
    /// `agent_config` is the JSON passed through as `--config`.
    pub fn create(&self, port: u16, agent_config: &str) -> AgentSession {
        let session_id = Uuid::new_v4().to_string();
        let process_args = vec![
            "--agent-port".to_string(),
            port.to_string(),
            "--agent-session-id".to_string(),
            session_id.clone(),
            "--config".to_string(),
            agent_config.to_string(),
        ];

        AgentSession {
            port,
            session_id,
            user_agent: self.user_agent.clone(),
            process_args,
        }
    }
}
