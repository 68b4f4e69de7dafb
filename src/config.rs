//! Host configuration.
//!
//! Read from a JSON file (`--config`) or from the `PLAYBACK_AGENT_CONFIG`
//! environment variable. Every field has a default, so an empty object is a
//! valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::state::AudioQuality;

/// Environment variable holding the whole configuration as JSON.
pub const CONFIG_ENV: &str = "PLAYBACK_AGENT_CONFIG";

/// Environment variable overriding `agent.exec`.
pub const EXEC_ENV: &str = "PLAYBACK_AGENT_EXEC";

/// Fixed `User-Agent` presented to the agent on every request.
pub const DEFAULT_USER_AGENT: &str = concat!("playback-agent-host/", env!("CARGO_PKG_VERSION"));

/// Top-level configuration for the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to launch and talk to the agent process.
    pub agent: AgentSettings,

    /// Initial playback behaviour pushed to the agent after connect.
    pub playback: PlaybackDefaults,

    /// Event projection tuning.
    pub projector: ProjectorSettings,

    /// Opaque JSON forwarded to the agent as `--config`.
    pub agent_config: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentSettings::default(),
            playback: PlaybackDefaults::default(),
            projector: ProjectorSettings::default(),
            agent_config: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Agent process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Path to the agent executable (or a launcher for it).
    pub exec: PathBuf,

    /// Arguments placed before the negotiated agent arguments.
    pub args: Vec<String>,

    /// `User-Agent` header value; the agent rejects anything else.
    pub user_agent: String,

    /// How long to wait for the readiness sentinel.
    pub ready_timeout_seconds: u64,

    /// How long a graceful shutdown may take before the agent is killed.
    pub shutdown_grace_seconds: u64,

    /// Per-request timeout. `null` waits forever.
    pub request_timeout_seconds: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("playback-agent"),
            args: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ready_timeout_seconds: 30,
            shutdown_grace_seconds: 5,
            request_timeout_seconds: Some(10),
        }
    }
}

impl AgentSettings {
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_seconds.map(Duration::from_secs)
    }
}

/// Playback behaviour the host starts with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackDefaults {
    pub audio_quality: AudioQuality,
    pub autoplay: bool,
    pub volume: f64,
}

impl Default for PlaybackDefaults {
    fn default() -> Self {
        Self {
            audio_quality: AudioQuality::High,
            autoplay: true,
            volume: 1.0,
        }
    }
}

/// State projection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectorSettings {
    /// Minimum spacing between applied `playbackTimeDidChange` events.
    pub time_throttle_ms: u64,
}

impl Default for ProjectorSettings {
    fn default() -> Self {
        Self {
            time_throttle_ms: 100,
        }
    }
}

impl ProjectorSettings {
    pub const fn time_throttle(&self) -> Duration {
        Duration::from_millis(self.time_throttle_ms)
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit file > `PLAYBACK_AGENT_CONFIG` > defaults.
    /// `PLAYBACK_AGENT_EXEC` overrides the exec path in every case.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(json) => Self::from_json(&json)
                    .with_context(|| format!("Failed to parse {CONFIG_ENV}"))?,
                Err(_) => {
                    debug!("No configuration supplied, using defaults");
                    Self::default()
                }
            },
        };

        if let Ok(exec) = std::env::var(EXEC_ENV) {
            info!(exec = %exec, "Agent exec overridden from environment");
            config.agent.exec = PathBuf::from(exec);
        }

        Ok(config)
    }

    /// Read configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// The `--config` argument handed to the agent.
    pub fn agent_config_arg(&self) -> String {
        self.agent_config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert_eq!(config.agent.exec, PathBuf::from("playback-agent"));
        assert!(config.agent.args.is_empty());
        assert_eq!(config.agent.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.agent.ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.agent.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.agent.request_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.playback.audio_quality, AudioQuality::High);
        assert!(config.playback.autoplay);
        assert_eq!(config.projector.time_throttle(), Duration::from_millis(100));
        assert_eq!(config.agent_config_arg(), "{}");
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "agent": {
                "exec": "/opt/agent/bin/playback-agent",
                "args": ["--verbose"],
                "user_agent": "Custom UA",
                "ready_timeout_seconds": 12,
                "shutdown_grace_seconds": 2,
                "request_timeout_seconds": 3
            },
            "playback": {
                "audio_quality": "standard",
                "autoplay": false,
                "volume": 0.4
            },
            "projector": { "time_throttle_ms": 250 },
            "agent_config": { "storefront": "gb" }
        }"#;

        let config = Config::from_json(json).unwrap();

        assert_eq!(config.agent.exec, PathBuf::from("/opt/agent/bin/playback-agent"));
        assert_eq!(config.agent.args, vec!["--verbose"]);
        assert_eq!(config.agent.user_agent, "Custom UA");
        assert_eq!(config.agent.ready_timeout(), Duration::from_secs(12));
        assert_eq!(config.agent.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.agent.request_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.playback.audio_quality, AudioQuality::Standard);
        assert!(!config.playback.autoplay);
        assert!((config.playback.volume - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.projector.time_throttle_ms, 250);
        assert_eq!(config.agent_config_arg(), r#"{"storefront":"gb"}"#);
    }

    #[test]
    fn null_request_timeout_disables_it() {
        let config = Config::from_json(r#"{"agent": {"request_timeout_seconds": null}}"#).unwrap();
        assert!(config.agent.request_timeout().is_none());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, r#"{"agent": {"ready_timeout_seconds": 7}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.agent.ready_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::from_file(Path::new("/nonexistent/host.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Config::from_json("{not json").is_err());
    }
}
