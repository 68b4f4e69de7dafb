//! One playback session, start to finish.
//!
//! [`PlaybackSession`] owns every control-plane component for a single run:
//! the supervised agent, the duplex transport, the projector task and the
//! observable store. Launch order matters: the agent must be ready before the
//! transport connects, and the projector subscribes before the connection
//! opens so no early event is missed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::catalog::Catalog;
use crate::commands::CommandFacade;
use crate::config::Config;
use crate::endpoint;
use crate::error::SessionError;
use crate::projector::StateProjector;
use crate::session::{AgentSession, SessionContext};
use crate::state::{PlaybackBehaviour, PlaybackStore};
use crate::supervisor::{ProcessSupervisor, ShutdownOutcome, SupervisorState};
use crate::traffic::TrafficRecorder;
use crate::transport::{HttpSideChannel, Transport, WsTransport};

/// Tokens forwarded to the agent on its command line.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub developer_token: Option<String>,
    pub user_token: Option<String>,
}

pub struct PlaybackSession {
    session: AgentSession,
    supervisor: ProcessSupervisor,
    transport: Arc<WsTransport>,
    store: Arc<PlaybackStore>,
    commands: CommandFacade,
    projector: JoinHandle<()>,
}

impl PlaybackSession {
    /// Spawn the agent, connect to it and start projecting its events.
    ///
    /// Any failure here is fatal to the session; a half-started agent is
    /// shut down before the error is returned.
    #[instrument(skip_all, fields(exec = %config.agent.exec.display()))]
    pub async fn launch(
        config: &Config,
        credentials: Credentials,
        catalog: Option<Arc<dyn Catalog>>,
    ) -> Result<Self, SessionError> {
        let port = endpoint::allocate().map_err(SessionError::Endpoint)?;
        let session = SessionContext::new(config.agent.user_agent.as_str())
            .create(port, &config.agent_config_arg());

        let side_channel = HttpSideChannel::new(session.clone())?;
        let supervisor = ProcessSupervisor::new(&config.agent, session.clone(), side_channel);
        if let Some(token) = credentials.developer_token {
            supervisor.set_developer_token(token).await?;
        }
        if let Some(token) = credentials.user_token {
            supervisor.set_user_token(token).await?;
        }
        supervisor.start().await?;

        let transport = Arc::new(
            WsTransport::new(&session, TrafficRecorder::default())
                .with_request_timeout(config.agent.request_timeout()),
        );
        let events = transport.subscribe();
        if let Err(e) = transport.connect().await {
            warn!(error = %e, "Could not connect to agent, stopping it");
            if let Err(stop) = supervisor.shutdown().await {
                warn!(error = %stop, "Failed to stop agent");
            }
            return Err(e.into());
        }
        supervisor.mark_running();

        let store = Arc::new(PlaybackStore::new(PlaybackBehaviour::from_defaults(
            &config.playback,
        )));
        let projector = StateProjector::new(
            Arc::clone(&store),
            catalog,
            config.projector.time_throttle(),
        );
        let projector = tokio::spawn(projector.run(events));

        let commands = CommandFacade::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&store),
        );
        commands.push_behaviour().await;

        info!(port, "Playback session running");
        Ok(Self {
            session,
            supervisor,
            transport,
            store,
            commands,
            projector,
        })
    }

    pub const fn commands(&self) -> &CommandFacade {
        &self.commands
    }

    pub const fn store(&self) -> &Arc<PlaybackStore> {
        &self.store
    }

    /// Raw frames exchanged with the agent.
    pub fn traffic(&self) -> &TrafficRecorder {
        self.transport.traffic()
    }

    pub const fn session(&self) -> &AgentSession {
        &self.session
    }

    pub fn agent_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_ready()
    }

    /// Close the transport (failing anything in flight) and stop the agent.
    pub async fn shutdown(self) -> Result<ShutdownOutcome, SessionError> {
        self.transport.close().await;
        self.projector.abort();
        let outcome = self.supervisor.shutdown().await?;
        info!(?outcome, "Playback session ended");
        Ok(outcome)
    }
}
