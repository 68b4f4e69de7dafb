//! Agent process lifecycle.
//!
//! The supervisor owns the child process and its output pipes. Stdout is
//! scanned line by line for the readiness sentinel and everything else is
//! forwarded to the log; readiness is delivered back over a oneshot so no
//! reader holds a reference to the supervisor.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::AgentSettings;
use crate::error::SupervisorError;
use crate::session::AgentSession;
use crate::transport::HttpSideChannel;

/// Stdout line the agent prints once its WebSocket server is listening.
pub const READY_SENTINEL: &str = "websocketcomm.ready";

/// Log target for lines the agent writes.
const AGENT_LOG_TARGET: &str = "playback_agent";

/// Lifecycle of one agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    /// Sentinel seen, duplex channel not yet connected.
    Ready,
    Running,
    ShuttingDown,
    Terminated,
}

/// How the agent went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own within the grace period.
    Graceful,
    /// Killed after the grace period ran out.
    Forced,
    /// There was no live process to stop.
    NotRunning,
}

#[derive(Debug, Default)]
struct Inner {
    child: Option<Child>,
    developer_token: Option<String>,
    user_token: Option<String>,
}

/// Spawns, watches and stops the agent.
#[derive(Debug)]
pub struct ProcessSupervisor {
    exec: PathBuf,
    launcher_args: Vec<String>,
    session: AgentSession,
    side_channel: HttpSideChannel,
    ready_timeout: Duration,
    shutdown_grace: Duration,
    inner: Mutex<Inner>,
    state: watch::Sender<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(
        settings: &AgentSettings,
        session: AgentSession,
        side_channel: HttpSideChannel,
    ) -> Self {
        Self {
            exec: settings.exec.clone(),
            launcher_args: settings.args.clone(),
            session,
            side_channel,
            ready_timeout: settings.ready_timeout(),
            shutdown_grace: settings.shutdown_grace(),
            inner: Mutex::new(Inner::default()),
            state: watch::channel(SupervisorState::NotStarted).0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Queue `--am-token` for the launch. Rejected once the agent is spawned.
    pub async fn set_developer_token(&self, token: impl Into<String>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        self.ensure_argv_open("developer token")?;
        inner.developer_token = Some(token.into());
        Ok(())
    }

    /// Queue `--am-user-token` for the launch. Rejected once the agent is spawned.
    pub async fn set_user_token(&self, token: impl Into<String>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        self.ensure_argv_open("user token")?;
        inner.user_token = Some(token.into());
        Ok(())
    }

    fn ensure_argv_open(&self, what: &'static str) -> Result<(), SupervisorError> {
        if self.state() == SupervisorState::NotStarted {
            Ok(())
        } else {
            Err(SupervisorError::ArgvFrozen(what))
        }
    }

    /// Spawn the agent and wait for the readiness sentinel.
    ///
    /// Only the first call spawns; later calls return once that launch has
    /// settled. A timed-out or crashed launch kills the child.
    #[instrument(skip(self), fields(exec = %self.exec.display(), port = self.session.port()))]
    pub async fn start(&self) -> Result<(), SupervisorError> {
        // Held until readiness resolves so concurrent callers wait for it.
        let mut inner = self.inner.lock().await;
        match self.state() {
            SupervisorState::NotStarted => {}
            SupervisorState::Terminated => return Err(SupervisorError::Terminated),
            state => {
                debug!(?state, "Agent already started");
                return Ok(());
            }
        }
        self.state.send_replace(SupervisorState::Starting);

        let mut cmd = Command::new(&self.exec);
        cmd.args(&self.launcher_args).args(self.session.process_args());
        if let Some(token) = &inner.developer_token {
            cmd.arg("--am-token").arg(token);
        }
        if let Some(token) = &inner.user_token {
            cmd.arg("--am-user-token").arg(token);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state.send_replace(SupervisorState::Terminated);
                return Err(SupervisorError::Spawn {
                    exec: self.exec.display().to_string(),
                    source,
                });
            }
        };
        info!(pid = child.id(), "Spawned agent");

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            (stdout, _) => {
                self.abort_launch(&mut child).await;
                let pipe = if stdout.is_none() { "stdout" } else { "stderr" };
                return Err(SupervisorError::MissingPipe(pipe));
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(scan_stdout(stdout, ready_tx));
        tokio::spawn(forward_stderr(stderr));

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(pid = child.id(), "Agent ready");
                inner.child = Some(child);
                self.state.send_replace(SupervisorState::Ready);
                Ok(())
            }
            Ok(Err(_)) => {
                warn!("Agent closed stdout before reporting readiness");
                self.abort_launch(&mut child).await;
                Err(SupervisorError::ExitedBeforeReady)
            }
            Err(_) => {
                warn!(timeout = ?self.ready_timeout, "Agent readiness timed out");
                self.abort_launch(&mut child).await;
                Err(SupervisorError::ReadyTimeout(self.ready_timeout))
            }
        }
    }

    async fn abort_launch(&self, child: &mut Child) {
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Agent already gone");
        }
        self.state.send_replace(SupervisorState::Terminated);
    }

    /// Record that the duplex channel is up. Returns `false` unless the agent
    /// was in the `Ready` state.
    pub fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Ready {
                *state = SupervisorState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Ask the agent to exit over the side channel, then kill it if it is
    /// still alive after the grace period.
    #[instrument(skip(self), fields(port = self.session.port()))]
    pub async fn shutdown(&self) -> Result<ShutdownOutcome, SupervisorError> {
        let mut inner = self.inner.lock().await;
        let Some(mut child) = inner.child.take() else {
            return Ok(ShutdownOutcome::NotRunning);
        };
        self.state.send_replace(SupervisorState::ShuttingDown);

        if let Err(e) = self.side_channel.request("shutdown").await {
            warn!(error = %e, "Shutdown request failed, waiting for exit anyway");
        }

        let outcome = match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "Agent exited");
                ShutdownOutcome::Graceful
            }
            Ok(Err(e)) => {
                self.state.send_replace(SupervisorState::Terminated);
                return Err(SupervisorError::Wait(e));
            }
            Err(_) => {
                warn!(grace = ?self.shutdown_grace, "Agent ignored shutdown, killing it");
                if let Err(e) = child.kill().await {
                    self.state.send_replace(SupervisorState::Terminated);
                    return Err(SupervisorError::Wait(e));
                }
                ShutdownOutcome::Forced
            }
        };

        self.state.send_replace(SupervisorState::Terminated);
        Ok(outcome)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.child.as_ref().and_then(Child::id)
    }

    /// Whether the spawned agent is still running.
    pub async fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner
            .child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }
}

/// Log agent stdout and fire `ready` on the sentinel line.
///
/// Reads until the pipe closes so the agent never blocks on a full pipe.
async fn scan_stdout(stdout: impl AsyncRead + Unpin, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match read_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if line == READY_SENTINEL {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                info!(target: AGENT_LOG_TARGET, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read agent stdout");
                break;
            }
        }
    }
    debug!("Agent stdout closed");
}

async fn forward_stderr(stderr: impl AsyncRead + Unpin) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    while let Ok(Some(line)) = read_lossy_line(&mut reader, &mut buf).await {
        warn!(target: AGENT_LOG_TARGET, "{line}");
    }
}

/// Next line with invalid UTF-8 replaced and surrounding whitespace trimmed.
/// `None` at end of stream.
async fn read_lossy_line(
    reader: &mut (impl AsyncBufRead + Unpin),
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).trim().to_string()))
}
