//! playback-agent-host
//!
//! Launches the playback agent, connects to it and drives it from a command
//! console on stdin. Logs go to stderr so stdout stays readable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use playback_agent_host::config::Config;
use playback_agent_host::console;
use playback_agent_host::host::{Credentials, PlaybackSession};

#[derive(Parser, Debug)]
#[command(name = "playback-agent-host")]
#[command(about = "Supervise a playback agent and control it over its WebSocket protocol")]
struct Args {
    /// JSON configuration file (falls back to PLAYBACK_AGENT_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent executable, overriding the configuration
    #[arg(long)]
    agent_exec: Option<PathBuf>,

    /// Developer token passed to the agent as --am-token
    #[arg(long, env = "PLAYBACK_AGENT_DEVELOPER_TOKEN", hide_env_values = true)]
    am_token: Option<String>,

    /// User token passed to the agent as --am-user-token
    #[arg(long, env = "PLAYBACK_AGENT_USER_TOKEN", hide_env_values = true)]
    am_user_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr, so stdout stays free for the console)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration; --agent-exec wins over file and env
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(exec) = args.agent_exec {
        config.agent.exec = exec;
    }
    info!(exec = %config.agent.exec.display(), "Loaded configuration");

    // Launch the agent and connect to it
    let credentials = Credentials {
        developer_token: args.am_token,
        user_token: args.am_user_token,
    };
    let session = PlaybackSession::launch(&config, credentials, None)
        .await
        .context("Failed to start playback agent")?;

    // Drive the session from stdin until quit or ctrl-c
    println!("{}", console::help());
    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(&session, stdin) => {
            if let Err(e) = result {
                warn!(error = %e, "Console input failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // Stop the agent
    let outcome = session
        .shutdown()
        .await
        .context("Failed to stop playback agent")?;
    info!(?outcome, "Agent stopped");
    Ok(())
}
