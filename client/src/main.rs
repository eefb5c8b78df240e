//! The headless client: loads a profile, brings the tunnel up, runs until
//! interrupted.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod carrier;
mod persistence;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tun::unix::FdTun;
use veilnet_model::{ConnectionState, Profile, StateCell};

#[derive(Parser)]
#[command(name = "veilnet-client", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Log directives, e.g. `info,veilnet_tunnel=debug`.
    #[arg(long, env = "VEILNET_LOG", default_value = "info")]
    log: String,
}

#[derive(clap::Subcommand)]
enum Cmd {
    /// Connect with the given profile and run until interrupted.
    Run {
        /// Path to a profile JSON file.
        #[arg(short, long)]
        profile: PathBuf,

        /// The TUN file descriptor handed over by the platform wrapper.
        #[arg(long, env = "VEILNET_TUN_FD")]
        tun_fd: i32,

        /// Where the last-connection record is kept.
        #[arg(long, env = "VEILNET_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
    /// Validate the profile and exit.
    Check {
        #[arg(short, long)]
        profile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    veilnet_logging::setup_global_subscriber(&cli.log)?;

    match cli.command {
        Cmd::Check { profile } => {
            let profile = load_profile(&profile)?;
            profile.validate().context("Profile is invalid")?;

            tracing::info!(id = %profile.id, transport = profile.transport.label(), "Profile OK");

            Ok(())
        }
        Cmd::Run {
            profile,
            tun_fd,
            state_dir,
        } => run(&profile, tun_fd, state_dir).await,
    }
}

async fn run(profile_path: &PathBuf, tun_fd: i32, state_dir: Option<PathBuf>) -> Result<()> {
    let profile = load_profile(profile_path)?;
    profile.validate().context("Profile is invalid")?;

    let state_dir = state_dir.unwrap_or_else(persistence::default_state_dir);

    if persistence::load_last_connection(&state_dir).as_deref() == Some(profile.id.as_str()) {
        tracing::debug!(id = %profile.id, "Resuming the last connected profile");
    }

    let (state, mut state_rx) = StateCell::new();

    // Echo every state transition at info level.
    tokio::spawn(async move {
        loop {
            let current = state_rx.borrow_and_update().clone();
            tracing::info!("Connection state: {current}");

            if state_rx.changed().await.is_err() {
                break;
            }
        }
    });

    let device = Arc::new(FdTun::from_raw_fd(tun_fd, "veilnet-tun"));

    let session = match session::Session::connect(profile.clone(), device, state.clone()).await {
        Ok(session) => session,
        Err(e) => {
            // The state cell already carries the one-line status.
            return Err(e.context("Failed to connect"));
        }
    };

    if let Err(e) = persistence::store_last_connection(&state_dir, &profile.id) {
        tracing::debug!("Could not persist the last connection: {e:#}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Interrupted, disconnecting");

    session.disconnect().await;

    // Leave the watch task a beat to print the final transition.
    tokio::task::yield_now().await;

    match state.get() {
        ConnectionState::Disconnected => Ok(()),
        other => anyhow::bail!("unexpected final state: {other}"),
    }
}

fn load_profile(path: &PathBuf) -> Result<Profile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
