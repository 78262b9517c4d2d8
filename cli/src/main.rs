//! Kiln CLI - build server entry point.
//!
//! ```text
//! main() -> KilnConfig::load() -> ServerSettings -> BspServer::serve()
//!                                                       |
//!                                   ctrl-c ──cancel──▶ shutdown token
//! ```
//!
//! Logs go to `~/.kiln/logs/kiln.log` (or `./.kiln/logs/kiln.log`), falling
//! back to stderr when neither can be opened.

mod session;

use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln_bsp::{AcceptMode, BspServer, ClientRegistry, Endpoint, ServerSettings, SharedState};
use kiln_config::{AcceptChoice, KilnConfig, TransportChoice};

use session::{BuildState, SessionHandler};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_kiln_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_kiln_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in kiln_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn kiln_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.kiln/logs/kiln.log
    if let Some(home) = kiln_config::kiln_home() {
        candidates.push(home.join("logs").join("kiln.log"));
    }

    candidates.push(PathBuf::from(".kiln").join("logs").join("kiln.log"));

    candidates
}

fn server_settings(config: &KilnConfig) -> ServerSettings {
    let endpoint = match config.transport() {
        TransportChoice::Tcp {
            host,
            port,
            backlog,
        } => Endpoint::Tcp {
            host,
            port,
            backlog,
        },
        TransportChoice::Unix { path } => Endpoint::Unix { path },
    };
    let accept = match config.accept() {
        AcceptChoice::Loop => AcceptMode::Loop,
        AcceptChoice::Single => AcceptMode::Single,
    };
    ServerSettings {
        endpoint,
        workers: config.workers(),
        reaper_delay: config.reaper_delay(),
        clients_dir: config.clients_dir(),
        accept,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = KilnConfig::load().unwrap_or_default();
    let settings = server_settings(&config);
    tracing::debug!(?settings, "Resolved server settings");

    fs::create_dir_all(&settings.clients_dir).with_context(|| {
        format!(
            "creating clients directory {}",
            settings.clients_dir.display()
        )
    })?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received; shutting down");
                ctrl_c.cancel();
            }
            Err(e) => tracing::warn!("Cannot listen for ctrl-c: {e}"),
        }
    });

    let server = BspServer::new(
        settings,
        Arc::new(ClientRegistry::new()),
        SharedState::new(BuildState::default()),
    );
    let state = server
        .serve(SessionHandler::new, None, shutdown)
        .await
        .context("build server failed to start")?;

    tracing::info!(sessions = state.sessions, "Build server exited");
    Ok(())
}
