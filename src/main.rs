// src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod server;
mod sys;

use crate::config::Configuration;
use crate::server::AgentServer;
use crate::sys::engine::Engine;
use crate::sys::remote::SshExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==========================================================================
    // 1. Configuration & Environment
    // ==========================================================================

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Configuration::load()?);
    let socket_path = config.socket_path.clone();

    // ==========================================================================
    // 2. Secure Socket Initialization
    // ==========================================================================

    if let Some(socket_dir) = socket_path.parent() {
        if !socket_dir.exists() {
            fs::create_dir_all(socket_dir)?;
        }
    }

    // Clean up an existing socket file left by a previous crash/run.
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;

    // 0o660 (rw-rw----) lets the root owner and the panel's group connect
    // while denying every other user on the system. The peer-UID check in
    // the server narrows it further.
    let mut perms = fs::metadata(&socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(&socket_path, perms)?;

    // ==========================================================================
    // 3. Dependency Injection & Service Start
    // ==========================================================================

    let executor = Arc::new(SshExecutor::new(config.clone())?);
    let engine = Arc::new(Engine::new(&config, executor)?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining");
            signal_token.cancel();
        }
    });

    let server = Arc::new(AgentServer::new(config, engine, shutdown));

    tracing::info!(socket = %socket_path.display(), "steward-agent listening");
    server.serve(listener).await?;

    Ok(())
}
