use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use clap::Parser;
use crest::{
    Config, ConnectAction, EventHandler, LockFile, Request, Server, ServerHandle, SessionHandle,
};
use tokio::runtime;
use tracing_subscriber::EnvFilter;

/// How often the lockfile heartbeat is refreshed.
const LOCK_SIGNAL_INTERVAL: Duration = Duration::from_secs(10);

/// Standalone WebSocket server daemon.
///
/// Loads a JSON configuration file, refuses to start while another live
/// instance holds the lockfile, and serves an echo endpoint with a couple
/// of demo commands (`/uptime`, `/online`).
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "crest.json")]
    config: PathBuf,
}

/// Demo application: echoes messages and answers slash commands.
///
/// The server handle is filled in after the server is constructed; events
/// cannot arrive before that happens.
struct DemoHandler {
    server: Arc<OnceLock<ServerHandle>>,
}

impl EventHandler for DemoHandler {
    fn on_client_connect(&self, session: &SessionHandle, request: &Request) -> ConnectAction {
        tracing::info!(
            id = session.id(),
            ip = session.ip(),
            path = request.path(),
            "client connected"
        );
        ConnectAction::Accept
    }

    fn on_client_disconnect(&self, session: &SessionHandle) {
        tracing::info!(id = session.id(), "client disconnected");
    }

    fn on_data_receive(&self, session: &SessionHandle, payload: Bytes) -> bool {
        match payload.as_ref() {
            b"/uptime" => {
                let uptime = self
                    .server
                    .get()
                    .and_then(ServerHandle::uptime)
                    .unwrap_or_default();
                session.send_text(format!("uptime: {}s", uptime.as_secs()));
            }
            b"/online" => {
                let online = self.server.get().map(ServerHandle::online).unwrap_or_default();
                session.send_text(format!("online: {online}"));
            }
            _ => session.send_text(payload),
        }
        true
    }
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let lock = LockFile::new(&config.lock_path);
    if lock.is_locked() {
        eyre::bail!(
            "another instance is running (lockfile {})",
            lock.path().display()
        );
    }
    lock.lock()?;

    // The whole server runs on one scheduling thread.
    let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
    let result = runtime.block_on(run(config, lock.clone()));
    lock.release();
    result
}

async fn run(config: Config, lock: LockFile) -> eyre::Result<()> {
    let slot: Arc<OnceLock<ServerHandle>> = Arc::new(OnceLock::new());
    let mut server = Server::new(config, DemoHandler { server: slot.clone() });
    let _ = slot.set(server.handle());

    server.timer(LOCK_SIGNAL_INTERVAL, move || {
        if let Err(error) = lock.signal() {
            tracing::warn!(%error, "lockfile heartbeat failed");
        }
    });

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            handle.stop();
        }
    });

    server.run().await?;
    Ok(())
}
