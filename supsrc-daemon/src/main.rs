//! The `supsrc-daemon` binary: wires `supsrc-core`, `supsrc-config`, and
//! `supsrc-proto` together, owns the tokio runtime, the Unix-socket gRPC
//! listener, and tracing initialization.
//!
//! Bootstrap order: init logging, ensure the data directory, clear a stale
//! socket, write a PID file, bind a `UnixListener`, serve, clean up on exit.

mod orchestrator;
mod paths;
mod server;

use crate::orchestrator::Orchestrator;
use crate::server::SupsrcDaemonService;
use anyhow::Result;
use supsrc_proto::daemon::supsrc_daemon_server::SupsrcDaemonServer;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

/// Commands routed to the task that exclusively owns the `Orchestrator`
/// (reload and shutdown both mutate orchestrator-owned state).
enum OrchestratorCommand {
    Reload(supsrc_config::Config),
    Shutdown(oneshot::Sender<()>),
}

/// Minimal manual `--config-path <path>` parsing. A CLI flag-parsing front
/// end is out of scope (spec Non-goals); this is the one flag the daemon
/// itself needs to resolve its config per §6.
fn config_path_flag() -> Option<std::path::PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            return args.next().map(std::path::PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config-path=") {
            return Some(std::path::PathBuf::from(value));
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
    .with_env_filter(
        tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("supsrc_daemon=info".parse().unwrap()),
    )
    .init();

    paths::ensure_data_dir()?;

    let socket_path = paths::socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let pid_file = paths::pid_file();
    std::fs::write(&pid_file, std::process::id().to_string())?;

    let config_path = config_path_flag();
    let config = supsrc_config::load_or_default(config_path.as_deref())?;
    info!(repositories = config.repositories.len(), "configuration resolved");

    let orchestrator = Orchestrator::start(config).await?;
    let handles = orchestrator.handles();

    // The orchestrator is moved into its own task so the SIGHUP reload
    // listener below can drive it concurrently with the gRPC server without
    // fighting over ownership.
    let (orch_cmd_tx, mut orch_cmd_rx) = mpsc::unbounded_channel::<OrchestratorCommand>();
    let orchestrator_task = tokio::spawn(async move {
            let mut orchestrator = orchestrator;
            while let Some(cmd) = orch_cmd_rx.recv().await {
                match cmd {
                    OrchestratorCommand::Reload(new_config) => orchestrator.reload(new_config).await,
                    OrchestratorCommand::Shutdown(reply) => {
                        orchestrator.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
    });

    // `SIGHUP` is the conventional "reparse config" trigger for a Unix
    // daemon; a failed reparse retains the old snapshot and logs loudly
    // rather than tearing down any watcher.
    let reload_tx = orch_cmd_tx.clone();
    let reload_config_path = config_path.clone();
    tokio::spawn(async move {
            let Ok(mut sighup) = signal(SignalKind::hangup()) else {
                warn!("failed to install SIGHUP handler, hot reload disabled");
                return;
            };
            loop {
                sighup.recv().await;
                info!("SIGHUP received, reparsing configuration");
                match supsrc_config::load_or_default(reload_config_path.as_deref()) {
                    Ok(new_config) => {
                        if reload_tx.send(OrchestratorCommand::Reload(new_config)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "hot reload failed to parse configuration, retaining previous snapshot");
                    }
                }
            }
    });

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let service = SupsrcDaemonService::new(handles, shutdown_tx);

    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = ?socket_path, "listening");
    let incoming = UnixListenerStream::new(listener);

    Server::builder()
    .add_service(SupsrcDaemonServer::new(service))
    .serve_with_incoming_shutdown(incoming, async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
    })
    .await?;

    let (reply_tx, reply_rx) = oneshot::channel();
    if orch_cmd_tx.send(OrchestratorCommand::Shutdown(reply_tx)).is_ok() {
        let _ = reply_rx.await;
    }
    let _ = orchestrator_task.await;

    std::fs::remove_file(&socket_path).ok();
    std::fs::remove_file(&pid_file).ok();

    Ok(())
}
