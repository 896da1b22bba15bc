//! Arbiter daemon — credential request arbitration.
//!
//! The arbiter is the central coordinator. It listens on a Unix domain
//! socket and mediates between three peer roles: clients issuing
//! get/create/clear requests, credential providers answering candidate
//! queries, and the selector presenting the chooser.
//!
//! Architecture: channel-based actor. A single daemon loop owns all
//! mutable state ([`handler::DaemonState`]). Per-connection tasks forward
//! requests via mpsc channels; per-request session actors route their
//! provider calls and chooser presentations back through the loop as
//! [`router::RouterCommand`]s, so the loop stays the single owner of
//! connection state.

mod connection;
mod handler;
pub mod registry;
pub mod router;

use std::path::PathBuf;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use connection::{ArbiterCommand, DisconnectNotice};
use handler::DaemonState;
use registry::ConnectionId;

use crate::session::driver::SessionEnded;
use crate::session::types::ServiceId;
use router::RouterCommand;

/// Daemon configuration.
#[derive(Debug, Default)]
pub struct ArbiterConfig {
    /// The one service allowed to offer remote (hybrid) entries.
    pub hybrid_service: Option<ServiceId>,
}

/// Daemon startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error("arbiter already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the arbiter daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `ArbiterError` if `$XDG_RUNTIME_DIR` is unset, socket bind
/// fails, or another arbiter is already running.
pub async fn run(config: ArbiterConfig) -> Result<(), ArbiterError> {
    let socket_path = resolve_socket_path()?;
    let listener = bind_socket(&socket_path).await?;

    tracing::info!(path = %socket_path.display(), "arbiter listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        result = serve(listener, config) => result?,
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    // Cleanup: remove socket file.
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!("arbiter stopped");
    Ok(())
}

/// Accept connections and service every channel until the listener fails.
///
/// All state is in-memory only; registrations and in-flight sessions are
/// lost on exit. Split from [`run`] so tests can serve a temp socket
/// without signal handling.
async fn serve(listener: UnixListener, config: ArbiterConfig) -> Result<(), ArbiterError> {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ArbiterCommand>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DisconnectNotice>();
    let (router_tx, mut router_rx) = mpsc::unbounded_channel::<RouterCommand>();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<SessionEnded>();

    let mut state = DaemonState::new(router_tx, ended_tx, config.hybrid_service);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        accept_connection(stream, &cmd_tx, &disconnect_tx, &mut state);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Request from a connection task --
            Some(cmd) = cmd_rx.recv() => {
                let response = handler::handle_message(
                    &mut state,
                    cmd.request,
                    cmd.connection_id,
                );
                let _ = cmd.response_tx.send(response);
            }

            // -- Routing work from a session actor --
            Some(command) = router_rx.recv() => {
                handler::handle_router_command(&mut state, command);
            }

            // -- Session actor delivered its terminal callback --
            Some(ended) = ended_rx.recv() => {
                handler::handle_session_ended(&mut state, ended);
            }

            // -- Connection disconnected --
            Some(notice) = disconnect_rx.recv() => {
                handler::handle_disconnect(&mut state, notice.connection_id);
            }
        }
    }
}

/// Accept a new connection — register its push channel and spawn the
/// handler task.
fn accept_connection(
    stream: UnixStream,
    cmd_tx: &mpsc::UnboundedSender<ArbiterCommand>,
    disconnect_tx: &mpsc::UnboundedSender<DisconnectNotice>,
    state: &mut DaemonState,
) {
    let conn_id = ConnectionId::new();
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    state.track_connection(conn_id, push_tx);

    connection::spawn_connection(stream, conn_id, cmd_tx.clone(), push_rx, disconnect_tx.clone());

    tracing::debug!(?conn_id, "accepted connection");
}

// -- Socket setup --

/// Resolve the arbiter socket path from `$XDG_RUNTIME_DIR`.
pub fn resolve_socket_path() -> Result<PathBuf, ArbiterError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| ArbiterError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("credentiald")
        .join("arbiterd.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another arbiter
/// is running. If it fails, the socket is stale and is removed.
async fn bind_socket(path: &std::path::Path) -> Result<UnixListener, ArbiterError> {
    // Ensure parent directory exists with mode 0700. Permissions are set
    // even when the directory already existed.
    let parent = path.parent().expect("socket path has parent");
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| ArbiterError::MkdirFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            ArbiterError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            }
        })?;
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            // Check if the existing socket is live.
            match UnixStream::connect(path).await {
                Ok(_) => Err(ArbiterError::AlreadyRunning(path.to_path_buf())),
                Err(_) => {
                    tracing::info!(path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path).map_err(|e| ArbiterError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                    UnixListener::bind(path).map_err(|e| ArbiterError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        Err(e) => Err(ArbiterError::BindFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
