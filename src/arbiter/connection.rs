//! Per-connection task — framed I/O, handshake, command forwarding.
//!
//! Each peer connection spawns a tokio task that:
//! 1. Wraps the socket in a length-prefixed MessagePack codec.
//! 2. Reads the first message (must be `Hello`) and forwards it to
//!    the daemon loop for handshake validation.
//! 3. Enters a select loop: forward requests to the daemon loop,
//!    deliver pushes (candidate queries, chooser content, terminal
//!    callbacks) the loop routes to this peer.
//! 4. On disconnect, notifies the daemon loop for cleanup.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Status};

use super::registry::ConnectionId;

/// Command sent from a connection task to the daemon loop.
#[derive(Debug)]
pub struct ArbiterCommand {
    pub request: Message,
    pub response_tx: oneshot::Sender<Message>,
    pub connection_id: ConnectionId,
}

/// Notification sent when a connection closes.
#[derive(Debug)]
pub struct DisconnectNotice {
    pub connection_id: ConnectionId,
}

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be Hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("daemon loop closed")]
    ArbiterGone,
    #[error("response channel closed")]
    ResponseDropped,
}

/// Spawn a connection handler task.
///
/// The task runs until the peer disconnects or a protocol error
/// occurs. On exit, a [`DisconnectNotice`] is sent to the daemon loop.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ArbiterCommand>,
    push_rx: mpsc::UnboundedReceiver<Message>,
    disconnect_tx: mpsc::UnboundedSender<DisconnectNotice>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, conn_id, cmd_tx, push_rx).await {
            tracing::debug!(?conn_id, error = %e, "connection closed");
        }
        // Always notify the daemon of disconnect for cleanup.
        let _ = disconnect_tx.send(DisconnectNotice {
            connection_id: conn_id,
        });
    });
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<ArbiterCommand>,
    mut push_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)?
        .map_err(ConnectionError::Codec)?;

    let first_msg = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Hello { .. }) => msg,
        DecodeResult::Ok(_non_hello) => {
            // Valid message but not Hello; the peer violated the protocol,
            // close immediately.
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::UnknownType(_envelope) => {
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::Malformed(e) => {
            return Err(ConnectionError::MalformedFrame(e));
        }
    };

    let response = send_command(&cmd_tx, first_msg, conn_id).await?;
    let is_error = is_error_hello_ack(&response);
    framed
        .send(response)
        .await
        .map_err(ConnectionError::Codec)?;

    if is_error {
        // Version mismatch or other handshake failure.
        return Ok(());
    }

    // -- Main loop: requests + push delivery --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()), // Clean disconnect.
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg) => {
                        let response = send_command(&cmd_tx, msg, conn_id).await?;
                        framed.send(response).await.map_err(ConnectionError::Codec)?;
                    }
                    DecodeResult::UnknownType(envelope) => {
                        // Unknown message type: error with echoed id,
                        // connection stays open.
                        let response = Message::Response {
                            id: envelope.id,
                            status: Status::Error,
                            error: Some("unknown_type".into()),
                            request: None,
                            providers: None,
                        };
                        framed.send(response).await.map_err(ConnectionError::Codec)?;
                    }
                    DecodeResult::Malformed(e) => {
                        // Completely unrecoverable, cannot extract an id.
                        return Err(ConnectionError::MalformedFrame(e));
                    }
                }
            }
            push = push_rx.recv() => {
                match push {
                    Some(msg) => {
                        framed.send(msg).await.map_err(ConnectionError::Codec)?;
                    }
                    None => {
                        // The daemon loop dropped our push sender; shutting down.
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Send a command to the daemon loop and wait for the response.
async fn send_command(
    cmd_tx: &mpsc::UnboundedSender<ArbiterCommand>,
    request: Message,
    conn_id: ConnectionId,
) -> Result<Message, ConnectionError> {
    let (response_tx, response_rx) = oneshot::channel();
    cmd_tx
        .send(ArbiterCommand {
            request,
            response_tx,
            connection_id: conn_id,
        })
        .map_err(|_| ConnectionError::ArbiterGone)?;
    response_rx
        .await
        .map_err(|_| ConnectionError::ResponseDropped)
}

fn is_error_hello_ack(msg: &Message) -> bool {
    matches!(
        msg,
        Message::HelloAck {
            status: Status::Error,
            ..
        }
    )
}
