//! Arbiter connection for the CLI client.
//!
//! Connects to the arbiter daemon as `Role::Client`, performs the
//! handshake, and provides one method per request flow. Request
//! submission is two-step on the wire: the daemon acknowledges with the
//! assigned request id, then pushes `request_complete` once the session
//! has arbitrated a final answer.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::MessageCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};
use crate::session::types::{
    Credential, CredentialQuery, CreationReceipt, ProviderDescriptor, RequestId,
};

use super::ClientError;

/// Arbiter client for one-shot CLI commands.
pub struct ArbiterClient {
    framed: Framed<UnixStream, MessageCodec>,
    next_id: u32,
}

impl ArbiterClient {
    /// Connect to the arbiter and perform the handshake.
    pub async fn connect() -> Result<Self, ClientError> {
        let socket_path = resolve_socket_path()?;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| ClientError::Arbiter(format!("connect failed: {e}")))?;
        let mut framed = Framed::new(stream, MessageCodec::new());

        // Handshake: Hello → HelloAck.
        framed
            .send(Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
                role: Role::Client,
            })
            .await
            .map_err(|e| ClientError::Arbiter(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
                ..
            })) => {
                return Err(ClientError::Arbiter(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Arbiter(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self {
            framed,
            next_id: 1, // 0 = Hello
        })
    }

    /// List registered providers.
    pub async fn list_providers(&mut self) -> Result<Vec<ProviderDescriptor>, ClientError> {
        let id = self.take_id();
        self.framed
            .send(Message::ListProviders { id })
            .await
            .map_err(|e| ClientError::Arbiter(format!("send list_providers: {e}")))?;

        match self.framed.next().await {
            Some(Ok(Message::Response {
                status: Status::Ok,
                providers,
                ..
            })) => Ok(providers.unwrap_or_default()),
            Some(Ok(Message::Response { error, .. })) => Err(ClientError::Arbiter(format!(
                "list_providers failed: {}",
                error.unwrap_or_default()
            ))),
            other => Err(ClientError::Arbiter(format!(
                "unexpected list_providers response: {other:?}"
            ))),
        }
    }

    /// Submit a get request and wait for its terminal callback.
    pub async fn get(
        &mut self,
        caller: String,
        options: Vec<CredentialQuery>,
    ) -> Result<Credential, ClientError> {
        let id = self.take_id();
        let request = self
            .submit(Message::GetCredentials {
                id,
                caller,
                options,
            })
            .await?;
        match self.await_completion(&request).await? {
            Completion {
                credential: Some(credential),
                ..
            } => Ok(credential),
            _ => Err(ClientError::Arbiter(
                "request completed without a credential".into(),
            )),
        }
    }

    /// Submit a create request and wait for its terminal callback.
    pub async fn create(
        &mut self,
        caller: String,
        credential_type: String,
        data: Vec<u8>,
    ) -> Result<CreationReceipt, ClientError> {
        let id = self.take_id();
        let request = self
            .submit(Message::CreateCredential {
                id,
                caller,
                credential_type,
                data,
            })
            .await?;
        match self.await_completion(&request).await? {
            Completion {
                receipt: Some(receipt),
                ..
            } => Ok(receipt),
            // A bare success is a valid create outcome when the provider
            // did not attach a receipt.
            _ => Ok(CreationReceipt { data: Vec::new() }),
        }
    }

    /// Submit a clear request and wait for its terminal callback.
    pub async fn clear(&mut self, caller: String) -> Result<(), ClientError> {
        let id = self.take_id();
        let request = self.submit(Message::ClearCredentials { id, caller }).await?;
        self.await_completion(&request).await?;
        Ok(())
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request message and return the assigned request id.
    async fn submit(&mut self, message: Message) -> Result<RequestId, ClientError> {
        self.framed
            .send(message)
            .await
            .map_err(|e| ClientError::Arbiter(format!("send request: {e}")))?;

        match self.framed.next().await {
            Some(Ok(Message::Response {
                status: Status::Ok,
                request: Some(request),
                ..
            })) => Ok(request),
            Some(Ok(Message::Response { error, .. })) => Err(ClientError::Arbiter(format!(
                "request rejected: {}",
                error.unwrap_or_default()
            ))),
            other => Err(ClientError::Arbiter(format!(
                "unexpected submit response: {other:?}"
            ))),
        }
    }

    /// Read pushes until the terminal callback for `request` arrives.
    async fn await_completion(&mut self, request: &RequestId) -> Result<Completion, ClientError> {
        loop {
            match self.framed.next().await {
                Some(Ok(Message::RequestComplete {
                    request: completed,
                    status,
                    error_type,
                    error_message,
                    credential,
                    receipt,
                    ..
                })) if completed == *request => {
                    return match status {
                        Status::Ok => Ok(Completion { credential, receipt }),
                        Status::Error => Err(ClientError::Request {
                            kind: error_type.unwrap_or_else(|| "unknown".into()),
                            message: error_message.unwrap_or_default(),
                        }),
                    };
                }
                // Callbacks for other requests on a shared connection.
                Some(Ok(Message::RequestComplete { .. })) => continue,
                Some(Ok(other)) => {
                    return Err(ClientError::Arbiter(format!(
                        "unexpected message while waiting for completion: {other:?}"
                    )));
                }
                Some(Err(e)) => {
                    return Err(ClientError::Arbiter(format!("connection error: {e}")));
                }
                None => {
                    return Err(ClientError::Arbiter(
                        "arbiter closed the connection before completing the request".into(),
                    ));
                }
            }
        }
    }
}

/// Terminal payload of a successful request.
struct Completion {
    credential: Option<Credential>,
    receipt: Option<CreationReceipt>,
}

/// Resolve the arbiter socket path from `$XDG_RUNTIME_DIR`.
fn resolve_socket_path() -> Result<PathBuf, ClientError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| ClientError::Arbiter("$XDG_RUNTIME_DIR not set".into()))?;
    Ok(PathBuf::from(runtime_dir)
        .join("credentiald")
        .join("arbiterd.sock"))
}
