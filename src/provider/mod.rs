//! File-backed demo credential provider.
//!
//! Registers one service with the arbiter and answers candidate queries
//! from a JSON store: get queries release matching stored credentials as
//! entries, create queries offer a single save entry, clear empties the
//! store. Entry payloads carry the data the selector echoes back when the
//! user picks the entry, standing in for the provider-side flow a real
//! provider would run behind each entry.

mod store;

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::MessageCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};
use crate::session::entries::{CandidateBundle, CreateBundle, CredentialEntryData, SaveEntryData};
use crate::session::types::{CredentialQuery, RequestId, ServiceId};

use store::Store;

/// Provider error type.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("arbiter: {0}")]
    Arbiter(String),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the provider until the arbiter connection closes.
pub async fn run(
    service: String,
    capabilities: Vec<String>,
    store_path: PathBuf,
) -> Result<(), ProviderError> {
    // Load eagerly so a bad store fails at startup, not mid-request.
    let mut state = store::load(&store_path)?;
    let service = ServiceId::new(service);

    let socket_path = resolve_socket_path()?;
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| ProviderError::Arbiter(format!("connect failed: {e}")))?;
    let mut framed = Framed::new(stream, MessageCodec::new());

    handshake(&mut framed).await?;

    let mut next_id: u32 = 1;
    send_expect_ok(
        &mut framed,
        Message::RegisterProvider {
            id: take_id(&mut next_id),
            service: service.clone(),
            capabilities: capabilities.clone(),
        },
    )
    .await?;
    tracing::info!(%service, ?capabilities, "provider registered");

    // Serve candidate queries until the arbiter goes away.
    while let Some(frame) = framed.next().await {
        let message = frame.map_err(|e| ProviderError::Arbiter(format!("connection error: {e}")))?;
        match message {
            Message::BeginGet {
                request, options, ..
            } => {
                let bundle = candidates_for(&state, &options);
                tracing::debug!(%request, entries = bundle.credentials.len(), "answering get query");
                answer(
                    &mut framed,
                    take_id(&mut next_id),
                    &request,
                    &service,
                    QueryAnswer::Get(bundle),
                )
                .await?;
            }
            Message::BeginCreate {
                request,
                credential_type,
                ..
            } => {
                let bundle = save_offer(&state, &service, &credential_type);
                tracing::debug!(%request, %credential_type, "answering create query");
                answer(
                    &mut framed,
                    take_id(&mut next_id),
                    &request,
                    &service,
                    QueryAnswer::Create(bundle),
                )
                .await?;
            }
            Message::BeginClear { request, .. } => {
                let cleared = !state.credentials.is_empty();
                if cleared {
                    state.credentials.clear();
                    store::save(&store_path, &state)?;
                }
                tracing::info!(%request, cleared, "answering clear query");
                answer(
                    &mut framed,
                    take_id(&mut next_id),
                    &request,
                    &service,
                    QueryAnswer::Clear(cleared),
                )
                .await?;
            }
            Message::RequestEnded { request, .. } => {
                tracing::debug!(%request, "request ended");
            }
            // Acks for our own query results.
            Message::Response { .. } => {}
            other => {
                tracing::warn!(?other, "unexpected message from arbiter");
            }
        }
    }

    tracing::info!("arbiter connection closed");
    Ok(())
}

/// Stored credentials matching any of the requested types, as entries.
fn candidates_for(state: &Store, options: &[CredentialQuery]) -> CandidateBundle {
    let credentials = state
        .credentials
        .iter()
        .filter(|stored| {
            options
                .iter()
                .any(|option| option.credential_type == stored.credential_type)
        })
        .map(|stored| CredentialEntryData {
            credential_type: stored.credential_type.clone(),
            display_name: stored.display_name.clone(),
            payload: stored.secret.clone().into_bytes(),
        })
        .collect();
    CandidateBundle {
        credentials,
        ..Default::default()
    }
}

/// The single save entry offered for a create query.
fn save_offer(state: &Store, service: &ServiceId, credential_type: &str) -> CreateBundle {
    let target = state
        .save_target
        .clone()
        .unwrap_or_else(|| service.as_str().to_string());
    CreateBundle {
        save_entries: vec![SaveEntryData {
            display_name: format!("Save {credential_type} to {target}"),
            payload: Vec::new(),
        }],
        remote: None,
    }
}

enum QueryAnswer {
    Get(CandidateBundle),
    Create(CreateBundle),
    Clear(bool),
}

async fn answer(
    framed: &mut Framed<UnixStream, MessageCodec>,
    id: u32,
    request: &RequestId,
    service: &ServiceId,
    result: QueryAnswer,
) -> Result<(), ProviderError> {
    let (get_entries, create_entries, cleared) = match result {
        QueryAnswer::Get(bundle) => (Some(bundle), None, None),
        QueryAnswer::Create(bundle) => (None, Some(bundle), None),
        QueryAnswer::Clear(cleared) => (None, None, Some(cleared)),
    };
    framed
        .send(Message::QueryResult {
            id,
            request: request.clone(),
            service: service.clone(),
            get_entries,
            create_entries,
            cleared,
            error: None,
        })
        .await
        .map_err(|e| ProviderError::Arbiter(format!("send query_result: {e}")))
}

async fn handshake(framed: &mut Framed<UnixStream, MessageCodec>) -> Result<(), ProviderError> {
    framed
        .send(Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role: Role::Provider,
        })
        .await
        .map_err(|e| ProviderError::Arbiter(format!("send hello: {e}")))?;
    match framed.next().await {
        Some(Ok(Message::HelloAck {
            status: Status::Ok, ..
        })) => Ok(()),
        Some(Ok(Message::HelloAck { error, .. })) => Err(ProviderError::Arbiter(format!(
            "handshake rejected: {}",
            error.unwrap_or_default()
        ))),
        other => Err(ProviderError::Arbiter(format!(
            "unexpected handshake response: {other:?}"
        ))),
    }
}

async fn send_expect_ok(
    framed: &mut Framed<UnixStream, MessageCodec>,
    message: Message,
) -> Result<(), ProviderError> {
    framed
        .send(message)
        .await
        .map_err(|e| ProviderError::Arbiter(format!("send failed: {e}")))?;
    match framed.next().await {
        Some(Ok(Message::Response {
            status: Status::Ok, ..
        })) => Ok(()),
        Some(Ok(Message::Response { error, .. })) => Err(ProviderError::Arbiter(format!(
            "rejected: {}",
            error.unwrap_or_default()
        ))),
        other => Err(ProviderError::Arbiter(format!(
            "unexpected response: {other:?}"
        ))),
    }
}

fn take_id(next_id: &mut u32) -> u32 {
    let id = *next_id;
    *next_id += 1;
    id
}

/// Resolve the arbiter socket path from `$XDG_RUNTIME_DIR`.
fn resolve_socket_path() -> Result<PathBuf, ProviderError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| ProviderError::Arbiter("$XDG_RUNTIME_DIR not set".into()))?;
    Ok(PathBuf::from(runtime_dir)
        .join("credentiald")
        .join("arbiterd.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::StoredCredential;

    fn sample_store() -> Store {
        Store {
            credentials: vec![
                StoredCredential {
                    credential_type: "passkey".into(),
                    display_name: "home".into(),
                    secret: "pk-secret".into(),
                },
                StoredCredential {
                    credential_type: "password".into(),
                    display_name: "mail".into(),
                    secret: "hunter2".into(),
                },
            ],
            save_target: Some("Work vault".into()),
        }
    }

    fn query(credential_type: &str) -> CredentialQuery {
        CredentialQuery {
            credential_type: credential_type.into(),
            query_data: vec![],
        }
    }

    #[test]
    fn candidates_filter_by_requested_type() {
        let bundle = candidates_for(&sample_store(), &[query("passkey")]);
        assert_eq!(bundle.credentials.len(), 1);
        assert_eq!(bundle.credentials[0].display_name, "home");
        assert_eq!(bundle.credentials[0].payload, b"pk-secret");
    }

    #[test]
    fn candidates_cover_multiple_requested_types() {
        let bundle = candidates_for(&sample_store(), &[query("passkey"), query("password")]);
        assert_eq!(bundle.credentials.len(), 2);
    }

    #[test]
    fn unmatched_type_yields_empty_bundle() {
        let bundle = candidates_for(&sample_store(), &[query("otp")]);
        assert!(bundle.is_empty());
    }

    #[test]
    fn save_offer_names_the_target() {
        let bundle = save_offer(
            &sample_store(),
            &ServiceId::new("com.example.vault"),
            "passkey",
        );
        assert_eq!(bundle.save_entries.len(), 1);
        assert_eq!(
            bundle.save_entries[0].display_name,
            "Save passkey to Work vault"
        );
    }

    #[test]
    fn save_offer_falls_back_to_service_name() {
        let store = Store::default();
        let bundle = save_offer(&store, &ServiceId::new("com.example.vault"), "password");
        assert_eq!(
            bundle.save_entries[0].display_name,
            "Save password to com.example.vault"
        );
    }
}
