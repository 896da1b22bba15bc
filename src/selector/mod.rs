//! Chooser client — the system selector surface.
//!
//! Receives aggregated per-provider entry data from the arbiter, lets the
//! user pick an entry (or picks automatically with `--auto`), and reports
//! the selection back with the provider-flow result attached. For the
//! demo roles that result is the entry payload echoed back: a credential
//! for get entries, a receipt for save entries, an empty refresh for
//! authentication entries.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::MessageCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};
use crate::session::entries::{
    AuthenticationStatus, CandidateBundle, ChooserEntry, EntryClass, ProviderUiData,
};
use crate::session::types::{Credential, CreationReceipt, RequestId, ServiceId};

/// Selector error type.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("arbiter: {0}")]
    Arbiter(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which flow an entry belongs to; decides the shape of the echoed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Get,
    Create,
}

/// One selectable row, flattened out of the per-provider chooser data.
#[derive(Debug, Clone)]
struct FlatEntry {
    service: ServiceId,
    flow: Flow,
    entry: ChooserEntry,
}

/// The chooser currently on display.
struct PendingChooser {
    request: RequestId,
    entries: Vec<FlatEntry>,
}

/// Run the selector until the arbiter connection closes.
pub async fn run(auto: bool) -> Result<(), SelectorError> {
    let socket_path = resolve_socket_path()?;
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| SelectorError::Arbiter(format!("connect failed: {e}")))?;
    let mut framed = Framed::new(stream, MessageCodec::new());

    handshake(&mut framed).await?;
    tracing::info!(auto, "selector connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<PendingChooser> = None;
    let mut next_id: u32 = 1;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else {
                    tracing::info!("arbiter connection closed");
                    return Ok(());
                };
                let message = frame
                    .map_err(|e| SelectorError::Arbiter(format!("connection error: {e}")))?;
                match message {
                    Message::PresentChooser { request, providers, .. } => {
                        let entries = flatten(providers);
                        if auto {
                            let reply = match auto_choice(&entries) {
                                Some(index) => {
                                    let chosen = &entries[index];
                                    tracing::info!(
                                        %request,
                                        entry = %chosen.entry.display_name,
                                        "auto-selecting entry"
                                    );
                                    selection_message(next_id, &request, chosen)
                                }
                                None => {
                                    tracing::info!(%request, "nothing selectable, dismissing");
                                    Message::ChooserClosed {
                                        id: next_id,
                                        request: request.clone(),
                                        by_user: true,
                                    }
                                }
                            };
                            next_id += 1;
                            framed.send(reply).await.map_err(|e| {
                                SelectorError::Arbiter(format!("send selection: {e}"))
                            })?;
                        } else {
                            print_chooser(&request, &entries);
                            pending = Some(PendingChooser { request, entries });
                        }
                    }
                    Message::DismissChooser { request, .. } => {
                        if pending.as_ref().is_some_and(|p| p.request == request) {
                            println!("[chooser for {request} closed]");
                            pending = None;
                        }
                    }
                    // Acks for our own selections.
                    Message::Response { .. } => {}
                    other => {
                        tracing::warn!(?other, "unexpected message from arbiter");
                    }
                }
            }

            line = lines.next_line(), if pending.is_some() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed");
                    return Ok(());
                };
                let chooser = pending.take().expect("guarded by pending.is_some()");
                let reply = match parse_choice(&line, chooser.entries.len()) {
                    Choice::Entry(index) => {
                        selection_message(next_id, &chooser.request, &chooser.entries[index])
                    }
                    Choice::Cancel => Message::ChooserClosed {
                        id: next_id,
                        request: chooser.request.clone(),
                        by_user: true,
                    },
                    Choice::Invalid => {
                        println!("enter an entry number or 'c' to cancel");
                        pending = Some(chooser);
                        continue;
                    }
                };
                next_id += 1;
                framed
                    .send(reply)
                    .await
                    .map_err(|e| SelectorError::Arbiter(format!("send selection: {e}")))?;
            }
        }
    }
}

/// Flatten per-provider chooser data into one selectable list.
fn flatten(providers: Vec<ProviderUiData>) -> Vec<FlatEntry> {
    let mut flat = Vec::new();
    for provider in providers {
        match provider {
            ProviderUiData::Get(ui) => {
                let service = ui.service;
                let rows = ui
                    .credentials
                    .into_iter()
                    .chain(ui.actions)
                    .chain(ui.auth_actions)
                    .chain(ui.remote);
                flat.extend(rows.map(|entry| FlatEntry {
                    service: service.clone(),
                    flow: Flow::Get,
                    entry,
                }));
            }
            ProviderUiData::Create(ui) => {
                let service = ui.service;
                let rows = ui.save_entries.into_iter().chain(ui.remote);
                flat.extend(rows.map(|entry| FlatEntry {
                    service: service.clone(),
                    flow: Flow::Create,
                    entry,
                }));
            }
        }
    }
    flat
}

/// Pick the entry `--auto` mode selects.
///
/// Preference order: a concrete credential, then a save entry, then the
/// remote hand-off. Authentication and action entries are never picked
/// automatically; they re-enter the chooser and would loop.
fn auto_choice(entries: &[FlatEntry]) -> Option<usize> {
    for class in [EntryClass::Credential, EntryClass::Save, EntryClass::Remote] {
        if let Some(index) = entries.iter().position(|flat| flat.entry.class == class) {
            return Some(index);
        }
    }
    None
}

/// Build the selection report for one entry, echoing its payload as the
/// provider-flow result.
fn selection_message(id: u32, request: &RequestId, chosen: &FlatEntry) -> Message {
    let mut credential = None;
    let mut candidates = None;
    let mut receipt = None;
    match (chosen.flow, chosen.entry.class) {
        (Flow::Get, EntryClass::Credential)
        | (Flow::Get, EntryClass::Action)
        | (Flow::Get, EntryClass::Remote) => {
            credential = Some(Credential {
                credential_type: chosen
                    .entry
                    .credential_type
                    .clone()
                    .unwrap_or_else(|| "unknown".into()),
                data: chosen.entry.payload.clone(),
            });
        }
        (Flow::Get, EntryClass::Authentication) => {
            // The demo has nothing behind the lock; an unlock reveals an
            // empty candidate set.
            candidates = Some(CandidateBundle::default());
        }
        (Flow::Create, _) => {
            receipt = Some(CreationReceipt {
                data: chosen.entry.payload.clone(),
            });
        }
        (Flow::Get, EntryClass::Save) => {
            // Never produced by flatten() for a get chooser; report an
            // empty selection and let the session reject the class.
        }
    }
    Message::EntrySelected {
        id,
        request: request.clone(),
        service: chosen.service.clone(),
        entry_class: chosen.entry.class.as_str().into(),
        entry_key: chosen.entry.key.clone(),
        canceled: false,
        error_type: None,
        error_message: None,
        credential,
        candidates,
        receipt,
    }
}

enum Choice {
    Entry(usize),
    Cancel,
    Invalid,
}

fn parse_choice(line: &str, entries: usize) -> Choice {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case("c") {
        return Choice::Cancel;
    }
    match trimmed.parse::<usize>() {
        Ok(number) if (1..=entries).contains(&number) => Choice::Entry(number - 1),
        _ => Choice::Invalid,
    }
}

fn print_chooser(request: &RequestId, entries: &[FlatEntry]) {
    println!("-- credential chooser for {request} --");
    for (index, flat) in entries.iter().enumerate() {
        println!(
            "{:>3}. [{:<14}] {:<30} {}",
            index + 1,
            describe_class(&flat.entry),
            flat.entry.display_name,
            flat.service,
        );
    }
    println!("select an entry number, or 'c' to cancel:");
}

fn describe_class(entry: &ChooserEntry) -> String {
    match (entry.class, entry.auth_status) {
        (EntryClass::Authentication, Some(AuthenticationStatus::Locked)) => "locked".into(),
        (EntryClass::Authentication, Some(_)) => "empty".into(),
        (class, _) => class.as_str().into(),
    }
}

async fn handshake(framed: &mut Framed<UnixStream, MessageCodec>) -> Result<(), SelectorError> {
    framed
        .send(Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role: Role::Selector,
        })
        .await
        .map_err(|e| SelectorError::Arbiter(format!("send hello: {e}")))?;
    match framed.next().await {
        Some(Ok(Message::HelloAck {
            status: Status::Ok, ..
        })) => Ok(()),
        Some(Ok(Message::HelloAck { error, .. })) => Err(SelectorError::Arbiter(format!(
            "handshake rejected: {}",
            error.unwrap_or_default()
        ))),
        other => Err(SelectorError::Arbiter(format!(
            "unexpected handshake response: {other:?}"
        ))),
    }
}

/// Resolve the arbiter socket path from `$XDG_RUNTIME_DIR`.
fn resolve_socket_path() -> Result<std::path::PathBuf, SelectorError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| SelectorError::Arbiter("$XDG_RUNTIME_DIR not set".into()))?;
    Ok(std::path::PathBuf::from(runtime_dir)
        .join("credentiald")
        .join("arbiterd.sock"))
}
