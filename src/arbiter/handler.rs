//! Message dispatch and session routing.
//!
//! Each handler takes the daemon's state and returns the response for the
//! requesting connection. Session actors are spawned from here; pushes to
//! other peers (candidate queries, chooser content, terminal callbacks) go
//! through the per-connection channels in [`DaemonState`].
//!
//! Role-based access: provider-only, client-only, and selector-only
//! messages from the wrong role are rejected as `unknown_type`, exactly
//! like unrecognized message types.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};
use crate::session::clear::ClearSession;
use crate::session::core::{EntryResult, ProviderReply, SelectorError, SessionCore, SessionEvent};
use crate::session::create::CreateSession;
use crate::session::driver::{SessionEnded, spawn_session};
use crate::session::entries::{CandidateBundle, CreateBundle};
use crate::session::error::{ErrorKind, RequestError};
use crate::session::get::GetSession;
use crate::session::types::{
    CallerInfo, CreateRequest, CredentialQuery, GetRequest, RequestId, ServiceId,
};

use super::registry::{ConnectionId, Registry};
use super::router::{RouterCommand, WireCallback, WireReply, WireSelector, WireTransport};

/// Typed event sender for one session actor.
enum SessionMailbox {
    Get(mpsc::UnboundedSender<SessionEvent<CandidateBundle>>),
    Create(mpsc::UnboundedSender<SessionEvent<CreateBundle>>),
    Clear(mpsc::UnboundedSender<SessionEvent<()>>),
}

// All sends ignore errors: the actor may already be finished.
impl SessionMailbox {
    fn send_selection(&self, service: ServiceId, class: String, key: String, result: EntryResult) {
        match self {
            Self::Get(tx) => {
                let _ = tx.send(SessionEvent::Selection {
                    service,
                    class,
                    key,
                    result,
                });
            }
            Self::Create(tx) => {
                let _ = tx.send(SessionEvent::Selection {
                    service,
                    class,
                    key,
                    result,
                });
            }
            Self::Clear(tx) => {
                let _ = tx.send(SessionEvent::Selection {
                    service,
                    class,
                    key,
                    result,
                });
            }
        }
    }

    fn send_dismissed(&self, by_user: bool) {
        match self {
            Self::Get(tx) => {
                let _ = tx.send(SessionEvent::ChooserDismissed { by_user });
            }
            Self::Create(tx) => {
                let _ = tx.send(SessionEvent::ChooserDismissed { by_user });
            }
            Self::Clear(tx) => {
                let _ = tx.send(SessionEvent::ChooserDismissed { by_user });
            }
        }
    }

    fn send_cancelled(&self) {
        match self {
            Self::Get(tx) => {
                let _ = tx.send(SessionEvent::Cancelled);
            }
            Self::Create(tx) => {
                let _ = tx.send(SessionEvent::Cancelled);
            }
            Self::Clear(tx) => {
                let _ = tx.send(SessionEvent::Cancelled);
            }
        }
    }

    fn send_service_died(&self, service: &ServiceId) {
        match self {
            Self::Get(tx) => {
                let _ = tx.send(SessionEvent::ProviderReply {
                    service: service.clone(),
                    reply: ProviderReply::ServiceDied,
                });
            }
            Self::Create(tx) => {
                let _ = tx.send(SessionEvent::ProviderReply {
                    service: service.clone(),
                    reply: ProviderReply::ServiceDied,
                });
            }
            Self::Clear(tx) => {
                let _ = tx.send(SessionEvent::ProviderReply {
                    service: service.clone(),
                    reply: ProviderReply::ServiceDied,
                });
            }
        }
    }
}

/// One in-flight request session as the daemon loop sees it.
struct Route {
    mailbox: SessionMailbox,
    cancel: CancellationToken,
    client: ConnectionId,
}

/// All mutable daemon state. Owned exclusively by the daemon loop.
pub struct DaemonState {
    registry: Registry,
    /// Live sessions keyed by request ID. Entries leave only on
    /// [`SessionEnded`].
    routes: HashMap<RequestId, Route>,
    /// Outstanding provider calls awaiting a `query_result`.
    pending: HashMap<(RequestId, ServiceId), oneshot::Sender<WireReply>>,
    /// Push channel for every accepted connection, handshaken or not.
    push_senders: HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
    /// Collaborators handed to every session actor.
    transport: Arc<WireTransport>,
    selector: Arc<WireSelector>,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    /// Service allowed to offer remote (hybrid) entries, if configured.
    hybrid: Option<ServiceId>,
}

impl DaemonState {
    pub fn new(
        router_tx: mpsc::UnboundedSender<RouterCommand>,
        ended_tx: mpsc::UnboundedSender<SessionEnded>,
        hybrid: Option<ServiceId>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            routes: HashMap::new(),
            pending: HashMap::new(),
            push_senders: HashMap::new(),
            transport: Arc::new(WireTransport::new(router_tx.clone())),
            selector: Arc::new(WireSelector::new(router_tx)),
            ended_tx,
            hybrid,
        }
    }

    /// Register the push channel of a freshly accepted connection.
    pub fn track_connection(&mut self, id: ConnectionId, push_tx: mpsc::UnboundedSender<Message>) {
        self.push_senders.insert(id, push_tx);
    }
}

/// Dispatch a request message to the appropriate handler.
///
/// Returns the response for the requesting connection. Side effects
/// (session spawning, pushes to other peers) happen against `state`
/// directly.
pub fn handle_message(
    state: &mut DaemonState,
    request: Message,
    connection_id: ConnectionId,
) -> Message {
    match request {
        Message::Hello { id, version, role } => {
            handle_hello(state, id, version, role, connection_id)
        }
        // -- Provider-only messages --
        Message::RegisterProvider {
            id,
            service,
            capabilities,
        } => {
            if !has_role(state, connection_id, Role::Provider) {
                return error_response(id, "unknown_type");
            }
            handle_register(state, id, service, capabilities, connection_id)
        }
        Message::DeregisterProvider { id, service } => {
            if !has_role(state, connection_id, Role::Provider) {
                return error_response(id, "unknown_type");
            }
            handle_deregister(state, id, &service, connection_id)
        }
        Message::QueryResult {
            id,
            request,
            service,
            get_entries,
            create_entries,
            cleared,
            error,
        } => {
            if !has_role(state, connection_id, Role::Provider) {
                return error_response(id, "unknown_type");
            }
            let reply = WireReply::Result {
                get_entries,
                create_entries,
                cleared,
                error,
            };
            handle_query_result(state, id, request, service, reply, connection_id)
        }
        // -- Client-only messages --
        Message::GetCredentials {
            id,
            caller,
            options,
        } => {
            if !has_role(state, connection_id, Role::Client) {
                return error_response(id, "unknown_type");
            }
            handle_get(state, id, caller, options, connection_id)
        }
        Message::CreateCredential {
            id,
            caller,
            credential_type,
            data,
        } => {
            if !has_role(state, connection_id, Role::Client) {
                return error_response(id, "unknown_type");
            }
            handle_create(state, id, caller, credential_type, data, connection_id)
        }
        Message::ClearCredentials { id, caller } => {
            if !has_role(state, connection_id, Role::Client) {
                return error_response(id, "unknown_type");
            }
            handle_clear(state, id, caller, connection_id)
        }
        Message::CancelRequest { id, request } => {
            if !has_role(state, connection_id, Role::Client) {
                return error_response(id, "unknown_type");
            }
            handle_cancel(state, id, &request, connection_id)
        }
        // -- Selector-only messages --
        Message::EntrySelected {
            id,
            request,
            service,
            entry_class,
            entry_key,
            canceled,
            error_type,
            error_message,
            credential,
            candidates,
            receipt,
        } => {
            if !has_role(state, connection_id, Role::Selector) {
                return error_response(id, "unknown_type");
            }
            let error = error_type.map(|tag| {
                let message = error_message.unwrap_or_else(|| tag.clone());
                RequestError::new(ErrorKind::from_wire(&tag), message)
            });
            let result = EntryResult {
                canceled,
                error,
                credential,
                candidates,
                receipt,
            };
            handle_entry_selected(state, id, &request, service, entry_class, entry_key, result)
        }
        Message::ChooserClosed {
            id,
            request,
            by_user,
        } => {
            if !has_role(state, connection_id, Role::Selector) {
                return error_response(id, "unknown_type");
            }
            handle_chooser_closed(state, id, &request, by_user)
        }
        // -- Any role --
        Message::ListProviders { id } => handle_list_providers(state, id),
        // Server-originated messages should never be sent by peers.
        Message::HelloAck { id, .. }
        | Message::Response { id, .. }
        | Message::BeginGet { id, .. }
        | Message::BeginCreate { id, .. }
        | Message::BeginClear { id, .. }
        | Message::RequestEnded { id, .. }
        | Message::PresentChooser { id, .. }
        | Message::DismissChooser { id, .. }
        | Message::RequestComplete { id, .. } => error_response(id, "unknown_type"),
    }
}

// -- Individual handlers --

fn handle_hello(
    state: &mut DaemonState,
    id: u32,
    version: u32,
    role: Role,
    connection_id: ConnectionId,
) -> Message {
    // hello.id must be 0; the ack id is always 0 as well.
    if id != 0 {
        return hello_error("invalid_hello_id");
    }
    if version != PROTOCOL_VERSION {
        return hello_error("version_mismatch");
    }
    if let Err(reason) = state.registry.add_connection(connection_id, role) {
        return hello_error(reason);
    }
    tracing::debug!(?connection_id, ?role, "peer connected");
    Message::HelloAck {
        id: 0,
        status: Status::Ok,
        error: None,
    }
}

fn handle_register(
    state: &mut DaemonState,
    id: u32,
    service: ServiceId,
    capabilities: Vec<String>,
    connection_id: ConnectionId,
) -> Message {
    tracing::info!(%service, ?capabilities, "provider registered");
    match state
        .registry
        .register_provider(service, capabilities, connection_id)
    {
        Ok(()) => ok_response(id),
        Err(reason) => error_response(id, reason),
    }
}

fn handle_deregister(
    state: &mut DaemonState,
    id: u32,
    service: &ServiceId,
    connection_id: ConnectionId,
) -> Message {
    match state.registry.deregister_provider(service, connection_id) {
        Ok(()) => {
            tracing::info!(%service, "provider deregistered");
            // In-flight sessions see a deregistered service the same way
            // they see a dead one.
            resolve_dead_service(state, service);
            ok_response(id)
        }
        Err(reason) => error_response(id, reason),
    }
}

fn handle_query_result(
    state: &mut DaemonState,
    id: u32,
    request: RequestId,
    service: ServiceId,
    reply: WireReply,
    connection_id: ConnectionId,
) -> Message {
    if state.registry.provider_connection(&service) != Some(connection_id) {
        return error_response(id, "unknown_service");
    }
    match state.pending.remove(&(request.clone(), service.clone())) {
        Some(reply_tx) => {
            let _ = reply_tx.send(reply);
            ok_response(id)
        }
        None => {
            // Result for a query the daemon stopped waiting on.
            tracing::debug!(%request, %service, "stale query result dropped");
            ok_response(id)
        }
    }
}

fn handle_get(
    state: &mut DaemonState,
    id: u32,
    caller: String,
    options: Vec<CredentialQuery>,
    connection_id: ConnectionId,
) -> Message {
    let Some(push) = state.push_senders.get(&connection_id) else {
        // The connection is racing its own disconnect.
        return error_response(id, "disconnected");
    };
    let request = RequestId::generate();
    tracing::info!(%request, %caller, flow = "get", "request accepted");

    let callback = WireCallback::new(request.clone(), push.clone());
    let token = CancellationToken::new();
    let core = SessionCore::new(
        request.clone(),
        CallerInfo { package: caller },
        token.clone(),
    );
    let descriptors = state.registry.descriptors();
    let (flow, initial) = GetSession::new(
        core,
        &GetRequest { options },
        &descriptors,
        state.hybrid.clone(),
    );
    let events = spawn_session(
        flow,
        initial,
        Arc::clone(&state.transport),
        Arc::clone(&state.selector),
        callback,
        state.ended_tx.clone(),
    );
    state.routes.insert(
        request.clone(),
        Route {
            mailbox: SessionMailbox::Get(events),
            cancel: token,
            client: connection_id,
        },
    );
    accepted_response(id, request)
}

fn handle_create(
    state: &mut DaemonState,
    id: u32,
    caller: String,
    credential_type: String,
    data: Vec<u8>,
    connection_id: ConnectionId,
) -> Message {
    let Some(push) = state.push_senders.get(&connection_id) else {
        return error_response(id, "disconnected");
    };
    let request = RequestId::generate();
    tracing::info!(%request, %caller, flow = "create", "request accepted");

    let callback = WireCallback::new(request.clone(), push.clone());
    let token = CancellationToken::new();
    let core = SessionCore::new(
        request.clone(),
        CallerInfo { package: caller },
        token.clone(),
    );
    let descriptors = state.registry.descriptors();
    let (flow, initial) = CreateSession::new(
        core,
        &CreateRequest {
            credential_type,
            data,
        },
        &descriptors,
        state.hybrid.clone(),
    );
    let events = spawn_session(
        flow,
        initial,
        Arc::clone(&state.transport),
        Arc::clone(&state.selector),
        callback,
        state.ended_tx.clone(),
    );
    state.routes.insert(
        request.clone(),
        Route {
            mailbox: SessionMailbox::Create(events),
            cancel: token,
            client: connection_id,
        },
    );
    accepted_response(id, request)
}

fn handle_clear(
    state: &mut DaemonState,
    id: u32,
    caller: String,
    connection_id: ConnectionId,
) -> Message {
    let Some(push) = state.push_senders.get(&connection_id) else {
        return error_response(id, "disconnected");
    };
    let request = RequestId::generate();
    tracing::info!(%request, %caller, flow = "clear", "request accepted");

    let callback = WireCallback::new(request.clone(), push.clone());
    let token = CancellationToken::new();
    let core = SessionCore::new(
        request.clone(),
        CallerInfo { package: caller },
        token.clone(),
    );
    let descriptors = state.registry.descriptors();
    let (flow, initial) = ClearSession::new(core, &descriptors);
    let events = spawn_session(
        flow,
        initial,
        Arc::clone(&state.transport),
        Arc::clone(&state.selector),
        callback,
        state.ended_tx.clone(),
    );
    state.routes.insert(
        request.clone(),
        Route {
            mailbox: SessionMailbox::Clear(events),
            cancel: token,
            client: connection_id,
        },
    );
    accepted_response(id, request)
}

fn handle_cancel(
    state: &mut DaemonState,
    id: u32,
    request: &RequestId,
    connection_id: ConnectionId,
) -> Message {
    match state.routes.get(request) {
        // Only the connection that opened a request may cancel it.
        Some(route) if route.client == connection_id => {
            tracing::info!(%request, "cancellation requested by client");
            route.cancel.cancel();
            route.mailbox.send_cancelled();
            ok_response(id)
        }
        _ => error_response(id, "request_not_found"),
    }
}

fn handle_entry_selected(
    state: &mut DaemonState,
    id: u32,
    request: &RequestId,
    service: ServiceId,
    entry_class: String,
    entry_key: String,
    result: EntryResult,
) -> Message {
    let Some(route) = state.routes.get(request) else {
        return error_response(id, "request_not_found");
    };
    route
        .mailbox
        .send_selection(service, entry_class, entry_key, result);
    ok_response(id)
}

fn handle_chooser_closed(
    state: &mut DaemonState,
    id: u32,
    request: &RequestId,
    by_user: bool,
) -> Message {
    let Some(route) = state.routes.get(request) else {
        return error_response(id, "request_not_found");
    };
    route.mailbox.send_dismissed(by_user);
    ok_response(id)
}

fn handle_list_providers(state: &DaemonState, id: u32) -> Message {
    Message::Response {
        id,
        status: Status::Ok,
        error: None,
        request: None,
        providers: Some(state.registry.descriptors()),
    }
}

// -- Loop-side servicing --

/// Service a routing command from a session actor.
pub fn handle_router_command(state: &mut DaemonState, command: RouterCommand) {
    match command {
        RouterCommand::InvokeProvider {
            request,
            service,
            message,
            reply_tx,
        } => {
            let Some(connection) = state.registry.provider_connection(&service) else {
                let _ = reply_tx.send(WireReply::ServiceDied);
                return;
            };
            match state.push_senders.get(&connection) {
                Some(push) if push.send(message).is_ok() => {
                    state.pending.insert((request, service), reply_tx);
                }
                _ => {
                    let _ = reply_tx.send(WireReply::ServiceDied);
                }
            }
        }
        RouterCommand::PresentChooser {
            request,
            providers,
            ack_tx,
        } => {
            let Some(connection) = state.registry.selector_connection() else {
                let _ = ack_tx.send(Err(SelectorError("no selector connected".into())));
                return;
            };
            let message = Message::PresentChooser {
                id: 0,
                request,
                providers,
            };
            match state.push_senders.get(&connection) {
                Some(push) if push.send(message).is_ok() => {
                    let _ = ack_tx.send(Ok(()));
                }
                _ => {
                    let _ = ack_tx.send(Err(SelectorError("selector disconnected".into())));
                }
            }
        }
    }
}

/// Tear down the routing state of a finished session and notify peers.
pub fn handle_session_ended(state: &mut DaemonState, ended: SessionEnded) {
    let request = ended.request;
    if state.routes.remove(&request).is_none() {
        tracing::debug!(%request, "ended notice for unknown session");
        return;
    }
    // Dropped reply channels read as death on the transport side; the
    // actor those calls feed is already gone.
    state
        .pending
        .retain(|(pending_request, _), _| *pending_request != request);

    if let Some(selector) = state.registry.selector_connection() {
        push_to(
            state,
            selector,
            Message::DismissChooser {
                id: 0,
                request: request.clone(),
            },
        );
    }
    for connection in state.registry.provider_connections() {
        push_to(
            state,
            connection,
            Message::RequestEnded {
                id: 0,
                request: request.clone(),
            },
        );
    }
    tracing::debug!(%request, "session torn down");
}

/// Clean up after a disconnected peer and fan the consequences out to
/// live sessions.
pub fn handle_disconnect(state: &mut DaemonState, connection_id: ConnectionId) {
    state.push_senders.remove(&connection_id);
    let role = state.registry.connection_role(connection_id);
    let dead_services = state.registry.remove_connection(connection_id);
    for service in &dead_services {
        tracing::info!(%service, "provider service lost");
        resolve_dead_service(state, service);
    }
    match role {
        Some(Role::Selector) => {
            // The chooser vanished; sessions that were showing it fail,
            // the rest ignore the notice.
            tracing::info!("selector disconnected");
            for route in state.routes.values() {
                route.mailbox.send_dismissed(false);
            }
        }
        Some(Role::Client) => {
            for (request, route) in &state.routes {
                if route.client == connection_id {
                    tracing::info!(%request, "client disconnected, cancelling request");
                    route.cancel.cancel();
                    route.mailbox.send_cancelled();
                }
            }
        }
        _ => {}
    }
    tracing::debug!(?connection_id, "connection cleaned up");
}

/// Resolve everything still waiting on `service`: answer outstanding
/// calls with death and tell every live session.
fn resolve_dead_service(state: &mut DaemonState, service: &ServiceId) {
    let stale: Vec<(RequestId, ServiceId)> = state
        .pending
        .keys()
        .filter(|(_, pending_service)| pending_service == service)
        .cloned()
        .collect();
    for key in stale {
        if let Some(reply_tx) = state.pending.remove(&key) {
            let _ = reply_tx.send(WireReply::ServiceDied);
        }
    }
    for route in state.routes.values() {
        route.mailbox.send_service_died(service);
    }
}

// -- Helpers --

fn has_role(state: &DaemonState, connection_id: ConnectionId, role: Role) -> bool {
    state.registry.connection_role(connection_id) == Some(role)
}

fn push_to(state: &DaemonState, connection: ConnectionId, message: Message) {
    if let Some(push) = state.push_senders.get(&connection) {
        if push.send(message).is_err() {
            tracing::debug!(?connection, "push to closing connection dropped");
        }
    }
}

fn hello_error(reason: &str) -> Message {
    Message::HelloAck {
        id: 0,
        status: Status::Error,
        error: Some(reason.into()),
    }
}

fn ok_response(id: u32) -> Message {
    Message::Response {
        id,
        status: Status::Ok,
        error: None,
        request: None,
        providers: None,
    }
}

fn error_response(id: u32, reason: &str) -> Message {
    Message::Response {
        id,
        status: Status::Error,
        error: Some(reason.into()),
        request: None,
        providers: None,
    }
}

fn accepted_response(id: u32, request: RequestId) -> Message {
    Message::Response {
        id,
        status: Status::Ok,
        error: None,
        request: Some(request),
        providers: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::driver::SessionEnded;

    fn fresh() -> (
        DaemonState,
        mpsc::UnboundedReceiver<RouterCommand>,
        mpsc::UnboundedReceiver<SessionEnded>,
    ) {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        (DaemonState::new(router_tx, ended_tx, None), router_rx, ended_rx)
    }

    fn hello(role: Role) -> Message {
        Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role,
        }
    }

    /// Accept + handshake a connection under `role`, returning its id and
    /// the receiving end of its push channel.
    fn connect(
        state: &mut DaemonState,
        role: Role,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let id = ConnectionId::new();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        state.track_connection(id, push_tx);
        let ack = handle_message(state, hello(role), id);
        assert!(matches!(
            ack,
            Message::HelloAck {
                status: Status::Ok,
                ..
            }
        ));
        (id, push_rx)
    }

    fn register(state: &mut DaemonState, conn: ConnectionId, service: &str, caps: &[&str]) {
        let resp = handle_message(
            state,
            Message::RegisterProvider {
                id: 1,
                service: ServiceId::new(service),
                capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
            },
            conn,
        );
        assert!(matches!(
            resp,
            Message::Response {
                status: Status::Ok,
                ..
            }
        ));
    }

    fn error_reason(resp: &Message) -> &str {
        match resp {
            Message::Response {
                error: Some(reason),
                ..
            } => reason,
            other => panic!("expected error response, got {other:?}"),
        }
    }

    fn accepted_request(resp: &Message) -> RequestId {
        match resp {
            Message::Response {
                status: Status::Ok,
                request: Some(request),
                ..
            } => request.clone(),
            other => panic!("expected accepted response, got {other:?}"),
        }
    }

    // -- Hello --

    #[test]
    fn hello_success() {
        let (mut state, _router, _ended) = fresh();
        let conn = ConnectionId::new();
        let resp = handle_message(&mut state, hello(Role::Client), conn);
        assert!(matches!(
            resp,
            Message::HelloAck {
                id: 0,
                status: Status::Ok,
                ..
            }
        ));
    }

    #[test]
    fn hello_version_mismatch() {
        let (mut state, _router, _ended) = fresh();
        let conn = ConnectionId::new();
        let resp = handle_message(
            &mut state,
            Message::Hello {
                id: 0,
                version: 999,
                role: Role::Client,
            },
            conn,
        );
        match resp {
            Message::HelloAck {
                id, status, error, ..
            } => {
                assert_eq!(id, 0);
                assert_eq!(status, Status::Error);
                assert_eq!(error.as_deref(), Some("version_mismatch"));
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    #[test]
    fn hello_nonzero_id_rejected() {
        let (mut state, _router, _ended) = fresh();
        let conn = ConnectionId::new();
        let resp = handle_message(
            &mut state,
            Message::Hello {
                id: 5,
                version: PROTOCOL_VERSION,
                role: Role::Client,
            },
            conn,
        );
        match resp {
            Message::HelloAck { id, error, .. } => {
                assert_eq!(id, 0);
                assert_eq!(error.as_deref(), Some("invalid_hello_id"));
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    #[test]
    fn second_selector_rejected_in_handshake() {
        let (mut state, _router, _ended) = fresh();
        let (_first, _rx) = connect(&mut state, Role::Selector);
        let second = ConnectionId::new();
        let resp = handle_message(&mut state, hello(Role::Selector), second);
        match resp {
            Message::HelloAck { error, .. } => {
                assert_eq!(error.as_deref(), Some("selector_already_connected"));
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    // -- Provider registration --

    #[test]
    fn register_and_list_providers() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &["passkey"]);

        let resp = handle_message(&mut state, Message::ListProviders { id: 2 }, provider);
        match resp {
            Message::Response {
                providers: Some(providers),
                ..
            } => {
                assert_eq!(providers.len(), 1);
                assert_eq!(providers[0].service.as_str(), "com.example.vault");
            }
            other => panic!("expected provider list, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &[]);
        let resp = handle_message(
            &mut state,
            Message::RegisterProvider {
                id: 2,
                service: ServiceId::new("com.example.vault"),
                capabilities: vec![],
            },
            provider,
        );
        assert_eq!(error_reason(&resp), "service_already_registered");
    }

    #[test]
    fn register_rejected_from_client_role() {
        let (mut state, _router, _ended) = fresh();
        let (client, _rx) = connect(&mut state, Role::Client);
        let resp = handle_message(
            &mut state,
            Message::RegisterProvider {
                id: 1,
                service: ServiceId::new("com.example.vault"),
                capabilities: vec![],
            },
            client,
        );
        assert_eq!(error_reason(&resp), "unknown_type");
    }

    #[test]
    fn get_rejected_from_provider_role() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _rx) = connect(&mut state, Role::Provider);
        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 1,
                caller: "com.example.app".into(),
                options: vec![],
            },
            provider,
        );
        assert_eq!(error_reason(&resp), "unknown_type");
    }

    // -- Session start --

    #[tokio::test]
    async fn get_request_accepted_and_provider_invoked() {
        let (mut state, mut router_rx, _ended) = fresh();
        let (provider, _provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &["passkey"]);
        let (client, _client_rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 7,
                caller: "com.example.app".into(),
                options: vec![CredentialQuery {
                    credential_type: "passkey".into(),
                    query_data: vec![],
                }],
            },
            client,
        );
        let request = accepted_request(&resp);

        // The session actor asks the loop to invoke the provider.
        match router_rx.recv().await.unwrap() {
            RouterCommand::InvokeProvider {
                request: invoked,
                service,
                message: Message::BeginGet { id, .. },
                ..
            } => {
                assert_eq!(invoked, request);
                assert_eq!(service.as_str(), "com.example.vault");
                assert_eq!(id, 0);
            }
            other => panic!("expected provider invoke, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_without_providers_completes_with_error_push() {
        let (mut state, _router, mut ended_rx) = fresh();
        let (client, mut client_rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 1,
                caller: "com.example.app".into(),
                options: vec![CredentialQuery {
                    credential_type: "passkey".into(),
                    query_data: vec![],
                }],
            },
            client,
        );
        let request = accepted_request(&resp);

        match client_rx.recv().await.unwrap() {
            Message::RequestComplete {
                id,
                request: completed,
                status,
                error_type,
                ..
            } => {
                assert_eq!(id, 0);
                assert_eq!(completed, request);
                assert_eq!(status, Status::Error);
                assert_eq!(error_type.as_deref(), Some("no_credential"));
            }
            other => panic!("expected request_complete, got {other:?}"),
        }
        assert_eq!(ended_rx.recv().await.unwrap().request, request);
    }

    // -- Cancellation --

    #[tokio::test]
    async fn cancel_requires_owning_client() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &["passkey"]);
        let (owner, mut owner_rx) = connect(&mut state, Role::Client);
        let (other, _other_rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 1,
                caller: "com.example.app".into(),
                options: vec![CredentialQuery {
                    credential_type: "passkey".into(),
                    query_data: vec![],
                }],
            },
            owner,
        );
        let request = accepted_request(&resp);

        let resp = handle_message(
            &mut state,
            Message::CancelRequest {
                id: 2,
                request: request.clone(),
            },
            other,
        );
        assert_eq!(error_reason(&resp), "request_not_found");

        let resp = handle_message(
            &mut state,
            Message::CancelRequest {
                id: 3,
                request: request.clone(),
            },
            owner,
        );
        assert!(matches!(
            resp,
            Message::Response {
                status: Status::Ok,
                ..
            }
        ));

        match owner_rx.recv().await.unwrap() {
            Message::RequestComplete {
                status, error_type, ..
            } => {
                assert_eq!(status, Status::Error);
                assert_eq!(error_type.as_deref(), Some("client_canceled"));
            }
            other => panic!("expected request_complete, got {other:?}"),
        }
    }

    #[test]
    fn cancel_unknown_request() {
        let (mut state, _router, _ended) = fresh();
        let (client, _rx) = connect(&mut state, Role::Client);
        let resp = handle_message(
            &mut state,
            Message::CancelRequest {
                id: 1,
                request: RequestId::new("does-not-exist"),
            },
            client,
        );
        assert_eq!(error_reason(&resp), "request_not_found");
    }

    // -- Provider query resolution --

    #[test]
    fn query_result_resolves_pending_call() {
        let (mut state, _router, _ended) = fresh();
        let (provider, mut provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &[]);

        let request = RequestId::new("req-1");
        let service = ServiceId::new("com.example.vault");
        let (reply_tx, mut reply_rx) = oneshot::channel();
        handle_router_command(
            &mut state,
            RouterCommand::InvokeProvider {
                request: request.clone(),
                service: service.clone(),
                message: Message::BeginClear {
                    id: 0,
                    request: request.clone(),
                },
                reply_tx,
            },
        );
        // The begin message reached the provider's push channel.
        assert!(matches!(
            provider_rx.try_recv(),
            Ok(Message::BeginClear { .. })
        ));

        let resp = handle_message(
            &mut state,
            Message::QueryResult {
                id: 9,
                request,
                service,
                get_entries: None,
                create_entries: None,
                cleared: Some(true),
                error: None,
            },
            provider,
        );
        assert!(matches!(
            resp,
            Message::Response {
                status: Status::Ok,
                ..
            }
        ));
        assert!(matches!(
            reply_rx.try_recv(),
            Ok(WireReply::Result {
                cleared: Some(true),
                ..
            })
        ));
    }

    #[test]
    fn query_result_from_unregistered_service_rejected() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _rx) = connect(&mut state, Role::Provider);
        let resp = handle_message(
            &mut state,
            Message::QueryResult {
                id: 1,
                request: RequestId::new("req-1"),
                service: ServiceId::new("never.registered"),
                get_entries: None,
                create_entries: None,
                cleared: None,
                error: None,
            },
            provider,
        );
        assert_eq!(error_reason(&resp), "unknown_service");
    }

    #[test]
    fn stale_query_result_acknowledged() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &[]);
        let resp = handle_message(
            &mut state,
            Message::QueryResult {
                id: 4,
                request: RequestId::new("long-gone"),
                service: ServiceId::new("com.example.vault"),
                get_entries: None,
                create_entries: None,
                cleared: Some(true),
                error: None,
            },
            provider,
        );
        assert!(matches!(
            resp,
            Message::Response {
                status: Status::Ok,
                ..
            }
        ));
    }

    #[test]
    fn invoke_of_unknown_service_answers_death() {
        let (mut state, _router, _ended) = fresh();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        handle_router_command(
            &mut state,
            RouterCommand::InvokeProvider {
                request: RequestId::new("req-1"),
                service: ServiceId::new("never.registered"),
                message: Message::BeginClear {
                    id: 0,
                    request: RequestId::new("req-1"),
                },
                reply_tx,
            },
        );
        assert!(matches!(reply_rx.try_recv(), Ok(WireReply::ServiceDied)));
    }

    #[test]
    fn chooser_without_selector_answers_error() {
        let (mut state, _router, _ended) = fresh();
        let (ack_tx, mut ack_rx) = oneshot::channel();
        handle_router_command(
            &mut state,
            RouterCommand::PresentChooser {
                request: RequestId::new("req-1"),
                providers: vec![],
                ack_tx,
            },
        );
        assert!(matches!(ack_rx.try_recv(), Ok(Err(_))));
    }

    #[test]
    fn chooser_content_pushed_to_selector() {
        let (mut state, _router, _ended) = fresh();
        let (_selector, mut selector_rx) = connect(&mut state, Role::Selector);
        let (ack_tx, mut ack_rx) = oneshot::channel();
        handle_router_command(
            &mut state,
            RouterCommand::PresentChooser {
                request: RequestId::new("req-1"),
                providers: vec![],
                ack_tx,
            },
        );
        assert!(matches!(ack_rx.try_recv(), Ok(Ok(()))));
        assert!(matches!(
            selector_rx.try_recv(),
            Ok(Message::PresentChooser { id: 0, .. })
        ));
    }

    // -- Selection routing --

    #[test]
    fn entry_selected_for_unknown_request() {
        let (mut state, _router, _ended) = fresh();
        let (selector, _rx) = connect(&mut state, Role::Selector);
        let resp = handle_message(
            &mut state,
            Message::EntrySelected {
                id: 1,
                request: RequestId::new("long-gone"),
                service: ServiceId::new("com.example.vault"),
                entry_class: "credential".into(),
                entry_key: "k1".into(),
                canceled: false,
                error_type: None,
                error_message: None,
                credential: None,
                candidates: None,
                receipt: None,
            },
            selector,
        );
        assert_eq!(error_reason(&resp), "request_not_found");
    }

    #[test]
    fn entry_selected_rejected_from_client_role() {
        let (mut state, _router, _ended) = fresh();
        let (client, _rx) = connect(&mut state, Role::Client);
        let resp = handle_message(
            &mut state,
            Message::EntrySelected {
                id: 1,
                request: RequestId::new("req-1"),
                service: ServiceId::new("com.example.vault"),
                entry_class: "credential".into(),
                entry_key: "k1".into(),
                canceled: false,
                error_type: None,
                error_message: None,
                credential: None,
                candidates: None,
                receipt: None,
            },
            client,
        );
        assert_eq!(error_reason(&resp), "unknown_type");
    }

    // -- Session teardown --

    #[tokio::test]
    async fn session_ended_notifies_selector_and_providers() {
        let (mut state, mut router_rx, mut ended_rx) = fresh();
        let (provider, mut provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &["passkey"]);
        let (_selector, mut selector_rx) = connect(&mut state, Role::Selector);
        let (client, _client_rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 1,
                caller: "com.example.app".into(),
                options: vec![CredentialQuery {
                    credential_type: "passkey".into(),
                    query_data: vec![],
                }],
            },
            client,
        );
        let request = accepted_request(&resp);
        // The session actor's fan-out arrives as a router command; execute
        // it so the begin_get push lands, then drain that push so later
        // asserts see only teardown.
        let invoke = router_rx.recv().await.unwrap();
        handle_router_command(&mut state, invoke);
        let _ = provider_rx.recv().await;

        handle_message(
            &mut state,
            Message::CancelRequest {
                id: 2,
                request: request.clone(),
            },
            client,
        );
        let ended = ended_rx.recv().await.unwrap();
        handle_session_ended(&mut state, ended);

        assert!(matches!(
            selector_rx.try_recv(),
            Ok(Message::DismissChooser { .. })
        ));
        assert!(matches!(
            provider_rx.try_recv(),
            Ok(Message::RequestEnded { .. })
        ));
        // The route is gone; a second cancel no longer matches.
        let resp = handle_message(
            &mut state,
            Message::CancelRequest {
                id: 3,
                request,
            },
            client,
        );
        assert_eq!(error_reason(&resp), "request_not_found");
    }

    // -- Disconnect handling --

    #[test]
    fn provider_disconnect_resolves_pending_with_death() {
        let (mut state, _router, _ended) = fresh();
        let (provider, _provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &[]);

        let request = RequestId::new("req-1");
        let (reply_tx, mut reply_rx) = oneshot::channel();
        handle_router_command(
            &mut state,
            RouterCommand::InvokeProvider {
                request: request.clone(),
                service: ServiceId::new("com.example.vault"),
                message: Message::BeginClear {
                    id: 0,
                    request,
                },
                reply_tx,
            },
        );

        handle_disconnect(&mut state, provider);
        assert!(matches!(reply_rx.try_recv(), Ok(WireReply::ServiceDied)));
        assert!(state.registry.descriptors().is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_its_sessions() {
        let (mut state, _router, mut ended_rx) = fresh();
        let (provider, _provider_rx) = connect(&mut state, Role::Provider);
        register(&mut state, provider, "com.example.vault", &["passkey"]);
        let (client, _client_rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::GetCredentials {
                id: 1,
                caller: "com.example.app".into(),
                options: vec![CredentialQuery {
                    credential_type: "passkey".into(),
                    query_data: vec![],
                }],
            },
            client,
        );
        let request = accepted_request(&resp);

        handle_disconnect(&mut state, client);
        // The actor delivers its (undeliverable) callback and finishes.
        assert_eq!(ended_rx.recv().await.unwrap().request, request);
    }

    // -- Server-originated messages --

    #[test]
    fn server_messages_return_unknown_type() {
        let (mut state, _router, _ended) = fresh();
        let (client, _rx) = connect(&mut state, Role::Client);

        let resp = handle_message(
            &mut state,
            Message::HelloAck {
                id: 1,
                status: Status::Ok,
                error: None,
            },
            client,
        );
        assert_eq!(error_reason(&resp), "unknown_type");

        let resp = handle_message(
            &mut state,
            Message::BeginClear {
                id: 2,
                request: RequestId::new("req-1"),
            },
            client,
        );
        assert_eq!(error_reason(&resp), "unknown_type");
    }
}
