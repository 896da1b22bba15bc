//! Wire-backed collaborators for session actors.
//!
//! Session actors never touch sockets. Provider queries, chooser
//! presentation, and client callbacks all cross back into the daemon loop
//! as [`RouterCommand`]s carrying oneshot reply channels, so the loop
//! stays the single owner of connection state.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::ipc::protocol::{Message, Status};
use crate::session::clear::ClearQuery;
use crate::session::core::{
    ClientCallback, DeliveryError, ProviderReply, ProviderTransport, Selector, SelectorError,
};
use crate::session::create::CreateQuery;
use crate::session::entries::{CandidateBundle, CreateBundle, ProviderUiData};
use crate::session::error::RequestError;
use crate::session::get::GetQuery;
use crate::session::types::{Credential, CreationReceipt, RequestId, ServiceId};

/// How long a provider gets to answer a candidate query before the
/// session moves on without it.
pub const PROVIDER_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing work only the daemon loop can do.
#[derive(Debug)]
pub enum RouterCommand {
    /// Push `message` to the connection serving `service` and hold the
    /// reply channel until its `query_result` arrives.
    InvokeProvider {
        request: RequestId,
        service: ServiceId,
        message: Message,
        reply_tx: oneshot::Sender<WireReply>,
    },
    /// Push the aggregated chooser content to the selector connection.
    PresentChooser {
        request: RequestId,
        providers: Vec<ProviderUiData>,
        ack_tx: oneshot::Sender<Result<(), SelectorError>>,
    },
}

/// Provider answer as resolved by the daemon loop.
#[derive(Debug)]
pub enum WireReply {
    /// The provider's `query_result` fields, not yet validated per flow.
    Result {
        get_entries: Option<CandidateBundle>,
        create_entries: Option<CreateBundle>,
        cleared: Option<bool>,
        error: Option<String>,
    },
    /// No answer within [`PROVIDER_CALL_TIMEOUT`].
    TimedOut,
    /// The provider connection is gone, or was never there.
    ServiceDied,
}

/// Provider transport that routes queries through the daemon loop.
pub struct WireTransport {
    router: mpsc::UnboundedSender<RouterCommand>,
}

impl WireTransport {
    pub fn new(router: mpsc::UnboundedSender<RouterCommand>) -> Self {
        Self { router }
    }

    async fn call(&self, request: &RequestId, service: &ServiceId, message: Message) -> WireReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RouterCommand::InvokeProvider {
            request: request.clone(),
            service: service.clone(),
            message,
            reply_tx,
        };
        if self.router.send(command).is_err() {
            // The daemon loop stopped; the session is being torn down.
            return WireReply::ServiceDied;
        }
        match tokio::time::timeout(PROVIDER_CALL_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => reply,
            // Reply channel dropped during session cleanup.
            Ok(Err(_)) => WireReply::ServiceDied,
            Err(_) => {
                tracing::warn!(%request, %service, "provider query timed out");
                WireReply::TimedOut
            }
        }
    }
}

#[async_trait]
impl ProviderTransport<GetQuery, CandidateBundle> for WireTransport {
    async fn invoke(
        &self,
        request: &RequestId,
        service: &ServiceId,
        query: GetQuery,
    ) -> ProviderReply<CandidateBundle> {
        let message = Message::BeginGet {
            id: 0,
            request: request.clone(),
            options: query.options,
        };
        match self.call(request, service, message).await {
            WireReply::Result {
                error: Some(message),
                ..
            } => ProviderReply::Failure(RequestError::unknown(message)),
            WireReply::Result { get_entries, .. } => {
                ProviderReply::Candidates(get_entries.unwrap_or_default())
            }
            WireReply::TimedOut => {
                ProviderReply::Failure(RequestError::unknown("provider query timed out"))
            }
            WireReply::ServiceDied => ProviderReply::ServiceDied,
        }
    }
}

#[async_trait]
impl ProviderTransport<CreateQuery, CreateBundle> for WireTransport {
    async fn invoke(
        &self,
        request: &RequestId,
        service: &ServiceId,
        query: CreateQuery,
    ) -> ProviderReply<CreateBundle> {
        let message = Message::BeginCreate {
            id: 0,
            request: request.clone(),
            credential_type: query.credential_type,
            data: query.data,
        };
        match self.call(request, service, message).await {
            WireReply::Result {
                error: Some(message),
                ..
            } => ProviderReply::Failure(RequestError::unknown(message)),
            WireReply::Result { create_entries, .. } => {
                ProviderReply::Candidates(create_entries.unwrap_or_default())
            }
            WireReply::TimedOut => {
                ProviderReply::Failure(RequestError::unknown("provider query timed out"))
            }
            WireReply::ServiceDied => ProviderReply::ServiceDied,
        }
    }
}

#[async_trait]
impl ProviderTransport<ClearQuery, ()> for WireTransport {
    async fn invoke(
        &self,
        request: &RequestId,
        service: &ServiceId,
        _query: ClearQuery,
    ) -> ProviderReply<()> {
        let message = Message::BeginClear {
            id: 0,
            request: request.clone(),
        };
        match self.call(request, service, message).await {
            WireReply::Result {
                error: Some(message),
                ..
            } => ProviderReply::Failure(RequestError::clear_failed(message)),
            WireReply::Result {
                cleared: Some(true),
                ..
            } => ProviderReply::Candidates(()),
            WireReply::Result { .. } => ProviderReply::Failure(RequestError::clear_failed(
                "provider did not clear state",
            )),
            WireReply::TimedOut => {
                ProviderReply::Failure(RequestError::clear_failed("provider query timed out"))
            }
            WireReply::ServiceDied => ProviderReply::ServiceDied,
        }
    }
}

/// Chooser handle that routes presentation through the daemon loop.
pub struct WireSelector {
    router: mpsc::UnboundedSender<RouterCommand>,
}

impl WireSelector {
    pub fn new(router: mpsc::UnboundedSender<RouterCommand>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Selector for WireSelector {
    async fn present(
        &self,
        request: &RequestId,
        providers: Vec<ProviderUiData>,
    ) -> Result<(), SelectorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.router
            .send(RouterCommand::PresentChooser {
                request: request.clone(),
                providers,
                ack_tx,
            })
            .map_err(|_| SelectorError("daemon loop stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| SelectorError("daemon loop stopped".into()))?
    }
}

/// Client callback that pushes `request_complete` on the requesting
/// connection. One value per session; the exactly-once guard lives in the
/// session core, not here.
pub struct WireCallback {
    request: RequestId,
    push: mpsc::UnboundedSender<Message>,
}

impl WireCallback {
    pub fn new(request: RequestId, push: mpsc::UnboundedSender<Message>) -> Self {
        Self { request, push }
    }

    fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        self.push
            .send(message)
            .map_err(|_| DeliveryError("client connection closed".into()))
    }

    fn completed(&self, credential: Option<Credential>, receipt: Option<CreationReceipt>) -> Message {
        Message::RequestComplete {
            id: 0,
            request: self.request.clone(),
            status: Status::Ok,
            error_type: None,
            error_message: None,
            credential,
            receipt,
        }
    }

    fn failed(&self, error: RequestError) -> Message {
        Message::RequestComplete {
            id: 0,
            request: self.request.clone(),
            status: Status::Error,
            error_type: Some(error.kind.as_str().into()),
            error_message: Some(error.message),
            credential: None,
            receipt: None,
        }
    }
}

#[async_trait]
impl ClientCallback<Credential> for WireCallback {
    async fn on_response(&mut self, response: Credential) -> Result<(), DeliveryError> {
        self.deliver(self.completed(Some(response), None))
    }

    async fn on_error(&mut self, error: RequestError) -> Result<(), DeliveryError> {
        self.deliver(self.failed(error))
    }
}

#[async_trait]
impl ClientCallback<CreationReceipt> for WireCallback {
    async fn on_response(&mut self, response: CreationReceipt) -> Result<(), DeliveryError> {
        self.deliver(self.completed(None, Some(response)))
    }

    async fn on_error(&mut self, error: RequestError) -> Result<(), DeliveryError> {
        self.deliver(self.failed(error))
    }
}

#[async_trait]
impl ClientCallback<()> for WireCallback {
    async fn on_response(&mut self, _response: ()) -> Result<(), DeliveryError> {
        self.deliver(self.completed(None, None))
    }

    async fn on_error(&mut self, error: RequestError) -> Result<(), DeliveryError> {
        self.deliver(self.failed(error))
    }
}
