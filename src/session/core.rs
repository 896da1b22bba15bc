//! Shared request-session machinery: events, actions, the exactly-once
//! completion guard, and the collaborator seams.
//!
//! Flow state machines (`get`, `create`, `clear`) are pure: they consume
//! `SessionEvent`s and emit `SessionAction`s. The driver owns all I/O. The
//! cancellation signal is readable from pure state and is consulted only at
//! terminal response points; whatever the flows decided, a cancelled session
//! answers the client with the cancellation error.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::session::entries::{CandidateBundle, ProviderUiData};
use crate::session::error::RequestError;
use crate::session::types::{CallerInfo, Credential, CreationReceipt, RequestId, ServiceId};

/// Outcome of one remote candidate-phase invocation.
#[derive(Debug, Clone)]
pub enum ProviderReply<C> {
    /// Candidate payload, possibly carrying nothing to show.
    Candidates(C),
    /// Remote failure, captured as a value and never rethrown.
    Failure(RequestError),
    /// The provider's connection went away before answering.
    ServiceDied,
}

/// Outcome of the provider-side flow behind a selected entry, relayed by
/// the selector alongside the selection itself.
#[derive(Debug, Clone, Default)]
pub struct EntryResult {
    /// User backed out of the provider flow.
    pub canceled: bool,
    /// Provider-reported failure.
    pub error: Option<RequestError>,
    /// Final credential (get: credential and remote entries).
    pub credential: Option<Credential>,
    /// Refreshed candidates (get: authentication entries).
    pub candidates: Option<CandidateBundle>,
    /// Save confirmation (create: save and remote entries).
    pub receipt: Option<CreationReceipt>,
}

/// Input to a flow state machine, delivered on the session's actor.
#[derive(Debug)]
pub enum SessionEvent<C> {
    ProviderReply {
        service: ServiceId,
        reply: ProviderReply<C>,
    },
    /// The user picked an entry. `class` and `key` arrive as raw wire tags
    /// and are validated by the flow.
    Selection {
        service: ServiceId,
        class: String,
        key: String,
        result: EntryResult,
    },
    /// The chooser closed without a selection.
    ChooserDismissed { by_user: bool },
    /// The chooser could not be shown at all.
    ChooserUnavailable,
    /// The client cancelled the request. The cancellation token is already
    /// set when this arrives; the event exists to wake the session.
    Cancelled,
}

/// Output of a flow state machine, executed in order by the driver.
#[derive(Debug)]
pub enum SessionAction<Q, R> {
    /// Dispatch a candidate-phase query to one provider.
    Invoke { service: ServiceId, query: Q },
    /// Show (or refresh) the chooser with per-provider entry data.
    Present(Vec<ProviderUiData>),
    /// Terminal: deliver the final response to the client.
    Respond(R),
    /// Terminal: deliver a failure to the client.
    Fail(RequestError),
}

/// Per-session identity, cancellation, completion guard, and phase metrics.
///
/// Exactly one of `respond`/`fail` ever produces a terminal action; further
/// attempts are no-ops. Both convert to the cancellation error when the
/// session's token was cancelled first.
#[derive(Debug)]
pub struct SessionCore {
    request: RequestId,
    caller: CallerInfo,
    cancel: CancellationToken,
    completed: bool,
    metrics: PhaseMetrics,
}

#[derive(Debug)]
struct PhaseMetrics {
    started: Instant,
    providers_queried: usize,
    all_settled_at: Option<Instant>,
    presented_at: Option<Instant>,
    chosen: Option<ServiceId>,
}

impl SessionCore {
    pub fn new(request: RequestId, caller: CallerInfo, cancel: CancellationToken) -> Self {
        Self {
            request,
            caller,
            cancel,
            completed: false,
            metrics: PhaseMetrics {
                started: Instant::now(),
                providers_queried: 0,
                all_settled_at: None,
                presented_at: None,
                chosen: None,
            },
        }
    }

    pub fn request(&self) -> &RequestId {
        &self.request
    }

    pub fn caller(&self) -> &CallerInfo {
        &self.caller
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether this session has ever asked for the chooser.
    pub fn ui_shown(&self) -> bool {
        self.metrics.presented_at.is_some()
    }

    // -- Metrics hooks (passive, never consulted by flow logic) --

    pub fn note_queried(&mut self, providers: usize) {
        self.metrics.providers_queried = providers;
    }

    pub fn note_all_settled(&mut self) {
        if self.metrics.all_settled_at.is_none() {
            self.metrics.all_settled_at = Some(Instant::now());
        }
    }

    pub fn note_presented(&mut self) {
        if self.metrics.presented_at.is_none() {
            self.metrics.presented_at = Some(Instant::now());
        }
    }

    pub fn note_chosen(&mut self, service: &ServiceId) {
        self.metrics.chosen = Some(service.clone());
    }

    /// Terminal success. `None` if the session already completed.
    pub fn respond<Q, R>(&mut self, response: R) -> Option<SessionAction<Q, R>> {
        if self.completed {
            return None;
        }
        self.completed = true;
        if self.cancel.is_cancelled() {
            let error = RequestError::cancelled();
            self.log_finished(error.kind.as_str());
            return Some(SessionAction::Fail(error));
        }
        self.log_finished("success");
        Some(SessionAction::Respond(response))
    }

    /// Terminal failure. `None` if the session already completed.
    pub fn fail<Q, R>(&mut self, error: RequestError) -> Option<SessionAction<Q, R>> {
        if self.completed {
            return None;
        }
        self.completed = true;
        let error = if self.cancel.is_cancelled() {
            RequestError::cancelled()
        } else {
            error
        };
        self.log_finished(error.kind.as_str());
        Some(SessionAction::Fail(error))
    }

    fn log_finished(&self, outcome: &str) {
        let elapsed_ms = self.metrics.started.elapsed().as_millis() as u64;
        let settle_ms = self
            .metrics
            .all_settled_at
            .map(|at| at.duration_since(self.metrics.started).as_millis() as u64)
            .unwrap_or(0);
        tracing::info!(
            request = %self.request,
            caller = %self.caller.package,
            outcome,
            providers = self.metrics.providers_queried,
            ui_shown = self.metrics.presented_at.is_some(),
            chosen = self
                .metrics
                .chosen
                .as_ref()
                .map(ServiceId::as_str)
                .unwrap_or("-"),
            settle_ms,
            elapsed_ms,
            "request session finished"
        );
    }
}

// -- Collaborator seams --

/// Transport failure while showing the chooser.
#[derive(Debug, thiserror::Error)]
#[error("selector unavailable: {0}")]
pub struct SelectorError(pub String);

/// Transport failure while delivering the terminal client callback.
#[derive(Debug, thiserror::Error)]
#[error("client delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Fan-out side of the candidate phase. One call per admitted provider;
/// every failure mode comes back as a `ProviderReply` value.
#[async_trait]
pub trait ProviderTransport<Q, C>: Send + Sync {
    async fn invoke(&self, request: &RequestId, service: &ServiceId, query: Q)
    -> ProviderReply<C>;
}

/// The chooser surface. `present` replaces any chooser already showing for
/// this request.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn present(
        &self,
        request: &RequestId,
        providers: Vec<ProviderUiData>,
    ) -> Result<(), SelectorError>;
}

/// Terminal delivery to the requesting client. Called at most once per
/// session; a delivery failure is logged by the driver and absorbed.
#[async_trait]
pub trait ClientCallback<R>: Send {
    async fn on_response(&mut self, response: R) -> Result<(), DeliveryError>;
    async fn on_error(&mut self, error: RequestError) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::error::ErrorKind;

    fn core() -> (SessionCore, CancellationToken) {
        let token = CancellationToken::new();
        let core = SessionCore::new(
            RequestId::generate(),
            CallerInfo {
                package: "com.example.app".into(),
            },
            token.clone(),
        );
        (core, token)
    }

    #[test]
    fn respond_is_terminal_and_single() {
        let (mut core, _token) = core();
        let first: Option<SessionAction<(), u8>> = core.respond(7);
        assert!(matches!(first, Some(SessionAction::Respond(7))));
        assert!(core.is_completed());

        let second: Option<SessionAction<(), u8>> = core.respond(8);
        assert!(second.is_none());
        let error: Option<SessionAction<(), u8>> = core.fail(RequestError::unknown("late"));
        assert!(error.is_none());
    }

    #[test]
    fn fail_is_terminal_and_single() {
        let (mut core, _token) = core();
        let first: Option<SessionAction<(), u8>> =
            core.fail(RequestError::no_credential("nothing"));
        match first {
            Some(SessionAction::Fail(error)) => assert_eq!(error.kind, ErrorKind::NoCredential),
            other => panic!("expected Fail, got {other:?}"),
        }
        let second: Option<SessionAction<(), u8>> = core.respond(1);
        assert!(second.is_none());
    }

    #[test]
    fn cancellation_converts_success_to_cancellation_error() {
        let (mut core, token) = core();
        token.cancel();
        let action: Option<SessionAction<(), u8>> = core.respond(7);
        match action {
            Some(SessionAction::Fail(error)) => assert_eq!(error.kind, ErrorKind::ClientCanceled),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_overrides_flow_chosen_error() {
        let (mut core, token) = core();
        token.cancel();
        let action: Option<SessionAction<(), u8>> =
            core.fail(RequestError::no_credential("nothing"));
        match action {
            Some(SessionAction::Fail(error)) => assert_eq!(error.kind, ErrorKind::ClientCanceled),
            other => panic!("expected Fail, got {other:?}"),
        }
    }
}
