//! Clear flow: fan the clear-state request out to every registered
//! provider. No chooser is ever shown; once all providers settle the client
//! succeeds if any one of them cleared state, and gets a single aggregate
//! error otherwise.

use crate::session::core::{ProviderReply, SessionAction, SessionCore, SessionEvent};
use crate::session::error::RequestError;
use crate::session::status::CandidateStatus;
use crate::session::types::{ProviderDescriptor, RequestId, ServiceId};

/// The clear query carries no payload; providers clear whatever state they
/// hold for the calling application.
#[derive(Debug, Clone, Copy)]
pub struct ClearQuery;

pub type ClearAction = SessionAction<ClearQuery, ()>;
pub type ClearEvent = SessionEvent<()>;

#[derive(Debug)]
struct ClearCandidate {
    service: ServiceId,
    status: CandidateStatus,
    last_error: Option<RequestError>,
    cleared: bool,
}

impl ClearCandidate {
    fn new(service: ServiceId) -> Self {
        Self {
            service,
            status: CandidateStatus::Pending,
            last_error: None,
            cleared: false,
        }
    }
}

/// Aggregation state machine for one clear request.
pub struct ClearSession {
    core: SessionCore,
    candidates: Vec<ClearCandidate>,
}

impl ClearSession {
    /// Clear fans out to every registered provider; there is no capability
    /// filter because any provider may hold state for the caller.
    pub fn new(
        mut core: SessionCore,
        providers: &[ProviderDescriptor],
    ) -> (Self, Vec<ClearAction>) {
        let mut candidates = Vec::new();
        let mut actions = Vec::new();
        for descriptor in providers {
            candidates.push(ClearCandidate::new(descriptor.service.clone()));
            actions.push(SessionAction::Invoke {
                service: descriptor.service.clone(),
                query: ClearQuery,
            });
        }
        core.note_queried(candidates.len());
        let mut session = Self { core, candidates };
        if session.candidates.is_empty() {
            actions.extend(
                session
                    .core
                    .fail(RequestError::clear_failed("no providers available")),
            );
        }
        (session, actions)
    }

    pub fn request(&self) -> &RequestId {
        self.core.request()
    }

    pub fn handle(&mut self, event: ClearEvent) -> Vec<ClearAction> {
        if self.core.is_completed() {
            tracing::debug!(request = %self.core.request(), "event after completion ignored");
            return Vec::new();
        }
        match event {
            SessionEvent::ProviderReply { service, reply } => {
                self.on_provider_reply(service, reply)
            }
            SessionEvent::Selection { service, .. } => {
                tracing::warn!(%service, "selection event in a clear session ignored");
                Vec::new()
            }
            SessionEvent::ChooserDismissed { .. } | SessionEvent::ChooserUnavailable => {
                // Clear never shows a chooser.
                Vec::new()
            }
            SessionEvent::Cancelled => self
                .core
                .fail(RequestError::cancelled())
                .into_iter()
                .collect(),
        }
    }

    fn on_provider_reply(
        &mut self,
        service: ServiceId,
        reply: ProviderReply<()>,
    ) -> Vec<ClearAction> {
        let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|candidate| candidate.service == service)
        else {
            // Death notices are broadcast to every session; the rest is
            // protocol misuse.
            if matches!(reply, ProviderReply::ServiceDied) {
                tracing::debug!(request = %self.core.request(), %service, "death of provider outside this session");
            } else {
                tracing::warn!(request = %self.core.request(), %service, "reply from provider outside this session");
            }
            return Vec::new();
        };
        if candidate.status.is_settled() {
            if matches!(reply, ProviderReply::ServiceDied) {
                return Vec::new();
            }
            tracing::warn!(%service, "late provider reply ignored");
            return Vec::new();
        }
        match reply {
            ProviderReply::Candidates(()) => {
                candidate.cleared = true;
                candidate.status = CandidateStatus::Complete;
            }
            ProviderReply::Failure(error) => {
                tracing::debug!(%service, kind = error.kind.as_str(), "provider failed to clear state");
                candidate.last_error = Some(error);
                candidate.status = CandidateStatus::Failed;
            }
            ProviderReply::ServiceDied => {
                tracing::warn!(%service, "provider service died");
                candidate.status = CandidateStatus::ServiceDead;
            }
        }
        self.process_responses()
    }

    /// Commit once every provider has settled: the first provider that
    /// cleared state wins, otherwise one aggregate failure.
    fn process_responses(&mut self) -> Vec<ClearAction> {
        if self
            .candidates
            .iter()
            .any(|candidate| !candidate.status.is_settled())
        {
            return Vec::new();
        }
        self.core.note_all_settled();
        let winner = self
            .candidates
            .iter()
            .find(|candidate| candidate.cleared)
            .map(|candidate| candidate.service.clone());
        match winner {
            Some(service) => {
                self.core.note_chosen(&service);
                self.core.respond(()).into_iter().collect()
            }
            None => self
                .core
                .fail(RequestError::clear_failed("all providers failed"))
                .into_iter()
                .collect(),
        }
    }
}
