//! Create flow: ask each capable provider how it could store a new
//! credential, present the save options, and deliver the chosen provider's
//! confirmation to the client.

use crate::session::core::{EntryResult, ProviderReply, SessionAction, SessionCore, SessionEvent};
use crate::session::entries::{
    ChooserEntry, CreateBundle, CreateProviderUi, EntryClass, ProviderUiData, RemoteEntryData,
    SaveEntryData, new_entry_key,
};
use crate::session::error::RequestError;
use crate::session::status::CandidateStatus;
use crate::session::types::{
    CreateRequest, CreationReceipt, ProviderDescriptor, RequestId, ServiceId,
};

/// Per-provider query payload for the create candidate phase.
#[derive(Debug, Clone)]
pub struct CreateQuery {
    pub credential_type: String,
    pub data: Vec<u8>,
}

pub type CreateAction = SessionAction<CreateQuery, CreationReceipt>;
pub type CreateEvent = SessionEvent<CreateBundle>;

/// One provider's slice of a create session.
#[derive(Debug)]
struct CreateCandidate {
    service: ServiceId,
    status: CandidateStatus,
    last_error: Option<RequestError>,
    save_entries: Vec<(String, SaveEntryData)>,
    remote: Option<(String, RemoteEntryData)>,
}

impl CreateCandidate {
    fn new(service: ServiceId) -> Self {
        Self {
            service,
            status: CandidateStatus::Pending,
            last_error: None,
            save_entries: Vec::new(),
            remote: None,
        }
    }

    /// Install a save-option bundle. The remote entry is honored only when
    /// this provider is the hybrid service.
    fn accept_bundle(&mut self, bundle: CreateBundle, hybrid: Option<&ServiceId>) {
        self.save_entries = bundle
            .save_entries
            .into_iter()
            .map(|data| (new_entry_key(), data))
            .collect();
        self.remote = match bundle.remote {
            Some(entry) if hybrid == Some(&self.service) => Some((new_entry_key(), entry)),
            Some(_) => {
                tracing::warn!(service = %self.service, "dropping remote entry from non-hybrid provider");
                None
            }
            None => None,
        };
        self.status = if self.save_entries.is_empty() && self.remote.is_none() {
            CandidateStatus::EmptyResponse
        } else {
            CandidateStatus::SaveEntriesReceived
        };
    }

    fn fail(&mut self, error: RequestError) {
        self.last_error = Some(error);
        self.status = CandidateStatus::Failed;
    }

    fn died(&mut self) {
        self.status = CandidateStatus::ServiceDead;
        self.save_entries.clear();
        self.remote = None;
    }

    fn holds(&self, class: EntryClass, key: &str) -> bool {
        match class {
            EntryClass::Save => self.save_entries.iter().any(|(k, _)| k == key),
            EntryClass::Remote => self.remote.as_ref().is_some_and(|(k, _)| k == key),
            _ => false,
        }
    }

    fn chooser_data(&self) -> Option<CreateProviderUi> {
        if !self.status.is_ui_invoking() {
            return None;
        }
        Some(CreateProviderUi {
            service: self.service.clone(),
            save_entries: self
                .save_entries
                .iter()
                .map(|(key, data)| ChooserEntry {
                    class: EntryClass::Save,
                    key: key.clone(),
                    display_name: data.display_name.clone(),
                    credential_type: None,
                    auth_status: None,
                    payload: data.payload.clone(),
                })
                .collect(),
            remote: self.remote.as_ref().map(|(key, data)| ChooserEntry {
                class: EntryClass::Remote,
                key: key.clone(),
                display_name: data
                    .display_name
                    .clone()
                    .unwrap_or_else(|| "another device".into()),
                credential_type: None,
                auth_status: None,
                payload: data.payload.clone(),
            }),
        })
    }
}

/// Aggregation state machine for one create request.
pub struct CreateSession {
    core: SessionCore,
    hybrid_service: Option<ServiceId>,
    candidates: Vec<CreateCandidate>,
}

impl CreateSession {
    /// Admit providers that can store the requested type and produce the
    /// initial fan-out.
    pub fn new(
        mut core: SessionCore,
        request: &CreateRequest,
        providers: &[ProviderDescriptor],
        hybrid_service: Option<ServiceId>,
    ) -> (Self, Vec<CreateAction>) {
        let mut candidates = Vec::new();
        let mut actions = Vec::new();
        for descriptor in providers {
            if !descriptor.can_serve(&request.credential_type) {
                continue;
            }
            candidates.push(CreateCandidate::new(descriptor.service.clone()));
            actions.push(SessionAction::Invoke {
                service: descriptor.service.clone(),
                query: CreateQuery {
                    credential_type: request.credential_type.clone(),
                    data: request.data.clone(),
                },
            });
        }
        core.note_queried(candidates.len());
        let mut session = Self {
            core,
            hybrid_service,
            candidates,
        };
        if session.candidates.is_empty() {
            actions.extend(
                session
                    .core
                    .fail(RequestError::no_create_options("no create options available")),
            );
        }
        (session, actions)
    }

    pub fn request(&self) -> &RequestId {
        self.core.request()
    }

    pub fn handle(&mut self, event: CreateEvent) -> Vec<CreateAction> {
        if self.core.is_completed() {
            tracing::debug!(request = %self.core.request(), "event after completion ignored");
            return Vec::new();
        }
        match event {
            SessionEvent::ProviderReply { service, reply } => {
                self.on_provider_reply(service, reply)
            }
            SessionEvent::Selection {
                service,
                class,
                key,
                result,
            } => self.on_selection(service, class, key, result),
            SessionEvent::ChooserDismissed { by_user } => {
                if !self.core.ui_shown() {
                    tracing::debug!(request = %self.core.request(), "dismissal before any chooser ignored");
                    return Vec::new();
                }
                let error = if by_user {
                    RequestError::user_canceled()
                } else {
                    RequestError::interrupted()
                };
                self.core.fail(error).into_iter().collect()
            }
            SessionEvent::ChooserUnavailable => self
                .core
                .fail(RequestError::no_create_options("no create options available"))
                .into_iter()
                .collect(),
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
        reply: ProviderReply<CreateBundle>,
    ) -> Vec<CreateAction> {
        let hybrid = self.hybrid_service.clone();
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
        match reply {
            ProviderReply::Candidates(bundle) => {
                if candidate.status.is_settled() {
                    tracing::warn!(%service, "duplicate provider reply ignored");
                    return Vec::new();
                }
                candidate.accept_bundle(bundle, hybrid.as_ref());
            }
            ProviderReply::Failure(error) => {
                if candidate.status.is_settled() {
                    tracing::warn!(%service, "late provider failure ignored");
                    return Vec::new();
                }
                tracing::debug!(%service, kind = error.kind.as_str(), "provider failed the candidate phase");
                candidate.fail(error);
            }
            // Death applies even after the provider settled: its save
            // options must leave the chooser.
            ProviderReply::ServiceDied => {
                if candidate.status == CandidateStatus::ServiceDead {
                    return Vec::new();
                }
                tracing::warn!(%service, "provider service died");
                candidate.died();
            }
        }
        self.after_status_change()
    }

    fn after_status_change(&mut self) -> Vec<CreateAction> {
        if self.any_provider_pending() {
            return Vec::new();
        }
        self.core.note_all_settled();
        if self.ui_invocation_needed() {
            self.present_or_fail()
        } else {
            self.core
                .fail(RequestError::no_create_options("no create options available"))
                .into_iter()
                .collect()
        }
    }

    fn on_selection(
        &mut self,
        service: ServiceId,
        class: String,
        key: String,
        result: EntryResult,
    ) -> Vec<CreateAction> {
        let Some(class) = EntryClass::parse(&class) else {
            tracing::error!(%service, class, "unknown entry class from selector");
            return self.fail_invalid_state();
        };
        match class {
            EntryClass::Save | EntryClass::Remote => {
                self.on_save_entry_selected(service, class, key, result)
            }
            EntryClass::Credential | EntryClass::Action | EntryClass::Authentication => {
                tracing::error!(%service, class = class.as_str(), "get entry selected in a create session");
                self.fail_invalid_state()
            }
        }
    }

    /// Save and remote entries both resolve to the provider's confirmation:
    /// an embedded provider error wins, then the user-cancel sentinel, then
    /// a receipt; anything else means no usable create option.
    fn on_save_entry_selected(
        &mut self,
        service: ServiceId,
        class: EntryClass,
        key: String,
        result: EntryResult,
    ) -> Vec<CreateAction> {
        let Some(index) = self
            .candidates
            .iter()
            .position(|candidate| candidate.service == service)
        else {
            tracing::error!(%service, "selection for provider outside this session");
            return self.fail_invalid_state();
        };
        if !self.candidates[index].holds(class, &key) {
            tracing::error!(%service, key, "selection with unknown entry key");
            return self.fail_invalid_state();
        }
        if let Some(error) = result.error {
            return self.core.fail(error).into_iter().collect();
        }
        if result.canceled {
            return self
                .core
                .fail(RequestError::user_canceled())
                .into_iter()
                .collect();
        }
        match result.receipt {
            Some(receipt) => {
                self.candidates[index].status = CandidateStatus::Complete;
                self.core.note_chosen(&service);
                self.core.respond(receipt).into_iter().collect()
            }
            None => self
                .core
                .fail(RequestError::no_create_options("no create options available"))
                .into_iter()
                .collect(),
        }
    }

    fn present_or_fail(&mut self) -> Vec<CreateAction> {
        let data: Vec<ProviderUiData> = self
            .candidates
            .iter()
            .filter_map(CreateCandidate::chooser_data)
            .map(ProviderUiData::Create)
            .collect();
        if data.is_empty() {
            return self
                .core
                .fail(RequestError::no_create_options("no create options available"))
                .into_iter()
                .collect();
        }
        self.core.note_presented();
        vec![SessionAction::Present(data)]
    }

    fn fail_invalid_state(&mut self) -> Vec<CreateAction> {
        self.core
            .fail(RequestError::unknown("unknown entry selected"))
            .into_iter()
            .collect()
    }

    fn any_provider_pending(&self) -> bool {
        self.candidates
            .iter()
            .any(|candidate| !candidate.status.is_settled())
    }

    fn ui_invocation_needed(&self) -> bool {
        self.candidates
            .iter()
            .any(|candidate| candidate.status.is_ui_invoking())
    }
}
