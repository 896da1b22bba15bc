//! Get flow: fan a credential query out to eligible providers, aggregate
//! candidate entries, drive the chooser, and funnel exactly one final
//! credential or error back to the client.
//!
//! Aggregation decisions run only after the reporting provider's update has
//! been applied, and never while any provider is still pending.

use crate::session::core::{EntryResult, ProviderReply, SessionAction, SessionCore, SessionEvent};
use crate::session::entries::{
    ActionEntryData, AuthenticationActionData, AuthenticationStatus, CandidateBundle,
    ChooserEntry, CredentialEntryData, EntryClass, GetProviderUi, ProviderUiData,
    RemoteEntryData, new_entry_key,
};
use crate::session::error::RequestError;
use crate::session::status::CandidateStatus;
use crate::session::types::{
    Credential, CredentialQuery, GetRequest, ProviderDescriptor, RequestId, ServiceId,
};

/// Per-provider query payload: the client's options filtered to what the
/// provider declared it can serve.
#[derive(Debug, Clone)]
pub struct GetQuery {
    pub options: Vec<CredentialQuery>,
}

pub type GetAction = SessionAction<GetQuery, Credential>;
pub type GetEvent = SessionEvent<CandidateBundle>;

/// One unlockable authentication entry with its staleness marker.
#[derive(Debug)]
struct AuthSlot {
    key: String,
    data: AuthenticationActionData,
    status: AuthenticationStatus,
}

/// One provider's slice of a get session.
#[derive(Debug)]
struct GetCandidate {
    service: ServiceId,
    status: CandidateStatus,
    last_error: Option<RequestError>,
    credentials: Vec<(String, CredentialEntryData)>,
    actions: Vec<(String, ActionEntryData)>,
    auth_entries: Vec<AuthSlot>,
    remote: Option<(String, RemoteEntryData)>,
}

impl GetCandidate {
    fn new(service: ServiceId) -> Self {
        Self {
            service,
            status: CandidateStatus::Pending,
            last_error: None,
            credentials: Vec::new(),
            actions: Vec::new(),
            auth_entries: Vec::new(),
            remote: None,
        }
    }

    /// Install a candidate bundle, replacing any previous content. The
    /// remote entry is honored only when this provider is the hybrid
    /// service.
    fn accept_bundle(&mut self, bundle: CandidateBundle, hybrid: Option<&ServiceId>) {
        self.credentials = bundle
            .credentials
            .into_iter()
            .map(|data| (new_entry_key(), data))
            .collect();
        self.actions = bundle
            .actions
            .into_iter()
            .map(|data| (new_entry_key(), data))
            .collect();
        self.auth_entries = bundle
            .auth_actions
            .into_iter()
            .map(|data| AuthSlot {
                key: new_entry_key(),
                data,
                status: AuthenticationStatus::Locked,
            })
            .collect();
        self.remote = match bundle.remote {
            Some(entry) if hybrid == Some(&self.service) => Some((new_entry_key(), entry)),
            Some(_) => {
                tracing::warn!(service = %self.service, "dropping remote entry from non-hybrid provider");
                None
            }
            None => None,
        };
        self.status = if self.has_no_content() {
            CandidateStatus::EmptyResponse
        } else {
            CandidateStatus::CredentialsReceived
        };
    }

    fn has_no_content(&self) -> bool {
        self.credentials.is_empty()
            && self.actions.is_empty()
            && self.auth_entries.is_empty()
            && self.remote.is_none()
    }

    fn fail(&mut self, error: RequestError) {
        self.last_error = Some(error);
        self.status = CandidateStatus::Failed;
    }

    fn died(&mut self) {
        self.status = CandidateStatus::ServiceDead;
        // A dead provider's content must neither reach the chooser nor
        // block the empty-auth collapse check.
        self.credentials.clear();
        self.actions.clear();
        self.auth_entries.clear();
        self.remote = None;
    }

    fn holds(&self, class: EntryClass, key: &str) -> bool {
        match class {
            EntryClass::Credential => self.credentials.iter().any(|(k, _)| k == key),
            EntryClass::Action => self.actions.iter().any(|(k, _)| k == key),
            EntryClass::Authentication => self.auth_entries.iter().any(|slot| slot.key == key),
            EntryClass::Remote => self.remote.as_ref().is_some_and(|(k, _)| k == key),
            EntryClass::Save => false,
        }
    }

    /// Chooser rows for this provider; `None` unless the status says there
    /// is something to show.
    fn chooser_data(&self) -> Option<GetProviderUi> {
        if !self.status.is_ui_invoking() {
            return None;
        }
        Some(GetProviderUi {
            service: self.service.clone(),
            credentials: self
                .credentials
                .iter()
                .map(|(key, data)| ChooserEntry {
                    class: EntryClass::Credential,
                    key: key.clone(),
                    display_name: data.display_name.clone(),
                    credential_type: Some(data.credential_type.clone()),
                    auth_status: None,
                    payload: data.payload.clone(),
                })
                .collect(),
            actions: self
                .actions
                .iter()
                .map(|(key, data)| ChooserEntry {
                    class: EntryClass::Action,
                    key: key.clone(),
                    display_name: data.display_name.clone(),
                    credential_type: None,
                    auth_status: None,
                    payload: data.payload.clone(),
                })
                .collect(),
            auth_actions: self
                .auth_entries
                .iter()
                .map(|slot| ChooserEntry {
                    class: EntryClass::Authentication,
                    key: slot.key.clone(),
                    display_name: slot.data.display_name.clone(),
                    credential_type: None,
                    auth_status: Some(slot.status),
                    payload: slot.data.payload.clone(),
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

    /// No credentials, no remote hand-off, and every auth entry known
    /// empty. Vacuously true for a provider with no content at all.
    fn contains_empty_auth_entries_only(&self) -> bool {
        self.credentials.is_empty()
            && self.remote.is_none()
            && self
                .auth_entries
                .iter()
                .all(|slot| slot.status != AuthenticationStatus::Locked)
    }

    /// Mark one auth entry freshly emptied; any previous most-recent marker
    /// on this provider demotes first.
    fn mark_auth_entry_emptied(&mut self, key: &str) {
        self.demote_emptied_markers();
        if let Some(slot) = self.auth_entries.iter_mut().find(|slot| slot.key == key) {
            slot.status = AuthenticationStatus::EmptiedMostRecent;
        }
    }

    fn demote_emptied_markers(&mut self) {
        for slot in &mut self.auth_entries {
            if slot.status == AuthenticationStatus::EmptiedMostRecent {
                slot.status = AuthenticationStatus::EmptiedLessRecent;
            }
        }
    }
}

/// Aggregation state machine for one get request.
pub struct GetSession {
    core: SessionCore,
    hybrid_service: Option<ServiceId>,
    candidates: Vec<GetCandidate>,
}

impl GetSession {
    /// Admit eligible providers and produce the initial fan-out. A request
    /// no registered provider can serve terminates immediately.
    pub fn new(
        mut core: SessionCore,
        request: &GetRequest,
        providers: &[ProviderDescriptor],
        hybrid_service: Option<ServiceId>,
    ) -> (Self, Vec<GetAction>) {
        let mut candidates = Vec::new();
        let mut actions = Vec::new();
        for descriptor in providers {
            let options: Vec<CredentialQuery> = request
                .options
                .iter()
                .filter(|option| descriptor.can_serve(&option.credential_type))
                .cloned()
                .collect();
            if options.is_empty() {
                continue;
            }
            candidates.push(GetCandidate::new(descriptor.service.clone()));
            actions.push(SessionAction::Invoke {
                service: descriptor.service.clone(),
                query: GetQuery { options },
            });
        }
        core.note_queried(candidates.len());
        let mut session = Self {
            core,
            hybrid_service,
            candidates,
        };
        if session.candidates.is_empty() {
            let message = format!(
                "no provider for requested types: {}",
                request.unique_types().join(", ")
            );
            actions.extend(session.core.fail(RequestError::no_credential(message)));
        }
        (session, actions)
    }

    pub fn request(&self) -> &RequestId {
        self.core.request()
    }

    pub fn handle(&mut self, event: GetEvent) -> Vec<GetAction> {
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
                .fail(RequestError::no_credential("no credentials available"))
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
        reply: ProviderReply<CandidateBundle>,
    ) -> Vec<GetAction> {
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
            // Death applies even after the provider settled: its entries
            // must leave the chooser.
            ProviderReply::ServiceDied => {
                if candidate.status == CandidateStatus::ServiceDead {
                    return Vec::new();
                }
                tracing::warn!(%service, "provider service died");
                candidate.died();
            }
        }
        self.after_status_change(&service)
    }

    /// Aggregation step. Runs only after the reporting provider's update is
    /// applied, and commits nothing while any provider is pending.
    fn after_status_change(&mut self, service: &ServiceId) -> Vec<GetAction> {
        let status = self
            .candidates
            .iter()
            .find(|candidate| candidate.service == *service)
            .map(|candidate| candidate.status);
        if status == Some(CandidateStatus::NoCredentialsFromAuthEntry) {
            return self.on_empty_authentication_selection(service);
        }
        if self.any_provider_pending() {
            return Vec::new();
        }
        self.core.note_all_settled();
        if self.ui_invocation_needed() {
            self.present_or_fail()
        } else {
            self.core
                .fail(RequestError::no_credential("no credentials available"))
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
    ) -> Vec<GetAction> {
        let Some(class) = EntryClass::parse(&class) else {
            tracing::error!(%service, class, "unknown entry class from selector");
            return self.fail_invalid_state();
        };
        match class {
            EntryClass::Credential | EntryClass::Action | EntryClass::Remote => {
                self.on_final_entry_selected(service, class, key, result)
            }
            EntryClass::Authentication => self.on_authentication_selected(service, key, result),
            EntryClass::Save => {
                tracing::error!(%service, "save entry selected in a get session");
                self.fail_invalid_state()
            }
        }
    }

    /// Credential, action, and remote entries all resolve to a final
    /// response (or a terminal error) in one step.
    fn on_final_entry_selected(
        &mut self,
        service: ServiceId,
        class: EntryClass,
        key: String,
        result: EntryResult,
    ) -> Vec<GetAction> {
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
        match result.credential {
            Some(credential) => {
                self.candidates[index].status = CandidateStatus::Complete;
                self.core.note_chosen(&service);
                self.core.respond(credential).into_iter().collect()
            }
            None => self
                .core
                .fail(RequestError::no_credential("invalid response from provider"))
                .into_iter()
                .collect(),
        }
    }

    fn on_authentication_selected(
        &mut self,
        service: ServiceId,
        key: String,
        result: EntryResult,
    ) -> Vec<GetAction> {
        let Some(index) = self
            .candidates
            .iter()
            .position(|candidate| candidate.service == service)
        else {
            tracing::error!(%service, "selection for provider outside this session");
            return self.fail_invalid_state();
        };
        if !self.candidates[index].holds(EntryClass::Authentication, &key) {
            tracing::error!(%service, key, "unlock selection with unknown entry key");
            return self.fail_invalid_state();
        }
        if let Some(error) = result.error {
            return self.core.fail(error).into_iter().collect();
        }
        if result.canceled {
            // Backing out of an unlock returns the user to the chooser.
            return self.present_or_fail();
        }
        match result.candidates {
            Some(bundle) if !bundle.is_empty() => {
                let hybrid = self.hybrid_service.clone();
                self.candidates[index].accept_bundle(bundle, hybrid.as_ref());
                self.after_status_change(&service)
            }
            _ => {
                self.candidates[index].mark_auth_entry_emptied(&key);
                self.candidates[index].status = CandidateStatus::NoCredentialsFromAuthEntry;
                self.after_status_change(&service)
            }
        }
    }

    /// An unlocked authentication entry came back empty: demote the other
    /// providers' freshness markers, refresh the chooser, then collapse to
    /// the no-credential error once every provider shows empty auth entries
    /// only.
    fn on_empty_authentication_selection(&mut self, reporting: &ServiceId) -> Vec<GetAction> {
        for candidate in &mut self.candidates {
            if candidate.service != *reporting {
                candidate.demote_emptied_markers();
            }
        }
        let mut actions = self.present_or_fail();
        if self
            .candidates
            .iter()
            .all(GetCandidate::contains_empty_auth_entries_only)
        {
            actions.extend(
                self.core
                    .fail(RequestError::no_credential("no credentials available")),
            );
        }
        actions
    }

    fn present_or_fail(&mut self) -> Vec<GetAction> {
        let data: Vec<ProviderUiData> = self
            .candidates
            .iter()
            .filter_map(GetCandidate::chooser_data)
            .map(ProviderUiData::Get)
            .collect();
        if data.is_empty() {
            return self
                .core
                .fail(RequestError::no_credential("no credentials available"))
                .into_iter()
                .collect();
        }
        self.core.note_presented();
        vec![SessionAction::Present(data)]
    }

    fn fail_invalid_state(&mut self) -> Vec<GetAction> {
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
