//! Candidate status space for provider sessions.
//!
//! A provider starts `Pending` and settles into exactly one status per remote
//! reply or terminal event. The three predicate families (ui-invoking,
//! terminating, completion) partition the settled statuses; the flow state
//! machines branch only on these predicates, never on raw variants.

/// Status of a single provider's candidate phase within a request session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateStatus {
    /// Query dispatched, no reply yet. The only status that blocks commits.
    Pending,
    /// Get flow: candidate entries received, at least one thing to show.
    CredentialsReceived,
    /// Create flow: save entries received, at least one thing to show.
    SaveEntriesReceived,
    /// Reply received but carrying nothing to show.
    EmptyResponse,
    /// Get flow: an unlocked authentication entry came back empty.
    NoCredentialsFromAuthEntry,
    /// Final response delivered through this provider.
    Complete,
    /// Remote call failed; the captured error lives on the candidate.
    Failed,
    /// The provider's connection died while the session was live.
    ServiceDead,
}

impl CandidateStatus {
    /// Statuses that contribute content to the chooser.
    pub fn is_ui_invoking(self) -> bool {
        matches!(
            self,
            Self::CredentialsReceived | Self::SaveEntriesReceived | Self::NoCredentialsFromAuthEntry
        )
    }

    /// Statuses that end a provider's participation without content.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::Failed | Self::ServiceDead)
    }

    /// Statuses where the provider finished cleanly with nothing to choose.
    pub fn is_completion(self) -> bool {
        matches!(self, Self::Complete | Self::EmptyResponse)
    }

    /// A settled provider no longer blocks aggregation.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}
