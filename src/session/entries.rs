//! Entry model: what providers hand back during the candidate phase and
//! what the chooser is asked to display.
//!
//! Provider-sent entries carry an opaque payload. When the user picks an
//! entry the selector echoes that payload back with the selection, carrying
//! the outcome of the provider's own flow (unlock result, authorized
//! credential, save confirmation).

use serde::{Deserialize, Serialize};

use crate::session::types::ServiceId;

/// Class tag of a chooser entry. Selection dispatch branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    Credential,
    Action,
    Authentication,
    Save,
    Remote,
}

impl EntryClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Action => "action",
            Self::Authentication => "authentication",
            Self::Save => "save",
            Self::Remote => "remote",
        }
    }

    /// Parse a wire tag; `None` is the unknown-class error path.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "credential" => Some(Self::Credential),
            "action" => Some(Self::Action),
            "authentication" => Some(Self::Authentication),
            "save" => Some(Self::Save),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// Staleness of an authentication (locked-provider) entry.
///
/// `Locked` until the user unlocks it. An unlock that reveals nothing marks
/// the entry `EmptiedMostRecent`; when another provider's entry is emptied
/// later, earlier markers demote to `EmptiedLessRecent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationStatus {
    Locked,
    EmptiedLessRecent,
    EmptiedMostRecent,
}

// -- Provider-sent entry data --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntryData {
    pub credential_type: String,
    pub display_name: String,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntryData {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// An entry representing a locked provider that may hold credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationActionData {
    pub display_name: String,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveEntryData {
    pub display_name: String,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// Hand-off to a provider on another surface. Only honored from the
/// configured hybrid service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

// -- Per-provider reply bundles --

/// Everything a provider returns for a get query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBundle {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialEntryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionEntryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_actions: Vec<AuthenticationActionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteEntryData>,
}

impl CandidateBundle {
    /// An empty bundle settles the provider as `EmptyResponse`.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
            && self.actions.is_empty()
            && self.auth_actions.is_empty()
            && self.remote.is_none()
    }
}

/// Everything a provider returns for a create query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBundle {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub save_entries: Vec<SaveEntryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteEntryData>,
}

impl CreateBundle {
    pub fn is_empty(&self) -> bool {
        self.save_entries.is_empty() && self.remote.is_none()
    }
}

// -- Chooser-facing data --

/// One selectable row, keyed so the selection can be routed back to the
/// owning provider's entry maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChooserEntry {
    pub class: EntryClass,
    pub key: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_status: Option<AuthenticationStatus>,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProviderUi {
    pub service: ServiceId,
    pub credentials: Vec<ChooserEntry>,
    pub actions: Vec<ChooserEntry>,
    pub auth_actions: Vec<ChooserEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<ChooserEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProviderUi {
    pub service: ServiceId,
    pub save_entries: Vec<ChooserEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<ChooserEntry>,
}

/// Per-provider chooser data, one variant per flow that presents UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum ProviderUiData {
    Get(GetProviderUi),
    Create(CreateProviderUi),
}

impl ProviderUiData {
    pub fn service(&self) -> &ServiceId {
        match self {
            Self::Get(data) => &data.service,
            Self::Create(data) => &data.service,
        }
    }
}

/// Fresh UI entry key, unique per provider session.
pub(crate) fn new_entry_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
