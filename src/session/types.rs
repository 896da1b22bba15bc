//! Identity and payload types shared by the session core, the wire
//! protocol, and the companion clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a credential provider service.
///
/// Provider identity is compared by value everywhere it matters: registry
/// keys, pending-call routing, death matching. The string form is the
/// provider-chosen service name, e.g. `com.example.vault/Passkeys`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one client request and the session arbitrating it.
///
/// Generated by the daemon when the request is accepted and echoed on every
/// related message thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the calling application, as reported by the client
/// connection. Nothing at this boundary verifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub package: String,
}

/// A registered provider as seen at session admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub service: ServiceId,
    /// Credential types the provider can serve or store.
    pub capabilities: Vec<String>,
}

impl ProviderDescriptor {
    pub fn can_serve(&self, credential_type: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == credential_type)
    }
}

/// One requested credential type plus its opaque per-type query data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialQuery {
    pub credential_type: String,
    #[serde(with = "serde_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub query_data: Vec<u8>,
}

/// Client request to retrieve a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub options: Vec<CredentialQuery>,
}

impl GetRequest {
    /// Requested types with duplicates removed, in first-seen order.
    ///
    /// Clients may list the same type twice with different query data;
    /// admission and reporting both work on the deduplicated set.
    pub fn unique_types(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for option in &self.options {
            if !seen.contains(&option.credential_type.as_str()) {
                seen.push(&option.credential_type);
            }
        }
        seen
    }
}

/// Client request to store a new credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub credential_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A credential delivered to the client at the end of a get flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub credential_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Provider acknowledgement delivered to the client at the end of a
/// create flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationReceipt {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
