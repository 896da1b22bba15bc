//! Wire protocol message types for daemon IPC.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and `id`
//! fields. Requests carry a client-chosen `id` that the daemon echoes in its
//! reply; unsolicited pushes carry `id: 0`.

use serde::{Deserialize, Serialize};

use crate::session::entries::{CandidateBundle, CreateBundle, ProviderUiData};
use crate::session::types::{
    Credential, CredentialQuery, CreationReceipt, ProviderDescriptor, RequestId, ServiceId,
};

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    #[serde(rename = "hello")]
    Hello { id: u32, version: u32, role: Role },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Provider registration --
    #[serde(rename = "register_provider")]
    RegisterProvider {
        id: u32,
        service: ServiceId,
        capabilities: Vec<String>,
    },

    #[serde(rename = "deregister_provider")]
    DeregisterProvider { id: u32, service: ServiceId },

    // -- Client requests --
    #[serde(rename = "get_credentials")]
    GetCredentials {
        id: u32,
        caller: String,
        options: Vec<CredentialQuery>,
    },

    #[serde(rename = "create_credential")]
    CreateCredential {
        id: u32,
        caller: String,
        credential_type: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "clear_credentials")]
    ClearCredentials { id: u32, caller: String },

    #[serde(rename = "cancel_request")]
    CancelRequest { id: u32, request: RequestId },

    // -- Query --
    #[serde(rename = "list_providers")]
    ListProviders { id: u32 },

    // -- Candidate phase (daemon → provider) --
    #[serde(rename = "begin_get")]
    BeginGet {
        id: u32,
        request: RequestId,
        options: Vec<CredentialQuery>,
    },

    #[serde(rename = "begin_create")]
    BeginCreate {
        id: u32,
        request: RequestId,
        credential_type: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    #[serde(rename = "begin_clear")]
    BeginClear { id: u32, request: RequestId },

    /// The session is over; the provider may drop per-request state.
    #[serde(rename = "request_ended")]
    RequestEnded { id: u32, request: RequestId },

    // -- Candidate phase (provider → daemon) --
    #[serde(rename = "query_result")]
    QueryResult {
        id: u32,
        request: RequestId,
        service: ServiceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        get_entries: Option<CandidateBundle>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create_entries: Option<CreateBundle>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Chooser (daemon → selector) --
    #[serde(rename = "present_chooser")]
    PresentChooser {
        id: u32,
        request: RequestId,
        providers: Vec<ProviderUiData>,
    },

    #[serde(rename = "dismiss_chooser")]
    DismissChooser { id: u32, request: RequestId },

    // -- Chooser (selector → daemon) --
    #[serde(rename = "entry_selected")]
    EntrySelected {
        id: u32,
        request: RequestId,
        service: ServiceId,
        entry_class: String,
        entry_key: String,
        /// The user backed out of the provider flow behind the entry.
        #[serde(default)]
        canceled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<Credential>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidates: Option<CandidateBundle>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<CreationReceipt>,
    },

    #[serde(rename = "chooser_closed")]
    ChooserClosed {
        id: u32,
        request: RequestId,
        by_user: bool,
    },

    // -- Terminal callback (daemon → client) --
    #[serde(rename = "request_complete")]
    RequestComplete {
        id: u32,
        request: RequestId,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<Credential>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<CreationReceipt>,
    },

    // -- Generic response --
    #[serde(rename = "response")]
    Response {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Request id assigned to an accepted get/create/clear submission.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<RequestId>,
        // -- ListProviders descriptors --
        #[serde(default, skip_serializing_if = "Option::is_none")]
        providers: Option<Vec<ProviderDescriptor>>,
    },
}

/// Peer role in the handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Provider,
    Selector,
}

/// Response status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Protocol version for v1.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (4 MiB). Credential payloads are small; anything
/// larger than this is a broken peer.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used by the daemon as a fallback when [`Message`] deserialization
/// fails (e.g., unknown `type` tag), so the error response can echo the
/// request `id`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    /// Consumed by serde for structural matching; not read by daemon code.
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub msg_type: String,
    pub id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::entries::{CredentialEntryData, GetProviderUi};

    fn round_trip(msg: &Message) -> Message {
        let encoded = rmp_serde::to_vec_named(msg).unwrap();
        rmp_serde::from_slice(&encoded).unwrap()
    }

    #[test]
    fn hello_round_trip() {
        let msg = Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role: Role::Provider,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn hello_ack_error_round_trip() {
        let msg = Message::HelloAck {
            id: 0,
            status: Status::Error,
            error: Some("version_mismatch".into()),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn register_provider_round_trip() {
        let msg = Message::RegisterProvider {
            id: 1,
            service: ServiceId::new("com.example.vault"),
            capabilities: vec!["passkey".into(), "password".into()],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn get_credentials_round_trip() {
        let msg = Message::GetCredentials {
            id: 2,
            caller: "com.example.app".into(),
            options: vec![CredentialQuery {
                credential_type: "passkey".into(),
                query_data: b"challenge".to_vec(),
            }],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn create_credential_binary_fidelity() {
        let data: Vec<u8> = (0..=255).collect();
        let msg = Message::CreateCredential {
            id: 3,
            caller: "com.example.app".into(),
            credential_type: "passkey".into(),
            data: data.clone(),
        };
        match round_trip(&msg) {
            Message::CreateCredential { data: decoded, .. } => assert_eq!(decoded, data),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn query_result_minimal_fields_default() {
        // A clear provider sends only {request, service, cleared}; the
        // bundle fields must default to None.
        #[derive(serde::Serialize)]
        struct Minimal {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            request: &'static str,
            service: &'static str,
            cleared: bool,
        }
        let minimal = Minimal {
            msg_type: "query_result",
            id: 5,
            request: "req-1",
            service: "com.example.vault",
            cleared: true,
        };
        let encoded = rmp_serde::to_vec_named(&minimal).unwrap();
        let decoded: Message = rmp_serde::from_slice(&encoded).unwrap();
        match decoded {
            Message::QueryResult {
                get_entries,
                create_entries,
                cleared,
                error,
                ..
            } => {
                assert!(get_entries.is_none());
                assert!(create_entries.is_none());
                assert_eq!(cleared, Some(true));
                assert!(error.is_none());
            }
            _ => panic!("expected QueryResult"),
        }
    }

    #[test]
    fn query_result_with_entries_round_trip() {
        let msg = Message::QueryResult {
            id: 6,
            request: RequestId::new("req-1"),
            service: ServiceId::new("com.example.vault"),
            get_entries: Some(CandidateBundle {
                credentials: vec![CredentialEntryData {
                    credential_type: "passkey".into(),
                    display_name: "home".into(),
                    payload: b"blob".to_vec(),
                }],
                ..Default::default()
            }),
            create_entries: None,
            cleared: None,
            error: None,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn present_chooser_round_trip() {
        let msg = Message::PresentChooser {
            id: 0,
            request: RequestId::new("req-1"),
            providers: vec![ProviderUiData::Get(GetProviderUi {
                service: ServiceId::new("com.example.vault"),
                credentials: vec![],
                actions: vec![],
                auth_actions: vec![],
                remote: None,
            })],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn entry_selected_omitted_flags_default() {
        // A plain selection carries no canceled/error/payload fields.
        #[derive(serde::Serialize)]
        struct Plain {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            request: &'static str,
            service: &'static str,
            entry_class: &'static str,
            entry_key: &'static str,
        }
        let plain = Plain {
            msg_type: "entry_selected",
            id: 7,
            request: "req-1",
            service: "com.example.vault",
            entry_class: "credential",
            entry_key: "k1",
        };
        let encoded = rmp_serde::to_vec_named(&plain).unwrap();
        let decoded: Message = rmp_serde::from_slice(&encoded).unwrap();
        match decoded {
            Message::EntrySelected {
                canceled,
                error_type,
                credential,
                candidates,
                receipt,
                ..
            } => {
                assert!(!canceled);
                assert!(error_type.is_none());
                assert!(credential.is_none());
                assert!(candidates.is_none());
                assert!(receipt.is_none());
            }
            _ => panic!("expected EntrySelected"),
        }
    }

    #[test]
    fn entry_selected_with_credential_round_trip() {
        let msg = Message::EntrySelected {
            id: 8,
            request: RequestId::new("req-1"),
            service: ServiceId::new("com.example.vault"),
            entry_class: "credential".into(),
            entry_key: "k1".into(),
            canceled: false,
            error_type: None,
            error_message: None,
            credential: Some(Credential {
                credential_type: "passkey".into(),
                data: b"assertion".to_vec(),
            }),
            candidates: None,
            receipt: None,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn request_complete_error_round_trip() {
        let msg = Message::RequestComplete {
            id: 0,
            request: RequestId::new("req-1"),
            status: Status::Error,
            error_type: Some("user_canceled".into()),
            error_message: Some("user cancelled the selector".into()),
            credential: None,
            receipt: None,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn response_with_providers_round_trip() {
        let msg = Message::Response {
            id: 9,
            status: Status::Ok,
            error: None,
            request: None,
            providers: Some(vec![ProviderDescriptor {
                service: ServiceId::new("com.example.vault"),
                capabilities: vec!["passkey".into()],
            }]),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn response_error_round_trip() {
        let msg = Message::Response {
            id: 1,
            status: Status::Error,
            error: Some("service_already_registered".into()),
            request: None,
            providers: None,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn begin_get_round_trip() {
        let msg = Message::BeginGet {
            id: 0,
            request: RequestId::new("req-1"),
            options: vec![CredentialQuery {
                credential_type: "password".into(),
                query_data: vec![],
            }],
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn cancel_request_round_trip() {
        let msg = Message::CancelRequest {
            id: 10,
            request: RequestId::new("req-1"),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn chooser_closed_round_trip() {
        let msg = Message::ChooserClosed {
            id: 11,
            request: RequestId::new("req-1"),
            by_user: true,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn role_serialization() {
        for role in [Role::Client, Role::Provider, Role::Selector] {
            let encoded = rmp_serde::to_vec_named(&role).unwrap();
            let decoded: Role = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(decoded, role);
        }
    }

    #[test]
    fn raw_envelope_extracts_unknown_type() {
        #[derive(serde::Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            extra: &'static str,
        }
        let unknown = Unknown {
            msg_type: "frobnicate",
            id: 42,
            extra: "ignored",
        };
        let encoded = rmp_serde::to_vec_named(&unknown).unwrap();
        assert!(rmp_serde::from_slice::<Message>(&encoded).is_err());
        let envelope: RawEnvelope = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(envelope.id, 42);
    }
}
