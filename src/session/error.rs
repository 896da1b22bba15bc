//! Request-level error taxonomy.
//!
//! Every failed request terminates with exactly one `RequestError`. Kinds
//! are stable machine-readable tags on the wire; messages are for humans and
//! never parsed.

use std::fmt;

/// Machine-readable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Internal invalid state: unknown entry keys, unparseable payloads.
    Unknown,
    /// Get flow: nothing available for the request.
    NoCredential,
    /// Create flow: no provider offered a way to store the credential.
    NoCreateOptions,
    /// The user dismissed the chooser.
    UserCanceled,
    /// The request was cancelled by or on behalf of the client. Distinct
    /// from `UserCanceled`; the two travel under different wire tags.
    ClientCanceled,
    /// The chooser went away without a user decision.
    Interrupted,
    /// Clear flow: every provider failed.
    ClearFailed,
}

impl ErrorKind {
    /// Stable wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NoCredential => "no_credential",
            Self::NoCreateOptions => "no_create_options",
            Self::UserCanceled => "user_canceled",
            Self::ClientCanceled => "client_canceled",
            Self::Interrupted => "interrupted",
            Self::ClearFailed => "clear_failed",
        }
    }

    /// Parse a wire tag. Unrecognized tags collapse to `Unknown`; provider
    /// error vocabularies may grow ahead of the daemon's.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "no_credential" => Self::NoCredential,
            "no_create_options" => Self::NoCreateOptions,
            "user_canceled" => Self::UserCanceled,
            "client_canceled" => Self::ClientCanceled,
            "interrupted" => Self::Interrupted,
            "clear_failed" => Self::ClearFailed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error every terminal path converts to once the session's
    /// cancellation signal is set.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::ClientCanceled, "request cancelled by client")
    }

    pub fn user_canceled() -> Self {
        Self::new(ErrorKind::UserCanceled, "user cancelled the selector")
    }

    pub fn interrupted() -> Self {
        Self::new(
            ErrorKind::Interrupted,
            "the selector was interrupted, please try again",
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn no_credential(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoCredential, message)
    }

    pub fn no_create_options(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoCreateOptions, message)
    }

    pub fn clear_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClearFailed, message)
    }
}
