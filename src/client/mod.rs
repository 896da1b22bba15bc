//! CLI client for arbiter requests.
//!
//! Provides one-shot commands that connect to the arbiter, perform a
//! single request, print the result, and exit. A get/create/clear
//! command blocks until the daemon pushes the request's terminal
//! callback; the chooser interaction, if any, happens in the selector
//! process in the meantime.

mod arbiter_client;
mod format;

use crate::cli::ClientAction;
use crate::session::types::CredentialQuery;
use arbiter_client::ArbiterClient;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("arbiter: {0}")]
    Arbiter(String),
    #[error("request failed ({kind}): {message}")]
    Request { kind: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the client command.
///
/// Connects to the arbiter, performs the requested action, prints the
/// result, and returns. Called from `main.rs` for `Command::Client`.
pub async fn run(action: ClientAction) -> Result<(), ClientError> {
    let mut arbiter = ArbiterClient::connect().await?;

    match action {
        ClientAction::Get { types, caller } => {
            let options = types
                .into_iter()
                .map(|credential_type| CredentialQuery {
                    credential_type,
                    query_data: Vec::new(),
                })
                .collect();
            let credential = arbiter.get(caller, options).await?;
            format::print_credential(&credential);
        }
        ClientAction::Create {
            credential_type,
            data,
            caller,
        } => {
            let receipt = arbiter
                .create(caller, credential_type, data.into_bytes())
                .await?;
            format::print_receipt(&receipt);
        }
        ClientAction::Clear { caller } => {
            arbiter.clear(caller).await?;
            format::print_cleared();
        }
        ClientAction::ListProviders => {
            let providers = arbiter.list_providers().await?;
            format::print_providers(&providers);
        }
    }

    Ok(())
}
