use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "credentiald", about = "Credential request arbitration daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the arbiter daemon
    Arbiter {
        /// Service allowed to offer remote (hybrid) entries
        #[arg(long)]
        hybrid_service: Option<String>,
    },

    /// Run a file-backed credential provider
    Provider {
        /// Service identifier to register, e.g. com.example.vault
        #[arg(long)]
        service: String,

        /// Credential type the provider can serve (repeatable)
        #[arg(long = "capability", required = true)]
        capabilities: Vec<String>,

        /// Path to the JSON credential store
        #[arg(long)]
        store: PathBuf,
    },

    /// Run the chooser client
    Selector {
        /// Pick the first selectable entry without prompting
        #[arg(long)]
        auto: bool,
    },

    /// Issue one-shot requests against the arbiter
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// Retrieve a credential
    Get {
        /// Requested credential type (repeatable)
        #[arg(long = "type", required = true)]
        types: Vec<String>,

        /// Calling package name reported to the arbiter
        #[arg(long, default_value = "credentiald-cli")]
        caller: String,
    },

    /// Store a new credential
    Create {
        /// Credential type to store
        #[arg(long = "type")]
        credential_type: String,

        /// Credential payload
        #[arg(long)]
        data: String,

        /// Calling package name reported to the arbiter
        #[arg(long, default_value = "credentiald-cli")]
        caller: String,
    },

    /// Clear stored credential state across all providers
    Clear {
        /// Calling package name reported to the arbiter
        #[arg(long, default_value = "credentiald-cli")]
        caller: String,
    },

    /// List registered providers
    ListProviders,
}
