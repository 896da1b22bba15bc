mod arbiter;
mod cli;
mod client;
mod ipc;
mod provider;
mod selector;
mod session;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use session::types::ServiceId;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Arbiter { hybrid_service } => {
            let config = arbiter::ArbiterConfig {
                hybrid_service: hybrid_service.map(ServiceId::new),
            };
            if let Err(e) = arbiter::run(config).await {
                tracing::error!(error = %e, "arbiter failed");
                eprintln!("credentiald arbiter: {e}");
                std::process::exit(1);
            }
        }
        Command::Provider {
            service,
            capabilities,
            store,
        } => {
            if let Err(e) = provider::run(service, capabilities, store).await {
                tracing::error!(error = %e, "provider failed");
                eprintln!("credentiald provider: {e}");
                std::process::exit(1);
            }
        }
        Command::Selector { auto } => {
            if let Err(e) = selector::run(auto).await {
                tracing::error!(error = %e, "selector failed");
                eprintln!("credentiald selector: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { action } => {
            if let Err(e) = client::run(action).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("credentiald client: {e}");
                std::process::exit(1);
            }
        }
    }
}
