//! JSON-backed credential store for the demo provider.
//!
//! The store file is plain JSON so it can be edited by hand:
//!
//! ```json
//! {
//!   "save_target": "Work vault",
//!   "credentials": [
//!     {"credential_type": "passkey", "display_name": "home", "secret": "hunter2"}
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One stored credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredential {
    pub credential_type: String,
    pub display_name: String,
    /// Released as the credential payload when this entry is chosen.
    pub secret: String,
}

/// The provider's whole on-disk state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    #[serde(default)]
    pub credentials: Vec<StoredCredential>,
    /// Display name for the save entry offered on create requests.
    #[serde(default)]
    pub save_target: Option<String>,
}

/// Store read/write errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read store: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed store file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn load(path: &Path) -> Result<Store, StoreError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save(path: &Path, store: &Store) -> Result<(), StoreError> {
    let contents = serde_json::to_string_pretty(store)?;
    std::fs::write(path, contents)?;
    Ok(())
}
