//! Output formatting for CLI client commands.
//!
//! Design: human-readable status lines to stdout. Credential payloads
//! print as text when they are valid UTF-8 and as hex otherwise, so
//! binary assertions do not garble the terminal.

use crate::session::types::{Credential, CreationReceipt, ProviderDescriptor};

/// Print provider descriptors as a table to stdout.
pub fn print_providers(providers: &[ProviderDescriptor]) {
    if providers.is_empty() {
        println!("No providers registered");
        return;
    }

    println!("{:<40} CAPABILITIES", "SERVICE");
    println!("{}", "-".repeat(60));
    for p in providers {
        println!("{:<40} {}", p.service, p.capabilities.join(","));
    }
}

/// Print a retrieved credential.
pub fn print_credential(credential: &Credential) {
    println!("Type: {}", credential.credential_type);
    println!("Data: {}", render_payload(&credential.data));
}

/// Print a create receipt.
pub fn print_receipt(receipt: &CreationReceipt) {
    if receipt.data.is_empty() {
        println!("Credential stored");
    } else {
        println!("Credential stored; receipt: {}", render_payload(&receipt.data));
    }
}

/// Print clear success.
pub fn print_cleared() {
    println!("Credential state cleared");
}

/// Render an opaque payload: as-is when printable UTF-8, hex otherwise.
fn render_payload(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => {
            let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
            format!("0x{hex}")
        }
    }
}
