//! Checksums over migration statements

use sha2::{Digest, Sha256};

/// SHA-256 over a migration's statements, hex encoded
///
/// Statements are trimmed and separated by a NUL byte, so reindenting a
/// statement does not change the checksum but editing or reordering does.
pub fn statements_checksum(statements: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update(statement.trim().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
