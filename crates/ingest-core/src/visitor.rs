use sha2::{Digest, Sha256};

/// Derives a stable, non-reversible visitor identifier when the client did
/// not supply one. `salt` is a daily-rotating secret owned by the storage
/// layer (the `settings` table) rather than derived from the wall clock in
/// here, so this function stays pure and testable: the same
/// `(salt, site_id, ip, user_agent)` always yields the same id.
///
/// Formula: `sha256(salt | site_id | ip | user_agent)`, first 8 bytes as 16
/// lowercase hex characters.
pub fn derive_visitor_id(salt: &str, site_id: &str, ip: &str, user_agent: &str) -> String {
    let input = format!("{salt}|{site_id}|{ip}|{user_agent}");
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}
