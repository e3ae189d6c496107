//! Vote fingerprints and per-node signature tokens

use sha2::{Digest, Sha256};

/// Compute the content fingerprint for a vote.
///
/// SHA-256 over voter, candidate, election and a nonce, hex-encoded.
/// Deterministic for a given nonce; the nonce makes otherwise identical
/// votes distinguishable for replay detection. Not content equality.
pub fn vote_fingerprint(voter_id: &str, candidate_id: &str, election_id: &str, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voter_id.as_bytes());
    hasher.update(candidate_id.as_bytes());
    hasher.update(election_id.as_bytes());
    hasher.update(nonce.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic signature token for a (vote, node) log entry.
///
/// Plain concatenation, NOT a cryptographic signature. Production
/// deployments must replace this with a real signing scheme; the token
/// only needs to be deterministic per (fingerprint, node) for testability.
pub fn signature_token(fingerprint: &str, node_id: &str) -> String {
    format!("sig_{}_{}", fingerprint, node_id)
}
