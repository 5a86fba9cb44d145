//! Account Proof Verification
//!
//! Workers prove ownership of an account issued by the external key
//! service with an HMAC over their node id. The coordinator only
//! verifies; it never issues keys.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex proof for a node/account pair. Worker clients use the
/// same construction when registering.
#[must_use]
pub fn account_proof(secret: &str, node_id: &str, account_ref: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(node_id.as_bytes());
    mac.update(b":");
    mac.update(account_ref.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a worker-presented proof.
#[must_use]
pub fn verify_account_proof(secret: &str, node_id: &str, account_ref: &str, proof: &str) -> bool {
    let Ok(decoded) = hex::decode(proof) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(node_id.as_bytes());
    mac.update(b":");
    mac.update(account_ref.as_bytes());
    mac.verify_slice(&decoded).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_proof_verifies() {
        let proof = account_proof("secret", "node-1", "acct-1");
        assert!(verify_account_proof("secret", "node-1", "acct-1", &proof));
    }

    #[test]
    fn proof_is_bound_to_node_and_account() {
        let proof = account_proof("secret", "node-1", "acct-1");
        assert!(!verify_account_proof("secret", "node-2", "acct-1", &proof));
        assert!(!verify_account_proof("secret", "node-1", "acct-2", &proof));
        assert!(!verify_account_proof("other", "node-1", "acct-1", &proof));
    }

    #[test]
    fn malformed_proof_is_rejected() {
        assert!(!verify_account_proof("secret", "node-1", "acct-1", "not-hex"));
        assert!(!verify_account_proof("secret", "node-1", "acct-1", ""));
    }
}
