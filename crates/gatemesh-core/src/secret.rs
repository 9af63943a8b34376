//! Shared-secret handshake credentials.
//!
//! Two nodes never exchange their keys. The dialer presents
//! `hex(SHA-256(dialer_key ":" listener_key))`; the listener recomputes the
//! digest for every configured server and binds the connection to whichever
//! server's key pair matches. The digest is directional, so a credential
//! sniffed in one direction cannot be replayed in the other.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Compute the credential this side presents when dialing `remote_key`.
pub fn dial_credential(local_key: &str, remote_key: &str) -> String {
    credential(local_key, remote_key)
}

/// Compute the credential a peer with `remote_key` would present to us.
pub fn expected_credential(remote_key: &str, local_key: &str) -> String {
    credential(remote_key, local_key)
}

fn credential(first: &str, second: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b":");
    hasher.update(second.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a random shared key suitable for a server entry in the config.
pub fn generate_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_agree() {
        let dialed = dial_credential("alpha-key", "beta-key");
        let expected = expected_credential("alpha-key", "beta-key");
        assert_eq!(dialed, expected);
    }

    #[test]
    fn credential_is_directional() {
        assert_ne!(
            dial_credential("alpha-key", "beta-key"),
            dial_credential("beta-key", "alpha-key")
        );
    }

    #[test]
    fn wrong_key_does_not_match() {
        let dialed = dial_credential("alpha-key", "beta-key");
        assert_ne!(dialed, expected_credential("other-key", "beta-key"));
    }

    #[test]
    fn generated_keys_are_distinct_hex() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
