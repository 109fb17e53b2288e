//! Credential generation and fingerprinting

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Random bytes per raw credential (hex-encoded to 48 chars, 192 bits)
pub const RAW_KEY_BYTES: usize = 24;

/// Generates raw credentials and computes the fingerprints stored in their place
pub struct CredentialCodec;

impl CredentialCodec {
    /// Generate a new raw credential and its fingerprint
    pub fn generate() -> (String, String) {
        let mut bytes = [0u8; RAW_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);

        let raw = hex::encode(bytes);
        let fingerprint = Self::fingerprint(&raw);
        (raw, fingerprint)
    }

    /// SHA-256 of the raw credential, hex-encoded
    pub fn fingerprint(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Compare two secrets without leaking their content or length through timing
    pub fn secrets_match(presented: &str, expected: &str) -> bool {
        let presented = Sha256::digest(presented.as_bytes());
        let expected = Sha256::digest(expected.as_bytes());
        presented.as_slice().ct_eq(expected.as_slice()).into()
    }

    /// Short fingerprint prefix for log lines
    pub fn short(fingerprint: &str) -> &str {
        fingerprint.get(..8).unwrap_or(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_format() {
        let (raw, fingerprint) = CredentialCodec::generate();
        assert_eq!(raw.len(), RAW_KEY_BYTES * 2);
        assert!(raw.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, CredentialCodec::fingerprint(&raw));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = CredentialCodec::fingerprint("not-a-real-key");
        let b = CredentialCodec::fingerprint("not-a-real-key");
        assert_eq!(a, b);
        assert_ne!(a, CredentialCodec::fingerprint("not-a-real-key "));
        // sha256("abc")
        assert_eq!(
            CredentialCodec::fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_no_collisions_over_ten_thousand_keys() {
        let mut raws = HashSet::new();
        let mut fingerprints = HashSet::new();
        for _ in 0..10_000 {
            let (raw, fingerprint) = CredentialCodec::generate();
            assert!(raws.insert(raw));
            assert!(fingerprints.insert(fingerprint));
        }
    }

    #[test]
    fn test_secrets_match() {
        assert!(CredentialCodec::secrets_match("master-secret", "master-secret"));
        assert!(!CredentialCodec::secrets_match("master-secret", "master-secreT"));
        assert!(!CredentialCodec::secrets_match("master", "master-secret"));
        assert!(!CredentialCodec::secrets_match("", "master-secret"));
    }

    #[test]
    fn test_short_prefix() {
        assert_eq!(CredentialCodec::short("0123456789abcdef"), "01234567");
        assert_eq!(CredentialCodec::short("abc"), "abc");
    }
}
