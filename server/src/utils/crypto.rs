//! Cryptographic utility functions

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Generate a cryptographically secure random key
pub fn generate_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a cryptographically secure random hex token
pub fn generate_token(byte_len: usize) -> String {
    hex::encode(generate_key(byte_len))
}

/// Constant-time string comparison to prevent timing attacks
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_length_and_charset() {
        let token = generate_token(32);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_token_unique() {
        assert_ne!(generate_token(32), generate_token(32));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secres"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(constant_time_eq("", ""));
    }
}
