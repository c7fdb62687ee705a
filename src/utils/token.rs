// utils/token.rs
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const SESSION_TOKEN_LENGTH: usize = 48;
const MAGIC_LINK_TOKEN_LENGTH: usize = 40;

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect()
}

pub fn generate_session_token() -> String {
    random_token(SESSION_TOKEN_LENGTH)
}

pub fn generate_magic_link_token() -> String {
    random_token(MAGIC_LINK_TOKEN_LENGTH)
}

/// SHA-256 hex digest. OTP codes are only ever stored in this form.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    ConstantTimeEq::ct_eq(a.as_bytes(), b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_alphanumeric_and_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), SESSION_TOKEN_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(generate_magic_link_token().len(), MAGIC_LINK_TOKEN_LENGTH);
    }

    #[test]
    fn test_hash_secret_is_stable_hex() {
        let hash = hash_secret("123456");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_secret("123456"));
        assert_ne!(hash, hash_secret("123457"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
