//! Hashing and token primitives for the ballot core

pub mod secure;

use crate::{Error, Result};
use rand::RngCore;

pub use secure::{AttemptLimiter, SaltedHasher, SignalPurpose};

/// A 32-byte blake3 digest
pub type Hash = [u8; 32];

/// Bytes of entropy in a minted device token
const DEVICE_TOKEN_BYTES: usize = 16;

/// Cryptographic utilities
pub struct CryptoUtils;

impl CryptoUtils {
    /// Verify that two hashes are equal in constant time
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        use subtle::ConstantTimeEq;
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(b).into()
    }

    /// Mint an opaque device token for a first-time visitor
    pub fn generate_device_token() -> String {
        let mut token = [0u8; DEVICE_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut token);
        hex::encode(token)
    }

    /// Convert a hex string to a hash
    pub fn hex_to_hash(hex: &str) -> Result<Hash> {
        if hex.len() != 64 {
            return Err(Error::internal(format!(
                "Invalid hex length for hash: expected 64, got {}",
                hex.len()
            )));
        }

        let mut hash = [0u8; 32];
        hex::decode_to_slice(hex, &mut hash)
            .map_err(|e| Error::internal(format!("Invalid hex string: {e}")))?;
        Ok(hash)
    }

    /// Convert a hash to a hex string
    pub fn hash_to_hex(hash: &Hash) -> String {
        hex::encode(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_tokens_are_unique() {
        let token1 = CryptoUtils::generate_device_token();
        let token2 = CryptoUtils::generate_device_token();

        assert_ne!(token1, token2);
        assert_eq!(token1.len(), DEVICE_TOKEN_BYTES * 2);
        assert!(token1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_constant_time_eq() {
        let hash = [3u8; 32];
        let same = [3u8; 32];
        let mut different = same;
        different[31] = 4;

        assert!(CryptoUtils::constant_time_eq(&hash, &same));
        assert!(!CryptoUtils::constant_time_eq(&hash, &different));
        assert!(!CryptoUtils::constant_time_eq(&hash, &hash[..16]));
    }

    #[test]
    fn test_hex_conversions() {
        let hash = [7u8; 32];
        let hex = CryptoUtils::hash_to_hex(&hash);
        assert_eq!(CryptoUtils::hex_to_hash(&hex).unwrap(), hash);

        assert!(CryptoUtils::hex_to_hash("abcd").is_err());
        assert!(CryptoUtils::hex_to_hash(&"zz".repeat(32)).is_err());
    }
}
