//! Salted hashing of fraud signals and ballot-creation rate limiting
//!
//! Device tokens, user agents and source IPs are never stored in plaintext.
//! Each is hashed with a key derived from the server secret, the poll id and
//! the signal's purpose, so the same device hashes differently per poll.

use crate::config::SecurityConfig;
use crate::types::PollId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Domain separation string for derived signal keys
const SIGNAL_KEY_CONTEXT: &str = "ballotbox 2024 salted ballot signal v1";

/// What a hashed value represents; part of the salt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalPurpose {
    Device,
    UserAgent,
    Ip,
}

impl SignalPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::UserAgent => "ua",
            Self::Ip => "ip",
        }
    }
}

/// Keyed hasher rooted in the server secret
#[derive(Clone)]
pub struct SaltedHasher {
    secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SaltedHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaltedHasher").finish_non_exhaustive()
    }
}

impl SaltedHasher {
    pub fn new(secret: Zeroizing<Vec<u8>>) -> Result<Self> {
        if secret.len() < 32 {
            return Err(Error::internal("Server secret must be at least 32 bytes"));
        }
        Ok(Self { secret })
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        Self::new(config.secret_bytes()?)
    }

    /// Create for testing with a random secret
    pub fn for_testing() -> Self {
        Self {
            secret: Zeroizing::new(rand::random::<[u8; 32]>().to_vec()),
        }
    }

    /// Hash `value` under the (secret, poll, purpose) salt, hex encoded
    pub fn hash(&self, value: &str, poll_id: &PollId, purpose: SignalPurpose) -> String {
        let mut material = Zeroizing::new(Vec::with_capacity(self.secret.len() + 48));
        material.extend_from_slice(&self.secret);
        material.push(b':');
        material.extend_from_slice(poll_id.as_bytes());
        material.push(b':');
        material.extend_from_slice(purpose.as_str().as_bytes());

        let key = Zeroizing::new(blake3::derive_key(SIGNAL_KEY_CONTEXT, &material));
        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(value.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Fixed-window counter per key.
///
/// Counters live in process memory: they reset on restart and are not
/// shared between instances.
pub struct AttemptLimiter {
    max_attempts: u32,
    window: Duration,
    windows: Mutex<HashMap<String, AttemptWindow>>,
}

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    expires_at: Instant,
}

impl AttemptLimiter {
    /// Create new limiter; at least one attempt per window is always allowed
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.ballot_attempts, config.ballot_window())
    }

    /// Count an attempt for `key`, failing with `RateLimited` when over quota
    pub fn check_and_increment(&self, key: &str) -> Result<()> {
        self.check_and_increment_at(key, Instant::now())
    }

    pub fn check_and_increment_at(&self, key: &str, now: Instant) -> Result<()> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| Error::internal("Rate limiter lock poisoned"))?;

        if let Some(window) = windows.get_mut(key) {
            if window.expires_at > now {
                if window.count >= self.max_attempts {
                    let retry_after = window.expires_at.saturating_duration_since(now);
                    return Err(Error::RateLimited {
                        retry_after_secs: retry_after.as_secs().max(1),
                    });
                }
                window.count += 1;
                return Ok(());
            }
        }

        windows.insert(
            key.to_string(),
            AttemptWindow {
                count: 1,
                expires_at: now + self.window,
            },
        );
        Ok(())
    }

    /// Drop windows that have already expired
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| Error::internal("Rate limiter lock poisoned"))?;
        let before = windows.len();
        windows.retain(|_, window| window.expires_at > now);
        Ok(before - windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_salted_hash_is_deterministic_per_salt() {
        let hasher = SaltedHasher::for_testing();
        let poll_a = Uuid::new_v4();
        let poll_b = Uuid::new_v4();

        let h1 = hasher.hash("device-123", &poll_a, SignalPurpose::Device);
        let h2 = hasher.hash("device-123", &poll_a, SignalPurpose::Device);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        // Poll and purpose are part of the salt
        assert_ne!(h1, hasher.hash("device-123", &poll_b, SignalPurpose::Device));
        assert_ne!(h1, hasher.hash("device-123", &poll_a, SignalPurpose::UserAgent));

        // Different secret, different hash
        let other = SaltedHasher::for_testing();
        assert_ne!(h1, other.hash("device-123", &poll_a, SignalPurpose::Device));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(SaltedHasher::new(Zeroizing::new(vec![0u8; 16])).is_err());
        assert!(SaltedHasher::new(Zeroizing::new(vec![0u8; 32])).is_ok());
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", SaltedHasher::for_testing());
        assert_eq!(rendered, "SaltedHasher { .. }");
    }

    #[test]
    fn test_limiter_window() {
        let limiter = AttemptLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.check_and_increment_at("k", start).is_ok());
        assert!(limiter.check_and_increment_at("k", start).is_ok());

        let err = limiter.check_and_increment_at("k", start).unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs: 60 }));

        // Other keys are independent
        assert!(limiter.check_and_increment_at("other", start).is_ok());

        // A fresh window opens once the old one expires
        let later = start + Duration::from_secs(61);
        assert!(limiter.check_and_increment_at("k", later).is_ok());
    }

    #[test]
    fn test_limiter_zero_means_one() {
        let limiter = AttemptLimiter::new(0, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_and_increment_at("k", now).is_ok());
        assert!(limiter.check_and_increment_at("k", now).is_err());
    }

    #[test]
    fn test_limiter_purge() {
        let limiter = AttemptLimiter::new(1, Duration::from_millis(0));
        limiter.check_and_increment("k").unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.purge_expired().unwrap(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
