//! Configuration for the ballot core
//!
//! Loads the server secret and operational limits from environment variables
//! with validation.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

/// Secret material and abuse limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Server secret used as the salt root for all stored hashes
    /// (base64 encoded, minimum 32 bytes)
    pub server_secret: String,

    /// Ballot creations allowed per (poll, device) inside one window
    pub ballot_attempts: u32,

    /// Length of the ballot-creation rate window in seconds
    pub ballot_window_seconds: u64,
}

impl SecurityConfig {
    /// Load security configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server_secret = std::env::var("BALLOTBOX_SERVER_SECRET")
            .map_err(|_| Error::internal("BALLOTBOX_SERVER_SECRET environment variable required"))?;
        Self::validate_secret(&server_secret, "BALLOTBOX_SERVER_SECRET")?;

        let ballot_attempts = env_or("BALLOTBOX_BALLOT_ATTEMPTS", 1)?;
        let ballot_window_seconds = env_or("BALLOTBOX_BALLOT_WINDOW_SECONDS", 60)?;

        Ok(Self {
            server_secret,
            ballot_attempts,
            ballot_window_seconds,
        })
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        use base64::Engine;
        let server_secret =
            base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 32]>());

        Self {
            server_secret,
            ballot_attempts: 1,
            ballot_window_seconds: 60,
        }
    }

    /// Validate a base64-encoded secret
    fn validate_secret(secret: &str, name: &str) -> Result<()> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(secret)
            .map_err(|_| Error::internal(format!("{name} must be valid base64")))?;

        if decoded.len() < 32 {
            return Err(Error::internal(format!(
                "{name} must be at least 32 bytes when decoded"
            )));
        }

        Ok(())
    }

    /// Get the server secret as bytes, wiped on drop
    pub fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.server_secret)
            .map(Zeroizing::new)
            .map_err(|_| Error::internal("Invalid server secret"))
    }

    pub fn ballot_window(&self) -> Duration {
        Duration::from_secs(self.ballot_window_seconds)
    }
}

/// Live feed timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub heartbeat_seconds: u64,
    /// Reconnect hint sent to SSE clients
    pub sse_retry_ms: u64,
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds.max(1))
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 15,
            sse_retry_ms: 5000,
        }
    }
}

/// Bounded retry for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retries: u32,
    pub base_delay_ms: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay_ms: 200,
        }
    }
}

/// Outbound mail settings used by commit-time invitations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    pub from: Option<String>,
}

impl MailConfig {
    pub fn is_configured(&self) -> bool {
        self.from.as_deref().is_some_and(|from| !from.trim().is_empty())
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub security: SecurityConfig,
    pub realtime: RealtimeConfig,
    pub retry: RetryConfig,
    pub mail: MailConfig,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        let security = SecurityConfig::from_env()?;

        let realtime = RealtimeConfig {
            heartbeat_seconds: env_or("BALLOTBOX_HEARTBEAT_SECONDS", 15)?,
            sse_retry_ms: env_or("BALLOTBOX_SSE_RETRY_MS", 5000)?,
        };

        let retry = RetryConfig {
            retries: env_or("BALLOTBOX_STORE_RETRIES", 3)?,
            base_delay_ms: env_or("BALLOTBOX_STORE_RETRY_BASE_MS", 200)?,
        };

        let mail = MailConfig {
            from: std::env::var("EMAIL_FROM").ok(),
        };

        let logging = LoggingConfig {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
        };

        Ok(Self {
            security,
            realtime,
            retry,
            mail,
            logging,
        })
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        Self {
            security: SecurityConfig::for_testing(),
            realtime: RealtimeConfig::default(),
            retry: RetryConfig {
                retries: 3,
                base_delay_ms: 1, // keep retry tests fast
            },
            mail: MailConfig {
                from: Some("polls@example.test".to_string()),
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::internal(format!("Invalid {name}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_config_for_testing() {
        let config = SecurityConfig::for_testing();

        assert!(config.secret_bytes().unwrap().len() >= 32);
        assert_eq!(config.ballot_attempts, 1);
        assert_eq!(config.ballot_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_secret_validation() {
        use base64::Engine;
        let valid = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        assert!(SecurityConfig::validate_secret(&valid, "TEST").is_ok());

        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(SecurityConfig::validate_secret(&short, "TEST").is_err());

        assert!(SecurityConfig::validate_secret("not base64!", "TEST").is_err());
    }

    #[test]
    fn test_defaults() {
        let realtime = RealtimeConfig::default();
        assert_eq!(realtime.heartbeat_interval(), Duration::from_secs(15));

        let retry = RetryConfig::default();
        assert_eq!(retry.retries, 3);
        assert_eq!(retry.base_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_mail_configured() {
        assert!(!MailConfig::default().is_configured());
        assert!(!MailConfig { from: Some("  ".into()) }.is_configured());
        assert!(Config::for_testing().mail.is_configured());
    }
}
