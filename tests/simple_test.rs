//! Smoke tests for configuration, tokens and error surfaces

use ballotbox::{
    Error, ErrorKind, Result,
    config::Config,
    crypto::{CryptoUtils, SaltedHasher, SignalPurpose},
};
use std::time::Duration;
use uuid::Uuid;

#[test]
fn test_testing_config_is_usable() -> Result<()> {
    let config = Config::for_testing();

    assert!(config.mail.is_configured());
    assert_eq!(config.realtime.heartbeat_interval(), Duration::from_secs(15));
    assert_eq!(config.security.secret_bytes()?.len(), 32);
    SaltedHasher::from_config(&config.security)?;
    Ok(())
}

#[test]
fn test_device_tokens_never_appear_in_hashes() -> Result<()> {
    let hasher = SaltedHasher::from_config(&Config::for_testing().security)?;
    let token = CryptoUtils::generate_device_token();

    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(token, CryptoUtils::generate_device_token());

    let hashed = hasher.hash(&token, &Uuid::new_v4(), SignalPurpose::Device);
    assert!(!hashed.contains(&token));
    Ok(())
}

#[test]
fn test_public_messages_hide_internals() {
    let store = Error::transient("Postgres: connection to 10.0.0.3 timed out");
    assert_eq!(store.kind(), ErrorKind::Internal);
    assert_eq!(store.public_message(), "Internal error");

    let limited = Error::RateLimited {
        retry_after_secs: 42,
    };
    assert_eq!(limited.kind(), ErrorKind::RateLimited);
    assert_eq!(limited.public_message(), "Rate limited, retry in 42s");
}
