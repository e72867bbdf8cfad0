//! Engine configuration.
//!
//! Like TCTI selection, everything comes from the environment when set and
//! falls back to built-in defaults otherwise.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub const ENV_AUTH_RETRIES: &str = "TSPAUTH_AUTH_RETRIES";
pub const ENV_AUTH_RETRY_DELAY_MS: &str = "TSPAUTH_AUTH_RETRY_DELAY_MS";
pub const ENV_NONCE_SOURCE: &str = "TSPAUTH_NONCE_SOURCE";
pub const ENV_INTERACTIVE: &str = "TSPAUTH_INTERACTIVE";

/// How OIAP/OSAP/DSAP requests are retried while the TPM reports that it is
/// out of session resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(50);
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: Self::DEFAULT_DELAY,
        }
    }
}

/// Where odd nonces come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceSource {
    /// The host's OS-seeded RNG.
    #[default]
    Local,
    /// The TPM's `GetRandom`, through the transport.
    Tpm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub nonce_source: NonceSource,
    /// Whether Popup-mode policies may ask the registered prompt for a secret.
    pub interactive_prompts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            nonce_source: NonceSource::default(),
            interactive_prompts: true,
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from the process environment.
    pub fn from_environment() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Unset keys keep
    /// their default, malformed ones are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_AUTH_RETRIES) {
            match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.retry.max_attempts = n,
                _ => warn!(key = ENV_AUTH_RETRIES, value = %raw, "ignoring invalid retry count"),
            }
        }

        if let Some(raw) = lookup(ENV_AUTH_RETRY_DELAY_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.retry.delay = Duration::from_millis(ms),
                Err(_) => warn!(key = ENV_AUTH_RETRY_DELAY_MS, value = %raw, "ignoring invalid retry delay"),
            }
        }

        if let Some(raw) = lookup(ENV_NONCE_SOURCE) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "local" => config.nonce_source = NonceSource::Local,
                "tpm" => config.nonce_source = NonceSource::Tpm,
                _ => warn!(key = ENV_NONCE_SOURCE, value = %raw, "ignoring unknown nonce source"),
            }
        }

        if let Some(raw) = lookup(ENV_INTERACTIVE) {
            match raw.trim() {
                "1" | "true" | "yes" => config.interactive_prompts = true,
                "0" | "false" | "no" => config.interactive_prompts = false,
                _ => warn!(key = ENV_INTERACTIVE, value = %raw, "ignoring invalid interactive flag"),
            }
        }

        config
    }
}
