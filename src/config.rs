//! Process configuration, loaded once at startup from environment
//! variables (optionally populated by a `.env` file via `dotenv`).
//! Explicit struct constructed at application start and threaded through
//! as a dependency, not a cached global singleton — see the REDESIGN
//! FLAGS note on the source's module-scope settings object. Field shape
//! follows `original_source/src/nabr/core/config.py::Settings`.

use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(String),

    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts_activity: u32,
    pub max_attempts_store_write: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_attempts_activity: 3,
            max_attempts_store_write: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Interval between `list_expiring_completions` sweeps; spec's
    /// 30-day expiry sweep cadence.
    pub expiry_sweep_interval: Duration,
    /// Main-loop iterations after which an orchestrator instance performs
    /// continue-as-new (§4.6).
    pub continue_as_new_iteration_cap: u64,
    /// Lifetime of an issued QR token. Independent of `two_party_deadline`
    /// (the whole attempt's deadline) — a short default suits a code sent
    /// to a device, but in-person verification may need the token to
    /// outlive a single 15-minute window, so this should be raised if
    /// operators expect meetings to take longer to arrange.
    pub qr_token_ttl: Duration,
    pub two_party_deadline: Duration,
    pub code_method_deadline: Duration,
    pub id_review_deadline: Duration,
    pub retry: RetryConfig,
    /// Opaque endpoint for the notifier collaborator; transport itself is
    /// out of scope (§1).
    pub notifier_endpoint: Option<String>,
}

impl Config {
    /// Load from environment, applying `.env` first if present. Fields
    /// without sane spec-given defaults (`database_url`) are required;
    /// everything else falls back to the values spec.md names explicitly.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DATABASE_URL".to_string()))?;

        let expiry_sweep_interval = parse_duration_secs("EXPIRY_SWEEP_INTERVAL_SECS", 30 * 24 * 60 * 60)?;
        let continue_as_new_iteration_cap = parse_u64("CONTINUE_AS_NEW_ITERATION_CAP", 1000)?;
        let qr_token_ttl = parse_duration_secs("QR_TOKEN_TTL_SECS", 15 * 60)?;
        let two_party_deadline = parse_duration_secs("TWO_PARTY_DEADLINE_SECS", 72 * 60 * 60)?;
        let code_method_deadline = parse_duration_secs("CODE_METHOD_DEADLINE_SECS", 24 * 60 * 60)?;
        let id_review_deadline = parse_duration_secs("ID_REVIEW_DEADLINE_SECS", 7 * 24 * 60 * 60)?;
        let notifier_endpoint = env::var("NOTIFIER_ENDPOINT").ok();

        Ok(Self {
            database_url,
            expiry_sweep_interval,
            continue_as_new_iteration_cap,
            qr_token_ttl,
            two_party_deadline,
            code_method_deadline,
            id_review_deadline,
            retry: RetryConfig::default(),
            notifier_endpoint,
        })
    }

    /// Defaults suitable for tests against an in-memory store: a very
    /// short expiry-sweep interval (the spec's 30-day cadence would
    /// never fire inside a test) and otherwise the same deadlines
    /// `from_env` would default to.
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://unused/test".to_string(),
            expiry_sweep_interval: Duration::from_secs(3600),
            continue_as_new_iteration_cap: 1000,
            qr_token_ttl: Duration::from_secs(15 * 60),
            two_party_deadline: Duration::from_secs(72 * 60 * 60),
            code_method_deadline: Duration::from_secs(24 * 60 * 60),
            id_review_deadline: Duration::from_secs(7 * 24 * 60 * 60),
            retry: RetryConfig::default(),
            notifier_endpoint: None,
        }
    }
}

fn parse_duration_secs(key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid(key.to_string(), v)),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| ConfigError::Invalid(key.to_string(), v)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_deadlines() {
        let retry = RetryConfig::default();
        assert_eq!(retry.initial_interval, Duration::from_secs(1));
        assert_eq!(retry.max_interval, Duration::from_secs(10));
        assert_eq!(retry.max_attempts_activity, 3);
        assert_eq!(retry.max_attempts_store_write, 5);
    }
}
