//! Configuration management for the usage service.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("invalid value {value:?} for {var}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Usage service configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Retry behaviour of compare-and-swap transactions
    pub retry: RetryConfig,
    /// Name of the organization group this daemon accounts for
    pub daemon_group_name: String,
    /// Address allowed to call administrative operations (empty = disabled)
    pub authentication_address: String,
    /// Maximum distance in blocks between a signed block and the current one
    pub allowed_block_chain_difference: u64,
    /// Where Prometheus metrics are served, if anywhere
    pub metrics_addr: Option<SocketAddr>,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per transaction (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_delay_ms: 5,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The retry policy described by this configuration.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier);
        if self.max_attempts == 0 {
            policy.with_unbounded_attempts()
        } else {
            policy.with_max_attempts(self.max_attempts)
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            daemon_group_name: "default_group".to_string(),
            authentication_address: String::new(),
            allowed_block_chain_difference: 5,
            metrics_addr: None,
        }
    }
}

impl UsageConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PREPAID_CAS_MAX_ATTEMPTS` | 50 (0 = unbounded) |
    /// | `PREPAID_CAS_INITIAL_DELAY_MS` | 5 |
    /// | `PREPAID_CAS_MAX_DELAY_MS` | 500 |
    /// | `PREPAID_CAS_BACKOFF_MULTIPLIER` | 2.0 |
    /// | `DAEMON_GROUP_NAME` | `default_group` |
    /// | `AUTHENTICATION_ADDRESS` | empty |
    /// | `ALLOWED_BLOCK_CHAIN_DIFFERENCE` | 5 |
    /// | `METRICS_ADDR` | unset |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a variable that is set but does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            retry: RetryConfig {
                max_attempts: parsed(&lookup, "PREPAID_CAS_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.retry.max_attempts),
                initial_delay_ms: parsed(&lookup, "PREPAID_CAS_INITIAL_DELAY_MS")?
                    .unwrap_or(defaults.retry.initial_delay_ms),
                max_delay_ms: parsed(&lookup, "PREPAID_CAS_MAX_DELAY_MS")?
                    .unwrap_or(defaults.retry.max_delay_ms),
                backoff_multiplier: parsed(&lookup, "PREPAID_CAS_BACKOFF_MULTIPLIER")?
                    .unwrap_or(defaults.retry.backoff_multiplier),
            },
            daemon_group_name: lookup("DAEMON_GROUP_NAME").unwrap_or(defaults.daemon_group_name),
            authentication_address: lookup("AUTHENTICATION_ADDRESS")
                .unwrap_or(defaults.authentication_address),
            allowed_block_chain_difference: parsed(&lookup, "ALLOWED_BLOCK_CHAIN_DIFFERENCE")?
                .unwrap_or(defaults.allowed_block_chain_difference),
            metrics_addr: parsed(&lookup, "METRICS_ADDR")?,
        })
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = UsageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, UsageConfig::default());
        assert_eq!(config.retry.policy().max_attempts(), Some(50));
    }

    #[test]
    fn values_are_read_from_the_environment() {
        let config = UsageConfig::from_lookup(lookup(&[
            ("PREPAID_CAS_MAX_ATTEMPTS", "7"),
            ("PREPAID_CAS_INITIAL_DELAY_MS", "1"),
            ("DAEMON_GROUP_NAME", "group_b"),
            ("AUTHENTICATION_ADDRESS", "0xD6C6344f1D122dC6f4C1782A4622B683b9008081"),
            ("ALLOWED_BLOCK_CHAIN_DIFFERENCE", "10"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_delay_ms, 1);
        assert_eq!(config.daemon_group_name, "group_b");
        assert_eq!(
            config.authentication_address,
            "0xD6C6344f1D122dC6f4C1782A4622B683b9008081"
        );
        assert_eq!(config.allowed_block_chain_difference, 10);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let config =
            UsageConfig::from_lookup(lookup(&[("PREPAID_CAS_MAX_ATTEMPTS", "0")])).unwrap();
        assert_eq!(config.retry.policy().max_attempts(), None);
    }

    #[test]
    fn unparsable_values_are_reported() {
        let err = UsageConfig::from_lookup(lookup(&[("PREPAID_CAS_MAX_DELAY_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "PREPAID_CAS_MAX_DELAY_MS",
                value: "soon".to_string(),
            }
        );
    }
}
