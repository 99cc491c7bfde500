use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use statemachine::{ExponentialWaitStrategy, ManagerConfig, RetryPolicy};
use uuid::Uuid;

use crate::error::ConnectorError;

/// Connector configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Lease holder id for this instance. Must differ between instances
    /// sharing one store.
    pub runtime_id: String,
    pub batch_size: usize,
    pub iteration_wait_ms: u64,
    pub max_wait_ms: u64,
    pub lease_ms: i64,
    pub shutdown_timeout_ms: u64,
    pub send_retry_limit: u32,
    pub send_retry_base_delay_ms: u64,
    pub command_queue_capacity: usize,
    pub command_max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            runtime_id: lookup("CONNECTOR_RUNTIME_ID")
                .unwrap_or_else(|| format!("connector-{}", Uuid::new_v4())),
            batch_size: parse_or(&lookup, "STATE_MACHINE_BATCH_SIZE", 20)?,
            iteration_wait_ms: parse_or(&lookup, "STATE_MACHINE_ITERATION_WAIT_MS", 1_000)?,
            max_wait_ms: parse_or(&lookup, "STATE_MACHINE_MAX_WAIT_MS", 30_000)?,
            lease_ms: parse_or(&lookup, "STATE_MACHINE_LEASE_MS", 60_000)?,
            shutdown_timeout_ms: parse_or(&lookup, "STATE_MACHINE_SHUTDOWN_TIMEOUT_MS", 10_000)?,
            send_retry_limit: parse_or(&lookup, "SEND_RETRY_LIMIT", 7)?,
            send_retry_base_delay_ms: parse_or(&lookup, "SEND_RETRY_BASE_DELAY_MS", 1_000)?,
            command_queue_capacity: parse_or(&lookup, "COMMAND_QUEUE_CAPACITY", 1_024)?,
            command_max_attempts: parse_or(&lookup, "COMMAND_MAX_ATTEMPTS", 5)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        let invalid = |msg: String| Err(ConnectorError::Config(msg));

        if self.runtime_id.trim().is_empty() {
            return invalid("CONNECTOR_RUNTIME_ID must not be empty".into());
        }
        if self.batch_size == 0 {
            return invalid("STATE_MACHINE_BATCH_SIZE must be at least 1".into());
        }
        if self.max_wait_ms < self.iteration_wait_ms {
            return invalid(format!(
                "STATE_MACHINE_MAX_WAIT_MS ({}) is below STATE_MACHINE_ITERATION_WAIT_MS ({})",
                self.max_wait_ms, self.iteration_wait_ms
            ));
        }
        if self.lease_ms <= 0 {
            return invalid("STATE_MACHINE_LEASE_MS must be positive".into());
        }
        if self.command_queue_capacity == 0 {
            return invalid("COMMAND_QUEUE_CAPACITY must be at least 1".into());
        }
        if self.command_max_attempts == 0 {
            return invalid("COMMAND_MAX_ATTEMPTS must be at least 1".into());
        }
        self.retry_policy()?;
        Ok(())
    }

    /// Idle backoff for the manager loops.
    pub fn wait_strategy(&self) -> ExponentialWaitStrategy {
        ExponentialWaitStrategy::new(self.iteration_wait_ms, self.max_wait_ms).with_jitter(0.1)
    }

    /// Backoff for outbound messages that failed to send.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConnectorError> {
        let max_delay = self.max_wait_ms.max(self.send_retry_base_delay_ms);
        Ok(RetryPolicy::new(
            self.send_retry_limit,
            self.send_retry_base_delay_ms,
            max_delay,
        )?)
    }

    pub fn manager_config(&self, name: &str) -> ManagerConfig {
        ManagerConfig::new(format!("{}-{}", name, self.runtime_id))
            .with_shutdown_timeout(Duration::from_millis(self.shutdown_timeout_ms))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.runtime_id.starts_with("connector-"));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.send_retry_limit, 7);
        assert_eq!(config.command_max_attempts, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CONNECTOR_RUNTIME_ID", "edc-1"),
            ("STATE_MACHINE_BATCH_SIZE", " 5 "),
            ("SEND_RETRY_LIMIT", "2"),
        ]))
        .unwrap();
        assert_eq!(config.runtime_id, "edc-1");
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.retry_policy().unwrap().limit(), 2);
        assert_eq!(config.manager_config("transfers").name, "transfers-edc-1");
    }

    #[test]
    fn test_unparseable_value_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("STATE_MACHINE_LEASE_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("STATE_MACHINE_LEASE_MS"));
    }

    #[test]
    fn test_validate_rejects_inverted_waits() {
        let config = Config::from_lookup(lookup(&[
            ("STATE_MACHINE_ITERATION_WAIT_MS", "5000"),
            ("STATE_MACHINE_MAX_WAIT_MS", "100"),
        ]))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConnectorError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = Config::from_lookup(lookup(&[("STATE_MACHINE_BATCH_SIZE", "0")])).unwrap();
        assert!(config.validate().is_err());
    }
}
