//! # Configuration
//!
//! Runtime settings shared by every recovery command.
//!
//! Settings are layered: built-in defaults, then an optional file (TOML,
//! YAML or JSON by extension), then `REPL_KEEPER__`-prefixed environment
//! variables. Command-line overrides are applied by the caller on the loaded
//! value before [`AdminConfig::validate`].

use crate::retry::RetryPolicy;
use crate::AdminError;
use bus_runtime::ProviderType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "REPL_KEEPER";

/// Immutable settings for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Shard count of the target cluster, required by routing commands
    pub number_of_shards: Option<i32>,
    pub retry: RetrySettings,
    pub store_timeout_ms: u64,
    /// Timeout of a single bus call
    pub bus_timeout_ms: u64,
    /// Number of run-partitioned workers
    pub parallelism: usize,
    /// Concurrent bus calls allowed per cluster
    pub pool_size: usize,
    pub bus_provider: ProviderType,
    /// Messages requested per fetch when reading a topic
    pub fetch_batch_size: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            number_of_shards: None,
            retry: RetrySettings::default(),
            store_timeout_ms: 10_000,
            bus_timeout_ms: 10_000,
            parallelism: 4,
            pool_size: 8,
            bus_provider: if ProviderType::Kafka.is_available() {
                ProviderType::Kafka
            } else {
                ProviderType::InMemory
            },
            fetch_batch_size: 500,
        }
    }
}

/// Backoff settings as they appear in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.25,
        }
    }
}

impl AdminConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::InvalidConfiguration`] if the file cannot be read
    /// or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, AdminError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<AdminConfig>())
            .map_err(|e| AdminError::invalid_configuration(e.to_string()))
    }

    /// Check cross-field constraints after all overrides were applied
    pub fn validate(&self) -> Result<(), AdminError> {
        if let Some(shards) = self.number_of_shards {
            if shards <= 0 {
                return Err(AdminError::invalid_configuration(format!(
                    "number_of_shards must be positive, got {}",
                    shards
                )));
            }
        }
        if self.parallelism == 0 {
            return Err(AdminError::invalid_configuration(
                "parallelism must be at least 1",
            ));
        }
        if self.pool_size == 0 {
            return Err(AdminError::invalid_configuration(
                "pool_size must be at least 1",
            ));
        }
        if self.fetch_batch_size == 0 {
            return Err(AdminError::invalid_configuration(
                "fetch_batch_size must be at least 1",
            ));
        }
        if self.store_timeout_ms == 0 || self.bus_timeout_ms == 0 {
            return Err(AdminError::invalid_configuration(
                "timeouts must be greater than zero",
            ));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(AdminError::invalid_configuration(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        if !self.bus_provider.is_available() {
            return Err(AdminError::invalid_configuration(format!(
                "bus provider '{}' is not compiled into this build",
                self.bus_provider
            )));
        }
        Ok(())
    }

    /// Shard count, required by commands that route tasks
    pub fn require_shards(&self) -> Result<i32, AdminError> {
        self.number_of_shards.ok_or_else(|| {
            AdminError::invalid_configuration("number of shards is required for this command")
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.backoff_multiplier,
        )
        .with_jitter_percent(self.retry.jitter_percent)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }
}
