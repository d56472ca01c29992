//! Runtime configuration loaded from TOML.
//!
//! Every section has defaults, so an empty document is a valid configuration.
//! Durations are whole milliseconds in `*_ms` fields.
//!
//! # Example
//!
//! ```toml
//! [outbox]
//! max_outstanding_messages = 500
//! retry_max_attempts = 5
//!
//! [dispatcher]
//! shutdown_timeout_ms = 10000
//!
//! [[subscriptions]]
//! name = "orders"
//! channel_name = "orders.queue"
//! routing_key = "orders.placed"
//! performers = 2
//! requeue_count = 3
//! pump = "proactor"
//! ```
//!
//! ```no_run
//! use herald_runtime::config::RuntimeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Reads the file named by HERALD_CONFIG, or the defaults when it is unset.
//! let config = RuntimeConfig::from_env()?;
//! let subscriptions = config.subscriptions();
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::metrics::MetricsServer;
use crate::outbox::OutboxConfig;
use crate::retry::RetryPolicy;
use herald_core::subscription::{MessagePumpType, OnMissingChannel, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "HERALD_CONFIG";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        /// File path.
        path: String,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Outbox section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Outstanding ceiling for `post`; `-1` disables it.
    pub max_outstanding_messages: i64,
    /// Entries archived per batch.
    pub archive_batch_size: usize,
    /// Retries after the first send.
    pub retry_max_attempts: usize,
    /// First retry delay.
    pub retry_initial_delay_ms: u64,
    /// Retry delay cap.
    pub retry_max_delay_ms: u64,
    /// Consecutive send failures that open a topic's circuit.
    pub circuit_failure_threshold: usize,
    /// How long an open circuit rejects sends.
    pub circuit_open_ms: u64,
    /// Sweeper interval; `0` disables the sweeper.
    pub sweep_interval_ms: u64,
    /// Minimum age of swept messages.
    pub sweep_min_age_ms: u64,
    /// Messages cleared per sweep.
    pub sweep_batch_size: usize,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: -1,
            archive_batch_size: 100,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 50,
            retry_max_delay_ms: 5_000,
            circuit_failure_threshold: 5,
            circuit_open_ms: 60_000,
            sweep_interval_ms: 0,
            sweep_min_age_ms: 5_000,
            sweep_batch_size: 100,
        }
    }
}

impl OutboxSettings {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outstanding_messages < -1 {
            return Err(ConfigError::Validation(
                "outbox.max_outstanding_messages must be -1 or greater".to_string(),
            ));
        }
        if self.archive_batch_size == 0 || self.sweep_batch_size == 0 {
            return Err(ConfigError::Validation("outbox batch sizes must be positive".to_string()));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "outbox.circuit_failure_threshold must be positive".to_string(),
            ));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Validation(
                "outbox.retry_initial_delay_ms exceeds retry_max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Mediator tuning.
    #[must_use]
    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig::default()
            .with_max_outstanding_messages(self.max_outstanding_messages)
            .with_archive_batch_size(self.archive_batch_size)
            .with_retry(
                RetryPolicy::builder()
                    .max_retries(self.retry_max_attempts)
                    .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
                    .max_delay(Duration::from_millis(self.retry_max_delay_ms))
                    .build(),
            )
            .with_circuit_breaker(
                CircuitBreakerConfig::builder()
                    .failure_threshold(self.circuit_failure_threshold)
                    .timeout(Duration::from_millis(self.circuit_open_ms))
                    .build(),
            )
    }

    /// Sweeper interval, if the sweeper is enabled.
    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.sweep_interval_ms))
        }
    }
}

/// Dispatcher section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// How long `end` waits for performers.
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl DispatcherSettings {
    /// Shutdown timeout as a duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Metrics section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder.
    pub enabled: bool,
    /// Address reported for scraping.
    pub address: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl MetricsSettings {
    /// Check that the address parses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an unparseable address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(format!("metrics.address '{}': {e}", self.address)))
    }

    /// A metrics server for the configured address, when enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an unparseable address.
    pub fn server(&self) -> Result<Option<MetricsServer>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        self.validate()?;
        let addr = self
            .address
            .parse()
            .map_err(|e| ConfigError::Validation(format!("metrics.address: {e}")))?;
        Ok(Some(MetricsServer::new(addr)))
    }
}

/// One `[[subscriptions]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Unique subscription name.
    pub name: String,
    /// Broker channel name; defaults to the subscription name.
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Topic.
    pub routing_key: String,
    /// Performer count.
    #[serde(default = "defaults::performers")]
    pub performers: usize,
    /// Messages fetched per receive.
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,
    /// Receive timeout.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Requeue limit, `-1` for unlimited.
    #[serde(default = "defaults::requeue_count")]
    pub requeue_count: i32,
    /// Requeue delay.
    #[serde(default)]
    pub requeue_delay_ms: u64,
    /// Quarantine threshold, `0` to disable.
    #[serde(default)]
    pub unacceptable_message_limit: u32,
    /// Back-off after an empty read.
    #[serde(default = "defaults::empty_channel_delay_ms")]
    pub empty_channel_delay_ms: u64,
    /// Back-off after a channel failure.
    #[serde(default = "defaults::channel_failure_delay_ms")]
    pub channel_failure_delay_ms: u64,
    /// Dispatch time budget.
    #[serde(default = "defaults::dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Pump model.
    #[serde(default)]
    pub pump: MessagePumpType,
    /// Channel provisioning policy.
    #[serde(default)]
    pub make_channels: OnMissingChannel,
}

mod defaults {
    pub const fn performers() -> usize {
        1
    }
    pub const fn buffer_size() -> usize {
        1
    }
    pub const fn timeout_ms() -> u64 {
        300
    }
    pub const fn requeue_count() -> i32 {
        -1
    }
    pub const fn empty_channel_delay_ms() -> u64 {
        500
    }
    pub const fn channel_failure_delay_ms() -> u64 {
        1_000
    }
    pub const fn dispatch_timeout_ms() -> u64 {
        30_000
    }
}

impl SubscriptionConfig {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| ConfigError::Validation(format!("subscription '{}': {what}", self.name));
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation("subscription name must not be empty".to_string()));
        }
        if self.routing_key.trim().is_empty() {
            return Err(invalid("routing_key must not be empty"));
        }
        if self.performers == 0 {
            return Err(invalid("performers must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size must be at least 1"));
        }
        if self.requeue_count < -1 {
            return Err(invalid("requeue_count must be -1 or greater"));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(invalid("dispatch_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// The runtime subscription.
    #[must_use]
    pub fn to_subscription(&self) -> Subscription {
        let channel_name = self.channel_name.clone().unwrap_or_else(|| self.name.clone());
        Subscription::new(self.name.clone(), channel_name, self.routing_key.as_str())
            .with_performers(self.performers)
            .with_buffer_size(self.buffer_size)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_requeue_count(self.requeue_count)
            .with_requeue_delay(Duration::from_millis(self.requeue_delay_ms))
            .with_unacceptable_message_limit(self.unacceptable_message_limit)
            .with_empty_channel_delay(Duration::from_millis(self.empty_channel_delay_ms))
            .with_channel_failure_delay(Duration::from_millis(self.channel_failure_delay_ms))
            .with_dispatch_timeout(Duration::from_millis(self.dispatch_timeout_ms))
            .with_pump(self.pump)
            .with_make_channels(self.make_channels)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Outbox settings.
    pub outbox: OutboxSettings,
    /// Dispatcher settings.
    pub dispatcher: DispatcherSettings,
    /// Metrics settings.
    pub metrics: MetricsSettings,
    /// Subscriptions.
    #[serde(rename = "subscriptions")]
    pub subscription_configs: Vec<SubscriptionConfig>,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Validation`].
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise
    /// as [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&document)?;
        tracing::info!(path = %path.display(), subscriptions = config.subscription_configs.len(), "loaded configuration");
        Ok(config)
    }

    /// Load the file named by `HERALD_CONFIG`, or the defaults when it is unset.
    ///
    /// # Errors
    ///
    /// As [`load`](Self::load).
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load(path),
            Err(_) => {
                tracing::debug!("{CONFIG_ENV_VAR} not set, using default configuration");
                Ok(Self::default())
            },
        }
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Validation`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.outbox.validate()?;
        self.metrics.validate()?;
        let mut names = HashSet::new();
        for subscription in &self.subscription_configs {
            subscription.validate()?;
            if !names.insert(subscription.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate subscription name '{}'",
                    subscription.name
                )));
            }
        }
        Ok(())
    }

    /// Runtime subscriptions, in document order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscription_configs
            .iter()
            .map(SubscriptionConfig::to_subscription)
            .collect()
    }

    /// The named subscription.
    #[must_use]
    pub fn subscription(&self, name: &str) -> Option<Subscription> {
        self.subscription_configs
            .iter()
            .find(|s| s.name == name)
            .map(SubscriptionConfig::to_subscription)
    }
}
