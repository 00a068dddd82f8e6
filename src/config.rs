//! Connector Configuration
//!
//! TOML-deserialized settings for the connection manager and its listeners.
//! Every field with a protocol default may be omitted; defaults live in one
//! function each so they are never re-derived inline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::qos::{DeliveryQos, TopicSubscription};

/// Broker address assumed when none is configured.
pub const DEFAULT_BROKER_URI: &str = "tcp://localhost:1883";

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration consumed by [`crate::MqttConnector`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    pub broker: BrokerConfig,
    /// Last-will announcement registered at connect time.
    #[serde(default)]
    pub last_will: Option<LastWillConfig>,
    /// Subscriptions a host wants a listener to cover.
    #[serde(default)]
    pub subscriptions: Vec<TopicSubscription>,
}

/// Broker session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Broker URI; tcp:// and mqtt:// schemes only.
    #[serde(default = "default_server_uri")]
    pub server_uri: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Discard broker-side session state on connect.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Bound on waiting for the broker's connect acknowledgment.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Directory for the in-flight publish journal; unset disables durability.
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
    /// QoS used when a publish call does not specify one.
    #[serde(default)]
    pub default_publish_qos: DeliveryQos,
}

/// Last-will message the broker publishes if the session dies uncleanly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillConfig {
    pub topic: String,
    pub message: String,
    #[serde(default = "default_last_will_qos")]
    pub qos: DeliveryQos,
    #[serde(default)]
    pub retained: bool,
}

fn default_server_uri() -> String {
    DEFAULT_BROKER_URI.to_string()
}

fn default_clean_session() -> bool {
    true
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_last_will_qos() -> DeliveryQos {
    DeliveryQos::ExactlyOnce
}

impl BrokerConfig {
    /// Defaults for everything except the client identifier.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            server_uri: default_server_uri(),
            client_id: client_id.into(),
            clean_session: default_clean_session(),
            username: None,
            password: None,
            connection_timeout_secs: default_connection_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            persistence_dir: None,
            default_publish_qos: DeliveryQos::default(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl ConnectorConfig {
    /// Broker defaults plus `client_id`; no last-will, no subscriptions.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            broker: BrokerConfig::new(client_id),
            last_will: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".to_string(),
            ));
        }
        if self.broker.connection_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "broker.connection_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.broker.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::Validation(format!(
                "broker.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if let Some(sub) = self
            .subscriptions
            .iter()
            .find(|sub| sub.topic_filter().trim().is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "subscription topic filters must not be empty (offending entry: {sub:?})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_applies_defaults() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            [broker]
            client_id = "pipeline-7"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.server_uri, DEFAULT_BROKER_URI);
        assert!(config.broker.clean_session);
        assert_eq!(config.broker.connection_timeout_secs, 30);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.broker.default_publish_qos, DeliveryQos::AtLeastOnce);
        assert!(config.last_will.is_none());
        assert!(config.subscriptions.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_toml_parses() {
        let config: ConnectorConfig = toml::from_str(
            r#"
            [broker]
            server_uri = "mqtt://broker.internal:2883"
            client_id = "ingest-4"
            clean_session = false
            username = "ingest"
            password = "hunter2"
            connection_timeout_secs = 10
            keep_alive_secs = 30
            persistence_dir = "/var/lib/ingest/journal"
            default_publish_qos = 2

            [last_will]
            topic = "status/ingest-4"
            message = "offline"
            retained = true

            [[subscriptions]]
            topic_filter = "commands/ingest-4"
            qos = 2

            [[subscriptions]]
            topic_filter = "broadcast/#"
            "#,
        )
        .unwrap();

        assert!(!config.broker.clean_session);
        assert_eq!(config.broker.default_publish_qos, DeliveryQos::ExactlyOnce);

        let will = config.last_will.as_ref().unwrap();
        assert_eq!(will.qos, DeliveryQos::ExactlyOnce);
        assert!(will.retained);

        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(
            config.subscriptions[0].effective_qos(),
            DeliveryQos::ExactlyOnce
        );
        assert_eq!(
            config.subscriptions[1].effective_qos(),
            DeliveryQos::AtLeastOnce
        );
    }

    #[test]
    fn test_invalid_qos_code_is_rejected_at_parse() {
        let result = toml::from_str::<ConnectorConfig>(
            r#"
            [broker]
            client_id = "x"
            default_publish_qos = 5
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_client_id_fails_validation() {
        let config = ConnectorConfig::new("  ");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_sub_minimum_keep_alive_fails_validation() {
        let mut config = ConnectorConfig::new("edge-1");
        config.broker.keep_alive_secs = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_subscription_filter_fails_validation() {
        let mut config = ConnectorConfig::new("edge-1");
        config.subscriptions.push(TopicSubscription::new(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_last_will_qos_is_exactly_once() {
        assert_eq!(default_last_will_qos(), DeliveryQos::ExactlyOnce);
    }
}
