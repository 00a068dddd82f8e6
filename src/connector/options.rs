//! Connect Options
//!
//! Pure assembly of per-session options from configuration. Options are
//! built once per caller-initiated connect and reused verbatim by every
//! recovery attempt, so a reconnection reproduces the session the caller
//! originally asked for even if configuration changes underneath it.

use std::time::Duration;

use rumqttc::{LastWill, MqttOptions};
use tracing::debug;
use url::Url;

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::qos::DeliveryQos;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Everything one session needs, captured at connect time.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    /// Broker URI as configured, kept for metadata and logs.
    pub server_uri: String,
    pub host: String,
    pub port: u16,
    pub clean_session: bool,
    pub connection_timeout: Duration,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub last_will: Option<LastWillOptions>,
}

/// Last-will announcement carried in the connect packet.
#[derive(Debug, Clone)]
pub struct LastWillOptions {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: DeliveryQos,
    pub retained: bool,
}

impl ConnectOptions {
    /// Snapshot options for `client_id` from `config`.
    pub fn from_config(client_id: &str, config: &ConnectorConfig) -> ConnectorResult<Self> {
        if client_id.trim().is_empty() {
            return Err(ConnectorError::connection("client id must not be empty"));
        }

        let (host, port) = parse_broker_uri(&config.broker.server_uri)?;

        let last_will = config.last_will.as_ref().and_then(|will| {
            // Both a topic and a non-empty message are required; anything
            // less and the will is silently skipped.
            if will.topic.trim().is_empty() || will.message.is_empty() {
                debug!("last-will topic or message missing, skipping will registration");
                return None;
            }
            Some(LastWillOptions {
                topic: will.topic.clone(),
                message: will.message.clone().into_bytes(),
                qos: will.qos,
                retained: will.retained,
            })
        });

        Ok(Self {
            client_id: client_id.to_string(),
            server_uri: config.broker.server_uri.clone(),
            host,
            port,
            clean_session: config.broker.clean_session,
            connection_timeout: config.broker.connection_timeout(),
            keep_alive: config.broker.keep_alive(),
            username: config.broker.username.clone(),
            password: config.broker.password.clone(),
            last_will,
        })
    }

    /// Map the snapshot onto the transport's options type.
    pub fn to_mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_clean_session(self.clean_session);
        options.set_keep_alive(self.keep_alive);

        if let Some(username) = &self.username {
            // The transport requires both fields; a lone username gets an
            // empty password.
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }

        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.message.clone(),
                will.qos.into(),
                will.retained,
            ));
        }

        options
    }
}

/// Accept tcp:// and mqtt:// URIs; TLS schemes are not supported here.
fn parse_broker_uri(uri: &str) -> ConnectorResult<(String, u16)> {
    let parsed = Url::parse(uri).map_err(|e| ConnectorError::InvalidBrokerUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "tcp" | "mqtt" => {}
        "ssl" | "mqtts" | "wss" => {
            return Err(ConnectorError::InvalidBrokerUri {
                uri: uri.to_string(),
                reason: "TLS transports are not supported; use tcp:// or mqtt://".to_string(),
            })
        }
        other => {
            return Err(ConnectorError::InvalidBrokerUri {
                uri: uri.to_string(),
                reason: format!("unsupported scheme '{other}' (expected tcp:// or mqtt://)"),
            })
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ConnectorError::InvalidBrokerUri {
            uri: uri.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();

    Ok((host, parsed.port().unwrap_or(DEFAULT_MQTT_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LastWillConfig;

    fn base_config() -> ConnectorConfig {
        ConnectorConfig::new("unit-client")
    }

    #[test]
    fn test_defaults_map_to_localhost_1883() {
        let options = ConnectOptions::from_config("unit-client", &base_config()).unwrap();
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 1883);
        assert!(options.clean_session);
        assert_eq!(options.connection_timeout, Duration::from_secs(30));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_port_is_honored() {
        let mut config = base_config();
        config.broker.server_uri = "mqtt://broker.internal:2883".to_string();
        let options = ConnectOptions::from_config("unit-client", &config).unwrap();
        assert_eq!(options.host, "broker.internal");
        assert_eq!(options.port, 2883);
    }

    #[test]
    fn test_tls_scheme_is_rejected() {
        let mut config = base_config();
        config.broker.server_uri = "ssl://broker.internal:8883".to_string();
        let err = ConnectOptions::from_config("unit-client", &config).unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidBrokerUri { .. }));
    }

    #[test]
    fn test_garbage_uri_is_rejected() {
        let mut config = base_config();
        config.broker.server_uri = "not a uri".to_string();
        assert!(matches!(
            ConnectOptions::from_config("unit-client", &config),
            Err(ConnectorError::InvalidBrokerUri { .. })
        ));
    }

    #[test]
    fn test_empty_client_id_is_rejected() {
        let err = ConnectOptions::from_config("  ", &base_config()).unwrap_err();
        assert!(matches!(err, ConnectorError::Connection { .. }));
    }

    #[test]
    fn test_last_will_requires_topic_and_message() {
        let mut config = base_config();
        config.last_will = Some(LastWillConfig {
            topic: "status/unit".to_string(),
            message: String::new(),
            qos: DeliveryQos::ExactlyOnce,
            retained: false,
        });
        let options = ConnectOptions::from_config("unit-client", &config).unwrap();
        assert!(options.last_will.is_none());

        config.last_will.as_mut().unwrap().message = "offline".to_string();
        let options = ConnectOptions::from_config("unit-client", &config).unwrap();
        let will = options.last_will.unwrap();
        assert_eq!(will.topic, "status/unit");
        assert_eq!(will.message, b"offline");
        assert_eq!(will.qos, DeliveryQos::ExactlyOnce);
        assert!(!will.retained);
    }

    #[test]
    fn test_configured_retained_flag_is_carried() {
        let mut config = base_config();
        config.last_will = Some(LastWillConfig {
            topic: "status/unit".to_string(),
            message: "gone".to_string(),
            qos: DeliveryQos::AtLeastOnce,
            retained: true,
        });
        let options = ConnectOptions::from_config("unit-client", &config).unwrap();
        assert!(options.last_will.unwrap().retained);
    }

    #[test]
    fn test_transport_options_carry_session_settings() {
        let mut config = base_config();
        config.broker.clean_session = false;
        config.broker.username = Some("svc".to_string());
        let options = ConnectOptions::from_config("unit-client", &config).unwrap();

        let mqtt = options.to_mqtt_options();
        assert_eq!(mqtt.client_id(), "unit-client");
        assert!(!mqtt.clean_session());
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(60));
        let (user, pass) = mqtt.credentials().unwrap();
        assert_eq!(user, "svc");
        assert!(pass.is_empty());
    }
}
