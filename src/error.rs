//! Connector Error Types
//!
//! One taxonomy for every fallible operation so callers can match on the
//! failure class instead of inspecting message strings. Transport failures
//! are preserved as `source` chains.

use thiserror::Error;

use crate::config::ConfigError;
use crate::qos::InvalidQos;

/// Result alias used by all public operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Boxed source error carried by the transport-facing variants.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Session establishment or teardown against the broker failed.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The broker URI could not be parsed or uses an unsupported scheme.
    #[error("invalid broker URI '{uri}': {reason}")]
    InvalidBrokerUri { uri: String, reason: String },

    /// The publish journal could not be opened or updated.
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// A subscribe request was rejected or could not be issued.
    #[error("subscription error: {message}")]
    Subscription {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// A numeric QoS code outside the protocol range.
    #[error(transparent)]
    InvalidQos(#[from] InvalidQos),

    /// An outbound publish failed before the broker acknowledged it.
    #[error("delivery error: {message}")]
    Delivery {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The broker did not acknowledge a publish within the caller's bound.
    #[error("delivery not acknowledged within {waited_ms}ms")]
    DeliveryTimeout { waited_ms: u64 },

    /// The retry policy gave up before a recovery attempt succeeded.
    #[error("reconnection abandoned after {attempts} failed attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The operation requires an active session and found none.
    #[error("not connected: {message}")]
    NotConnected { message: String },

    /// The operation lost a race against a caller-initiated disconnect.
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ConnectorError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection_with<S: Into<String>, E: Into<BoxedError>>(message: S, source: E) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    pub fn persistence_with<S: Into<String>, E: Into<BoxedError>>(message: S, source: E) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn subscription<S: Into<String>>(message: S) -> Self {
        Self::Subscription {
            message: message.into(),
            source: None,
        }
    }

    pub fn subscription_with<S: Into<String>, E: Into<BoxedError>>(message: S, source: E) -> Self {
        Self::Subscription {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn delivery<S: Into<String>>(message: S) -> Self {
        Self::Delivery {
            message: message.into(),
            source: None,
        }
    }

    pub fn delivery_with<S: Into<String>, E: Into<BoxedError>>(message: S, source: E) -> Self {
        Self::Delivery {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// True for failures a recovery cycle may reasonably try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Subscription { .. } | Self::NotConnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = ConnectorError::connection("broker rejected the handshake");
        assert_eq!(
            err.to_string(),
            "connection error: broker rejected the handshake"
        );

        let err = ConnectorError::DeliveryTimeout { waited_ms: 1500 };
        assert_eq!(err.to_string(), "delivery not acknowledged within 1500ms");
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ConnectorError::connection_with("could not reach broker", io);

        let source = std::error::Error::source(&err).expect("source should be set");
        assert!(source.to_string().contains("refused"));
    }

    #[test]
    fn test_invalid_qos_converts() {
        let err: ConnectorError = InvalidQos(7).into();
        assert!(matches!(err, ConnectorError::InvalidQos(InvalidQos(7))));
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ConnectorError::connection("lost").is_retryable());
        assert!(ConnectorError::not_connected("no session").is_retryable());
        assert!(!ConnectorError::cancelled("disconnect won").is_retryable());
        assert!(!ConnectorError::ReconnectExhausted { attempts: 3 }.is_retryable());
    }
}
