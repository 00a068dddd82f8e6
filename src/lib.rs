//! MQTT Connector
//!
//! A client adapter for MQTT 3.1.1 brokers with acknowledged publishing and
//! self-healing topic subscriptions.
//!
//! # Overview
//!
//! This crate provides everything an application needs to talk to a broker:
//! - Connection management with clean or durable sessions and last-will
//! - Publishing at all three QoS levels with delivery tokens and bounded waits
//! - A file-backed journal that replays unacknowledged publishes
//! - Topic listeners that resubscribe automatically after connection loss
//! - Retry policies with exponential backoff and jitter
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mqtt_connector::config::ConnectorConfig;
//! use mqtt_connector::connector::{Connector, MqttConnector};
//! use mqtt_connector::listener::{ChannelConsumer, TopicListener};
//! use mqtt_connector::qos::{DeliveryQos, TopicSubscription};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ConnectorConfig::new("sensor-gateway");
//! config.broker.server_uri = "tcp://broker.example:1883".to_string();
//!
//! let connector = Arc::new(MqttConnector::new(config));
//! connector.connect().await?;
//!
//! // Publish with a bounded wait for the broker acknowledgment.
//! connector
//!     .publish(
//!         "sensors/kitchen/temp",
//!         b"21.5".to_vec(),
//!         DeliveryQos::AtLeastOnce,
//!         Some(Duration::from_secs(5)),
//!     )
//!     .await?;
//!
//! // Listen with automatic resubscription after connection loss.
//! let (consumer, mut messages) = ChannelConsumer::new(64);
//! let listener = TopicListener::new(
//!     Arc::clone(&connector),
//!     vec![TopicSubscription::new("sensors/#")],
//!     Arc::new(consumer),
//! )?;
//! listener.subscribe().await?;
//!
//! while let Some((payload, metadata)) = messages.recv().await {
//!     println!("{}: {} bytes", metadata.topic_name, payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod observability;
pub mod persistence;
pub mod qos;
pub mod testing;

pub use config::*;
pub use connector::{
    ConnectOptions, ConnectionStatus, Connector, DeliveryOutcome, DeliveryToken, InboundMessage,
    MqttConnector, SessionEvent,
};
pub use error::{ConnectorError, ConnectorResult};
pub use listener::{
    BackoffPolicy, ChannelConsumer, ListenerState, MessageConsumer, MessageMetadata, RetryDecision,
    RetryPolicy, TopicListener,
};
pub use qos::{DeliveryQos, TopicSubscription, MQTT_DEFAULT_QOS};
