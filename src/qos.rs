//! Delivery Guarantees and Subscription Requests
//!
//! Value types shared by the connection manager and the subscription
//! listener: the delivery quality-of-service model and the per-topic
//! subscription request.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// QoS applied wherever a caller or configuration leaves the level unset.
///
/// Every fallback in the crate references this constant; the value is not
/// re-derived anywhere else.
pub const MQTT_DEFAULT_QOS: DeliveryQos = DeliveryQos::AtLeastOnce;

/// A QoS code outside the protocol's 0..=2 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} is not a valid QoS code (expected 0, 1 or 2)")]
pub struct InvalidQos(pub u8);

/// Delivery guarantee requested for a publish or a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryQos {
    /// QoS 0. The message is handed to the transport and forgotten.
    FireAndForget,
    /// QoS 1. Redelivered until acknowledged; duplicates possible.
    AtLeastOnce,
    /// QoS 2. Four-way handshake; exactly one delivery per session.
    ExactlyOnce,
}

impl DeliveryQos {
    /// Numeric wire code for this level.
    pub const fn code(self) -> u8 {
        match self {
            DeliveryQos::FireAndForget => 0,
            DeliveryQos::AtLeastOnce => 1,
            DeliveryQos::ExactlyOnce => 2,
        }
    }

    /// Parse a numeric code, rejecting anything outside 0..=2.
    pub const fn from_code(code: u8) -> Result<Self, InvalidQos> {
        match code {
            0 => Ok(DeliveryQos::FireAndForget),
            1 => Ok(DeliveryQos::AtLeastOnce),
            2 => Ok(DeliveryQos::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DeliveryQos::FireAndForget => "fire-and-forget",
            DeliveryQos::AtLeastOnce => "at-least-once",
            DeliveryQos::ExactlyOnce => "exactly-once",
        }
    }
}

impl Default for DeliveryQos {
    fn default() -> Self {
        MQTT_DEFAULT_QOS
    }
}

impl fmt::Display for DeliveryQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<DeliveryQos> for rumqttc::QoS {
    fn from(qos: DeliveryQos) -> Self {
        match qos {
            DeliveryQos::FireAndForget => rumqttc::QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            DeliveryQos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for DeliveryQos {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => DeliveryQos::FireAndForget,
            rumqttc::QoS::AtLeastOnce => DeliveryQos::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => DeliveryQos::ExactlyOnce,
        }
    }
}

// Configuration files carry QoS as the numeric wire code.
impl Serialize for DeliveryQos {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for DeliveryQos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        DeliveryQos::from_code(code).map_err(de::Error::custom)
    }
}

/// One topic filter a listener wants delivered, with an optional QoS.
///
/// Leaving the QoS unset defers to [`MQTT_DEFAULT_QOS`] at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    topic_filter: String,
    qos: Option<DeliveryQos>,
}

impl TopicSubscription {
    pub fn new(topic_filter: impl Into<String>) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos: None,
        }
    }

    pub fn with_qos(mut self, qos: DeliveryQos) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }

    pub fn requested_qos(&self) -> Option<DeliveryQos> {
        self.qos
    }

    /// Requested QoS, or the crate default when none was set.
    pub fn effective_qos(&self) -> DeliveryQos {
        self.qos.unwrap_or(MQTT_DEFAULT_QOS)
    }
}

impl fmt::Display for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (QoS {})",
            self.topic_filter,
            self.effective_qos().code()
        )
    }
}
