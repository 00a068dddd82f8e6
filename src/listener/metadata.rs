//! Inbound Message Metadata
//!
//! Every consumed message carries the same metadata regardless of which
//! transport details produced it: topic, QoS, duplicate and retained flags,
//! plus the client id and broker URI of the session that received it.
//! Downstream systems read these through stable `mqtt.`-prefixed keys.

use std::collections::HashMap;

use serde::Serialize;

use crate::qos::DeliveryQos;

pub const METADATA_KEY_PREFIX: &str = "mqtt";
pub const TOPIC_NAME_KEY: &str = "mqtt.topicName";
pub const QOS_KEY: &str = "mqtt.qos";
pub const DUPLICATE_KEY: &str = "mqtt.duplicate";
pub const RETAINED_KEY: &str = "mqtt.retained";
pub const CLIENT_ID_KEY: &str = "mqtt.clientId";
pub const SERVER_URI_KEY: &str = "mqtt.serverUri";

/// Metadata attached to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Concrete topic the message was published to, not the subscribed
    /// filter it matched.
    pub topic_name: String,
    pub qos: DeliveryQos,
    /// Set when the broker re-delivers a message it believes was unconfirmed.
    pub duplicate: bool,
    /// Set when this is a retained message replayed on subscription.
    pub retained: bool,
    pub client_id: String,
    pub server_uri: String,
}

impl MessageMetadata {
    /// Flatten into string key/value pairs under the `mqtt.` prefix.
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (TOPIC_NAME_KEY.to_string(), self.topic_name.clone()),
            (QOS_KEY.to_string(), self.qos.code().to_string()),
            (DUPLICATE_KEY.to_string(), self.duplicate.to_string()),
            (RETAINED_KEY.to_string(), self.retained.to_string()),
            (CLIENT_ID_KEY.to_string(), self.client_id.clone()),
            (SERVER_URI_KEY.to_string(), self.server_uri.clone()),
        ])
    }
}
