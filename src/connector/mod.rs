//! Broker connection layer
//!
//! This module provides the connection manager, the per-session event-loop
//! driver, delivery tokens for acknowledged publishing, and the options
//! snapshot taken at connect time.

pub mod manager;
pub mod options;
pub mod session;
pub mod tracker;

pub use manager::{Connector, MqttConnector};
pub use options::ConnectOptions;
pub use session::{ConnectionStatus, InboundMessage, SessionEvent};
pub use tracker::{DeliveryOutcome, DeliveryToken};
