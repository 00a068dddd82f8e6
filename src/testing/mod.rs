//! Testing utilities and mock implementations
//!
//! This module provides a mock connector and consumers for testing listener
//! and publish behavior without requiring an MQTT broker.

pub mod mocks;

pub use mocks::*;
