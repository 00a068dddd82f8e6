//! Topic subscription and message dispatch
//!
//! This module provides the subscription listener with its recovery state
//! machine, retry policies for reconnection, the consumer interface, and the
//! metadata attached to every inbound message.

pub mod consumer;
pub mod metadata;
pub mod retry;
pub mod topic_listener;

pub use consumer::{ChannelConsumer, ConsumerError, MessageConsumer};
pub use metadata::MessageMetadata;
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy};
pub use topic_listener::{ListenerState, TopicListener};
