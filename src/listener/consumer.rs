//! Message Consumers
//!
//! A consumer receives each inbound message exactly as the listener took it
//! off the session stream. Implementations decide what processing means; the
//! listener only logs failures and keeps going, so a consumer that needs
//! retries has to arrange them itself.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::listener::metadata::MessageMetadata;

pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn process(&self, payload: Bytes, metadata: MessageMetadata)
        -> Result<(), ConsumerError>;
}

/// Consumer that hands messages to a bounded channel, letting application
/// code receive them outside the listener task.
pub struct ChannelConsumer {
    tx: mpsc::Sender<(Bytes, MessageMetadata)>,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(Bytes, MessageMetadata)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageConsumer for ChannelConsumer {
    async fn process(
        &self,
        payload: Bytes,
        metadata: MessageMetadata,
    ) -> Result<(), ConsumerError> {
        self.tx
            .send((payload, metadata))
            .await
            .map_err(|_| ConsumerError::from("message receiver was dropped"))
    }
}
