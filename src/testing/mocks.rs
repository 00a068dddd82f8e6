//! Mock implementations for testing
//!
//! Provides a mock Connector and recording consumers so listener and
//! delivery behavior can be tested without a broker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::connector::manager::Connector;
use crate::connector::session::{InboundMessage, SessionEvent};
use crate::connector::tracker::{AckTracker, DeliveryToken};
use crate::error::{ConnectorError, ConnectorResult};
use crate::listener::consumer::{ConsumerError, MessageConsumer};
use crate::listener::metadata::MessageMetadata;
use crate::qos::{DeliveryQos, TopicSubscription};

pub type PublishedMessage = (String, Vec<u8>, DeliveryQos);

const MOCK_EVENT_CAPACITY: usize = 64;

/// Mock connector for testing listeners and publish flows.
///
/// Tests drive the session side by emitting events; the listener under test
/// reacts exactly as it would against a live broker.
pub struct MockConnector {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscribe_requests: Arc<Mutex<Vec<Vec<TopicSubscription>>>>,
    event_tx: Arc<Mutex<Option<mpsc::Sender<SessionEvent>>>>,
    tracker: Arc<AckTracker>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Acknowledgments are immediate unless a test holds them back.
    hold_acks: AtomicBool,
    remaining_connect_failures: AtomicU32,
    remaining_reconnect_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    teardown_count: AtomicU32,
    client_id: String,
    server_uri: String,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscribe_requests: Arc::new(Mutex::new(Vec::new())),
            event_tx: Arc::new(Mutex::new(None)),
            tracker: Arc::new(AckTracker::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            hold_acks: AtomicBool::new(false),
            remaining_connect_failures: AtomicU32::new(0),
            remaining_reconnect_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            teardown_count: AtomicU32::new(0),
            client_id: "mock-client".to_string(),
            server_uri: "tcp://mock-broker:1883".to_string(),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails.
    pub fn with_connect_failure() -> Self {
        Self {
            remaining_connect_failures: AtomicU32::new(u32::MAX),
            ..Self::default()
        }
    }

    /// The first `attempts` reconnects fail, later ones succeed.
    pub fn with_reconnect_failures(attempts: u32) -> Self {
        Self {
            remaining_reconnect_failures: AtomicU32::new(attempts),
            ..Self::default()
        }
    }

    /// Published messages stay unacknowledged until a test resolves them.
    pub fn with_held_acks() -> Self {
        Self {
            hold_acks: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Deliver a message to the attached listener as if the broker sent it.
    pub async fn emit_inbound(&self, message: InboundMessage) -> bool {
        let tx = self.event_tx.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(SessionEvent::MessageArrived(message))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Convenience wrapper for a plain QoS 1 message.
    pub async fn emit_message(&self, topic: &str, payload: &[u8]) -> bool {
        self.emit_inbound(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos: DeliveryQos::AtLeastOnce,
            duplicate: false,
            retained: false,
        })
        .await
    }

    /// Simulate a dropped connection: pending publishes fail, the listener
    /// gets a loss notification, and the event stream closes.
    pub async fn emit_connection_lost(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.tracker.fail_all(&format!("connection lost: {reason}"));
        let tx = self.event_tx.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx
                .send(SessionEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Close the event stream without a loss notification, as when the
    /// session dies before the notification can be delivered.
    pub async fn sever_stream(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tracker.fail_all("connection lost: stream severed");
        self.event_tx.lock().await.take();
    }

    /// Acknowledge everything currently in flight.
    pub fn complete_deliveries(&self) -> usize {
        self.tracker.acknowledge_all()
    }

    /// Fail everything currently in flight.
    pub fn fail_deliveries(&self, reason: &str) -> usize {
        self.tracker.fail_all(reason)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> u32 {
        self.teardown_count.load(Ordering::SeqCst)
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn get_subscribe_requests(&self) -> Vec<Vec<TopicSubscription>> {
        self.subscribe_requests.lock().await.clone()
    }

    async fn open_stream(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(MOCK_EVENT_CAPACITY);
        *self.event_tx.lock().await = Some(tx);
        rx
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> ConnectorResult<()> {
        if decrement(&self.remaining_connect_failures) {
            return Err(ConnectorError::connection("mock connect failure"));
        }
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.tracker.fail_all("session closed");
        // Dropping the sender ends the listener's event stream without a
        // loss notification, exactly like a requested disconnect.
        self.event_tx.lock().await.take();
        Ok(())
    }

    async fn teardown(&self) -> ConnectorResult<()> {
        self.teardown_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.event_tx.lock().await.take();
        Ok(())
    }

    async fn reconnect(&self) -> ConnectorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::cancelled(
                "disconnect requested, reconnect abandoned",
            ));
        }
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if decrement(&self.remaining_reconnect_failures) {
            return Err(ConnectorError::connection("mock reconnect failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriptions: &[TopicSubscription],
    ) -> ConnectorResult<mpsc::Receiver<SessionEvent>> {
        if !self.is_connected() {
            return Err(ConnectorError::not_connected(
                "subscribe requires an active connection",
            ));
        }
        // Stream first, then the recorded request: a test that polls the
        // request list may emit as soon as the new entry shows up.
        let stream = self.open_stream().await;
        self.subscribe_requests
            .lock()
            .await
            .push(subscriptions.to_vec());
        Ok(stream)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        wait: Option<Duration>,
    ) -> ConnectorResult<DeliveryToken> {
        if !self.is_connected() {
            return Err(ConnectorError::not_connected(
                "publish requires an active connection",
            ));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload, qos));

        let token = self.tracker.register(topic, qos);
        if !self.hold_acks.load(Ordering::SeqCst) {
            self.tracker.acknowledge_all();
        }
        if let Some(wait) = wait {
            token.wait_for_completion(wait).await?;
        }
        Ok(token)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn client_id(&self) -> Option<String> {
        Some(self.client_id.clone())
    }

    fn server_uri(&self) -> String {
        self.server_uri.clone()
    }
}

/// Decrement a failure budget, reporting whether this call should fail.
fn decrement(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Consumer that records everything it is given.
#[derive(Clone, Default)]
pub struct RecordingConsumer {
    received: Arc<Mutex<Vec<(Bytes, MessageMetadata)>>>,
    attempts: Arc<AtomicUsize>,
    remaining_failures: Arc<AtomicUsize>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `count` deliveries fail; later ones are recorded.
    pub fn with_failures(count: usize) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicUsize::new(count)),
            ..Self::default()
        }
    }

    /// Total process calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn get_received(&self) -> Vec<(Bytes, MessageMetadata)> {
        self.received.lock().await.clone()
    }

    /// Poll until `count` messages were recorded or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.received.lock().await.len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MessageConsumer for RecordingConsumer {
    async fn process(
        &self,
        payload: Bytes,
        metadata: MessageMetadata,
    ) -> Result<(), ConsumerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failures = &self.remaining_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConsumerError::from("simulated consumer failure"));
        }
        self.received.lock().await.push((payload, metadata));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connector_publish_records_and_acknowledges() {
        let connector = MockConnector::new();
        connector.connect().await.unwrap();

        let token = connector
            .publish(
                "sensors/temp",
                b"21.5".to_vec(),
                DeliveryQos::AtLeastOnce,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(token.is_complete());
        let published = connector.get_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "sensors/temp");
        assert_eq!(published[0].2, DeliveryQos::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_mock_connector_held_acks_leave_tokens_pending() {
        let connector = MockConnector::with_held_acks();
        connector.connect().await.unwrap();

        let token = connector
            .publish("sensors/temp", b"x".to_vec(), DeliveryQos::ExactlyOnce, None)
            .await
            .unwrap();

        assert!(!token.is_complete());
        assert_eq!(connector.in_flight(), 1);
        assert_eq!(connector.complete_deliveries(), 1);
        assert!(token.is_complete());
    }

    #[tokio::test]
    async fn test_mock_connector_emits_to_subscriber() {
        let connector = MockConnector::new();
        connector.connect().await.unwrap();

        let mut events = connector
            .subscribe(&[TopicSubscription::new("sensors/#")])
            .await
            .unwrap();
        assert!(connector.emit_message("sensors/temp", b"20.1").await);

        match events.recv().await {
            Some(SessionEvent::MessageArrived(message)) => {
                assert_eq!(message.topic, "sensors/temp");
                assert_eq!(message.payload.as_ref(), b"20.1");
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_connector_loss_closes_the_stream() {
        let connector = MockConnector::new();
        connector.connect().await.unwrap();
        let mut events = connector
            .subscribe(&[TopicSubscription::new("sensors/#")])
            .await
            .unwrap();

        connector.emit_connection_lost("mock failure").await;

        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::ConnectionLost { .. })
        ));
        assert!(events.recv().await.is_none());
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_mock_connector_reconnect_failure_budget() {
        let connector = MockConnector::with_reconnect_failures(2);
        connector.connect().await.unwrap();

        assert!(connector.reconnect().await.is_err());
        assert!(connector.reconnect().await.is_err());
        assert!(connector.reconnect().await.is_ok());
        assert_eq!(connector.reconnect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_recording_consumer_counts_failures_separately() {
        let consumer = RecordingConsumer::with_failures(1);
        let metadata = MessageMetadata {
            topic_name: "t".to_string(),
            qos: DeliveryQos::AtLeastOnce,
            duplicate: false,
            retained: false,
            client_id: "c".to_string(),
            server_uri: "tcp://localhost:1883".to_string(),
        };

        assert!(consumer
            .process(Bytes::from_static(b"a"), metadata.clone())
            .await
            .is_err());
        assert!(consumer
            .process(Bytes::from_static(b"b"), metadata)
            .await
            .is_ok());

        assert_eq!(consumer.attempts(), 2);
        assert_eq!(consumer.get_received().await.len(), 1);
    }
}
