//! Listener Recovery Tests
//!
//! Tests the subscription listener state machine against a mock connector:
//! - Message dispatch and metadata
//! - Automatic resubscription after connection loss
//! - Retry policy exhaustion and terminal failure
//! - Disconnect winning over in-progress recovery
//! - Prompt shutdown during backoff

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use mqtt_connector::connector::{Connector, InboundMessage};
use mqtt_connector::error::ConnectorError;
use mqtt_connector::listener::{BackoffPolicy, ListenerState, TopicListener};
use mqtt_connector::qos::{DeliveryQos, TopicSubscription};
use mqtt_connector::testing::{MockConnector, RecordingConsumer};

const WAIT: Duration = Duration::from_secs(5);

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::new()
        .with_initial_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_jitter(0.0)
}

async fn subscribed_listener(
    connector: &Arc<MockConnector>,
    consumer: &RecordingConsumer,
    policy: BackoffPolicy,
) -> TopicListener<MockConnector> {
    connector.connect().await.unwrap();
    let listener = TopicListener::new(
        Arc::clone(connector),
        vec![
            TopicSubscription::new("sensors/#").with_qos(DeliveryQos::AtLeastOnce),
            TopicSubscription::new("alerts/fire"),
        ],
        Arc::new(consumer.clone()),
    )
    .unwrap()
    .with_retry_policy(policy);
    listener.subscribe().await.unwrap();
    listener
}

async fn wait_for_state<F>(listener: &TopicListener<MockConnector>, accept: F) -> bool
where
    F: Fn(&ListenerState) -> bool,
{
    let mut watch = listener.state_watch();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let current = watch.borrow_and_update().clone();
        if accept(&current) {
            return true;
        }
        match tokio::time::timeout_at(deadline, watch.changed()).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
    }
}

async fn wait_for_subscribe_count(connector: &MockConnector, count: usize) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
        if connector.get_subscribe_requests().await.len() >= count {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_listener_delivers_messages_with_metadata() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    assert_eq!(listener.state(), ListenerState::Subscribed);
    assert!(
        connector
            .emit_inbound(InboundMessage {
                topic: "sensors/kitchen/temp".to_string(),
                payload: Bytes::from_static(b"21.5"),
                qos: DeliveryQos::ExactlyOnce,
                duplicate: true,
                retained: true,
            })
            .await
    );

    assert!(consumer.wait_for(1, WAIT).await, "message never arrived");
    let received = consumer.get_received().await;
    let (payload, metadata) = &received[0];
    assert_eq!(payload.as_ref(), b"21.5");
    assert_eq!(metadata.topic_name, "sensors/kitchen/temp");
    assert_eq!(metadata.qos, DeliveryQos::ExactlyOnce);
    assert!(metadata.duplicate);
    assert!(metadata.retained);
    assert_eq!(metadata.client_id, "mock-client");
    assert_eq!(metadata.server_uri, "tcp://mock-broker:1883");

    // One subscribe call carrying every filter in input order.
    let requests = connector.get_subscribe_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 2);
    assert_eq!(requests[0][0].topic_filter(), "sensors/#");
    assert_eq!(requests[0][1].topic_filter(), "alerts/fire");
}

#[tokio::test]
async fn test_listener_resubscribes_after_connection_loss() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    assert!(connector.emit_message("sensors/a", b"1").await);
    assert!(consumer.wait_for(1, WAIT).await);

    connector.emit_connection_lost("broker went away").await;

    assert!(
        wait_for_subscribe_count(&connector, 2).await,
        "listener never resubscribed"
    );
    assert!(wait_for_state(&listener, |s| *s == ListenerState::Subscribed).await);
    assert_eq!(connector.reconnect_attempts(), 1);
    assert!(connector.teardown_count() >= 1);

    // The replayed subscribe carries the original filters.
    let requests = connector.get_subscribe_requests().await;
    assert_eq!(requests[0], requests[1]);

    assert!(connector.emit_message("sensors/b", b"2").await);
    assert!(consumer.wait_for(2, WAIT).await, "post-recovery message lost");
}

#[tokio::test]
async fn test_listener_recovers_when_the_stream_closes_without_a_loss_event() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    // The session dies and its stream closes before any loss notification
    // reaches the listener.
    connector.sever_stream().await;

    assert!(
        wait_for_subscribe_count(&connector, 2).await,
        "listener never resubscribed"
    );
    assert!(wait_for_state(&listener, |s| *s == ListenerState::Subscribed).await);
    assert_eq!(connector.reconnect_attempts(), 1);

    let requests = connector.get_subscribe_requests().await;
    assert_eq!(requests[0], requests[1]);

    assert!(connector.emit_message("sensors/c", b"3").await);
    assert!(consumer.wait_for(1, WAIT).await, "post-recovery message lost");
}

#[tokio::test]
async fn test_listener_keeps_retrying_until_reconnect_succeeds() {
    let connector = Arc::new(MockConnector::with_reconnect_failures(2));
    let consumer = RecordingConsumer::new();
    let _listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    connector.emit_connection_lost("flaky network").await;

    assert!(wait_for_subscribe_count(&connector, 2).await);
    assert_eq!(connector.reconnect_attempts(), 3);
}

#[tokio::test]
async fn test_listener_fails_terminally_when_policy_exhausts() {
    let connector = Arc::new(MockConnector::with_reconnect_failures(u32::MAX));
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(
        &connector,
        &consumer,
        fast_policy().with_max_attempts(2),
    )
    .await;

    connector.emit_connection_lost("broker gone for good").await;

    assert!(
        wait_for_state(&listener, ListenerState::is_terminal).await,
        "listener never reached the terminal state"
    );
    match listener.state() {
        ListenerState::Failed { reason } => {
            assert!(reason.contains('2'), "reason should name the attempt count: {reason}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(connector.reconnect_attempts(), 2);
    // No subscribe is issued once the listener has failed.
    assert_eq!(connector.get_subscribe_requests().await.len(), 1);
}

#[tokio::test]
async fn test_disconnect_stops_the_listener_without_recovery() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    connector.disconnect().await.unwrap();

    assert!(wait_for_state(&listener, |s| *s == ListenerState::Unsubscribed).await);
    assert_eq!(connector.reconnect_attempts(), 0);
    assert_eq!(connector.get_subscribe_requests().await.len(), 1);
}

#[tokio::test]
async fn test_disconnect_during_backoff_cancels_recovery() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(
        &connector,
        &consumer,
        BackoffPolicy::new()
            .with_initial_delay(Duration::from_millis(200))
            .with_jitter(0.0),
    )
    .await;

    connector.emit_connection_lost("transient outage").await;
    assert!(wait_for_state(&listener, |s| matches!(s, ListenerState::Reconnecting { .. })).await);

    // The caller disconnects while the listener is waiting to retry.
    connector.disconnect().await.unwrap();

    assert!(wait_for_state(&listener, |s| *s == ListenerState::Unsubscribed).await);
    // The reconnect lost the race and was never counted as an attempt.
    assert_eq!(connector.reconnect_attempts(), 0);
    assert_eq!(connector.get_subscribe_requests().await.len(), 1);
}

#[tokio::test]
async fn test_shutdown_mid_backoff_returns_promptly() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(
        &connector,
        &consumer,
        BackoffPolicy::new()
            .with_initial_delay(Duration::from_secs(120))
            .with_jitter(0.0),
    )
    .await;

    connector.emit_connection_lost("outage").await;
    assert!(wait_for_state(&listener, |s| matches!(s, ListenerState::Reconnecting { .. })).await);

    let started = Instant::now();
    listener.shutdown().await;

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "shutdown should not wait out the backoff"
    );
    assert_eq!(listener.state(), ListenerState::Unsubscribed);
}

#[tokio::test]
async fn test_consumer_failures_do_not_stop_dispatch() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::with_failures(1);
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    assert!(connector.emit_message("sensors/a", b"first").await);
    assert!(connector.emit_message("sensors/a", b"second").await);

    assert!(consumer.wait_for(1, WAIT).await);
    assert_eq!(consumer.attempts(), 2);
    assert_eq!(listener.state(), ListenerState::Subscribed);

    let received = consumer.get_received().await;
    assert_eq!(received[0].0.as_ref(), b"second");
}

#[tokio::test]
async fn test_subscribe_twice_is_rejected() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = subscribed_listener(&connector, &consumer, fast_policy()).await;

    let err = listener.subscribe().await.unwrap_err();

    assert!(matches!(err, ConnectorError::Subscription { .. }));
    assert_eq!(connector.get_subscribe_requests().await.len(), 1);
}

#[tokio::test]
async fn test_subscribe_without_connection_leaves_listener_unsubscribed() {
    let connector = Arc::new(MockConnector::new());
    let consumer = RecordingConsumer::new();
    let listener = TopicListener::new(
        Arc::clone(&connector),
        vec![TopicSubscription::new("sensors/#")],
        Arc::new(consumer),
    )
    .unwrap();

    let err = listener.subscribe().await.unwrap_err();

    assert!(matches!(err, ConnectorError::NotConnected { .. }));
    assert_eq!(listener.state(), ListenerState::Unsubscribed);
}
