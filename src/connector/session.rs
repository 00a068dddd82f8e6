//! Broker Session and Event-Loop Driver
//!
//! Each connect produces one session: a transport client plus a spawned
//! driver task that polls the event loop until the connection dies or a
//! disconnect is requested. The driver routes inbound publishes and loss
//! notifications to the attached listener, resolves delivery tokens, and
//! keeps the owner's status watch current. It never reconnects on its own;
//! recovery belongs to the subscription listener.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::options::ConnectOptions;
use crate::connector::tracker::AckTracker;
use crate::error::{ConnectorError, ConnectorResult};
use crate::persistence::PublishJournal;
use crate::qos::DeliveryQos;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 10;
const DRIVER_GRACE: Duration = Duration::from_secs(2);

/// Inbound application message as received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: DeliveryQos,
    pub duplicate: bool,
    pub retained: bool,
}

/// Notifications surfaced to an attached listener.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessageArrived(InboundMessage),
    /// The broker acknowledged an outbound publish. Exists to satisfy the
    /// transport's callback contract; consumers never see it.
    DeliveryComplete { token_id: Uuid },
    /// The session died unexpectedly. Never emitted for a requested
    /// disconnect, so recovery only runs when something actually broke.
    ConnectionLost { reason: String },
}

/// Health of the most recent session, as reported by its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected { reason } => write!(f, "disconnected ({reason})"),
        }
    }
}

pub(crate) struct Session {
    client: AsyncClient,
    tracker: Arc<AckTracker>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Open the network session and spawn its driver. `status_tx` belongs to
    /// the owning connector and outlives any single session.
    pub(crate) fn open(
        options: &ConnectOptions,
        status_tx: watch::Sender<ConnectionStatus>,
        journal: Option<PublishJournal>,
    ) -> Self {
        let mqtt_options = options.to_mqtt_options();
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let tracker = Arc::new(AckTracker::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let _ = status_tx.send(ConnectionStatus::Connecting);
        let driver = tokio::spawn(drive_session(
            event_loop,
            status_tx,
            event_tx,
            Arc::clone(&tracker),
            journal,
            shutdown_rx,
            options.client_id.clone(),
        ));

        Self {
            client,
            tracker,
            events: Some(event_rx),
            shutdown_tx,
            driver: Some(driver),
        }
    }

    pub(crate) fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub(crate) fn tracker(&self) -> &Arc<AckTracker> {
        &self.tracker
    }

    /// Hand the event stream to a listener. Yields once per session.
    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Disconnect from the broker and stop the driver.
    ///
    /// The disconnect request is flushed through the event loop first so the
    /// broker sees a clean close (and holds back the last will); the shutdown
    /// flag is an escalation for drivers stuck on a dead or connecting
    /// transport.
    pub(crate) async fn close(mut self) {
        let requested = match self.client.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "disconnect request not delivered; session already down");
                false
            }
        };
        if !requested {
            let _ = self.shutdown_tx.send(true);
        }

        if let Some(mut driver) = self.driver.take() {
            match tokio::time::timeout(DRIVER_GRACE, &mut driver).await {
                Ok(_) => debug!("session driver stopped"),
                Err(_) => {
                    let _ = self.shutdown_tx.send(true);
                    match tokio::time::timeout(DRIVER_GRACE, &mut driver).await {
                        Ok(_) => debug!("session driver stopped after shutdown signal"),
                        Err(_) => {
                            warn!("session driver did not stop in time, aborting");
                            driver.abort();
                        }
                    }
                }
            }
        }

        self.tracker.fail_all("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Last-resort cleanup for owners that never called close().
        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.tracker.fail_all("session dropped");
    }
}

/// Poll the event loop until the connection dies or shutdown is requested.
async fn drive_session(
    mut event_loop: EventLoop,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<SessionEvent>,
    tracker: Arc<AckTracker>,
    journal: Option<PublishJournal>,
    mut shutdown_rx: watch::Receiver<bool>,
    client_id: String,
) {
    debug!(client_id = %client_id, "session driver started");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(client_id = %client_id, "session driver shutting down");
                    let _ = status_tx.send(ConnectionStatus::Disconnected {
                        reason: "shutdown requested".to_string(),
                    });
                    tracker.fail_all("session closed");
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(
                        client_id = %client_id,
                        session_present = ack.session_present,
                        "broker accepted connection"
                    );
                    let _ = status_tx.send(ConnectionStatus::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: publish.qos.into(),
                        duplicate: publish.dup,
                        retained: publish.retain,
                    };
                    debug!(
                        client_id = %client_id,
                        topic = %message.topic,
                        bytes = message.payload.len(),
                        "message arrived"
                    );
                    forward(&event_tx, SessionEvent::MessageArrived(message));
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    resolve_ack(ack.pkid, &tracker, &journal, &event_tx);
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    resolve_ack(comp.pkid, &tracker, &journal, &event_tx);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count();
                    if rejected > 0 {
                        warn!(
                            client_id = %client_id,
                            rejected,
                            "broker rejected one or more subscription filters"
                        );
                    } else {
                        debug!(
                            client_id = %client_id,
                            granted = ack.return_codes.len(),
                            "subscriptions granted"
                        );
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let reason = "server closed the session".to_string();
                    warn!(client_id = %client_id, "broker sent disconnect");
                    let _ = status_tx.send(ConnectionStatus::Disconnected {
                        reason: reason.clone(),
                    });
                    tracker.fail_all(&reason);
                    notify_loss(&event_tx, reason).await;
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Publish(packet_id))) => {
                    tracker.bind_packet_id(packet_id);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(client_id = %client_id, "disconnect sent to broker");
                    let _ = status_tx.send(ConnectionStatus::Disconnected {
                        reason: "disconnect requested".to_string(),
                    });
                    tracker.fail_all("session closed before acknowledgment");
                    break;
                }
                Ok(other) => {
                    debug!(client_id = %client_id, event = ?other, "transport event");
                }
                Err(err) => {
                    let reason = err.to_string();
                    if *shutdown_rx.borrow() {
                        debug!(client_id = %client_id, error = %reason, "event loop closed during shutdown");
                        let _ = status_tx.send(ConnectionStatus::Disconnected {
                            reason: "shutdown requested".to_string(),
                        });
                        tracker.fail_all("session closed");
                        break;
                    }
                    warn!(client_id = %client_id, error = %reason, "connection lost");
                    let _ = status_tx.send(ConnectionStatus::Disconnected {
                        reason: reason.clone(),
                    });
                    let failed = tracker.fail_all(&format!("connection lost: {reason}"));
                    if failed > 0 {
                        warn!(client_id = %client_id, count = failed, "failed in-flight publishes");
                    }
                    notify_loss(&event_tx, reason).await;
                    break;
                }
            }
        }
    }
    debug!(client_id = %client_id, "session driver stopped");
}

fn resolve_ack(
    packet_id: u16,
    tracker: &AckTracker,
    journal: &Option<PublishJournal>,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    match tracker.acknowledge(packet_id) {
        Some(token_id) => {
            debug!(packet_id, token_id = %token_id, "publish acknowledged");
            if let Some(journal) = journal {
                if let Err(e) = journal.remove(&token_id) {
                    warn!(token_id = %token_id, error = %e, "failed to clear journal entry");
                }
            }
            forward(event_tx, SessionEvent::DeliveryComplete { token_id });
        }
        None => debug!(packet_id, "acknowledgment for untracked packet id"),
    }
}

/// Deliver without ever blocking the poll loop; a stalled listener loses
/// events rather than stalling keep-alives.
fn forward(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(?event, "listener event channel full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("no listener attached, event dropped");
        }
    }
}

/// Loss notifications are never dropped: the listener must see them to start
/// recovery, and the driver is exiting anyway, so waiting for channel
/// capacity behind a backlog of undispatched messages is safe.
async fn notify_loss(event_tx: &mpsc::Sender<SessionEvent>, reason: String) {
    if event_tx
        .send(SessionEvent::ConnectionLost { reason })
        .await
        .is_err()
    {
        debug!("no listener attached, loss notification dropped");
    }
}

/// Wait until the driver reports an accepted connection, a failure, or the
/// configured timeout.
pub(crate) async fn wait_for_connection(
    mut status_rx: watch::Receiver<ConnectionStatus>,
    timeout: Duration,
) -> ConnectorResult<()> {
    let wait = tokio::time::timeout(timeout, async {
        loop {
            let status = status_rx.borrow_and_update().clone();
            match status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Disconnected { reason } => {
                    return Err(ConnectorError::connection(format!(
                        "broker rejected connection: {reason}"
                    )))
                }
                ConnectionStatus::Connecting => {}
            }
            if status_rx.changed().await.is_err() {
                return Err(ConnectorError::connection(
                    "session driver stopped before the connection was established",
                ));
            }
        }
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::connection(format!(
            "no broker acknowledgment within {}s",
            timeout.as_secs()
        ))),
    }
}
