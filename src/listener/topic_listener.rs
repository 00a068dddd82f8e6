//! Topic Subscription Listener
//!
//! A listener binds an ordered set of topic subscriptions to one consumer
//! and keeps that binding alive across connection losses. All dispatch and
//! recovery runs on a single worker task, so recovery cycles can never
//! overlap and a caller disconnect is observed as either a closed event
//! stream or a cancelled reconnect.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connector::manager::Connector;
use crate::connector::session::{InboundMessage, SessionEvent};
use crate::error::{ConnectorError, ConnectorResult};
use crate::listener::consumer::MessageConsumer;
use crate::listener::metadata::MessageMetadata;
use crate::listener::retry::{BackoffPolicy, RetryDecision, RetryPolicy};
use crate::qos::TopicSubscription;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a listener. Failed is terminal; everything else can move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Unsubscribed,
    Subscribed,
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Unsubscribed => "unsubscribed",
            ListenerState::Subscribed => "subscribed",
            ListenerState::Disconnected { .. } => "disconnected",
            ListenerState::Reconnecting { .. } => "reconnecting",
            ListenerState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ListenerState::Failed { .. })
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Disconnected { reason } => write!(f, "disconnected ({reason})"),
            ListenerState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ListenerState::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

pub struct TopicListener<C: Connector> {
    connector: Arc<C>,
    subscriptions: Vec<TopicSubscription>,
    consumer: Arc<dyn MessageConsumer>,
    retry_policy: Arc<dyn RetryPolicy>,
    state_tx: watch::Sender<ListenerState>,
    state_rx: watch::Receiver<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> fmt::Debug for TopicListener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicListener")
            .field("subscriptions", &self.subscriptions)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl<C: Connector + 'static> TopicListener<C> {
    /// Create a listener over `subscriptions`, delivering to `consumer`.
    /// Filters are validated here; the broker sees them only on subscribe.
    pub fn new(
        connector: Arc<C>,
        subscriptions: Vec<TopicSubscription>,
        consumer: Arc<dyn MessageConsumer>,
    ) -> ConnectorResult<Self> {
        if subscriptions.is_empty() {
            return Err(ConnectorError::subscription(
                "a listener needs at least one topic filter",
            ));
        }
        if let Some(blank) = subscriptions
            .iter()
            .find(|s| s.topic_filter().trim().is_empty())
        {
            return Err(ConnectorError::subscription(format!(
                "blank topic filter in subscription list: {blank:?}"
            )));
        }

        let (state_tx, state_rx) = watch::channel(ListenerState::Unsubscribed);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            connector,
            subscriptions,
            consumer,
            retry_policy: Arc::new(BackoffPolicy::default()),
            state_tx,
            state_rx,
            shutdown_tx,
            worker: StdMutex::new(None),
        })
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn state(&self) -> ListenerState {
        self.state_rx.borrow().clone()
    }

    /// Watch for observing state transitions, including the terminal Failed.
    pub fn state_watch(&self) -> watch::Receiver<ListenerState> {
        self.state_rx.clone()
    }

    pub fn subscriptions(&self) -> &[TopicSubscription] {
        &self.subscriptions
    }

    /// Claim the active session's event stream, send the subscribe request,
    /// and start the dispatch worker. On failure the listener remains
    /// Unsubscribed and may be retried.
    pub async fn subscribe(&self) -> ConnectorResult<()> {
        {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = worker.as_ref() {
                if !handle.is_finished() {
                    return Err(ConnectorError::subscription(
                        "listener is already subscribed",
                    ));
                }
                worker.take();
            }
        }

        let events = self.connector.subscribe(&self.subscriptions).await?;

        self.shutdown_tx.send_replace(false);
        let _ = self.state_tx.send(ListenerState::Subscribed);

        let dispatch = DispatchWorker {
            connector: Arc::clone(&self.connector),
            subscriptions: self.subscriptions.clone(),
            consumer: Arc::clone(&self.consumer),
            retry_policy: Arc::clone(&self.retry_policy),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.store_worker(tokio::spawn(dispatch.run(events)));
        Ok(())
    }

    /// Stop dispatching and recovery. Safe to call at any point, including
    /// mid-backoff; the worker notices within the shutdown grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut worker) = self.take_worker() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await {
                Ok(_) => debug!("listener worker stopped"),
                Err(_) => {
                    warn!("listener worker did not stop in time, aborting");
                    worker.abort();
                    let _ = self.state_tx.send(ListenerState::Unsubscribed);
                }
            }
        }
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn store_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// Everything the dispatch task owns. Runs until the session closes cleanly,
/// shutdown is requested, or recovery gives up.
struct DispatchWorker<C: Connector> {
    connector: Arc<C>,
    subscriptions: Vec<TopicSubscription>,
    consumer: Arc<dyn MessageConsumer>,
    retry_policy: Arc<dyn RetryPolicy>,
    state_tx: watch::Sender<ListenerState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Connector + 'static> DispatchWorker<C> {
    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        debug!("listener worker started");
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("listener worker shutting down");
                        self.set_state(ListenerState::Unsubscribed);
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(SessionEvent::MessageArrived(message)) => {
                        self.deliver(message).await;
                    }
                    Some(SessionEvent::DeliveryComplete { token_id }) => {
                        debug!(token_id = %token_id, "delivery confirmed");
                    }
                    Some(SessionEvent::ConnectionLost { reason }) => {
                        warn!(reason = %reason, "connection lost, starting recovery");
                        self.set_state(ListenerState::Disconnected { reason });
                        match self.recover().await {
                            Some(stream) => events = stream,
                            None => break,
                        }
                    }
                    None => {
                        if self.connector.is_connected() {
                            // Stream replaced under a healthy session;
                            // nothing to recover.
                            info!("session closed, listener stopping");
                            self.set_state(ListenerState::Unsubscribed);
                            break;
                        }
                        // The session died before its loss notification got
                        // through, or a caller disconnected. Recovery covers
                        // both: a requested disconnect cancels the first
                        // reconnect and the listener stops cleanly.
                        let reason = "session event stream closed".to_string();
                        warn!(reason = %reason, "connection lost, starting recovery");
                        self.set_state(ListenerState::Disconnected { reason });
                        match self.recover().await {
                            Some(stream) => events = stream,
                            None => break,
                        }
                    }
                }
            }
        }
        debug!("listener worker stopped");
    }

    /// Build the metadata mapping and hand the message to the consumer.
    /// Consumer failures are contained here; the session never sees them.
    async fn deliver(&self, message: InboundMessage) {
        let metadata = MessageMetadata {
            topic_name: message.topic.clone(),
            qos: message.qos,
            duplicate: message.duplicate,
            retained: message.retained,
            client_id: self.connector.client_id().unwrap_or_default(),
            server_uri: self.connector.server_uri(),
        };
        debug!(
            topic = %metadata.topic_name,
            qos = %metadata.qos,
            bytes = message.payload.len(),
            "dispatching message"
        );
        if let Err(e) = self.consumer.process(message.payload, metadata).await {
            warn!(topic = %message.topic, error = %e, "consumer failed to process message");
        }
    }

    /// Run reconnect attempts until one succeeds, the policy gives up, or
    /// shutdown/disconnect cancels the cycle. Returns the new event stream
    /// on success and sets the resulting state in every case.
    async fn recover(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.retry_policy.decide(attempt) {
                RetryDecision::Exhausted => {
                    let failed_attempts = attempt - 1;
                    let reason =
                        ConnectorError::ReconnectExhausted { attempts: failed_attempts }.to_string();
                    error!(attempts = failed_attempts, "recovery abandoned");
                    self.set_state(ListenerState::Failed { reason });
                    return None;
                }
                RetryDecision::Proceed { attempt, delay } => {
                    self.set_state(ListenerState::Reconnecting { attempt });
                    info!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
                    if !interruptible_sleep(&mut self.shutdown_rx, delay).await {
                        info!("shutdown during backoff, recovery stopped");
                        self.set_state(ListenerState::Unsubscribed);
                        return None;
                    }
                    match self.attempt_recovery().await {
                        Ok(events) => {
                            info!(attempt, "resubscribed after connection loss");
                            self.set_state(ListenerState::Subscribed);
                            return Some(events);
                        }
                        Err(ConnectorError::Cancelled { .. }) => {
                            info!("reconnect lost the race to a disconnect, recovery stopped");
                            self.set_state(ListenerState::Unsubscribed);
                            return None;
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }

    /// One recovery attempt: drop the dead session, reconnect with the
    /// snapshotted options, replay the subscribe request.
    async fn attempt_recovery(&self) -> ConnectorResult<mpsc::Receiver<SessionEvent>> {
        if let Err(e) = self.connector.teardown().await {
            warn!(error = %e, "teardown of the stale session failed");
        }
        self.connector.reconnect().await?;
        self.connector.subscribe(&self.subscriptions).await
    }

    fn set_state(&self, next: ListenerState) {
        debug!(state = %next, "listener state changed");
        let _ = self.state_tx.send(next);
    }
}

/// Sleep that gives up early when the shutdown flag flips. Returns false
/// when interrupted.
pub(crate) async fn interruptible_sleep(
    shutdown_rx: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
        }
    }
}
