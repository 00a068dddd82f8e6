//! Connection Manager
//!
//! Owns the broker connection lifecycle: connect, disconnect, publish with
//! acknowledgment tracking, subscribe, and the teardown/reconnect pair used
//! by listener recovery. One manager holds at most one live session at a
//! time; a caller-requested disconnect permanently cancels recovery until
//! the next explicit connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::SubscribeFilter;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectorConfig;
use crate::connector::options::ConnectOptions;
use crate::connector::session::{
    wait_for_connection, ConnectionStatus, Session, SessionEvent,
};
use crate::connector::tracker::DeliveryToken;
use crate::error::{ConnectorError, ConnectorResult};
use crate::persistence::{JournalRecord, PublishJournal};
use crate::qos::{DeliveryQos, TopicSubscription};

/// Broker-facing operations needed by subscription listeners. Implemented by
/// [`MqttConnector`] for real brokers and by the mock in [`crate::testing`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session with the broker and wait until it is accepted.
    async fn connect(&self) -> ConnectorResult<()>;

    /// Close the session and cancel any in-progress or future recovery.
    async fn disconnect(&self) -> ConnectorResult<()>;

    /// Drop the current session without giving up on the connection. Used by
    /// recovery to clear a dead session before reconnecting.
    async fn teardown(&self) -> ConnectorResult<()>;

    /// Open a fresh session using the options from the last connect. Fails
    /// with [`ConnectorError::Cancelled`] once disconnect has been requested.
    async fn reconnect(&self) -> ConnectorResult<()>;

    /// Subscribe to the given filters and claim the session's event stream.
    async fn subscribe(
        &self,
        subscriptions: &[TopicSubscription],
    ) -> ConnectorResult<mpsc::Receiver<SessionEvent>>;

    /// Publish a message, optionally waiting for the broker acknowledgment.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        wait: Option<Duration>,
    ) -> ConnectorResult<DeliveryToken>;

    fn is_connected(&self) -> bool;

    /// Client identifier of the current or most recent session.
    fn client_id(&self) -> Option<String>;

    /// Broker URI the connector is (or would be) talking to.
    fn server_uri(&self) -> String;
}

pub struct MqttConnector {
    config: ConnectorConfig,
    session: Mutex<Option<Session>>,
    /// Options from the last explicit connect, consulted by reconnect.
    /// Cleared on disconnect so stale recovery cannot resurrect a session.
    options: StdMutex<Option<ConnectOptions>>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    journal: Mutex<Option<PublishJournal>>,
    closed: AtomicBool,
}

impl MqttConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected {
            reason: "never connected".to_string(),
        });
        Self {
            config,
            session: Mutex::new(None),
            options: StdMutex::new(None),
            status_tx,
            status_rx,
            journal: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Current connection status, as last reported by the session driver.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch that tracks status across sessions, including reconnects.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn default_publish_qos(&self) -> DeliveryQos {
        self.config.broker.default_publish_qos
    }

    fn snapshot_options(&self) -> Option<ConnectOptions> {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_options(&self, options: Option<ConnectOptions>) {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = options;
    }

    /// Open the journal on first use. The handle is cached because the store
    /// holds an exclusive file lock for the life of the process.
    async fn ensure_journal(&self) -> ConnectorResult<Option<PublishJournal>> {
        let Some(dir) = &self.config.broker.persistence_dir else {
            return Ok(None);
        };
        let mut journal = self.journal.lock().await;
        if journal.is_none() {
            let path = dir.join(&self.config.broker.client_id);
            *journal = Some(PublishJournal::open(path)?);
        }
        Ok(journal.clone())
    }

    /// Open a session and wait for the broker to accept it. On success any
    /// journaled publishes from earlier sessions are handed back to the
    /// transport.
    async fn open_session(&self, options: &ConnectOptions) -> ConnectorResult<Session> {
        let journal = self.ensure_journal().await?;

        let recovery = match &journal {
            Some(journal) if options.clean_session => {
                let dropped = journal.clear()?;
                if dropped > 0 {
                    info!(count = dropped, "clean session requested, journaled publishes dropped");
                }
                Vec::new()
            }
            Some(journal) => journal.load()?,
            None => Vec::new(),
        };

        info!(
            client_id = %options.client_id,
            server_uri = %options.server_uri,
            clean_session = options.clean_session,
            "connecting to broker"
        );
        let session = Session::open(options, self.status_tx.clone(), journal);

        if let Err(e) = wait_for_connection(self.status_rx.clone(), options.connection_timeout).await
        {
            session.close().await;
            return Err(e);
        }

        if !recovery.is_empty() {
            info!(count = recovery.len(), "republishing journaled messages");
            for (token_id, record) in recovery {
                let JournalRecord { topic, qos, payload, .. } = record;
                let _token = session.tracker().register_with_id(token_id, &topic, qos);
                if let Err(e) = session
                    .client()
                    .publish(&topic, qos.into(), false, payload)
                    .await
                {
                    session.tracker().discard(&token_id);
                    warn!(topic = %topic, error = %e, "failed to republish journaled message");
                }
            }
        }

        Ok(session)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> ConnectorResult<()> {
        let options = ConnectOptions::from_config(&self.config.broker.client_id, &self.config)?;

        let mut session = self.session.lock().await;
        if session.is_some() && self.status().is_connected() {
            return Err(ConnectorError::connection(
                "already connected; disconnect first",
            ));
        }
        if let Some(stale) = session.take() {
            debug!("discarding stale session before connect");
            stale.close().await;
        }

        // An explicit connect re-arms a connector that was disconnected.
        self.closed.store(false, Ordering::SeqCst);

        let opened = self.open_session(&options).await?;
        self.store_options(Some(options));
        *session = Some(opened);
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        // Flagged before the session lock so a reconnect already waiting on
        // the lock sees the cancellation the moment it gets in.
        self.closed.store(true, Ordering::SeqCst);
        self.store_options(None);

        let mut session = self.session.lock().await;
        match session.take() {
            Some(active) => {
                info!("disconnecting from broker");
                active.close().await;
            }
            None => debug!("disconnect requested but no session is open"),
        }
        Ok(())
    }

    async fn teardown(&self) -> ConnectorResult<()> {
        let mut session = self.session.lock().await;
        if let Some(dead) = session.take() {
            debug!("tearing down failed session");
            dead.close().await;
        }
        Ok(())
    }

    async fn reconnect(&self) -> ConnectorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::cancelled(
                "disconnect requested, reconnect abandoned",
            ));
        }
        let options = self.snapshot_options().ok_or_else(|| {
            ConnectorError::not_connected("reconnect requires a prior successful connect")
        })?;

        let mut session = self.session.lock().await;
        // Re-checked under the lock: a disconnect that slipped in while we
        // waited must win over this reconnect.
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::cancelled(
                "disconnect requested, reconnect abandoned",
            ));
        }
        if let Some(stale) = session.take() {
            stale.close().await;
        }

        let opened = self.open_session(&options).await?;
        *session = Some(opened);
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriptions: &[TopicSubscription],
    ) -> ConnectorResult<mpsc::Receiver<SessionEvent>> {
        if subscriptions.is_empty() {
            return Err(ConnectorError::subscription(
                "at least one topic filter is required",
            ));
        }

        let mut session = self.session.lock().await;
        let session = session
            .as_mut()
            .ok_or_else(|| ConnectorError::not_connected("subscribe requires an active connection"))?;

        let filters: Vec<SubscribeFilter> = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic_filter().to_string(), s.effective_qos().into()))
            .collect();
        let described: Vec<String> = subscriptions.iter().map(ToString::to_string).collect();

        session
            .client()
            .subscribe_many(filters)
            .await
            .map_err(|e| {
                ConnectorError::subscription_with(
                    format!("subscribe request failed for [{}]", described.join(", ")),
                    e,
                )
            })?;

        info!(filters = ?described, "subscribed");
        session.take_events().ok_or_else(|| {
            ConnectorError::subscription("session event stream is already claimed")
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        wait: Option<Duration>,
    ) -> ConnectorResult<DeliveryToken> {
        if topic.trim().is_empty() {
            return Err(ConnectorError::delivery("publish topic must not be empty"));
        }

        let session = self.session.lock().await;
        let active = session
            .as_ref()
            .ok_or_else(|| ConnectorError::not_connected("publish requires an active connection"))?;

        let token_id = Uuid::new_v4();
        let token = active.tracker().register_with_id(token_id, topic, qos);

        // Journal before the transport send so a crash or connection loss
        // between the two still leaves the message replayable.
        let journal = if qos == DeliveryQos::FireAndForget {
            None
        } else {
            self.journal.lock().await.clone()
        };
        if let Some(journal) = &journal {
            if let Err(e) = journal.put(&token_id, &JournalRecord::new(topic, qos, &payload)) {
                active.tracker().discard(&token_id);
                return Err(e);
            }
        }

        if let Err(e) = active
            .client()
            .publish(topic, qos.into(), false, payload)
            .await
        {
            active.tracker().discard(&token_id);
            if let Some(journal) = &journal {
                if let Err(remove_err) = journal.remove(&token_id) {
                    warn!(token_id = %token_id, error = %remove_err, "failed to drop journal entry");
                }
            }
            return Err(ConnectorError::delivery_with(
                format!("publish to '{topic}' was not accepted by the session"),
                e,
            ));
        }
        debug!(topic = %topic, qos = %qos, token_id = %token_id, "publish handed to transport");

        // Waiting must not hold the session lock or acknowledgments,
        // disconnects, and other publishes would stall behind it.
        drop(session);

        if let Some(wait) = wait {
            token.wait_for_completion(wait).await?;
        }
        Ok(token)
    }

    fn is_connected(&self) -> bool {
        self.status_rx.borrow().is_connected()
    }

    fn client_id(&self) -> Option<String> {
        self.snapshot_options().map(|o| o.client_id)
    }

    fn server_uri(&self) -> String {
        self.snapshot_options()
            .map(|o| o.server_uri)
            .unwrap_or_else(|| self.config.broker.server_uri.clone())
    }
}
