//! Delivery Tokens and Acknowledgment Tracking
//!
//! The transport assigns packet ids inside its event loop, after a publish
//! request has already been queued. Tokens are therefore bound to packet ids
//! first-in-first-out: the oldest unbound token takes the next outgoing
//! publish id, and the matching PubAck/PubComp completes it. QoS 0 publishes
//! carry no packet id and complete at registration.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ConnectorError, ConnectorResult};
use crate::qos::DeliveryQos;

/// Final state of one tracked publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    Failed(String),
}

/// Handle for one outbound publish.
///
/// Dropping a token does not affect delivery; it only gives up the ability
/// to observe the acknowledgment.
#[derive(Debug, Clone)]
pub struct DeliveryToken {
    token_id: Uuid,
    topic: String,
    qos: DeliveryQos,
    outcome_rx: watch::Receiver<Option<DeliveryOutcome>>,
}

impl DeliveryToken {
    /// Correlation id, also the journal key for QoS 1/2 publishes.
    pub fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> DeliveryQos {
        self.qos
    }

    /// Non-blocking completion query.
    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        self.outcome_rx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome().is_some()
    }

    /// Block until the broker acknowledges this publish or `wait` elapses.
    ///
    /// Connection loss fails pending tokens promptly, so this never hangs
    /// past `wait` even when the broker goes silent mid-flight.
    pub async fn wait_for_completion(&self, wait: Duration) -> ConnectorResult<()> {
        let mut rx = self.outcome_rx.clone();
        let outcome = tokio::time::timeout(wait, async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return DeliveryOutcome::Failed(
                        "session closed before acknowledgment".to_string(),
                    );
                }
            }
        })
        .await
        .map_err(|_| ConnectorError::DeliveryTimeout {
            waited_ms: wait.as_millis() as u64,
        })?;

        match outcome {
            DeliveryOutcome::Acknowledged => Ok(()),
            DeliveryOutcome::Failed(reason) => Err(ConnectorError::delivery(reason)),
        }
    }
}

struct PendingAck {
    token_id: Uuid,
    packet_id: Option<u16>,
    outcome_tx: watch::Sender<Option<DeliveryOutcome>>,
}

/// Per-session registry of unacknowledged QoS 1/2 publishes.
#[derive(Default)]
pub(crate) struct AckTracker {
    pending: Mutex<VecDeque<PendingAck>>,
}

impl AckTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingAck>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a publish under a fresh token id.
    pub(crate) fn register(&self, topic: &str, qos: DeliveryQos) -> DeliveryToken {
        self.register_with_id(Uuid::new_v4(), topic, qos)
    }

    /// Register a publish under an existing id (journal replay keeps keys).
    pub(crate) fn register_with_id(
        &self,
        token_id: Uuid,
        topic: &str,
        qos: DeliveryQos,
    ) -> DeliveryToken {
        let initial = if qos == DeliveryQos::FireAndForget {
            Some(DeliveryOutcome::Acknowledged)
        } else {
            None
        };
        let (outcome_tx, outcome_rx) = watch::channel(initial);

        if qos != DeliveryQos::FireAndForget {
            self.lock().push_back(PendingAck {
                token_id,
                packet_id: None,
                outcome_tx,
            });
        }

        DeliveryToken {
            token_id,
            topic: topic.to_string(),
            qos,
            outcome_rx,
        }
    }

    /// Bind the next outgoing publish packet id to the oldest unbound token.
    /// Packet id zero marks a QoS 0 publish, which is never tracked.
    pub(crate) fn bind_packet_id(&self, packet_id: u16) {
        if packet_id == 0 {
            return;
        }
        let mut pending = self.lock();
        if let Some(entry) = pending.iter_mut().find(|entry| entry.packet_id.is_none()) {
            entry.packet_id = Some(packet_id);
        }
    }

    /// Complete the token bound to `packet_id`, returning its id if any.
    pub(crate) fn acknowledge(&self, packet_id: u16) -> Option<Uuid> {
        let mut pending = self.lock();
        let index = pending
            .iter()
            .position(|entry| entry.packet_id == Some(packet_id))?;
        let entry = pending.remove(index)?;
        let _ = entry.outcome_tx.send(Some(DeliveryOutcome::Acknowledged));
        Some(entry.token_id)
    }

    /// Complete every pending token successfully. Used by test doubles that
    /// have no event loop to observe packet ids.
    pub(crate) fn acknowledge_all(&self) -> usize {
        let drained: Vec<PendingAck> = self.lock().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.outcome_tx.send(Some(DeliveryOutcome::Acknowledged));
        }
        count
    }

    /// Fail every in-flight token, returning how many were failed.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingAck> = self.lock().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry
                .outcome_tx
                .send(Some(DeliveryOutcome::Failed(reason.to_string())));
        }
        count
    }

    /// Drop a registration whose publish never reached the transport.
    pub(crate) fn discard(&self, token_id: &Uuid) {
        let mut pending = self.lock();
        if let Some(index) = pending
            .iter()
            .position(|entry| entry.token_id == *token_id)
        {
            pending.remove(index);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
