//! In-Flight Publish Journal
//!
//! File-backed keyed store for QoS 1/2 publishes that have been handed to
//! the transport but not yet acknowledged. Entries are written before the
//! send and removed on acknowledgment, so whatever is left after a crash or
//! a lost connection is exactly the set of messages with unknown fate.
//! Connects with clean-session disabled replay these entries.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConnectorError, ConnectorResult};
use crate::qos::DeliveryQos;

/// One journaled publish, keyed by its delivery-token id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalRecord {
    pub topic: String,
    pub qos: DeliveryQos,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

impl JournalRecord {
    pub fn new(topic: impl Into<String>, qos: DeliveryQos, payload: &[u8]) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.to_vec(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Keyed store of unacknowledged publishes. Cloning shares the same store.
#[derive(Debug, Clone)]
pub struct PublishJournal {
    db: sled::Db,
}

impl PublishJournal {
    /// Open (or create) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            ConnectorError::persistence_with(
                format!("failed to open publish journal at {}", path.display()),
                e,
            )
        })?;
        Ok(Self { db })
    }

    pub fn put(&self, token_id: &Uuid, record: &JournalRecord) -> ConnectorResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| ConnectorError::persistence_with("failed to encode journal record", e))?;
        self.db
            .insert(token_id.as_bytes(), bytes)
            .map_err(|e| ConnectorError::persistence_with("failed to write journal record", e))?;
        self.flush()
    }

    pub fn remove(&self, token_id: &Uuid) -> ConnectorResult<()> {
        self.db
            .remove(token_id.as_bytes())
            .map_err(|e| ConnectorError::persistence_with("failed to remove journal record", e))?;
        self.flush()
    }

    /// Every surviving entry. Corrupt entries are skipped with a warning so
    /// one bad record cannot block recovery of the rest.
    pub fn load(&self) -> ConnectorResult<Vec<(Uuid, JournalRecord)>> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item.map_err(|e| {
                ConnectorError::persistence_with("failed to iterate publish journal", e)
            })?;
            let Ok(token_id) = Uuid::from_slice(&key) else {
                warn!(key_len = key.len(), "skipping journal entry with malformed key");
                continue;
            };
            match serde_json::from_slice::<JournalRecord>(&value) {
                Ok(record) => entries.push((token_id, record)),
                Err(e) => {
                    warn!(token_id = %token_id, error = %e, "skipping undecodable journal entry")
                }
            }
        }
        Ok(entries)
    }

    /// Discard every entry, returning how many were dropped.
    pub fn clear(&self) -> ConnectorResult<usize> {
        let dropped = self.db.len();
        self.db
            .clear()
            .map_err(|e| ConnectorError::persistence_with("failed to clear publish journal", e))?;
        self.flush()?;
        Ok(dropped)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    fn flush(&self) -> ConnectorResult<()> {
        self.db
            .flush()
            .map_err(|e| ConnectorError::persistence_with("failed to flush publish journal", e))?;
        Ok(())
    }
}
