//! Accumulated execution-record store (the update reconciler).
//!
//! Folds a sequence of partial update frames for a message id into one
//! merged record. Field merges are shallow and last-write-wins; the
//! completion and streamable flags are monotonic (false to true only).

use crate::protocol::ExecutionUpdate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

/// Merged view of every update received for one message id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRecord {
    /// Open-schema execution fields, last write wins per field.
    pub fields: serde_json::Map<String, Value>,
    pub is_complete: bool,
    pub is_streamable: bool,
}

/// In-memory reconciler keyed by message id.
///
/// Owned by the application root (usually via [`UpdateStore::shared`]) rather
/// than living in module-level state, so teardown and test isolation are
/// explicit. Records persist until [`UpdateStore::forget`] or
/// [`UpdateStore::clear`]. Completion signals live beside the records, so
/// awaiting one never materializes a record.
#[derive(Debug, Default)]
pub struct UpdateStore {
    records: HashMap<String, MessageRecord>,
    completions: HashMap<String, watch::Sender<bool>>,
}

impl UpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle for use across connection pump tasks.
    #[must_use]
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Merge one partial update into the stored record for its message id.
    ///
    /// Fields present in the update overwrite the stored fields; absent
    /// fields are untouched. Once a flag has been observed true it stays
    /// true regardless of later frames.
    pub fn apply_update(&mut self, update: &ExecutionUpdate) {
        let mut completed_now = false;
        {
            let record = self.records.entry(update.message_id.clone()).or_default();
            for (key, value) in &update.fields {
                record.fields.insert(key.clone(), value.clone());
            }
            if update.is_streamable == Some(true) {
                record.is_streamable = true;
            }
            if update.is_complete == Some(true) && !record.is_complete {
                record.is_complete = true;
                completed_now = true;
            }
        }
        if completed_now {
            self.completions
                .entry(update.message_id.clone())
                .or_insert_with(|| watch::channel(false).0)
                .send_replace(true);
        }
    }

    /// Current merged record, or `None` before the first update.
    #[must_use]
    pub fn record(&self, message_id: &str) -> Option<&MessageRecord> {
        self.records.get(message_id)
    }

    #[must_use]
    pub fn is_complete(&self, message_id: &str) -> bool {
        self.records
            .get(message_id)
            .is_some_and(|record| record.is_complete)
    }

    #[must_use]
    pub fn is_streamable(&self, message_id: &str) -> bool {
        self.records
            .get(message_id)
            .is_some_and(|record| record.is_streamable)
    }

    /// One-shot completion signal for a message id.
    ///
    /// The receiver observes a single false-to-true transition; await it with
    /// `receiver.wait_for(|done| *done)`. Subscribing after completion
    /// observes `true` immediately. The signal can be awaited before the
    /// first update arrives without materializing a record.
    pub fn completion(&mut self, message_id: &str) -> watch::Receiver<bool> {
        let latched = self.is_complete(message_id);
        self.completions
            .entry(message_id.to_string())
            .or_insert_with(|| watch::channel(latched).0)
            .subscribe()
    }

    /// Drop one record and its completion signal. Call after presentation
    /// has switched to the completed rendering; nothing evicts records
    /// implicitly.
    pub fn forget(&mut self, message_id: &str) {
        self.records.remove(message_id);
        self.completions.remove(message_id);
    }

    /// Drop every record and completion signal.
    pub fn clear(&mut self) {
        self.records.clear();
        self.completions.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
