//! Connection registry multiplexing per-message streams.
//!
//! The manager is an explicit context object owned by the application root;
//! it replaces hidden module-level registries so teardown ([`StreamManager::dispose`])
//! and test isolation are possible. At most one live connection exists per
//! message id per manager; logical subscribers share it via refcounts.

use crate::config::{StreamConfig, message_stream_url, normalize_base_url};
use crate::connection::{ConnectionStatus, MessageConnection, StreamEvent};
use crate::error::Result;
use crate::store::UpdateStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

/// Per-subscription policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Keep the transport open after the last logical subscriber leaves,
    /// until an explicit disconnect or dispose.
    pub keep_alive: bool,
}

struct ManagedStream {
    connection: MessageConnection,
    subscribers: usize,
    keep_alive: bool,
    pump_task: Option<tokio::task::JoinHandle<()>>,
}

/// Registry of one streaming connection per message id.
pub struct StreamManager {
    base_url: String,
    config: StreamConfig,
    streams: Arc<RwLock<HashMap<String, ManagedStream>>>,
    store: Mutex<Option<Arc<Mutex<UpdateStore>>>>,
}

impl StreamManager {
    /// Create a manager for a backend base URL.
    pub fn new(base_url: &str, config: StreamConfig) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            config,
            streams: Arc::new(RwLock::new(HashMap::new())),
            store: Mutex::new(None),
        })
    }

    /// Reconcile update frames from every connection (current and future)
    /// into a shared store.
    pub async fn attach_store(&self, store: Arc<Mutex<UpdateStore>>) {
        *self.store.lock().await = Some(Arc::clone(&store));
        let mut streams = self.streams.write().await;
        for entry in streams.values_mut() {
            if entry.pump_task.is_none() {
                let events = entry.connection.events().await;
                entry.pump_task = Some(tokio::spawn(pump_updates(events, Arc::clone(&store))));
            }
        }
    }

    /// Open (or reuse) the connection for a message id without registering a
    /// logical subscriber.
    pub async fn connect(&self, message_id: &str) -> Result<MessageConnection> {
        let connection = self.ensure_stream(message_id, 0, false).await?;
        connection.connect().await?;
        Ok(connection)
    }

    /// Subscribe with default options.
    pub async fn subscribe(&self, message_id: &str) -> Result<MessageConnection> {
        self.subscribe_with(message_id, SubscribeOptions::default())
            .await
    }

    /// Register a logical subscriber: connects the shared transport if
    /// needed and issues the subscribe frame (queued until the server
    /// confirms the channel).
    pub async fn subscribe_with(
        &self,
        message_id: &str,
        options: SubscribeOptions,
    ) -> Result<MessageConnection> {
        let connection = self.ensure_stream(message_id, 1, options.keep_alive).await?;
        if let Err(error) = connection.connect().await {
            self.unsubscribe(message_id).await?;
            return Err(error);
        }
        connection.subscribe(message_id).await?;
        Ok(connection)
    }

    /// Drop one logical subscriber. When the last one leaves and keep-alive
    /// was not requested, the transport is closed and the entry removed.
    /// Unknown ids are a no-op.
    pub async fn unsubscribe(&self, message_id: &str) -> Result<()> {
        // The entry must leave the map in the same critical section that
        // decides teardown: a subscriber racing in after the lock drops gets
        // a fresh entry instead of inheriting one already marked for close.
        let removed = {
            let mut streams = self.streams.write().await;
            let Some(entry) = streams.get_mut(message_id) else {
                return Ok(());
            };
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 && !entry.keep_alive {
                streams.remove(message_id)
            } else {
                None
            }
        };
        // The logical subscription is shared; only the last subscriber
        // retires it. The unsubscribe frame is a courtesy: a transport that
        // just died mid-close must not block the teardown.
        if let Some(entry) = removed {
            debug!("closing idle stream for {message_id}");
            if let Err(error) = entry.connection.unsubscribe(message_id).await {
                debug!("unsubscribe frame for {message_id} not delivered: {error}");
            }
            entry.connection.disconnect().await;
            if let Some(task) = entry.pump_task {
                task.abort();
            }
        }
        Ok(())
    }

    /// Close the transport for one message id and clear its entry. Safe to
    /// call repeatedly.
    pub async fn disconnect(&self, message_id: &str) {
        let entry = self.streams.write().await.remove(message_id);
        if let Some(entry) = entry {
            entry.connection.disconnect().await;
            if let Some(task) = entry.pump_task {
                task.abort();
            }
        }
    }

    /// Tear down every connection and pump task.
    pub async fn dispose(&self) {
        let entries: Vec<(String, ManagedStream)> =
            self.streams.write().await.drain().collect();
        for (_, entry) in entries {
            entry.connection.disconnect().await;
            if let Some(task) = entry.pump_task {
                task.abort();
            }
        }
    }

    /// Point-in-time status for a message id, `None` when no entry exists.
    pub async fn status(&self, message_id: &str) -> Option<ConnectionStatus> {
        self.streams
            .read()
            .await
            .get(message_id)
            .map(|entry| entry.connection.status())
    }

    /// Shared connection handle for a message id, if one exists.
    pub async fn connection(&self, message_id: &str) -> Option<MessageConnection> {
        self.streams
            .read()
            .await
            .get(message_id)
            .map(|entry| entry.connection.clone())
    }

    /// Logical subscriber count for a message id.
    pub async fn subscriber_count(&self, message_id: &str) -> usize {
        self.streams
            .read()
            .await
            .get(message_id)
            .map_or(0, |entry| entry.subscribers)
    }

    async fn ensure_stream(
        &self,
        message_id: &str,
        added_subscribers: usize,
        keep_alive: bool,
    ) -> Result<MessageConnection> {
        let mut streams = self.streams.write().await;
        if let Some(entry) = streams.get_mut(message_id) {
            entry.subscribers += added_subscribers;
            entry.keep_alive |= keep_alive;
            return Ok(entry.connection.clone());
        }

        let url = message_stream_url(&self.base_url, message_id)?;
        let connection = MessageConnection::new(message_id, url, self.config.clone());
        let pump_task = match self.store.lock().await.as_ref() {
            Some(store) => {
                let events = connection.events().await;
                Some(tokio::spawn(pump_updates(events, Arc::clone(store))))
            }
            None => None,
        };
        streams.insert(
            message_id.to_string(),
            ManagedStream {
                connection: connection.clone(),
                subscribers: added_subscribers,
                keep_alive,
                pump_task,
            },
        );
        Ok(connection)
    }
}

async fn pump_updates(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    store: Arc<Mutex<UpdateStore>>,
) {
    while let Some(event) = events.recv().await {
        if let StreamEvent::Update(update) = event {
            store.lock().await.apply_update(&update);
        }
    }
}
