//! Single message-stream connection management.
//!
//! One [`MessageConnection`] owns one WebSocket for one message id. It keeps
//! the transport alive with periodic ping frames, queues logical
//! subscriptions until the server confirms the channel, and retries with a
//! fixed delay after unexpected closes.

use crate::config::StreamConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{ClientFrame, ExecutionUpdate, ServerFrame, encode_client_frame, parse_server_frame};
use futures_util::{SinkExt, StreamExt, stream::{SplitSink, SplitStream}};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Connection status, published through a watch channel for UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

/// Event delivered to logical subscribers of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Server confirmed the channel; queued subscriptions were replayed.
    Established { message_id: String },
    Subscribed { message_id: String },
    Unsubscribed { message_id: String },
    Pong,
    Update(ExecutionUpdate),
    /// Transport-level error; the connection recovers via the reconnect
    /// policy where enabled.
    Error(String),
    /// The bounded reconnect budget is exhausted; no further automatic
    /// attempts happen until an explicit connect.
    ReconnectFailed { attempts: u32 },
    Closed,
}

struct Inner {
    message_id: String,
    url: Url,
    config: StreamConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    writer: Mutex<Option<WsWriter>>,
    /// Logical subscription ids the caller wants active.
    subscriptions: Mutex<HashSet<String>>,
    /// Ids already sent on the current transport; cleared on every dial.
    sent: Mutex<HashSet<String>>,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
    /// Set by `disconnect`; a stale transport-closed callback checks this
    /// before touching status so it cannot clobber a newer connect.
    closed: AtomicBool,
    connect_lock: Mutex<()>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cloneable handle to one per-message streaming connection.
#[derive(Clone)]
pub struct MessageConnection {
    inner: Arc<Inner>,
}

impl MessageConnection {
    /// Create a connection for one message id. Nothing is dialed until
    /// [`MessageConnection::connect`].
    pub fn new(message_id: impl Into<String>, url: Url, config: StreamConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                message_id: message_id.into(),
                url,
                config,
                status_tx,
                writer: Mutex::new(None),
                subscriptions: Mutex::new(HashSet::new()),
                sent: Mutex::new(HashSet::new()),
                event_senders: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                connect_lock: Mutex::new(()),
                recv_task: Mutex::new(None),
                ping_task: Mutex::new(None),
            }),
        }
    }

    /// Message id this connection streams.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch status transitions.
    #[must_use]
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Register a new event receiver. Every receiver sees every event
    /// emitted after registration; dropped receivers are pruned.
    pub async fn events(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.event_senders.lock().await.push(tx);
        rx
    }

    /// Open the transport. Idempotent: concurrent callers share one dial,
    /// and a call on an already-connected stream returns immediately.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        Inner::open_transport(Arc::clone(&self.inner)).await
    }

    /// Request streaming updates for a logical message id.
    ///
    /// Sent immediately when connected; otherwise queued and replayed once
    /// the server confirms the channel, so ordering races never drop it.
    pub async fn subscribe(&self, message_id: &str) -> Result<()> {
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(message_id.to_string());
        if self.status() == ConnectionStatus::Connected {
            Inner::send_subscribe(&self.inner, message_id).await?;
        }
        Ok(())
    }

    /// Stop streaming updates for a logical message id. Idempotent; always
    /// removes the id from the queued set.
    pub async fn unsubscribe(&self, message_id: &str) -> Result<()> {
        let was_known = self.inner.subscriptions.lock().await.remove(message_id);
        self.inner.sent.lock().await.remove(message_id);
        if was_known && self.status() == ConnectionStatus::Connected {
            Inner::send_frame(
                &self.inner,
                &ClientFrame::Unsubscribe {
                    message_id: message_id.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Close the transport and stop background tasks. Safe to call
    /// repeatedly; cancels any in-progress reconnect loop.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some(mut writer) = self.inner.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!(
                message_id = %self.inner.message_id,
                "close frame send failed: {error}"
            );
        }
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.inner.ping_task.lock().await.take() {
            task.abort();
        }
        self.inner.sent.lock().await.clear();
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
        Inner::emit(&self.inner, StreamEvent::Closed).await;
    }
}

impl Inner {
    fn open_transport(inner: Arc<Self>) -> futures_util::future::BoxFuture<'static, Result<()>> {
        Box::pin(async move {
        inner.status_tx.send_replace(ConnectionStatus::Connecting);

        let dialed = timeout(inner.config.connect_timeout, connect_async(inner.url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    inner.config.connect_timeout
                ))
            })
            .and_then(|result| result.map_err(|error| ClientError::WebSocket(error.to_string())));

        let (stream, _response) = match dialed {
            Ok(ok) => ok,
            Err(error) => {
                inner.status_tx.send_replace(ConnectionStatus::Error);
                Self::emit(&inner, StreamEvent::Error(error.to_string())).await;
                return Err(error);
            }
        };

        // A disconnect that raced the dial wins; drop the fresh transport.
        if inner.closed.load(Ordering::SeqCst) {
            inner.status_tx.send_replace(ConnectionStatus::Disconnected);
            return Err(ClientError::Connection(
                "connection closed while dialing".to_string(),
            ));
        }

        let (writer, reader) = stream.split();
        *inner.writer.lock().await = Some(writer);
        inner.sent.lock().await.clear();
        inner.status_tx.send_replace(ConnectionStatus::Connected);

        let recv = tokio::spawn(Self::recv_loop(Arc::clone(&inner), reader));
        if let Some(previous) = inner.recv_task.lock().await.replace(recv) {
            previous.abort();
        }
        let ping = tokio::spawn(Self::ping_loop(Arc::clone(&inner)));
        if let Some(previous) = inner.ping_task.lock().await.replace(ping) {
            previous.abort();
        }
        Ok(())
        })
    }

    async fn recv_loop(inner: Arc<Self>, mut reader: WsReader) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => Self::handle_text(&inner, text.as_str()).await,
                Ok(Message::Ping(payload)) => {
                    debug!(
                        message_id = %inner.message_id,
                        "transport ping ({} bytes)",
                        payload.len()
                    );
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    warn!(message_id = %inner.message_id, "websocket read error: {error}");
                    Self::emit(&inner, StreamEvent::Error(error.to_string())).await;
                    break;
                }
            }
        }
        Self::on_transport_closed(inner).await;
    }

    async fn handle_text(inner: &Arc<Self>, text: &str) {
        let frame = match parse_server_frame(text) {
            Ok(frame) => frame,
            Err(error) => {
                // A single malformed frame is skipped, never fatal.
                warn!(message_id = %inner.message_id, "dropping bad frame: {error}");
                return;
            }
        };
        match frame {
            ServerFrame::ConnectionEstablished { message_id, .. } => {
                Self::replay_subscriptions(inner).await;
                Self::emit(inner, StreamEvent::Established { message_id }).await;
            }
            ServerFrame::Subscription { message_id, .. } => {
                Self::emit(inner, StreamEvent::Subscribed { message_id }).await;
            }
            ServerFrame::Unsubscription { message_id, .. } => {
                Self::emit(inner, StreamEvent::Unsubscribed { message_id }).await;
            }
            ServerFrame::Pong => Self::emit(inner, StreamEvent::Pong).await,
            ServerFrame::Update(update) => Self::emit(inner, StreamEvent::Update(update)).await,
            ServerFrame::Unknown => {
                debug!(message_id = %inner.message_id, "ignoring unknown frame type");
            }
        }
    }

    /// Send every desired subscription not yet delivered on this transport.
    async fn replay_subscriptions(inner: &Arc<Self>) {
        let desired: Vec<String> = inner.subscriptions.lock().await.iter().cloned().collect();
        for message_id in desired {
            if let Err(error) = Self::send_subscribe(inner, &message_id).await {
                warn!(
                    message_id = %inner.message_id,
                    "subscription replay failed for {message_id}: {error}"
                );
            }
        }
    }

    async fn send_subscribe(inner: &Arc<Self>, message_id: &str) -> Result<()> {
        {
            let sent = inner.sent.lock().await;
            if sent.contains(message_id) {
                return Ok(());
            }
        }
        Self::send_frame(
            inner,
            &ClientFrame::Subscribe {
                message_id: message_id.to_string(),
            },
        )
        .await?;
        inner.sent.lock().await.insert(message_id.to_string());
        Ok(())
    }

    async fn send_frame(inner: &Arc<Self>, frame: &ClientFrame) -> Result<()> {
        let text = encode_client_frame(frame)?;
        let mut writer_guard = inner.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn ping_loop(inner: Arc<Self>) {
        let mut ticker = tokio::time::interval(inner.config.ping_interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if inner.closed.load(Ordering::SeqCst)
                || *inner.status_tx.borrow() != ConnectionStatus::Connected
            {
                return;
            }
            if let Err(error) = Self::send_frame(&inner, &ClientFrame::Ping).await {
                debug!(message_id = %inner.message_id, "keep-alive ping failed: {error}");
                return;
            }
        }
    }

    async fn on_transport_closed(inner: Arc<Self>) {
        inner.writer.lock().await.take();
        if let Some(task) = inner.ping_task.lock().await.take() {
            task.abort();
        }

        // A deliberate disconnect already settled the status.
        if inner.closed.load(Ordering::SeqCst)
            || *inner.status_tx.borrow() == ConnectionStatus::Disconnected
        {
            return;
        }

        if inner.config.auto_reconnect && inner.config.max_reconnect_attempts > 0 {
            tokio::spawn(Self::reconnect_loop(inner));
        } else {
            inner.status_tx.send_replace(ConnectionStatus::Disconnected);
            Self::emit(&inner, StreamEvent::Closed).await;
        }
    }

    async fn reconnect_loop(inner: Arc<Self>) {
        inner.status_tx.send_replace(ConnectionStatus::Reconnecting);
        let max_attempts = inner.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            sleep(inner.config.reconnect_delay).await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            debug!(
                message_id = %inner.message_id,
                "reconnect attempt {attempt}/{max_attempts}"
            );
            let result = {
                let _guard = inner.connect_lock.lock().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                // An explicit connect may have already restored the stream.
                if *inner.status_tx.borrow() == ConnectionStatus::Connected {
                    return;
                }
                Self::open_transport(Arc::clone(&inner)).await
            };
            match result {
                Ok(()) => return,
                Err(error) => {
                    warn!(
                        message_id = %inner.message_id,
                        "reconnect attempt {attempt}/{max_attempts} failed: {error}"
                    );
                    if attempt < max_attempts {
                        inner.status_tx.send_replace(ConnectionStatus::Reconnecting);
                    }
                }
            }
        }

        inner.status_tx.send_replace(ConnectionStatus::Disconnected);
        Self::emit(
            &inner,
            StreamEvent::ReconnectFailed {
                attempts: max_attempts,
            },
        )
        .await;
    }

    async fn emit(inner: &Arc<Self>, event: StreamEvent) {
        inner
            .event_senders
            .lock()
            .await
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}
