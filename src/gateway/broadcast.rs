//! User-to-user chat fan-out over websockets.
//!
//! Each connection runs one reader task that stores and publishes inbound
//! frames, and one dispatch loop that drains the user's broker channel back
//! into the socket. Connections never talk to each other directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{BoxStream, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::ids::IdGenerator;
use super::sqlite_store::SqliteStore;
use super::store_types::ChatMessageRecord;
use super::{Clock, SystemClock};

const MEMORY_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker subscription failed: {0}")]
    Subscribe(String),
}

/// Topic-based publish/subscribe used to route chat payloads between connections.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BrokerError>;
}

/// In-process broker; payloads published with no live subscriber are dropped.
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops channels whose last subscriber went away, then subscribes.
    fn receiver(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn live_sender(&self, channel: &str) -> Option<broadcast::Sender<String>> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = channels.get(channel).cloned()?;
        if sender.receiver_count() == 0 {
            channels.remove(channel);
            return None;
        }
        Some(sender)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        if let Some(sender) = self.live_sender(channel) {
            // Err only means the last subscriber left meanwhile.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BrokerError> {
        let receiver = self.receiver(channel);
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "chat subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundChatMessage {
    pub to_id: i64,
    #[serde(default)]
    pub message_type: Option<i64>,
    #[serde(default)]
    pub message_media: Option<i64>,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    pub from_id: i64,
    pub to_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_media: Option<i64>,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("invalid message payload")]
    InvalidPayload,
    #[error("message decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct ChatFanout {
    broker: Arc<dyn MessageBroker>,
    store: Option<SqliteStore>,
    ids: Arc<IdGenerator>,
    publish_key: String,
    clock: Arc<dyn Clock>,
}

impl ChatFanout {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Option<SqliteStore>,
        ids: Arc<IdGenerator>,
        publish_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            ids,
            publish_key: publish_key.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn channel_for(&self, user_id: i64) -> String {
        format!("{}:user:{user_id}", self.publish_key)
    }

    fn timestamp(&self) -> String {
        let nanos = i128::from(self.clock.now_millis()) * 1_000_000;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|at| at.format(&Rfc3339).ok())
            .unwrap_or_default()
    }

    /// Validates, stores and publishes one inbound frame from `from_id`.
    pub async fn dispatch(&self, from_id: i64, raw: &[u8]) -> Result<OutboundChatMessage, FanoutError> {
        let inbound: InboundChatMessage = serde_json::from_slice(raw)?;
        if inbound.to_id <= 0 || inbound.content.trim().is_empty() {
            return Err(FanoutError::InvalidPayload);
        }

        let mut outbound = OutboundChatMessage {
            message_id: None,
            from_id,
            to_id: inbound.to_id,
            message_type: inbound.message_type.filter(|value| *value != 0),
            message_media: inbound.message_media.filter(|value| *value != 0),
            content: inbound.content,
            timestamp: self.timestamp(),
        };

        if let Some(store) = self.store.as_ref() {
            let record = ChatMessageRecord {
                id: self.ids.next_id(),
                from_id,
                to_id: outbound.to_id,
                message_type: outbound.message_type,
                message_media: outbound.message_media,
                content: outbound.content.clone(),
                created_at_ms: i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX),
            };
            let id = record.id;
            match store.insert_chat_message(record).await {
                Ok(()) => outbound.message_id = Some(id),
                Err(err) => tracing::warn!(from_id, error = %err, "failed to store chat message"),
            }
        }

        let payload = serde_json::to_string(&outbound)?;
        self.broker
            .publish(&self.channel_for(outbound.to_id), payload.clone())
            .await?;
        if outbound.to_id != from_id {
            self.broker
                .publish(&self.channel_for(from_id), payload)
                .await?;
        }
        Ok(outbound)
    }

    /// Serves one websocket connection for `user_id` until either side stops.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, user_id: i64) {
        let mut subscription = match self.broker.subscribe(&self.channel_for(user_id)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "chat subscription failed");
                return;
            }
        };

        let (mut sink, stream) = socket.split();
        let cancel = CancellationToken::new();
        let fanout = Arc::clone(&self);
        let reader_cancel = cancel.clone();
        let mut reader =
            tokio::spawn(async move { fanout.read_loop(stream, user_id, reader_cancel).await });

        let outcome: Result<(), FanoutError> = loop {
            tokio::select! {
                payload = subscription.next() => match payload {
                    Some(payload) => {
                        if let Err(err) = sink.send(Message::Text(payload)).await {
                            break Err(err.into());
                        }
                    }
                    None => break Ok(()),
                },
                joined = &mut reader => {
                    break joined.map_err(FanoutError::from).and_then(|result| result);
                }
            }
        };
        cancel.cancel();

        match outcome {
            Ok(()) => tracing::debug!(user_id, "chat connection closed"),
            Err(err) => tracing::info!(user_id, error = %err, "chat connection ended"),
        }
        let _ = sink.close().await;
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        user_id: i64,
        cancel: CancellationToken,
    ) -> Result<(), FanoutError> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };
            let raw = match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(_)) => continue,
            };
            self.dispatch(user_id, &raw).await?;
        }
    }
}
