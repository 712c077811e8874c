// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use core_protocol::event::{EventEnvelope, Topic};
use futures::StreamExt;
use log::{error, warn};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-subscriber buffer; a subscriber that falls this far behind loses messages
/// (the bus is at-least-once overall, not lossless per slow consumer).
const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// Cross-node replication of game events. Publishing is best-effort ordered
/// per game id; subscribers receive every topic and do their own
/// origin-node loop suppression.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError>;
    /// Subscribe to all topics. Each call returns an independent stream.
    async fn subscribe(&self) -> Result<mpsc::Receiver<EventEnvelope>, BusError>;
}

/// Redis pub/sub bus: one channel per topic, JSON envelopes. Malformed
/// messages are logged and dropped at this boundary.
pub struct RedisEventBus {
    client: Client,
    conn: ConnectionManager,
}

impl RedisEventBus {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = Client::open(redis_url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(envelope).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(envelope.channel.channel(), payload)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<EventEnvelope>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        for topic in Topic::ALL {
            pubsub
                .subscribe(topic.channel())
                .await
                .map_err(|e| BusError::Unavailable(e.to_string()))?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("bus message with non-text payload: {}", e);
                        continue;
                    }
                };
                let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("dropping malformed bus message: {}", e);
                        continue;
                    }
                };
                if tx.send(envelope).await.is_err() {
                    // Subscriber gone; stop the reader task.
                    return;
                }
            }
            error!("bus subscription stream ended");
        });
        Ok(rx)
    }
}

/// Sliding window of recently seen `(gameId, eventType, timestamp, seq)`
/// keys; the at-least-once bus makes consumers responsible for dropping
/// redelivery.
pub struct DedupWindow {
    capacity: usize,
    seen: std::collections::HashSet<(Option<String>, &'static str, u64, u64)>,
    order: std::collections::VecDeque<(Option<String>, &'static str, u64, u64)>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: Default::default(),
            order: Default::default(),
        }
    }

    /// Returns false if the envelope was already seen.
    pub fn insert(&mut self, envelope: &EventEnvelope) -> bool {
        let key = envelope.dedup_key();
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Process-local bus. Serves tests, single-node deployments, and the degraded
/// mode entered when the real bus is unavailable: fan-out keeps working
/// within the node even while replication is down.
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: Mutex<Vec<mpsc::Sender<EventEnvelope>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("local bus subscriber lagging, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<EventEnvelope>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}
