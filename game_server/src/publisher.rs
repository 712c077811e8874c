// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::client::ClientRepo;
use crate::pipeline::{classify, Priority};
use core_protocol::event::{EventEnvelope, GameEvent};
use core_protocol::get_unix_time_now;
use core_protocol::id::NodeId;
use log::{debug, warn};
use server_util::event_bus::EventBus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Single egress point for game events. Fans each one into (1) this node's
/// sockets, synchronously, (2) the persistence pipeline, (3) the cross-node
/// bus. A bus outage degrades to local-only fan-out; the pipeline keeps a
/// bounded backlog that sheds LOW-priority events first.
#[derive(Clone)]
pub struct EventPublisher {
    node_id: NodeId,
    seq: Arc<AtomicU64>,
    bus: Arc<dyn EventBus>,
    pipeline_tx: mpsc::Sender<EventEnvelope>,
    clients: Arc<ClientRepo>,
}

impl EventPublisher {
    pub fn new(
        node_id: NodeId,
        bus: Arc<dyn EventBus>,
        pipeline_tx: mpsc::Sender<EventEnvelope>,
        clients: Arc<ClientRepo>,
    ) -> Self {
        Self {
            node_id,
            seq: Arc::new(AtomicU64::new(0)),
            bus,
            pipeline_tx,
            clients,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn clients(&self) -> &Arc<ClientRepo> {
        &self.clients
    }

    fn envelope(&self, event: GameEvent) -> EventEnvelope {
        EventEnvelope {
            origin_node_id: self.node_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: get_unix_time_now(),
            channel: event.topic(),
            event,
        }
    }

    /// Callers publish only after the authoritative store write.
    pub async fn publish(&self, event: GameEvent) {
        let envelope = self.envelope(event);

        self.clients.fan_out(&envelope.event);
        self.enqueue_persist(&envelope).await;

        if let Err(e) = self.bus.publish(&envelope).await {
            warn!("bus publish failed, local fan-out only: {}", e);
        }
    }

    /// Queues an event for the durable store without touching sockets or
    /// the bus. Startup reconciliation re-feeds recovered events this way.
    pub async fn persist_only(&self, event: GameEvent) {
        let envelope = self.envelope(event);
        self.enqueue_persist(&envelope).await;
    }

    /// Backpressure policy: a full backlog sheds LOW-priority events and
    /// makes HIGH/MEDIUM publishers wait for space, so a game-ending
    /// envelope is never the one dropped.
    async fn enqueue_persist(&self, envelope: &EventEnvelope) {
        match classify(&envelope.event) {
            None => {}
            Some(Priority::Low) => match self.pipeline_tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(envelope)) => {
                    debug!(
                        "persistence backlog full, dropping {} event",
                        envelope.event.event_type()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("persistence pipeline stopped");
                }
            },
            Some(_) => {
                if self.pipeline_tx.send(envelope.clone()).await.is_err() {
                    debug!("persistence pipeline stopped");
                }
            }
        }
    }
}
