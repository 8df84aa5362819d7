//! In-Process Signaling
//!
//! Ein `MemoryHub` verteilt Nachrichten an alle Transports, die denselben
//! Raum abonniert haben (Absender eingeschlossen, der Router filtert).
//! Praktisch für mehrere Sessions im selben Prozess und für Tests.

use super::messages::{room_topic, TransportMessage};
use super::transport::{Delivery, SignalingTransport, SignalingTransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Subscribers = Vec<(u64, mpsc::UnboundedSender<TransportMessage>)>;

/// Gemeinsamer Verteiler
#[derive(Default)]
pub struct MemoryHub {
    topics: Mutex<HashMap<String, Subscribers>>,
    next_id: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Neuer Client am Hub
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            client_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.topics
            .lock()
            .get(&room_topic(room_id))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn publish(&self, topic: &str, message: TransportMessage) -> usize {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        // Geschlossene Receiver gleich mit aufräumen
        subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        subscribers.len()
    }
}

/// Ein Client am `MemoryHub`
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    client_id: u64,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn subscribe(&self, room_id: &str) -> Result<Delivery, SignalingTransportError> {
        let topic = room_topic(room_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.hub.topics.lock();
        let subscribers = topics.entry(topic.clone()).or_default();
        subscribers.retain(|(id, _)| *id != self.client_id);
        subscribers.push((self.client_id, tx));
        tracing::debug!("Client {} subscribed to {}", self.client_id, topic);
        Ok(rx)
    }

    async fn send(
        &self,
        room_id: &str,
        message: TransportMessage,
    ) -> Result<(), SignalingTransportError> {
        let topic = room_topic(room_id);
        let delivered = self.hub.publish(&topic, message);
        tracing::trace!("Published to {} ({} subscriber(s))", topic, delivered);
        Ok(())
    }

    async fn unsubscribe(&self, room_id: &str) {
        let topic = room_topic(room_id);
        let mut topics = self.hub.topics.lock();
        if let Some(subscribers) = topics.get_mut(&topic) {
            subscribers.retain(|(id, _)| *id != self.client_id);
            if subscribers.is_empty() {
                topics.remove(&topic);
            }
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("client_id", &self.client_id)
            .finish()
    }
}
