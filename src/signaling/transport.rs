//! Abstrakter Signaling-Transport
//!
//! Pub/Sub-Kanal pro Raum. Zustellung ist höchstens einmal und ohne
//! Reihenfolge-Garantie; kein Replay, keine Bestätigung.

use super::messages::TransportMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingTransportError {
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to subscribe to {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Not subscribed to room {0}")]
    NotSubscribed(String),
}

/// Empfangsseite einer Raum-Subscription
pub type Delivery = mpsc::UnboundedReceiver<TransportMessage>;

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Abonniert den Raum; eingehende Nachrichten landen im Receiver
    async fn subscribe(&self, room_id: &str) -> Result<Delivery, SignalingTransportError>;

    /// Veröffentlicht eine Nachricht im Raum
    async fn send(
        &self,
        room_id: &str,
        message: TransportMessage,
    ) -> Result<(), SignalingTransportError>;

    /// Beendet die Subscription; der Receiver wird geschlossen
    async fn unsubscribe(&self, room_id: &str);
}
