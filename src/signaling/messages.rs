//! Message Types für das Signaling-Protokoll
//!
//! Drei Nachrichtenarten pro Raum (`signal`, `participant-joined`,
//! `participant-left`) plus die Frames, mit denen der WebSocket-Transport
//! mit dem Relay-Server spricht.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event-Namen auf dem Raum-Kanal
pub const SIGNAL_EVENT: &str = "signal";
pub const PARTICIPANT_JOINED_EVENT: &str = "participant-joined";
pub const PARTICIPANT_LEFT_EVENT: &str = "participant-left";

/// Logisches Topic eines Raums
pub fn room_topic(room_id: &str) -> String {
    format!("call:{}", room_id)
}

// ============================================================================
// ROOM MESSAGES
// ============================================================================

/// Rohe Nachricht, wie sie der Transport zustellt (ungeprüft)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub event: String,
    pub payload: Value,
}

impl TransportMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn signal(envelope: &SignalEnvelope) -> Self {
        Self::new(
            SIGNAL_EVENT,
            serde_json::json!({
                "from": envelope.from,
                "to": envelope.to,
                "roomId": envelope.room_id,
                "signal": envelope.signal,
                "timestamp": envelope.timestamp,
            }),
        )
    }

    pub fn joined(presence: &PresenceMessage) -> Self {
        Self::new(PARTICIPANT_JOINED_EVENT, presence.to_value())
    }

    pub fn left(presence: &PresenceMessage) -> Self {
        Self::new(PARTICIPANT_LEFT_EVENT, presence.to_value())
    }
}

/// Verhandlungsnachricht zwischen zwei Teilnehmern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    pub room_id: String,
    pub signal: Value,
    pub timestamp: i64,
}

/// Anwesenheitsmeldung (joined / left)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub user_id: String,
    pub room_id: String,
    pub timestamp: i64,
    /// Hat der Absender den Anruf als Initiator gestartet?
    #[serde(default)]
    pub initiator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl PresenceMessage {
    fn to_value(&self) -> Value {
        let mut value = serde_json::json!({
            "userId": self.user_id,
            "roomId": self.room_id,
            "timestamp": self.timestamp,
            "initiator": self.initiator,
        });
        if let (Some(name), Some(obj)) = (&self.display_name, value.as_object_mut()) {
            obj.insert("displayName".to_string(), Value::String(name.clone()));
        }
        value
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
}

/// Geprüfte, typisierte Raum-Nachricht
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Signal(SignalEnvelope),
    Joined(PresenceMessage),
    Left(PresenceMessage),
}

impl InboundMessage {
    pub fn decode(message: &TransportMessage) -> Result<Self, DecodeError> {
        let malformed = |e: serde_json::Error| DecodeError::Malformed {
            event: message.event.clone(),
            reason: e.to_string(),
        };

        match message.event.as_str() {
            SIGNAL_EVENT => serde_json::from_value(message.payload.clone())
                .map(InboundMessage::Signal)
                .map_err(malformed),
            PARTICIPANT_JOINED_EVENT => serde_json::from_value(message.payload.clone())
                .map(InboundMessage::Joined)
                .map_err(malformed),
            PARTICIPANT_LEFT_EVENT => serde_json::from_value(message.payload.clone())
                .map(InboundMessage::Left)
                .map_err(malformed),
            other => Err(DecodeError::UnknownEvent(other.to_string())),
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            InboundMessage::Signal(envelope) => &envelope.room_id,
            InboundMessage::Joined(presence) | InboundMessage::Left(presence) => {
                &presence.room_id
            }
        }
    }
}

// ============================================================================
// PEER DATA MESSAGES
// ============================================================================

/// Nachrichten, die direkt über den Datenkanal laufen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerDataMessage {
    #[serde(rename_all = "camelCase")]
    MediaState {
        video_enabled: bool,
        audio_enabled: bool,
    },
}

impl PeerDataMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Versucht Bytes als bekannte Nachricht zu lesen
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

// ============================================================================
// RELAY FRAMES (WebSocket)
// ============================================================================

/// Client → Relay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
    Heartbeat,
}

/// Relay → Client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Nachricht eines anderen Clients im Topic
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },

    /// Bestätigung eines Subscribe
    Subscribed { topic: String },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}
