//! Negotiation Module - Verhandlungsprimitiv pro Teilnehmer
//!
//! Abstraktion über eine einzelne Peer-to-Peer Verbindung:
//! - Opaque Signal-Payloads rein und raus
//! - Remote-Stream, Datenkanal und Verbindungsstatus als Events
//! - Austausch der ausgehenden Videospur ohne Neuverhandlung
//!
//! Die Implementierung auf Basis des `webrtc` Crates liegt in `webrtc_peer`.

mod webrtc_peer;

use crate::media::{MediaStream, MediaTrack};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use webrtc_peer::{LocalTrackBank, WebRtcConnector};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),

    #[error("Outgoing track not found: {0}")]
    TrackNotFound(String),

    #[error("Peer connection closed")]
    Closed,

    #[error("Data channel not open")]
    ChannelNotOpen,
}

// ============================================================================
// TYPES
// ============================================================================

/// Wer das Offer erstellt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Receiver,
}

impl NegotiationRole {
    pub fn is_initiator(self) -> bool {
        self == NegotiationRole::Initiator
    }
}

/// Events, die ein Primitiv nach oben meldet
#[derive(Debug, Clone)]
pub enum PrimitiveEvent {
    /// Ausgehender Signal-Payload für den Remote-Peer
    Signal(Value),
    /// Remote-Medien sind eingetroffen
    Stream(MediaStream),
    /// Datenkanal ist offen
    Connect,
    /// Daten vom Remote-Peer
    Data(Vec<u8>),
    /// Verbindung wurde geschlossen
    Close,
    /// Verhandlung oder Transport fehlgeschlagen
    Error(String),
}

pub type PrimitiveEvents = mpsc::UnboundedSender<PrimitiveEvent>;

/// Parameter für ein neues Primitiv
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub participant_id: String,
    pub role: NegotiationRole,
    pub local_stream: MediaStream,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Erstellt Primitive
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Baut ein neues Primitiv; als Initiator beginnt es sofort zu verhandeln
    async fn connect(
        &self,
        options: PeerOptions,
        events: PrimitiveEvents,
    ) -> Result<Box<dyn NegotiationPeer>, NegotiationError>;
}

/// Eine laufende Verbindung zu genau einem Remote-Peer
#[async_trait]
pub trait NegotiationPeer: Send {
    /// Verarbeitet einen Signal-Payload vom Remote-Peer
    async fn signal(&mut self, payload: Value) -> Result<(), NegotiationError>;

    /// Ersetzt die ausgehende Spur `old` durch `new` (`None` = keine Spur)
    async fn replace_track(
        &mut self,
        old: Option<MediaTrack>,
        new: Option<MediaTrack>,
        stream: MediaStream,
    ) -> Result<(), NegotiationError>;

    /// Sendet Daten über den Datenkanal
    async fn send(&mut self, data: Vec<u8>) -> Result<(), NegotiationError>;

    async fn close(&mut self);
}
