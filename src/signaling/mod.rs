//! Signaling Module - Raum-Kanal zwischen den Teilnehmern
//!
//! Dieses Modul verwaltet die Kommunikation über den Signaling-Kanal:
//! - Abstrakter Pub/Sub-Transport pro Raum
//! - WebSocket-Verbindung zum Relay aufbauen und halten
//! - In-Process Hub für lokale Sessions
//! - Nachrichten prüfen und typisiert weiterleiten
//!

mod client;
mod memory;
pub mod messages;
mod transport;

pub use client::{ConnectionEvent, WebSocketTransport};
pub use memory::{MemoryHub, MemoryTransport};
pub use messages::{
    room_topic, DecodeError, InboundMessage, PeerDataMessage, PresenceMessage, SignalEnvelope,
    TransportMessage,
};
pub use transport::{Delivery, SignalingTransport, SignalingTransportError};
