//! Call Engine Module - Sessions im Full Mesh
//!
//! Dieses Modul verwaltet:
//! - Call Sessions (Start, Ende, Medien-Umschaltung)
//! - Signaling Router mit Rollenwahl und Signal-Puffer
//! - Peer Adapter und Teilnehmer-Registry
//! - Bildschirmfreigabe per Spurwechsel

mod events;
mod local_media;
mod peer;
mod registry;
mod router;
mod session;
mod topology;
mod track_swap;

pub use events::{CallError, CallEvent};
pub use local_media::VideoSource;
pub use peer::{AdapterEvent, AdapterId, ConnectionState, PeerAdapter};
pub use registry::{Participant, RegistryError};
pub use session::{CallDependencies, CallSession, CallSessionManager, SessionState};
pub use topology::{FullMesh, LinkRequest, PeerTopology};
pub use track_swap::ReplacementReport;
