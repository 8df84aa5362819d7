//! Mesh Call - Mehrparteien-Anrufe im Full Mesh
//!
//! Orchestrierung von Peer-to-Peer Anrufen mit:
//! - Einem ungeordneten Pub/Sub Signaling-Kanal pro Raum
//! - WebRTC Verbindungen zu jedem anderen Teilnehmer
//! - Kamera/Mikrofon mit Constraint-Fallback und Plattform-Hinweisen
//! - Bildschirmfreigabe per Spurwechsel ohne Neuverhandlung

pub mod call_engine;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{
    CallDependencies, CallError, CallEvent, CallSession, CallSessionManager, ConnectionState,
    Participant, SessionState,
};
pub use config::CallConfig;

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "mesh_call_lib=debug,mesh_call=debug,webrtc=warn";

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
