//! Peer Topology
//!
//! Entscheidet, wie Verbindungen zu Remote-Teilnehmern entstehen.
//! `FullMesh` baut zu jedem Teilnehmer eine eigene P2P-Verbindung.

use super::peer::{AdapterEvent, AdapterId, PeerAdapter};
use crate::media::MediaStream;
use crate::negotiation::{NegotiationRole, PeerConnector, PeerOptions};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Anfrage für eine neue Verbindung
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub adapter_id: AdapterId,
    pub participant_id: String,
    pub role: NegotiationRole,
    pub local_stream: MediaStream,
}

pub trait PeerTopology: Send + Sync {
    fn name(&self) -> &'static str;

    /// Darf bei `current` bekannten Remote-Teilnehmern ein weiterer dazukommen?
    fn accepts(&self, current: usize) -> bool;

    fn open_link(
        &self,
        request: LinkRequest,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> PeerAdapter;
}

// ============================================================================
// FULL MESH
// ============================================================================

/// Eine direkte Verbindung pro Teilnehmerpaar
pub struct FullMesh {
    connector: Arc<dyn PeerConnector>,
    /// Inklusive lokalem Teilnehmer (0 = unbegrenzt)
    max_participants: usize,
}

impl FullMesh {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            max_participants: 0,
        }
    }

    pub fn with_max_participants(mut self, max_participants: usize) -> Self {
        self.max_participants = max_participants;
        self
    }
}

impl PeerTopology for FullMesh {
    fn name(&self) -> &'static str {
        "full-mesh"
    }

    fn accepts(&self, current: usize) -> bool {
        self.max_participants == 0 || current + 1 < self.max_participants
    }

    fn open_link(
        &self,
        request: LinkRequest,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> PeerAdapter {
        tracing::debug!(
            "Opening {:?} link {} to {}",
            request.role,
            request.adapter_id,
            request.participant_id
        );
        PeerAdapter::spawn(
            Arc::clone(&self.connector),
            request.adapter_id,
            PeerOptions {
                participant_id: request.participant_id,
                role: request.role,
                local_stream: request.local_stream,
            },
            events,
        )
    }
}

impl std::fmt::Debug for FullMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullMesh")
            .field("max_participants", &self.max_participants)
            .finish()
    }
}
