//! Participant Registry
//!
//! Besitzt pro Remote-Teilnehmer den Adapter und dessen Remote-Stream.
//! Beim Entfernen werden Adapter und Remote-Spuren gestoppt, bevor der
//! Eintrag verschwindet.

use super::peer::{ConnectionState, PeerAdapter};
use crate::media::MediaStream;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// TYPES
// ============================================================================

/// Snapshot eines Teilnehmers für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub connection_state: ConnectionState,
    pub is_muted: bool,
    pub is_video_off: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Participant {participant_id} already has an active connection ({state:?})")]
    ActiveConnection {
        participant_id: String,
        state: ConnectionState,
    },
}

pub(crate) struct RegistryEntry {
    adapter: PeerAdapter,
    display_name: String,
    is_muted: bool,
    is_video_off: bool,
}

impl RegistryEntry {
    pub fn new(adapter: PeerAdapter, display_name: String) -> Self {
        Self {
            adapter,
            display_name,
            is_muted: false,
            is_video_off: false,
        }
    }

    pub fn adapter(&self) -> &PeerAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut PeerAdapter {
        &mut self.adapter
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.adapter.state()
    }

    /// Remote-Stream, sobald verbunden
    pub fn stream(&self) -> Option<MediaStream> {
        self.adapter.remote_stream().cloned()
    }

    /// Übernimmt einen gemeldeten Medienstatus des Teilnehmers
    pub fn set_media_state(&mut self, video_enabled: bool, audio_enabled: bool) {
        self.is_video_off = !video_enabled;
        self.is_muted = !audio_enabled;
    }

    pub fn snapshot(&self) -> Participant {
        Participant {
            id: self.adapter.participant_id().to_string(),
            display_name: self.display_name.clone(),
            connection_state: self.connection_state(),
            is_muted: self.is_muted,
            is_video_off: self.is_video_off,
        }
    }

    fn teardown(&mut self) {
        // Schließt das Primitiv und stoppt die Remote-Spuren
        self.adapter.destroy();
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Default)]
pub(crate) struct ParticipantRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    pub fn get(&self, participant_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut RegistryEntry> {
        self.entries.get_mut(participant_id)
    }

    /// Legt einen Eintrag an oder ersetzt einen inaktiven
    ///
    /// Ein verdrängter Eintrag (`Created`/`Closed`) wird abgebaut und
    /// zurückgegeben. Läuft für die ID bereits eine Verhandlung oder
    /// Verbindung, wird abgelehnt.
    pub fn upsert(
        &mut self,
        participant_id: &str,
        entry: RegistryEntry,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        if let Some(existing) = self.entries.get(participant_id) {
            let state = existing.connection_state();
            if matches!(
                state,
                ConnectionState::Negotiating | ConnectionState::Connected
            ) {
                return Err(RegistryError::ActiveConnection {
                    participant_id: participant_id.to_string(),
                    state,
                });
            }
        }

        let displaced = self
            .entries
            .insert(participant_id.to_string(), entry)
            .map(|mut old| {
                old.teardown();
                old
            });
        Ok(displaced)
    }

    /// Baut den Teilnehmer ab und entfernt ihn (unbekannte IDs: no-op)
    pub fn remove(&mut self, participant_id: &str) -> Option<RegistryEntry> {
        if let Some(entry) = self.entries.get_mut(participant_id) {
            entry.teardown();
        }
        self.entries.remove(participant_id)
    }

    /// Entfernt alle Teilnehmer, sortiert nach ID
    pub fn drain(&mut self) -> Vec<(String, RegistryEntry)> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> =
            self.entries.values().map(RegistryEntry::snapshot).collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    /// Adapter mit Remote-Stream
    pub fn connected_adapters(&self) -> impl Iterator<Item = &PeerAdapter> {
        self.entries
            .values()
            .map(RegistryEntry::adapter)
            .filter(|adapter| adapter.is_connected())
    }

    /// Adapter, die noch nicht geschlossen sind (auch mitten in der Verhandlung)
    pub fn live_adapters(&self) -> impl Iterator<Item = &PeerAdapter> {
        self.entries
            .values()
            .map(RegistryEntry::adapter)
            .filter(|adapter| !adapter.is_closed())
    }

    pub fn connected_count(&self) -> usize {
        self.connected_adapters().count()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &PeerAdapter> {
        self.entries.values().map(RegistryEntry::adapter)
    }
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistry")
            .field("participants", &self.participants())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind, TrackSource};
    use crate::negotiation::{NegotiationRole, PeerConnector, PeerOptions, PrimitiveEvent};
    use crate::testing::FakeConnector;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn entry(connector: &Arc<FakeConnector>, id: &str, adapter_id: u64) -> RegistryEntry {
        let (tx, _rx) = mpsc::unbounded_channel();
        let adapter = PeerAdapter::spawn(
            Arc::clone(connector) as Arc<dyn PeerConnector>,
            adapter_id,
            PeerOptions {
                participant_id: id.to_string(),
                role: NegotiationRole::Receiver,
                local_stream: MediaStream::empty(),
            },
            tx,
        );
        RegistryEntry::new(adapter, id.to_string())
    }

    fn connect(entry: &mut RegistryEntry) -> MediaTrack {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Remote, "remote");
        entry
            .adapter_mut()
            .apply(PrimitiveEvent::Stream(MediaStream::new(vec![track.clone()])));
        track
    }

    #[tokio::test]
    async fn test_upsert_rejects_active_entry() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = ParticipantRegistry::new();

        let mut first = entry(&connector, "bob", 1);
        connect(&mut first);
        assert!(registry.upsert("bob", first).unwrap().is_none());

        let err = registry.upsert("bob", entry(&connector, "bob", 2));
        assert!(matches!(err, Err(RegistryError::ActiveConnection { .. })));
        assert_eq!(registry.get("bob").unwrap().adapter().id(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_idle_entry() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = ParticipantRegistry::new();

        registry.upsert("bob", entry(&connector, "bob", 1)).unwrap();
        let displaced = registry
            .upsert("bob", entry(&connector, "bob", 2))
            .unwrap()
            .unwrap();

        assert!(displaced.adapter().is_closed());
        assert_eq!(registry.get("bob").unwrap().adapter().id(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_stops_tracks_first() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = ParticipantRegistry::new();
        let mut bob = entry(&connector, "bob", 1);
        let track = connect(&mut bob);
        registry.upsert("bob", bob).unwrap();
        assert_eq!(registry.connected_count(), 1);

        let removed = registry.remove("bob").unwrap();
        assert!(removed.adapter().is_closed());
        assert!(!track.is_live());
        assert!(registry.remove("bob").is_none());
        assert_eq!(registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_media_state_in_snapshot() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = ParticipantRegistry::new();
        registry.upsert("carol", entry(&connector, "carol", 1)).unwrap();
        registry.upsert("bob", entry(&connector, "bob", 2)).unwrap();

        registry
            .get_mut("bob")
            .unwrap()
            .set_media_state(false, true);

        let participants = registry.participants();
        assert_eq!(participants[0].id, "bob");
        assert!(participants[0].is_video_off);
        assert!(!participants[0].is_muted);
        assert_eq!(participants[1].connection_state, ConnectionState::Created);
    }

    #[tokio::test]
    async fn test_drain_removes_everyone() {
        let connector = Arc::new(FakeConnector::new());
        let mut registry = ParticipantRegistry::new();
        registry.upsert("b", entry(&connector, "b", 1)).unwrap();
        registry.upsert("a", entry(&connector, "a", 2)).unwrap();

        let drained = registry.drain();
        let ids: Vec<&str> = drained.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.len(), 0);
    }
}
