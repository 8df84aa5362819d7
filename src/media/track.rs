//! Media Tracks und Streams
//!
//! Leichtgewichtige Handles auf lokale und entfernte Medienspuren.
//! Ein Track kann von mehreren Besitzern geteilt werden (Arc), der
//! Enabled-Flag und der Ready-State gelten für alle Kopien.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// TRACK TYPES
// ============================================================================

/// Art der Medienspur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Herkunft einer Medienspur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    Remote,
}

/// Lebenszyklus einer Spur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Spur liefert Daten
    Live,
    /// Lokal gestoppt (kein Ended-Event)
    Stopped,
    /// Von der Plattform beendet (z.B. "Freigabe beenden" im OS)
    Ended,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

/// Geteiltes Handle auf eine Medienspur
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Erstellt eine neue Spur mit zufälliger ID
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, source, label)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Kehrt den Enabled-Flag um und gibt den neuen Wert zurück
    pub fn toggle_enabled(&self) -> bool {
        !self.inner.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Stoppt die Spur lokal
    ///
    /// Gibt `true` zurück, wenn die Spur vorher noch lief.
    pub fn stop(&self) -> bool {
        self.finish(TrackState::Stopped)
    }

    /// Beendet die Spur so, als hätte die Plattform sie abgeschaltet
    pub fn end_by_platform(&self) -> bool {
        self.finish(TrackState::Ended)
    }

    fn finish(&self, terminal: TrackState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = terminal;
                true
            } else {
                false
            }
        })
    }

    /// Wartet, bis die Spur nicht mehr live ist, und liefert den Endzustand
    pub async fn finished(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != TrackState::Live {
                return state;
            }
            if rx.changed().await.is_err() {
                return TrackState::Stopped;
            }
        }
    }

    /// Prüft, ob beide Handles auf dieselbe Spur zeigen
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Geteilte Sammlung von Spuren
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.read().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    /// Erste Spur einer Art
    pub fn first_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    /// Stoppt alle Spuren und gibt die Anzahl der vorher laufenden zurück
    pub fn stop_all(&self) -> usize {
        self.tracks.read().iter().filter(|t| t.stop()).count()
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks.read().iter().any(MediaTrack::is_live)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}
