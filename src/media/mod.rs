//! Media Module - lokale Aufnahme und Spuren
//!
//! Dieses Modul verwaltet:
//! - Media Tracks und Streams (lokal und remote)
//! - Kamera/Mikrofon/Bildschirm Anfrage mit Constraint-Fallback
//! - Fehlerklassifizierung inkl. Plattform-Eigenheiten

mod acquisition;
mod quirks;
mod system;
mod track;

pub use acquisition::{
    AudioConstraints, CaptureFailure, MediaAccessError, MediaAcquisition, MediaConstraints,
    MediaDevices, ScreenShareError, VideoConstraints,
};
pub use quirks::PlatformQuirks;
pub use system::{select_capture_config, SystemMediaDevices, CHANNELS, SAMPLE_RATE};
pub use track::{MediaStream, MediaTrack, TrackKind, TrackSource, TrackState};
