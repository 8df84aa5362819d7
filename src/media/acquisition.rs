//! Media Acquisition
//!
//! Fordert Kamera, Mikrofon und Bildschirm über die `MediaDevices`
//! Schnittstelle an, fällt bei Fehlschlag auf minimale Constraints zurück
//! und ordnet Plattformfehler einer festen Fehler-Taxonomie zu.

use super::quirks::PlatformQuirks;
use super::track::{MediaStream, TrackKind};
use crate::config::MediaConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Wunschwerte für die Kamera (None = beliebig)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl VideoConstraints {
    /// 720p @ 30fps
    pub fn hd() -> Self {
        Self {
            width: Some(1280),
            height: Some(720),
            frame_rate: Some(30),
        }
    }
}

/// Wunschwerte für das Mikrofon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: Option<u32>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: Some(48000),
        }
    }
}

impl AudioConstraints {
    /// Keine Verarbeitungswünsche, beliebige Sample-Rate
    pub fn any() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            sample_rate: None,
        }
    }
}

/// Anfrage an `MediaDevices::user_media`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    /// Volle Wunsch-Constraints aus der Konfiguration
    pub fn preferred(config: &MediaConfig) -> Self {
        Self {
            video: config.video.then(|| config.video_constraints.clone()),
            audio: config.audio.then(|| config.audio_constraints.clone()),
        }
    }

    /// Minimaler Satz: nur welche Spuren, ohne weitere Wünsche
    pub fn minimal(config: &MediaConfig) -> Self {
        Self {
            video: config.video.then(VideoConstraints::default),
            audio: config.audio.then(AudioConstraints::any),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

/// Rohe Fehler, wie sie die Plattform meldet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureFailure {
    #[error("permission denied")]
    NotAllowed,

    #[error("no matching device")]
    NotFound,

    #[error("device not readable: {0}")]
    NotReadable(String),

    #[error("constraints cannot be satisfied: {0}")]
    Overconstrained(String),

    #[error("capture not supported")]
    NotSupported,

    #[error("capture aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

/// Zugriff auf lokale Aufnahmegeräte (wird von der Host-Plattform geliefert)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Kamera und/oder Mikrofon öffnen
    async fn user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, CaptureFailure>;

    /// Bildschirminhalt aufnehmen
    async fn display_media(&self) -> Result<MediaStream, CaptureFailure>;
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission to use the camera or microphone was denied")]
    PermissionDenied { platform: PlatformQuirks },

    #[error("No camera or microphone was found")]
    DeviceNotFound,

    #[error("Camera or microphone is already in use: {0}")]
    DeviceBusy(String),

    #[error("Media constraints cannot be satisfied: {0}")]
    ConstraintUnsatisfied(String),

    #[error("Media capture failed: {0}")]
    Unavailable(String),
}

impl MediaAccessError {
    /// Text für die Oberfläche, passend zur Fehlerart
    pub fn remediation(&self) -> &'static str {
        match self {
            MediaAccessError::PermissionDenied { platform } => platform.permission_guidance(),
            MediaAccessError::DeviceNotFound => {
                "No camera or microphone was detected. Connect a device and try again."
            }
            MediaAccessError::DeviceBusy(_) => {
                "Your camera or microphone is being used by another application. Close it \
                 and try again."
            }
            MediaAccessError::ConstraintUnsatisfied(_) => {
                "Your camera does not support the requested quality. Try again with lower \
                 video settings."
            }
            MediaAccessError::Unavailable(_) => {
                "Could not start your camera or microphone. Please try again."
            }
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, MediaAccessError::PermissionDenied { .. })
    }

    /// Braucht die Oberfläche plattformspezifische Hinweise?
    pub fn needs_platform_guidance(&self) -> bool {
        matches!(
            self,
            MediaAccessError::PermissionDenied { platform } if platform.has_custom_permission_flow()
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenShareError {
    #[error("Screen sharing permission was denied")]
    PermissionDenied { platform: PlatformQuirks },

    #[error("Screen sharing is not supported on this platform")]
    Unsupported,

    #[error("Screen sharing is already active")]
    AlreadyActive,

    #[error("Screen capture returned no video track")]
    NoVideoTrack,

    #[error("Screen capture failed: {0}")]
    Capture(String),
}

// ============================================================================
// MEDIA ACQUISITION
// ============================================================================

/// Fordert lokale Medien an und klassifiziert Fehler
#[derive(Clone)]
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    quirks: PlatformQuirks,
}

impl MediaAcquisition {
    pub fn new(devices: Arc<dyn MediaDevices>, quirks: PlatformQuirks) -> Self {
        Self { devices, quirks }
    }

    pub fn quirks(&self) -> PlatformQuirks {
        self.quirks
    }

    /// Öffnet Kamera/Mikrofon gemäß Konfiguration
    ///
    /// Scheitert die Anfrage mit den Wunsch-Constraints, wird einmal mit dem
    /// minimalen Satz nachgefragt. Eine verweigerte Berechtigung wird nicht
    /// wiederholt.
    pub async fn acquire_user_media(
        &self,
        config: &MediaConfig,
    ) -> Result<MediaStream, MediaAccessError> {
        let preferred = MediaConstraints::preferred(config);
        if preferred.is_empty() {
            tracing::debug!("No local media requested, joining receive-only");
            return Ok(MediaStream::empty());
        }

        let failure = match self.devices.user_media(&preferred).await {
            Ok(stream) => return Ok(stream),
            Err(CaptureFailure::NotAllowed) => CaptureFailure::NotAllowed,
            Err(e) => {
                tracing::warn!(
                    "Media capture with preferred constraints failed ({}), retrying with minimal constraints",
                    e
                );
                match self.devices.user_media(&MediaConstraints::minimal(config)).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => e,
                }
            }
        };

        let error = self.classify(failure);
        tracing::error!("Media access failed: {}", error);
        Err(error)
    }

    /// Startet eine Bildschirmaufnahme
    pub async fn acquire_screen(&self) -> Result<MediaStream, ScreenShareError> {
        let stream = self
            .devices
            .display_media()
            .await
            .map_err(|e| self.classify_screen(e))?;

        if stream.first_track(TrackKind::Video).is_none() {
            stream.stop_all();
            return Err(ScreenShareError::NoVideoTrack);
        }

        Ok(stream)
    }

    /// Ordnet einen Plattformfehler der Taxonomie zu
    pub fn classify(&self, failure: CaptureFailure) -> MediaAccessError {
        match failure {
            CaptureFailure::NotAllowed => MediaAccessError::PermissionDenied {
                platform: self.quirks,
            },
            CaptureFailure::NotFound => MediaAccessError::DeviceNotFound,
            CaptureFailure::NotReadable(reason) => MediaAccessError::DeviceBusy(reason),
            CaptureFailure::Overconstrained(reason) => {
                MediaAccessError::ConstraintUnsatisfied(reason)
            }
            CaptureFailure::NotSupported => {
                MediaAccessError::Unavailable("media capture is not supported".to_string())
            }
            CaptureFailure::Aborted => {
                MediaAccessError::Unavailable("media capture was aborted".to_string())
            }
            CaptureFailure::Other(reason) => MediaAccessError::Unavailable(reason),
        }
    }

    fn classify_screen(&self, failure: CaptureFailure) -> ScreenShareError {
        match failure {
            CaptureFailure::NotAllowed | CaptureFailure::Aborted => {
                ScreenShareError::PermissionDenied {
                    platform: self.quirks,
                }
            }
            CaptureFailure::NotSupported => ScreenShareError::Unsupported,
            other => ScreenShareError::Capture(other.to_string()),
        }
    }
}

impl std::fmt::Debug for MediaAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAcquisition")
            .field("quirks", &self.quirks)
            .finish()
    }
}
