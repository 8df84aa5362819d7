//! Konfiguration
//!
//! Alle Einstellungen für eine Call-Session. Defaults sind so gewählt,
//! dass ein Anruf ohne weitere Angaben funktioniert; `from_env` erlaubt
//! das Überschreiben über Umgebungsvariablen.

use crate::media::{AudioConstraints, PlatformQuirks, VideoConstraints};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Standard Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

// ============================================================================
// MEDIA
// ============================================================================

/// Welche lokalen Medien ein Anruf verwendet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConfig {
    pub video: bool,
    pub audio: bool,
    pub video_constraints: VideoConstraints,
    pub audio_constraints: AudioConstraints,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            video_constraints: VideoConstraints::hd(),
            audio_constraints: AudioConstraints::default(),
        }
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Exponentielles Backoff für die Signaling-Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 = nie aufgeben
    pub max_attempts: u32,
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            max_attempts: 8,
            jitter_ms: 250,
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert), ohne Jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Wartezeit inkl. zufälligem Jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Gesamtkonfiguration einer Call-Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub media: MediaConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub signaling_url: String,
    pub reconnect: ReconnectPolicy,
    pub platform: PlatformQuirks,
    /// Wie lange Signale für noch unbekannte Teilnehmer gepuffert werden
    pub signal_buffer_window_ms: u64,
    /// Obergrenze für Teilnehmer im Full Mesh (0 = unbegrenzt)
    pub max_participants: usize,
    pub event_capacity: usize,
    /// Anzeigename in der eigenen Ankündigung
    pub display_name: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            media: MediaConfig::default(),
            ice_servers: default_ice_servers(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            platform: PlatformQuirks::default(),
            signal_buffer_window_ms: 75,
            max_participants: 8,
            event_capacity: 100,
            display_name: None,
        }
    }
}

impl CallConfig {
    /// Defaults, überschrieben durch Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`
    /// - `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL`
    /// - `CALL_PLATFORM` (`standard`, `strict-permissions`, `embedded-web-view`)
    /// - `CALL_DISPLAY_NAME`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }

        if let Ok(url) = std::env::var("TURN_URL") {
            config = config.with_turn_server(
                url,
                std::env::var("TURN_USERNAME").unwrap_or_default(),
                std::env::var("TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        if let Ok(platform) = std::env::var("CALL_PLATFORM") {
            match platform.parse() {
                Ok(platform) => config.platform = platform,
                Err(e) => tracing::warn!("Ignoring CALL_PLATFORM: {}", e),
            }
        }

        if let Ok(name) = std::env::var("CALL_DISPLAY_NAME") {
            config.display_name = Some(name).filter(|n| !n.trim().is_empty());
        }

        config
    }

    /// Fügt einen TURN-Server hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
        self
    }

    pub fn signal_buffer_window(&self) -> Duration {
        Duration::from_millis(self.signal_buffer_window_ms)
    }
}
