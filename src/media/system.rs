//! System Media Devices - Mikrofon über cpal
//!
//! Prüft das Standard-Eingabegerät und wählt eine passende Konfiguration.
//! Kamera und Bildschirm haben hier kein Backend; dafür muss die Host-App
//! eine eigene `MediaDevices` Implementierung liefern.

use super::acquisition::{AudioConstraints, CaptureFailure, MediaConstraints, MediaDevices};
use super::track::{MediaStream, MediaTrack, TrackKind, TrackSource};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// SYSTEM DEVICES
// ============================================================================

/// Geräte des Betriebssystems (nur Audio)
#[derive(Debug, Default, Clone)]
pub struct SystemMediaDevices;

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self
    }

    /// Findet das Standard-Mikrofon und eine Konfiguration, die die Constraints erfüllt
    fn probe_microphone(
        constraints: &AudioConstraints,
    ) -> Result<(String, StreamConfig), CaptureFailure> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureFailure::NotFound)?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());

        let configs = device
            .supported_input_configs()
            .map_err(|e| CaptureFailure::NotReadable(e.to_string()))?;

        let config = select_capture_config(configs.collect(), constraints.sample_rate)?;

        tracing::info!(
            "Microphone '{}' ready: {} Hz, {} channel(s)",
            name,
            config.sample_rate.0,
            config.channels
        );

        Ok((name, config))
    }
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureFailure> {
        if constraints.video.is_some() {
            tracing::warn!("No camera backend available on this host");
            return Err(CaptureFailure::NotFound);
        }

        let mut tracks = Vec::new();
        if let Some(audio) = constraints.audio.clone() {
            // cpal ist synchron und kann beim Enumerieren blockieren
            let (name, _config) =
                tokio::task::spawn_blocking(move || Self::probe_microphone(&audio))
                    .await
                    .map_err(|e| CaptureFailure::Other(e.to_string()))??;
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                name,
            ));
        }

        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, CaptureFailure> {
        Err(CaptureFailure::NotSupported)
    }
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

/// Wählt die beste Konfiguration aus einer Liste
///
/// Mit `required_rate` muss die Rate exakt unterstützt werden, sonst
/// `Overconstrained`. Ohne wird wie bisher priorisiert: 48kHz > höchste Rate,
/// F32 > andere Formate.
pub fn select_capture_config(
    configs: Vec<SupportedStreamConfigRange>,
    required_rate: Option<u32>,
) -> Result<StreamConfig, CaptureFailure> {
    let supports = |config: &SupportedStreamConfigRange, rate: cpal::SampleRate| {
        config.min_sample_rate() <= rate && config.max_sample_rate() >= rate
    };

    if let Some(rate) = required_rate {
        let rate = cpal::SampleRate(rate);
        return configs
            .iter()
            .filter(|c| supports(c, rate))
            .max_by_key(|c| c.sample_format() == SampleFormat::F32)
            .map(|c| -> StreamConfig { c.clone().with_sample_rate(rate).into() })
            .ok_or_else(|| {
                CaptureFailure::Overconstrained(format!("sample rate {} Hz", rate.0))
            });
    }

    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    // Versuche exakt 48kHz zu finden
    for config in &configs {
        if supports(config, target_rate) && config.sample_format() == SampleFormat::F32 {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    // Fallback auf beste verfügbare F32 Konfiguration
    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            let rate = if supports(config, target_rate) {
                target_rate
            } else {
                config.max_sample_rate()
            };
            return Ok(config.clone().with_sample_rate(rate).into());
        }
    }

    // Nehme erste verfügbare Konfiguration
    if let Some(config) = configs.first() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(CaptureFailure::NotFound)
}
