//! Lokaler Medienzustand
//!
//! Kamera/Mikrofon-Stream, optionaler Bildschirm-Stream und welche
//! Videospur gerade an die Peers geht.

use crate::media::{MediaStream, MediaTrack, ScreenShareError, TrackKind};

/// Aktive ausgehende Videoquelle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Auszutauschende ausgehende Videospur
#[derive(Debug, Clone)]
pub(crate) struct TrackSwap {
    pub old: Option<MediaTrack>,
    pub new: Option<MediaTrack>,
}

/// Ergebnis von `toggle_video`
#[derive(Debug)]
pub(crate) struct VideoToggle {
    pub enabled: bool,
    /// Kamera muss wieder an die Peers gehängt werden
    pub reattach: Option<TrackSwap>,
}

#[derive(Debug)]
pub(crate) struct LocalMediaState {
    camera: MediaStream,
    screen: Option<MediaStream>,
    active: VideoSource,
    share_pending: bool,
    /// Nach Ende der Freigabe bei ausgeschalteter Kamera geht keine Videospur raus
    video_detached: bool,
}

impl LocalMediaState {
    pub fn new(camera: MediaStream) -> Self {
        Self {
            camera,
            screen: None,
            active: VideoSource::Camera,
            share_pending: false,
            video_detached: false,
        }
    }

    pub fn camera_stream(&self) -> &MediaStream {
        &self.camera
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.screen.as_ref()
    }

    pub fn active_source(&self) -> VideoSource {
        self.active
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn is_share_pending(&self) -> bool {
        self.share_pending
    }

    pub fn is_video_detached(&self) -> bool {
        self.video_detached
    }

    pub fn camera_video(&self) -> Option<MediaTrack> {
        self.camera.first_track(TrackKind::Video)
    }

    pub fn microphone(&self) -> Option<MediaTrack> {
        self.camera.first_track(TrackKind::Audio)
    }

    pub fn screen_video(&self) -> Option<MediaTrack> {
        self.screen
            .as_ref()
            .and_then(|s| s.first_track(TrackKind::Video))
    }

    /// Videospur, die gerade an die Peers geht
    pub fn outgoing_video(&self) -> Option<MediaTrack> {
        match self.active {
            VideoSource::Screen => self.screen_video(),
            VideoSource::Camera if self.video_detached => None,
            VideoSource::Camera => self.camera_video(),
        }
    }

    /// Stream für neue Verbindungen: Mikrofon plus aktuelle Videoquelle
    ///
    /// Bei abgehängtem Video wird die Kamera trotzdem gebunden, damit sie
    /// später ohne Neuverhandlung zurückkommen kann.
    pub fn outgoing_stream(&self) -> MediaStream {
        let mut tracks = self.camera.audio_tracks();
        let video = match self.active {
            VideoSource::Screen => self.screen_video(),
            VideoSource::Camera => self.camera_video(),
        };
        tracks.extend(video);
        MediaStream::with_id(self.camera.id(), tracks)
    }

    /// Markiert eine Freigabe als angefragt
    pub fn begin_share(&mut self) -> Result<(), ScreenShareError> {
        if self.share_pending || self.screen.is_some() {
            return Err(ScreenShareError::AlreadyActive);
        }
        self.share_pending = true;
        Ok(())
    }

    pub fn abort_share(&mut self) {
        self.share_pending = false;
    }

    /// Macht den Bildschirm zur aktiven Quelle
    pub fn install_screen(&mut self, stream: MediaStream) -> Result<TrackSwap, ScreenShareError> {
        self.share_pending = false;
        let new = stream
            .first_track(TrackKind::Video)
            .ok_or(ScreenShareError::NoVideoTrack)?;

        let old = self.outgoing_video();
        self.screen = Some(stream);
        self.active = VideoSource::Screen;
        self.video_detached = false;

        Ok(TrackSwap {
            old,
            new: Some(new),
        })
    }

    /// Beendet die Freigabe (None, wenn keine aktiv war)
    pub fn end_share(&mut self) -> Option<TrackSwap> {
        let screen = self.screen.take()?;
        let old = screen.first_track(TrackKind::Video);
        screen.stop_all();

        self.active = VideoSource::Camera;
        let new = self.camera_video().filter(MediaTrack::is_enabled);
        self.video_detached = new.is_none();

        Some(TrackSwap { old, new })
    }

    pub fn toggle_video(&mut self) -> VideoToggle {
        let Some(camera) = self.camera_video() else {
            return VideoToggle {
                enabled: false,
                reattach: None,
            };
        };

        let enabled = camera.toggle_enabled();
        let reattach = (enabled && self.video_detached && self.active == VideoSource::Camera)
            .then(|| {
                self.video_detached = false;
                TrackSwap {
                    old: None,
                    new: Some(camera),
                }
            });

        VideoToggle { enabled, reattach }
    }

    /// Mikrofon umschalten (false ohne Mikrofon)
    pub fn toggle_audio(&mut self) -> bool {
        self.microphone()
            .map(|mic| mic.toggle_enabled())
            .unwrap_or(false)
    }

    /// (video_enabled, audio_enabled) für die Peers
    pub fn media_state(&self) -> (bool, bool) {
        let video = self.camera_video().map(|t| t.is_enabled()).unwrap_or(false);
        let audio = self.microphone().map(|t| t.is_enabled()).unwrap_or(false);
        (video, audio)
    }

    /// Stoppt alle lokalen Spuren (Kamera und Bildschirm)
    pub fn stop_all(&mut self) -> usize {
        self.share_pending = false;
        let screen = self.screen.take().map(|s| s.stop_all()).unwrap_or(0);
        screen + self.camera.stop_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    fn camera_stream() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"),
            MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam"),
        ])
    }

    fn screen_stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
            "screen",
        )])
    }

    #[test]
    fn test_share_round_trip() {
        let mut media = LocalMediaState::new(camera_stream());
        let camera = media.camera_video().unwrap();

        media.begin_share().unwrap();
        assert_eq!(media.begin_share(), Err(ScreenShareError::AlreadyActive));

        let swap = media.install_screen(screen_stream()).unwrap();
        assert_eq!(swap.old.as_ref(), Some(&camera));
        assert_eq!(media.active_source(), VideoSource::Screen);
        assert_eq!(media.outgoing_video(), swap.new);
        assert_eq!(media.begin_share(), Err(ScreenShareError::AlreadyActive));

        let screen = swap.new.unwrap();
        let back = media.end_share().unwrap();
        assert_eq!(back.old.as_ref(), Some(&screen));
        assert_eq!(back.new.as_ref(), Some(&camera));
        assert!(!screen.is_live());
        assert!(camera.is_live());
        assert!(media.end_share().is_none());
    }

    #[test]
    fn test_camera_off_detaches_then_reattaches() {
        let mut media = LocalMediaState::new(camera_stream());
        media.begin_share().unwrap();
        media.install_screen(screen_stream()).unwrap();

        // Kamera während der Freigabe ausschalten: Bildschirm bleibt
        let toggle = media.toggle_video();
        assert!(!toggle.enabled);
        assert!(toggle.reattach.is_none());
        assert!(media.outgoing_video().is_some());

        let back = media.end_share().unwrap();
        assert!(back.new.is_none());
        assert!(media.is_video_detached());
        assert!(media.outgoing_video().is_none());
        // Neue Verbindungen bekommen die Kamera trotzdem gebunden
        assert_eq!(media.outgoing_stream().video_tracks().len(), 1);

        let toggle = media.toggle_video();
        assert!(toggle.enabled);
        let reattach = toggle.reattach.unwrap();
        assert!(reattach.old.is_none());
        assert_eq!(reattach.new, media.camera_video());
        assert!(!media.is_video_detached());
    }

    #[test]
    fn test_outgoing_stream_follows_source() {
        let mut media = LocalMediaState::new(camera_stream());
        let before = media.outgoing_stream();
        assert_eq!(before.id(), media.camera_stream().id());
        assert_eq!(
            before.video_tracks()[0].source(),
            TrackSource::Camera
        );

        media.begin_share().unwrap();
        media.install_screen(screen_stream()).unwrap();
        let during = media.outgoing_stream();
        assert_eq!(during.audio_tracks().len(), 1);
        assert_eq!(during.video_tracks()[0].source(), TrackSource::Screen);
    }

    #[test]
    fn test_toggles_without_devices() {
        let mut media = LocalMediaState::new(MediaStream::empty());
        assert!(!media.toggle_video().enabled);
        assert!(!media.toggle_audio());
        assert_eq!(media.media_state(), (false, false));
    }

    #[test]
    fn test_stop_all_includes_screen() {
        let mut media = LocalMediaState::new(camera_stream());
        media.begin_share().unwrap();
        media.install_screen(screen_stream()).unwrap();
        assert_eq!(media.stop_all(), 3);
        assert!(!media.is_sharing());
    }
}
