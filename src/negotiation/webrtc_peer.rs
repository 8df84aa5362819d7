//! WebRTC Primitiv
//!
//! Eine `RTCPeerConnection` pro Remote-Peer. Lokale Spuren werden als
//! `TrackLocalStaticSample` gebunden; der Host füttert kodierte Samples
//! über die `LocalTrackBank`.

use super::{
    NegotiationError, NegotiationPeer, NegotiationRole, PeerConnector, PeerOptions,
    PrimitiveEvent, PrimitiveEvents,
};
use crate::config::IceServerConfig;
use crate::media::{MediaStream, MediaTrack, TrackKind, TrackSource, CHANNELS, SAMPLE_RATE};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const VIDEO_CLOCK_RATE: u32 = 90_000;
const DATA_CHANNEL_LABEL: &str = "data";

fn webrtc_err(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::WebRtc(e.to_string())
}

// ============================================================================
// LOCAL TRACK BANK
// ============================================================================

/// Zuordnung lokaler `MediaTrack`s zu ihren WebRTC Sample-Tracks
///
/// Ein Sample-Track wird von allen Peer Connections geteilt, so dass jedes
/// geschriebene Sample an alle verbundenen Peers geht.
#[derive(Clone, Default)]
pub struct LocalTrackBank {
    tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

impl LocalTrackBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample-Track für eine lokale Spur (wird bei Bedarf angelegt)
    pub fn local_for(&self, track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        Arc::clone(tracks.entry(track.id().to_string()).or_insert_with(|| {
            Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream_id.to_string(),
            ))
        }))
    }

    /// Sample-Track einer bereits gebundenen Spur
    pub fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(track_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            ..Default::default()
        },
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Baut `RTCPeerConnection`s mit den konfigurierten ICE Servern
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    bank: LocalTrackBank,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            bank: LocalTrackBank::new(),
        }
    }

    pub fn track_bank(&self) -> LocalTrackBank {
        self.bank.clone()
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(Arc::new(
            api.new_peer_connection(config).await.map_err(webrtc_err)?,
        ))
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        options: PeerOptions,
        events: PrimitiveEvents,
    ) -> Result<Box<dyn NegotiationPeer>, NegotiationError> {
        let pc = self.create_peer_connection().await?;

        // Lokale Spuren binden
        let mut audio_sender = None;
        let mut video_sender = None;
        for track in options.local_stream.tracks() {
            let local = self.bank.local_for(&track, options.local_stream.id());
            let sender = pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
            let slot = match track.kind() {
                TrackKind::Audio => &mut audio_sender,
                TrackKind::Video => &mut video_sender,
            };
            slot.get_or_insert(sender);
        }

        let peer = WebRtcPeer {
            participant_id: options.participant_id,
            pc,
            bank: self.bank.clone(),
            audio_sender,
            video_sender,
            data_channel: Arc::new(Mutex::new(None)),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            events,
        };
        peer.install_handlers();

        if options.role.is_initiator() {
            peer.start_offer().await?;
        }

        Ok(Box::new(peer))
    }
}

impl std::fmt::Debug for WebRtcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConnector")
            .field("ice_servers", &self.ice_servers.len())
            .field("bound_tracks", &self.bank.len())
            .finish()
    }
}

// ============================================================================
// PEER
// ============================================================================

type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

struct WebRtcPeer {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    bank: LocalTrackBank,
    audio_sender: Option<Arc<RTCRtpSender>>,
    video_sender: Option<Arc<RTCRtpSender>>,
    data_channel: DataChannelSlot,
    /// Remote Candidates, die vor der Remote Description ankamen
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
    events: PrimitiveEvents,
}

impl WebRtcPeer {
    /// Registriert Event Handler für die Peer Connection
    fn install_handlers(&self) {
        let participant_id = self.participant_id.clone();

        // Connection State Handler
        let events = self.events.clone();
        let id = participant_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state for {}: {:?}", id, s);

                let event = match s {
                    RTCPeerConnectionState::Connected => Some(PrimitiveEvent::Connect),
                    RTCPeerConnectionState::Failed => {
                        Some(PrimitiveEvent::Error("ICE connection failed".to_string()))
                    }
                    RTCPeerConnectionState::Closed => Some(PrimitiveEvent::Close),
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = events.send(event);
                }

                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(payload) = candidate.and_then(|c| candidate_payload(&c)) {
                    let _ = events.send(PrimitiveEvent::Signal(payload));
                }
                Box::pin(async {})
            }));

        // Track Handler (eingehende Medien)
        let events = self.events.clone();
        let remote = MediaStream::empty();
        let announced = Arc::new(AtomicBool::new(false));
        let id = participant_id.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let media = MediaTrack::with_id(
                track.id(),
                kind,
                TrackSource::Remote,
                format!("{}-{:?}", id, kind).to_lowercase(),
            );
            tracing::info!("Received {:?} track from {}", kind, id);
            remote.add_track(media.clone());

            // Erster Track macht den Stream bekannt, weitere landen im selben Stream
            if !announced.swap(true, Ordering::SeqCst) {
                let _ = events.send(PrimitiveEvent::Stream(remote.clone()));
            }

            Box::pin(async move {
                // RTP lesen bis die Spur endet; Dekodierung liegt beim Host
                while track.read_rtp().await.is_ok() {}
                media.stop();
            })
        }));

        // Datenkanal vom Remote-Peer (Receiver-Seite)
        let events = self.events.clone();
        let slot = Arc::clone(&self.data_channel);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                wire_data_channel(&dc, &events);
                *slot.lock() = Some(dc);
                Box::pin(async {})
            }));
    }

    /// Initiator: Datenkanal anlegen und Offer senden
    async fn start_offer(&self) -> Result<(), NegotiationError> {
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(webrtc_err)?;
        wire_data_channel(&dc, &self.events);
        *self.data_channel.lock() = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;

        tracing::debug!("Sending offer to {}", self.participant_id);
        let _ = self.events.send(PrimitiveEvent::Signal(json!({
            "type": "offer",
            "sdp": offer.sdp,
        })));
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        description: RTCSessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)?;
        self.remote_description_set = true;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Dropping queued candidate for {}: {}", self.participant_id, e);
            }
        }
        Ok(())
    }

    fn sender_for(&self, kind: TrackKind) -> Option<&Arc<RTCRtpSender>> {
        match kind {
            TrackKind::Audio => self.audio_sender.as_ref(),
            TrackKind::Video => self.video_sender.as_ref(),
        }
    }
}

#[async_trait]
impl NegotiationPeer for WebRtcPeer {
    async fn signal(&mut self, payload: Value) -> Result<(), NegotiationError> {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NegotiationError::InvalidSignal("missing type".to_string()))?;

        match kind {
            "offer" => {
                let offer = RTCSessionDescription::offer(sdp_of(&payload)?)
                    .map_err(|e| NegotiationError::InvalidSignal(e.to_string()))?;
                self.apply_remote_description(offer).await?;

                let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(webrtc_err)?;

                tracing::debug!("Sending answer to {}", self.participant_id);
                let _ = self.events.send(PrimitiveEvent::Signal(json!({
                    "type": "answer",
                    "sdp": answer.sdp,
                })));
                Ok(())
            }
            "answer" => {
                let answer = RTCSessionDescription::answer(sdp_of(&payload)?)
                    .map_err(|e| NegotiationError::InvalidSignal(e.to_string()))?;
                self.apply_remote_description(answer).await
            }
            "candidate" => {
                let candidate: RTCIceCandidateInit = payload
                    .get("candidate")
                    .cloned()
                    .ok_or_else(|| NegotiationError::InvalidSignal("missing candidate".into()))
                    .and_then(|c| {
                        serde_json::from_value(c)
                            .map_err(|e| NegotiationError::InvalidSignal(e.to_string()))
                    })?;

                if self.remote_description_set {
                    self.pc
                        .add_ice_candidate(candidate)
                        .await
                        .map_err(webrtc_err)
                } else {
                    self.pending_candidates.push(candidate);
                    Ok(())
                }
            }
            other => Err(NegotiationError::InvalidSignal(format!(
                "unknown signal type: {}",
                other
            ))),
        }
    }

    async fn replace_track(
        &mut self,
        old: Option<MediaTrack>,
        new: Option<MediaTrack>,
        stream: MediaStream,
    ) -> Result<(), NegotiationError> {
        let kind = new
            .as_ref()
            .or(old.as_ref())
            .map(MediaTrack::kind)
            .unwrap_or(TrackKind::Video);

        let sender = self.sender_for(kind).ok_or_else(|| {
            NegotiationError::TrackNotFound(
                old.as_ref()
                    .map(|t| t.id().to_string())
                    .unwrap_or_else(|| format!("{:?}", kind)),
            )
        })?;

        let replacement = new.map(|track| {
            self.bank.local_for(&track, stream.id()) as Arc<dyn TrackLocal + Send + Sync>
        });

        sender.replace_track(replacement).await.map_err(webrtc_err)
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), NegotiationError> {
        let dc = self
            .data_channel
            .lock()
            .clone()
            .ok_or(NegotiationError::ChannelNotOpen)?;

        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(NegotiationError::ChannelNotOpen);
        }

        dc.send(&Bytes::from(data)).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection to {}: {}", self.participant_id, e);
        }
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: &PrimitiveEvents) {
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        tracing::debug!("Data channel '{}' open", label);
        Box::pin(async {})
    }));

    let events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = events.send(PrimitiveEvent::Data(msg.data.to_vec()));
        Box::pin(async {})
    }));
}

fn sdp_of(payload: &Value) -> Result<String, NegotiationError> {
    payload
        .get("sdp")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| NegotiationError::InvalidSignal("missing sdp".to_string()))
}

fn candidate_payload(candidate: &RTCIceCandidate) -> Option<Value> {
    let init = candidate.to_json().ok()?;
    let init = serde_json::to_value(init).ok()?;
    Some(json!({ "type": "candidate", "candidate": init }))
}
