//! Test-Doubles für Geräte, Verhandlung und Transport

use crate::call_engine::CallEvent;
use crate::media::{
    CaptureFailure, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind,
    TrackSource,
};
use crate::negotiation::{
    NegotiationError, NegotiationPeer, NegotiationRole, PeerConnector, PeerOptions,
    PrimitiveEvent, PrimitiveEvents,
};
use crate::signaling::{
    Delivery, SignalingTransport, SignalingTransportError, TransportMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    user_failures: Mutex<VecDeque<CaptureFailure>>,
    display_failures: Mutex<VecDeque<CaptureFailure>>,
    requests: Mutex<Vec<MediaConstraints>>,
    user_streams: Mutex<Vec<MediaStream>>,
    screens: Mutex<Vec<MediaStream>>,
    display_calls: AtomicUsize,
    user_delay: Mutex<Option<Duration>>,
    display_delay: Mutex<Option<Duration>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_user_media(&self, failure: CaptureFailure) {
        self.user_failures.lock().push_back(failure);
    }

    pub fn fail_next_display_media(&self, failure: CaptureFailure) {
        self.display_failures.lock().push_back(failure);
    }

    pub fn set_user_media_delay(&self, delay: Duration) {
        *self.user_delay.lock() = Some(delay);
    }

    pub fn set_display_delay(&self, delay: Duration) {
        *self.display_delay.lock() = Some(delay);
    }

    pub fn user_media_requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    /// Alle erfolgreich ausgegebenen Kamera/Mikrofon-Streams
    pub fn user_streams(&self) -> Vec<MediaStream> {
        self.user_streams.lock().clone()
    }

    pub fn screens(&self) -> Vec<MediaStream> {
        self.screens.lock().clone()
    }

    pub fn display_calls(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureFailure> {
        self.requests.lock().push(constraints.clone());
        let delay = *self.user_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.user_failures.lock().pop_front() {
            return Err(failure);
        }

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                TrackSource::Microphone,
                "fake microphone",
            ));
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                TrackSource::Camera,
                "fake camera",
            ));
        }
        let stream = MediaStream::new(tracks);
        self.user_streams.lock().push(stream.clone());
        Ok(stream)
    }

    async fn display_media(&self) -> Result<MediaStream, CaptureFailure> {
        self.display_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.display_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.display_failures.lock().pop_front() {
            return Err(failure);
        }

        let stream = MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
            "fake screen",
        )]);
        self.screens.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

#[derive(Default)]
struct PeerRecord {
    connects: usize,
    signals: Vec<Value>,
    outgoing_video: Option<MediaTrack>,
    sent: Vec<Vec<u8>>,
    remote: Option<MediaStream>,
    events: Option<PrimitiveEvents>,
    closed: bool,
}

type Records = Arc<Mutex<HashMap<String, PeerRecord>>>;

/// Verhandelt ohne Netzwerk: Offer -> Answer -> Stream -> Connect
#[derive(Default)]
pub struct FakeConnector {
    records: Records,
    fail_replace: Arc<Mutex<HashSet<String>>>,
    fail_connect: Mutex<HashSet<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self, participant_id: &str) -> usize {
        self.records
            .lock()
            .get(participant_id)
            .map(|r| r.connects)
            .unwrap_or(0)
    }

    pub fn received_signals(&self, participant_id: &str) -> Vec<Value> {
        self.records
            .lock()
            .get(participant_id)
            .map(|r| r.signals.clone())
            .unwrap_or_default()
    }

    /// Zuletzt an diesen Peer gebundene Videospur
    pub fn outgoing_video(&self, participant_id: &str) -> Option<MediaTrack> {
        self.records
            .lock()
            .get(participant_id)
            .and_then(|r| r.outgoing_video.clone())
    }

    pub fn sent_data(&self, participant_id: &str) -> Vec<Vec<u8>> {
        self.records
            .lock()
            .get(participant_id)
            .map(|r| r.sent.clone())
            .unwrap_or_default()
    }

    /// Remote-Stream der letzten Verbindung zu diesem Peer
    pub fn remote_stream(&self, participant_id: &str) -> Option<MediaStream> {
        self.records
            .lock()
            .get(participant_id)
            .and_then(|r| r.remote.clone())
    }

    pub fn is_closed(&self, participant_id: &str) -> bool {
        self.records
            .lock()
            .get(participant_id)
            .map(|r| r.closed)
            .unwrap_or(false)
    }

    pub fn fail_replace_for(&self, participant_id: &str) {
        self.fail_replace.lock().insert(participant_id.to_string());
    }

    pub fn fail_connect_for(&self, participant_id: &str) {
        self.fail_connect.lock().insert(participant_id.to_string());
    }

    /// Meldet ein Primitiv-Event, als käme es vom Peer
    pub fn inject(&self, participant_id: &str, event: PrimitiveEvent) -> bool {
        let events = self
            .records
            .lock()
            .get(participant_id)
            .and_then(|r| r.events.clone());
        events.map(|tx| tx.send(event).is_ok()).unwrap_or(false)
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        options: PeerOptions,
        events: PrimitiveEvents,
    ) -> Result<Box<dyn NegotiationPeer>, NegotiationError> {
        let participant_id = options.participant_id.clone();
        let remote = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Remote, "remote audio"),
            MediaTrack::new(TrackKind::Video, TrackSource::Remote, "remote video"),
        ]);

        {
            let mut records = self.records.lock();
            let record = records.entry(participant_id.clone()).or_default();
            record.connects += 1;
            record.closed = false;
            record.outgoing_video = options.local_stream.first_track(TrackKind::Video);
            record.remote = Some(remote.clone());
            record.events = Some(events.clone());
        }

        if self.fail_connect.lock().contains(&participant_id) {
            return Err(NegotiationError::WebRtc("connect refused".to_string()));
        }

        if options.role == NegotiationRole::Initiator {
            let _ = events.send(PrimitiveEvent::Signal(json!({"type": "offer", "sdp": "fake"})));
        }

        Ok(Box::new(FakePeer {
            participant_id,
            records: Arc::clone(&self.records),
            fail_replace: Arc::clone(&self.fail_replace),
            events,
            remote,
        }))
    }
}

struct FakePeer {
    participant_id: String,
    records: Records,
    fail_replace: Arc<Mutex<HashSet<String>>>,
    events: PrimitiveEvents,
    remote: MediaStream,
}

impl FakePeer {
    fn record<R>(&self, f: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let mut records = self.records.lock();
        f(records.entry(self.participant_id.clone()).or_default())
    }

    fn connected(&self) {
        let _ = self.events.send(PrimitiveEvent::Stream(self.remote.clone()));
        let _ = self.events.send(PrimitiveEvent::Connect);
    }
}

#[async_trait]
impl NegotiationPeer for FakePeer {
    async fn signal(&mut self, payload: Value) -> Result<(), NegotiationError> {
        self.record(|r| r.signals.push(payload.clone()));
        match payload.get("type").and_then(Value::as_str) {
            Some("offer") => {
                let _ = self
                    .events
                    .send(PrimitiveEvent::Signal(json!({"type": "answer", "sdp": "fake"})));
                self.connected();
                Ok(())
            }
            Some("answer") => {
                self.connected();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(NegotiationError::InvalidSignal("missing type".to_string())),
        }
    }

    async fn replace_track(
        &mut self,
        _old: Option<MediaTrack>,
        new: Option<MediaTrack>,
        _stream: MediaStream,
    ) -> Result<(), NegotiationError> {
        if self.fail_replace.lock().contains(&self.participant_id) {
            return Err(NegotiationError::WebRtc("replace rejected".to_string()));
        }
        self.record(|r| r.outgoing_video = new);
        Ok(())
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), NegotiationError> {
        self.record(|r| r.sent.push(data));
        Ok(())
    }

    async fn close(&mut self) {
        self.record(|r| r.closed = true);
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Transport, dessen Zustellung der Test selbst steuert
#[derive(Default)]
pub struct ScriptedTransport {
    delivery: Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>,
    sent: Mutex<Vec<TransportMessage>>,
    subscribe_failure: Mutex<Option<SignalingTransportError>>,
    fail_sends: AtomicBool,
    subscriptions: AtomicUsize,
    unsubscribed: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stellt eine Nachricht zu, als käme sie aus dem Raum
    pub fn deliver(&self, message: TransportMessage) -> bool {
        self.delivery
            .lock()
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Schließt die Zustellung (Verbindung weg)
    pub fn close_delivery(&self) {
        self.delivery.lock().take();
    }

    pub fn fail_next_subscribe(&self, error: SignalingTransportError) {
        *self.subscribe_failure.lock() = Some(error);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<TransportMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.event.clone()).collect()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn was_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for ScriptedTransport {
    async fn subscribe(&self, _room_id: &str) -> Result<Delivery, SignalingTransportError> {
        if let Some(error) = self.subscribe_failure.lock().take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.delivery.lock() = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(
        &self,
        _room_id: &str,
        message: TransportMessage,
    ) -> Result<(), SignalingTransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingTransportError::SendFailed("scripted failure".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn unsubscribe(&self, _room_id: &str) {
        self.unsubscribed.store(true, Ordering::SeqCst);
        self.delivery.lock().take();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Pollt `check`, bis es true liefert (max. 2s)
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wartet auf das nächste Event mit diesem Namen (max. 2s)
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CallEvent>,
    name: &str,
) -> Option<CallEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.name() == name => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .ok()
        .flatten()
}

/// Alle bereits vorliegenden Events
pub fn drain_events(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    drained
}
