//! Call Session Manager
//!
//! Öffentliche Schnittstelle eines Anrufs. Pro Session läuft genau eine
//! Event-Loop, die Transport-Nachrichten, Adapter-Events und interne
//! Befehle nacheinander verarbeitet. Jede Änderung am Zustand passiert
//! unter dem Session-Lock; auf Bildschirmaufnahme und Spurwechsel wird
//! ohne Lock gewartet.

use super::events::{CallError, CallEvent};
use super::local_media::LocalMediaState;
use super::peer::AdapterEvent;
use super::registry::Participant;
use super::router::{RouterAction, RouterContext, SignalingRouter};
use super::topology::{FullMesh, PeerTopology};
use super::track_swap::{ReplacementPlan, ReplacementReport};
use crate::config::{CallConfig, MediaConfig};
use crate::media::{MediaAcquisition, MediaDevices, MediaStream, TrackState};
use crate::negotiation::PeerConnector;
use crate::signaling::{
    Delivery, PeerDataMessage, PresenceMessage, SignalingTransport, SignalingTransportError,
    TransportMessage,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Wie oft abgelaufene Puffer-Signale verworfen werden
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lebenszyklus einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    Joining,
    Active,
    Ending,
    Ended,
    Errored,
}

impl SessionState {
    /// Läuft gerade ein Start oder ein Anruf?
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::AcquiringMedia | SessionState::Joining | SessionState::Active
        )
    }
}

/// Daten des laufenden Anrufs
#[derive(Debug, Clone)]
pub struct CallSession {
    pub room_id: String,
    pub local_participant_id: String,
    pub config: MediaConfig,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub as_initiator: bool,
    /// Zeitstempel der eigenen Ankündigung (ms)
    pub announced_at: Option<i64>,
}

/// Externe Abhängigkeiten einer Session
#[derive(Clone)]
pub struct CallDependencies {
    pub devices: Arc<dyn MediaDevices>,
    pub transport: Arc<dyn SignalingTransport>,
    pub topology: Arc<dyn PeerTopology>,
}

impl CallDependencies {
    /// Full Mesh über den angegebenen Connector
    pub fn full_mesh(
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn PeerConnector>,
        config: &CallConfig,
    ) -> Self {
        Self {
            devices,
            transport,
            topology: Arc::new(
                FullMesh::new(connector).with_max_participants(config.max_participants),
            ),
        }
    }
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Debug)]
enum LoopInput {
    Transport(TransportMessage),
    TransportClosed,
    Adapter(AdapterEvent),
    /// Die Plattform hat die Bildschirmspur beendet
    ScreenEnded(String),
    Sweep,
}

#[derive(Default)]
struct SessionCore {
    session: Option<CallSession>,
    media: Option<LocalMediaState>,
    router: Option<SignalingRouter>,
    presence: Option<PresenceMessage>,
    subscribed: bool,
    loop_tx: Option<mpsc::UnboundedSender<LoopInput>>,
    loop_task: Option<JoinHandle<()>>,
    screen_watch: Option<JoinHandle<()>>,
}

impl SessionCore {
    /// Stoppt Loop, Watcher, Adapter und alle lokalen Spuren
    fn release(&mut self) -> usize {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
        self.loop_tx = None;
        self.presence = None;
        // Verworfene Adapter schließen ihre Primitive
        self.router = None;
        self.media.take().map(|mut media| media.stop_all()).unwrap_or(0)
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.release();
    }
}

struct Shared {
    room_id: String,
    local_id: String,
    config: CallConfig,
    acquisition: MediaAcquisition,
    transport: Arc<dyn SignalingTransport>,
    topology: Arc<dyn PeerTopology>,
    core: Mutex<SessionCore>,
    state_tx: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<CallEvent>,
    /// Wird bei jedem start() und end() erhöht
    generation: AtomicU64,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, core: &mut SessionCore, state: SessionState) {
        if let Some(session) = core.session.as_mut() {
            session.state = state;
        }
        self.state_tx.send_replace(state);
        tracing::debug!("Session {} state: {:?}", self.room_id, state);
    }

    fn emit(&self, event: CallEvent) {
        tracing::debug!("Call event: {}", event.name());
        let _ = self.event_tx.send(event);
    }

    /// Fataler Fehler: alles freigeben, Errored, Event
    fn fail(&self, core: &mut SessionCore, error: CallError) -> CallError {
        tracing::error!("Call in room {} failed: {}", self.room_id, error);
        core.release();
        self.set_state(core, SessionState::Errored);
        self.emit(CallEvent::Error(error.clone()));
        error
    }

    async fn perform(&self, actions: Vec<RouterAction>) {
        for action in actions {
            match action {
                RouterAction::Emit(event) => self.emit(event),
                RouterAction::Send(message) => {
                    if let Err(e) = self.transport.send(&self.room_id, message).await {
                        tracing::warn!("Failed to send signaling message: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_input(&self, input: LoopInput) {
        if let LoopInput::ScreenEnded(track_id) = &input {
            self.stop_screen_share(Some(track_id.as_str())).await;
            return;
        }

        let actions = {
            let mut core = self.core.lock().await;
            if self.state() != SessionState::Active {
                return;
            }
            let SessionCore {
                router: Some(router),
                media: Some(media),
                ..
            } = &mut *core
            else {
                return;
            };

            match input {
                LoopInput::Transport(message) => {
                    router.handle_transport(&message, &media.outgoing_stream())
                }
                LoopInput::TransportClosed => {
                    tracing::error!("Signaling delivery for room {} closed", self.room_id);
                    vec![RouterAction::Emit(CallEvent::Error(
                        SignalingTransportError::ConnectionFailed(
                            "signaling delivery closed".to_string(),
                        )
                        .into(),
                    ))]
                }
                LoopInput::Adapter(event) => router.handle_adapter_event(event),
                LoopInput::Sweep => {
                    router.sweep(Instant::now());
                    Vec::new()
                }
                LoopInput::ScreenEnded(_) => Vec::new(),
            }
        };

        self.perform(actions).await;
    }

    /// Beendet die Freigabe; mit `ended_track` nur, wenn diese Spur noch aktiv ist
    async fn stop_screen_share(&self, ended_track: Option<&str>) -> ReplacementReport {
        let plan = {
            let mut core = self.core.lock().await;
            let SessionCore {
                router: Some(router),
                media: Some(media),
                screen_watch,
                ..
            } = &mut *core
            else {
                return ReplacementReport::default();
            };

            if let Some(track_id) = ended_track {
                let current = media.screen_video().map(|t| t.id() == track_id);
                if current != Some(true) {
                    tracing::debug!("Ignoring end of stale screen track {}", track_id);
                    return ReplacementReport::default();
                }
            }

            let Some(swap) = media.end_share() else {
                tracing::debug!("No screen share to stop");
                return ReplacementReport::default();
            };
            if let Some(watch) = screen_watch.take() {
                watch.abort();
            }

            tracing::info!("Screen share stopped");
            ReplacementPlan::issue(
                router.registry().live_adapters(),
                swap,
                &media.outgoing_stream(),
            )
        };

        let report = plan.settle().await;
        report.log("camera");
        report
    }
}

fn announce_media_state(router: &SignalingRouter, media: &LocalMediaState) {
    let (video_enabled, audio_enabled) = media.media_state();
    let message = PeerDataMessage::MediaState {
        video_enabled,
        audio_enabled,
    };
    let sent = router.broadcast_data(&message.to_bytes());
    tracing::debug!("Media state sent to {} peer(s)", sent);
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Steuert einen Anruf in einem Raum
///
/// Klone teilen sich dieselbe Session.
#[derive(Clone)]
pub struct CallSessionManager {
    shared: Arc<Shared>,
}

impl CallSessionManager {
    pub fn new(
        room_id: impl Into<String>,
        local_participant_id: impl Into<String>,
        config: CallConfig,
        deps: CallDependencies,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            shared: Arc::new(Shared {
                room_id: room_id.into(),
                local_id: local_participant_id.into(),
                acquisition: MediaAcquisition::new(deps.devices, config.platform),
                transport: deps.transport,
                topology: deps.topology,
                core: Mutex::new(SessionCore::default()),
                state_tx,
                event_tx,
                generation: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub fn local_participant_id(&self) -> &str {
        &self.shared.local_id
    }

    /// Startet den Anruf
    ///
    /// Holt lokale Medien, abonniert den Raum und kündigt sich an. Läuft
    /// bereits ein Start oder Anruf, passiert nichts.
    pub async fn start(&self, as_initiator: bool) -> Result<(), CallError> {
        let shared = &self.shared;

        let generation = {
            let mut core = shared.core.lock().await;
            match shared.state() {
                state if state.is_running() => {
                    tracing::debug!("start() ignored, session is {:?}", state);
                    return Ok(());
                }
                SessionState::Ending => return Err(CallError::NotActive),
                _ => {}
            }

            // Reste eines fehlgeschlagenen Versuchs
            core.release();
            core.session = Some(CallSession {
                room_id: shared.room_id.clone(),
                local_participant_id: shared.local_id.clone(),
                config: shared.config.media.clone(),
                state: SessionState::AcquiringMedia,
                started_at: Utc::now(),
                as_initiator,
                announced_at: None,
            });
            shared.set_state(&mut core, SessionState::AcquiringMedia);
            shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        tracing::info!(
            "Starting call in room {} as {} (initiator: {})",
            shared.room_id,
            shared.local_id,
            as_initiator
        );
        let acquired = shared
            .acquisition
            .acquire_user_media(&shared.config.media)
            .await;

        let mut core = shared.core.lock().await;
        if shared.generation.load(Ordering::SeqCst) != generation {
            // end() lief während der Medienanfrage
            if let Ok(stream) = &acquired {
                stream.stop_all();
            }
            tracing::info!("Call ended while acquiring media");
            return Err(CallError::NotActive);
        }
        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => return Err(shared.fail(&mut core, e.into())),
        };

        shared.set_state(&mut core, SessionState::Joining);
        let delivery = match shared.transport.subscribe(&shared.room_id).await {
            Ok(delivery) => delivery,
            Err(e) => {
                stream.stop_all();
                return Err(shared.fail(&mut core, e.into()));
            }
        };
        core.subscribed = true;

        let presence = PresenceMessage {
            user_id: shared.local_id.clone(),
            room_id: shared.room_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            initiator: as_initiator,
            display_name: shared.config.display_name.clone(),
        };
        if let Err(e) = shared
            .transport
            .send(&shared.room_id, TransportMessage::joined(&presence))
            .await
        {
            stream.stop_all();
            shared.transport.unsubscribe(&shared.room_id).await;
            core.subscribed = false;
            return Err(shared.fail(&mut core, e.into()));
        }

        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        core.router = Some(SignalingRouter::new(
            RouterContext {
                room_id: shared.room_id.clone(),
                local_id: shared.local_id.clone(),
                presence: presence.clone(),
            },
            Arc::clone(&shared.topology),
            adapter_tx,
            shared.config.signal_buffer_window(),
        ));
        core.media = Some(LocalMediaState::new(stream));
        core.loop_tx = Some(loop_tx);
        core.loop_task = Some(tokio::spawn(run_loop(
            Arc::downgrade(shared),
            delivery,
            adapter_rx,
            loop_rx,
        )));
        if let Some(session) = core.session.as_mut() {
            session.announced_at = Some(presence.timestamp);
        }
        core.presence = Some(presence);
        shared.set_state(&mut core, SessionState::Active);

        tracing::info!("Joined room {}", shared.room_id);
        Ok(())
    }

    /// Beendet den Anruf (idempotent)
    ///
    /// Nach einem fehlgeschlagenen `start` bleibt die Session `Errored`:
    /// es wird nur noch aufgeräumt, ohne `call-ended` und ohne Wechsel
    /// nach `Ended`. Ein neuer `start` ist trotzdem möglich.
    pub async fn end(&self) {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;

        match shared.state() {
            SessionState::Idle | SessionState::Ending | SessionState::Ended => return,
            SessionState::Errored => {
                // Nur aufräumen, Fehler wurde bereits gemeldet
                shared.generation.fetch_add(1, Ordering::SeqCst);
                core.release();
                if core.subscribed {
                    shared.transport.unsubscribe(&shared.room_id).await;
                    core.subscribed = false;
                }
                return;
            }
            _ => {}
        }

        shared.generation.fetch_add(1, Ordering::SeqCst);
        shared.set_state(&mut core, SessionState::Ending);
        tracing::info!("Ending call in room {}", shared.room_id);

        if let Some(presence) = core.presence.clone() {
            let departure = PresenceMessage {
                timestamp: Utc::now().timestamp_millis(),
                ..presence
            };
            if let Err(e) = shared
                .transport
                .send(&shared.room_id, TransportMessage::left(&departure))
                .await
            {
                tracing::debug!("Departure not announced: {}", e);
            }
        }

        let actions = core
            .router
            .as_mut()
            .map(SignalingRouter::teardown)
            .unwrap_or_default();
        shared.perform(actions).await;

        let stopped = core.release();
        tracing::debug!("Stopped {} local track(s)", stopped);

        if core.subscribed {
            shared.transport.unsubscribe(&shared.room_id).await;
            core.subscribed = false;
        }

        shared.set_state(&mut core, SessionState::Ended);
        shared.emit(CallEvent::CallEnded);
        tracing::info!("Call in room {} ended", shared.room_id);
    }

    /// Kamera an/aus, gibt den neuen Zustand zurück
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let (enabled, plan) = {
            let mut core = self.shared.core.lock().await;
            let SessionCore {
                router: Some(router),
                media: Some(media),
                ..
            } = &mut *core
            else {
                return Err(CallError::NotActive);
            };

            let toggle = media.toggle_video();
            let plan = toggle.reattach.map(|swap| {
                ReplacementPlan::issue(
                    router.registry().live_adapters(),
                    swap,
                    &media.outgoing_stream(),
                )
            });
            announce_media_state(router, media);
            (toggle.enabled, plan)
        };

        if let Some(plan) = plan {
            plan.settle().await.log("camera");
        }
        tracing::info!("Video {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Mikrofon an/aus, gibt den neuen Zustand zurück
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        let mut core = self.shared.core.lock().await;
        let SessionCore {
            router: Some(router),
            media: Some(media),
            ..
        } = &mut *core
        else {
            return Err(CallError::NotActive);
        };

        let enabled = media.toggle_audio();
        announce_media_state(router, media);
        tracing::info!("Audio {}", if enabled { "enabled" } else { "muted" });
        Ok(enabled)
    }

    /// Startet die Bildschirmfreigabe für alle verbundenen Peers
    pub async fn start_screen_share(&self) -> Result<ReplacementReport, CallError> {
        let shared = &self.shared;

        {
            let mut core = shared.core.lock().await;
            if shared.state() != SessionState::Active {
                return Err(CallError::NotActive);
            }
            let media = core.media.as_mut().ok_or(CallError::NotActive)?;
            media.begin_share()?;
        }

        tracing::info!("Starting screen share");
        let captured = shared.acquisition.acquire_screen().await;

        let plan = {
            let mut core = shared.core.lock().await;
            let SessionCore {
                router: Some(router),
                media: Some(media),
                loop_tx: Some(loop_tx),
                screen_watch,
                ..
            } = &mut *core
            else {
                if let Ok(stream) = &captured {
                    stream.stop_all();
                }
                return Err(CallError::NotActive);
            };

            if !media.is_share_pending() {
                // Session wurde zwischendurch beendet oder neu gestartet
                if let Ok(stream) = &captured {
                    stream.stop_all();
                }
                return Err(CallError::NotActive);
            }

            let installed = captured
                .and_then(|stream| media.install_screen(stream.clone()).inspect_err(|_| {
                    stream.stop_all();
                }));
            let swap = match installed {
                Ok(swap) => swap,
                Err(e) => {
                    media.abort_share();
                    let error = CallError::from(e);
                    tracing::warn!("Screen share failed: {}", error);
                    shared.emit(CallEvent::Error(error.clone()));
                    return Err(error);
                }
            };

            if let Some(screen_track) = swap.new.clone() {
                let loop_tx = loop_tx.clone();
                *screen_watch = Some(tokio::spawn(async move {
                    if screen_track.finished().await == TrackState::Ended {
                        tracing::info!("Screen capture ended by the platform");
                        let _ = loop_tx.send(LoopInput::ScreenEnded(screen_track.id().to_string()));
                    }
                }));
            }

            ReplacementPlan::issue(
                router.registry().live_adapters(),
                swap,
                &media.outgoing_stream(),
            )
        };

        let report = plan.settle().await;
        report.log("screen");
        Ok(report)
    }

    /// Beendet die Bildschirmfreigabe (no-op ohne Freigabe)
    pub async fn stop_screen_share(&self) -> ReplacementReport {
        self.shared.stop_screen_share(None).await
    }

    /// Sendet Anwendungsdaten an alle Peers mit offenem Datenkanal
    pub async fn broadcast_data(&self, payload: Vec<u8>) -> Result<usize, CallError> {
        let core = self.shared.core.lock().await;
        let router = core.router.as_ref().ok_or(CallError::NotActive)?;
        Ok(router.broadcast_data(&payload))
    }

    /// Eigener Kamera/Mikrofon-Stream
    pub async fn local_stream(&self) -> Option<MediaStream> {
        let core = self.shared.core.lock().await;
        core.media.as_ref().map(|m| m.camera_stream().clone())
    }

    pub async fn screen_stream(&self) -> Option<MediaStream> {
        let core = self.shared.core.lock().await;
        core.media.as_ref().and_then(|m| m.screen_stream().cloned())
    }

    pub async fn participant_stream(&self, participant_id: &str) -> Option<MediaStream> {
        let core = self.shared.core.lock().await;
        core.router
            .as_ref()
            .and_then(|router| router.participant_stream(participant_id))
    }

    pub async fn participants(&self) -> Vec<Participant> {
        let core = self.shared.core.lock().await;
        core.router
            .as_ref()
            .map(SignalingRouter::participants)
            .unwrap_or_default()
    }

    pub async fn session(&self) -> Option<CallSession> {
        let core = self.shared.core.lock().await;
        core.session.clone()
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("room_id", &self.shared.room_id)
            .field("local_id", &self.shared.local_id)
            .field("state", &self.state())
            .field("topology", &self.shared.topology.name())
            .finish()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

async fn run_loop(
    weak: Weak<Shared>,
    mut delivery: Delivery,
    mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    mut commands: mpsc::UnboundedReceiver<LoopInput>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut transport_open = true;

    loop {
        let input = tokio::select! {
            message = delivery.recv(), if transport_open => match message {
                Some(message) => LoopInput::Transport(message),
                None => {
                    transport_open = false;
                    LoopInput::TransportClosed
                }
            },
            Some(event) = adapter_events.recv() => LoopInput::Adapter(event),
            Some(command) = commands.recv() => command,
            _ = sweep.tick() => LoopInput::Sweep,
        };

        let Some(shared) = weak.upgrade() else {
            break;
        };
        shared.handle_input(input).await;
    }

    tracing::debug!("Session loop stopped");
}
