//! Peer Adapter
//!
//! Kapselt genau ein Verhandlungsprimitiv pro Remote-Teilnehmer.
//! Ein eigener Task baut das Primitiv und arbeitet Befehle strikt in
//! Reihenfolge ab; Primitiv-Events gehen mit der Adapter-ID markiert an
//! die Event-Loop der Session und werden dort per `apply` ausgewertet.

use crate::media::{MediaStream, MediaTrack};
use crate::negotiation::{
    NegotiationError, NegotiationPeer, NegotiationRole, PeerConnector, PeerOptions,
    PrimitiveEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Laufende Nummer eines Adapters innerhalb einer Session
pub type AdapterId = u64;

// ============================================================================
// STATE
// ============================================================================

/// Verbindungsstatus eines Teilnehmers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Adapter existiert, noch kein Signal ausgetauscht
    Created,
    /// Signale werden ausgetauscht
    Negotiating,
    /// Remote-Stream ist da
    Connected,
    /// Endgültig geschlossen
    Closed,
}

/// Befehle an den Adapter-Task
#[derive(Debug)]
pub(crate) enum AdapterCommand {
    Signal(Value),
    ReplaceTrack {
        old: Option<MediaTrack>,
        new: Option<MediaTrack>,
        stream: MediaStream,
        reply: oneshot::Sender<Result<(), NegotiationError>>,
    },
    Send(Vec<u8>),
    Close,
}

/// Primitiv-Event mit Herkunft
#[derive(Debug)]
pub struct AdapterEvent {
    pub adapter_id: AdapterId,
    pub participant_id: String,
    pub event: PrimitiveEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Remote,
    Error(String),
}

/// Ergebnis von `PeerAdapter::apply`
#[derive(Debug)]
pub(crate) enum AdapterOutput {
    None,
    /// Signal-Payload für den Remote-Peer
    Outbound(Value),
    /// Erster Remote-Stream
    StreamReady(MediaStream),
    Data(Vec<u8>),
    Closed(CloseReason),
}

// ============================================================================
// PEER ADAPTER
// ============================================================================

pub struct PeerAdapter {
    id: AdapterId,
    participant_id: String,
    role: NegotiationRole,
    state: ConnectionState,
    channel_open: bool,
    remote_stream: Option<MediaStream>,
    commands: mpsc::UnboundedSender<AdapterCommand>,
}

impl PeerAdapter {
    /// Startet den Adapter-Task; das Primitiv wird dort asynchron gebaut
    pub(crate) fn spawn(
        connector: Arc<dyn PeerConnector>,
        id: AdapterId,
        options: PeerOptions,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let participant_id = options.participant_id.clone();
        let role = options.role;

        tokio::spawn(run_adapter(connector, id, options, command_rx, events));

        Self {
            id,
            participant_id,
            role,
            state: ConnectionState::Created,
            channel_open: false,
            remote_stream: None,
            commands,
        }
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Ist der Datenkanal nutzbar?
    pub fn channel_open(&self) -> bool {
        self.channel_open && !self.is_closed()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Reicht einen eingehenden Signal-Payload an das Primitiv weiter
    pub(crate) fn signal(&self, payload: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        self.commands.send(AdapterCommand::Signal(payload)).is_ok()
    }

    /// Fordert einen Spurwechsel an; das Ergebnis kommt über den Receiver
    pub(crate) fn replace_track(
        &self,
        old: Option<MediaTrack>,
        new: Option<MediaTrack>,
        stream: MediaStream,
    ) -> oneshot::Receiver<Result<(), NegotiationError>> {
        let (reply, rx) = oneshot::channel();
        if self.is_closed() {
            let _ = reply.send(Err(NegotiationError::Closed));
            return rx;
        }
        // Schlägt das Senden fehl, wird `reply` verworfen und der Receiver meldet das
        let _ = self.commands.send(AdapterCommand::ReplaceTrack {
            old,
            new,
            stream,
            reply,
        });
        rx
    }

    /// Daten über den Datenkanal (fire-and-forget)
    pub(crate) fn send(&self, data: Vec<u8>) -> bool {
        if !self.channel_open() {
            return false;
        }
        self.commands.send(AdapterCommand::Send(data)).is_ok()
    }

    /// Wertet ein Primitiv-Event aus und aktualisiert den Status
    pub(crate) fn apply(&mut self, event: PrimitiveEvent) -> AdapterOutput {
        if self.is_closed() {
            return AdapterOutput::None;
        }

        match event {
            PrimitiveEvent::Signal(payload) => {
                if self.state == ConnectionState::Created {
                    self.state = ConnectionState::Negotiating;
                }
                AdapterOutput::Outbound(payload)
            }
            PrimitiveEvent::Stream(stream) => match &self.remote_stream {
                Some(existing) => {
                    for track in stream.tracks() {
                        existing.add_track(track);
                    }
                    AdapterOutput::None
                }
                None => {
                    self.remote_stream = Some(stream.clone());
                    self.state = ConnectionState::Connected;
                    AdapterOutput::StreamReady(stream)
                }
            },
            PrimitiveEvent::Connect => {
                self.channel_open = true;
                AdapterOutput::None
            }
            PrimitiveEvent::Data(data) => AdapterOutput::Data(data),
            PrimitiveEvent::Close => AdapterOutput::Closed(self.close(CloseReason::Remote)),
            PrimitiveEvent::Error(reason) => {
                AdapterOutput::Closed(self.close(CloseReason::Error(reason)))
            }
        }
    }

    /// Schließt den Adapter und stoppt alle Remote-Spuren (idempotent)
    pub(crate) fn destroy(&mut self) {
        if !self.is_closed() {
            self.close(CloseReason::Remote);
        }
    }

    fn close(&mut self, reason: CloseReason) -> CloseReason {
        self.state = ConnectionState::Closed;
        self.channel_open = false;
        if let Some(stream) = &self.remote_stream {
            stream.stop_all();
        }
        let _ = self.commands.send(AdapterCommand::Close);
        reason
    }
}

impl std::fmt::Debug for PeerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerAdapter")
            .field("id", &self.id)
            .field("participant_id", &self.participant_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channel_open", &self.channel_open)
            .finish()
    }
}

// ============================================================================
// ADAPTER TASK
// ============================================================================

async fn run_adapter(
    connector: Arc<dyn PeerConnector>,
    adapter_id: AdapterId,
    options: PeerOptions,
    mut commands: mpsc::UnboundedReceiver<AdapterCommand>,
    events: mpsc::UnboundedSender<AdapterEvent>,
) {
    let participant_id = options.participant_id.clone();

    // Primitiv-Events markiert weiterreichen
    let (primitive_tx, mut primitive_rx) = mpsc::unbounded_channel();
    {
        let events = events.clone();
        let participant_id = participant_id.clone();
        tokio::spawn(async move {
            while let Some(event) = primitive_rx.recv().await {
                let tagged = AdapterEvent {
                    adapter_id,
                    participant_id: participant_id.clone(),
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });
    }

    let mut peer: Box<dyn NegotiationPeer> = match connector.connect(options, primitive_tx).await
    {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!("Failed to create peer for {}: {}", participant_id, e);
            let _ = events.send(AdapterEvent {
                adapter_id,
                participant_id,
                event: PrimitiveEvent::Error(e.to_string()),
            });
            return;
        }
    };

    while let Some(command) = commands.recv().await {
        match command {
            AdapterCommand::Signal(payload) => match peer.signal(payload).await {
                Ok(()) => {}
                Err(NegotiationError::InvalidSignal(reason)) => {
                    tracing::warn!("Dropping invalid signal from {}: {}", participant_id, reason);
                }
                Err(e) => {
                    tracing::warn!("Signal from {} failed: {}", participant_id, e);
                    let _ = events.send(AdapterEvent {
                        adapter_id,
                        participant_id: participant_id.clone(),
                        event: PrimitiveEvent::Error(e.to_string()),
                    });
                }
            },
            AdapterCommand::ReplaceTrack {
                old,
                new,
                stream,
                reply,
            } => {
                let result = peer.replace_track(old, new, stream).await;
                let _ = reply.send(result);
            }
            AdapterCommand::Send(data) => {
                if let Err(e) = peer.send(data).await {
                    tracing::debug!("Data to {} not sent: {}", participant_id, e);
                }
            }
            AdapterCommand::Close => break,
        }
    }

    // Sender verworfen oder Close: Primitiv schließen
    peer.close().await;
    tracing::debug!("Peer adapter {} for {} stopped", adapter_id, participant_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{TrackKind, TrackSource};
    use crate::testing::FakeConnector;

    fn spawn_adapter(
        connector: &Arc<FakeConnector>,
        role: NegotiationRole,
    ) -> (PeerAdapter, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = PeerAdapter::spawn(
            Arc::clone(connector) as Arc<dyn PeerConnector>,
            7,
            PeerOptions {
                participant_id: "bob".into(),
                role,
                local_stream: MediaStream::empty(),
            },
            tx,
        );
        (adapter, rx)
    }

    #[tokio::test]
    async fn test_initiator_reaches_connected() {
        let connector = Arc::new(FakeConnector::new());
        let (mut adapter, mut events) = spawn_adapter(&connector, NegotiationRole::Initiator);
        assert_eq!(adapter.state(), ConnectionState::Created);

        let offer = events.recv().await.unwrap();
        assert_eq!(offer.adapter_id, 7);
        assert_eq!(offer.participant_id, "bob");
        assert!(matches!(
            adapter.apply(offer.event),
            AdapterOutput::Outbound(_)
        ));
        assert_eq!(adapter.state(), ConnectionState::Negotiating);

        adapter.signal(serde_json::json!({"type": "answer"}));
        let stream = events.recv().await.unwrap();
        assert!(matches!(
            adapter.apply(stream.event),
            AdapterOutput::StreamReady(_)
        ));
        assert!(adapter.is_connected());

        let connect = events.recv().await.unwrap();
        adapter.apply(connect.event);
        assert!(adapter.channel_open());
    }

    #[tokio::test]
    async fn test_error_closes_and_stops_remote_tracks() {
        let connector = Arc::new(FakeConnector::new());
        let (mut adapter, _events) = spawn_adapter(&connector, NegotiationRole::Receiver);

        let remote = MediaTrack::new(TrackKind::Video, TrackSource::Remote, "remote");
        adapter.apply(PrimitiveEvent::Stream(MediaStream::new(vec![remote.clone()])));
        assert!(adapter.is_connected());

        match adapter.apply(PrimitiveEvent::Error("ice failed".into())) {
            AdapterOutput::Closed(CloseReason::Error(reason)) => assert_eq!(reason, "ice failed"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(adapter.is_closed());
        assert!(!remote.is_live());

        // Nach dem Schließen wird nichts mehr ausgewertet
        assert!(matches!(
            adapter.apply(PrimitiveEvent::Data(vec![1])),
            AdapterOutput::None
        ));
        assert!(!adapter.signal(serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_second_stream_merges_into_first() {
        let connector = Arc::new(FakeConnector::new());
        let (mut adapter, _events) = spawn_adapter(&connector, NegotiationRole::Receiver);

        let audio = MediaTrack::new(TrackKind::Audio, TrackSource::Remote, "a");
        let video = MediaTrack::new(TrackKind::Video, TrackSource::Remote, "v");
        assert!(matches!(
            adapter.apply(PrimitiveEvent::Stream(MediaStream::new(vec![audio]))),
            AdapterOutput::StreamReady(_)
        ));
        assert!(matches!(
            adapter.apply(PrimitiveEvent::Stream(MediaStream::new(vec![video]))),
            AdapterOutput::None
        ));
        assert_eq!(adapter.remote_stream().unwrap().tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_track_on_closed_adapter_fails() {
        let connector = Arc::new(FakeConnector::new());
        let (mut adapter, _events) = spawn_adapter(&connector, NegotiationRole::Receiver);
        adapter.destroy();

        let result = adapter.replace_track(None, None, MediaStream::empty()).await;
        assert_eq!(result.unwrap(), Err(NegotiationError::Closed));
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let connector = Arc::new(FakeConnector::new());
        let (mut adapter, _events) = spawn_adapter(&connector, NegotiationRole::Receiver);
        assert!(!adapter.send(vec![1, 2]));
        adapter.apply(PrimitiveEvent::Connect);
        assert!(adapter.send(vec![1, 2]));
    }
}
