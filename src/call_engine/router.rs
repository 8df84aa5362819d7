//! Signaling Router
//!
//! Übersetzt Raum-Nachrichten in Adapter-Operationen und Adapter-Events
//! in Raum-Nachrichten. Der Router führt selbst nichts aus, sondern gibt
//! `RouterAction`s zurück, die die Session der Reihe nach abarbeitet.
//!
//! Rollen: Für jedes Teilnehmerpaar werden die beiden Ankündigungen über
//! den Schlüssel `(!initiator, timestamp, id)` verglichen; der kleinere
//! Schlüssel verhandelt als Initiator. Die Seite, die dabei Receiver wird,
//! kündigt sich erneut an, damit der Initiator sie sicher kennt.

use super::events::{CallError, CallEvent};
use super::peer::{AdapterEvent, AdapterId, AdapterOutput, CloseReason};
use super::registry::{Participant, ParticipantRegistry, RegistryEntry};
use super::topology::{LinkRequest, PeerTopology};
use crate::media::MediaStream;
use crate::negotiation::NegotiationRole;
use crate::signaling::{
    InboundMessage, PeerDataMessage, PresenceMessage, SignalEnvelope, TransportMessage,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Wie lange Abmeldungen gemerkt werden, um verspätete Signale zu erkennen
const DEPARTURE_MEMORY: Duration = Duration::from_secs(5);

/// Vom Router angeforderte Seiteneffekte
#[derive(Debug)]
pub(crate) enum RouterAction {
    Emit(CallEvent),
    Send(TransportMessage),
}

/// Raum und lokale Ankündigung
#[derive(Debug, Clone)]
pub(crate) struct RouterContext {
    pub room_id: String,
    pub local_id: String,
    pub presence: PresenceMessage,
}

// ============================================================================
// SIGNAL BUFFER
// ============================================================================

/// Signale für Teilnehmer ohne Adapter
#[derive(Debug)]
pub(crate) struct SignalBuffer {
    window: Duration,
    pending: HashMap<String, Vec<(Instant, Value)>>,
}

impl SignalBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, participant_id: &str, payload: Value, now: Instant) {
        self.pending
            .entry(participant_id.to_string())
            .or_default()
            .push((now, payload));
    }

    /// Alle gepufferten Payloads eines Teilnehmers in Empfangsreihenfolge
    pub fn take(&mut self, participant_id: &str) -> Vec<Value> {
        self.pending
            .remove(participant_id)
            .map(|entries| entries.into_iter().map(|(_, payload)| payload).collect())
            .unwrap_or_default()
    }

    pub fn discard(&mut self, participant_id: &str) {
        self.pending.remove(participant_id);
    }

    /// Verwirft abgelaufene Einträge, gibt deren Anzahl zurück
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.window;
        let mut dropped = 0;
        self.pending.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(at, _)| now.saturating_duration_since(*at) < window);
            dropped += before - entries.len();
            !entries.is_empty()
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub(crate) struct SignalingRouter {
    context: RouterContext,
    topology: Arc<dyn PeerTopology>,
    registry: ParticipantRegistry,
    buffer: SignalBuffer,
    /// Abgemeldete Teilnehmer: Zeitpunkt und Zeitstempel der Abmeldung
    departed: HashMap<String, (Instant, i64)>,
    adapter_events: mpsc::UnboundedSender<AdapterEvent>,
    next_adapter_id: AdapterId,
}

impl SignalingRouter {
    pub fn new(
        context: RouterContext,
        topology: Arc<dyn PeerTopology>,
        adapter_events: mpsc::UnboundedSender<AdapterEvent>,
        buffer_window: Duration,
    ) -> Self {
        Self {
            context,
            topology,
            registry: ParticipantRegistry::new(),
            buffer: SignalBuffer::new(buffer_window),
            departed: HashMap::new(),
            adapter_events,
            next_adapter_id: 1,
        }
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.registry.participants()
    }

    pub fn participant_stream(&self, participant_id: &str) -> Option<MediaStream> {
        self.registry.get(participant_id).and_then(RegistryEntry::stream)
    }

    pub fn buffered_signals(&self) -> usize {
        self.buffer.len()
    }

    /// Verarbeitet eine Nachricht vom Transport
    pub fn handle_transport(
        &mut self,
        message: &TransportMessage,
        outgoing: &MediaStream,
    ) -> Vec<RouterAction> {
        let inbound = match InboundMessage::decode(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!("Dropping transport message: {}", e);
                return Vec::new();
            }
        };

        if inbound.room_id() != self.context.room_id {
            tracing::debug!(
                "Dropping message for room {} (in {})",
                inbound.room_id(),
                self.context.room_id
            );
            return Vec::new();
        }

        match inbound {
            InboundMessage::Signal(envelope) => self.handle_signal(envelope, outgoing),
            InboundMessage::Joined(presence) => self.handle_joined(presence, outgoing),
            InboundMessage::Left(presence) => self.handle_left(&presence),
        }
    }

    fn handle_signal(
        &mut self,
        envelope: SignalEnvelope,
        outgoing: &MediaStream,
    ) -> Vec<RouterAction> {
        if envelope.from == self.context.local_id || envelope.to != self.context.local_id {
            return Vec::new();
        }

        if let Some(entry) = self.registry.get(&envelope.from) {
            if !entry.adapter().signal(envelope.signal) {
                tracing::debug!("Signal for closed adapter of {} dropped", envelope.from);
            }
            return Vec::new();
        }

        if self.departed.contains_key(&envelope.from) {
            // Verspätet nach der Abmeldung; nur für eine erneute Ankündigung aufheben
            tracing::debug!("Late signal from departed participant {}", envelope.from);
            self.buffer
                .push(&envelope.from, envelope.signal, Instant::now());
            return Vec::new();
        }

        // Signal überholt die Ankündigung: puffern, Receiver anlegen, nachreichen
        tracing::debug!(
            "Signal from unknown participant {}, creating receiver",
            envelope.from
        );
        self.buffer
            .push(&envelope.from, envelope.signal, Instant::now());

        let mut actions = Vec::new();
        if let Some(participant) =
            self.open_link(&envelope.from, NegotiationRole::Receiver, None, outgoing)
        {
            actions.push(RouterAction::Emit(CallEvent::ParticipantJoined(participant)));
        }
        actions
    }

    fn handle_joined(
        &mut self,
        presence: PresenceMessage,
        outgoing: &MediaStream,
    ) -> Vec<RouterAction> {
        if presence.user_id == self.context.local_id {
            return Vec::new();
        }
        if self.registry.contains(&presence.user_id) {
            tracing::debug!("Ignoring duplicate join from {}", presence.user_id);
            return Vec::new();
        }
        if let Some((at, left_at)) = self.departed.remove(&presence.user_id) {
            if presence.timestamp <= left_at {
                tracing::debug!("Ignoring stale join from {}", presence.user_id);
                self.departed
                    .insert(presence.user_id.clone(), (at, left_at));
                return Vec::new();
            }
        }

        let role = self.role_towards(&presence);
        tracing::info!(
            "Participant {} joined, negotiating as {:?}",
            presence.user_id,
            role
        );

        let mut actions = Vec::new();
        let Some(participant) = self.open_link(
            &presence.user_id,
            role,
            presence.display_name.clone(),
            outgoing,
        ) else {
            return actions;
        };
        actions.push(RouterAction::Emit(CallEvent::ParticipantJoined(participant)));

        if role == NegotiationRole::Receiver {
            // Sicherstellen, dass der Initiator uns kennt
            actions.push(RouterAction::Send(TransportMessage::joined(
                &self.context.presence,
            )));
        }
        actions
    }

    fn handle_left(&mut self, presence: &PresenceMessage) -> Vec<RouterAction> {
        let participant_id = presence.user_id.as_str();
        if participant_id == self.context.local_id {
            return Vec::new();
        }
        self.buffer.discard(participant_id);
        self.departed
            .insert(participant_id.to_string(), (Instant::now(), presence.timestamp));

        let mut actions = Vec::new();
        self.remove_participant(participant_id, &mut actions);
        if actions.is_empty() {
            tracing::debug!("Leave for unknown participant {}", participant_id);
        }
        actions
    }

    /// Rolle gegenüber einem Teilnehmer, der sich angekündigt hat
    pub fn role_towards(&self, remote: &PresenceMessage) -> NegotiationRole {
        let local = &self.context.presence;
        let local_key = (!local.initiator, local.timestamp, local.user_id.as_str());
        let remote_key = (!remote.initiator, remote.timestamp, remote.user_id.as_str());
        if local_key < remote_key {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Receiver
        }
    }

    fn open_link(
        &mut self,
        participant_id: &str,
        role: NegotiationRole,
        display_name: Option<String>,
        outgoing: &MediaStream,
    ) -> Option<Participant> {
        if !self.topology.accepts(self.registry.len()) {
            tracing::warn!(
                "Topology {} is full, not connecting to {}",
                self.topology.name(),
                participant_id
            );
            return None;
        }

        let adapter_id = self.next_adapter_id;
        self.next_adapter_id += 1;

        let adapter = self.topology.open_link(
            LinkRequest {
                adapter_id,
                participant_id: participant_id.to_string(),
                role,
                local_stream: outgoing.clone(),
            },
            self.adapter_events.clone(),
        );
        let entry = RegistryEntry::new(
            adapter,
            display_name.unwrap_or_else(|| participant_id.to_string()),
        );

        if let Err(e) = self.registry.upsert(participant_id, entry) {
            tracing::warn!("{}", e);
            return None;
        }

        let entry = self.registry.get(participant_id)?;
        for payload in self.buffer.take(participant_id) {
            entry.adapter().signal(payload);
        }
        Some(entry.snapshot())
    }

    /// Verarbeitet ein Event eines Adapters
    pub fn handle_adapter_event(&mut self, event: AdapterEvent) -> Vec<RouterAction> {
        let participant_id = event.participant_id;
        let Some(entry) = self
            .registry
            .get_mut(&participant_id)
            .filter(|entry| entry.adapter().id() == event.adapter_id)
        else {
            tracing::trace!(
                "Ignoring event from stale adapter {} ({})",
                event.adapter_id,
                participant_id
            );
            return Vec::new();
        };

        let mut actions = Vec::new();
        match entry.adapter_mut().apply(event.event) {
            AdapterOutput::None => {}
            AdapterOutput::Outbound(signal) => {
                let envelope = SignalEnvelope {
                    from: self.context.local_id.clone(),
                    to: participant_id,
                    room_id: self.context.room_id.clone(),
                    signal,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                actions.push(RouterAction::Send(TransportMessage::signal(&envelope)));
            }
            AdapterOutput::StreamReady(stream) => {
                tracing::info!("Connected to {}", participant_id);
                actions.push(RouterAction::Emit(CallEvent::StreamReceived {
                    participant_id,
                    stream,
                }));
            }
            AdapterOutput::Data(payload) => {
                if let Some(PeerDataMessage::MediaState {
                    video_enabled,
                    audio_enabled,
                }) = PeerDataMessage::parse(&payload)
                {
                    entry.set_media_state(video_enabled, audio_enabled);
                }
                actions.push(RouterAction::Emit(CallEvent::DataReceived {
                    participant_id,
                    payload,
                }));
            }
            AdapterOutput::Closed(reason) => {
                if let CloseReason::Error(reason) = reason {
                    tracing::warn!("Connection to {} failed: {}", participant_id, reason);
                    actions.push(RouterAction::Emit(CallEvent::Error(
                        CallError::PeerNegotiation {
                            participant_id: participant_id.clone(),
                            reason,
                        },
                    )));
                } else {
                    tracing::info!("Connection to {} closed", participant_id);
                }
                self.remove_participant(&participant_id, &mut actions);
            }
        }
        actions
    }

    fn remove_participant(&mut self, participant_id: &str, actions: &mut Vec<RouterAction>) {
        // Remote-Stream war sichtbar, solange der Eintrag einen hatte
        let had_stream = self
            .registry
            .get(participant_id)
            .map(|entry| entry.stream().is_some())
            .unwrap_or(false);

        if self.registry.remove(participant_id).is_none() {
            return;
        }
        if had_stream {
            actions.push(RouterAction::Emit(CallEvent::StreamRemoved(
                participant_id.to_string(),
            )));
        }
        actions.push(RouterAction::Emit(CallEvent::ParticipantLeft(
            participant_id.to_string(),
        )));
    }

    /// Verschickt Daten an alle Teilnehmer mit offenem Datenkanal
    pub fn broadcast_data(&self, data: &[u8]) -> usize {
        self.registry
            .adapters()
            .filter(|adapter| adapter.send(data.to_vec()))
            .count()
    }

    pub fn sweep(&mut self, now: Instant) {
        let dropped = self.buffer.sweep(now);
        if dropped > 0 {
            tracing::debug!("Dropped {} expired buffered signal(s)", dropped);
        }
        self.departed
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < DEPARTURE_MEMORY);
    }

    /// Baut alle Teilnehmer ab (Session-Ende)
    pub fn teardown(&mut self) -> Vec<RouterAction> {
        self.buffer.clear();
        self.departed.clear();
        let mut actions = Vec::new();
        for (participant_id, entry) in self.registry.drain() {
            if entry.stream().is_some() {
                actions.push(RouterAction::Emit(CallEvent::StreamRemoved(
                    participant_id.clone(),
                )));
            }
            actions.push(RouterAction::Emit(CallEvent::ParticipantLeft(participant_id)));
        }
        actions
    }
}

impl std::fmt::Debug for SignalingRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingRouter")
            .field("room_id", &self.context.room_id)
            .field("local_id", &self.context.local_id)
            .field("topology", &self.topology.name())
            .field("registry", &self.registry)
            .field("buffered", &self.buffer.len())
            .field("departed", &self.departed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::topology::FullMesh;
    use crate::negotiation::{PeerConnector, PrimitiveEvent};
    use crate::signaling::messages::{PARTICIPANT_JOINED_EVENT, SIGNAL_EVENT};
    use crate::testing::FakeConnector;
    use serde_json::json;

    struct Harness {
        router: SignalingRouter,
        connector: Arc<FakeConnector>,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
    }

    fn presence(user: &str, timestamp: i64, initiator: bool) -> PresenceMessage {
        PresenceMessage {
            user_id: user.into(),
            room_id: "room".into(),
            timestamp,
            initiator,
            display_name: None,
        }
    }

    fn harness(local: PresenceMessage, max_participants: usize) -> Harness {
        let connector = Arc::new(FakeConnector::new());
        let topology = FullMesh::new(Arc::clone(&connector) as Arc<dyn PeerConnector>)
            .with_max_participants(max_participants);
        let (tx, events) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(
            RouterContext {
                room_id: "room".into(),
                local_id: local.user_id.clone(),
                presence: local,
            },
            Arc::new(topology),
            tx,
            Duration::from_millis(75),
        );
        Harness {
            router,
            connector,
            events,
        }
    }

    fn joined(user: &str, timestamp: i64) -> TransportMessage {
        TransportMessage::joined(&presence(user, timestamp, false))
    }

    fn signal(from: &str, to: &str, payload: Value) -> TransportMessage {
        TransportMessage::signal(&SignalEnvelope {
            from: from.into(),
            to: to.into(),
            room_id: "room".into(),
            signal: payload,
            timestamp: 0,
        })
    }

    fn emitted(actions: &[RouterAction]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|action| match action {
                RouterAction::Emit(event) => Some(event.name()),
                RouterAction::Send(_) => None,
            })
            .collect()
    }

    /// Leitet Adapter-Events zurück in den Router, bis Ruhe herrscht
    async fn pump(h: &mut Harness) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), h.events.recv()).await
        {
            actions.extend(h.router.handle_adapter_event(event));
        }
        actions
    }

    /// Beantwortet das Offer eines Initiator-Adapters und wartet auf den Stream
    async fn answer_from(h: &mut Harness, remote: &str) -> Vec<RouterAction> {
        let local = h.router.context.local_id.clone();
        h.router.handle_transport(
            &signal(remote, &local, json!({"type": "answer"})),
            &MediaStream::empty(),
        );
        pump(h).await
    }

    #[test]
    fn test_role_is_symmetric() {
        let a = presence("a", 100, false);
        let b = presence("b", 200, false);
        let connector = Arc::new(FakeConnector::new());
        let make = |local: &PresenceMessage| {
            let (tx, _rx) = mpsc::unbounded_channel();
            SignalingRouter::new(
                RouterContext {
                    room_id: "room".into(),
                    local_id: local.user_id.clone(),
                    presence: local.clone(),
                },
                Arc::new(FullMesh::new(
                    Arc::clone(&connector) as Arc<dyn PeerConnector>
                )),
                tx,
                Duration::from_millis(75),
            )
        };

        // Früher angekündigt = Initiator
        assert_eq!(make(&a).role_towards(&b), NegotiationRole::Initiator);
        assert_eq!(make(&b).role_towards(&a), NegotiationRole::Receiver);

        // Initiator-Flag schlägt den Zeitstempel
        let late_initiator = presence("c", 300, true);
        assert_eq!(
            make(&a).role_towards(&late_initiator),
            NegotiationRole::Receiver
        );
        assert_eq!(
            make(&late_initiator).role_towards(&a),
            NegotiationRole::Initiator
        );

        // Gleicher Zeitstempel: ID entscheidet
        let a_same = presence("a", 5, false);
        let b_same = presence("b", 5, false);
        assert_eq!(make(&a_same).role_towards(&b_same), NegotiationRole::Initiator);
        assert_eq!(make(&b_same).role_towards(&a_same), NegotiationRole::Receiver);
    }

    #[tokio::test]
    async fn test_duplicate_join_creates_one_adapter() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();

        let first = h.router.handle_transport(&joined("b", 200), &outgoing);
        let second = h.router.handle_transport(&joined("b", 200), &outgoing);

        assert_eq!(emitted(&first), vec!["participant-joined"]);
        assert!(second.is_empty());
        assert_eq!(h.router.registry().len(), 1);
        assert_eq!(
            h.router.registry().get("b").unwrap().adapter().role(),
            NegotiationRole::Initiator
        );
        tokio::task::yield_now().await;
        assert_eq!(h.connector.connect_count("b"), 1);
    }

    #[tokio::test]
    async fn test_receiver_reannounces() {
        let mut h = harness(presence("b", 200, false), 0);
        let actions = h
            .router
            .handle_transport(&joined("a", 100), &MediaStream::empty());

        assert_eq!(emitted(&actions), vec!["participant-joined"]);
        let reannounce = actions.iter().find_map(|action| match action {
            RouterAction::Send(message) => Some(message),
            _ => None,
        });
        let reannounce = reannounce.unwrap();
        assert_eq!(reannounce.event, PARTICIPANT_JOINED_EVENT);
        assert_eq!(reannounce.payload["userId"], "b");
    }

    #[tokio::test]
    async fn test_unknown_leave_is_noop() {
        let mut h = harness(presence("a", 100, false), 0);
        let left = TransportMessage::left(&presence("ghost", 1, false));
        assert!(h
            .router
            .handle_transport(&left, &MediaStream::empty())
            .is_empty());
    }

    #[tokio::test]
    async fn test_filters_foreign_and_self_messages() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();

        // An jemand anderen adressiert
        assert!(h
            .router
            .handle_transport(&signal("b", "c", json!({"type": "offer"})), &outgoing)
            .is_empty());
        // Eigenes Echo
        assert!(h
            .router
            .handle_transport(&joined("a", 100), &outgoing)
            .is_empty());
        // Falscher Raum
        let mut other_room = presence("b", 1, false);
        other_room.room_id = "elsewhere".into();
        assert!(h
            .router
            .handle_transport(&TransportMessage::joined(&other_room), &outgoing)
            .is_empty());
        // Unbekanntes Event und kaputter Payload
        assert!(h
            .router
            .handle_transport(&TransportMessage::new("typing", json!({})), &outgoing)
            .is_empty());
        assert!(h
            .router
            .handle_transport(&TransportMessage::new(SIGNAL_EVENT, json!(42)), &outgoing)
            .is_empty());

        assert_eq!(h.router.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_signal_before_join_is_applied() {
        let mut h = harness(presence("b", 200, false), 0);
        let outgoing = MediaStream::empty();

        let actions = h
            .router
            .handle_transport(&signal("a", "b", json!({"type": "offer"})), &outgoing);
        assert_eq!(emitted(&actions), vec!["participant-joined"]);
        assert_eq!(h.router.buffered_signals(), 0);

        // Ankündigung kommt danach und wird ignoriert
        assert!(h
            .router
            .handle_transport(&joined("a", 100), &outgoing)
            .is_empty());

        let actions = pump(&mut h).await;
        assert!(emitted(&actions).contains(&"stream-received"));
        assert_eq!(h.connector.received_signals("a").len(), 1);
        assert_eq!(h.router.registry().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_full_topology_buffers_then_expires() {
        let mut h = harness(presence("a", 100, false), 2);
        let outgoing = MediaStream::empty();

        h.router.handle_transport(&joined("b", 200), &outgoing);
        let actions = h
            .router
            .handle_transport(&signal("c", "a", json!({"type": "offer"})), &outgoing);

        assert!(actions.is_empty());
        assert_eq!(h.router.buffered_signals(), 1);

        h.router.sweep(Instant::now() + Duration::from_millis(80));
        assert_eq!(h.router.buffered_signals(), 0);
    }

    #[tokio::test]
    async fn test_negotiation_error_is_isolated() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();
        h.router.handle_transport(&joined("b", 200), &outgoing);
        h.router.handle_transport(&joined("c", 300), &outgoing);
        pump(&mut h).await;
        answer_from(&mut h, "b").await;

        let adapter_id = h.router.registry().get("b").unwrap().adapter().id();
        let actions = h.router.handle_adapter_event(AdapterEvent {
            adapter_id,
            participant_id: "b".into(),
            event: PrimitiveEvent::Error("dtls failed".into()),
        });

        assert_eq!(
            emitted(&actions),
            vec!["error", "stream-removed", "participant-left"]
        );
        assert!(!h.router.registry().contains("b"));
        assert!(h.router.registry().contains("c"));
    }

    #[tokio::test]
    async fn test_stale_adapter_events_ignored() {
        let mut h = harness(presence("a", 100, false), 0);
        h.router
            .handle_transport(&joined("b", 200), &MediaStream::empty());

        let stale = h.router.handle_adapter_event(AdapterEvent {
            adapter_id: 999,
            participant_id: "b".into(),
            event: PrimitiveEvent::Close,
        });
        assert!(stale.is_empty());
        assert!(h.router.registry().contains("b"));
    }

    #[tokio::test]
    async fn test_media_state_updates_participant() {
        let mut h = harness(presence("a", 100, false), 0);
        h.router
            .handle_transport(&joined("b", 200), &MediaStream::empty());
        let adapter_id = h.router.registry().get("b").unwrap().adapter().id();

        let payload = PeerDataMessage::MediaState {
            video_enabled: false,
            audio_enabled: false,
        }
        .to_bytes();
        let actions = h.router.handle_adapter_event(AdapterEvent {
            adapter_id,
            participant_id: "b".into(),
            event: PrimitiveEvent::Data(payload),
        });

        assert_eq!(emitted(&actions), vec!["data-received"]);
        let participant = &h.router.participants()[0];
        assert!(participant.is_muted);
        assert!(participant.is_video_off);
    }

    #[tokio::test]
    async fn test_late_signal_after_leave_creates_no_participant() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();
        h.router.handle_transport(&joined("b", 200), &outgoing);
        pump(&mut h).await;
        answer_from(&mut h, "b").await;

        let left = TransportMessage::left(&presence("b", 900, false));
        assert_eq!(
            emitted(&h.router.handle_transport(&left, &outgoing)),
            vec!["stream-removed", "participant-left"]
        );

        // Kandidat überholt von der Abmeldung
        let late = h
            .router
            .handle_transport(&signal("b", "a", json!({"type": "candidate"})), &outgoing);
        assert!(late.is_empty());
        assert!(h.router.participants().is_empty());
        assert!(pump(&mut h).await.is_empty());
        assert_eq!(h.connector.connect_count("b"), 1);

        // Verspätete alte Ankündigung ebenfalls
        assert!(h
            .router
            .handle_transport(&joined("b", 200), &outgoing)
            .is_empty());
        assert!(h.router.participants().is_empty());

        h.router.sweep(Instant::now() + Duration::from_millis(80));
        assert_eq!(h.router.buffered_signals(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_leave_is_accepted() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();
        h.router.handle_transport(&joined("b", 200), &outgoing);
        let left = TransportMessage::left(&presence("b", 300, false));
        h.router.handle_transport(&left, &outgoing);

        let rejoined = h.router.handle_transport(&joined("b", 400), &outgoing);
        assert_eq!(emitted(&rejoined), vec!["participant-joined"]);
        assert!(h.router.registry().contains("b"));
    }

    #[tokio::test]
    async fn test_teardown_emits_in_order() {
        let mut h = harness(presence("a", 100, false), 0);
        let outgoing = MediaStream::empty();
        h.router.handle_transport(&joined("b", 200), &outgoing);
        h.router.handle_transport(&joined("c", 300), &outgoing);
        pump(&mut h).await;
        answer_from(&mut h, "b").await;
        answer_from(&mut h, "c").await;
        assert_eq!(h.router.registry().connected_count(), 2);

        let actions = h.router.teardown();
        assert_eq!(
            emitted(&actions),
            vec![
                "stream-removed",
                "participant-left",
                "stream-removed",
                "participant-left"
            ]
        );
        assert_eq!(h.router.registry().len(), 0);
    }
}
