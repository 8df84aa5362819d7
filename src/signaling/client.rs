//! WebSocket Transport zum Relay-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Heartbeat-Keeping
//! - Erneutes Abonnieren aller Räume nach einem Reconnect
//! - Verteilung eingehender Broadcasts an die Raum-Receiver

use super::messages::{room_topic, ClientFrame, ServerFrame, TransportMessage};
use super::transport::{Delivery, SignalingTransport, SignalingTransportError};
use crate::config::ReconnectPolicy;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Relay-Server schließen inaktive Verbindungen, daher regelmäßig Heartbeats
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Events zum Verbindungsstatus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Verbunden mit Relay-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Neuer Verbindungsversuch steht an
    Reconnecting { attempt: u32, delay_ms: u64 },

    /// Alle Versuche aufgebraucht; Subscriptions sind geschlossen
    GaveUp,

    /// Fehler vom Server
    ServerError { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    gave_up: bool,
}

struct Shared {
    state: RwLock<ClientState>,
    topics: Mutex<HashMap<String, mpsc::UnboundedSender<TransportMessage>>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        self.state.write().is_connected = connected;
        let event = if connected {
            ConnectionEvent::Connected
        } else {
            ConnectionEvent::Disconnected
        };
        let _ = self.event_tx.send(event);
    }

    fn topic_names(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    /// Verarbeitet einen Text-Frame vom Server
    fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Ignoring unparseable relay frame: {}", e);
                return;
            }
        };

        match frame {
            ServerFrame::Broadcast {
                topic,
                event,
                payload,
            } => {
                let mut topics = self.topics.lock();
                let delivered = topics
                    .get(&topic)
                    .map(|tx| tx.send(TransportMessage::new(event, payload)).is_ok());
                if delivered == Some(false) {
                    // Receiver wurde verworfen
                    topics.remove(&topic);
                }
            }
            ServerFrame::Subscribed { topic } => {
                tracing::debug!("Relay confirmed subscription to {}", topic);
            }
            ServerFrame::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                let _ = self
                    .event_tx
                    .send(ConnectionEvent::ServerError { code, message });
            }
            ServerFrame::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    fn give_up(&self) {
        self.state.write().gave_up = true;
        // Schließt alle Delivery-Receiver
        self.topics.lock().clear();
        let _ = self.event_tx.send(ConnectionEvent::GaveUp);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    /// Transport wurde lokal geschlossen
    Shutdown,
    /// Verbindung verloren, Reconnect versuchen
    Lost,
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket Client für einen Pub/Sub Relay-Server
pub struct WebSocketTransport {
    server_url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Erstellt einen neuen Transport (verbindet erst bei Bedarf)
    pub fn new(server_url: String, policy: ReconnectPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            policy,
            shared: Arc::new(Shared {
                state: RwLock::new(ClientState::default()),
                topics: Mutex::new(HashMap::new()),
                event_tx,
            }),
            tx: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// Gibt einen Event-Receiver für den Verbindungsstatus zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.shared.state.read().is_connected
    }

    /// Baut die WebSocket URL aus der konfigurierten Server-URL
    pub fn websocket_url(server_url: &str) -> Result<Url, SignalingTransportError> {
        let mut url = Url::parse(server_url)
            .map_err(|e| SignalingTransportError::ConnectionFailed(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingTransportError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            SignalingTransportError::ConnectionFailed("cannot set websocket scheme".to_string())
        })?;

        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/ws");
        }

        Ok(url)
    }

    /// Verbindet mit dem Relay-Server (no-op solange der Supervisor läuft)
    ///
    /// Hat der Supervisor aufgegeben, wird neu verbunden.
    pub async fn connect(&self) -> Result<(), SignalingTransportError> {
        if self.has_live_sender() {
            return Ok(());
        }

        let ws_url = Self::websocket_url(&self.server_url)?;
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingTransportError::ConnectionFailed(e.to_string()))?;

        // Message-Sender erstellen
        let (tx, rx) = mpsc::channel::<String>(100);
        {
            let mut slot = self.tx.lock();
            if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
                // Paralleler connect() war schneller
                return Ok(());
            }
            *slot = Some(tx);
        }

        {
            let mut state = self.shared.state.write();
            state.gave_up = false;
        }
        self.shared.set_connected(true);

        let handle = tokio::spawn(supervise(
            ws_url.to_string(),
            self.policy.clone(),
            Arc::clone(&self.shared),
            rx,
            ws_stream,
        ));
        *self.supervisor.lock() = Some(handle);

        Ok(())
    }

    /// Verwirft den Sender eines beendeten Supervisors
    fn has_live_sender(&self) -> bool {
        let mut slot = self.tx.lock();
        match slot.as_ref() {
            Some(tx) if !tx.is_closed() => true,
            Some(_) => {
                tracing::debug!("Signaling supervisor has stopped, dropping stale sender");
                *slot = None;
                false
            }
            None => false,
        }
    }

    /// Trennt die Verbindung; alle Subscriptions werden geschlossen
    pub fn disconnect(&self) {
        // Ohne Sender beendet sich der Supervisor von selbst
        self.tx.lock().take();
        self.shared.topics.lock().clear();
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), SignalingTransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| SignalingTransportError::SendFailed(e.to_string()))?;

        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| SignalingTransportError::ConnectionFailed("not connected".into()))?;

        tx.send(text)
            .await
            .map_err(|e| SignalingTransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn subscribe(&self, room_id: &str) -> Result<Delivery, SignalingTransportError> {
        let topic = room_topic(room_id);
        self.connect()
            .await
            .map_err(|e| SignalingTransportError::SubscribeFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.topics.lock().insert(topic.clone(), tx);

        if let Err(e) = self
            .send_frame(&ClientFrame::Subscribe {
                topic: topic.clone(),
            })
            .await
        {
            self.shared.topics.lock().remove(&topic);
            return Err(SignalingTransportError::SubscribeFailed {
                topic,
                reason: e.to_string(),
            });
        }

        tracing::info!("Subscribed to {}", topic);
        Ok(rx)
    }

    async fn send(
        &self,
        room_id: &str,
        message: TransportMessage,
    ) -> Result<(), SignalingTransportError> {
        let topic = room_topic(room_id);
        if !self.shared.topics.lock().contains_key(&topic) {
            return Err(SignalingTransportError::NotSubscribed(room_id.to_string()));
        }

        self.send_frame(&ClientFrame::Broadcast {
            topic,
            event: message.event,
            payload: message.payload,
        })
        .await
    }

    async fn unsubscribe(&self, room_id: &str) {
        let topic = room_topic(room_id);
        if self.shared.topics.lock().remove(&topic).is_none() {
            return;
        }
        if let Err(e) = self.send_frame(&ClientFrame::Unsubscribe { topic }).await {
            tracing::debug!("Unsubscribe frame not sent: {}", e);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("server_url", &self.server_url)
            .field("state", &*self.shared.state.read())
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

/// Hält die Verbindung am Leben und verbindet bei Abbruch neu
async fn supervise(
    ws_url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<String>,
    mut stream: WsStream,
) {
    loop {
        let exit = pump(stream, &mut outbound, &shared).await;
        shared.set_connected(false);

        if exit == PumpExit::Shutdown {
            tracing::info!("Signaling transport shut down");
            return;
        }

        let mut attempt = 0;
        stream = loop {
            attempt += 1;
            if !policy.allows(attempt) {
                tracing::error!(
                    "Giving up on signaling relay after {} attempt(s)",
                    attempt - 1
                );
                shared.give_up();
                return;
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                "Signaling connection lost, reconnecting in {:?} (attempt {})",
                delay,
                attempt
            );
            let _ = shared.event_tx.send(ConnectionEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;

            match connect_async(ws_url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        };

        tracing::info!("Reconnected to signaling relay");
        shared.set_connected(true);
    }
}

/// Liest und schreibt bis die Verbindung endet
async fn pump(stream: WsStream, outbound: &mut mpsc::Receiver<String>, shared: &Shared) -> PumpExit {
    let (mut write, mut read) = stream.split();

    // Topics nach (Re-)Connect erneut abonnieren
    for topic in shared.topic_names() {
        let frame = ClientFrame::Subscribe { topic };
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if let Err(e) = write.send(Message::Text(text)).await {
            tracing::error!("Failed to resubscribe: {}", e);
            return PumpExit::Lost;
        }
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        return PumpExit::Lost;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return PumpExit::Shutdown;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("WebSocket closed by server");
                    return PumpExit::Lost;
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    return PumpExit::Lost;
                }
                None => return PumpExit::Lost,
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                let Ok(text) = serde_json::to_string(&ClientFrame::Heartbeat) else {
                    continue;
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    return PumpExit::Lost;
                }
            }
        }
    }
}
