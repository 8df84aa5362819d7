//! Track Replacement
//!
//! Tauscht die ausgehende Videospur auf allen offenen Adaptern aus.
//! Adapter mitten in der Verhandlung bekommen den Wechsel in ihre
//! Befehlsreihenfolge, damit jeder Peer dieselbe Quelle sieht.
//! Die Aufträge werden unter dem Session-Lock erteilt, auf die Antworten
//! wird ohne Lock gewartet. Fehler bei einem Peer betreffen nur diesen.

use super::local_media::TrackSwap;
use super::peer::PeerAdapter;
use crate::media::MediaStream;
use crate::negotiation::NegotiationError;
use std::time::Duration;
use tokio::sync::oneshot;

/// Wie lange auf die Antwort eines einzelnen Peers gewartet wird
const REPLACE_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = oneshot::Receiver<Result<(), NegotiationError>>;

/// Erteilte, noch offene Spurwechsel
#[derive(Debug, Default)]
pub(crate) struct ReplacementPlan {
    pending: Vec<(String, Reply)>,
}

impl ReplacementPlan {
    /// Erteilt den Wechsel an alle nicht geschlossenen Adapter
    pub fn issue<'a>(
        adapters: impl Iterator<Item = &'a PeerAdapter>,
        swap: TrackSwap,
        stream: &MediaStream,
    ) -> Self {
        let pending = adapters
            .filter(|adapter| !adapter.is_closed())
            .map(|adapter| {
                let reply =
                    adapter.replace_track(swap.old.clone(), swap.new.clone(), stream.clone());
                (adapter.participant_id().to_string(), reply)
            })
            .collect();
        Self { pending }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wartet auf alle Antworten
    pub async fn settle(self) -> ReplacementReport {
        let mut report = ReplacementReport::default();
        let replies = self.pending.into_iter().map(|(participant_id, reply)| async move {
            let result = match tokio::time::timeout(REPLACE_TIMEOUT, reply).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(NegotiationError::Closed),
                Err(_) => Err(NegotiationError::WebRtc("replace track timed out".to_string())),
            };
            (participant_id, result)
        });

        for (participant_id, result) in futures::future::join_all(replies).await {
            match result {
                Ok(()) => report.replaced.push(participant_id),
                Err(e) => report.failed.push((participant_id, e)),
            }
        }
        report
    }
}

/// Ergebnis eines Spurwechsels über alle Peers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplacementReport {
    pub replaced: Vec<String>,
    pub failed: Vec<(String, NegotiationError)>,
}

impl ReplacementReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log(&self, target: &str) {
        for (participant_id, e) in &self.failed {
            tracing::warn!(
                "Could not switch video to {} for {}: {}",
                target,
                participant_id,
                e
            );
        }
        if !self.replaced.is_empty() {
            tracing::info!(
                "Switched video to {} for {} peer(s)",
                target,
                self.replaced.len()
            );
        }
    }
}
