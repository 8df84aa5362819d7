//! Events und Fehler der Call-Session
//!
//! `CallEvent` ist der einzige Vertrag zur Oberfläche. `CallError` sammelt
//! die Fehler aller Schichten und ist `Clone`, damit er über den
//! Broadcast-Kanal verschickt werden kann.

use super::registry::Participant;
use crate::media::{MediaAccessError, MediaStream, ScreenShareError};
use crate::signaling::SignalingTransportError;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),

    #[error(transparent)]
    Signaling(#[from] SignalingTransportError),

    #[error("Negotiation with {participant_id} failed: {reason}")]
    PeerNegotiation {
        participant_id: String,
        reason: String,
    },

    #[error(transparent)]
    ScreenShare(#[from] ScreenShareError),

    #[error("No active call")]
    NotActive,
}

impl CallError {
    /// Beendet der Fehler die Session?
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::MediaAccess(_) | CallError::Signaling(_))
    }

    /// Text für die Oberfläche
    pub fn user_message(&self) -> String {
        match self {
            CallError::MediaAccess(e) => e.remediation().to_string(),
            CallError::ScreenShare(ScreenShareError::PermissionDenied { platform }) => {
                platform.screen_share_guidance().to_string()
            }
            CallError::ScreenShare(ScreenShareError::AlreadyActive) => {
                "You are already sharing your screen.".to_string()
            }
            CallError::ScreenShare(ScreenShareError::Unsupported) => {
                "Screen sharing is not available on this device.".to_string()
            }
            CallError::Signaling(_) => {
                "Lost connection to the call service. Check your network and try again."
                    .to_string()
            }
            CallError::PeerNegotiation { participant_id, .. } => format!(
                "Could not connect to {}. They can rejoin to try again.",
                participant_id
            ),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events an die Oberfläche
#[derive(Debug, Clone)]
pub enum CallEvent {
    ParticipantJoined(Participant),
    ParticipantLeft(String),
    StreamReceived {
        participant_id: String,
        stream: MediaStream,
    },
    StreamRemoved(String),
    CallEnded,
    Error(CallError),
    DataReceived {
        participant_id: String,
        payload: Vec<u8>,
    },
}

impl CallEvent {
    /// Stabiler Event-Name
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::ParticipantJoined(_) => "participant-joined",
            CallEvent::ParticipantLeft(_) => "participant-left",
            CallEvent::StreamReceived { .. } => "stream-received",
            CallEvent::StreamRemoved(_) => "stream-removed",
            CallEvent::CallEnded => "call-ended",
            CallEvent::Error(_) => "error",
            CallEvent::DataReceived { .. } => "data-received",
        }
    }

    /// Betroffener Teilnehmer, falls vorhanden
    pub fn participant_id(&self) -> Option<&str> {
        match self {
            CallEvent::ParticipantJoined(p) => Some(&p.id),
            CallEvent::ParticipantLeft(id) | CallEvent::StreamRemoved(id) => Some(id),
            CallEvent::StreamReceived { participant_id, .. }
            | CallEvent::DataReceived { participant_id, .. } => Some(participant_id),
            CallEvent::Error(CallError::PeerNegotiation { participant_id, .. }) => {
                Some(participant_id)
            }
            CallEvent::CallEnded | CallEvent::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PlatformQuirks;

    #[test]
    fn test_event_names() {
        assert_eq!(CallEvent::CallEnded.name(), "call-ended");
        assert_eq!(CallEvent::StreamRemoved("b".into()).name(), "stream-removed");
        assert_eq!(
            CallEvent::DataReceived {
                participant_id: "b".into(),
                payload: vec![]
            }
            .name(),
            "data-received"
        );
        assert_eq!(CallEvent::Error(CallError::NotActive).name(), "error");
    }

    #[test]
    fn test_fatality() {
        assert!(CallError::from(MediaAccessError::DeviceNotFound).is_fatal());
        assert!(
            CallError::from(SignalingTransportError::ConnectionFailed("x".into())).is_fatal()
        );
        assert!(!CallError::from(ScreenShareError::AlreadyActive).is_fatal());
        assert!(!CallError::PeerNegotiation {
            participant_id: "b".into(),
            reason: "ice".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_user_message_uses_platform_guidance() {
        let denied = CallError::from(MediaAccessError::PermissionDenied {
            platform: PlatformQuirks::EmbeddedWebView,
        });
        assert_eq!(
            denied.user_message(),
            PlatformQuirks::EmbeddedWebView.permission_guidance()
        );

        let share = CallError::from(ScreenShareError::PermissionDenied {
            platform: PlatformQuirks::StrictPermissions,
        });
        assert_eq!(
            share.user_message(),
            PlatformQuirks::StrictPermissions.screen_share_guidance()
        );

        assert_eq!(
            CallError::NotActive.user_message(),
            "Something went wrong. Please try again."
        );
    }
}
