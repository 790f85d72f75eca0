//! Read-only views handed to the presentation layer

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::admission::AdmissionState;
use crate::directory::{Participant, Presence};
use crate::media::RemoteTrack;
use crate::protocol::{GuestRequest, Role, SourceKind};
use crate::rtp::MediaKind;
use crate::types::{ConsumerId, ProducerId, SocketId, UserId};

/// Lifecycle of a [`crate::Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Joining,
    Joined,
    Failed,
    Left,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerView {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub attached: bool,
    #[serde(skip)]
    pub track: Arc<dyn RemoteTrack>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub socket_id: SocketId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub has_media: bool,
    pub consumers: Vec<ConsumerView>,
}

impl From<&Participant> for ParticipantView {
    fn from(participant: &Participant) -> Self {
        Self {
            socket_id: participant.socket_id.clone(),
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            role: participant.role,
            joined_at: participant.joined_at,
            has_media: participant.presence() == Presence::WithMedia,
            consumers: participant
                .consumers
                .iter()
                .map(|c| ConsumerView {
                    consumer_id: c.id.clone(),
                    producer_id: c.producer_id.clone(),
                    kind: c.kind,
                    attached: c.attached,
                    track: Arc::clone(&c.track),
                })
                .collect(),
        }
    }
}

/// Point-in-time copy of everything the UI renders
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioSnapshot {
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_socket_id: Option<SocketId>,
    pub camera_enabled: bool,
    pub microphone_enabled: bool,
    pub screen_enabled: bool,
    pub participants: Vec<ParticipantView>,
    pub pending_guests: Vec<GuestRequest>,
    pub admission: AdmissionState,
}

impl StudioSnapshot {
    #[must_use]
    pub fn participant(&self, socket_id: &SocketId) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| &p.socket_id == socket_id)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.participants.iter().map(|p| p.consumers.len()).sum()
    }
}

/// Non-blocking notices for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudioNotice {
    /// The server pushed an `error` event
    ServerError { message: String },
    /// A local capture or publish failed; the session is still usable
    MediaFailed { source: SourceKind, message: String },
    /// A guest asked to be let in (host only)
    GuestRequested(GuestRequest),
    AdmissionChanged(AdmissionState),
    /// The session is unusable and must be joined again
    SessionFailed { message: String },
    /// The signaling event stream ended while joined
    SignalingLost,
}
