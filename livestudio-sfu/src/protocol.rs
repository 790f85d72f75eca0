//! Media-routing server protocol
//!
//! Client requests, their replies and the events the server pushes, as
//! adjacently tagged JSON (`{"type": "...", "data": {...}}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use crate::rtp::MediaKind;
use crate::rtp::{DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, ProducerId, RoomId, SocketId, TransportId, UserId};

/// Local capture source a producer publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Webcam,
    Microphone,
    Screen,
}

impl SourceKind {
    pub const ALL: [Self; 3] = [Self::Webcam, Self::Microphone, Self::Screen];

    #[must_use]
    pub const fn media_kind(&self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Webcam | Self::Screen => MediaKind::Video,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Webcam => "webcam",
            Self::Microphone => "microphone",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    #[default]
    Guest,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "guest" => Ok(Self::Guest),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Transport direction, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// Server-side parameters a local transport is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Server answer to a consume request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Presence record of a room member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub socket_id: SocketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

/// A remote producer that can be consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: ProducerId,
    pub owner_socket_id: SocketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
}

impl NewProducer {
    pub fn new(producer_id: impl Into<ProducerId>, owner_socket_id: impl Into<SocketId>) -> Self {
        Self {
            producer_id: producer_id.into(),
            owner_socket_id: owner_socket_id.into(),
            kind: None,
        }
    }
}

/// A prospective guest asking the host to be let in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRequest {
    pub requester_socket_id: SocketId,
    pub display_name: String,
    pub room_id: RoomId,
    pub token: String,
    #[serde(default = "Utc::now")]
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: RoomId,
    pub display_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub socket_id: SocketId,
    pub router_rtp_capabilities: RtpCapabilities,
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
}

/// Client to server requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    JoinRoom(JoinRoom),
    CreateTransport {
        direction: Direction,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        source: SourceKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    CloseConsumer {
        consumer_id: ConsumerId,
    },
    CloseTransport {
        transport_id: TransportId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    GuestRequest {
        room_id: RoomId,
        display_name: String,
    },
    ApproveGuest {
        requester_socket_id: SocketId,
        room_id: RoomId,
        token: String,
    },
    DenyGuest {
        requester_socket_id: SocketId,
        room_id: RoomId,
    },
}

impl ClientRequest {
    /// Wire tag of the request, used in logs and timeouts
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "joinRoom",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
            Self::CloseProducer { .. } => "closeProducer",
            Self::CloseConsumer { .. } => "closeConsumer",
            Self::CloseTransport { .. } => "closeTransport",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::GuestRequest { .. } => "guestRequest",
            Self::ApproveGuest { .. } => "approveGuest",
            Self::DenyGuest { .. } => "denyGuest",
        }
    }
}

/// Server replies, one per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerReply {
    Joined(Joined),
    TransportCreated(TransportOptions),
    Produced { producer_id: ProducerId },
    Consumed(ConsumerOptions),
    Ack,
    Rejected { reason: String },
}

impl ServerReply {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Joined(_) => "joined",
            Self::TransportCreated(_) => "transportCreated",
            Self::Produced { .. } => "produced",
            Self::Consumed(_) => "consumed",
            Self::Ack => "ack",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Events pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full roster of the room
    StreamUpdate { participants: Vec<ParticipantInfo> },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft { socket_id: SocketId },
    NewProducer(NewProducer),
    ProducerClosed { producer_id: ProducerId },
    /// Producers that existed before the local participant joined
    ExistingProducers { producers: Vec<NewProducer> },
    GuestRequest(GuestRequest),
    GuestApproved { token: String },
    GuestDenied {
        #[serde(default)]
        reason: Option<String>,
    },
    Error { message: String },
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StreamUpdate { .. } => "streamUpdate",
            Self::ParticipantJoined(_) => "participantJoined",
            Self::ParticipantLeft { .. } => "participantLeft",
            Self::NewProducer(_) => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::ExistingProducers { .. } => "existingProducers",
            Self::GuestRequest(_) => "guestRequest",
            Self::GuestApproved { .. } => "guestApproved",
            Self::GuestDenied { .. } => "guestDenied",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_media_kind() {
        assert_eq!(SourceKind::Webcam.media_kind(), MediaKind::Video);
        assert_eq!(SourceKind::Screen.media_kind(), MediaKind::Video);
        assert_eq!(SourceKind::Microphone.media_kind(), MediaKind::Audio);
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("HOST".parse::<Role>(), Ok(Role::Host));
        assert_eq!("guest".parse::<Role>(), Ok(Role::Guest));
        assert!("viewer".parse::<Role>().is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let request = ClientRequest::CloseProducer {
            producer_id: ProducerId::from("p1"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "closeProducer");
        assert_eq!(json["data"]["producerId"], "p1");
        assert_eq!(request.name(), "closeProducer");
    }

    #[test]
    fn test_ack_reply_has_no_payload() {
        let reply: ServerReply = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
        assert_eq!(reply, ServerReply::Ack);
    }

    #[test]
    fn test_new_producer_event_from_wire() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"newProducer","data":{"producerId":"r1","ownerSocketId":"s1"}}"#,
        )
        .unwrap();
        assert_eq!(event, ServerEvent::NewProducer(NewProducer::new("r1", "s1")));
        assert_eq!(event.name(), "newProducer");
    }

    #[test]
    fn test_guest_request_defaults_timestamp() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"guestRequest","data":{"requesterSocketId":"g1","displayName":"Ana","roomId":"r","token":"t"}}"#,
        )
        .unwrap();
        let ServerEvent::GuestRequest(request) = event else {
            panic!("expected guest request");
        };
        assert_eq!(request.requester_socket_id.as_str(), "g1");
        assert!(request.requested_at <= Utc::now());
    }
}
