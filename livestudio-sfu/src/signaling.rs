//! Signaling channel
//!
//! [`SignalingChannel`] is the raw request/reply + fire-and-forget seam to the
//! media-routing server. [`Signaling`] wraps it with one typed method per
//! protocol request and turns `rejected` replies into errors.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{
    ClientRequest, ConsumerOptions, Direction, JoinRoom, Joined, MediaKind, ServerReply,
    SourceKind, TransportOptions,
};
use crate::rtp::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, ProducerId, RoomId, SocketId, TransportId};

/// Bidirectional transport to the media-routing server.
///
/// Push events travel separately, as a stream of
/// [`crate::protocol::ServerEvent`] handed to [`crate::Session::run`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its reply
    async fn request(&self, request: ClientRequest) -> Result<ServerReply>;

    /// Send a request without waiting for anything. Never blocks.
    fn post(&self, request: ClientRequest);
}

/// Typed client over a [`SignalingChannel`]
#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
}

impl Signaling {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    async fn call(&self, request: ClientRequest) -> Result<ServerReply> {
        let name = request.name();
        match self.channel.request(request).await? {
            ServerReply::Rejected { reason } => {
                debug!(request = name, %reason, "Request rejected");
                Err(Error::Rejected(reason))
            }
            reply => Ok(reply),
        }
    }

    async fn ack(&self, request: ClientRequest) -> Result<()> {
        let name = request.name();
        match self.call(request).await? {
            ServerReply::Ack => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    pub fn post(&self, request: ClientRequest) {
        self.channel.post(request);
    }

    pub async fn join_room(&self, join: JoinRoom) -> Result<Joined> {
        match self.call(ClientRequest::JoinRoom(join)).await? {
            ServerReply::Joined(joined) => Ok(joined),
            other => Err(unexpected("joinRoom", &other)),
        }
    }

    pub async fn create_transport(&self, direction: Direction) -> Result<TransportOptions> {
        match self.call(ClientRequest::CreateTransport { direction }).await? {
            ServerReply::TransportCreated(options) => Ok(options),
            other => Err(unexpected("createTransport", &other)),
        }
    }

    pub async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.ack(ClientRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters,
        })
        .await
    }

    pub async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        source: SourceKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let request = ClientRequest::Produce {
            transport_id: transport_id.clone(),
            kind,
            source,
            rtp_parameters,
        };
        match self.call(request).await {
            Ok(ServerReply::Produced { producer_id }) => Ok(producer_id),
            Ok(other) => Err(unexpected("produce", &other)),
            Err(Error::Rejected(reason)) => Err(Error::ProduceRejected(reason)),
            Err(e) => Err(e),
        }
    }

    pub async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions> {
        let request = ClientRequest::Consume {
            transport_id: transport_id.clone(),
            producer_id: producer_id.clone(),
            rtp_capabilities,
        };
        match self.call(request).await {
            Ok(ServerReply::Consumed(options)) => Ok(options),
            Ok(other) => Err(unexpected("consume", &other)),
            Err(Error::Rejected(reason)) => Err(Error::ConsumeRejected(reason)),
            Err(e) => Err(e),
        }
    }

    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        self.ack(ClientRequest::ResumeConsumer {
            consumer_id: consumer_id.clone(),
        })
        .await
    }

    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        self.ack(ClientRequest::CloseProducer {
            producer_id: producer_id.clone(),
        })
        .await
    }

    pub async fn request_admission(&self, room_id: &RoomId, display_name: &str) -> Result<()> {
        self.ack(ClientRequest::GuestRequest {
            room_id: room_id.clone(),
            display_name: display_name.to_string(),
        })
        .await
    }

    pub async fn approve_guest(
        &self,
        requester_socket_id: &SocketId,
        room_id: &RoomId,
        token: &str,
    ) -> Result<()> {
        self.ack(ClientRequest::ApproveGuest {
            requester_socket_id: requester_socket_id.clone(),
            room_id: room_id.clone(),
            token: token.to_string(),
        })
        .await
    }
}

fn unexpected(request: &'static str, reply: &ServerReply) -> Error {
    Error::Protocol(format!("unexpected {} reply to {request}", reply.name()))
}
