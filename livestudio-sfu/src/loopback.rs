//! In-process media-routing server and simulated media stack
//!
//! [`LoopbackSfu`] speaks the full signaling protocol against any number of
//! connected clients without touching the network. [`SimulatedMedia`] stands
//! in for capture devices and the platform WebRTC stack. Together they let a
//! [`crate::Session`] run end to end in tests and in the demo binary.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ClientEnvelope, ServerEnvelope};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, LocalTransport, MediaCapture, MediaEngine, RemoteTrack};
use crate::protocol::{
    ClientRequest, ConsumerOptions, Direction, GuestRequest, JoinRoom, Joined, NewProducer,
    ParticipantInfo, Role, ServerEvent, ServerReply, SourceKind, TransportOptions,
};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtension, RtpParameters,
};
use crate::signaling::SignalingChannel;
use crate::types::{ConsumerId, ProducerId, RoomId, SocketId, TransportId};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Opus, VP8 with RTX and H264, plus the usual header extensions
#[must_use]
pub fn default_capabilities() -> RtpCapabilities {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
    };
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000)
                .with_channels(2)
                .with_payload_type(100),
            RtpCodecCapability::new(MediaKind::Video, "video/VP8", 90000).with_payload_type(101),
            RtpCodecCapability::new(MediaKind::Video, "video/rtx", 90000)
                .with_payload_type(102)
                .with_parameter("apt", 101),
            RtpCodecCapability::new(MediaKind::Video, "video/H264", 90000)
                .with_payload_type(103)
                .with_parameter("packetization-mode", 1)
                .with_parameter("profile-level-id", "42e01f"),
        ],
        header_extensions: vec![
            ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            ext(
                MediaKind::Video,
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
                4,
            ),
        ],
    }
}

fn codec_parameters(capabilities: &RtpCapabilities, kind: MediaKind) -> Option<RtpCodecParameters> {
    capabilities
        .codecs
        .iter()
        .find(|c| c.kind == kind && !c.is_rtx())
        .map(|c| RtpCodecParameters {
            mime_type: c.mime_type.clone(),
            payload_type: c.preferred_payload_type.unwrap_or(96),
            clock_rate: c.clock_rate,
            channels: c.channels,
            parameters: c.parameters.clone(),
        })
}

fn fingerprint() -> DtlsFingerprint {
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value: nanoid::nanoid!(32),
    }
}

// ------------------------------------------------------------------------
// Simulated media
// ------------------------------------------------------------------------

/// A track with no media behind it. Serves as both local and remote track.
#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
    ended: CancellationToken,
}

impl SimulatedTrack {
    #[must_use]
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Self::with_id(nanoid::nanoid!(10), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
            ended: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// End the track from outside, like a browser "stop sharing" button
    pub fn end(&self) {
        self.ended.cancel();
    }
}

impl LocalTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn ended(&self) -> BoxFuture<'static, ()> {
        let ended = self.ended.clone();
        Box::pin(async move { ended.cancelled().await })
    }
}

impl RemoteTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct MediaFaults {
    denied: HashSet<SourceKind>,
    unavailable: HashMap<SourceKind, String>,
    transport_failures: HashSet<Direction>,
}

/// Capture devices and WebRTC stack that only move bookkeeping around
#[derive(Debug)]
pub struct SimulatedMedia {
    capabilities: RtpCapabilities,
    faults: Mutex<MediaFaults>,
    captured: Mutex<Vec<(SourceKind, Arc<SimulatedTrack>)>>,
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMedia {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        Self {
            capabilities,
            faults: Mutex::new(MediaFaults::default()),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Make the user refuse permission for `source`
    pub fn deny(&self, source: SourceKind) {
        self.faults.lock().denied.insert(source);
    }

    pub fn make_unavailable(&self, source: SourceKind, reason: impl Into<String>) {
        self.faults.lock().unavailable.insert(source, reason.into());
    }

    /// Undo [`Self::deny`] and [`Self::make_unavailable`]
    pub fn restore(&self, source: SourceKind) {
        let mut faults = self.faults.lock();
        faults.denied.remove(&source);
        faults.unavailable.remove(&source);
    }

    pub fn fail_transport(&self, direction: Direction) {
        self.faults.lock().transport_failures.insert(direction);
    }

    /// Number of successful captures of `source` so far
    #[must_use]
    pub fn capture_count(&self, source: SourceKind) -> usize {
        self.captured.lock().iter().filter(|(s, _)| *s == source).count()
    }

    /// Most recent track captured for `source`
    #[must_use]
    pub fn last_capture(&self, source: SourceKind) -> Option<Arc<SimulatedTrack>> {
        self.captured
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| *s == source)
            .map(|(_, t)| Arc::clone(t))
    }

    /// End the latest capture of `source` externally. False if none.
    pub fn end_capture(&self, source: SourceKind) -> bool {
        match self.last_capture(source) {
            Some(track) => {
                track.end();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MediaCapture for SimulatedMedia {
    async fn acquire(&self, source: SourceKind) -> Result<Arc<dyn LocalTrack>> {
        {
            let faults = self.faults.lock();
            if faults.denied.contains(&source) {
                return Err(Error::DevicePermissionDenied(source));
            }
            if let Some(reason) = faults.unavailable.get(&source) {
                return Err(Error::DeviceUnavailable {
                    source_kind: source,
                    reason: reason.clone(),
                });
            }
        }
        let track = SimulatedTrack::new(source.media_kind());
        debug!(%source, track_id = %track.id(), "Simulated capture started");
        self.captured.lock().push((source, Arc::clone(&track)));
        Ok(track)
    }
}

#[async_trait]
impl MediaEngine for SimulatedMedia {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Box<dyn LocalTransport>> {
        if self.faults.lock().transport_failures.contains(&direction) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no ICE candidates gathered",
            )));
        }
        Ok(Box::new(SimulatedTransport {
            id: options.id.clone(),
            capabilities: self.capabilities.clone(),
            sending: Mutex::new(HashSet::new()),
            next_ssrc: AtomicU32::new(1000),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedTransport {
    id: TransportId,
    capabilities: RtpCapabilities,
    sending: Mutex<HashSet<String>>,
    next_ssrc: AtomicU32,
    closed: AtomicBool,
}

#[async_trait]
impl LocalTransport for SimulatedTransport {
    async fn dtls_parameters(&self) -> Result<DtlsParameters> {
        Ok(DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![fingerprint()],
        })
    }

    async fn send(&self, track: &Arc<dyn LocalTrack>) -> Result<RtpParameters> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Protocol(format!("transport {} is closed", self.id)));
        }
        let codec = codec_parameters(&self.capabilities, track.kind())
            .ok_or(Error::CannotProduce(track.kind()))?;
        let mid = {
            let mut sending = self.sending.lock();
            sending.insert(track.id().to_string());
            sending.len().to_string()
        };
        Ok(RtpParameters {
            mid: Some(mid),
            codecs: vec![codec],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(self.next_ssrc.fetch_add(1, Ordering::Relaxed)),
                ..Default::default()
            }],
        })
    }

    fn stop_sending(&self, track_id: &str) {
        self.sending.lock().remove(track_id);
    }

    async fn receive(&self, options: &ConsumerOptions) -> Result<Arc<dyn RemoteTrack>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Protocol(format!("transport {} is closed", self.id)));
        }
        Ok(SimulatedTrack::with_id(options.id.as_str(), options.kind))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sending.lock().clear();
    }
}

// ------------------------------------------------------------------------
// Loopback server
// ------------------------------------------------------------------------

/// Counters for assertions and the demo printout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopbackStats {
    pub connections: usize,
    pub members: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
    pub pending_guests: usize,
}

struct Member {
    room_id: RoomId,
    info: ParticipantInfo,
}

struct PeerEntry {
    events: mpsc::Sender<ServerEvent>,
    member: Option<Member>,
}

struct TransportEntry {
    owner: SocketId,
    direction: Direction,
    connected: bool,
}

struct ProducerEntry {
    owner: SocketId,
    room_id: RoomId,
    kind: MediaKind,
    source: SourceKind,
}

struct ConsumerEntry {
    owner: SocketId,
    producer_id: ProducerId,
    paused: bool,
}

struct PendingGuest {
    room_id: RoomId,
    token: String,
}

struct Approval {
    requester: SocketId,
    room_id: RoomId,
}

struct ServerState {
    capabilities: RtpCapabilities,
    peers: IndexMap<SocketId, PeerEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: IndexMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    pending_guests: HashMap<SocketId, PendingGuest>,
    approvals: HashMap<String, Approval>,
    next_port: u16,
}

fn rejected(reason: impl Into<String>) -> ServerReply {
    ServerReply::Rejected {
        reason: reason.into(),
    }
}

impl ServerState {
    fn new(capabilities: RtpCapabilities) -> Self {
        Self {
            capabilities,
            peers: IndexMap::new(),
            transports: HashMap::new(),
            producers: IndexMap::new(),
            consumers: HashMap::new(),
            pending_guests: HashMap::new(),
            approvals: HashMap::new(),
            next_port: 40000,
        }
    }

    fn member(&self, socket_id: &SocketId) -> Option<&Member> {
        self.peers.get(socket_id)?.member.as_ref()
    }

    fn room_of(&self, socket_id: &SocketId) -> Option<RoomId> {
        self.member(socket_id).map(|m| m.room_id.clone())
    }

    fn roster(&self, room_id: &RoomId) -> Vec<ParticipantInfo> {
        self.peers
            .values()
            .filter_map(|p| p.member.as_ref())
            .filter(|m| &m.room_id == room_id)
            .map(|m| m.info.clone())
            .collect()
    }

    fn is_host(&self, socket_id: &SocketId, room_id: &RoomId) -> bool {
        self.member(socket_id)
            .is_some_and(|m| &m.room_id == room_id && m.info.role == Role::Host)
    }

    fn send(&self, to: &SocketId, event: ServerEvent) {
        let Some(peer) = self.peers.get(to) else {
            return;
        };
        let name = event.name();
        match peer.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(socket_id = %to, event = name, "Event buffer full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(socket_id = %to, event = name, "Event receiver gone");
            }
        }
    }

    fn broadcast(&self, room_id: &RoomId, except: Option<&SocketId>, event: &ServerEvent) {
        let recipients: Vec<SocketId> = self
            .peers
            .iter()
            .filter(|(id, p)| {
                Some(*id) != except && p.member.as_ref().is_some_and(|m| &m.room_id == room_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for socket_id in recipients {
            self.send(&socket_id, event.clone());
        }
    }

    fn owned_transport(&self, from: &SocketId, id: &TransportId) -> Option<&TransportEntry> {
        self.transports.get(id).filter(|t| &t.owner == from)
    }

    fn handle(&mut self, from: &SocketId, request: ClientRequest) -> ServerReply {
        match request {
            ClientRequest::JoinRoom(join) => self.join(from, join),
            ClientRequest::CreateTransport { direction } => self.create_transport(from, direction),
            ClientRequest::ConnectTransport { transport_id, .. } => {
                match self.transports.get_mut(&transport_id) {
                    Some(t) if &t.owner == from && !t.connected => {
                        t.connected = true;
                        ServerReply::Ack
                    }
                    Some(t) if &t.owner == from => rejected("transport already connected"),
                    _ => rejected("unknown transport"),
                }
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                source,
                ..
            } => self.produce(from, &transport_id, kind, source),
            ClientRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => self.consume(from, &transport_id, &producer_id, &rtp_capabilities),
            ClientRequest::ResumeConsumer { consumer_id } => {
                match self.consumers.get_mut(&consumer_id) {
                    Some(c) if &c.owner == from => {
                        c.paused = false;
                        ServerReply::Ack
                    }
                    _ => rejected("unknown consumer"),
                }
            }
            ClientRequest::CloseProducer { producer_id } => {
                if self.producers.get(&producer_id).is_some_and(|p| &p.owner == from) {
                    self.close_producer(&producer_id);
                    ServerReply::Ack
                } else {
                    rejected("unknown producer")
                }
            }
            ClientRequest::CloseConsumer { consumer_id } => {
                if self.consumers.get(&consumer_id).is_some_and(|c| &c.owner == from) {
                    self.consumers.remove(&consumer_id);
                    ServerReply::Ack
                } else {
                    rejected("unknown consumer")
                }
            }
            ClientRequest::CloseTransport { transport_id } => {
                if self.owned_transport(from, &transport_id).is_some() {
                    self.transports.remove(&transport_id);
                    ServerReply::Ack
                } else {
                    rejected("unknown transport")
                }
            }
            ClientRequest::LeaveRoom { room_id } => {
                if self.room_of(from).as_ref() == Some(&room_id) {
                    self.depart(from);
                    ServerReply::Ack
                } else {
                    rejected("not in room")
                }
            }
            ClientRequest::GuestRequest {
                room_id,
                display_name,
            } => self.guest_request(from, room_id, display_name),
            ClientRequest::ApproveGuest {
                requester_socket_id,
                room_id,
                token,
            } => self.approve_guest(from, &requester_socket_id, &room_id, token),
            ClientRequest::DenyGuest {
                requester_socket_id,
                room_id,
            } => {
                if !self.is_host(from, &room_id) {
                    return rejected("only the host can deny guests");
                }
                match self.pending_guests.get(&requester_socket_id) {
                    Some(pending) if pending.room_id == room_id => {
                        self.pending_guests.remove(&requester_socket_id);
                        self.send(
                            &requester_socket_id,
                            ServerEvent::GuestDenied {
                                reason: Some("denied by host".to_string()),
                            },
                        );
                        ServerReply::Ack
                    }
                    _ => rejected("no such guest request"),
                }
            }
        }
    }

    fn join(&mut self, from: &SocketId, join: JoinRoom) -> ServerReply {
        if self.member(from).is_some() {
            return rejected("already joined");
        }
        if join.role == Role::Guest {
            let admitted = join
                .token
                .as_ref()
                .and_then(|t| self.approvals.get(t))
                .is_some_and(|a| &a.requester == from && a.room_id == join.room_id);
            if !admitted {
                return rejected("guest admission required");
            }
            if let Some(token) = &join.token {
                self.approvals.remove(token);
            }
        }

        let info = ParticipantInfo {
            socket_id: from.clone(),
            user_id: join.user_id,
            display_name: join.display_name,
            role: join.role,
        };
        let participants = self.roster(&join.room_id);
        let existing: Vec<NewProducer> = self
            .producers
            .iter()
            .filter(|(_, p)| p.room_id == join.room_id)
            .map(|(id, p)| NewProducer {
                producer_id: id.clone(),
                owner_socket_id: p.owner.clone(),
                kind: Some(p.kind),
            })
            .collect();

        let Some(peer) = self.peers.get_mut(from) else {
            return rejected("connection closed");
        };
        peer.member = Some(Member {
            room_id: join.room_id.clone(),
            info: info.clone(),
        });

        info!(room_id = %join.room_id, socket_id = %from, role = %info.role, "Participant joined room");

        self.broadcast(&join.room_id, Some(from), &ServerEvent::ParticipantJoined(info));
        let roster = ServerEvent::StreamUpdate {
            participants: self.roster(&join.room_id),
        };
        self.broadcast(&join.room_id, None, &roster);
        if !existing.is_empty() {
            self.send(from, ServerEvent::ExistingProducers { producers: existing });
        }

        ServerReply::Joined(Joined {
            socket_id: from.clone(),
            router_rtp_capabilities: self.capabilities.clone(),
            participants,
        })
    }

    fn create_transport(&mut self, from: &SocketId, direction: Direction) -> ServerReply {
        if self.member(from).is_none() {
            return rejected("not in a room");
        }
        let id = TransportId::random();
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        self.transports.insert(
            id.clone(),
            TransportEntry {
                owner: from.clone(),
                direction,
                connected: false,
            },
        );
        debug!(socket_id = %from, transport_id = %id, %direction, "Transport allocated");

        ServerReply::TransportCreated(TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                port,
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![fingerprint()],
            },
        })
    }

    fn produce(
        &mut self,
        from: &SocketId,
        transport_id: &TransportId,
        kind: MediaKind,
        source: SourceKind,
    ) -> ServerReply {
        match self.owned_transport(from, transport_id) {
            Some(t) if t.direction == Direction::Send && t.connected => {}
            Some(_) => return rejected("transport cannot send"),
            None => return rejected("unknown transport"),
        }
        let Some(room_id) = self.room_of(from) else {
            return rejected("not in a room");
        };
        if self
            .producers
            .values()
            .any(|p| &p.owner == from && p.source == source)
        {
            return rejected(format!("{source} already published"));
        }

        let producer_id = ProducerId::random();
        self.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                owner: from.clone(),
                room_id: room_id.clone(),
                kind,
                source,
            },
        );
        info!(socket_id = %from, %producer_id, %source, "Producer created");

        let event = ServerEvent::NewProducer(NewProducer {
            producer_id: producer_id.clone(),
            owner_socket_id: from.clone(),
            kind: Some(kind),
        });
        self.broadcast(&room_id, Some(from), &event);
        ServerReply::Produced { producer_id }
    }

    fn consume(
        &mut self,
        from: &SocketId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> ServerReply {
        match self.owned_transport(from, transport_id) {
            Some(t) if t.direction == Direction::Recv => {}
            Some(_) => return rejected("transport cannot receive"),
            None => return rejected("unknown transport"),
        }
        let Some(producer) = self.producers.get(producer_id) else {
            return rejected("unknown producer");
        };
        if &producer.owner == from {
            return rejected("cannot consume own producer");
        }
        if self.room_of(from).as_ref() != Some(&producer.room_id) {
            return rejected("producer is in another room");
        }
        let kind = producer.kind;
        if !rtp_capabilities.supports(kind) {
            return rejected(format!("cannot consume {kind}"));
        }
        let Some(codec) = codec_parameters(&self.capabilities, kind) else {
            return rejected(format!("router has no {kind} codec"));
        };

        let consumer_id = ConsumerId::random();
        self.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                owner: from.clone(),
                producer_id: producer_id.clone(),
                paused: true,
            },
        );
        debug!(socket_id = %from, %consumer_id, %producer_id, "Consumer created paused");

        ServerReply::Consumed(ConsumerOptions {
            id: consumer_id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs: vec![codec],
                encodings: vec![RtpEncodingParameters::default()],
            },
        })
    }

    fn close_producer(&mut self, producer_id: &ProducerId) {
        let Some(producer) = self.producers.shift_remove(producer_id) else {
            return;
        };
        self.consumers.retain(|_, c| &c.producer_id != producer_id);
        info!(%producer_id, owner = %producer.owner, "Producer closed");
        self.broadcast(
            &producer.room_id,
            Some(&producer.owner),
            &ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            },
        );
    }

    fn guest_request(&mut self, from: &SocketId, room_id: RoomId, display_name: String) -> ServerReply {
        if self.member(from).is_some() {
            return rejected("already joined");
        }
        let hosts: Vec<SocketId> = self
            .peers
            .keys()
            .filter(|id| self.is_host(id, &room_id))
            .cloned()
            .collect();
        if hosts.is_empty() {
            return rejected("no host in room");
        }

        let token = nanoid::nanoid!();
        self.pending_guests.insert(
            from.clone(),
            PendingGuest {
                room_id: room_id.clone(),
                token: token.clone(),
            },
        );
        info!(%room_id, requester = %from, "Guest requested admission");

        let event = ServerEvent::GuestRequest(GuestRequest {
            requester_socket_id: from.clone(),
            display_name,
            room_id,
            token,
            requested_at: Utc::now(),
        });
        for host in hosts {
            self.send(&host, event.clone());
        }
        ServerReply::Ack
    }

    fn approve_guest(
        &mut self,
        from: &SocketId,
        requester: &SocketId,
        room_id: &RoomId,
        token: String,
    ) -> ServerReply {
        if !self.is_host(from, room_id) {
            return rejected("only the host can approve guests");
        }
        match self.pending_guests.get(requester) {
            Some(p) if &p.room_id == room_id && p.token == token => {}
            _ => return rejected("no such guest request"),
        }
        self.pending_guests.remove(requester);
        self.approvals.insert(
            token.clone(),
            Approval {
                requester: requester.clone(),
                room_id: room_id.clone(),
            },
        );
        info!(%room_id, %requester, "Guest approved");
        self.send(requester, ServerEvent::GuestApproved { token });
        ServerReply::Ack
    }

    /// Remove a member from its room along with everything it owns
    fn depart(&mut self, socket_id: &SocketId) {
        let member = self
            .peers
            .get_mut(socket_id)
            .and_then(|p| p.member.take());
        let owned: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.owner == socket_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in owned {
            self.close_producer(&producer_id);
        }
        self.consumers.retain(|_, c| &c.owner != socket_id);
        self.transports.retain(|_, t| &t.owner != socket_id);
        self.pending_guests.remove(socket_id);

        if let Some(member) = member {
            info!(room_id = %member.room_id, %socket_id, "Participant left room");
            self.broadcast(
                &member.room_id,
                None,
                &ServerEvent::ParticipantLeft {
                    socket_id: socket_id.clone(),
                },
            );
        }
    }
}

/// In-process media-routing server
#[derive(Clone)]
pub struct LoopbackSfu {
    state: Arc<Mutex<ServerState>>,
    event_buffer: usize,
}

impl Default for LoopbackSfu {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSfu {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new(capabilities))),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    #[must_use]
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    /// Open a client connection: a channel for requests and the stream of
    /// events pushed to it
    #[must_use]
    pub fn connect(&self) -> (LoopbackChannel, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let socket_id = SocketId::random();
        self.state.lock().peers.insert(
            socket_id.clone(),
            PeerEntry {
                events: tx,
                member: None,
            },
        );
        debug!(%socket_id, "Loopback connection opened");
        (
            LoopbackChannel {
                server: self.clone(),
                socket_id,
            },
            rx,
        )
    }

    /// Drop a connection as if its socket closed. The client's event stream
    /// ends and its requests fail with [`Error::ChannelClosed`].
    pub fn disconnect(&self, socket_id: &SocketId) {
        let mut state = self.state.lock();
        state.depart(socket_id);
        if state.peers.shift_remove(socket_id).is_some() {
            debug!(%socket_id, "Loopback connection closed");
        }
    }

    /// Push an `error` event to one connection
    pub fn push_error(&self, socket_id: &SocketId, message: impl Into<String>) {
        self.state.lock().send(
            socket_id,
            ServerEvent::Error {
                message: message.into(),
            },
        );
    }

    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        let state = self.state.lock();
        LoopbackStats {
            connections: state.peers.len(),
            members: state.peers.values().filter(|p| p.member.is_some()).count(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            paused_consumers: state.consumers.values().filter(|c| c.paused).count(),
            pending_guests: state.pending_guests.len(),
        }
    }

    /// Serve one client over a newline-delimited JSON stream until either
    /// side closes it. The wire format is the one
    /// [`crate::JsonLineChannel`] speaks.
    pub async fn serve<T>(&self, io: T, max_frame_len: usize) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (channel, mut events) = self.connect();
        let socket_id = channel.socket_id().clone();
        let mut framed = Framed::new(io, LinesCodec::new_with_max_length(max_frame_len));

        let result = loop {
            let outbound = tokio::select! {
                line = framed.next() => {
                    let line = match line {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => break Err(Error::Protocol(e.to_string())),
                        None => break Ok(()),
                    };
                    let envelope: ClientEnvelope = match serde_json::from_str(&line) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(%socket_id, error = %e, "Malformed client message");
                            continue;
                        }
                    };
                    match envelope.id {
                        Some(id) => match self.handle(&socket_id, envelope.request) {
                            Ok(reply) => ServerEnvelope::Reply { id, reply },
                            Err(e) => break Err(e),
                        },
                        None => {
                            channel.post(envelope.request);
                            continue;
                        }
                    }
                }
                event = events.recv() => match event {
                    Some(event) => ServerEnvelope::Event { event },
                    None => break Ok(()),
                },
            };
            let line = serde_json::to_string(&outbound)?;
            if let Err(e) = framed.send(line).await {
                break Err(Error::Protocol(e.to_string()));
            }
        };

        self.disconnect(&socket_id);
        result
    }

    fn handle(&self, from: &SocketId, request: ClientRequest) -> Result<ServerReply> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(from) {
            return Err(Error::ChannelClosed);
        }
        Ok(state.handle(from, request))
    }
}

/// A client's connection to a [`LoopbackSfu`]
#[derive(Clone)]
pub struct LoopbackChannel {
    server: LoopbackSfu,
    socket_id: SocketId,
}

impl LoopbackChannel {
    /// Connection id the server assigned; also the participant id once joined
    #[must_use]
    pub const fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn request(&self, request: ClientRequest) -> Result<ServerReply> {
        // A real round trip always suspends
        tokio::task::yield_now().await;
        self.server.handle(&self.socket_id, request)
    }

    fn post(&self, request: ClientRequest) {
        let name = request.name();
        match self.server.handle(&self.socket_id, request) {
            Ok(ServerReply::Rejected { reason }) => {
                debug!(socket_id = %self.socket_id, request = name, %reason, "Posted request rejected");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(socket_id = %self.socket_id, request = name, error = %e, "Posted request dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(role: Role, token: Option<String>) -> ClientRequest {
        ClientRequest::JoinRoom(JoinRoom {
            room_id: RoomId::from("studio"),
            display_name: "someone".to_string(),
            role,
            user_id: None,
            token,
        })
    }

    #[tokio::test]
    async fn test_guest_needs_approval_to_join() {
        let sfu = LoopbackSfu::new();
        let (host, _host_events) = sfu.connect();
        let (guest, mut guest_events) = sfu.connect();

        assert!(matches!(host.request(join(Role::Host, None)).await.unwrap(), ServerReply::Joined(_)));
        assert!(matches!(
            guest.request(join(Role::Guest, None)).await.unwrap(),
            ServerReply::Rejected { .. }
        ));

        let reply = guest
            .request(ClientRequest::GuestRequest {
                room_id: RoomId::from("studio"),
                display_name: "Ana".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, ServerReply::Ack);
        assert_eq!(sfu.stats().pending_guests, 1);

        let token = sfu.state.lock().pending_guests[guest.socket_id()].token.clone();
        let reply = host
            .request(ClientRequest::ApproveGuest {
                requester_socket_id: guest.socket_id().clone(),
                room_id: RoomId::from("studio"),
                token: token.clone(),
            })
            .await
            .unwrap();
        assert_eq!(reply, ServerReply::Ack);
        assert_eq!(guest_events.recv().await, Some(ServerEvent::GuestApproved { token: token.clone() }));

        let reply = guest.request(join(Role::Guest, Some(token))).await.unwrap();
        let ServerReply::Joined(joined) = reply else {
            panic!("guest should be admitted, got {reply:?}");
        };
        assert_eq!(joined.participants.len(), 1);
        assert_eq!(sfu.stats().members, 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() {
        let sfu = LoopbackSfu::new();
        let (channel, mut events) = sfu.connect();
        sfu.disconnect(channel.socket_id());

        assert!(events.recv().await.is_none());
        assert!(matches!(
            channel.request(join(Role::Host, None)).await,
            Err(Error::ChannelClosed)
        ));
        assert_eq!(sfu.stats(), LoopbackStats::default());
    }

    #[tokio::test]
    async fn test_simulated_capture_faults() {
        let media = SimulatedMedia::new();
        media.deny(SourceKind::Webcam);
        media.make_unavailable(SourceKind::Screen, "no display");

        assert!(matches!(
            media.acquire(SourceKind::Webcam).await,
            Err(Error::DevicePermissionDenied(SourceKind::Webcam))
        ));
        assert!(matches!(
            media.acquire(SourceKind::Screen).await,
            Err(Error::DeviceUnavailable { source_kind: SourceKind::Screen, .. })
        ));

        media.restore(SourceKind::Webcam);
        let track = media.acquire(SourceKind::Webcam).await.unwrap();
        assert_eq!(track.kind(), MediaKind::Video);
        assert_eq!(media.capture_count(SourceKind::Webcam), 1);
        assert!(media.end_capture(SourceKind::Webcam));
        assert!(!media.end_capture(SourceKind::Microphone));
    }
}
