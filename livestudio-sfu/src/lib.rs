//! Live studio media-routing client
//!
//! The client half of a studio built on a Selective Forwarding Unit: each
//! participant publishes its camera, microphone and screen once, and the
//! server forwards them to everyone else. This crate keeps the local view of
//! that room consistent while signaling events arrive in any order.
//!
//! ## Architecture
//!
//! - **`Session`**: join/leave lifecycle, publishing toggles, consumption of
//!   remote producers and guest admission
//! - **`Device` / `CapabilityNegotiator`**: one-time load of router RTP
//!   capabilities and the `can_produce` answers derived from them
//! - **`Transport`**: lazily connected send and receive transports
//! - **`ProducerRegistry` / `ConsumerLedger` / `ParticipantDirectory`**:
//!   local bookkeeping of what is published, what is consumed and who is present
//! - **`Signaling`**: typed request/reply layer over a [`SignalingChannel`]
//! - **`JsonLineChannel`**: newline-delimited JSON signaling over any byte stream
//! - **`LoopbackSfu` / `SimulatedMedia`**: an in-process server and media stack
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livestudio_sfu::{LoopbackSfu, Session, SessionConfig, SimulatedMedia};
//!
//! let sfu = LoopbackSfu::new();
//! let (channel, events) = sfu.connect();
//! let media = Arc::new(SimulatedMedia::new());
//! let session = Session::new(config, Arc::new(channel), media.clone(), media);
//! tokio::spawn(session.clone().run(events));
//! session.join().await?;
//! session.enable_camera().await?;
//! ```

mod admission;
mod channel;
mod config;
mod consumer;
mod device;
mod directory;
mod error;
mod loopback;
mod media;
mod presentation;
mod producer;
mod protocol;
mod rtp;
mod session;
mod signaling;
mod transport;
mod types;

#[cfg(test)]
mod test_helpers;

pub use admission::{AdmissionState, GuestAdmission};
pub use channel::{ChannelOptions, ClientEnvelope, JsonLineChannel, ServerEnvelope};
pub use config::SessionConfig;
pub use consumer::{Admission, ConsumerLedger, RemoteConsumer};
pub use device::{CapabilityNegotiator, Device};
pub use directory::{Participant, ParticipantDirectory, Presence};
pub use error::{Error, Result, Severity};
pub use loopback::{
    default_capabilities, LoopbackChannel, LoopbackSfu, LoopbackStats, SimulatedMedia,
    SimulatedTrack,
};
pub use media::{LocalTrack, LocalTransport, MediaCapture, MediaEngine, RemoteTrack};
pub use presentation::{
    ConsumerView, ParticipantView, SessionPhase, StudioNotice, StudioSnapshot,
};
pub use producer::{LocalProducer, ProducerFlags, ProducerRegistry};
pub use protocol::{
    ClientRequest, ConsumerOptions, Direction, GuestRequest, JoinRoom, Joined, NewProducer,
    ParticipantInfo, Role, ServerEvent, ServerReply, SourceKind, TransportOptions,
};
pub use rtp::{
    CodecParameters, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtension, RtpParameters,
};
pub use session::Session;
pub use signaling::{Signaling, SignalingChannel};
pub use transport::Transport;
pub use types::{ConsumerId, ProducerId, RoomId, SocketId, TransportId, UserId};
