use crate::protocol::{Direction, MediaKind, SourceKind};
use crate::types::SocketId;
use thiserror::Error;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Only the action that failed is affected; retrying it later may succeed
    Feature,
    /// The session is unusable and has to be left and joined again
    Session,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Router capabilities have not been loaded")]
    NotLoaded,

    #[error("Router capabilities are already loaded")]
    AlreadyLoaded,

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("Cannot produce {0:?} media with the negotiated codecs")]
    CannotProduce(MediaKind),

    #[error("{0} is still being turned off")]
    SourceBusy(SourceKind),

    #[error("Permission denied for {0} capture")]
    DevicePermissionDenied(SourceKind),

    #[error("{source_kind} capture device unavailable: {reason}")]
    DeviceUnavailable {
        source_kind: SourceKind,
        reason: String,
    },

    #[error("Failed to create {direction} transport: {reason}")]
    TransportFailed { direction: Direction, reason: String },

    #[error("Failed to join room: {0}")]
    JoinFailed(Box<Error>),

    #[error("Produce rejected: {0}")]
    ProduceRejected(String),

    #[error("Consume rejected: {0}")]
    ConsumeRejected(String),

    #[error("Request rejected by server: {0}")]
    Rejected(String),

    #[error("No pending guest request from {0}")]
    UnknownGuestRequest(SocketId),

    #[error("Only the host can resolve guest requests")]
    NotHost,

    #[error("Session has not joined the room")]
    NotJoined,

    #[error("Session has been left")]
    SessionClosed,

    #[error("Request {0} timed out")]
    Timeout(&'static str),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::JoinFailed(_) | Self::ChannelClosed | Self::SessionClosed => Severity::Session,
            _ => Severity::Feature,
        }
    }

    /// Whether the user can fix this by retrying the same action
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.severity(), Severity::Feature)
            && !matches!(self, Self::NotLoaded | Self::AlreadyLoaded)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
