//! Seams to the platform media stack
//!
//! The core never touches codecs or sockets itself. Capture devices, local
//! transports and track handles are supplied by the embedding runtime through
//! these traits.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{ConsumerOptions, Direction, SourceKind, TransportOptions};
use crate::rtp::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};

/// A captured local track (camera, microphone or screen)
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Release the capture device. Does not count as the track ending.
    fn stop(&self);

    /// Resolves when the track ends on its own, e.g. the user stops sharing
    /// from the browser chrome
    fn ended(&self) -> BoxFuture<'static, ()>;
}

/// A track received from a remote participant
pub trait RemoteTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Release the local consumer resource
    fn stop(&self);
}

/// Platform capture devices
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire a track for `source`, failing with
    /// [`crate::Error::DevicePermissionDenied`] or
    /// [`crate::Error::DeviceUnavailable`]
    async fn acquire(&self, source: SourceKind) -> Result<Arc<dyn LocalTrack>>;
}

/// Platform WebRTC stack
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and header extensions the runtime can handle
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Build a local transport bound to server-side parameters
    async fn create_transport(
        &self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Box<dyn LocalTransport>>;
}

/// Local half of a send or receive transport
#[async_trait]
pub trait LocalTransport: Send + Sync {
    /// Local DTLS parameters relayed to the server on connect
    async fn dtls_parameters(&self) -> Result<DtlsParameters>;

    /// Attach a track for sending and describe the resulting RTP stream
    async fn send(&self, track: &Arc<dyn LocalTrack>) -> Result<RtpParameters>;

    /// Detach a previously sent track
    fn stop_sending(&self, track_id: &str);

    /// Bind a consumer to this transport and return its track
    async fn receive(&self, options: &ConsumerOptions) -> Result<Arc<dyn RemoteTrack>>;

    fn close(&self);
}
