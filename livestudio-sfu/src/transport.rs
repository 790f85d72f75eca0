//! Send and receive transports
//!
//! Each transport pairs the server-side parameters with a local transport from
//! the [`MediaEngine`]. The DTLS `connect` step runs lazily on first use and
//! exactly once; concurrent first users wait on the same handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::media::{LocalTrack, LocalTransport, MediaEngine, RemoteTrack};
use crate::protocol::{ConsumerOptions, Direction, SourceKind};
use crate::rtp::RtpCapabilities;
use crate::signaling::Signaling;
use crate::types::{ProducerId, TransportId};

pub struct Transport {
    id: TransportId,
    direction: Direction,
    local: Box<dyn LocalTransport>,
    connected: OnceCell<()>,
    closed: AtomicBool,
}

impl Transport {
    /// Request server-side parameters, then build the local half.
    ///
    /// Failures are not retried; they surface as [`Error::TransportFailed`].
    pub async fn create(
        direction: Direction,
        signaling: &Signaling,
        engine: &dyn MediaEngine,
    ) -> Result<Self> {
        let failed = |e: Error| Error::TransportFailed {
            direction,
            reason: e.to_string(),
        };

        let options = signaling.create_transport(direction).await.map_err(failed)?;
        let local = engine
            .create_transport(direction, &options)
            .await
            .map_err(failed)?;

        info!(transport_id = %options.id, %direction, "Transport created");

        Ok(Self {
            id: options.id,
            direction,
            local,
            connected: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.id
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Relay local DTLS parameters and wait for the server acknowledgment.
    /// A failed attempt is not cached.
    async fn ensure_connected(&self, signaling: &Signaling) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Protocol(format!("transport {} is closed", self.id)));
        }
        self.connected
            .get_or_try_init(|| async {
                let dtls = self.local.dtls_parameters().await?;
                signaling.connect_transport(&self.id, dtls).await?;
                info!(transport_id = %self.id, direction = %self.direction, "Transport connected");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Publish a track, resolving with the server-assigned producer id
    pub async fn produce(
        &self,
        signaling: &Signaling,
        source: SourceKind,
        track: &Arc<dyn LocalTrack>,
    ) -> Result<ProducerId> {
        if self.direction != Direction::Send {
            return Err(Error::Protocol("produce on a receive transport".to_string()));
        }
        self.ensure_connected(signaling).await?;

        let rtp_parameters = self.local.send(track).await?;
        match signaling
            .produce(&self.id, track.kind(), source, rtp_parameters)
            .await
        {
            Ok(producer_id) => Ok(producer_id),
            Err(e) => {
                self.local.stop_sending(track.id());
                Err(e)
            }
        }
    }

    /// Ask the server for a consumer of `producer_id` and bind it locally.
    /// The consumer starts paused server-side.
    pub async fn consume(
        &self,
        signaling: &Signaling,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(ConsumerOptions, Arc<dyn RemoteTrack>)> {
        if self.direction != Direction::Recv {
            return Err(Error::Protocol("consume on a send transport".to_string()));
        }
        let options = signaling
            .consume(&self.id, producer_id, rtp_capabilities)
            .await?;
        self.ensure_connected(signaling).await?;
        let track = self.local.receive(&options).await?;
        Ok((options, track))
    }

    pub fn stop_sending(&self, track_id: &str) {
        if !self.is_closed() {
            self.local.stop_sending(track_id);
        }
    }

    /// Close the local half. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.local.close();
        debug!(transport_id = %self.id, direction = %self.direction, "Transport closed");
        true
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("connected", &self.connected.initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}
