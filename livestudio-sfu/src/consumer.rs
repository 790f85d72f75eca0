//! Remote consumers and the bookkeeping that makes consumption tolerant of
//! duplicate and out-of-order producer events

use indexmap::IndexSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::media::RemoteTrack;
use crate::protocol::{ConsumerOptions, NewProducer};
use crate::rtp::MediaKind;
use crate::types::{ConsumerId, ProducerId, SocketId};

/// A remote participant's track, consumed locally
#[derive(Debug, Clone)]
pub struct RemoteConsumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub owner: SocketId,
    pub kind: MediaKind,
    pub track: Arc<dyn RemoteTrack>,
    /// Set once the presentation layer bound the track to an element
    pub attached: bool,
}

impl RemoteConsumer {
    pub fn new(options: ConsumerOptions, owner: SocketId, track: Arc<dyn RemoteTrack>) -> Self {
        Self {
            id: options.id,
            producer_id: options.producer_id,
            owner,
            kind: options.kind,
            track,
            attached: false,
        }
    }

    /// Release the local consumer resource
    pub fn close(&self) {
        debug!(consumer_id = %self.id, producer_id = %self.producer_id, "Consumer closed");
        self.track.stop();
    }
}

/// What a `newProducer` should do given what is already known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Start consuming now
    Consume,
    /// Queue until the session can consume
    Buffer,
    /// Already consumed, in flight, buffered or closed
    Ignore,
}

/// Closed producers remembered per session; the oldest are forgotten first
const MAX_TOMBSTONES: usize = 1024;

/// In-flight consumes, buffered producers and tombstones of closed producers
#[derive(Debug, Default)]
pub struct ConsumerLedger {
    in_flight: HashMap<ProducerId, SocketId>,
    buffered: Vec<NewProducer>,
    closed: IndexSet<ProducerId>,
}

impl ConsumerLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a `newProducer`. `consumed` tells whether a registered
    /// consumer already mirrors it; `ready` whether consumption can start.
    #[must_use]
    pub fn admit(&self, producer: &NewProducer, consumed: bool, ready: bool) -> Admission {
        let id = &producer.producer_id;
        if consumed
            || self.closed.contains(id)
            || self.in_flight.contains_key(id)
            || self.buffered.iter().any(|p| &p.producer_id == id)
        {
            return Admission::Ignore;
        }
        if ready {
            Admission::Consume
        } else {
            Admission::Buffer
        }
    }

    pub fn buffer(&mut self, producer: NewProducer) {
        self.buffered.push(producer);
    }

    /// Hand over everything queued before the session was ready
    pub fn take_buffered(&mut self) -> Vec<NewProducer> {
        std::mem::take(&mut self.buffered)
    }

    pub fn begin(&mut self, producer: &NewProducer) {
        self.in_flight
            .insert(producer.producer_id.clone(), producer.owner_socket_id.clone());
    }

    /// End an in-flight consume. True when the result is still wanted, false
    /// when the producer closed or its owner left in the meantime.
    pub fn finish(&mut self, producer_id: &ProducerId) -> bool {
        let was_in_flight = self.in_flight.remove(producer_id).is_some();
        was_in_flight && !self.closed.contains(producer_id)
    }

    /// Remember that `producer_id` is gone for good
    pub fn mark_closed(&mut self, producer_id: &ProducerId) {
        self.buffered.retain(|p| &p.producer_id != producer_id);
        self.tombstone(producer_id.clone());
    }

    fn tombstone(&mut self, producer_id: ProducerId) {
        // Re-closing refreshes the entry so it is evicted last
        self.closed.shift_remove(&producer_id);
        self.closed.insert(producer_id);
        while self.closed.len() > MAX_TOMBSTONES {
            self.closed.shift_remove_index(0);
        }
    }

    #[must_use]
    pub fn is_closed(&self, producer_id: &ProducerId) -> bool {
        self.closed.contains(producer_id)
    }

    /// Drop everything pending for a participant that left
    pub fn forget_owner(&mut self, owner: &SocketId) {
        self.buffered.retain(|p| &p.owner_socket_id != owner);
        let cancelled: Vec<ProducerId> = self
            .in_flight
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(p, _)| p.clone())
            .collect();
        for producer_id in cancelled {
            self.tombstone(producer_id);
        }
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.buffered.clear();
        self.closed.clear();
    }
}
