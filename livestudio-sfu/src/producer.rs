//! Local producer registry
//!
//! At most one producer per [`SourceKind`]. A source counts as occupied from
//! the moment an enable starts until its close is acknowledged, so overlapping
//! toggles never publish a source twice.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::media::LocalTrack;
use crate::protocol::SourceKind;
use crate::types::ProducerId;

/// A published local track
#[derive(Debug)]
pub struct LocalProducer {
    pub id: ProducerId,
    pub source: SourceKind,
    pub track: Arc<dyn LocalTrack>,
    closing: bool,
    watcher: CancellationToken,
}

impl LocalProducer {
    pub fn new(
        id: ProducerId,
        source: SourceKind,
        track: Arc<dyn LocalTrack>,
        watcher: CancellationToken,
    ) -> Self {
        Self {
            id,
            source,
            track,
            closing: false,
            watcher,
        }
    }

    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.closing
    }

    /// Stop the capture and the end-of-track watcher
    pub fn retire(&self) {
        self.watcher.cancel();
        self.track.stop();
    }
}

/// Derived "is enabled" flags for presentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerFlags {
    pub camera: bool,
    pub microphone: bool,
    pub screen: bool,
}

#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: HashMap<SourceKind, LocalProducer>,
    pending: HashSet<SourceKind>,
}

impl ProducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Active, closing or being enabled
    #[must_use]
    pub fn is_occupied(&self, source: SourceKind) -> bool {
        self.pending.contains(&source) || self.producers.contains_key(&source)
    }

    /// Reserve `source` for an enable in flight. False if already occupied.
    pub fn begin(&mut self, source: SourceKind) -> bool {
        if self.is_occupied(source) {
            return false;
        }
        self.pending.insert(source)
    }

    /// Still reserved, i.e. not drained since [`Self::begin`]
    #[must_use]
    pub fn is_reserved(&self, source: SourceKind) -> bool {
        self.pending.contains(&source)
    }

    /// Release a reservation that did not produce anything
    pub fn abandon(&mut self, source: SourceKind) {
        self.pending.remove(&source);
    }

    /// Complete a reservation
    pub fn insert(&mut self, producer: LocalProducer) {
        self.pending.remove(&producer.source);
        self.producers.insert(producer.source, producer);
    }

    #[must_use]
    pub fn get(&self, source: SourceKind) -> Option<&LocalProducer> {
        self.producers.get(&source)
    }

    /// Mark the producer of `source` as closing and hand back what the caller
    /// needs to shut it down. None if absent or already closing.
    pub fn begin_close(&mut self, source: SourceKind) -> Option<(ProducerId, Arc<dyn LocalTrack>, CancellationToken)> {
        let producer = self.producers.get_mut(&source)?;
        if producer.closing {
            return None;
        }
        producer.closing = true;
        Some((
            producer.id.clone(),
            Arc::clone(&producer.track),
            producer.watcher.clone(),
        ))
    }

    /// Remove a closing producer once the server acknowledged
    pub fn finish_close(&mut self, source: SourceKind, id: &ProducerId) -> Option<LocalProducer> {
        if self.producers.get(&source).is_some_and(|p| &p.id == id) {
            return self.producers.remove(&source);
        }
        None
    }

    /// Enabled means published and not being closed
    #[must_use]
    pub fn is_enabled(&self, source: SourceKind) -> bool {
        self.producers.get(&source).is_some_and(|p| !p.closing)
    }

    #[must_use]
    pub fn flags(&self) -> ProducerFlags {
        ProducerFlags {
            camera: self.is_enabled(SourceKind::Webcam),
            microphone: self.is_enabled(SourceKind::Microphone),
            screen: self.is_enabled(SourceKind::Screen),
        }
    }

    #[must_use]
    pub fn enabled_sources(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }

    /// Empty the registry, reservations included
    pub fn drain(&mut self) -> Vec<LocalProducer> {
        self.pending.clear();
        let mut producers: Vec<_> = self.producers.drain().map(|(_, p)| p).collect();
        producers.sort_by_key(|p| SourceKind::ALL.iter().position(|s| *s == p.source));
        producers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::SimulatedTrack;

    fn producer(id: &str, source: SourceKind) -> LocalProducer {
        LocalProducer::new(
            ProducerId::from(id),
            source,
            SimulatedTrack::new(source.media_kind()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_reservation_blocks_second_enable() {
        let mut registry = ProducerRegistry::new();
        assert!(registry.begin(SourceKind::Webcam));
        assert!(!registry.begin(SourceKind::Webcam));
        assert!(!registry.is_enabled(SourceKind::Webcam));

        registry.insert(producer("p1", SourceKind::Webcam));
        assert!(registry.is_enabled(SourceKind::Webcam));
        assert!(!registry.begin(SourceKind::Webcam));

        registry.abandon(SourceKind::Microphone);
        assert!(registry.begin(SourceKind::Microphone));
        registry.abandon(SourceKind::Microphone);
        assert!(!registry.is_occupied(SourceKind::Microphone));
    }

    #[test]
    fn test_close_lifecycle() {
        let mut registry = ProducerRegistry::new();
        registry.insert(producer("p1", SourceKind::Screen));

        let (id, _track, _watcher) = registry.begin_close(SourceKind::Screen).unwrap();
        assert_eq!(id.as_str(), "p1");
        assert!(registry.begin_close(SourceKind::Screen).is_none());
        assert!(!registry.flags().screen);
        assert!(registry.is_occupied(SourceKind::Screen));

        assert!(registry.finish_close(SourceKind::Screen, &ProducerId::from("other")).is_none());
        assert!(registry.finish_close(SourceKind::Screen, &id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut registry = ProducerRegistry::new();
        registry.insert(producer("p2", SourceKind::Microphone));
        registry.insert(producer("p1", SourceKind::Webcam));
        assert!(registry.begin(SourceKind::Screen));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].source, SourceKind::Webcam);
        assert!(registry.is_empty());
        assert_eq!(registry.flags(), ProducerFlags::default());
        assert!(!registry.is_occupied(SourceKind::Screen));
    }
}
