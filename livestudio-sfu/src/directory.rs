//! Participant directory
//!
//! Who is in the room and which consumers belong to them, in order of first
//! appearance. Entries are removed only on an explicit leave.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;

use crate::consumer::RemoteConsumer;
use crate::protocol::{ParticipantInfo, Role};
use crate::types::{ConsumerId, ProducerId, SocketId, UserId};

/// Presence of a participant that has not left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    NoMedia,
    WithMedia,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub socket_id: SocketId,
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub consumers: Vec<RemoteConsumer>,
}

impl Participant {
    fn from_info(info: ParticipantInfo) -> Self {
        Self {
            socket_id: info.socket_id,
            user_id: info.user_id,
            display_name: info.display_name,
            role: info.role,
            joined_at: Utc::now(),
            consumers: Vec::new(),
        }
    }

    /// Placeholder for an owner seen through a producer before any presence event
    fn placeholder(socket_id: SocketId) -> Self {
        Self {
            display_name: socket_id.to_string(),
            socket_id,
            user_id: None,
            role: Role::Guest,
            joined_at: Utc::now(),
            consumers: Vec::new(),
        }
    }

    #[must_use]
    pub fn presence(&self) -> Presence {
        if self.consumers.is_empty() {
            Presence::NoMedia
        } else {
            Presence::WithMedia
        }
    }

    #[must_use]
    pub fn consumer_for(&self, producer_id: &ProducerId) -> Option<&RemoteConsumer> {
        self.consumers.iter().find(|c| &c.producer_id == producer_id)
    }
}

#[derive(Debug, Default)]
pub struct ParticipantDirectory {
    participants: IndexMap<SocketId, Participant>,
}

impl ParticipantDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant or refresh the details of a present one.
    /// Consumers and position are kept. Returns true if it was new.
    pub fn upsert(&mut self, info: ParticipantInfo) -> bool {
        if let Some(existing) = self.participants.get_mut(&info.socket_id) {
            existing.display_name = info.display_name;
            existing.role = info.role;
            if info.user_id.is_some() {
                existing.user_id = info.user_id;
            }
            return false;
        }
        debug!(socket_id = %info.socket_id, display_name = %info.display_name, "Participant present");
        self.participants
            .insert(info.socket_id.clone(), Participant::from_info(info));
        true
    }

    /// Look up a participant, creating a placeholder if unknown
    pub fn ensure(&mut self, socket_id: &SocketId) -> &mut Participant {
        self.participants
            .entry(socket_id.clone())
            .or_insert_with(|| {
                debug!(%socket_id, "Participant created lazily from producer");
                Participant::placeholder(socket_id.clone())
            })
    }

    /// Delete a participant, handing back the consumers the caller must close
    pub fn remove(&mut self, socket_id: &SocketId) -> Option<Participant> {
        self.participants.shift_remove(socket_id)
    }

    #[must_use]
    pub fn get(&self, socket_id: &SocketId) -> Option<&Participant> {
        self.participants.get(socket_id)
    }

    #[must_use]
    pub fn contains(&self, socket_id: &SocketId) -> bool {
        self.participants.contains_key(socket_id)
    }

    /// Hang a consumer off its owner, creating the owner if needed
    pub fn attach(&mut self, consumer: RemoteConsumer) {
        let owner = consumer.owner.clone();
        self.ensure(&owner).consumers.push(consumer);
    }

    /// Detach the consumer mirroring `producer_id`, wherever it lives
    pub fn remove_consumer_by_producer(&mut self, producer_id: &ProducerId) -> Option<RemoteConsumer> {
        self.participants.values_mut().find_map(|participant| {
            let index = participant
                .consumers
                .iter()
                .position(|c| &c.producer_id == producer_id)?;
            Some(participant.consumers.remove(index))
        })
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.participants
            .values()
            .any(|p| p.consumer_for(producer_id).is_some())
    }

    /// Flag a consumer as bound to the presentation layer
    pub fn mark_attached(&mut self, consumer_id: &ConsumerId) -> bool {
        for participant in self.participants.values_mut() {
            if let Some(consumer) = participant.consumers.iter_mut().find(|c| &c.id == consumer_id) {
                consumer.attached = true;
                return true;
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Empty the directory, returning every consumer so it can be closed
    pub fn drain_consumers(&mut self) -> Vec<RemoteConsumer> {
        self.participants
            .drain(..)
            .flat_map(|(_, p)| p.consumers)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConsumerOptions;
    use crate::rtp::{MediaKind, RtpParameters};
    use crate::loopback::SimulatedTrack;

    fn info(socket_id: &str, name: &str) -> ParticipantInfo {
        ParticipantInfo {
            socket_id: SocketId::from(socket_id),
            user_id: None,
            display_name: name.to_string(),
            role: Role::Guest,
        }
    }

    fn consumer(id: &str, producer_id: &str, owner: &str) -> RemoteConsumer {
        RemoteConsumer::new(
            ConsumerOptions {
                id: ConsumerId::from(id),
                producer_id: ProducerId::from(producer_id),
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters::default(),
            },
            SocketId::from(owner),
            SimulatedTrack::new(MediaKind::Video),
        )
    }

    #[test]
    fn test_participant_without_media_stays_present() {
        let mut directory = ParticipantDirectory::new();
        assert!(directory.upsert(info("s1", "Ana")));

        let s1 = SocketId::from("s1");
        assert_eq!(directory.get(&s1).unwrap().presence(), Presence::NoMedia);

        directory.attach(consumer("c1", "r1", "s1"));
        assert_eq!(directory.get(&s1).unwrap().presence(), Presence::WithMedia);

        assert!(directory.remove_consumer_by_producer(&ProducerId::from("r1")).is_some());
        assert_eq!(directory.get(&s1).unwrap().presence(), Presence::NoMedia);
        assert!(directory.contains(&s1));
    }

    #[test]
    fn test_upsert_upgrades_lazy_entry_and_keeps_consumers() {
        let mut directory = ParticipantDirectory::new();
        directory.attach(consumer("c1", "r1", "s1"));
        let s1 = SocketId::from("s1");
        assert_eq!(directory.get(&s1).unwrap().display_name, "s1");

        assert!(!directory.upsert(info("s1", "Ana")));
        let participant = directory.get(&s1).unwrap();
        assert_eq!(participant.display_name, "Ana");
        assert_eq!(participant.consumers.len(), 1);
    }

    #[test]
    fn test_order_of_first_appearance() {
        let mut directory = ParticipantDirectory::new();
        directory.upsert(info("s2", "Bo"));
        directory.ensure(&SocketId::from("s1"));
        directory.upsert(info("s3", "Cy"));
        directory.upsert(info("s2", "Bo again"));

        let order: Vec<_> = directory.iter().map(|p| p.socket_id.as_str()).collect();
        assert_eq!(order, ["s2", "s1", "s3"]);

        directory.remove(&SocketId::from("s1"));
        let order: Vec<_> = directory.iter().map(|p| p.socket_id.as_str()).collect();
        assert_eq!(order, ["s2", "s3"]);
    }

    #[test]
    fn test_mark_attached_and_drain() {
        let mut directory = ParticipantDirectory::new();
        directory.attach(consumer("c1", "r1", "s1"));
        directory.attach(consumer("c2", "r2", "s2"));

        assert!(directory.mark_attached(&ConsumerId::from("c2")));
        assert!(!directory.mark_attached(&ConsumerId::from("missing")));
        assert!(directory.has_producer(&ProducerId::from("r1")));

        let consumers = directory.drain_consumers();
        assert_eq!(consumers.len(), 2);
        assert!(consumers.iter().any(|c| c.attached));
        assert!(directory.is_empty());
    }
}
