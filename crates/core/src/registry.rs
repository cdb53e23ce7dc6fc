//! Participant registry.

use distlab_types::{ParticipantId, Position};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Health of a participant as injected by fault scenarios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    Failed,
}

impl Health {
    /// Check if the participant is healthy.
    pub fn is_healthy(self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// A modeled protocol actor (node, replica, worker, ...).
pub trait Participant: Clone {
    /// Stable identity.
    fn id(&self) -> &ParticipantId;

    /// Injected health.
    fn health(&self) -> Health;

    /// Toggle injected health. Must not touch any other field.
    fn set_health(&mut self, health: Health);

    /// Opaque display position.
    fn position(&self) -> Position;

    /// Replace the display position.
    fn set_position(&mut self, position: Position);

    /// Whether this participant takes part in transitions.
    fn is_available(&self) -> bool {
        self.health().is_healthy()
    }
}

/// Implement [`Participant`] for a struct with `id`, `health` and `position` fields.
#[macro_export]
macro_rules! impl_participant {
    ($ty:ty) => {
        impl $crate::Participant for $ty {
            fn id(&self) -> &$crate::ParticipantId {
                &self.id
            }

            fn health(&self) -> $crate::Health {
                self.health
            }

            fn set_health(&mut self, health: $crate::Health) {
                self.health = health;
            }

            fn position(&self) -> $crate::Position {
                self.position
            }

            fn set_position(&mut self, position: $crate::Position) {
                self.position = position;
            }
        }
    };
}

/// Insertion-ordered set of participants keyed by id.
///
/// Callers (the owning state machine) are trusted to maintain protocol
/// invariants; the registry only guarantees id uniqueness.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRegistry<T> {
    participants: IndexMap<ParticipantId, T>,
}

impl<T> Default for ParticipantRegistry<T> {
    fn default() -> Self {
        Self {
            participants: IndexMap::new(),
        }
    }
}

impl<T: Participant> ParticipantRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from participants. Later duplicates replace earlier ones.
    pub fn from_participants(participants: impl IntoIterator<Item = T>) -> Self {
        let mut registry = Self::new();
        for participant in participants {
            registry.upsert(participant);
        }
        registry
    }

    /// Defensive copy of every participant, in insertion order.
    pub fn list(&self) -> Vec<T> {
        self.participants.values().cloned().collect()
    }

    /// Iterate over participants in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.participants.values()
    }

    /// Iterate mutably over participants in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.participants.values_mut()
    }

    /// All ids, in insertion order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    /// Ids of available participants, in insertion order.
    pub fn available_ids(&self) -> Vec<ParticipantId> {
        self.iter()
            .filter(|p| p.is_available())
            .map(|p| p.id().clone())
            .collect()
    }

    /// Look up a participant.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.participants.get(id)
    }

    /// Look up a participant mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.participants.get_mut(id)
    }

    /// Position of a participant in insertion order.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.participants.get_index_of(id)
    }

    /// Participant at a position in insertion order.
    pub fn get_index(&self, index: usize) -> Option<&T> {
        self.participants.get_index(index).map(|(_, p)| p)
    }

    /// Check if a participant exists.
    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    /// Check if a participant exists and is available.
    pub fn is_available(&self, id: &str) -> bool {
        self.get(id).is_some_and(Participant::is_available)
    }

    /// Number of available participants.
    pub fn available_count(&self) -> usize {
        self.iter().filter(|p| p.is_available()).count()
    }

    /// Insert or replace a participant. Replacing keeps its original position.
    pub fn upsert(&mut self, participant: T) -> Option<T> {
        self.participants
            .insert(participant.id().clone(), participant)
    }

    /// Remove a participant, preserving the order of the rest.
    ///
    /// Only membership-changing protocols (sharding) use this.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.participants.shift_remove(id)
    }

    /// Set injected health. Returns false for unknown ids.
    pub fn set_health(&mut self, id: &str, health: Health) -> bool {
        match self.get_mut(id) {
            Some(participant) => {
                participant.set_health(health);
                true
            }
            None => false,
        }
    }

    /// Set a display position. Unknown ids are ignored.
    pub fn set_position(&mut self, id: &str, position: Position) {
        if let Some(participant) = self.get_mut(id) {
            participant.set_position(position);
        }
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Replace every participant with `initial`.
    pub fn reset(&mut self, initial: impl IntoIterator<Item = T>) {
        self.participants.clear();
        for participant in initial {
            self.upsert(participant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Node {
        id: ParticipantId,
        health: Health,
        position: Position,
        value: u32,
    }

    crate::impl_participant!(Node);

    fn node(i: usize) -> Node {
        Node {
            id: ParticipantId::indexed("node", i),
            health: Health::Healthy,
            position: Position::default(),
            value: 0,
        }
    }

    #[test]
    fn test_insertion_order_and_lookup() {
        let registry = ParticipantRegistry::from_participants((0..3).map(node));
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.ids(),
            vec![
                ParticipantId::from("node-0"),
                ParticipantId::from("node-1"),
                ParticipantId::from("node-2")
            ]
        );
        assert!(registry.get("node-1").is_some());
        assert!(registry.get("node-9").is_none());
        assert_eq!(registry.index_of("node-2"), Some(2));
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut registry = ParticipantRegistry::from_participants((0..3).map(node));
        let mut updated = node(1);
        updated.value = 42;

        let previous = registry.upsert(updated);
        assert_eq!(previous.map(|n| n.value), Some(0));
        assert_eq!(registry.index_of("node-1"), Some(1));
        assert_eq!(registry.get("node-1").unwrap().value, 42);
    }

    #[test]
    fn test_list_is_a_defensive_copy() {
        let registry = ParticipantRegistry::from_participants((0..2).map(node));
        let mut copy = registry.list();
        copy[0].value = 99;
        assert_eq!(registry.get("node-0").unwrap().value, 0);
    }

    #[test]
    fn test_health_toggles() {
        let mut registry = ParticipantRegistry::from_participants((0..3).map(node));
        assert!(registry.set_health("node-1", Health::Failed));
        assert!(!registry.set_health("node-7", Health::Failed));

        assert!(!registry.is_available("node-1"));
        assert!(!registry.is_available("node-7"));
        assert_eq!(registry.available_count(), 2);
        assert_eq!(
            registry.available_ids(),
            vec![ParticipantId::from("node-0"), ParticipantId::from("node-2")]
        );
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut registry = ParticipantRegistry::from_participants((0..4).map(node));
        assert!(registry.remove("node-1").is_some());
        assert!(registry.remove("node-1").is_none());
        assert_eq!(registry.index_of("node-2"), Some(1));
    }

    #[test]
    fn test_reset() {
        let mut registry = ParticipantRegistry::from_participants((0..3).map(node));
        registry.set_health("node-0", Health::Failed);
        registry.set_position("node-0", Position::new(1.0, 2.0));
        registry.reset((0..3).map(node));
        assert_eq!(registry, ParticipantRegistry::from_participants((0..3).map(node)));
    }
}
