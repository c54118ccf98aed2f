//! Authoritative world state: the entities whose changes are replicated to
//! clients.
//!
//! Entities are owned here; the event managers and per-client queues only
//! hold IDs and must treat a missing or removed entity as a skip condition,
//! never an error. Removed entities stay in the registry with their flag
//! set until the round is cleared, so late acknowledgements can still be
//! resolved to a placeholder on the wire.

use log::info;
use std::collections::HashMap;

pub type EntityId = u16;

/// How close a character has to be for per-tick position updates to be
/// worth sending, squared.
pub const CHARACTER_IGNORE_DISTANCE_SQR: f32 = 1000.0 * 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Character,
    Item,
    Structure,
    Submarine,
}

impl EntityKind {
    pub fn as_byte(self) -> u8 {
        match self {
            EntityKind::Character => 0,
            EntityKind::Item => 1,
            EntityKind::Structure => 2,
            EntityKind::Submarine => 3,
        }
    }
}

/// Extra state carried by character entities.
#[derive(Debug, Clone)]
pub struct CharacterState {
    pub alive: bool,
    pub conscious: bool,
    pub team: u8,
    pub job: Option<String>,
    /// Range of a held, working radio transmitter, if any.
    pub radio_range: Option<f32>,
    /// Owning client, None for AI or host characters.
    pub client_id: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub x: f32,
    pub y: f32,
    pub removed: bool,
    /// Whether this entity supports event-based replication; entities
    /// without the capability are position-only.
    pub event_capable: bool,
    pub needs_position_update: bool,
    pub character: Option<CharacterState>,
    /// Set on the main submarine once it reaches the end of the level.
    pub at_end_position: bool,
}

impl Entity {
    pub fn is_alive_character(&self) -> bool {
        !self.removed
            && matches!(
                self.character,
                Some(CharacterState {
                    alive: true,
                    ..
                })
            )
    }

    pub fn distance_sqr_to(&self, other: &Entity) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// The simulation world. Owns all replicable entities for the current
/// round.
#[derive(Debug, Default)]
pub struct World {
    entities: HashMap<EntityId, Entity>,
    next_entity_id: u16,
    pub main_sub: Option<EntityId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> EntityId {
        // zero is the wire placeholder, never a real entity
        loop {
            self.next_entity_id = self.next_entity_id.wrapping_add(1);
            if self.next_entity_id != 0 && !self.entities.contains_key(&self.next_entity_id) {
                return self.next_entity_id;
            }
        }
    }

    pub fn spawn(&mut self, kind: EntityKind, x: f32, y: f32, event_capable: bool) -> EntityId {
        let id = self.next_id();
        self.entities.insert(
            id,
            Entity {
                id,
                kind,
                x,
                y,
                removed: false,
                event_capable,
                needs_position_update: false,
                character: None,
                at_end_position: false,
            },
        );
        id
    }

    pub fn spawn_character(&mut self, x: f32, y: f32, team: u8, client_id: Option<u8>) -> EntityId {
        let id = self.spawn(EntityKind::Character, x, y, true);
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.character = Some(CharacterState {
                alive: true,
                conscious: true,
                team,
                job: None,
                radio_range: None,
                client_id,
            });
        }
        id
    }

    /// Loads a fresh level: clears the previous round's entities and
    /// spawns the main submarine.
    pub fn load_level(&mut self, seed: u32) -> EntityId {
        self.clear();
        let sub = self.spawn(EntityKind::Submarine, 0.0, 0.0, true);
        self.main_sub = Some(sub);
        info!("Level loaded (seed {}), main sub is entity {}", seed, sub);
        sub
    }

    /// Team-appropriate spawn position.
    pub fn spawn_point(&self, team: u8) -> (f32, f32) {
        match team {
            2 => (4000.0, 0.0),
            _ => (0.0, 0.0),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// True if the entity exists and has not been flagged removed.
    pub fn is_active(&self, id: EntityId) -> bool {
        self.entities.get(&id).map_or(false, |e| !e.removed)
    }

    /// Flags an entity as removed; it stays resolvable until `clear`.
    pub fn remove(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.removed = true;
            entity.needs_position_update = false;
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn main_sub_at_end(&self) -> bool {
        self.main_sub
            .and_then(|id| self.entities.get(&id))
            .map_or(false, |sub| sub.at_end_position && !sub.removed)
    }

    pub fn clear_position_flags(&mut self) {
        for entity in self.entities.values_mut() {
            entity.needs_position_update = false;
        }
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.main_sub = None;
        self.next_entity_id = 0;
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_assigns_nonzero_ids() {
        let mut world = World::new();
        let a = world.spawn(EntityKind::Item, 0.0, 0.0, true);
        let b = world.spawn(EntityKind::Item, 1.0, 1.0, false);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_removed_entity_stays_resolvable() {
        let mut world = World::new();
        let id = world.spawn(EntityKind::Item, 0.0, 0.0, true);
        world.remove(id);
        assert!(world.get(id).is_some());
        assert!(!world.is_active(id));
    }

    #[test]
    fn test_character_spawn_and_death() {
        let mut world = World::new();
        let id = world.spawn_character(0.0, 0.0, 1, Some(3));
        assert!(world.get(id).unwrap().is_alive_character());

        world.get_mut(id).unwrap().character.as_mut().unwrap().alive = false;
        assert!(!world.get(id).unwrap().is_alive_character());
    }

    #[test]
    fn test_load_level_resets_entities() {
        let mut world = World::new();
        world.spawn(EntityKind::Item, 0.0, 0.0, true);
        let sub = world.load_level(1234);
        assert_eq!(world.len(), 1);
        assert_eq!(world.main_sub, Some(sub));
        assert!(!world.main_sub_at_end());

        world.get_mut(sub).unwrap().at_end_position = true;
        assert!(world.main_sub_at_end());
    }
}
