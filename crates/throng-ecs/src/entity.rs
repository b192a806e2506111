//! Entity handles and the fixed-capacity entity store.
//!
//! An [`Entity`] is an `(index, generation)` pair. The generation of a slot
//! is bumped every time the slot is released, which makes any outstanding
//! handle to the old occupant detectably stale without a collection pass.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::archetype::ArchetypeId;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle. Stored verbatim in column 0 of every table.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable,
)]
#[repr(C)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Construct a handle from its parts.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the entity store.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot had when this handle was issued.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a `u64` as `[generation | index]`.
    #[inline]
    pub fn to_bits(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    /// Inverse of [`to_bits`](Self::to_bits).
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// WorldId
// ---------------------------------------------------------------------------

/// Index of the world replica a row belongs to. Stored in column 1.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
#[repr(transparent)]
pub struct WorldId(pub u32);

// ---------------------------------------------------------------------------
// EntityStore
// ---------------------------------------------------------------------------

/// Where a live entity's row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: u32,
}

#[derive(Debug, Clone, Copy)]
struct EntitySlot {
    generation: u32,
    alive: bool,
    location: Option<EntityLocation>,
}

/// Fixed pool of entity slots with generation counters and a free list.
///
/// All slots start free. Free indices are recycled FIFO so generations are
/// spread across slots rather than concentrated on a hot index.
#[derive(Debug)]
pub struct EntityStore {
    slots: Vec<EntitySlot>,
    available: VecDeque<u32>,
}

impl EntityStore {
    /// Create a store with exactly `max_entities` slots.
    pub fn new(max_entities: u32) -> Self {
        Self {
            slots: vec![
                EntitySlot {
                    generation: 0,
                    alive: false,
                    location: None,
                };
                max_entities as usize
            ],
            available: (0..max_entities).collect(),
        }
    }

    /// Take a free slot, or `None` when every slot is in use.
    pub fn allocate(&mut self) -> Option<Entity> {
        let index = self.available.pop_front()?;
        let slot = &mut self.slots[index as usize];
        slot.alive = true;
        Some(Entity::new(index, slot.generation))
    }

    /// Record the row a live entity occupies.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) -> bool {
        if !self.is_valid(entity) {
            return false;
        }
        self.slots[entity.index as usize].location = Some(location);
        true
    }

    /// Release a slot, invalidating every outstanding handle to it.
    ///
    /// Returns `false` if the handle was already stale.
    pub fn release(&mut self, entity: Entity) -> bool {
        if !self.is_valid(entity) {
            return false;
        }
        let slot = &mut self.slots[entity.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.alive = false;
        slot.location = None;
        self.available.push_back(entity.index);
        true
    }

    /// A handle is valid while its generation matches the slot's and the
    /// slot has not been returned to the free list.
    pub fn is_valid(&self, entity: Entity) -> bool {
        match self.slots.get(entity.index as usize) {
            Some(slot) => slot.alive && slot.generation == entity.generation,
            None => false,
        }
    }

    /// Location of a live entity.
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.is_valid(entity) {
            return None;
        }
        self.slots[entity.index as usize].location
    }

    /// Number of slots currently handed out.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.available.len()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
