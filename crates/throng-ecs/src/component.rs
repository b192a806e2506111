//! Component type registration and metadata.
//!
//! Every component type must be registered in the [`ComponentRegistry`]
//! before an archetype references it. Registration produces a
//! [`ComponentId`] that keys archetype column lookups and query matching.
//! Slots 0 and 1 are reserved for the implicit [`Entity`] and [`WorldId`]
//! columns present in every archetype.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, WorldId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    /// The implicit entity handle column, first in every table.
    pub const ENTITY: ComponentId = ComponentId(0);
    /// The implicit world-replica column, second in every table.
    pub const WORLD_ID: ComponentId = ComponentId(1);

    /// Construct an id from its raw slot index.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw slot index.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this id is one of the two implicit per-row components.
    #[inline]
    pub fn is_builtin(self) -> bool {
        self == Self::ENTITY || self == Self::WORLD_ID
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// TypeInfo
// ---------------------------------------------------------------------------

/// Memory layout of a registered component. Immutable once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub alignment: u32,
    pub num_bytes: u32,
}

impl TypeInfo {
    /// Layout of a concrete Rust type.
    pub fn of<T>() -> Self {
        Self {
            alignment: std::mem::align_of::<T>() as u32,
            num_bytes: std::mem::size_of::<T>() as u32,
        }
    }

    fn validate(self) -> Result<Self, EcsError> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(EcsError::InvalidLayout {
                alignment: self.alignment,
                num_bytes: self.num_bytes,
            });
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Fixed-capacity table of [`TypeInfo`]s indexed by [`ComponentId`].
///
/// Ids are handed out densely, but [`register_with_id`](Self::register_with_id)
/// may fill an arbitrary slot, so the table is sparse.
#[derive(Debug)]
pub struct ComponentRegistry {
    /// Indexed by `ComponentId.0`; `None` for free slots.
    infos: Vec<Option<TypeInfo>>,
    /// Rust TypeId -> ComponentId for typed registration.
    by_type: HashMap<TypeId, ComponentId>,
    /// Lowest slot that might be free.
    next_free: u32,
}

impl ComponentRegistry {
    /// Create a registry with room for `max_components` types, with the
    /// Entity and WorldId slots already filled.
    pub fn new(max_components: u32) -> Self {
        assert!(
            max_components >= 2,
            "max_components must leave room for the Entity and WorldId columns"
        );
        let mut infos = vec![None; max_components as usize];
        infos[ComponentId::ENTITY.0 as usize] = Some(TypeInfo::of::<Entity>());
        infos[ComponentId::WORLD_ID.0 as usize] = Some(TypeInfo::of::<WorldId>());

        let mut by_type = HashMap::new();
        by_type.insert(TypeId::of::<Entity>(), ComponentId::ENTITY);
        by_type.insert(TypeId::of::<WorldId>(), ComponentId::WORLD_ID);

        Self {
            infos,
            by_type,
            next_free: 2,
        }
    }

    /// Register a component layout in the next free slot.
    pub fn register(&mut self, alignment: u32, num_bytes: u32) -> Result<ComponentId, EcsError> {
        let info = TypeInfo {
            alignment,
            num_bytes,
        }
        .validate()?;

        let mut slot = self.next_free as usize;
        while slot < self.infos.len() && self.infos[slot].is_some() {
            slot += 1;
        }
        if slot >= self.infos.len() {
            return Err(EcsError::ComponentCapacity {
                max: self.infos.len() as u32,
            });
        }

        self.infos[slot] = Some(info);
        self.next_free = slot as u32 + 1;
        Ok(ComponentId(slot as u32))
    }

    /// Register a component layout in a caller-chosen slot.
    pub fn register_with_id(
        &mut self,
        id: ComponentId,
        alignment: u32,
        num_bytes: u32,
    ) -> Result<(), EcsError> {
        let info = TypeInfo {
            alignment,
            num_bytes,
        }
        .validate()?;

        let max = self.infos.len() as u32;
        let slot = self
            .infos
            .get_mut(id.0 as usize)
            .ok_or(EcsError::ComponentCapacity { max })?;
        if slot.is_some() {
            return Err(EcsError::DuplicateComponent { id });
        }
        *slot = Some(info);
        Ok(())
    }

    /// Register a plain-data Rust type. Each type may be registered once.
    pub fn register_type<T: bytemuck::Pod>(&mut self) -> Result<ComponentId, EcsError> {
        let rust_type = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type) {
            return Err(EcsError::DuplicateComponent { id: existing });
        }
        let info = TypeInfo::of::<T>();
        let id = self.register(info.alignment, info.num_bytes)?;
        self.by_type.insert(rust_type, id);
        Ok(id)
    }

    /// Look up the id a Rust type was registered under.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// The layout registered for `id`, if any.
    pub fn get_info(&self, id: ComponentId) -> Option<TypeInfo> {
        self.infos.get(id.0 as usize).copied().flatten()
    }

    /// Whether `id` names a registered component.
    pub fn is_registered(&self, id: ComponentId) -> bool {
        self.get_info(id).is_some()
    }

    /// Number of registered components, including the two builtins.
    pub fn len(&self) -> usize {
        self.infos.iter().filter(|i| i.is_some()).count()
    }

    /// Always false: the builtins are registered at construction.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Maximum number of component slots.
    pub fn capacity(&self) -> u32 {
        self.infos.len() as u32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
