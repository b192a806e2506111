//! Archetype stores.
//!
//! An [`ArchetypeStore`] owns the [`Table`] for one fixed set of component
//! types. Column layout is decided once at registration and never changes:
//! column 0 is the [`Entity`](crate::entity::Entity) handle, column 1 the
//! [`WorldId`](crate::entity::WorldId), then the user components in the
//! order they were given.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::component::ComponentId;
use crate::table::Table;

/// Column index of the entity handle in every table.
pub const ENTITY_COLUMN: u32 = 0;
/// Column index of the world id in every table.
pub const WORLD_ID_COLUMN: u32 = 1;
/// First column index used by user components.
pub const USER_COLUMN_OFFSET: u32 = 2;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype. Index into `StateManager`'s archetype list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// ArchetypeStore
// ---------------------------------------------------------------------------

/// Storage for every row of one archetype, across all world replicas.
#[derive(Debug)]
pub struct ArchetypeStore {
    /// Offset of this archetype's user components in the global
    /// archetype-component array.
    component_offset: u32,
    num_user_components: u32,
    tbl: Table,
    /// User component id -> column index.
    column_lookup: HashMap<ComponentId, u32>,
}

impl ArchetypeStore {
    /// Build the store. `user_components` must already be validated.
    pub(crate) fn new(component_offset: u32, user_components: &[ComponentId], tbl: Table) -> Self {
        debug_assert_eq!(tbl.num_columns(), user_components.len() + 2);
        let column_lookup = user_components
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as u32 + USER_COLUMN_OFFSET))
            .collect();
        Self {
            component_offset,
            num_user_components: user_components.len() as u32,
            tbl,
            column_lookup,
        }
    }

    /// Offset into the global archetype-component array.
    #[inline]
    pub fn component_offset(&self) -> u32 {
        self.component_offset
    }

    /// Number of user components (excluding Entity and WorldId).
    #[inline]
    pub fn num_user_components(&self) -> u32 {
        self.num_user_components
    }

    /// The archetype's table.
    #[inline]
    pub fn table(&self) -> &Table {
        &self.tbl
    }

    /// Mutable access to the table, for setup outside a run.
    #[inline]
    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.tbl
    }

    /// Column holding `component`, if this archetype has it.
    ///
    /// Entity and WorldId always resolve to columns 0 and 1.
    #[inline]
    pub fn column_index(&self, component: ComponentId) -> Option<u32> {
        match component {
            ComponentId::ENTITY => Some(ENTITY_COLUMN),
            ComponentId::WORLD_ID => Some(WORLD_ID_COLUMN),
            other => self.column_lookup.get(&other).copied(),
        }
    }

    /// Whether this archetype stores `component`.
    #[inline]
    pub fn has_component(&self, component: ComponentId) -> bool {
        self.column_index(component).is_some()
    }

    /// Number of rows in use.
    #[inline]
    pub fn num_rows(&self) -> u32 {
        self.tbl.num_rows()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
