//! The [`StateManager`] is the top-level container of the ECS. It owns the
//! component registry, every archetype store, the entity store and the
//! query cache for the lifetime of a run.
//!
//! Registration takes `&mut self` and must finish before the first run.
//! Everything a worker needs during a run (row allocation, entity creation,
//! query resolution, clearing temporaries) takes `&self` and is safe to
//! call from many threads at once.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archetype::{ArchetypeId, ArchetypeStore, ENTITY_COLUMN, WORLD_ID_COLUMN};
use crate::component::{ComponentId, ComponentRegistry, TypeInfo};
use crate::entity::{Entity, EntityLocation, EntityStore, WorldId};
use crate::query::{QueryCache, QueryMatch, QueryRef};
use crate::table::Table;
use crate::EcsError;

// ---------------------------------------------------------------------------
// StateConfig
// ---------------------------------------------------------------------------

/// Capacities of the storage engine. Fixed for the lifetime of a
/// [`StateManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Number of independent world replicas sharing the tables.
    pub num_worlds: u32,
    /// Row reservation of every table, across all worlds.
    pub max_rows_per_table: u32,
    /// Component slots, including Entity and WorldId.
    pub max_components: u32,
    pub max_archetypes: u32,
    /// Size of the global archetype-component array.
    pub max_archetype_components: u32,
    /// Size of the query result buffer in `u32` words.
    pub max_query_data: u32,
    pub max_entities: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            num_worlds: 1,
            max_rows_per_table: 1 << 16,
            max_components: 128,
            max_archetypes: 64,
            max_archetype_components: 512,
            max_query_data: 4096,
            max_entities: 1 << 16,
        }
    }
}

impl StateConfig {
    /// Reject configurations the storage engine cannot honor.
    pub fn validate(&self) -> Result<(), EcsError> {
        let invalid = |reason: &str| {
            Err(EcsError::InvalidConfig {
                reason: reason.to_owned(),
            })
        };
        if self.num_worlds == 0 {
            return invalid("num_worlds must be at least 1");
        }
        if self.max_components < 2 {
            return invalid("max_components must leave room for Entity and WorldId");
        }
        if self.max_rows_per_table == 0 {
            return invalid("max_rows_per_table must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Owner of all ECS state for a run.
#[derive(Debug)]
pub struct StateManager {
    config: StateConfig,
    registry: ComponentRegistry,
    archetypes: Vec<ArchetypeStore>,
    /// User components of every archetype, concatenated in registration
    /// order. Each archetype records its offset into this array.
    archetype_components: Vec<ComponentId>,
    query_data_lock: Mutex<QueryCache>,
    entity_store: Mutex<EntityStore>,
}

impl StateManager {
    /// Create an empty state manager with the Entity and WorldId
    /// components pre-registered.
    pub fn new(config: StateConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self {
            registry: ComponentRegistry::new(config.max_components),
            archetypes: Vec::new(),
            archetype_components: Vec::new(),
            query_data_lock: Mutex::new(QueryCache::new(config.max_query_data)),
            entity_store: Mutex::new(EntityStore::new(config.max_entities)),
            config,
        })
    }

    /// The capacities this manager was built with.
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    fn query_cache(&self) -> MutexGuard<'_, QueryCache> {
        self.query_data_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entities(&self) -> MutexGuard<'_, EntityStore> {
        self.entity_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- registration -------------------------------------------------------

    /// Register a component layout in the next free slot.
    pub fn register_component(
        &mut self,
        alignment: u32,
        num_bytes: u32,
    ) -> Result<ComponentId, EcsError> {
        let id = self.registry.register(alignment, num_bytes)?;
        debug!(?id, alignment, num_bytes, "registered component");
        Ok(id)
    }

    /// Register a component layout under a caller-chosen id.
    pub fn register_component_with_id(
        &mut self,
        id: ComponentId,
        alignment: u32,
        num_bytes: u32,
    ) -> Result<(), EcsError> {
        self.registry.register_with_id(id, alignment, num_bytes)?;
        debug!(?id, alignment, num_bytes, "registered component");
        Ok(())
    }

    /// Register a plain-data Rust type as a component.
    pub fn register_component_type<T: bytemuck::Pod>(&mut self) -> Result<ComponentId, EcsError> {
        let id = self.registry.register_type::<T>()?;
        debug!(?id, ty = std::any::type_name::<T>(), "registered component");
        Ok(id)
    }

    /// Register an archetype made of `components` (plus the implicit Entity
    /// and WorldId columns).
    pub fn register_archetype(
        &mut self,
        components: &[ComponentId],
    ) -> Result<ArchetypeId, EcsError> {
        if self.archetypes.len() as u32 >= self.config.max_archetypes {
            return Err(EcsError::ArchetypeCapacity {
                max: self.config.max_archetypes,
            });
        }
        let offset = self.archetype_components.len() as u32;
        if offset as usize + components.len() > self.config.max_archetype_components as usize {
            return Err(EcsError::ArchetypeComponentCapacity {
                max: self.config.max_archetype_components,
            });
        }

        let mut infos: Vec<TypeInfo> = Vec::with_capacity(components.len() + 2);
        infos.push(TypeInfo::of::<Entity>());
        infos.push(TypeInfo::of::<WorldId>());
        for (i, &id) in components.iter().enumerate() {
            if id.is_builtin() || components[..i].contains(&id) {
                return Err(EcsError::DuplicateArchetypeComponent { id });
            }
            let info = self
                .registry
                .get_info(id)
                .ok_or(EcsError::UnknownComponent { id })?;
            infos.push(info);
        }

        let tbl = Table::new(
            &infos,
            self.config.max_rows_per_table,
            self.config.num_worlds,
        );
        let id = ArchetypeId(self.archetypes.len() as u32);
        self.archetype_components.extend_from_slice(components);
        self.archetypes
            .push(ArchetypeStore::new(offset, components, tbl));
        debug!(?id, ?components, "registered archetype");
        Ok(id)
    }

    // -- archetype access ---------------------------------------------------

    /// Number of registered archetypes.
    pub fn num_archetypes(&self) -> usize {
        self.archetypes.len()
    }

    /// The store for `id`.
    pub fn archetype(&self, id: ArchetypeId) -> Result<&ArchetypeStore, EcsError> {
        self.archetypes
            .get(id.0 as usize)
            .ok_or(EcsError::UnknownArchetype { id })
    }

    /// Mutable store for `id`, for setup outside a run.
    pub fn archetype_mut(&mut self, id: ArchetypeId) -> Result<&mut ArchetypeStore, EcsError> {
        self.archetypes
            .get_mut(id.0 as usize)
            .ok_or(EcsError::UnknownArchetype { id })
    }

    /// The user components of `id`, in column order.
    pub fn archetype_components(&self, id: ArchetypeId) -> Result<&[ComponentId], EcsError> {
        let store = self.archetype(id)?;
        let start = store.component_offset() as usize;
        Ok(&self.archetype_components[start..start + store.num_user_components() as usize])
    }

    /// Rows currently in use by `id`.
    pub fn num_rows(&self, id: ArchetypeId) -> Result<u32, EcsError> {
        Ok(self.archetype(id)?.num_rows())
    }

    /// Reset the row count of `id` to zero, keeping committed capacity.
    ///
    /// Entities living in the cleared rows stop validating, even though
    /// their entity slots are not released: a row reused by a later
    /// [`make_entity`](Self::make_entity) belongs to the new handle only.
    pub fn clear_temporaries(&self, id: ArchetypeId) -> Result<(), EcsError> {
        self.archetype(id)?.table().clear();
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    /// Resolve `components` into `query_ref`, once.
    ///
    /// A resolved ref returns immediately without taking the lock.
    /// Otherwise the first caller scans archetypes under the query lock
    /// (or reuses an earlier resolution of the same component list) and
    /// publishes the result; concurrent callers wait on the lock and then
    /// observe the published result.
    pub fn make_query(
        &self,
        components: &[ComponentId],
        query_ref: &QueryRef,
    ) -> Result<(), EcsError> {
        if query_ref.is_resolved() {
            return Ok(());
        }
        if let Some(&id) = components
            .iter()
            .find(|&&id| !self.registry.is_registered(id))
        {
            return Err(EcsError::UnknownComponent { id });
        }

        let mut cache = self.query_cache();
        if query_ref.is_resolved() {
            return Ok(());
        }
        let resolved = cache.resolve(components, &self.archetypes)?;
        query_ref.publish(resolved);
        Ok(())
    }

    /// Number of archetype scans performed by [`make_query`](Self::make_query).
    pub fn scan_count(&self) -> u64 {
        self.query_cache().scans()
    }

    /// Matching archetypes of a resolved query.
    pub fn query_matches(&self, query_ref: &QueryRef) -> Result<Vec<QueryMatch>, EcsError> {
        let resolved = query_ref.resolved().ok_or(EcsError::UnresolvedQuery)?;
        Ok(self.query_cache().matches(resolved))
    }

    /// Total rows across all archetypes matched by a resolved query.
    pub fn query_row_count(&self, query_ref: &QueryRef) -> Result<u64, EcsError> {
        let matches = self.query_matches(query_ref)?;
        Ok(matches
            .iter()
            .map(|m| self.archetypes[m.archetype.0 as usize].num_rows() as u64)
            .sum())
    }

    // -- entities -----------------------------------------------------------

    /// Create an entity with a fresh row in `archetype`, tagged with `world`.
    ///
    /// The Entity and WorldId columns are filled in; user columns start
    /// zeroed (or hold whatever a cleared row last contained).
    pub fn make_entity(&self, archetype: ArchetypeId, world: WorldId) -> Result<Entity, EcsError> {
        let store = self.archetype(archetype)?;
        let mut entities = self.entities();
        let entity = entities.allocate().ok_or(EcsError::EntityCapacity {
            max: self.config.max_entities,
        })?;
        let row = match store.table().alloc_row() {
            Ok(row) => row,
            Err(e) => {
                entities.release(entity);
                return Err(e);
            }
        };
        // The row was just allocated and is not yet visible to anyone else.
        unsafe {
            store.table().write(ENTITY_COLUMN, row, entity);
            store.table().write(WORLD_ID_COLUMN, row, world);
        }
        entities.set_location(entity, EntityLocation { archetype, row });
        Ok(entity)
    }

    /// Release `entity`. Its row stays in the table until the table is
    /// cleared; the stale handle in column 0 no longer validates.
    pub fn destroy_entity(&self, entity: Entity) -> bool {
        self.entities().release(entity)
    }

    /// Whether `entity` is still live.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.entity_location(entity).is_some()
    }

    /// Where a live entity's row lives.
    ///
    /// The row must still be in use and hold `entity` in its Entity column,
    /// so handles whose rows were cleared report `None`.
    pub fn entity_location(&self, entity: Entity) -> Option<EntityLocation> {
        let loc = self.entities().location(entity)?;
        let owner: Entity = self
            .archetypes
            .get(loc.archetype.0 as usize)?
            .table()
            .get(ENTITY_COLUMN, loc.row)?;
        (owner == entity).then_some(loc)
    }

    /// Number of live entities.
    pub fn num_entities(&self) -> usize {
        self.entities().live_count()
    }

    /// Read a component value of a live entity.
    pub fn get_component<T: bytemuck::Pod>(
        &self,
        entity: Entity,
        component: ComponentId,
    ) -> Result<T, EcsError> {
        let loc = self
            .entity_location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let store = self.archetype(loc.archetype)?;
        let col = store
            .column_index(component)
            .ok_or(EcsError::MissingComponent { entity, component })?;
        if !store.table().column_at(col).holds::<T>() {
            return Err(EcsError::ComponentTypeMismatch { component });
        }
        store
            .table()
            .get(col, loc.row)
            .ok_or(EcsError::StaleEntity { entity })
    }

    /// Overwrite a component value of a live entity.
    pub fn set_component<T: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        component: ComponentId,
        value: T,
    ) -> Result<(), EcsError> {
        let loc = self
            .entity_location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let store = self.archetype_mut(loc.archetype)?;
        let col = store
            .column_index(component)
            .ok_or(EcsError::MissingComponent { entity, component })?;
        if !store.table().column_at(col).holds::<T>() {
            return Err(EcsError::ComponentTypeMismatch { component });
        }
        if store.table_mut().set(col, loc.row, value) {
            Ok(())
        } else {
            Err(EcsError::StaleEntity { entity })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
