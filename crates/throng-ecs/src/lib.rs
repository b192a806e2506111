//! Throng ECS -- fixed-capacity archetype storage with cached queries.
//!
//! Components are registered as raw layouts (alignment and size). Every
//! archetype owns one [`Table`](table::Table) whose columns are reserved up
//! front for the maximum row count and committed in chunks of one row per
//! world. Column 0 of every table holds the [`Entity`](entity::Entity)
//! handle and column 1 the [`WorldId`](entity::WorldId).
//!
//! Queries are resolved once into a shared result buffer and cached behind a
//! [`QueryRef`](query::QueryRef), so that many workers can ask for the same
//! query concurrently and only one of them pays for the archetype scan.
//!
//! # Quick Start
//!
//! ```
//! use throng_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
//! #[repr(C)]
//! struct Position { x: f32, y: f32 }
//!
//! let mut state = StateManager::new(StateConfig::default()).unwrap();
//! let pos = state.register_component_type::<Position>().unwrap();
//! let arch = state.register_archetype(&[pos]).unwrap();
//!
//! let e = state.make_entity(arch, WorldId(0)).unwrap();
//! state.set_component(e, pos, Position { x: 1.0, y: 2.0 }).unwrap();
//!
//! static QUERY: QueryRef = QueryRef::new();
//! state.make_query(&[ComponentId::ENTITY, pos], &QUERY).unwrap();
//! assert_eq!(state.query_row_count(&QUERY).unwrap(), 1);
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod component;
pub mod entity;
pub mod query;
#[allow(unsafe_code)]
pub mod state;
#[allow(unsafe_code)]
pub mod table;

use archetype::ArchetypeId;
use component::ComponentId;
use entity::Entity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcsError {
    #[error("invalid state configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Alignment must be a non-zero power of two.
    #[error("invalid component layout (alignment {alignment}, {num_bytes} bytes)")]
    InvalidLayout { alignment: u32, num_bytes: u32 },

    #[error("component {id:?} is already registered")]
    DuplicateComponent { id: ComponentId },

    #[error("component {id:?} is not registered")]
    UnknownComponent { id: ComponentId },

    #[error("component registry is full ({max} slots)")]
    ComponentCapacity { max: u32 },

    /// An archetype listed the same component twice, or listed Entity or
    /// WorldId explicitly.
    #[error("component {id:?} appears more than once in archetype")]
    DuplicateArchetypeComponent { id: ComponentId },

    #[error("archetype limit reached ({max})")]
    ArchetypeCapacity { max: u32 },

    #[error("archetype component array is full ({max} entries)")]
    ArchetypeComponentCapacity { max: u32 },

    #[error("archetype {id:?} does not exist")]
    UnknownArchetype { id: ArchetypeId },

    #[error("table is full ({max_rows} rows)")]
    TableFull { max_rows: u32 },

    #[error("query result buffer is full ({max} words)")]
    QueryDataFull { max: u32 },

    #[error("query has not been resolved")]
    UnresolvedQuery,

    #[error("entity store is full ({max} entities)")]
    EntityCapacity { max: u32 },

    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: Entity },

    #[error("entity {entity:?} has no component {component:?}")]
    MissingComponent {
        entity: Entity,
        component: ComponentId,
    },

    /// The requested Rust type does not match the registered layout.
    #[error("component {component:?} does not have the layout of the requested type")]
    ComponentTypeMismatch { component: ComponentId },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{ArchetypeId, ArchetypeStore};
    pub use crate::component::{ComponentId, ComponentRegistry, TypeInfo};
    pub use crate::entity::{Entity, EntityLocation, WorldId};
    pub use crate::query::{QueryMatch, QueryRef};
    pub use crate::state::{StateConfig, StateManager};
    pub use crate::table::{Column, Table};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
