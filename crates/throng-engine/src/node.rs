//! Node descriptions: what a node runs, how many times, and with which data.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use throng_ecs::archetype::ArchetypeId;
use throng_ecs::query::QueryRef;
use throng_ecs::state::StateManager;

/// Identifies a registered invocation in the [`Dispatcher`](crate::dispatch::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

/// Position of a node in the sorted node array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

type CountFn = dyn Fn(&StateManager) -> i64 + Send + Sync;

// ---------------------------------------------------------------------------
// NodeData
// ---------------------------------------------------------------------------

/// Per-node payload handed to every invocation, plus the accessor that
/// yields the invocation count of dynamic nodes.
///
/// The count accessor returns `i64` so that a misbehaving accessor can be
/// detected: negative counts, or counts above `u32::MAX`, abort the run.
#[derive(Clone, Default)]
pub struct NodeData {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    count: Option<Arc<CountFn>>,
}

impl NodeData {
    /// Empty data: no payload, no count accessor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Data carrying `payload`.
    pub fn with_payload<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Some(Arc::new(payload)),
            count: None,
        }
    }

    /// Attach a count accessor, read every time the node becomes current.
    pub fn with_count<F>(mut self, count: F) -> Self
    where
        F: Fn(&StateManager) -> i64 + Send + Sync + 'static,
    {
        self.count = Some(Arc::new(count));
        self
    }

    /// Count = rows currently in `archetype`.
    pub fn archetype_rows(archetype: ArchetypeId) -> Self {
        Self::new().with_archetype_rows(archetype)
    }

    /// Attach an archetype row-count accessor to existing data.
    pub fn with_archetype_rows(self, archetype: ArchetypeId) -> Self {
        // An unknown archetype yields an invalid count and aborts the run.
        self.with_count(move |state| state.num_rows(archetype).map_or(-1, i64::from))
    }

    /// Count = rows across every archetype matched by `query`.
    ///
    /// The query must be resolved before the node becomes current.
    pub fn query_rows(query: Arc<QueryRef>) -> Self {
        Self::new().with_count(move |state| {
            state
                .query_row_count(&query)
                .ok()
                .and_then(|rows| i64::try_from(rows).ok())
                .unwrap_or(-1)
        })
    }

    /// The payload, if it is a `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref()
    }

    /// Whether a count accessor is attached.
    pub fn has_count(&self) -> bool {
        self.count.is_some()
    }

    /// Evaluate the count accessor.
    pub fn dynamic_count(&self, state: &StateManager) -> Option<i64> {
        self.count.as_ref().map(|count| count(state))
    }
}

impl fmt::Debug for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeData")
            .field("has_payload", &self.payload.is_some())
            .field("has_count", &self.count.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

/// Static description of one node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub func: FuncId,
    /// Lanes that cooperate on one invocation. Power of two.
    pub threads_per_invocation: u32,
    /// Invocations per run; `0` selects `data`'s count accessor.
    pub fixed_count: u32,
    pub data: NodeData,
}

impl NodeSpec {
    /// A node that always runs `count` invocations.
    pub fn fixed(func: FuncId, count: u32) -> Self {
        Self {
            func,
            threads_per_invocation: 1,
            fixed_count: count,
            data: NodeData::new(),
        }
    }

    /// A node whose count is read from `data` when it becomes current.
    pub fn dynamic(func: FuncId, data: NodeData) -> Self {
        Self {
            func,
            threads_per_invocation: 1,
            fixed_count: 0,
            data,
        }
    }

    pub fn with_threads_per_invocation(mut self, threads: u32) -> Self {
        self.threads_per_invocation = threads;
        self
    }

    pub fn with_data(mut self, data: NodeData) -> Self {
        self.data = data;
        self
    }

    /// Whether the invocation count is read at run time.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.fixed_count == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use throng_ecs::component::ComponentId;
    use throng_ecs::entity::WorldId;
    use throng_ecs::state::StateConfig;

    #[test]
    fn payload_downcasts_to_its_own_type_only() {
        let data = NodeData::with_payload(7u64);
        assert_eq!(data.payload::<u64>(), Some(&7));
        assert_eq!(data.payload::<u32>(), None);
        assert_eq!(NodeData::new().payload::<u64>(), None);
    }

    #[test]
    fn archetype_rows_tracks_the_table() {
        let mut state = StateManager::new(StateConfig::default()).unwrap();
        let arch = state.register_archetype(&[]).unwrap();
        let data = NodeData::archetype_rows(arch);
        assert_eq!(data.dynamic_count(&state), Some(0));
        for _ in 0..5 {
            state.make_entity(arch, WorldId(0)).unwrap();
        }
        assert_eq!(data.dynamic_count(&state), Some(5));
    }

    #[test]
    fn unknown_archetype_gives_invalid_count() {
        let state = StateManager::new(StateConfig::default()).unwrap();
        let data = NodeData::archetype_rows(ArchetypeId::from_raw(3));
        assert_eq!(data.dynamic_count(&state), Some(-1));
    }

    #[test]
    fn query_rows_requires_resolution() {
        let mut state = StateManager::new(StateConfig::default()).unwrap();
        let a = state.register_component(4, 4).unwrap();
        let arch = state.register_archetype(&[a]).unwrap();
        state.make_entity(arch, WorldId(0)).unwrap();

        let query = Arc::new(QueryRef::new());
        let data = NodeData::query_rows(Arc::clone(&query));
        assert_eq!(data.dynamic_count(&state), Some(-1));

        state.make_query(&[ComponentId::ENTITY, a], &query).unwrap();
        assert_eq!(data.dynamic_count(&state), Some(1));
    }

    #[test]
    fn fixed_and_dynamic_specs() {
        let fixed = NodeSpec::fixed(FuncId(1), 4);
        assert!(!fixed.is_dynamic());
        let dynamic = NodeSpec::dynamic(FuncId(2), NodeData::new().with_count(|_| 3))
            .with_threads_per_invocation(4);
        assert!(dynamic.is_dynamic());
        assert_eq!(dynamic.threads_per_invocation, 4);
    }
}
