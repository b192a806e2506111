//! Cached component-set queries.
//!
//! A query maps a requested list of components to every archetype whose
//! column set is a superset of it, together with the column index of each
//! requested component in that archetype. Results are written once into a
//! shared `u32` buffer and described by a [`QueryRef`]:
//!
//! ```text
//! [archetype, col_0, col_1, .., col_n-1,  archetype, col_0, ..]
//!  \___________ one match ___________/
//! ```
//!
//! Resolution happens at most once per `QueryRef` and at most once per
//! distinct component list; see [`StateManager::make_query`](crate::state::StateManager::make_query).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::archetype::{ArchetypeId, ArchetypeStore};
use crate::component::ComponentId;
use crate::EcsError;

/// Sentinel stored in `QueryRef::num_matching_archetypes` until resolution.
pub const UNRESOLVED: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// QueryRef
// ---------------------------------------------------------------------------

/// Cached descriptor of a resolved query.
///
/// `offset` and `num_components` are stored first; the match count is then
/// published with a release store, so any thread that observes a resolved
/// match count also observes the rest of the descriptor.
#[derive(Debug)]
pub struct QueryRef {
    offset: AtomicU32,
    num_matching_archetypes: AtomicU32,
    num_components: AtomicU32,
}

impl QueryRef {
    /// A fresh, unresolved query reference.
    pub const fn new() -> Self {
        Self {
            offset: AtomicU32::new(0),
            num_matching_archetypes: AtomicU32::new(UNRESOLVED),
            num_components: AtomicU32::new(0),
        }
    }

    /// Whether the query has been resolved.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.num_matching_archetypes.load(Ordering::Acquire) != UNRESOLVED
    }

    /// Offset of the first match in the shared result buffer.
    #[inline]
    pub fn offset(&self) -> Option<u32> {
        self.resolved().map(|r| r.offset)
    }

    /// Number of archetypes that matched.
    #[inline]
    pub fn num_matching_archetypes(&self) -> Option<u32> {
        self.resolved().map(|r| r.num_matching)
    }

    /// Number of requested components.
    #[inline]
    pub fn num_components(&self) -> Option<u32> {
        self.resolved().map(|r| r.num_components)
    }

    pub(crate) fn resolved(&self) -> Option<ResolvedQuery> {
        let num_matching = self.num_matching_archetypes.load(Ordering::Acquire);
        if num_matching == UNRESOLVED {
            return None;
        }
        Some(ResolvedQuery {
            offset: self.offset.load(Ordering::Relaxed),
            num_matching,
            num_components: self.num_components.load(Ordering::Relaxed),
        })
    }

    pub(crate) fn publish(&self, resolved: ResolvedQuery) {
        self.offset.store(resolved.offset, Ordering::Relaxed);
        self.num_components
            .store(resolved.num_components, Ordering::Relaxed);
        self.num_matching_archetypes
            .store(resolved.num_matching, Ordering::Release);
    }
}

impl Default for QueryRef {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// QueryMatch
// ---------------------------------------------------------------------------

/// One matching archetype and the column of each requested component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMatch {
    pub archetype: ArchetypeId,
    /// Column index per requested component, in request order.
    pub columns: Vec<u32>,
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedQuery {
    pub offset: u32,
    pub num_matching: u32,
    pub num_components: u32,
}

/// Shared query result buffer plus a memo keyed by query signature.
/// Always accessed under the state manager's query lock.
#[derive(Debug)]
pub(crate) struct QueryCache {
    data: Vec<u32>,
    max_data: u32,
    by_signature: HashMap<Vec<ComponentId>, ResolvedQuery>,
    scans: u64,
}

impl QueryCache {
    pub fn new(max_data: u32) -> Self {
        Self {
            data: Vec::new(),
            max_data,
            by_signature: HashMap::new(),
            scans: 0,
        }
    }

    /// Number of archetype scans performed so far.
    pub fn scans(&self) -> u64 {
        self.scans
    }

    /// Resolve `components` against `archetypes`, scanning only if this
    /// signature has never been seen.
    pub fn resolve(
        &mut self,
        components: &[ComponentId],
        archetypes: &[ArchetypeStore],
    ) -> Result<ResolvedQuery, EcsError> {
        if let Some(&hit) = self.by_signature.get(components) {
            return Ok(hit);
        }

        self.scans += 1;
        let mut found = Vec::new();
        let mut num_matching = 0u32;
        for (idx, archetype) in archetypes.iter().enumerate() {
            let has_components = components
                .iter()
                .all(|&c| c == ComponentId::ENTITY || archetype.has_component(c));
            if !has_components {
                continue;
            }
            num_matching += 1;
            found.push(idx as u32);
            found.extend(
                components
                    .iter()
                    .filter_map(|&c| archetype.column_index(c)),
            );
        }

        let offset = self.data.len() as u32;
        if offset as usize + found.len() > self.max_data as usize {
            return Err(EcsError::QueryDataFull {
                max: self.max_data,
            });
        }
        self.data.extend_from_slice(&found);

        let resolved = ResolvedQuery {
            offset,
            num_matching,
            num_components: components.len() as u32,
        };
        self.by_signature.insert(components.to_vec(), resolved);
        debug!(
            components = ?components,
            num_matching,
            offset,
            "resolved query"
        );
        Ok(resolved)
    }

    /// Decode the matches of a resolved query.
    pub fn matches(&self, resolved: ResolvedQuery) -> Vec<QueryMatch> {
        let stride = resolved.num_components as usize + 1;
        let start = resolved.offset as usize;
        let end = start + stride * resolved.num_matching as usize;
        self.data[start..end]
            .chunks_exact(stride)
            .map(|chunk| QueryMatch {
                archetype: ArchetypeId(chunk[0]),
                columns: chunk[1..].to_vec(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
