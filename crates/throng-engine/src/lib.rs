//! Throng Engine -- a lock-free task graph scheduler over Throng ECS.
//!
//! A run executes a fixed, pre-sorted list of nodes. Each node is a batch of
//! independent invocations, either a fixed count or a count read from the
//! ECS when the node becomes current (typically an archetype's row count).
//! A pool of worker groups claims invocation offsets with fetch-and-add,
//! reports completions with fetch-and-sub, and the unique worker that
//! completes a node advances the global cursor to the next one.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use throng_engine::prelude::*;
//!
//! let config = EngineConfig::default();
//! let mut state = StateManager::new(config.state.clone()).unwrap();
//! let arch = state.register_archetype(&[]).unwrap();
//! for _ in 0..5 {
//!     state.make_entity(arch, WorldId(0)).unwrap();
//! }
//!
//! let hits = Arc::new(AtomicU32::new(0));
//! let mut dispatcher = Dispatcher::new();
//! let seen = Arc::clone(&hits);
//! let count_rows = dispatcher.register(move |_ctx, _data, _offset| {
//!     seen.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! let mut builder = TaskGraphBuilder::new();
//! builder.add_node(NodeSpec::dynamic(count_rows, NodeData::archetype_rows(arch)));
//!
//! let mut engine = Engine::new(config, state, builder.build(), dispatcher).unwrap();
//! engine.run();
//! assert_eq!(hits.load(Ordering::Relaxed), 5);
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod arena;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod layout;
pub mod node;
pub mod print;
pub mod taskgraph;
pub mod trace;
pub mod worker;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use throng_ecs;

use node::{FuncId, NodeId};
use throng_ecs::EcsError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while configuring or building an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Ecs(#[from] EcsError),

    #[error("node {node:?} refers to unregistered function {func:?}")]
    UnknownFunction { node: NodeId, func: FuncId },

    #[error("node {node:?} is dynamic but has no count accessor")]
    MissingCount { node: NodeId },

    /// Threads per invocation must be a power of two dividing the group
    /// width, or the block width when wider than a group.
    #[error(
        "node {node:?} uses {threads} threads per invocation, which does not tile \
         groups of {lanes_per_group} lanes or blocks of {block_threads} lanes"
    )]
    InvalidThreadsPerInvocation {
        node: NodeId,
        threads: u32,
        lanes_per_group: u32,
        block_threads: u32,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use throng_ecs::prelude::*;

    pub use crate::arena::{RunArena, TmpAllocator};
    pub use crate::config::{EngineConfig, LaunchConfig, TraceConfig};
    pub use crate::dispatch::{Dispatcher, Invocation, InvocationContext};
    pub use crate::engine::{Engine, NodeReport, RunReport, TraceFiles};
    pub use crate::layout::{LaunchLayout, Region};
    pub use crate::node::{FuncId, NodeData, NodeId, NodeSpec};
    pub use crate::print::HostPrint;
    pub use crate::taskgraph::{TaskGraph, TaskGraphBuilder};
    pub use crate::trace::{
        DeviceEvent, DeviceTrace, DeviceTraceRecord, HostEvent, HostTracing, TraceOrigin,
    };
    pub use crate::worker::{LaneMask, Work, WorkerState};
    pub use crate::EngineError;
}
