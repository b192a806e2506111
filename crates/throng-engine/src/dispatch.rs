//! Mapping from [`FuncId`] to invocation logic.
//!
//! The scheduler only ever names work by function id. The [`Dispatcher`] is
//! built once, before the graph, and resolves an id to an [`Invocation`]
//! that runs exactly one invocation per call without blocking.

use std::fmt;
use std::ptr::NonNull;

use throng_ecs::entity::WorldId;
use throng_ecs::state::StateManager;

use crate::arena::{RunArena, TmpAllocator};
use crate::node::{FuncId, NodeData, NodeId};
use crate::print::HostPrint;
use crate::taskgraph::TaskGraph;

// ---------------------------------------------------------------------------
// InvocationContext
// ---------------------------------------------------------------------------

/// Everything an invocation may look at besides its node data and offset.
#[derive(Clone, Copy)]
pub struct InvocationContext<'a> {
    pub(crate) state: &'a StateManager,
    pub(crate) graph: &'a TaskGraph,
    pub(crate) arena: &'a RunArena,
    pub(crate) print: &'a HostPrint,
    pub(crate) node: NodeId,
    pub(crate) block: u32,
    pub(crate) group: u32,
    pub(crate) lane: u32,
    pub(crate) thread_in_invocation: u32,
}

impl<'a> InvocationContext<'a> {
    pub fn state(&self) -> &'a StateManager {
        self.state
    }

    pub fn graph(&self) -> &'a TaskGraph {
        self.graph
    }

    /// The node being executed.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    /// Global index of the lock-step group.
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Lane within the group.
    pub fn lane(&self) -> u32 {
        self.lane
    }

    /// Which of the node's `threads_per_invocation` lanes this call is.
    pub fn thread_in_invocation(&self) -> u32 {
        self.thread_in_invocation
    }

    /// Read-only per-replica data.
    pub fn world_data(&self, world: WorldId) -> Option<&'a [u8]> {
        self.arena.world_data(world)
    }

    /// Writable per-replica data. See [`RunArena::world_data_ptr`] for the
    /// rules a writer must follow.
    pub fn world_data_ptr(&self, world: WorldId) -> Option<NonNull<[u8]>> {
        self.arena.world_data_ptr(world)
    }

    /// Scratch memory valid until the next run starts.
    pub fn tmp(&self) -> &'a TmpAllocator {
        self.arena.tmp()
    }

    /// Queue a diagnostic message; it is logged after the run.
    pub fn print(&self, message: impl Into<String>) -> bool {
        self.print.push(message)
    }
}

impl fmt::Debug for InvocationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("node", &self.node)
            .field("block", &self.block)
            .field("group", &self.group)
            .field("lane", &self.lane)
            .field("thread_in_invocation", &self.thread_in_invocation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One node's per-invocation logic.
pub trait Invocation: Send + Sync {
    /// Run invocation `offset` of the current node.
    fn invoke(&self, ctx: &InvocationContext<'_>, data: &NodeData, offset: u32);
}

impl<F> Invocation for F
where
    F: Fn(&InvocationContext<'_>, &NodeData, u32) + Send + Sync,
{
    #[inline]
    fn invoke(&self, ctx: &InvocationContext<'_>, data: &NodeData, offset: u32) {
        self(ctx, data, offset)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Registry of invocations, indexed by [`FuncId`].
#[derive(Default)]
pub struct Dispatcher {
    funcs: Vec<Box<dyn Invocation>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure and return the id nodes use to name it.
    pub fn register<F>(&mut self, f: F) -> FuncId
    where
        F: Fn(&InvocationContext<'_>, &NodeData, u32) + Send + Sync + 'static,
    {
        self.register_invocation(f)
    }

    /// Register any [`Invocation`] implementor.
    pub fn register_invocation(&mut self, invocation: impl Invocation + 'static) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Box::new(invocation));
        id
    }

    pub fn get(&self, func: FuncId) -> Option<&dyn Invocation> {
        self.funcs.get(func.0 as usize).map(|f| f.as_ref())
    }

    pub fn contains(&self, func: FuncId) -> bool {
        (func.0 as usize) < self.funcs.len()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("funcs", &self.funcs.len())
            .finish()
    }
}
