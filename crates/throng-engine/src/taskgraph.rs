//! The task graph scheduler.
//!
//! A [`TaskGraph`] is a fixed, already topologically sorted array of nodes
//! plus one global cursor naming the node currently being worked on. Each
//! node carries three counters:
//!
//! - `cur_offset`: next unclaimed invocation offset (fetch-and-add, kept
//!   64 bits wide so overshooting claims near `u32::MAX` cannot wrap),
//! - `remaining`: invocations not yet reported finished (fetch-and-sub),
//! - `total`: invocation count resolved when the node became current.
//!
//! The worker whose fetch-and-sub brings `remaining` to zero is the unique
//! retirer of that node. It resolves the counts of the following nodes,
//! skipping those with zero invocations, initializes the next one with
//! relaxed stores and then publishes it through a release store of the
//! cursor. Workers acquire-load the cursor before reading a node's
//! counters, so they never observe a node before it is initialized.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use throng_ecs::state::StateManager;
use tracing::{error, trace};

use crate::node::{FuncId, NodeId, NodeSpec};
use crate::trace::{DeviceEvent, DeviceTrace, TraceOrigin};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Node {
    spec: NodeSpec,
    cur_offset: AtomicU64,
    remaining: AtomicU32,
    total: AtomicU32,
}

// ---------------------------------------------------------------------------
// TaskGraphBuilder
// ---------------------------------------------------------------------------

/// Collects nodes in execution order.
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    nodes: Vec<NodeSpec>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node. Nodes run in the order they are added.
    pub fn add_node(&mut self, spec: NodeSpec) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(spec);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn build(self) -> TaskGraph {
        TaskGraph {
            nodes: self
                .nodes
                .into_iter()
                .map(|spec| Node {
                    spec,
                    cur_offset: AtomicU64::new(0),
                    remaining: AtomicU32::new(0),
                    total: AtomicU32::new(0),
                })
                .collect(),
            cursor: AtomicU32::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// Node array and progress counters for one run at a time.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<Node>,
    cursor: AtomicU32,
}

impl TaskGraph {
    #[inline]
    pub fn num_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Static description of `node`.
    pub fn node_spec(&self, node: NodeId) -> &NodeSpec {
        &self.nodes[node.0 as usize].spec
    }

    /// Every node's spec, in execution order.
    pub fn specs(&self) -> impl Iterator<Item = &NodeSpec> + '_ {
        self.nodes.iter().map(|n| &n.spec)
    }

    /// Index of the current node; equals [`num_nodes`](Self::num_nodes)
    /// once the run is over.
    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Whether every node has retired.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.cursor() >= self.num_nodes()
    }

    /// Invocation count `node` resolved to in the current (or last) run.
    #[inline]
    pub fn total(&self, node: NodeId) -> u32 {
        self.nodes[node.0 as usize].total.load(Ordering::Relaxed)
    }

    /// Invocations of `node` not yet reported finished.
    #[inline]
    pub fn remaining(&self, node: NodeId) -> u32 {
        self.nodes[node.0 as usize].remaining.load(Ordering::Acquire)
    }

    /// Raw claim counter of `node`. May exceed `total` once claims overshoot.
    #[inline]
    pub fn claimed(&self, node: NodeId) -> u64 {
        self.nodes[node.0 as usize].cur_offset.load(Ordering::Relaxed)
    }

    /// Function and threads-per-invocation of `node`.
    #[inline]
    pub(crate) fn dispatch_info(&self, node: NodeId) -> (FuncId, u32) {
        let spec = &self.nodes[node.0 as usize].spec;
        (spec.func, spec.threads_per_invocation)
    }

    // -- protocol -----------------------------------------------------------

    /// Reset the graph and make the first non-empty node current.
    ///
    /// Must be called by exactly one worker before any claim, and never
    /// while another run uses this graph.
    pub fn init(&self, state: &StateManager, device_trace: &DeviceTrace) {
        device_trace.reset();
        for node in &self.nodes {
            node.cur_offset.store(0, Ordering::Relaxed);
            node.remaining.store(0, Ordering::Relaxed);
            node.total.store(0, Ordering::Relaxed);
        }
        self.advance_from(0, state, device_trace, TraceOrigin::FIRST);
    }

    /// Claim `batch` invocation offsets of `node`; returns the first one.
    ///
    /// The result may be at or past the node's total, meaning the node has
    /// no work left to hand out. Bases past `u32::MAX` saturate, which is
    /// still past any total.
    #[inline]
    pub fn claim(&self, node: NodeId, batch: u32) -> u32 {
        let base = self.nodes[node.0 as usize]
            .cur_offset
            .fetch_add(u64::from(batch), Ordering::Relaxed);
        u32::try_from(base).unwrap_or(u32::MAX)
    }

    /// Report `finished` invocations of `node` as done.
    ///
    /// Returns `true` for the unique caller that brought the remaining
    /// count to zero; that caller has already advanced the cursor.
    ///
    /// # Panics
    ///
    /// Panics when more invocations are reported than remain.
    pub fn report_finished(
        &self,
        node: NodeId,
        finished: u32,
        state: &StateManager,
        device_trace: &DeviceTrace,
        origin: TraceOrigin,
    ) -> bool {
        if finished == 0 {
            return false;
        }
        let n = &self.nodes[node.0 as usize];
        let prev = n.remaining.fetch_sub(finished, Ordering::AcqRel);
        if prev < finished {
            error!(
                node = node.0,
                prev, finished, "more invocations finished than remained"
            );
            panic!(
                "node {} finished {finished} invocations with only {prev} remaining",
                node.0
            );
        }
        if prev != finished {
            return false;
        }

        let total = n.total.load(Ordering::Relaxed);
        trace!(node = node.0, total, "node retired");
        device_trace.record(DeviceEvent::NodeFinish, n.spec.func, total, node, origin);
        self.advance_from(node.0 + 1, state, device_trace, origin);
        true
    }

    /// Make the first node at or after `start` with a non-zero count
    /// current, or finish the run if there is none.
    fn advance_from(
        &self,
        start: u32,
        state: &StateManager,
        device_trace: &DeviceTrace,
        origin: TraceOrigin,
    ) {
        let mut idx = start;
        while idx < self.num_nodes() {
            let node = &self.nodes[idx as usize];
            let count = if node.spec.is_dynamic() {
                resolve_dynamic(NodeId(idx), &node.spec, state)
            } else {
                node.spec.fixed_count
            };
            node.total.store(count, Ordering::Relaxed);
            if count == 0 {
                trace!(node = idx, "skipping node with no invocations");
                idx += 1;
                continue;
            }

            node.cur_offset.store(0, Ordering::Relaxed);
            node.remaining.store(count, Ordering::Relaxed);
            device_trace.record(
                DeviceEvent::NodeStart,
                node.spec.func,
                count,
                NodeId(idx),
                origin,
            );
            trace!(node = idx, count, "node started");
            break;
        }
        self.cursor.store(idx, Ordering::Release);
    }
}

/// Evaluate a dynamic node's count accessor. Invalid counts are fatal.
fn resolve_dynamic(node: NodeId, spec: &NodeSpec, state: &StateManager) -> u32 {
    let raw = spec.data.dynamic_count(state);
    match raw.map(u32::try_from) {
        Some(Ok(count)) => count,
        Some(Err(_)) => {
            error!(node = node.0, count = ?raw, "invalid invocation count");
            panic!("node {} resolved an invalid invocation count {raw:?}", node.0);
        }
        None => {
            error!(node = node.0, "dynamic node has no count accessor");
            panic!("node {} is dynamic but has no count accessor", node.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
