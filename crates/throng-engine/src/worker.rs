//! The worker pool: a host rendition of a persistent "megakernel".
//!
//! A launch is `num_blocks` blocks of `groups_per_block` lock-step groups of
//! `lanes_per_group` lanes. Each group runs on its own host thread, which
//! evaluates all of the group's lanes in lock-step. Groups of one block
//! share a [`BlockState`] and synchronize on a block barrier.
//!
//! Every group repeats `get_work` / execute / `finish_work` until the
//! scheduler's cursor reaches the end of the graph:
//!
//! - When the block has no node, the block leader reads the cursor and
//!   claims one batch covering every lane of the block.
//! - Nodes with `threads_per_invocation <= lanes_per_group` are then claimed
//!   per group, without involving the rest of the block.
//! - Wider nodes are claimed per block: the leader claims between two
//!   barriers and every group derives its lanes' offsets from that base.
//! - Lanes whose offset is past the node's total sit the pass out
//!   ([`WorkerState::PartialRun`]) while their group-mates run.
//! - When a claim comes back empty the block looks for the next node; if
//!   the cursor has not moved yet the whole block yields and retries
//!   ([`WorkerState::Loop`]).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;

use throng_ecs::state::StateManager;
use tracing::{error, trace, trace_span};

use crate::arena::RunArena;
use crate::config::LaunchConfig;
use crate::dispatch::{Dispatcher, InvocationContext};
use crate::node::{FuncId, NodeId};
use crate::print::HostPrint;
use crate::taskgraph::TaskGraph;
use crate::trace::{DeviceEvent, DeviceTrace, TraceOrigin};

/// Marks "no node claimed" in [`BlockState::init_offset`].
const NO_WORK: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Lane-level types
// ---------------------------------------------------------------------------

/// Ballot of the lanes of one group, bit `i` for lane `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaneMask(pub u64);

impl LaneMask {
    pub const EMPTY: LaneMask = LaneMask(0);

    /// Every lane of a `lanes`-wide group.
    pub fn full(lanes: u32) -> Self {
        if lanes >= 64 {
            LaneMask(u64::MAX)
        } else {
            LaneMask((1u64 << lanes) - 1)
        }
    }

    #[inline]
    pub fn set(&mut self, lane: u32) {
        self.0 |= 1 << lane;
    }

    #[inline]
    pub fn contains(self, lane: u32) -> bool {
        self.0 & (1 << lane) != 0
    }

    /// Number of lanes in the ballot.
    #[inline]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// One lane's share of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Work {
    pub node: NodeId,
    pub func: FuncId,
    pub invocation_offset: u32,
    pub thread_in_invocation: u32,
}

/// What a lane does in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Run(Work),
    /// The group has work but this lane's offset is past the total.
    PartialRun,
    /// No claimable work yet; yield and ask again.
    Loop,
    /// The graph is done.
    Exit,
}

// ---------------------------------------------------------------------------
// BlockBarrier
// ---------------------------------------------------------------------------

/// Returned by every wait once the run has been aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Aborted;

#[derive(Debug)]
struct BarrierState {
    arrived: u32,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be torn down, releasing every waiter, when a
/// participant dies.
#[derive(Debug)]
struct BlockBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    parties: u32,
}

impl BlockBarrier {
    fn new(parties: u32) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cvar: Condvar::new(),
            parties,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self) -> Result<(), Aborted> {
        let mut state = self.lock();
        if state.aborted {
            return Err(Aborted);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.generation == generation {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        self.lock().aborted = true;
        self.cvar.notify_all();
    }
}

// ---------------------------------------------------------------------------
// BlockState
// ---------------------------------------------------------------------------

/// Node metadata cached by a block. Written only by the block leader between
/// two barriers, so relaxed accesses suffice.
#[derive(Debug)]
struct BlockState {
    node_idx: AtomicU32,
    total: AtomicU32,
    func: AtomicU32,
    threads_per_invocation: AtomicU32,
    /// Base offset of the block's latest claim, or [`NO_WORK`].
    init_offset: AtomicU32,
    /// Lanes of the block that executed in the current block-wide pass.
    finished_threads: AtomicU32,
    barrier: BlockBarrier,
}

impl BlockState {
    fn new(groups: u32) -> Self {
        Self {
            node_idx: AtomicU32::new(NO_WORK),
            total: AtomicU32::new(0),
            func: AtomicU32::new(0),
            threads_per_invocation: AtomicU32::new(1),
            init_offset: AtomicU32::new(NO_WORK),
            finished_threads: AtomicU32::new(0),
            barrier: BlockBarrier::new(groups),
        }
    }
}

// ---------------------------------------------------------------------------
// Megakernel
// ---------------------------------------------------------------------------

/// One launch of the worker pool over a graph.
pub(crate) struct Megakernel<'a> {
    launch: LaunchConfig,
    graph: &'a TaskGraph,
    state: &'a StateManager,
    dispatcher: &'a Dispatcher,
    arena: &'a RunArena,
    print: &'a HostPrint,
    device_trace: &'a DeviceTrace,
    blocks: Vec<BlockState>,
    start_barrier: BlockBarrier,
    aborted: AtomicBool,
}

impl<'a> Megakernel<'a> {
    pub fn new(
        launch: LaunchConfig,
        graph: &'a TaskGraph,
        state: &'a StateManager,
        dispatcher: &'a Dispatcher,
        arena: &'a RunArena,
        print: &'a HostPrint,
        device_trace: &'a DeviceTrace,
    ) -> Self {
        Self {
            blocks: (0..launch.num_blocks)
                .map(|_| BlockState::new(launch.groups_per_block))
                .collect(),
            start_barrier: BlockBarrier::new(launch.total_groups()),
            aborted: AtomicBool::new(false),
            launch,
            graph,
            state,
            dispatcher,
            arena,
            print,
            device_trace,
        }
    }

    /// Run the graph to completion on `total_groups` threads.
    ///
    /// A panic on any worker (a fatal scheduling violation or a panicking
    /// invocation) tears down every barrier so the remaining workers exit,
    /// then resumes unwinding on the caller's thread.
    pub fn launch(&self) {
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.launch.num_blocks)
                .flat_map(|block| {
                    (0..self.launch.groups_per_block).map(move |group| (block, group))
                })
                .map(|(block, group)| s.spawn(move || self.run_group(block, group)))
                .collect();

            let mut first_panic = None;
            for handle in handles {
                if let Err(payload) = handle.join() {
                    first_panic.get_or_insert(payload);
                }
            }
            if let Some(payload) = first_panic {
                std::panic::resume_unwind(payload);
            }
        });
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
        self.start_barrier.abort();
        for block in &self.blocks {
            block.barrier.abort();
        }
    }

    fn run_group(&self, block_id: u32, group_in_block: u32) {
        let group_id = block_id * self.launch.groups_per_block + group_in_block;
        let _span = trace_span!("group", block = block_id, group = group_id).entered();
        let _guard = AbortOnPanic(self);

        let mut worker = GroupWorker {
            kernel: self,
            block: &self.blocks[block_id as usize],
            origin: TraceOrigin {
                block: block_id,
                group: group_id,
            },
            group_in_block,
            lanes: self.launch.lanes_per_group,
            block_threads: self.launch.block_threads(),
            states: vec![WorkerState::Loop; self.launch.lanes_per_group as usize],
        };
        if worker.run().is_err() {
            trace!("worker released by abort");
        }
    }
}

/// Tears the launch down if the owning worker unwinds.
struct AbortOnPanic<'k, 'a>(&'k Megakernel<'a>);

impl Drop for AbortOnPanic<'_, '_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// GroupWorker
// ---------------------------------------------------------------------------

struct GroupWorker<'k, 'a> {
    kernel: &'k Megakernel<'a>,
    block: &'k BlockState,
    origin: TraceOrigin,
    group_in_block: u32,
    lanes: u32,
    block_threads: u32,
    states: Vec<WorkerState>,
}

impl GroupWorker<'_, '_> {
    #[inline]
    fn is_leader(&self) -> bool {
        self.group_in_block == 0
    }

    fn run(&mut self) -> Result<(), Aborted> {
        let kernel = self.kernel;
        if self.origin.block == 0 && self.is_leader() {
            kernel.graph.init(kernel.state, kernel.device_trace);
        }
        kernel.start_barrier.wait()?;

        loop {
            self.get_work()?;
            match self.states[0] {
                WorkerState::Exit => return Ok(()),
                WorkerState::Loop => {
                    if kernel.aborted.load(Ordering::Relaxed) {
                        return Err(Aborted);
                    }
                    thread::yield_now();
                }
                WorkerState::Run(_) | WorkerState::PartialRun => {
                    let executed = self.execute();
                    self.finish_work(executed)?;
                }
            }
        }
    }

    /// Fill `states` for the next pass.
    fn get_work(&mut self) -> Result<(), Aborted> {
        let block = self.block;
        if block.init_offset.load(Ordering::Relaxed) == NO_WORK {
            return self.next_node();
        }

        let node = NodeId(block.node_idx.load(Ordering::Relaxed));
        let total = block.total.load(Ordering::Relaxed);
        let tpi = block.threads_per_invocation.load(Ordering::Relaxed);

        if tpi > self.lanes {
            block.barrier.wait()?;
            if self.is_leader() {
                let base = self.kernel.graph.claim(node, self.block_threads / tpi);
                block.init_offset.store(base, Ordering::Relaxed);
            }
            block.barrier.wait()?;
            let base = block.init_offset.load(Ordering::Relaxed);
            if base >= total {
                return self.next_node();
            }
            self.assign(node, base, self.group_in_block * self.lanes);
        } else {
            let base = self.kernel.graph.claim(node, self.lanes / tpi);
            if base >= total {
                return self.next_node();
            }
            self.assign(node, base, 0);
        }
        Ok(())
    }

    /// Block-wide search for the next node.
    fn next_node(&mut self) -> Result<(), Aborted> {
        let block = self.block;
        block.barrier.wait()?;
        if self.is_leader() {
            self.update_block_state();
        }
        block.barrier.wait()?;

        if block.node_idx.load(Ordering::Relaxed) >= self.kernel.graph.num_nodes() {
            self.states.fill(WorkerState::Exit);
            return Ok(());
        }
        let base = block.init_offset.load(Ordering::Relaxed);
        if base == NO_WORK {
            self.states.fill(WorkerState::Loop);
            return Ok(());
        }
        let node = NodeId(block.node_idx.load(Ordering::Relaxed));
        self.assign(node, base, self.group_in_block * self.lanes);
        Ok(())
    }

    /// Leader only, between two block barriers.
    fn update_block_state(&self) {
        let block = self.block;
        let kernel = self.kernel;
        let graph = kernel.graph;
        let cached = block.node_idx.load(Ordering::Relaxed);

        if block.init_offset.load(Ordering::Relaxed) != NO_WORK {
            kernel.device_trace.record(
                DeviceEvent::BlockWait,
                FuncId(block.func.load(Ordering::Relaxed)),
                block.total.load(Ordering::Relaxed),
                NodeId(cached),
                self.origin,
            );
        }

        let cursor = graph.cursor();
        if cursor >= graph.num_nodes() {
            block.node_idx.store(cursor, Ordering::Relaxed);
            block.init_offset.store(NO_WORK, Ordering::Relaxed);
            kernel.device_trace.record(
                DeviceEvent::BlockExit,
                FuncId(0),
                0,
                NodeId(cursor),
                self.origin,
            );
            return;
        }
        if cursor == cached {
            block.init_offset.store(NO_WORK, Ordering::Relaxed);
            return;
        }

        let node = NodeId(cursor);
        let total = graph.total(node);
        let (func, tpi) = graph.dispatch_info(node);
        block.node_idx.store(cursor, Ordering::Relaxed);
        block.total.store(total, Ordering::Relaxed);
        block.func.store(func.0, Ordering::Relaxed);
        block.threads_per_invocation.store(tpi, Ordering::Relaxed);
        let base = graph.claim(node, self.block_threads / tpi);
        block.init_offset.store(base, Ordering::Relaxed);

        trace!(node = cursor, total, base, "block picked up node");
        kernel
            .device_trace
            .record(DeviceEvent::BlockStart, func, total, node, self.origin);
    }

    /// Give each lane its offset. `first_thread` is the index of lane 0
    /// within the claimed batch.
    fn assign(&mut self, node: NodeId, base: u32, first_thread: u32) {
        let block = self.block;
        let total = block.total.load(Ordering::Relaxed);
        let tpi = block.threads_per_invocation.load(Ordering::Relaxed);
        let func = FuncId(block.func.load(Ordering::Relaxed));

        for (lane, state) in self.states.iter_mut().enumerate() {
            let thread = first_thread + lane as u32;
            let offset = base.saturating_add(thread / tpi);
            *state = if offset < total {
                WorkerState::Run(Work {
                    node,
                    func,
                    invocation_offset: offset,
                    thread_in_invocation: thread % tpi,
                })
            } else {
                WorkerState::PartialRun
            };
        }
    }

    /// Run every lane holding work. Returns the ballot of lanes that ran.
    fn execute(&self) -> LaneMask {
        let kernel = self.kernel;
        let mut executed = LaneMask::EMPTY;
        for (lane, state) in self.states.iter().enumerate() {
            let WorkerState::Run(work) = *state else {
                continue;
            };
            let Some(invocation) = kernel.dispatcher.get(work.func) else {
                error!(func = work.func.0, node = work.node.0, "no invocation registered");
                panic!("no invocation registered for function {}", work.func.0);
            };
            let ctx = InvocationContext {
                state: kernel.state,
                graph: kernel.graph,
                arena: kernel.arena,
                print: kernel.print,
                node: work.node,
                block: self.origin.block,
                group: self.origin.group,
                lane: lane as u32,
                thread_in_invocation: work.thread_in_invocation,
            };
            let data = &kernel.graph.node_spec(work.node).data;
            invocation.invoke(&ctx, data, work.invocation_offset);
            executed.set(lane as u32);
        }
        executed
    }

    /// Report the executed lanes. Block-wide nodes aggregate the whole block
    /// into one report by the leader.
    fn finish_work(&self, executed: LaneMask) -> Result<(), Aborted> {
        let block = self.block;
        let node = NodeId(block.node_idx.load(Ordering::Relaxed));
        let tpi = block.threads_per_invocation.load(Ordering::Relaxed);

        let threads = if tpi > self.lanes {
            block
                .finished_threads
                .fetch_add(executed.count(), Ordering::Relaxed);
            block.barrier.wait()?;
            if !self.is_leader() {
                return Ok(());
            }
            block.finished_threads.swap(0, Ordering::Relaxed)
        } else {
            executed.count()
        };

        let kernel = self.kernel;
        kernel.graph.report_finished(
            node,
            threads / tpi,
            kernel.state,
            kernel.device_trace,
            self.origin,
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
