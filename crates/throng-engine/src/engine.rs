//! The run driver.
//!
//! An [`Engine`] owns everything one run needs: the ECS state, the graph,
//! the dispatcher, the arena and the trace sinks. [`Engine::run`] performs a
//! complete launch and can be repeated; every run re-initializes the node
//! counters from scratch.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use throng_ecs::state::StateManager;
use tracing::{debug, info, warn};

use crate::arena::RunArena;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::layout::LaunchLayout;
use crate::node::{FuncId, NodeId};
use crate::print::HostPrint;
use crate::taskgraph::TaskGraph;
use crate::trace::{DeviceTrace, HostEvent, HostTracing};
use crate::worker::Megakernel;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-node outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub func: FuncId,
    /// Invocation count the node resolved to; `0` for skipped nodes.
    pub total_invocations: u32,
}

/// Summary of one [`Engine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub nodes: Vec<NodeReport>,
    pub elapsed: Duration,
    /// Device trace records kept.
    pub trace_events: usize,
    pub dropped_trace_events: u64,
}

impl RunReport {
    /// Sum of every node's invocation count.
    pub fn total_invocations(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.total_invocations as u64)
            .sum()
    }
}

/// Paths written by [`Engine::write_traces`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFiles {
    /// `None` when device tracing is disabled.
    pub device: Option<PathBuf>,
    pub host: PathBuf,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A validated, ready-to-run graph with its state and backing memory.
pub struct Engine {
    config: EngineConfig,
    state: StateManager,
    graph: TaskGraph,
    dispatcher: Dispatcher,
    layout: LaunchLayout,
    arena: RunArena,
    print: HostPrint,
    device_trace: DeviceTrace,
    host_tracing: HostTracing,
    runs: u64,
}

impl Engine {
    /// Validate `config` and `graph`, lay out and allocate the run arena.
    pub fn new(
        config: EngineConfig,
        state: StateManager,
        graph: TaskGraph,
        dispatcher: Dispatcher,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if state.config() != &config.state {
            return Err(EngineError::invalid_config(
                "state manager was built with a different StateConfig",
            ));
        }
        validate_graph(&config, &graph, &dispatcher)?;

        let layout = LaunchLayout::compute(&config);
        let arena = RunArena::new(layout, config.state.num_worlds);
        let device_trace = if config.trace.enabled {
            DeviceTrace::new(config.trace.capacity)
        } else {
            DeviceTrace::disabled()
        };
        debug!(
            total_bytes = layout.total_bytes,
            arena_bytes = arena.len(),
            nodes = graph.num_nodes(),
            funcs = dispatcher.len(),
            "engine ready"
        );

        Ok(Self {
            print: HostPrint::new(config.print_capacity),
            host_tracing: HostTracing::new(),
            config,
            state,
            graph,
            dispatcher,
            layout,
            arena,
            device_trace,
            runs: 0,
        })
    }

    /// Execute the graph once.
    ///
    /// # Panics
    ///
    /// Resumes the panic of any worker: an invalid dynamic invocation count,
    /// a remaining-count underflow, or a panicking invocation.
    pub fn run(&mut self) -> RunReport {
        self.host_tracing.record(HostEvent::RunStart);
        self.arena.tmp_mut().reset();
        let launch = self.config.launch;
        info!(
            run = self.runs,
            nodes = self.graph.num_nodes(),
            blocks = launch.num_blocks,
            groups = launch.total_groups(),
            "run starting"
        );

        let start = Instant::now();
        self.host_tracing.record(HostEvent::KernelStart);
        Megakernel::new(
            launch,
            &self.graph,
            &self.state,
            &self.dispatcher,
            &self.arena,
            &self.print,
            &self.device_trace,
        )
        .launch();
        self.host_tracing.record(HostEvent::KernelEnd);
        let elapsed = start.elapsed();

        self.print.flush();
        let dropped_trace_events = self.device_trace.dropped();
        if dropped_trace_events > 0 {
            warn!(
                dropped = dropped_trace_events,
                capacity = self.device_trace.capacity(),
                "device trace buffer overflowed"
            );
        }

        let report = RunReport {
            nodes: self
                .graph
                .specs()
                .enumerate()
                .map(|(i, spec)| NodeReport {
                    node: NodeId(i as u32),
                    func: spec.func,
                    total_invocations: self.graph.total(NodeId(i as u32)),
                })
                .collect(),
            elapsed,
            trace_events: self.device_trace.records().len(),
            dropped_trace_events,
        };
        info!(
            run = self.runs,
            invocations = report.total_invocations(),
            elapsed_us = elapsed.as_micros() as u64,
            "run finished"
        );
        self.host_tracing.record(HostEvent::RunEnd);
        self.runs += 1;
        report
    }

    /// Write the device trace of the last run and the host trace so far.
    pub fn write_traces(&self, dir: &Path) -> anyhow::Result<TraceFiles> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
        let device = if self.device_trace.is_enabled() {
            Some(self.device_trace.write_to(dir)?)
        } else {
            None
        };
        let host = self.host_tracing.finalize(dir)?;
        Ok(TraceFiles { device, host })
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Mutable state, for setup between runs.
    pub fn state_mut(&mut self) -> &mut StateManager {
        &mut self.state
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn layout(&self) -> &LaunchLayout {
        &self.layout
    }

    pub fn arena(&self) -> &RunArena {
        &self.arena
    }

    /// Mutable arena, for writing per-replica data between runs.
    pub fn arena_mut(&mut self) -> &mut RunArena {
        &mut self.arena
    }

    pub fn device_trace(&self) -> &DeviceTrace {
        &self.device_trace
    }

    pub fn host_tracing(&self) -> &HostTracing {
        &self.host_tracing
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.graph.num_nodes())
            .field("dispatcher", &self.dispatcher)
            .field("launch", &self.config.launch)
            .field("total_bytes", &self.layout.total_bytes)
            .field("runs", &self.runs)
            .finish()
    }
}

/// Every node must name a registered function, have a count source, and use
/// a threads-per-invocation the launch shape can tile.
fn validate_graph(
    config: &EngineConfig,
    graph: &TaskGraph,
    dispatcher: &Dispatcher,
) -> Result<(), EngineError> {
    let lanes = config.launch.lanes_per_group;
    let block_threads = config.launch.block_threads();
    for (i, spec) in graph.specs().enumerate() {
        let node = NodeId(i as u32);
        if !dispatcher.contains(spec.func) {
            return Err(EngineError::UnknownFunction {
                node,
                func: spec.func,
            });
        }
        if spec.is_dynamic() && !spec.data.has_count() {
            return Err(EngineError::MissingCount { node });
        }
        let tpi = spec.threads_per_invocation;
        let fits = tpi.is_power_of_two()
            && if tpi <= lanes {
                lanes % tpi == 0
            } else {
                block_threads % tpi == 0
            };
        if !fits {
            return Err(EngineError::InvalidThreadsPerInvocation {
                node,
                threads: tpi,
                lanes_per_group: lanes,
                block_threads,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::node::{NodeData, NodeSpec};
    use crate::taskgraph::TaskGraphBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(blocks: u32, groups: u32, lanes: u32) -> EngineConfig {
        EngineConfig {
            launch: LaunchConfig {
                num_blocks: blocks,
                groups_per_block: groups,
                lanes_per_group: lanes,
            },
            ..EngineConfig::default()
        }
    }

    fn state(config: &EngineConfig) -> StateManager {
        StateManager::new(config.state.clone()).unwrap()
    }

    fn single_node(spec: NodeSpec) -> TaskGraph {
        let mut builder = TaskGraphBuilder::new();
        builder.add_node(spec);
        builder.build()
    }

    #[test]
    fn unknown_function_is_rejected() {
        let cfg = config(1, 1, 8);
        let err = Engine::new(
            cfg.clone(),
            state(&cfg),
            single_node(NodeSpec::fixed(FuncId(3), 1)),
            Dispatcher::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownFunction { func: FuncId(3), .. }));
    }

    #[test]
    fn threads_per_invocation_must_tile_the_launch() {
        let cfg = config(1, 2, 8);
        for (tpi, ok) in [(1, true), (8, true), (16, true), (3, false), (32, false)] {
            let mut dispatcher = Dispatcher::new();
            let f = dispatcher.register(|_, _, _| {});
            let result = Engine::new(
                cfg.clone(),
                state(&cfg),
                single_node(NodeSpec::fixed(f, 1).with_threads_per_invocation(tpi)),
                dispatcher,
            );
            assert_eq!(result.is_ok(), ok, "tpi {tpi}");
        }
    }

    #[test]
    fn dynamic_node_needs_a_count() {
        let cfg = config(1, 1, 4);
        let mut dispatcher = Dispatcher::new();
        let f = dispatcher.register(|_, _, _| {});
        let err = Engine::new(
            cfg.clone(),
            state(&cfg),
            single_node(NodeSpec::dynamic(f, NodeData::new())),
            dispatcher,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MissingCount { .. }));
    }

    #[test]
    fn mismatched_state_config_is_rejected() {
        let cfg = config(1, 1, 4);
        let other = StateManager::new(throng_ecs::state::StateConfig {
            num_worlds: 9,
            ..cfg.state.clone()
        })
        .unwrap();
        let err = Engine::new(cfg, other, TaskGraphBuilder::new().build(), Dispatcher::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn engine_runs_repeatedly() {
        let cfg = config(2, 2, 4);
        let hits = Arc::new(AtomicU32::new(0));
        let mut dispatcher = Dispatcher::new();
        let seen = Arc::clone(&hits);
        let f = dispatcher.register(move |_, _, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let mut engine = Engine::new(
            cfg.clone(),
            state(&cfg),
            single_node(NodeSpec::fixed(f, 37)),
            dispatcher,
        )
        .unwrap();

        for run in 1..=3 {
            let report = engine.run();
            assert_eq!(report.total_invocations(), 37);
            assert_eq!(hits.load(Ordering::Relaxed), 37 * run);
        }
        assert_eq!(engine.runs(), 3);
        assert!(engine.graph().is_finished());
    }

    #[test]
    fn empty_graph_exits_immediately() {
        let cfg = config(2, 3, 8);
        let mut engine = Engine::new(
            cfg.clone(),
            state(&cfg),
            TaskGraphBuilder::new().build(),
            Dispatcher::new(),
        )
        .unwrap();
        let report = engine.run();
        assert!(report.nodes.is_empty());
        assert_eq!(report.total_invocations(), 0);
    }
}
