//! Device and host trace files produced by real runs.

use std::path::PathBuf;

use throng_engine::prelude::*;
use throng_engine::trace::{DEVICE_TRACE_SUFFIX, HOST_TRACE_SUFFIX};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("throng-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Nodes: 5 fixed, empty archetype (skipped), 3 fixed.
fn traced_engine(blocks: u32, trace: TraceConfig) -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config = EngineConfig {
        launch: LaunchConfig {
            num_blocks: blocks,
            groups_per_block: 2,
            lanes_per_group: 4,
        },
        trace,
        ..EngineConfig::default()
    };
    let mut state = StateManager::new(config.state.clone()).unwrap();
    let empty = state.register_archetype(&[]).unwrap();

    let mut dispatcher = Dispatcher::new();
    let f = dispatcher.register(|_, _, _| {});
    let g = dispatcher.register(|_, _, _| {});
    let mut builder = TaskGraphBuilder::new();
    builder.add_node(NodeSpec::fixed(f, 5));
    builder.add_node(NodeSpec::dynamic(g, NodeData::archetype_rows(empty)));
    builder.add_node(NodeSpec::fixed(g, 3));
    Engine::new(config, state, builder.build(), dispatcher).unwrap()
}

fn decode(bytes: &[u8]) -> Vec<DeviceTraceRecord> {
    assert_eq!(bytes.len() % 32, 0, "device trace is not a record array");
    bytes
        .chunks_exact(32)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn count(records: &[DeviceTraceRecord], event: DeviceEvent) -> usize {
    records.iter().filter(|r| r.kind() == Some(event)).count()
}

#[test]
fn device_trace_records_node_and_block_lifecycle() {
    let mut engine = traced_engine(3, TraceConfig::default());
    let report = engine.run();
    assert_eq!(report.dropped_trace_events, 0);

    let records = engine.device_trace().records();
    assert_eq!(records.len(), report.trace_events);
    assert_eq!(records[0].kind(), Some(DeviceEvent::Calibration));
    assert_eq!(count(&records, DeviceEvent::Calibration), 1);
    assert!(records.iter().all(|r| r.kind().is_some()));

    // Skipped node 1 never starts or finishes.
    let starts: Vec<(u32, u32)> = records
        .iter()
        .filter(|r| r.kind() == Some(DeviceEvent::NodeStart))
        .map(|r| (r.node_id, r.num_invocations))
        .collect();
    assert_eq!(starts, vec![(0, 5), (2, 3)]);
    let finishes: Vec<u32> = records
        .iter()
        .filter(|r| r.kind() == Some(DeviceEvent::NodeFinish))
        .map(|r| r.node_id)
        .collect();
    assert_eq!(finishes, vec![0, 2]);

    // Every block exits exactly once.
    let mut exits: Vec<u32> = records
        .iter()
        .filter(|r| r.kind() == Some(DeviceEvent::BlockExit))
        .map(|r| r.block_id)
        .collect();
    exits.sort_unstable();
    assert_eq!(exits, vec![0, 1, 2]);
    assert!(count(&records, DeviceEvent::BlockStart) >= 1);

    // Node start precedes its finish, and a node finishes before the next
    // one starts.
    let pos = |event: DeviceEvent, node: u32| {
        records
            .iter()
            .position(|r| r.kind() == Some(event) && r.node_id == node)
            .unwrap()
    };
    assert!(pos(DeviceEvent::NodeStart, 0) < pos(DeviceEvent::NodeFinish, 0));
    assert!(pos(DeviceEvent::NodeFinish, 0) < pos(DeviceEvent::NodeStart, 2));
    assert!(pos(DeviceEvent::NodeStart, 2) < pos(DeviceEvent::NodeFinish, 2));
}

#[test]
fn trace_files_use_process_id_names() {
    let dir = scratch_dir("trace-files");
    let mut engine = traced_engine(2, TraceConfig::default());
    engine.run();
    engine.run();
    let files = engine.write_traces(&dir).unwrap();

    let pid = std::process::id();
    let device = files.device.expect("device tracing is enabled");
    assert_eq!(
        device.file_name().unwrap().to_str().unwrap(),
        format!("{pid}{DEVICE_TRACE_SUFFIX}")
    );
    assert_eq!(
        files.host.file_name().unwrap().to_str().unwrap(),
        format!("{pid}{HOST_TRACE_SUFFIX}")
    );

    // The device file holds the last run only.
    let records = decode(&std::fs::read(&device).unwrap());
    assert_eq!(records, engine.device_trace().records());
    assert_eq!(records[0].kind(), Some(DeviceEvent::Calibration));

    // Host file: four events per run, kinds first, then timestamps.
    let host = std::fs::read(&files.host).unwrap();
    assert_eq!(host.len(), 2 * 4 * 16);
    let words: Vec<i64> = host
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let (kinds, stamps) = words.split_at(8);
    assert_eq!(kinds, &[0, 1, 2, 3, 0, 1, 2, 3]);
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn disabled_device_trace_writes_host_file_only() {
    let dir = scratch_dir("trace-disabled");
    let mut engine = traced_engine(
        1,
        TraceConfig {
            enabled: false,
            ..TraceConfig::default()
        },
    );
    let report = engine.run();
    assert_eq!(report.trace_events, 0);

    let files = engine.write_traces(&dir).unwrap();
    assert!(files.device.is_none());
    assert_eq!(std::fs::read(&files.host).unwrap().len(), 4 * 16);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn overflowing_trace_counts_dropped_events() {
    let mut engine = traced_engine(
        2,
        TraceConfig {
            enabled: true,
            capacity: 3,
        },
    );
    let report = engine.run();
    assert_eq!(report.trace_events, 3);
    assert!(report.dropped_trace_events > 0);
    assert_eq!(
        engine.device_trace().records()[0].kind(),
        Some(DeviceEvent::Calibration)
    );
}
