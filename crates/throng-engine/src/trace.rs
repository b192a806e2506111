//! Device and host trace sinks.
//!
//! The device trace is a fixed-capacity, append-only buffer written by the
//! workers while a run is in flight. Appending is one `fetch_add` plus four
//! relaxed stores; the records are only read after the workers have been
//! joined. The on-disk format is the raw array of 32-byte records:
//!
//! | bytes  | field             |
//! |--------|-------------------|
//! | 0..4   | event             |
//! | 4..8   | func id           |
//! | 8..12  | invocation count  |
//! | 12..16 | node id           |
//! | 16..20 | block id          |
//! | 20..24 | group id          |
//! | 24..32 | timestamp (ns)    |
//!
//! The host trace is a plain list of `(event, timestamp)` pairs written as
//! all event kinds followed by all timestamps, each a little-endian `i64`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::node::{FuncId, NodeId};

/// File name suffix of the device trace.
pub const DEVICE_TRACE_SUFFIX: &str = "_throng_device_tracing.bin";
/// File name suffix of the host trace.
pub const HOST_TRACE_SUFFIX: &str = "_throng_host_tracing.bin";

// ---------------------------------------------------------------------------
// DeviceEvent
// ---------------------------------------------------------------------------

/// Kinds of device trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeviceEvent {
    /// Start of a run. Resets the timeline.
    Calibration = 0,
    NodeStart = 1,
    NodeFinish = 2,
    /// A block began claiming work from a node.
    BlockStart = 3,
    /// A block ran out of work in its node.
    BlockWait = 4,
    BlockExit = 5,
}

impl DeviceEvent {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Calibration,
            1 => Self::NodeStart,
            2 => Self::NodeFinish,
            3 => Self::BlockStart,
            4 => Self::BlockWait,
            5 => Self::BlockExit,
            _ => return None,
        })
    }
}

/// One device trace record, exactly as written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DeviceTraceRecord {
    pub event: u32,
    pub func_id: u32,
    pub num_invocations: u32,
    pub node_id: u32,
    pub block_id: u32,
    pub group_id: u32,
    pub timestamp_ns: u64,
}

impl DeviceTraceRecord {
    /// The decoded event kind.
    pub fn kind(&self) -> Option<DeviceEvent> {
        DeviceEvent::from_raw(self.event)
    }
}

/// Where in the worker hierarchy an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOrigin {
    pub block: u32,
    pub group: u32,
}

impl TraceOrigin {
    /// The designated initializing group.
    pub const FIRST: TraceOrigin = TraceOrigin { block: 0, group: 0 };
}

// ---------------------------------------------------------------------------
// DeviceTrace
// ---------------------------------------------------------------------------

/// Lock-free, fixed-capacity device trace buffer.
#[derive(Debug)]
pub struct DeviceTrace {
    /// Each record packed into four words:
    /// `[event | func << 32, count | node << 32, block | group << 32, ts]`.
    slots: Box<[[AtomicU64; 4]]>,
    len: AtomicU32,
    dropped: AtomicU64,
    epoch: Instant,
    enabled: bool,
}

impl DeviceTrace {
    /// A buffer keeping up to `capacity` records per run.
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| Default::default()).collect(),
            len: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            epoch: Instant::now(),
            enabled: true,
        }
    }

    /// A sink that ignores every event.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(0)
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Forget all records and emit a [`DeviceEvent::Calibration`] record.
    pub fn reset(&self) {
        self.len.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.record(
            DeviceEvent::Calibration,
            FuncId(0),
            0,
            NodeId(0),
            TraceOrigin::FIRST,
        );
    }

    /// Append one record. Drops (and counts) it when the buffer is full.
    pub fn record(
        &self,
        event: DeviceEvent,
        func: FuncId,
        num_invocations: u32,
        node: NodeId,
        origin: TraceOrigin,
    ) {
        if !self.enabled {
            return;
        }
        let idx = self.len.fetch_add(1, Ordering::Relaxed) as usize;
        let Some(slot) = self.slots.get(idx) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        let pack = |lo: u32, hi: u32| lo as u64 | (hi as u64) << 32;
        slot[0].store(pack(event as u32, func.0), Ordering::Relaxed);
        slot[1].store(pack(num_invocations, node.0), Ordering::Relaxed);
        slot[2].store(pack(origin.block, origin.group), Ordering::Relaxed);
        slot[3].store(timestamp, Ordering::Relaxed);
    }

    /// Records kept since the last reset. Call only once the writers have
    /// been joined.
    pub fn records(&self) -> Vec<DeviceTraceRecord> {
        let len = (self.len.load(Ordering::Relaxed) as usize).min(self.slots.len());
        self.slots[..len]
            .iter()
            .map(|slot| {
                let w: [u64; 4] = std::array::from_fn(|i| slot[i].load(Ordering::Relaxed));
                DeviceTraceRecord {
                    event: w[0] as u32,
                    func_id: (w[0] >> 32) as u32,
                    num_invocations: w[1] as u32,
                    node_id: (w[1] >> 32) as u32,
                    block_id: w[2] as u32,
                    group_id: (w[2] >> 32) as u32,
                    timestamp_ns: w[3],
                }
            })
            .collect()
    }

    /// Events dropped since the last reset because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write the records to `<dir>/<pid>_throng_device_tracing.bin`.
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(format!("{}{DEVICE_TRACE_SUFFIX}", std::process::id()));
        let records = self.records();
        std::fs::write(&path, bytemuck::cast_slice::<_, u8>(&records))
            .with_context(|| format!("failed to write device trace to {}", path.display()))?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// HostTracing
// ---------------------------------------------------------------------------

/// Host-side milestones of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum HostEvent {
    RunStart = 0,
    KernelStart = 1,
    KernelEnd = 2,
    RunEnd = 3,
}

/// Append-only list of host events with nanosecond timestamps.
#[derive(Debug)]
pub struct HostTracing {
    events: Mutex<Vec<(HostEvent, i64)>>,
    epoch: Instant,
}

impl Default for HostTracing {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTracing {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        }
    }

    /// Record `event` at the current time.
    pub fn record(&self, event: HostEvent) {
        let ts = self.epoch.elapsed().as_nanos() as i64;
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((event, ts));
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<(HostEvent, i64)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Serialize as all event kinds, then all timestamps.
    pub fn to_bytes(&self) -> Vec<u8> {
        let events = self.events();
        let kinds = events.iter().map(|&(kind, _)| kind as i64);
        let stamps = events.iter().map(|&(_, ts)| ts);
        kinds.chain(stamps).flat_map(i64::to_le_bytes).collect()
    }

    /// Write to `<dir>/<pid>_throng_host_tracing.bin`.
    pub fn finalize(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(format!("{}{HOST_TRACE_SUFFIX}", std::process::id()));
        std::fs::write(&path, self.to_bytes())
            .with_context(|| format!("failed to write host trace to {}", path.display()))?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_32_bytes() {
        assert_eq!(std::mem::size_of::<DeviceTraceRecord>(), 32);
    }

    #[test]
    fn reset_starts_with_calibration() {
        let trace = DeviceTrace::new(8);
        trace.record(
            DeviceEvent::NodeStart,
            FuncId(3),
            10,
            NodeId(1),
            TraceOrigin { block: 2, group: 5 },
        );
        trace.reset();
        let records = trace.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), Some(DeviceEvent::Calibration));
    }

    #[test]
    fn records_round_trip_fields() {
        let trace = DeviceTrace::new(4);
        trace.record(
            DeviceEvent::BlockWait,
            FuncId(7),
            99,
            NodeId(4),
            TraceOrigin { block: 1, group: 6 },
        );
        let r = trace.records()[0];
        assert_eq!(r.kind(), Some(DeviceEvent::BlockWait));
        assert_eq!(
            (r.func_id, r.num_invocations, r.node_id, r.block_id, r.group_id),
            (7, 99, 4, 1, 6)
        );
    }

    #[test]
    fn overflow_is_counted() {
        let trace = DeviceTrace::new(2);
        trace.reset();
        for _ in 0..5 {
            trace.record(
                DeviceEvent::BlockStart,
                FuncId(0),
                0,
                NodeId(0),
                TraceOrigin::FIRST,
            );
        }
        assert_eq!(trace.records().len(), 2);
        assert_eq!(trace.dropped(), 4);
    }

    #[test]
    fn disabled_trace_records_nothing() {
        let trace = DeviceTrace::disabled();
        trace.reset();
        assert!(trace.records().is_empty());
        assert_eq!(trace.dropped(), 0);
    }

    #[test]
    fn host_bytes_are_kinds_then_timestamps() {
        let host = HostTracing::new();
        host.record(HostEvent::RunStart);
        host.record(HostEvent::RunEnd);
        let bytes = host.to_bytes();
        assert_eq!(bytes.len(), 4 * 8);
        let word = |i: usize| i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(word(0), HostEvent::RunStart as i64);
        assert_eq!(word(1), HostEvent::RunEnd as i64);
        assert!(word(3) >= word(2));
    }
}
