//! Launch-time memory layout.
//!
//! Everything a run needs lives in one contiguous arena. Regions are placed
//! by strict bump allocation in a fixed order, each aligned to its own
//! requirement:
//!
//! 1. scheduler control block
//! 2. storage control block
//! 3. per-replica data (`num_worlds` strides)
//! 4. temporary allocator
//! 5. print buffer
//! 6. device trace buffer
//!
//! The host keeps the scheduler, storage, print and trace state in their own
//! Rust objects; their regions are still laid out so that the offsets and
//! the total match what a device launch would request. Only the
//! [`host_span`](LaunchLayout::host_span) is backed by the run arena.

use std::mem::{align_of, size_of};

use serde::Serialize;
use throng_ecs::state::StateManager;

use crate::config::EngineConfig;
use crate::taskgraph::TaskGraph;
use crate::trace::DeviceTraceRecord;

/// Alignment of the temporary allocator region.
pub const TMP_ALIGN: u64 = 64;
/// Bytes reserved per print message.
pub const PRINT_SLOT_BYTES: u64 = 256;

/// One placed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub offset: u64,
    pub bytes: u64,
    pub align: u64,
}

impl Region {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.bytes
    }
}

/// Byte offsets of every region in the run arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchLayout {
    pub scheduler: Region,
    pub storage: Region,
    pub world_data: Region,
    /// Distance between consecutive replicas inside `world_data`.
    pub world_stride: u64,
    pub tmp_alloc: Region,
    pub print: Region,
    pub trace: Region,
    pub total_bytes: u64,
    /// Largest alignment of any region; the arena base must honor it.
    pub max_align: u64,
}

struct Bump {
    cursor: u64,
    max_align: u64,
}

impl Bump {
    fn place(&mut self, bytes: u64, align: u64) -> Region {
        debug_assert!(align.is_power_of_two());
        let offset = self.cursor.div_ceil(align) * align;
        self.cursor = offset + bytes;
        self.max_align = self.max_align.max(align);
        Region {
            offset,
            bytes,
            align,
        }
    }
}

impl LaunchLayout {
    /// Lay out the arena for `config`. `config` must already be validated.
    pub fn compute(config: &EngineConfig) -> Self {
        let mut bump = Bump {
            cursor: 0,
            max_align: 1,
        };
        let scheduler = bump.place(
            size_of::<TaskGraph>() as u64,
            align_of::<TaskGraph>() as u64,
        );
        let storage = bump.place(
            size_of::<StateManager>() as u64,
            align_of::<StateManager>() as u64,
        );
        let world_stride = config.world_data_stride();
        let world_data = bump.place(
            config.state.num_worlds as u64 * world_stride,
            config.world_data_align as u64,
        );
        let tmp_alloc = bump.place(config.tmp_alloc_bytes, TMP_ALIGN);
        let print = bump.place(config.print_capacity as u64 * PRINT_SLOT_BYTES, 8);
        let trace_records = if config.trace.enabled {
            config.trace.capacity as u64
        } else {
            0
        };
        let trace = bump.place(
            trace_records * size_of::<DeviceTraceRecord>() as u64,
            align_of::<DeviceTraceRecord>() as u64,
        );

        Self {
            scheduler,
            storage,
            world_data,
            world_stride,
            tmp_alloc,
            print,
            trace,
            total_bytes: bump.cursor,
            max_align: bump.max_align,
        }
    }

    /// The regions the host backs with memory: per-replica data through the
    /// end of the temporary region. The start is rounded down to the span's
    /// alignment so offsets relative to it keep their alignment.
    pub fn host_span(&self) -> Region {
        let align = self.world_data.align.max(self.tmp_alloc.align);
        let offset = self.world_data.offset / align * align;
        Region {
            offset,
            bytes: self.tmp_alloc.end() - offset,
            align,
        }
    }

    /// All regions in placement order.
    pub fn regions(&self) -> [Region; 6] {
        [
            self.scheduler,
            self.storage,
            self.world_data,
            self.tmp_alloc,
            self.print,
            self.trace,
        ]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
