//! The run arena: one zeroed allocation backing the
//! [host span](LaunchLayout::host_span) of a [`LaunchLayout`].
//!
//! Per-replica data is readable by every invocation during a run and
//! writable by the host between runs. The temporary region is handed out by
//! a lock-free bump allocator that is rewound at the start of every run.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use throng_ecs::entity::WorldId;

use crate::layout::{LaunchLayout, Region, TMP_ALIGN};

// ---------------------------------------------------------------------------
// TmpAllocator
// ---------------------------------------------------------------------------

/// Bump allocator over the arena's temporary region.
///
/// Allocation is a single `fetch_update` on the offset. Memory is never
/// freed individually; [`reset`](Self::reset) rewinds the whole region.
#[derive(Debug)]
pub struct TmpAllocator {
    base: NonNull<u8>,
    capacity: u64,
    offset: AtomicU64,
}

// The allocator hands out disjoint byte ranges of memory owned by the arena.
unsafe impl Send for TmpAllocator {}
unsafe impl Sync for TmpAllocator {}

impl TmpAllocator {
    /// Allocate `bytes` aligned to `align` (a power of two no larger than
    /// [`TMP_ALIGN`]). Returns `None` when the region is exhausted.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, bytes: usize, align: usize) -> Option<&mut [u8]> {
        if !align.is_power_of_two() || align as u64 > TMP_ALIGN {
            return None;
        }
        let align = align as u64;
        let bytes = bytes as u64;
        let capacity = self.capacity;
        let mut start = 0;
        self.offset
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                start = cur.div_ceil(align) * align;
                start.checked_add(bytes).filter(|&end| end <= capacity)
            })
            .ok()?;
        // SAFETY: `[start, start + bytes)` lies inside the region and no
        // other call can be handed an overlapping range until `reset`, which
        // needs `&mut self`.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(start as usize), bytes as usize)
        })
    }

    /// Bytes handed out since the last reset (including alignment padding).
    pub fn used(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Rewind to an empty region.
    pub fn reset(&mut self) {
        *self.offset.get_mut() = 0;
    }
}

// ---------------------------------------------------------------------------
// RunArena
// ---------------------------------------------------------------------------

/// Contiguous, zero-initialized backing memory for a run.
///
/// Only the per-replica data and temporary regions are allocated. The
/// scheduler, storage, print and trace regions of the layout are owned by
/// their host objects, so `len()` is usually smaller than
/// `layout().total_bytes`.
#[derive(Debug)]
pub struct RunArena {
    /// Address of layout offset `span.offset`.
    ptr: NonNull<u8>,
    /// `None` when the span is empty and nothing was allocated.
    alloc_layout: Option<Layout>,
    layout: LaunchLayout,
    span: Region,
    num_worlds: u32,
    tmp: TmpAllocator,
}

unsafe impl Send for RunArena {}
unsafe impl Sync for RunArena {}

impl RunArena {
    /// Allocate the layout's host span, zeroed and aligned to its
    /// alignment.
    ///
    /// # Panics
    ///
    /// Panics if the span exceeds the address space, and aborts through
    /// [`alloc::handle_alloc_error`] if the allocation fails.
    pub fn new(layout: LaunchLayout, num_worlds: u32) -> Self {
        let span = layout.host_span();
        let align = span.align.max(1) as usize;
        let (ptr, alloc_layout) = if span.bytes == 0 {
            (NonNull::new(align as *mut u8).unwrap_or(NonNull::dangling()), None)
        } else {
            let l = Layout::from_size_align(span.bytes as usize, align)
                .unwrap_or_else(|e| panic!("run arena layout is invalid: {e}"));
            // SAFETY: `l` has non-zero size.
            let raw = unsafe { alloc::alloc_zeroed(l) };
            match NonNull::new(raw) {
                Some(p) => (p, Some(l)),
                None => alloc::handle_alloc_error(l),
            }
        };
        // SAFETY: the tmp region lies within the span (or is empty).
        let tmp_base = unsafe {
            ptr.as_ptr()
                .add((layout.tmp_alloc.offset - span.offset) as usize)
        };
        let tmp = TmpAllocator {
            base: NonNull::new(tmp_base).unwrap_or(ptr),
            capacity: layout.tmp_alloc.bytes,
            offset: AtomicU64::new(0),
        };
        Self {
            ptr,
            alloc_layout,
            layout,
            span,
            num_worlds,
            tmp,
        }
    }

    /// Bytes actually allocated.
    pub fn len(&self) -> u64 {
        self.span.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.span.bytes == 0
    }

    /// The layout this arena was built from.
    pub fn layout(&self) -> &LaunchLayout {
        &self.layout
    }

    /// Base address of the allocation, which sits at layout offset
    /// `layout().host_span().offset`.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn world_range(&self, world: WorldId) -> Option<(usize, usize)> {
        if world.0 >= self.num_worlds {
            return None;
        }
        let stride = self.layout.world_stride;
        let start = self.layout.world_data.offset - self.span.offset + world.0 as u64 * stride;
        Some((start as usize, stride as usize))
    }

    /// Data of replica `world`.
    pub fn world_data(&self, world: WorldId) -> Option<&[u8]> {
        let (start, len) = self.world_range(world)?;
        // SAFETY: in bounds of the allocation; mutation needs `&mut self`.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), len) })
    }

    /// Raw pointer to the data of replica `world`, for writes during a run.
    ///
    /// Obtaining the pointer is safe; writing through it is not. A writer
    /// must be the only invocation touching those bytes until the node
    /// retires, and no slice from [`world_data`](Self::world_data) covering
    /// them may be alive meanwhile. One invocation per replica, with readers
    /// in later nodes, meets both rules.
    pub fn world_data_ptr(&self, world: WorldId) -> Option<NonNull<[u8]>> {
        let (start, len) = self.world_range(world)?;
        // SAFETY: in bounds of the allocation.
        let data = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(start)) };
        Some(NonNull::slice_from_raw_parts(data, len))
    }

    /// Mutable data of replica `world`, for use between runs.
    pub fn world_data_mut(&mut self, world: WorldId) -> Option<&mut [u8]> {
        let (start, len) = self.world_range(world)?;
        // SAFETY: in bounds, and `&mut self` excludes every other borrow.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) })
    }

    /// The temporary allocator.
    pub fn tmp(&self) -> &TmpAllocator {
        &self.tmp
    }

    pub fn tmp_mut(&mut self) -> &mut TmpAllocator {
        &mut self.tmp
    }
}

impl Drop for RunArena {
    fn drop(&mut self) {
        if let Some(l) = self.alloc_layout {
            // SAFETY: allocated in `new` with exactly this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), l) };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn arena(num_worlds: u32, world_bytes: u32, tmp_bytes: u64) -> RunArena {
        let mut config = EngineConfig {
            world_data_bytes: world_bytes,
            tmp_alloc_bytes: tmp_bytes,
            ..EngineConfig::default()
        };
        config.state.num_worlds = num_worlds;
        RunArena::new(LaunchLayout::compute(&config), num_worlds)
    }

    #[test]
    fn arena_is_zeroed_and_aligned() {
        let a = arena(4, 32, 256);
        assert_eq!(a.as_ptr() as usize % a.layout().host_span().align as usize, 0);
        for w in 0..4 {
            assert!(a.world_data(WorldId(w)).unwrap().iter().all(|&b| b == 0));
        }
        assert!(a.world_data(WorldId(4)).is_none());
    }

    #[test]
    fn world_data_is_isolated_per_replica() {
        let mut a = arena(3, 16, 0);
        a.world_data_mut(WorldId(1)).unwrap().fill(0xAB);
        assert!(a.world_data(WorldId(0)).unwrap().iter().all(|&b| b == 0));
        assert!(a.world_data(WorldId(1)).unwrap().iter().all(|&b| b == 0xAB));
        assert!(a.world_data(WorldId(2)).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn host_owned_regions_are_not_allocated() {
        let mut config = EngineConfig {
            world_data_bytes: 24,
            world_data_align: 8,
            tmp_alloc_bytes: 512,
            print_capacity: 4096,
            ..EngineConfig::default()
        };
        config.state.num_worlds = 2;
        config.trace.enabled = true;
        config.trace.capacity = 1 << 16;
        let layout = LaunchLayout::compute(&config);
        let mut a = RunArena::new(layout, 2);

        let span = layout.host_span();
        assert_eq!(a.len(), span.bytes);
        assert!(a.len() < layout.print.bytes);
        assert!(a.len() < layout.total_bytes - layout.print.bytes - layout.trace.bytes);

        // World data and tmp still sit at their layout offsets within the span.
        let base = a.as_ptr() as usize;
        let w1 = a.world_data(WorldId(1)).unwrap().as_ptr() as usize;
        assert_eq!(
            (w1 - base) as u64,
            layout.world_data.offset - span.offset + layout.world_stride
        );
        a.world_data_mut(WorldId(1)).unwrap().fill(7);
        assert!(a.world_data(WorldId(0)).unwrap().iter().all(|&b| b == 0));
        let block = a.tmp().alloc(512, TMP_ALIGN as usize).unwrap();
        assert_eq!(block.as_ptr() as usize % TMP_ALIGN as usize, 0);
        assert_eq!(
            (block.as_ptr() as usize - base) as u64,
            layout.tmp_alloc.offset - span.offset
        );
        assert!(a.world_data(WorldId(1)).unwrap().iter().all(|&b| b == 7));
    }

    #[test]
    fn tmp_allocations_are_aligned_and_bounded() {
        let mut a = arena(1, 0, 128);
        let first = a.tmp().alloc(3, 1).unwrap();
        first.fill(1);
        let second = a.tmp().alloc(16, 16).unwrap();
        assert_eq!(second.as_ptr() as usize % 16, 0);
        assert_eq!(a.tmp().used(), 32);
        assert!(a.tmp().alloc(200, 8).is_none());
        assert!(a.tmp().alloc(8, 3).is_none());

        a.tmp_mut().reset();
        assert_eq!(a.tmp().used(), 0);
        assert!(a.tmp().alloc(128, 64).is_some());
    }

    #[test]
    fn concurrent_tmp_allocations_do_not_overlap() {
        let a = arena(1, 0, 64 * 1024);
        let mut ranges: Vec<(usize, usize)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..64)
                            .map(|_| {
                                let block = a.tmp().alloc(24, 8).unwrap();
                                (block.as_ptr() as usize, block.len())
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }
}
