//! Columnar row storage with stable row addresses.
//!
//! A [`Table`] is a list of [`Column`]s (one per component of an archetype)
//! that share an atomic row count. Each column reserves address space for
//! the maximum row count of the whole run up front and only tracks how much
//! of that reservation is committed. Rows therefore never move once they
//! have been handed out, which lets many workers allocate and write rows
//! concurrently through shared references.
//!
//! # Safety
//!
//! Column memory is a type-erased byte buffer. Typed accessors check the
//! requested type's size and alignment against the column's [`TypeInfo`]
//! before reinterpreting bytes; all component types are `bytemuck::Pod`, so
//! any bit pattern (including the initial zeroes) is a valid value.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::component::TypeInfo;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A type-erased column with a fixed reservation and a growing commit mark.
///
/// The full reservation is requested zeroed from the allocator when the
/// column is created; the operating system backs those pages lazily, so the
/// committed-row mark is the engine's own accounting of how much of the
/// reservation is in use. It only ever grows.
pub struct Column {
    data: NonNull<u8>,
    /// `None` when nothing was allocated (zero-sized type or no rows).
    layout: Option<Layout>,
    info: TypeInfo,
    reserved_rows: u32,
    committed_rows: AtomicU32,
    /// Growth granularity of the commit mark, in rows.
    commit_chunk: u32,
}

// Column only stores plain bytes of `Pod` types; access discipline is
// enforced by `Table`.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Reserve room for `reserved_rows` values of `info`, committing the
    /// first `commit_chunk` rows.
    pub fn new(info: TypeInfo, reserved_rows: u32, commit_chunk: u32) -> Self {
        let commit_chunk = commit_chunk.max(1);
        let reserve_bytes = info.num_bytes as usize * reserved_rows as usize;
        let (data, layout) = if reserve_bytes == 0 {
            // Dangling but aligned; never dereferenced for a non-zero size.
            let dangling = NonNull::new(info.alignment as usize as *mut u8)
                .expect("alignment is non-zero");
            (dangling, None)
        } else {
            let layout = Layout::from_size_align(reserve_bytes, info.alignment as usize)
                .expect("column layout overflow");
            // SAFETY: `layout` has non-zero size.
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            match NonNull::new(ptr) {
                Some(ptr) => (ptr, Some(layout)),
                None => alloc::handle_alloc_error(layout),
            }
        };

        Self {
            data,
            layout,
            info,
            reserved_rows,
            committed_rows: AtomicU32::new(commit_chunk.min(reserved_rows)),
            commit_chunk,
        }
    }

    /// Layout of a single element.
    #[inline]
    pub fn info(&self) -> TypeInfo {
        self.info
    }

    /// Rows covered by the reservation.
    #[inline]
    pub fn reserved_rows(&self) -> u32 {
        self.reserved_rows
    }

    /// Rows currently committed.
    #[inline]
    pub fn committed_rows(&self) -> u32 {
        self.committed_rows.load(Ordering::Relaxed)
    }

    /// Bytes currently committed.
    #[inline]
    pub fn committed_bytes(&self) -> u64 {
        self.committed_rows() as u64 * self.info.num_bytes as u64
    }

    /// Grow the commit mark so it covers `rows`, rounded up to a whole
    /// commit chunk. Returns `false` if `rows` exceeds the reservation.
    pub fn commit(&self, rows: u32) -> bool {
        if rows > self.reserved_rows {
            return false;
        }
        if rows <= self.committed_rows() {
            return true;
        }
        let rounded = rows
            .div_ceil(self.commit_chunk)
            .saturating_mul(self.commit_chunk)
            .min(self.reserved_rows);
        self.committed_rows.fetch_max(rounded, Ordering::Relaxed);
        true
    }

    /// Base address of the column. Stable for the column's lifetime.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Address of `row`.
    ///
    /// # Safety
    ///
    /// `row` must be below [`reserved_rows`](Self::reserved_rows).
    #[inline]
    pub unsafe fn row_ptr(&self, row: u32) -> *mut u8 {
        debug_assert!(row < self.reserved_rows);
        self.data.as_ptr().add(row as usize * self.info.num_bytes as usize)
    }

    /// Whether values of `T` can be stored in this column: same size, and
    /// no stricter alignment than the registered one.
    #[inline]
    pub fn holds<T>(&self) -> bool {
        std::mem::size_of::<T>() == self.info.num_bytes as usize
            && std::mem::align_of::<T>() <= self.info.alignment as usize
    }

    fn check_type<T>(&self) {
        assert!(self.holds::<T>(), "component layout mismatch");
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe { alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("info", &self.info)
            .field("reserved_rows", &self.reserved_rows)
            .field("committed_rows", &self.committed_rows())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Columns of one archetype plus their shared, atomic row count.
#[derive(Debug)]
pub struct Table {
    columns: Vec<Column>,
    num_rows: AtomicU32,
    max_rows: u32,
}

impl Table {
    /// Create a table with one column per entry of `infos`.
    pub fn new(infos: &[TypeInfo], max_rows: u32, commit_chunk: u32) -> Self {
        Self {
            columns: infos
                .iter()
                .map(|&info| Column::new(info, max_rows, commit_chunk))
                .collect(),
            num_rows: AtomicU32::new(0),
            max_rows,
        }
    }

    /// Number of rows in use.
    #[inline]
    pub fn num_rows(&self) -> u32 {
        self.num_rows.load(Ordering::Acquire)
    }

    /// Maximum number of rows the table can ever hold.
    #[inline]
    pub fn max_rows(&self) -> u32 {
        self.max_rows
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// The column at `idx`.
    #[inline]
    pub fn column_at(&self, idx: u32) -> &Column {
        &self.columns[idx as usize]
    }

    /// Allocate `count` contiguous rows. Safe to call from many threads.
    pub fn alloc_rows(&self, count: u32) -> Result<Range<u32>, EcsError> {
        let max_rows = self.max_rows;
        let start = self
            .num_rows
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(count).filter(|&end| end <= max_rows)
            })
            .map_err(|_| EcsError::TableFull { max_rows })?;
        let end = start + count;
        for column in &self.columns {
            column.commit(end);
        }
        Ok(start..end)
    }

    /// Allocate a single row.
    pub fn alloc_row(&self) -> Result<u32, EcsError> {
        self.alloc_rows(1).map(|rows| rows.start)
    }

    /// Forget every row without giving back committed capacity. O(1).
    #[inline]
    pub fn clear(&self) {
        self.num_rows.store(0, Ordering::Release);
    }

    /// Bytes committed across all columns.
    pub fn committed_bytes(&self) -> u64 {
        self.columns.iter().map(Column::committed_bytes).sum()
    }

    // -- typed access -------------------------------------------------------

    /// The live rows of column `col` as a typed slice.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match the column's registered layout.
    pub fn column<T: bytemuck::Pod>(&self, col: u32) -> &[T] {
        let column = &self.columns[col as usize];
        column.check_type::<T>();
        let len = self.num_rows() as usize;
        unsafe { std::slice::from_raw_parts(column.as_ptr() as *const T, len) }
    }

    /// The live rows of column `col` as a mutable typed slice.
    pub fn column_mut<T: bytemuck::Pod>(&mut self, col: u32) -> &mut [T] {
        let len = self.num_rows() as usize;
        let column = &mut self.columns[col as usize];
        column.check_type::<T>();
        unsafe { std::slice::from_raw_parts_mut(column.as_ptr() as *mut T, len) }
    }

    /// Copy out the value at `(col, row)`, or `None` past the live rows.
    pub fn get<T: bytemuck::Pod>(&self, col: u32, row: u32) -> Option<T> {
        if row >= self.num_rows() {
            return None;
        }
        let column = &self.columns[col as usize];
        column.check_type::<T>();
        Some(unsafe { std::ptr::read(column.row_ptr(row) as *const T) })
    }

    /// Overwrite the value at `(col, row)` through a shared reference.
    ///
    /// # Safety
    ///
    /// `row` must have been allocated from this table, and no other thread
    /// may read or write the same `(col, row)` cell concurrently. Workers
    /// that write only the rows matching their own invocation offsets
    /// satisfy this.
    pub unsafe fn write<T: bytemuck::Pod>(&self, col: u32, row: u32, value: T) {
        let column = &self.columns[col as usize];
        column.check_type::<T>();
        assert!(row < column.reserved_rows, "row out of reserved range");
        std::ptr::write(column.row_ptr(row) as *mut T, value);
    }

    /// Overwrite the value at `(col, row)`. Returns `false` past the live rows.
    pub fn set<T: bytemuck::Pod>(&mut self, col: u32, row: u32, value: T) -> bool {
        if row >= self.num_rows() {
            return false;
        }
        unsafe { self.write(col, row, value) };
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_info() -> TypeInfo {
        TypeInfo::of::<u32>()
    }

    #[test]
    fn rows_allocate_contiguously() {
        let table = Table::new(&[u32_info(), TypeInfo::of::<f64>()], 16, 4);
        assert_eq!(table.alloc_rows(3).unwrap(), 0..3);
        assert_eq!(table.alloc_row().unwrap(), 3);
        assert_eq!(table.num_rows(), 4);
    }

    #[test]
    fn table_full_is_reported() {
        let table = Table::new(&[u32_info()], 4, 4);
        table.alloc_rows(3).unwrap();
        assert!(matches!(
            table.alloc_rows(2),
            Err(EcsError::TableFull { max_rows: 4 })
        ));
        // A failed allocation leaves the row count untouched.
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.alloc_row().unwrap(), 3);
    }

    #[test]
    fn commit_grows_in_chunks() {
        let table = Table::new(&[u32_info()], 100, 8);
        assert_eq!(table.column_at(0).committed_rows(), 8);
        table.alloc_rows(9).unwrap();
        assert_eq!(table.column_at(0).committed_rows(), 16);
        table.alloc_rows(80).unwrap();
        assert_eq!(table.column_at(0).committed_rows(), 96);
        table.alloc_rows(11).unwrap();
        assert_eq!(table.column_at(0).committed_rows(), 100);
    }

    #[test]
    fn clear_keeps_addresses_and_commit() {
        let mut table = Table::new(&[u32_info()], 32, 4);
        let base = table.column_at(0).as_ptr();
        table.alloc_rows(20).unwrap();
        table.column_mut::<u32>(0)[19] = 7;
        let committed = table.committed_bytes();

        table.clear();
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.committed_bytes(), committed);

        table.alloc_rows(20).unwrap();
        assert_eq!(table.column_at(0).as_ptr(), base);
        assert_eq!(table.committed_bytes(), committed);
    }

    #[test]
    fn typed_get_and_set() {
        let mut table = Table::new(&[u32_info(), TypeInfo::of::<[f32; 3]>()], 8, 8);
        let row = table.alloc_row().unwrap();
        assert!(table.set(1, row, [1.0f32, 2.0, 3.0]));
        assert_eq!(table.get::<[f32; 3]>(1, row), Some([1.0, 2.0, 3.0]));
        assert_eq!(table.get::<u32>(0, row), Some(0), "rows start zeroed");
        assert_eq!(table.get::<u32>(0, row + 1), None);
        assert!(!table.set(0, row + 1, 5u32));
    }

    #[test]
    #[should_panic(expected = "component layout mismatch")]
    fn wrong_type_panics() {
        let table = Table::new(&[u32_info()], 8, 8);
        table.alloc_row().unwrap();
        let _ = table.get::<u64>(0, 0);
    }

    #[test]
    fn concurrent_row_allocation_is_exact() {
        let table = Table::new(&[u32_info()], 4096, 64);
        std::thread::scope(|s| {
            for t in 0..8u32 {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..256 {
                        let row = table.alloc_row().unwrap();
                        unsafe { table.write(0, row, t) };
                    }
                });
            }
        });
        assert_eq!(table.num_rows(), 2048);
        let mut per_thread = [0u32; 8];
        for &v in table.column::<u32>(0) {
            per_thread[v as usize] += 1;
        }
        assert!(per_thread.iter().all(|&c| c == 256));
    }

    #[test]
    fn zero_sized_columns_allocate_nothing() {
        let table = Table::new(
            &[TypeInfo {
                alignment: 1,
                num_bytes: 0,
            }],
            8,
            8,
        );
        table.alloc_rows(8).unwrap();
        assert_eq!(table.committed_bytes(), 0);
        assert_eq!(table.column::<()>(0).len(), 8);
    }
}
