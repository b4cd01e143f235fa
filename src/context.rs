//! The allocator context: one instance per managed buffer.
//!
//! The handle table sits at the top of the region and grows downward toward
//! the arena; a handle is the distance from the table top to its slot, so the
//! slot address never changes while the allocation lives.  Compaction updates
//! slot contents, which is what makes `get_data` a plain table lookup.

use core::fmt;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use crate::word::{CELL, Region, Word};

/// Cells held back by [`Context::available`] so the handle table can keep
/// growing; override with [`Context::with_handle_slack`].
pub const DEFAULT_HANDLE_SLACK: usize = 128;

/// Header cells of an allocated block: length, handle slot, callbacks
/// record, name-length trailer.  The padded name sits between the record and
/// the trailer.
pub(crate) const METADATA_CELLS: usize = 4;

/// Identifies one allocation within a context.
///
/// Handles are small positive integers; they stay valid across compaction
/// and buffer shifts, unlike the data pointers they resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// The handle's index; 1 is the first slot below the table top.
    pub fn index(self) -> usize {
        self.0.get()
    }
}

/// Called while an allocation waits out the handle lock.  Return `true` to
/// re-check the lock after rescheduling, `false` to abandon the wait.
pub type YieldHook = fn() -> bool;

fn no_yield() -> bool {
    false
}

/// A compacting allocator over one caller-supplied buffer.
///
/// Allocations grow upward from the base of the region and the handle table
/// grows downward from its top.  Any operation that may compact (allocation,
/// buffer shifts, front shrinks) invalidates previously fetched data
/// pointers; re-fetch with [`get_data`](Context::get_data) afterwards.
pub struct Context<'buf> {
    pub(crate) region: Region<'buf>,
    /// First cell of the arena; moves only under `buffer_out` / `buffer_in`.
    pub(crate) buf_start: usize,
    /// One past the last tagged block; up to `last_handle` is implicit free.
    pub(crate) alloc_end: usize,
    /// Lower bound for the first-fit scan, always on a block boundary.
    pub(crate) first_free_block: usize,
    /// One past the highest handle slot; fixed for the context's lifetime.
    pub(crate) handle_table: usize,
    /// Lowest reserved slot; the table is `[last_handle, handle_table)`.
    pub(crate) last_handle: usize,
    /// Upper bound for the free-slot scan.
    pub(crate) first_free_handle: usize,
    /// True while no free-tagged block exists below `alloc_end`.
    pub(crate) compact: bool,
    /// Set by a maximum allocation until that handle is shrunk or freed.
    pub(crate) handle_lock: Option<Handle>,
    pub(crate) handle_slack: usize,
    pub(crate) yield_hook: YieldHook,
}

impl<'buf> Context<'buf> {
    /// Bind a new allocator to `buf`.
    ///
    /// The buffer is aligned up and truncated down to whole cells; a buffer
    /// smaller than one cell yields a context on which every allocation
    /// fails.
    pub fn new(buf: &'buf mut [u8]) -> Self {
        let region = Region::new(buf);
        let cells = region.cells();
        Self {
            region,
            buf_start: 0,
            alloc_end: 0,
            first_free_block: 0,
            handle_table: cells,
            last_handle: cells,
            first_free_handle: cells.saturating_sub(1),
            compact: true,
            handle_lock: None,
            handle_slack: DEFAULT_HANDLE_SLACK,
            yield_hook: no_yield,
        }
    }

    /// Override the cells [`available`](Context::available) keeps in reserve
    /// for handle-table growth.
    pub fn with_handle_slack(mut self, cells: usize) -> Self {
        self.handle_slack = cells;
        self
    }

    /// Install the cooperative reschedule primitive used while waiting out
    /// the handle lock.  The default hook abandons the wait immediately, so
    /// a single-actor program cannot deadlock on its own lock.
    pub fn with_yield_hook(mut self, hook: YieldHook) -> Self {
        self.yield_hook = hook;
        self
    }

    // -----------------------------------------------------------------------
    // Handle table
    // -----------------------------------------------------------------------

    /// Reserve a slot, extending the table downward when the scan finds no
    /// free one and at least one free cell separates it from the arena.
    pub(crate) fn handle_alloc(&mut self) -> Option<usize> {
        if self.handle_table == 0 {
            return None;
        }
        let mut found = None;
        for idx in (self.last_handle..=self.first_free_handle).rev() {
            if self.region.get(idx).is_null() {
                found = Some(idx);
                break;
            }
        }
        let slot = match found {
            Some(slot) => slot,
            None if self.last_handle > self.alloc_end => {
                self.last_handle -= 1;
                self.last_handle
            }
            None => return None,
        };
        self.region.set(slot, Word::RESERVED);
        Some(slot)
    }

    /// Release one slot, shrinking the table when it was the lowest.
    pub(crate) fn handle_free(&mut self, slot: usize) {
        self.region.set(slot, Word::NULL);
        if slot > self.first_free_handle {
            self.first_free_handle = slot;
        }
        if slot == self.last_handle {
            self.last_handle += 1;
        } else {
            // A hole somewhere in the table; the next compaction will try to
            // close it via handle_table_shrink.
            self.compact = false;
        }
    }

    /// Advance `last_handle` over a prefix of free slots.  True iff any slot
    /// was reclaimed.
    pub(crate) fn handle_table_shrink(&mut self) -> bool {
        let mut idx = self.last_handle;
        while idx < self.handle_table && self.region.get(idx).is_null() {
            idx += 1;
        }
        if idx > self.first_free_handle {
            self.first_free_handle = idx - 1;
        }
        let shrunk = idx != self.last_handle;
        self.last_handle = idx;
        shrunk
    }

    // -----------------------------------------------------------------------
    // Handle resolution
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn handle_at(&self, slot: usize) -> Handle {
        debug_assert!(slot < self.handle_table);
        // SAFETY: `slot < handle_table`, so the difference is at least 1.
        Handle(unsafe { NonZeroUsize::new_unchecked(self.handle_table - slot) })
    }

    /// The slot index for `h`, if `h` names a live allocation here.
    pub(crate) fn live_slot(&self, h: Handle) -> Option<usize> {
        if h.index() > self.handle_table - self.last_handle {
            return None;
        }
        let slot = self.handle_table - h.index();
        self.region.get(slot).is_live_slot().then_some(slot)
    }

    /// Header cell of the block whose payload starts at byte offset `off`.
    ///
    /// The offset may be mid-cell after a front shrink; the trailer before
    /// the (aligned-down) data cell locates the header.
    #[inline]
    pub(crate) fn header_from_off(&self, off: usize) -> usize {
        let data = off / CELL;
        let trailer = self.region.get(data - 1).val() as usize;
        data - trailer - 3
    }

    /// Whether the positive-tagged block at `block` is a hole left behind by
    /// an immovable block rather than a live allocation.
    ///
    /// Holes shorter than a block header are recognized by length alone;
    /// longer ones carry a null word where an allocation stores its handle
    /// slot (a live slot index is never zero, since the table sits above the
    /// arena).
    #[inline]
    pub(crate) fn is_hole(&self, block: usize, len: usize) -> bool {
        len < METADATA_CELLS || self.region.get(block + 1).is_null()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current base address of `h`'s payload.  O(1).
    ///
    /// The pointer is only good until the next call that may compact; writes
    /// through it are the caller's `unsafe` and must stay within the
    /// allocation.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale or from another context.
    pub fn get_data(&self, h: Handle) -> NonNull<u8> {
        let slot = self.live_slot(h).expect("get_data: stale or invalid handle");
        self.region.byte_ptr(self.region.get(slot).off())
    }

    /// The name the allocation was created with.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale or from another context.
    pub fn get_name(&self, h: Handle) -> &str {
        let slot = self.live_slot(h).expect("get_name: stale or invalid handle");
        let data = self.region.get(slot).off() / CELL;
        let name_cells = self.region.get(data - 1).val() as usize - 1;
        if name_cells == 0 {
            return "";
        }
        let header = data - name_cells - 4;
        let bytes = self.region.read_name(header + 3, name_cells);
        // SAFETY: names are only ever written from `&str` input.
        unsafe { core::str::from_utf8_unchecked(bytes) }
    }

    /// Bytes the tail of the arena can satisfy without compaction, less the
    /// handle-table reserve.  More may become available after compaction.
    pub fn available(&self) -> usize {
        (self.last_handle - self.alloc_end).saturating_sub(self.handle_slack) * CELL
    }
}

struct BlockList<'a, 'buf>(&'a Context<'buf>);

impl fmt::Debug for BlockList<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = self.0;
        let mut list = f.debug_list();
        let mut block = ctx.buf_start;
        while block < ctx.alloc_end {
            let len = ctx.region.get(block).val();
            if len < 0 {
                list.entry(&format_args!("{block}: free({})", -len));
                block += (-len) as usize;
                continue;
            }
            let len = len as usize;
            if ctx.is_hole(block, len) {
                list.entry(&format_args!("{block}: hole({len})"));
            } else {
                let h = ctx.handle_at(ctx.region.get(block + 1).off());
                list.entry(&format_args!("{block}: \"{}\"({len})", ctx.get_name(h)));
            }
            block += len;
        }
        list.finish()
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("buf_start", &self.buf_start)
            .field("alloc_end", &self.alloc_end)
            .field("first_free_block", &self.first_free_block)
            .field("last_handle", &self.last_handle)
            .field("handle_table", &self.handle_table)
            .field("compact", &self.compact)
            .field("handle_lock", &self.handle_lock)
            .field("blocks", &BlockList(self))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, Word};
    use crate::tests::AlignedBuf;
    use crate::word::CELL;

    #[test]
    fn fresh_context_layout() {
        let mut buf = AlignedBuf::<{ 64 * CELL }>::new();
        let ctx = Context::new(&mut buf.0);
        assert_eq!(ctx.buf_start, 0);
        assert_eq!(ctx.alloc_end, 0);
        assert_eq!(ctx.handle_table, 64);
        assert_eq!(ctx.last_handle, 64);
        assert_eq!(ctx.first_free_handle, 63);
        assert!(ctx.compact);
        assert!(ctx.handle_lock.is_none());
    }

    #[test]
    fn handle_table_extends_and_shrinks() {
        let mut buf = AlignedBuf::<{ 16 * CELL }>::new();
        let mut ctx = Context::new(&mut buf.0);

        let a = ctx.handle_alloc().unwrap();
        let b = ctx.handle_alloc().unwrap();
        assert_eq!(a, 15);
        assert_eq!(b, 14);
        assert_eq!(ctx.last_handle, 14);

        // Freeing the lowest slot contracts the table immediately; freeing a
        // mid-table slot only flags it for the next shrink pass.
        ctx.handle_free(b);
        assert_eq!(ctx.last_handle, 15);
        let c = ctx.handle_alloc().unwrap();
        assert_eq!(c, 14);
        ctx.handle_free(a);
        assert_eq!(ctx.last_handle, 14);
        assert!(!ctx.compact);
        ctx.region.set(c, Word::NULL);
        assert!(ctx.handle_table_shrink());
        assert_eq!(ctx.last_handle, 16);
        assert!(!ctx.handle_table_shrink());
    }

    #[test]
    fn handle_table_stops_at_the_arena() {
        let mut buf = AlignedBuf::<{ 4 * CELL }>::new();
        let mut ctx = Context::new(&mut buf.0);
        ctx.alloc_end = 2;
        assert!(ctx.handle_alloc().is_some());
        assert!(ctx.handle_alloc().is_some());
        // last_handle == alloc_end: no free cell separates them any more.
        assert_eq!(ctx.last_handle, 2);
        assert!(ctx.handle_alloc().is_none());
    }

    #[test]
    fn available_applies_the_slack() {
        let mut buf = AlignedBuf::<{ 256 * CELL }>::new();
        {
            let ctx = Context::new(&mut buf.0);
            assert_eq!(ctx.available(), 128 * CELL);
        }
        {
            let ctx = Context::new(&mut buf.0).with_handle_slack(0);
            assert_eq!(ctx.available(), 256 * CELL);
        }
        let ctx = Context::new(&mut buf.0).with_handle_slack(1024);
        assert_eq!(ctx.available(), 0);
    }
}
