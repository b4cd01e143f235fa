//! Compaction: sliding live blocks down over free holes.
//!
//! The walk keeps a running (negative) shift in cells.  Free blocks feed the
//! shift; allocated blocks are slid down by it, after their move callback has
//! had a chance to fix up interior pointers.  A block whose record has no
//! move callback cannot be slid: the accumulated gap is parked below it as a
//! positive-tagged hole, which every scan thereafter treats as occupied
//! space.

use core::ptr::NonNull;

use crate::callbacks::{CallbackStatus, ShrinkHints, is_default};
use crate::context::Context;
use crate::word::{CELL, Word};

impl<'buf> Context<'buf> {
    /// Close the free holes below `alloc_end`, updating handle slots as
    /// blocks move.  True iff the handle table shrank or any cells moved.
    pub(crate) fn compact_arena(&mut self) -> bool {
        let table_shrunk = self.handle_table_shrink();
        let mut shift: isize = 0;
        let mut moved = false;
        let mut hole_made = false;

        let mut block = self.first_free_block;
        while block < self.alloc_end {
            let len = self.region.get(block).val();
            if len < 0 {
                shift += len;
                block += (-len) as usize;
                continue;
            }
            let len = len as usize;
            if shift != 0 {
                let hole = self.is_hole(block, len);
                let ops = self.region.get(block + 2).ops();
                // SAFETY: a non-hole allocated block stores a record that
                // was a `&'buf Callbacks` at allocation time.
                let immovable =
                    hole || (!is_default(ops) && unsafe { (*ops).move_callback }.is_none());
                if immovable {
                    // Park the gap below this block and start over above it.
                    let pos = (block as isize + shift) as usize;
                    self.region.set(pos, Word::from_val(-shift));
                    if (-shift) as usize >= 2 {
                        self.region.set(pos + 1, Word::NULL);
                    }
                    hole_made = true;
                    if pos < self.first_free_block {
                        self.first_free_block = pos;
                    }
                    shift = 0;
                } else {
                    let slot = self.region.get(block + 1).off();
                    let old_off = self.region.get(slot).off();
                    let new_off = (old_off as isize + shift * CELL as isize) as usize;
                    if !is_default(ops) {
                        // SAFETY: as above; the callback runs before the
                        // cells move, while `old_off` is still valid.
                        if let Some(move_cb) = unsafe { (*ops).move_callback } {
                            let _ = move_cb(
                                self.handle_at(slot),
                                self.region.byte_ptr(old_off),
                                self.region.byte_ptr(new_off),
                            );
                        }
                    }
                    self.region.set(slot, Word::from_off(new_off));
                    self.region
                        .move_cells(block, (block as isize + shift) as usize, len);
                    moved = true;
                }
            }
            block += len;
        }

        // A trailing free run has no block after it to slide down; it is
        // reclaimed by pulling alloc_end in, so leftover shift is progress
        // too.
        self.alloc_end = (self.alloc_end as isize + shift) as usize;
        if hole_made {
            if self.first_free_block > self.alloc_end {
                self.first_free_block = self.alloc_end;
            }
        } else {
            self.first_free_block = self.alloc_end;
        }
        self.compact = true;
        table_shrunk || moved || shift != 0
    }

    /// Compact, and when that alone frees nothing, ask every shrinkable
    /// allocation once to give up space, then compact again.  True iff
    /// anything was freed or consolidated.
    pub(crate) fn compact_and_shrink(&mut self, hints: ShrinkHints) -> bool {
        let mut progress = false;
        if !self.compact {
            progress = self.compact_arena();
        }
        if !progress {
            let mut block = self.buf_start;
            while block < self.alloc_end {
                let len = self.region.get(block).val();
                if len < 0 {
                    block += (-len) as usize;
                    continue;
                }
                let len = len as usize;
                let mut next = block + len;
                if !self.is_hole(block, len) {
                    let ops = self.region.get(block + 2).ops();
                    // SAFETY: live allocation; record outlives the context.
                    let shrink_cb =
                        (!is_default(ops)).then(|| unsafe { (*ops).shrink_callback }).flatten();
                    if let Some(shrink_cb) = shrink_cb {
                        let slot = self.region.get(block + 1).off();
                        let handle = self.handle_at(slot);
                        let data_off = self.region.get(slot).off();
                        let old_size = (block + len) * CELL - data_off;
                        let start = self.region.byte_ptr(data_off);
                        if shrink_cb(self, handle, hints, start, old_size) == CallbackStatus::Ok {
                            progress = true;
                            // The owner shrank (and possibly relocated) the
                            // block; pick the walk back up past wherever its
                            // header is now.
                            debug_assert!(
                                self.region.get(slot).is_live_slot(),
                                "shrink callback must not free its own handle"
                            );
                            let header = self.header_from_off(self.region.get(slot).off());
                            next = header + self.region.get(header).val().unsigned_abs();
                        }
                    }
                }
                block = next;
            }
            if progress {
                self.compact_arena();
            }
        }
        progress
    }

    /// Slide everything between `buf_start` and `alloc_end` by `shift`
    /// cells, fixing up every live handle slot and the arena bounds.
    fn buffer_shift(&mut self, shift: isize) {
        if shift == 0 {
            return;
        }
        let dst = (self.buf_start as isize + shift) as usize;
        self.region
            .move_cells(self.buf_start, dst, self.alloc_end - self.buf_start);
        for slot in self.last_handle..self.handle_table {
            let word = self.region.get(slot);
            if word.is_live_slot() {
                let off = (word.off() as isize + shift * CELL as isize) as usize;
                self.region.set(slot, Word::from_off(off));
            }
        }
        self.buf_start = dst;
        self.first_free_block = (self.first_free_block as isize + shift) as usize;
        self.alloc_end = (self.alloc_end as isize + shift) as usize;
    }

    /// Lend out the bottom of the region: compact, then shift the arena up
    /// by `size` bytes (everything free when `size` is 0) and return the old
    /// base and the byte count actually freed.
    ///
    /// The lent range is dead to the allocator until a matching
    /// [`buffer_in`](Context::buffer_in) gives it back.
    pub fn buffer_out(&mut self, size: usize) -> (NonNull<u8>, usize) {
        if !self.compact {
            self.compact_arena();
        }
        let mut cells = self.last_handle - self.alloc_end;
        if size != 0 && size < cells * CELL {
            cells = size.div_ceil(CELL);
        }
        let freed = self.region.byte_ptr(self.buf_start * CELL);
        self.buffer_shift(cells as isize);
        (freed, cells * CELL)
    }

    /// Take back `size` bytes previously lent out by
    /// [`buffer_out`](Context::buffer_out), shifting the arena back down.
    /// The caller must be done with that range; its contents are overwritten.
    pub fn buffer_in(&mut self, size: usize) {
        let cells = (size / CELL).min(self.buf_start);
        self.buffer_shift(-(cells as isize));
    }
}
