//! Allocation and release.
//!
//! The free-block search is first-fit from `first_free_block`; fragmentation
//! it causes is left for compaction to clean up.  The stretch between
//! `alloc_end` and `last_handle` acts as one virtual free block without a
//! header, which is why `alloc_end` exists at all.

use crate::callbacks::{Callbacks, CallbackStatus, ShrinkHints, default_callbacks, is_default};
use crate::context::{Context, Handle, METADATA_CELLS};
use crate::word::{CELL, Word, align_up};

/// Why an allocation request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No handle slot was free and the table could not extend into the arena.
    NoHandle,
    /// No free block fit, even after compaction and shrink callbacks.
    OutOfMemory,
    /// A maximum allocation is outstanding and the yield hook gave up
    /// waiting for it to be shrunk.
    Locked,
}

/// The bytes of `name` up to an interior NUL, if it has one.
pub(crate) fn name_bytes(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    }
}

impl<'buf> Context<'buf> {
    /// Allocate `size` bytes with no name and no callbacks.
    pub fn try_alloc(&mut self, size: usize) -> Result<Handle, AllocError> {
        self.try_alloc_ex(size, "", default_callbacks())
    }

    /// Allocate `size` bytes under `name`, with `ops` governing how the
    /// block behaves under compaction and shrink pressure.
    ///
    /// `ops` is borrowed until the allocation is freed; pass
    /// [`default_callbacks`](crate::default_callbacks) for a silently
    /// movable, non-shrinkable block.
    pub fn try_alloc_ex(
        &mut self,
        size: usize,
        name: &str,
        ops: &'buf Callbacks,
    ) -> Result<Handle, AllocError> {
        while self.handle_lock.is_some() {
            if !(self.yield_hook)() {
                return Err(AllocError::Locked);
            }
        }

        let name = name_bytes(name);
        let name_pad = align_up(name.len());
        let name_cells = name_pad / CELL;
        let payload = size.checked_add(name_pad).ok_or(AllocError::OutOfMemory)?;
        let size_cells = payload.div_ceil(CELL) + METADATA_CELLS;

        // Reserve the handle first; on failure, compaction may reclaim table
        // holes, and failing that the block just below the table can be
        // asked to pull its tail in.
        let mut slot = self.handle_alloc();
        if slot.is_none() && !self.compact && self.compact_arena() {
            slot = self.handle_alloc();
        }
        if slot.is_none() && self.shrink_for_handle_room() {
            slot = self.handle_alloc();
        }
        let Some(slot) = slot else {
            return Err(AllocError::NoHandle);
        };

        let (pos, avail, last) = loop {
            match self.find_fit(size_cells) {
                Some(fit) => break fit,
                None => {
                    let hints = (ShrinkHints::POS_FRONT | ShrinkHints::POS_BACK)
                        .with_size(size_cells.saturating_mul(CELL));
                    if !self.compact_and_shrink(hints) {
                        self.handle_free(slot);
                        return Err(AllocError::OutOfMemory);
                    }
                }
            }
        };

        self.region.set(pos, Word::from_val(size_cells as isize));
        self.region.set(pos + 1, Word::from_off(slot));
        self.region.set(pos + 2, Word::from_ops(ops));
        self.region.write_name(pos + 3, name_cells, name);
        let trailer = pos + 3 + name_cells;
        self.region
            .set(trailer, Word::from_val(1 + name_cells as isize));
        self.region.set(slot, Word::from_off((trailer + 1) * CELL));

        // The next search can skip the block we just took.
        if pos == self.first_free_block {
            self.first_free_block = pos + size_cells;
        }
        let end = pos + size_cells;
        if last {
            self.alloc_end = end;
        } else if avail > size_cells {
            // Interior fit: tag the remainder as its own free block.
            self.region
                .set(end, Word::from_val(size_cells as isize - avail as isize));
        }
        Ok(self.handle_at(slot))
    }

    /// Allocate the whole free tail of the arena, less room for the block
    /// header and one future handle slot.
    ///
    /// Until the returned handle is shrunk (or freed), other allocations
    /// wait on the context's yield hook; the owner is expected to give the
    /// space back with [`shrink`](Context::shrink) once it knows how much it
    /// really needs.
    pub fn try_alloc_maximum(
        &mut self,
        name: &str,
        ops: &'buf Callbacks,
    ) -> Result<(Handle, usize), AllocError> {
        self.compact_and_shrink(ShrinkHints::POS_FRONT | ShrinkHints::POS_BACK);
        let name_pad = align_up(name_bytes(name).len());
        let tail = self.last_handle - self.alloc_end;
        if tail < 5 + name_pad / CELL {
            return Err(AllocError::OutOfMemory);
        }
        let size = (tail - 5) * CELL - name_pad;
        let handle = self.try_alloc_ex(size, name, ops)?;
        self.handle_lock = Some(handle);
        Ok((handle, size))
    }

    /// Release the allocation behind `h`, merging its cells into any free
    /// neighbor.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale or from another context.
    pub fn free(&mut self, h: Handle) {
        let slot = self.live_slot(h).expect("free: stale or invalid handle");
        let freed = self.header_from_off(self.region.get(slot).off());
        let flen = self.region.get(freed).val();
        debug_assert!(flen > 0);

        let merged = match self.block_before(freed) {
            Some(prev) if self.region.get(prev).val() < 0 => {
                // Fold the freed length into the free predecessor.
                let grown = self.region.get(prev).val() - flen;
                self.region.set(prev, Word::from_val(grown));
                prev
            }
            _ => {
                self.region.set(freed, Word::from_val(-flen));
                freed
            }
        };

        let tail = merged + self.region.get(merged).val().unsigned_abs();
        if tail == self.alloc_end {
            // The free run reaches the end marker; give it back wholesale.
            self.alloc_end = merged;
        } else {
            self.compact = false;
            let next = self.region.get(tail).val();
            if next < 0 {
                let grown = self.region.get(merged).val() + next;
                self.region.set(merged, Word::from_val(grown));
            }
        }

        self.handle_free(slot);
        if merged < self.first_free_block {
            self.first_free_block = merged;
        }
        if self.handle_lock == Some(h) {
            self.handle_lock = None;
        }
    }

    /// First-fit scan for `size_cells`, returning the block position, its
    /// usable length, and whether it is the virtual tail block.
    fn find_fit(&self, size_cells: usize) -> Option<(usize, usize, bool)> {
        let mut block = self.first_free_block;
        loop {
            if block == self.alloc_end {
                let tail = self.last_handle - block;
                return (tail >= size_cells).then_some((block, tail, true));
            }
            let len = self.region.get(block).val();
            if len > 0 {
                // Allocated blocks and immovable-block holes alike.
                block += len as usize;
                continue;
            }
            let free_len = (-len) as usize;
            if free_len >= size_cells {
                return Some((block, free_len, false));
            }
            block += free_len;
        }
    }

    /// The block immediately before `target`, if `target` is not the first.
    pub(crate) fn block_before(&self, target: usize) -> Option<usize> {
        let mut cur = if self.first_free_block <= target {
            self.first_free_block
        } else {
            self.buf_start
        };
        let mut prev = None;
        while cur < target {
            prev = Some(cur);
            cur += self.region.get(cur).val().unsigned_abs();
        }
        debug_assert_eq!(cur, target, "walk must land on the target header");
        prev
    }

    /// Ask the topmost allocation to pull its tail in so the handle table
    /// can extend.  True iff its shrink callback reported success.
    fn shrink_for_handle_room(&mut self) -> bool {
        let mut block = self.buf_start;
        let mut top = None;
        while block < self.alloc_end {
            let len = self.region.get(block).val();
            if len > 0 && !self.is_hole(block, len as usize) {
                top = Some(block);
            }
            block += len.unsigned_abs();
        }
        let Some(block) = top else {
            return false;
        };

        let ops = self.region.get(block + 2).ops();
        if is_default(ops) {
            return false;
        }
        // SAFETY: the record was stored from a `&'buf Callbacks` at
        // allocation and is borrowed for the context's lifetime.
        let Some(shrink) = (unsafe { &*ops }).shrink_callback else {
            return false;
        };

        let len = self.region.get(block).val() as usize;
        let slot = self.region.get(block + 1).off();
        let data_off = self.region.get(slot).off();
        let handle = self.handle_at(slot);
        let old_size = (block + len) * CELL - data_off;
        let hints = ShrinkHints::POS_BACK.with_size(10 * CELL);
        let start = self.region.byte_ptr(data_off);
        shrink(self, handle, hints, start, old_size) == CallbackStatus::Ok
    }
}
