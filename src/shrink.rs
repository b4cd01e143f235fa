//! Giving space back from either end of an allocation.
//!
//! Shrinking never moves payload data; the owner copies whatever it wants to
//! keep before calling in (typically from inside its shrink callback).  A
//! front shrink relocates the block's metadata up to just below the new
//! payload start and frees the vacated prefix; a tail shrink hands the
//! reclaimed cells to whatever follows the block.

use core::ptr::NonNull;

use crate::context::{Context, Handle};
use crate::word::{CELL, Word};

impl<'buf> Context<'buf> {
    /// Reduce `h`'s payload to `[new_start, new_start + new_size)`, which
    /// must lie within its current extent.  Returns false, touching nothing,
    /// when the range is out of bounds or `h` is stale.
    ///
    /// A maximum allocation's lock is released by this call regardless of
    /// the outcome.
    pub fn shrink(&mut self, h: Handle, new_start: NonNull<u8>, new_size: usize) -> bool {
        let ok = self.shrink_inner(h, new_start, new_size);
        if self.handle_lock == Some(h) {
            self.handle_lock = None;
        }
        ok
    }

    fn shrink_inner(&mut self, h: Handle, new_start: NonNull<u8>, new_size: usize) -> bool {
        let Some(slot) = self.live_slot(h) else {
            return false;
        };
        let old_off = self.region.get(slot).off();
        let base = self.region.byte_ptr(0).as_ptr() as usize;
        let new_off = (new_start.as_ptr() as usize).wrapping_sub(base);

        let mut header = self.header_from_off(old_off);
        let old_end = header + self.region.get(header).val() as usize;
        if new_off < old_off {
            return false;
        }
        let Some(new_end_bytes) = new_off.checked_add(new_size) else {
            return false;
        };
        if new_end_bytes > old_end * CELL {
            return false;
        }

        // The payload start may sit mid-cell after an earlier front shrink;
        // the metadata length is measured from the aligned-down data cell.
        let aligned_old = old_off / CELL;
        let meta = aligned_old - header;
        let new_data = new_off / CELL;

        if new_data > aligned_old {
            // Front shrink: slide the metadata up under the new start and
            // free the prefix.
            let new_header = new_data - meta;
            let vacated = (new_header - header) as isize;
            let prev = self.block_before(header);
            self.region.move_cells(header, new_header, meta);
            self.region
                .set(new_header, Word::from_val((old_end - new_header) as isize));
            self.region.set(slot, Word::from_off(new_off));
            match prev {
                Some(prev) if self.region.get(prev).val() < 0 => {
                    let grown = self.region.get(prev).val() - vacated;
                    self.region.set(prev, Word::from_val(grown));
                }
                _ => {
                    self.region.set(header, Word::from_val(-vacated));
                    if header < self.first_free_block {
                        self.first_free_block = header;
                    }
                }
            }
            self.compact = false;
            header = new_header;
        }

        let new_end = new_end_bytes.div_ceil(CELL);
        if new_end != old_end {
            self.region
                .set(header, Word::from_val((new_end - header) as isize));
            if old_end == self.alloc_end {
                self.alloc_end = new_end;
                if self.first_free_block > self.alloc_end {
                    self.first_free_block = self.alloc_end;
                }
            } else {
                let next = self.region.get(old_end).val();
                if next < 0 {
                    // Grow the following free block downward over the
                    // reclaimed cells.
                    let grown = next - (old_end - new_end) as isize;
                    self.region.set(new_end, Word::from_val(grown));
                } else {
                    self.region
                        .set(new_end, Word::from_val(new_end as isize - old_end as isize));
                }
                self.compact = false;
                if new_end < self.first_free_block {
                    self.first_free_block = new_end;
                }
            }
        }
        true
    }
}
