//! Callback records attached to allocations.
//!
//! A record is borrowed by the context for as long as any allocation
//! references it, and its *address* is part of the protocol: passing
//! [`default_callbacks`] tells the allocator there is nothing to dispatch,
//! and that case is detected by pointer identity, never by inspecting the
//! record's fields.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::context::{Context, Handle};

/// Outcome of a callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Ok,
    /// The owner cannot give up space right now; counts as no progress.
    CannotShrink,
}

/// Invoked before an allocation's cells are moved during compaction.
///
/// `old` and `new` are the payload's current and upcoming base addresses; the
/// cells still live at `old` when the callback runs.  Use this to fix up any
/// interior pointers.
pub type MoveCallback = fn(handle: Handle, old: NonNull<u8>, new: NonNull<u8>) -> CallbackStatus;

/// Invoked when the allocator wants the owner to give up space.
///
/// The owner moves its own data as needed and calls [`Context::shrink`] on
/// the context it is handed before returning [`CallbackStatus::Ok`]; the
/// allocator does not move data as part of shrinking.  The callback must not
/// free the handle it was invoked for.
pub type ShrinkCallback = fn(
    ctx: &mut Context<'_>,
    handle: Handle,
    hints: ShrinkHints,
    start: NonNull<u8>,
    old_size: usize,
) -> CallbackStatus;

/// Per-allocation callbacks.
///
/// A `None` move callback makes the allocation immovable: compaction routes
/// around it instead of relocating it.  A `None` shrink callback means the
/// allocation cannot be asked to give up space.  Allocations that must not
/// move should at least be shrinkable, or they can wedge the arena.
pub struct Callbacks {
    pub move_callback: Option<MoveCallback>,
    pub shrink_callback: Option<ShrinkCallback>,
}

static DEFAULT_CALLBACKS: Callbacks = Callbacks {
    move_callback: None,
    shrink_callback: None,
};

/// The "no callbacks" sentinel.
///
/// Allocations carrying this record are moved silently during compaction and
/// are never asked to shrink.
pub fn default_callbacks() -> &'static Callbacks {
    &DEFAULT_CALLBACKS
}

#[inline]
pub(crate) fn is_default(ops: *const Callbacks) -> bool {
    core::ptr::eq(ops, &DEFAULT_CALLBACKS)
}

bitflags! {
    /// Hints passed to a [`ShrinkCallback`].
    ///
    /// The top two bits say which end of the allocation the allocator would
    /// like space from; the low 30 bits carry a suggested byte count,
    /// accessed through [`with_size`](ShrinkHints::with_size) and
    /// [`size_hint`](ShrinkHints::size_hint).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShrinkHints: u32 {
        /// Space is wanted at the front of the allocation.
        const POS_FRONT = 1 << 31;
        /// Space is wanted at the back of the allocation.
        const POS_BACK = 1 << 30;
    }
}

impl ShrinkHints {
    const SIZE_MASK: u32 = !(Self::POS_FRONT.bits() | Self::POS_BACK.bits());

    /// Attach a suggested size in bytes, saturating to the 30 bits available.
    pub fn with_size(self, bytes: usize) -> Self {
        let clamped = u32::try_from(bytes).unwrap_or(u32::MAX) & Self::SIZE_MASK;
        Self::from_bits_retain((self.bits() & !Self::SIZE_MASK) | clamped)
    }

    /// The suggested size in bytes, zero when the caller did not say.
    pub fn size_hint(self) -> usize {
        (self.bits() & Self::SIZE_MASK) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::{Callbacks, ShrinkHints, default_callbacks, is_default};

    #[test]
    fn sentinel_is_detected_by_address() {
        assert!(is_default(default_callbacks()));
        // A record with identical contents is not the sentinel.
        let twin = Callbacks {
            move_callback: None,
            shrink_callback: None,
        };
        assert!(!is_default(&twin));
    }

    #[test]
    fn hints_pack_position_and_size() {
        let hints = ShrinkHints::POS_BACK.with_size(80);
        assert!(hints.contains(ShrinkHints::POS_BACK));
        assert!(!hints.contains(ShrinkHints::POS_FRONT));
        assert_eq!(hints.size_hint(), 80);

        let both = (ShrinkHints::POS_FRONT | ShrinkHints::POS_BACK).with_size(usize::MAX);
        assert_eq!(both.size_hint(), ShrinkHints::SIZE_MASK as usize);
        assert!(both.contains(ShrinkHints::POS_FRONT | ShrinkHints::POS_BACK));
    }
}
