//! A compacting, handle-based allocator for a single fixed buffer.
//!
//! Allocations are identified by small integer [`Handle`]s rather than
//! pointers: the allocator is free to slide blocks around between calls to
//! close up holes, so a data pointer is only good until the next call that
//! may compact.  [`Context::get_data`] re-fetches it in O(1) from a slot
//! table at the top of the buffer.  Blocks can register [`Callbacks`] to be
//! told before they move, or to be asked to give space back when the arena
//! runs dry.

#![no_std]

#[cfg(test)]
extern crate std;

mod alloc;
mod callbacks;
mod compact;
mod context;
mod shrink;
mod word;


pub use alloc::AllocError;
pub use callbacks::{
    CallbackStatus, Callbacks, MoveCallback, ShrinkCallback, ShrinkHints, default_callbacks,
};
pub use context::{Context, DEFAULT_HANDLE_SLACK, Handle, YieldHook};
