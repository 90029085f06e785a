//! Persistent-allocator actions: reserve, publish, defer-free
//!
//! An action describes a heap intention that stays invisible until
//! published. Publishing registers a set of actions with an operation
//! context; once the context processes, every allocation, free, and
//! piggybacked word write in the set becomes visible atomically.

use crate::error::{fail, Error, Result};
use crate::heap::{Heap, ReservedBlock};
use crate::memops::OperationContext;
use crate::ulog::{UlogOp, ENTRY_VAL_SIZE};

/// A publishable allocator intention
#[derive(Debug, Clone, Copy)]
pub enum PobjAction {
    Alloc {
        block: ReservedBlock,
        internal: bool,
    },
    Free {
        block_off: u64,
    },
    Set {
        dest_off: u64,
        value: u64,
    },
}

impl PobjAction {
    /// Heap offset of the reserved payload, for `Alloc` actions
    pub fn payload_off(&self) -> Option<u64> {
        match self {
            PobjAction::Alloc { block, .. } => Some(block.payload_off),
            _ => None,
        }
    }
}

/// Reserves a block without making it visible
///
/// The optional constructor runs over the fresh payload right away; its
/// writes are safe because the block cannot be reached until publish.
pub fn reserve(
    heap: &Heap,
    size: usize,
    constructor: Option<&mut dyn FnMut(*mut u8, usize)>,
    extra: u64,
    internal: bool,
    class_id: u16,
    arena_id: u16,
) -> Result<PobjAction> {
    if size == 0 {
        return fail(Error::Invalid("zero-sized allocation"));
    }
    if class_id != 0 || arena_id != 0 {
        return fail(Error::Invalid("allocation classes and arenas are not configured"));
    }
    if size > heap.max_alloc() {
        return fail(Error::OutOfMemory);
    }

    let block = heap.reserve_block(size)?;
    heap.set_extra(block.block_off, extra);
    if let Some(ctor) = constructor {
        let ptr = heap_payload_ptr(heap, &block);
        ctor(ptr, block.usable);
    }
    Ok(PobjAction::Alloc { block, internal })
}

fn heap_payload_ptr(heap: &Heap, block: &ReservedBlock) -> *mut u8 {
    heap.ops().off_to_ptr(block.payload_off)
}

/// Registers a deferred free; the object disappears at publish
pub fn defer_free(heap: &Heap, payload_off: u64) -> Result<PobjAction> {
    if !heap.is_allocated(payload_off) {
        return fail(Error::Invalid("free of an unallocated object"));
    }
    Ok(PobjAction::Free {
        block_off: payload_off - crate::heap::ALLOC_HDR_SIZE as u64,
    })
}

/// Piggybacks a single durable word write on a publish
pub fn set_value(dest_off: u64, value: u64) -> PobjAction {
    PobjAction::Set { dest_off, value }
}

/// Discards reservations; published actions must never be cancelled
pub fn cancel(heap: &Heap, actions: &[PobjAction]) {
    for a in actions {
        if let PobjAction::Alloc { block, .. } = a {
            heap.cancel_block(block);
        }
    }
}

/// Publishes a set of actions through `ctx`
///
/// Capacity for every entry is reserved up front, so the publish either
/// emits the complete set or fails without persistent effect; the caller
/// still owns (and on failure should cancel) the actions.
pub fn publish(heap: &Heap, actions: &[PobjAction], ctx: &mut OperationContext) -> Result<()> {
    ctx.reserve(actions.len() * ENTRY_VAL_SIZE)?;

    for a in actions {
        match a {
            PobjAction::Alloc { block, internal } => {
                let (off, value) = heap.publish_alloc_value(block, *internal);
                ctx.add_entry_off(off, value, UlogOp::Set)?;
            }
            PobjAction::Free { block_off } => {
                let (off, value) = heap.publish_free_value(*block_off);
                ctx.add_entry_off(off, value, UlogOp::Set)?;
            }
            PobjAction::Set { dest_off, value } => {
                ctx.add_entry_off(*dest_off, *value, UlogOp::Set)?;
            }
        }
    }

    ctx.process();

    for a in actions {
        match a {
            PobjAction::Alloc { block, .. } => heap.on_alloc_committed(block),
            PobjAction::Free { block_off } => heap.on_free_committed(*block_off),
            PobjAction::Set { .. } => {}
        }
    }

    ctx.finish(0);
    Ok(())
}

// -- queries over published objects -----------------------------------------

pub fn usable_size(heap: &Heap, payload_off: u64) -> usize {
    heap.usable_size(payload_off)
}

pub fn extra(heap: &Heap, payload_off: u64) -> u64 {
    heap.extra(payload_off)
}

pub fn object_flags(heap: &Heap, payload_off: u64) -> u64 {
    heap.object_flags(payload_off)
}

pub fn first(heap: &Heap) -> Option<u64> {
    heap.first()
}

pub fn next(heap: &Heap, payload_off: u64) -> Option<u64> {
    heap.next(payload_off)
}

pub fn heap_check(heap: &Heap) -> Result<()> {
    heap.check()
}
