//! The block heap behind the persistent allocator facade
//!
//! The heap area is tiled with power-of-two blocks, the smallest 64 bytes.
//! Every block starts with a 16-byte header: a packed info word (magic tag,
//! order, allocated and internal bits) and an extra word holding the
//! caller's type number. The free lists are volatile and are rebuilt on
//! every boot by walking headers from the heap base; that same walk backs
//! object iteration and the heap consistency check.
//!
//! Media state changes in two ways only: single-word header updates during
//! split/merge (ordered so the walk always observes a complete tiling), and
//! redo-logged info-word writes that make an allocation or a free visible
//! atomically with the rest of its transaction.

use crate::error::{fail, Error, Result};
use crate::pmem::PmemOps;
use crate::stats::Stats;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Smallest block: 2^7 = 128 bytes (a header line plus one payload line)
pub const HEAP_MIN_ORDER: u32 = 7;
pub const HEAP_MAX_ORDER: u32 = 47;

/// Bytes of every block taken by its header; a full cache line, so every
/// payload is cache-line aligned and may hold locks and log records
pub const ALLOC_HDR_SIZE: usize = 64;

const INFO_ORDER_MASK: u64 = 0x3f;
const INFO_ALLOCATED: u64 = 1 << 8;
const INFO_INTERNAL: u64 = 1 << 9;
const INFO_MAGIC_MASK: u64 = 0xffff_u64 << 48;
const INFO_MAGIC: u64 = 0x5ca1_u64 << 48;

#[inline]
fn pack_info(order: u32, allocated: bool, internal: bool) -> u64 {
    INFO_MAGIC
        | order as u64
        | if allocated { INFO_ALLOCATED } else { 0 }
        | if internal { INFO_INTERNAL } else { 0 }
}

#[inline]
fn info_order(info: u64) -> u32 {
    (info & INFO_ORDER_MASK) as u32
}

#[inline]
fn info_is_block(info: u64) -> bool {
    info & INFO_MAGIC_MASK == INFO_MAGIC
}

/// Block order for a payload of `size` bytes
#[inline]
pub fn order_for(size: usize) -> u32 {
    let need = (size + ALLOC_HDR_SIZE).max(1 << HEAP_MIN_ORDER);
    need.next_power_of_two().trailing_zeros()
}

/// A block taken off the free lists but not yet published
#[derive(Debug, Clone, Copy)]
pub struct ReservedBlock {
    pub block_off: u64,
    pub payload_off: u64,
    pub order: u32,
    pub usable: usize,
}

struct HeapRt {
    free: Vec<std::collections::BTreeSet<u64>>, // relative offsets, per order
    available: usize,
}

pub struct Heap {
    p_ops: PmemOps,
    base_off: u64,
    size: usize,
    rt: Mutex<HeapRt>,
    stats: Arc<Stats>,
    /// fill byte for fresh allocations; negative disables
    pub alloc_pattern: AtomicI64,
    /// auto-extend granularity; zero disables (single-file pools have no
    /// headroom, so extension requests report out-of-memory)
    pub growsize: AtomicU64,
}

impl Heap {
    /// Formats the heap area: a greedy tiling of maximal free blocks
    pub unsafe fn init(p_ops: &PmemOps, base_off: u64, size: usize) {
        let mut rel = 0usize;
        while rel + (1 << HEAP_MIN_ORDER) <= size {
            let align = if rel == 0 {
                HEAP_MAX_ORDER
            } else {
                rel.trailing_zeros()
            };
            let mut order = align.min(63 - (size - rel).leading_zeros());
            order = order.min(HEAP_MAX_ORDER);
            Self::write_header_raw(p_ops, base_off + rel as u64, pack_info(order, false, false), false);
            rel += 1 << order;
        }
        p_ops.drain();
    }

    /// Rebuilds the volatile index by walking headers from the heap base
    pub unsafe fn boot(
        p_ops: PmemOps,
        base_off: u64,
        size: usize,
        stats: Arc<Stats>,
    ) -> Result<Heap> {
        let heap = Heap {
            p_ops,
            base_off,
            size,
            rt: Mutex::new(HeapRt {
                free: (0..64).map(|_| Default::default()).collect(),
                available: 0,
            }),
            stats,
            alloc_pattern: AtomicI64::new(-1),
            growsize: AtomicU64::new(0),
        };

        let mut rel = 0usize;
        {
            let mut rt = heap.rt.lock().unwrap();
            while rel + (1 << HEAP_MIN_ORDER) <= size {
                let info = heap.read_info(base_off + rel as u64);
                if !info_is_block(info) {
                    return fail(Error::Corrupt("heap block header malformed"));
                }
                let order = info_order(info);
                if order < HEAP_MIN_ORDER || rel + (1usize << order) > size {
                    return fail(Error::Corrupt("heap block order out of bounds"));
                }
                if info & INFO_ALLOCATED == 0 {
                    Self::insert_free(&heap.p_ops, base_off, &mut rt, rel as u64, order, size);
                }
                rel += 1 << order;
            }
        }
        Ok(heap)
    }

    #[inline]
    pub fn ops(&self) -> &PmemOps {
        &self.p_ops
    }

    #[inline]
    fn info_ptr(&self, block_off: u64) -> *mut u64 {
        self.p_ops.off_to_ptr(block_off) as *mut u64
    }

    #[inline]
    fn read_info(&self, block_off: u64) -> u64 {
        unsafe { *self.info_ptr(block_off) }
    }

    unsafe fn write_header_raw(p_ops: &PmemOps, block_off: u64, info: u64, drain: bool) {
        let p = p_ops.off_to_ptr(block_off) as *mut u64;
        *p = info;
        if drain {
            p_ops.persist(p as *const u8, 8);
        } else {
            p_ops.flush(p as *const u8, 8);
        }
    }

    /// Returns a free block to the index, merging buddies as far as possible
    ///
    /// The promoted header lands at the first buddy's position, so a single
    /// persisted word is the whole merge; a crash before it leaves two
    /// smaller free blocks, which is just as consistent.
    fn insert_free(
        p_ops: &PmemOps,
        base_off: u64,
        rt: &mut HeapRt,
        mut rel: u64,
        mut order: u32,
        size: usize,
    ) {
        loop {
            let span = 1u64 << order;
            let buddy = rel ^ span;
            if order < HEAP_MAX_ORDER
                && (buddy + span) as usize <= size
                && rt.free[order as usize].remove(&buddy)
            {
                rel = rel.min(buddy);
                order += 1;
                unsafe {
                    Self::write_header_raw(
                        p_ops,
                        base_off + rel,
                        pack_info(order, false, false),
                        true,
                    );
                }
            } else {
                rt.free[order as usize].insert(rel);
                rt.available += span as usize;
                return;
            }
        }
    }

    /// Takes a block of at least `size` payload bytes off the free lists
    ///
    /// The block stays marked free on media; it becomes an allocation only
    /// when the publishing transaction commits its header write.
    pub fn reserve_block(&self, size: usize) -> Result<ReservedBlock> {
        let order = order_for(size);
        if order > HEAP_MAX_ORDER {
            return fail(Error::OutOfMemory);
        }
        let mut rt = self.rt.lock().unwrap();

        let mut have = order;
        while (have as usize) < rt.free.len() && rt.free[have as usize].is_empty() {
            have += 1;
        }
        if have as usize >= rt.free.len() {
            return fail(Error::OutOfMemory);
        }

        let mut rel = *rt.free[have as usize].iter().next().unwrap();
        rt.free[have as usize].remove(&rel);
        rt.available -= 1usize << have;

        // split down, writing the carved-off halves before the shrunk front
        while have > order {
            have -= 1;
            let half = rel + (1u64 << have);
            unsafe {
                Self::write_header_raw(
                    &self.p_ops,
                    self.base_off + half,
                    pack_info(have, false, false),
                    true,
                );
            }
            rt.free[have as usize].insert(half);
            rt.available += 1usize << have;
        }
        if self.read_info(self.base_off + rel) != pack_info(order, false, false) {
            unsafe {
                Self::write_header_raw(
                    &self.p_ops,
                    self.base_off + rel,
                    pack_info(order, false, false),
                    true,
                );
            }
        }
        drop(rt);

        let block_off = self.base_off + rel;
        let usable = (1usize << order) - ALLOC_HDR_SIZE;

        let pattern = self.alloc_pattern.load(Ordering::Relaxed);
        if pattern >= 0 {
            unsafe {
                self.p_ops.memset(
                    self.p_ops.off_to_ptr(block_off + ALLOC_HDR_SIZE as u64),
                    pattern as u8,
                    usable,
                    0,
                );
            }
        }

        log!(Green, "RESERVE", "block {:#x} order {} ({} usable)", block_off, order, usable);

        Ok(ReservedBlock {
            block_off,
            payload_off: block_off + ALLOC_HDR_SIZE as u64,
            order,
            usable,
        })
    }

    /// Puts a reservation back; the media never knew about it
    pub fn cancel_block(&self, block: &ReservedBlock) {
        let mut rt = self.rt.lock().unwrap();
        Self::insert_free(
            &self.p_ops,
            self.base_off,
            &mut rt,
            block.block_off - self.base_off,
            block.order,
            self.size,
        );
    }

    /// Stamps the extra word (the caller's type number); only legal before
    /// the block is published
    pub fn set_extra(&self, block_off: u64, extra: u64) {
        unsafe {
            let p = (self.p_ops.off_to_ptr(block_off) as *mut u64).add(1);
            *p = extra;
            self.p_ops.persist(p as *const u8, 8);
        }
    }

    /// The redo entry (offset, value) that makes an allocation visible
    pub fn publish_alloc_value(&self, block: &ReservedBlock, internal: bool) -> (u64, u64) {
        (block.block_off, pack_info(block.order, true, internal))
    }

    /// The redo entry (offset, value) that retires an allocation
    pub fn publish_free_value(&self, block_off: u64) -> (u64, u64) {
        let info = self.read_info(block_off);
        debug_assert!(info_is_block(info) && info & INFO_ALLOCATED != 0);
        (block_off, pack_info(info_order(info), false, false))
    }

    /// Volatile bookkeeping once an allocation's publish has been processed
    pub fn on_alloc_committed(&self, block: &ReservedBlock) {
        self.stats.on_alloc(block.usable);
    }

    /// Volatile bookkeeping once a free's publish has been processed
    pub fn on_free_committed(&self, block_off: u64) {
        let info = self.read_info(block_off);
        debug_assert!(info_is_block(info) && info & INFO_ALLOCATED == 0);
        let order = info_order(info);
        self.stats.on_free((1usize << order) - ALLOC_HDR_SIZE);
        let mut rt = self.rt.lock().unwrap();
        Self::insert_free(
            &self.p_ops,
            self.base_off,
            &mut rt,
            block_off - self.base_off,
            order,
            self.size,
        );
    }

    // -- queries ------------------------------------------------------------

    #[inline]
    pub fn contains_off(&self, off: u64) -> bool {
        off >= self.base_off && off < self.base_off + self.size as u64
    }

    pub fn usable_size(&self, payload_off: u64) -> usize {
        let info = self.read_info(payload_off - ALLOC_HDR_SIZE as u64);
        debug_assert!(info_is_block(info));
        (1usize << info_order(info)) - ALLOC_HDR_SIZE
    }

    pub fn extra(&self, payload_off: u64) -> u64 {
        unsafe {
            *(self
                .p_ops
                .off_to_ptr(payload_off - ALLOC_HDR_SIZE as u64) as *const u64)
                .add(1)
        }
    }

    pub fn object_flags(&self, payload_off: u64) -> u64 {
        self.read_info(payload_off - ALLOC_HDR_SIZE as u64) & INFO_INTERNAL
    }

    pub fn is_allocated(&self, payload_off: u64) -> bool {
        let off = payload_off.wrapping_sub(ALLOC_HDR_SIZE as u64);
        if !self.contains_off(off) {
            return false;
        }
        let info = self.read_info(off);
        info_is_block(info) && info & INFO_ALLOCATED != 0
    }

    /// First client-visible object in address order
    pub fn first(&self) -> Option<u64> {
        self.next_from(0)
    }

    /// Client-visible object following the one at `payload_off`
    pub fn next(&self, payload_off: u64) -> Option<u64> {
        let rel = payload_off - ALLOC_HDR_SIZE as u64 - self.base_off;
        let info = self.read_info(self.base_off + rel);
        self.next_from(rel as usize + (1usize << info_order(info)))
    }

    fn next_from(&self, mut rel: usize) -> Option<u64> {
        while rel + (1 << HEAP_MIN_ORDER) <= self.size {
            let info = self.read_info(self.base_off + rel as u64);
            if !info_is_block(info) {
                return None;
            }
            if info & INFO_ALLOCATED != 0 && info & INFO_INTERNAL == 0 {
                return Some(self.base_off + rel as u64 + ALLOC_HDR_SIZE as u64);
            }
            rel += 1usize << info_order(info);
        }
        None
    }

    /// Largest single allocation this heap could ever satisfy
    pub fn max_alloc(&self) -> usize {
        let order = (63 - (self.size as u64).leading_zeros()).min(HEAP_MAX_ORDER);
        (1usize << order) - ALLOC_HDR_SIZE
    }

    pub fn available(&self) -> usize {
        self.rt.lock().unwrap().available
    }

    /// Grows the heap area; single-file pools have no headroom
    pub fn extend(&self, _bytes: usize) -> Result<()> {
        fail(Error::OutOfMemory)
    }

    /// Walks the whole area verifying that block headers tile it exactly
    pub fn check(&self) -> Result<()> {
        let mut rel = 0usize;
        while rel + (1 << HEAP_MIN_ORDER) <= self.size {
            let info = self.read_info(self.base_off + rel as u64);
            if !info_is_block(info) {
                return fail(Error::Corrupt("heap block header malformed"));
            }
            let order = info_order(info);
            if order < HEAP_MIN_ORDER || rel + (1usize << order) > self.size {
                return fail(Error::Corrupt("heap block order out of bounds"));
            }
            rel += 1usize << order;
        }
        Ok(())
    }
}
