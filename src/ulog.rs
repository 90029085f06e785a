//! The unified log: a chained, checksummed, on-media record
//!
//! A ulog is a cache-line-aligned header followed by a payload of
//! variable-sized entries. Logs chain through the header's `next` offset;
//! continuations are either allocator-owned or user-provided buffers. The
//! same structure serves as a redo log (applied forward on commit and on
//! recovery) and as an undo log (replayed to roll snapshots back).
//!
//! A redo log becomes valid at the instant its base-record checksum is
//! written; everything behind it is made durable first, so the checksum is
//! the commit point. Undo validity is per entry: each buffer entry carries a
//! checksum bound to the owning log's generation number, and bumping that
//! number invalidates every entry at once.

use crate::error::{Error, Result};
use crate::pmem::{flags as mf, PmemOps};
use crate::util::{align_up, checksum_skip, Fletcher64};
use crate::CACHELINE_SIZE;

/// On-media size of the ulog header
pub const ULOG_HEADER_SIZE: usize = 64;

/// Allocation size for an extension with `capacity` payload bytes; the
/// extra cache line absorbs alignment of the record start.
#[inline]
pub const fn aligned_extension_size(capacity: usize) -> usize {
    ULOG_HEADER_SIZE + capacity + CACHELINE_SIZE
}

/// The buffer was provided by the user and must never be freed to the heap
pub const ULOG_USER_OWNED: u64 = 1 << 0;

/// `finish`-time flags
pub const ULOG_FREE_AFTER_FIRST: u64 = 1 << 0;
pub const ULOG_INC_FIRST_GEN_NUM: u64 = 1 << 1;
pub const ULOG_ANY_USER_BUFFER: u64 = 1 << 2;

const OP_SHIFT: u32 = 61;
pub const OP_MASK: u64 = 0b111 << OP_SHIFT;
pub const OFF_MASK: u64 = !OP_MASK;

/// Entry kinds, stored in the top 3 bits of the entry's first word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlogOp {
    Set,
    And,
    Or,
    BufSet,
    BufCpy,
}

impl UlogOp {
    #[inline]
    pub fn to_bits(self) -> u64 {
        let b: u64 = match self {
            UlogOp::Set => 0b000,
            UlogOp::And => 0b001,
            UlogOp::Or => 0b010,
            UlogOp::BufSet => 0b101,
            UlogOp::BufCpy => 0b110,
        };
        b << OP_SHIFT
    }

    /// Decodes an entry tag; an unknown tag means the media holds something
    /// this engine never wrote, which is not survivable.
    #[inline]
    pub fn from_bits(word: u64) -> UlogOp {
        match (word & OP_MASK) >> OP_SHIFT {
            0b000 => UlogOp::Set,
            0b001 => UlogOp::And,
            0b010 => UlogOp::Or,
            0b101 => UlogOp::BufSet,
            0b110 => UlogOp::BufCpy,
            t => panic!("unknown ulog entry type {}", t),
        }
    }

    #[inline]
    pub fn is_buf(self) -> bool {
        matches!(self, UlogOp::BufSet | UlogOp::BufCpy)
    }
}

/// Ulog header; payload bytes follow immediately
#[repr(C, align(64))]
pub struct Ulog {
    pub checksum: u64,
    pub next: u64,
    pub capacity: u64,
    pub gen_num: u64,
    pub flags: u64,
    unused: [u64; 3],
}

const _: [(); ULOG_HEADER_SIZE] = [(); std::mem::size_of::<Ulog>()];

/// 16-byte value entry
#[repr(C)]
pub struct UlogEntryVal {
    pub offset: u64,
    pub value: u64,
}

/// Buffer entry header; `size` payload bytes follow, and the whole entry is
/// padded up to a cache line on media
#[repr(C)]
pub struct UlogEntryBuf {
    pub offset: u64,
    pub checksum: u64,
    pub size: u64,
}

pub const ENTRY_VAL_SIZE: usize = 16;
pub const ENTRY_BUF_HEADER_SIZE: usize = 24;

impl Ulog {
    #[inline]
    pub fn data(&self) -> *mut u8 {
        unsafe { (self as *const Ulog as *mut u8).add(ULOG_HEADER_SIZE) }
    }

    #[inline]
    pub fn is_user_owned(&self) -> bool {
        self.flags & ULOG_USER_OWNED != 0
    }
}

/// Translates an offset to a ulog reference, aligning up to a cache line
///
/// # Safety
/// The offset must point into mapped pool memory.
pub unsafe fn by_offset<'a>(off: u64, ops: &PmemOps) -> Option<&'a mut Ulog> {
    if off == 0 {
        return None;
    }
    let aligned = align_up(off as usize, CACHELINE_SIZE);
    Some(&mut *(ops.off_to_ptr(aligned as u64) as *mut Ulog))
}

/// Offset of a ulog's `next` field, for atomic relinking through the heap
#[inline]
pub fn next_field_off(ulog_off: u64) -> u64 {
    align_up(ulog_off as usize, CACHELINE_SIZE) as u64 + 8
}

pub unsafe fn next_record<'a>(u: &Ulog, ops: &PmemOps) -> Option<&'a mut Ulog> {
    by_offset(u.next, ops)
}

/// Zeroes a header at `off` and stamps capacity, generation, and flags
pub unsafe fn construct(
    off: u64,
    capacity: usize,
    gen_num: u64,
    flush: bool,
    flags: u64,
    ops: &PmemOps,
) {
    let u = by_offset(off, ops).unwrap();
    u.checksum = 0;
    u.next = 0;
    u.capacity = capacity as u64;
    u.gen_num = gen_num;
    u.flags = flags;
    u.unused = [0; 3];

    // the first entry header must read as zero for replay to terminate
    let zeroed = align_up(8, CACHELINE_SIZE);
    std::ptr::write_bytes(u.data(), 0, zeroed.min(capacity));

    if flush {
        ops.xpersist(
            u as *const Ulog as *const u8,
            ULOG_HEADER_SIZE + zeroed.min(capacity),
            mf::RELAXED,
        );
    }
}

/// Payload capacity of the base record
pub unsafe fn base_nbytes(first_off: u64, ops: &PmemOps) -> usize {
    by_offset(first_off, ops).map_or(0, |u| u.capacity as usize)
}

/// Total payload capacity of the whole chain
pub unsafe fn capacity_total(first_off: u64, base_bytes: usize, ops: &PmemOps) -> usize {
    let mut capacity = base_bytes;
    let mut u = by_offset(first_off, ops).unwrap();
    while let Some(n) = next_record(u, ops) {
        capacity += n.capacity as usize;
        u = n;
    }
    capacity
}

/// Rebuilds the vector of continuation offsets from the on-media chain
pub unsafe fn rebuild_next_vec(first_off: u64, next: &mut Vec<u64>, ops: &PmemOps) {
    next.clear();
    let mut u = by_offset(first_off, ops).unwrap();
    while u.next != 0 {
        next.push(u.next);
        u = by_offset(u.next, ops).unwrap();
    }
}

// -- entries ----------------------------------------------------------------

#[inline]
pub unsafe fn entry_offset(e: *const u8) -> u64 {
    *(e as *const u64) & OFF_MASK
}

#[inline]
pub unsafe fn entry_type(e: *const u8) -> UlogOp {
    UlogOp::from_bits(*(e as *const u64))
}

/// On-media footprint of an entry
pub unsafe fn entry_size(e: *const u8) -> usize {
    if entry_type(e).is_buf() {
        let b = &*(e as *const UlogEntryBuf);
        align_up(ENTRY_BUF_HEADER_SIZE + b.size as usize, CACHELINE_SIZE)
    } else {
        ENTRY_VAL_SIZE
    }
}

/// Checksum of a buffer entry bound to a generation number
unsafe fn entry_buf_checksum(offset_word: u64, size: u64, gen_num: u64, data: *const u8) -> u64 {
    let mut f = Fletcher64::new();
    f.update(&offset_word.to_le_bytes());
    f.update(&size.to_le_bytes());
    f.update(&gen_num.to_le_bytes());
    f.update(std::slice::from_raw_parts(data, size as usize));
    f.finish()
}

/// Whether an entry of the log owned by `first` is intact
pub unsafe fn entry_valid(first: &Ulog, e: *const u8) -> bool {
    let word = *(e as *const u64);
    if word == 0 {
        return false;
    }
    if entry_type(e).is_buf() {
        let b = &*(e as *const UlogEntryBuf);
        let data = e.add(ENTRY_BUF_HEADER_SIZE);
        let expect = entry_buf_checksum(b.offset, b.size, first.gen_num, data);
        if expect != b.checksum {
            return false;
        }
    }
    true
}

/// Writes a value entry into `u`'s payload at `data_off`
///
/// The 8 bytes following the entry are zeroed in the same copy so that
/// leftovers of a clobbered log are never misread as a continuation.
pub unsafe fn entry_val_create(
    u: &Ulog,
    data_off: usize,
    dest_off: u64,
    value: u64,
    op: UlogOp,
    ops: &PmemOps,
) -> *mut UlogEntryVal {
    debug_assert!(data_off + ENTRY_VAL_SIZE + 8 <= u.capacity as usize);
    let e = u.data().add(data_off);

    #[repr(C)]
    struct ValAndTerminator {
        offset: u64,
        value: u64,
        zero: u64,
    }
    let image = ValAndTerminator {
        offset: (dest_off & OFF_MASK) | op.to_bits(),
        value,
        zero: 0,
    };
    ops.memcpy(
        e,
        &image as *const _ as *const u8,
        std::mem::size_of::<ValAndTerminator>(),
        mf::NOFLUSH | mf::RELAXED,
    );
    e as *mut UlogEntryVal
}

/// Writes a buffer entry (header, checksum, payload) into `u` at `data_off`
/// and persists it; the caller has already zeroed the following header.
pub unsafe fn entry_buf_create(
    u: &Ulog,
    data_off: usize,
    gen_num: u64,
    dest_off: u64,
    src: *const u8,
    size: usize,
    op: UlogOp,
    ops: &PmemOps,
) -> *mut UlogEntryBuf {
    debug_assert!(op.is_buf());
    let e = u.data().add(data_off);
    let entry_len = align_up(ENTRY_BUF_HEADER_SIZE + size, CACHELINE_SIZE);
    debug_assert!(data_off + entry_len <= u.capacity as usize);

    let data = e.add(ENTRY_BUF_HEADER_SIZE);
    ops.memcpy(data, src, size, mf::NOFLUSH | mf::RELAXED);

    let hdr = UlogEntryBuf {
        offset: (dest_off & OFF_MASK) | op.to_bits(),
        checksum: entry_buf_checksum((dest_off & OFF_MASK) | op.to_bits(), size as u64, gen_num, data),
        size: size as u64,
    };
    ops.memcpy(
        e,
        &hdr as *const _ as *const u8,
        ENTRY_BUF_HEADER_SIZE,
        mf::NOFLUSH | mf::RELAXED,
    );

    // one persist covers the terminator zeroed by the caller, the payload,
    // and the header; the entry is invalid until the checksum lands
    ops.persist(e, entry_len);
    e as *mut UlogEntryBuf
}

/// Applies a single entry against the capability's base
pub unsafe fn entry_apply(e: *const u8, persist: bool, ops: &PmemOps) {
    let op = entry_type(e);
    let off = entry_offset(e);
    match op {
        UlogOp::Set | UlogOp::And | UlogOp::Or => {
            let v = &*(e as *const UlogEntryVal);
            let dst = ops.off_to_ptr(off) as *mut u64;
            match op {
                UlogOp::Set => *dst = v.value,
                UlogOp::And => *dst &= v.value,
                UlogOp::Or => *dst |= v.value,
                _ => unreachable!(),
            }
            if persist {
                ops.persist(dst as *const u8, 8);
            } else {
                ops.flush(dst as *const u8, 8);
            }
        }
        UlogOp::BufCpy => {
            let b = &*(e as *const UlogEntryBuf);
            let dst = ops.off_to_ptr(off);
            ops.memcpy(dst, e.add(ENTRY_BUF_HEADER_SIZE), b.size as usize, 0);
            if persist {
                ops.drain();
            }
        }
        UlogOp::BufSet => {
            let b = &*(e as *const UlogEntryBuf);
            let c = *e.add(ENTRY_BUF_HEADER_SIZE);
            let dst = ops.off_to_ptr(off);
            ops.memset(dst, c, b.size as usize, 0);
            if persist {
                ops.drain();
            }
        }
    }
}

/// Zeroes the header of the entry at `e`
pub unsafe fn clobber_entry(e: *mut u8, ops: &PmemOps) {
    let zero = 0u64;
    ops.memcpy(e, &zero as *const u64 as *const u8, 8, mf::NOFLUSH | mf::RELAXED);
    ops.flush(e, 8);
}

/// Iterates intact entries of the whole chain, stopping at the logical end
/// of the log or when `cb` returns `false`
pub unsafe fn foreach_entry<F: FnMut(*const u8) -> bool>(
    first_off: u64,
    mut cb: F,
    ops: &PmemOps,
) {
    let first = match by_offset(first_off, ops) {
        Some(u) => &*u,
        None => return,
    };
    let mut rec = Some(&*(first as *const Ulog));
    while let Some(r) = rec {
        let capacity = r.capacity as usize;
        let mut off = 0usize;
        while off + 8 <= capacity {
            let e = r.data().add(off);
            if !entry_valid(first, e) {
                return;
            }
            let esize = entry_size(e);
            if esize > capacity - off {
                return;
            }
            if !cb(e) {
                return;
            }
            off += esize;
        }
        rec = next_record(r, ops).map(|u| &*(u as *mut Ulog as *const Ulog));
    }
}

// -- whole-log operations ---------------------------------------------------

/// Whether the base record checksum matches its content at rest
pub unsafe fn checksum_valid(first_off: u64, ops: &PmemOps) -> bool {
    let u = match by_offset(first_off, ops) {
        Some(u) => u,
        None => return false,
    };
    let total = ULOG_HEADER_SIZE + u.capacity as usize;
    let bytes = std::slice::from_raw_parts(u as *const Ulog as *const u8, total);
    u.checksum != 0 && checksum_skip(bytes, 0) == u.checksum
}

/// A log is empty when its first entry offset reads zero
pub unsafe fn is_empty(first_off: u64, ops: &PmemOps) -> bool {
    match by_offset(first_off, ops) {
        Some(u) => u.capacity == 0 || *(u.data() as *const u64) == 0,
        None => true,
    }
}

/// Whether a redo log needs (and is fit for) replay on boot
pub unsafe fn recovery_needed(first_off: u64, verify_checksum: bool, ops: &PmemOps) -> bool {
    if is_empty(first_off, ops) {
        return false;
    }
    !verify_checksum || checksum_valid(first_off, ops)
}

/// Grows the chain until its capacity reaches `new_capacity`
///
/// Each growth step asks `extend` to atomically allocate a fresh record and
/// link it through the last record's `next` field.
pub unsafe fn reserve<E: Fn(u64, u64) -> Result<()>>(
    first_off: u64,
    base_bytes: usize,
    gen_num: u64,
    auto_reserve: bool,
    new_capacity: &mut usize,
    extend: &E,
    next: &mut Vec<u64>,
    ops: &PmemOps,
) -> Result<()> {
    let mut capacity = base_bytes;
    for off in next.iter() {
        capacity += by_offset(*off, ops).unwrap().capacity as usize;
    }

    while capacity < *new_capacity {
        if !auto_reserve {
            return Err(Error::OutOfMemory);
        }
        let last_off = next.last().copied().unwrap_or(first_off);
        extend(next_field_off(last_off), gen_num)?;

        let last = by_offset(last_off, ops).unwrap();
        debug_assert_ne!(last.next, 0);
        let added = by_offset(last.next, ops).unwrap();
        capacity += added.capacity as usize;
        next.push(last.next);
    }
    *new_capacity = capacity;
    Ok(())
}

/// Copies a DRAM shadow log into the persistent chain
///
/// Continuation records receive exactly `min(remaining, capacity)` bytes
/// each; the base record is committed last, in a single copy that carries
/// the freshly computed checksum. The store becomes effective, atomically,
/// when that checksum lands.
pub unsafe fn store(
    first_off: u64,
    shadow: *mut Ulog,
    nbytes: usize,
    base_bytes: usize,
    next: &[u64],
    ops: &PmemOps,
) {
    let first = by_offset(first_off, ops).unwrap();
    let src = &mut *shadow;
    let src_data = src.data();

    let base_n = nbytes.min(base_bytes);
    let mut remaining = nbytes - base_n;
    let mut consumed = base_n;
    let mut i = 0;
    while remaining > 0 {
        debug_assert!(i < next.len(), "shadow log overflows reserved chain");
        let rec = by_offset(next[i], ops).unwrap();
        i += 1;
        let copy = remaining.min(rec.capacity as usize);
        ops.memcpy(rec.data(), src_data.add(consumed), copy, mf::WC | mf::NODRAIN);
        consumed += copy;
        remaining -= copy;
    }

    // commit point: header + base payload, checksum included
    src.next = next.first().copied().unwrap_or(0);
    src.capacity = base_bytes as u64;
    src.gen_num = first.gen_num;
    src.flags = first.flags;
    src.unused = [0; 3];
    src.checksum = 0;
    let image =
        std::slice::from_raw_parts(shadow as *const u8, ULOG_HEADER_SIZE + base_bytes);
    src.checksum = checksum_skip(image, 0);

    ops.memcpy(
        first as *mut Ulog as *mut u8,
        shadow as *const u8,
        ULOG_HEADER_SIZE + base_bytes,
        mf::WC | mf::NODRAIN,
    );
    ops.drain();
}

/// Applies every entry of the chain
pub unsafe fn process<C: Fn(u64) -> bool>(first_off: u64, check: &C, ops: &PmemOps) {
    foreach_entry(
        first_off,
        |e| {
            debug_assert!(check(entry_offset(e)), "entry offset escapes the pool");
            entry_apply(e, false, ops);
            true
        },
        ops,
    );
    ops.drain();
}

/// Empties the log by zeroing the base header; `next` keeps the chain alive
pub unsafe fn clobber(first_off: u64, next: Option<&[u64]>, ops: &PmemOps) {
    let first = by_offset(first_off, ops).unwrap();
    let mut empty: Ulog = std::mem::zeroed();
    empty.capacity = first.capacity;
    empty.gen_num = first.gen_num;
    empty.flags = first.flags;
    empty.next = match next {
        Some(v) => v.first().copied().unwrap_or(0),
        None => first.next,
    };
    ops.memcpy(
        first as *mut Ulog as *mut u8,
        &empty as *const Ulog as *const u8,
        ULOG_HEADER_SIZE,
        mf::WC,
    );
    ops.drain();
}

pub unsafe fn inc_gen_num(u: &mut Ulog, ops: &PmemOps) {
    u.gen_num += 1;
    ops.persist(&u.gen_num as *const u64 as *const u8, 8);
}

/// Unlinks user-owned records, handing each to `userbuf_remove`
unsafe fn unlink_user_buffers<R: Fn(u64)>(
    first_off: u64,
    userbuf_remove: &R,
    ops: &PmemOps,
) -> bool {
    let mut changed = false;
    let mut last_off = first_off;
    loop {
        let last = by_offset(last_off, ops).unwrap();
        if last.next == 0 {
            break;
        }
        let cur_off = last.next;
        let cur = by_offset(cur_off, ops).unwrap();
        if cur.is_user_owned() {
            let nxt = cur.next;
            userbuf_remove(align_up(cur_off as usize, CACHELINE_SIZE) as u64);
            last.next = nxt;
            ops.persist(&last.next as *const u64 as *const u8, 8);
            changed = true;
        } else {
            last_off = cur_off;
        }
    }
    changed
}

/// Next-field offsets of every continuation, in chain order
unsafe fn continuation_fields(first_off: u64, ops: &PmemOps) -> Vec<u64> {
    let mut fields = Vec::new();
    let mut off = first_off;
    loop {
        let u = by_offset(off, ops).unwrap();
        if u.next == 0 {
            break;
        }
        fields.push(next_field_off(off));
        off = u.next;
    }
    fields
}

/// Frees every continuation of a redo log
///
/// With `ULOG_ANY_USER_BUFFER`, user-owned records are first unlinked and
/// returned through `userbuf_remove` instead of being freed to the heap.
/// Freeing runs tail-first so a crash leaves a consistent prefix. Returns
/// whether the chain changed shape.
pub unsafe fn free_next<F: Fn(u64), R: Fn(u64)>(
    first_off: u64,
    free: &F,
    userbuf_remove: &R,
    flags: u64,
    ops: &PmemOps,
) -> bool {
    let mut changed = false;
    if flags & ULOG_ANY_USER_BUFFER != 0 {
        changed |= unlink_user_buffers(first_off, userbuf_remove, ops);
    }
    let fields = continuation_fields(first_off, ops);
    for f in fields.iter().rev() {
        free(*f);
        changed = true;
    }
    changed
}

/// Shrinks an undo chain back toward its base record
///
/// `ULOG_INC_FIRST_GEN_NUM` invalidates every entry of the log by bumping
/// the base generation. Without `ULOG_FREE_AFTER_FIRST` the first
/// allocator-owned continuation is kept for reuse (its generation is
/// brought along); everything past it is freed tail-first.
pub unsafe fn clobber_data<F: Fn(u64), R: Fn(u64)>(
    first_off: u64,
    free: &F,
    userbuf_remove: &R,
    flags: u64,
    ops: &PmemOps,
) -> bool {
    let first = by_offset(first_off, ops).unwrap();
    if flags & ULOG_INC_FIRST_GEN_NUM != 0 {
        inc_gen_num(first, ops);
    }

    let mut changed = false;
    if flags & ULOG_ANY_USER_BUFFER != 0 {
        changed |= unlink_user_buffers(first_off, userbuf_remove, ops);
    }

    let fields = continuation_fields(first_off, ops);
    let keep = if flags & ULOG_FREE_AFTER_FIRST == 0 && !fields.is_empty() {
        let first_gen = by_offset(first_off, ops).unwrap().gen_num;
        let kept_off = by_offset(first_off, ops).unwrap().next;
        let kept = by_offset(kept_off, ops).unwrap();
        kept.gen_num = first_gen;
        ops.persist(&kept.gen_num as *const u64 as *const u8, 8);
        1
    } else {
        0
    };
    for f in fields[keep..].iter().rev() {
        free(*f);
        changed = true;
    }
    changed
}

/// Replays a redo log on boot if it appears valid, then empties it
pub unsafe fn recover<C: Fn(u64) -> bool>(first_off: u64, check: &C, ops: &PmemOps) {
    if recovery_needed(first_off, true, ops) {
        process(first_off, check, ops);
        clobber(first_off, None, ops);
    }
}

/// Dry run of recovery: walks the chain validating structure and offsets
pub unsafe fn check<C: Fn(u64) -> bool>(first_off: u64, check: &C, ops: &PmemOps) -> Result<()> {
    let mut bad = false;
    foreach_entry(
        first_off,
        |e| {
            let word = *(e as *const u64);
            let known = matches!((word & OP_MASK) >> OP_SHIFT, 0b000 | 0b001 | 0b010 | 0b101 | 0b110);
            if !known || !check(entry_offset(e)) {
                bad = true;
                return false;
            }
            true
        },
        ops,
    );
    if bad {
        Err(Error::Corrupt("ulog entry malformed"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::testbuf::TestRegion;

    fn fresh(region: &TestRegion, off: u64, capacity: usize) -> u64 {
        unsafe { construct(off, capacity, 0, true, 0, region.ops()) };
        off
    }

    #[test]
    fn construct_makes_an_empty_log() {
        let r = TestRegion::new(16 * 1024);
        let off = fresh(&r, 4096, 512);
        unsafe {
            assert!(is_empty(off, r.ops()));
            assert!(!recovery_needed(off, true, r.ops()));
            assert_eq!(capacity_total(off, 512, r.ops()), 512);
        }
    }

    #[test]
    fn value_entries_apply_in_order() {
        let r = TestRegion::new(16 * 1024);
        let off = fresh(&r, 4096, 512);
        let dest = 1024u64;
        unsafe {
            let u = by_offset(off, r.ops()).unwrap();
            let mut data_off = 0;
            for (op, v) in &[
                (UlogOp::Set, 0xffu64),
                (UlogOp::And, 0x0f),
                (UlogOp::Or, 0x100),
            ] {
                entry_val_create(u, data_off, dest, *v, *op, r.ops());
                data_off += ENTRY_VAL_SIZE;
            }
            process(off, &|_| true, r.ops());
            assert_eq!(*(r.ops().off_to_ptr(dest) as *const u64), 0x10f);
        }
    }

    #[test]
    fn buf_entry_roundtrip_and_validation() {
        let r = TestRegion::new(16 * 1024);
        let off = fresh(&r, 4096, 512);
        let payload: Vec<u8> = (0..100u8).collect();
        unsafe {
            let u = by_offset(off, r.ops()).unwrap();
            let e = entry_buf_create(
                u,
                0,
                u.gen_num,
                2048,
                payload.as_ptr(),
                payload.len(),
                UlogOp::BufCpy,
                r.ops(),
            );
            assert!(entry_valid(u, e as *const u8));
            assert_eq!(entry_size(e as *const u8), 128);

            process(off, &|_| true, r.ops());
            let dst = std::slice::from_raw_parts(r.ops().off_to_ptr(2048), 100);
            assert_eq!(dst, &payload[..]);

            // a generation bump orphans the entry
            inc_gen_num(by_offset(off, r.ops()).unwrap(), r.ops());
            assert!(!entry_valid(by_offset(off, r.ops()).unwrap(), e as *const u8));
            assert!(is_empty(off, r.ops()) == false);
            let mut seen = 0;
            foreach_entry(off, |_| { seen += 1; true }, r.ops());
            assert_eq!(seen, 0);
        }
    }

    /// An aligned DRAM shadow carved from scratch memory
    fn shadow_log(arena: &TestRegion) -> *mut Ulog {
        let sh = arena.base() as *mut Ulog;
        unsafe { (*sh).capacity = 1024 };
        sh
    }

    #[test]
    fn store_spills_into_continuations_exactly() {
        let r = TestRegion::new(64 * 1024);
        let base = fresh(&r, 4096, 128);
        let cont = fresh(&r, 8192, 256);
        let arena = TestRegion::new(ULOG_HEADER_SIZE + 1024);
        unsafe {
            // link the continuation by hand
            by_offset(base, r.ops()).unwrap().next = cont;

            // shadow with 20 value entries (320 bytes > 128 base)
            let sh = shadow_log(&arena);
            let t_ops = PmemOps::absolute();
            let mut data_off = 0;
            for i in 0..20u64 {
                entry_val_create(&*sh, data_off, 16 * 1024 + i * 8, i + 1, UlogOp::Set, &t_ops);
                data_off += ENTRY_VAL_SIZE;
            }

            store(base, sh, data_off, 128, &[cont], r.ops());
            assert!(checksum_valid(base, r.ops()));
            assert!(recovery_needed(base, true, r.ops()));

            process(base, &|_| true, r.ops());
            for i in 0..20u64 {
                let p = r.ops().off_to_ptr(16 * 1024 + i * 8) as *const u64;
                assert_eq!(*p, i + 1, "entry {} lost in the split", i);
            }

            clobber(base, None, r.ops());
            assert!(is_empty(base, r.ops()));
            assert!(!recovery_needed(base, true, r.ops()));
        }
    }

    #[test]
    fn torn_store_is_discarded() {
        let r = TestRegion::new(32 * 1024);
        let base = fresh(&r, 4096, 128);
        let arena = TestRegion::new(ULOG_HEADER_SIZE + 1024);
        unsafe {
            let sh = shadow_log(&arena);
            let t_ops = PmemOps::absolute();
            entry_val_create(&*sh, 0, 1024, 7, UlogOp::Set, &t_ops);
            store(base, sh, ENTRY_VAL_SIZE, 128, &[], r.ops());

            // simulate a torn write of the payload after the fact
            *by_offset(base, r.ops()).unwrap().data() ^= 0xff;
            assert!(!checksum_valid(base, r.ops()));
            assert!(!recovery_needed(base, true, r.ops()));
        }
    }

    #[test]
    fn recover_applies_then_clears() {
        let r = TestRegion::new(32 * 1024);
        let base = fresh(&r, 4096, 128);
        let arena = TestRegion::new(ULOG_HEADER_SIZE + 1024);
        unsafe {
            let sh = shadow_log(&arena);
            let t_ops = PmemOps::absolute();
            entry_val_create(&*sh, 0, 1024, 99, UlogOp::Set, &t_ops);
            store(base, sh, ENTRY_VAL_SIZE, 128, &[], r.ops());

            recover(base, &|_| true, r.ops());
            assert_eq!(*(r.ops().off_to_ptr(1024) as *const u64), 99);
            assert!(is_empty(base, r.ops()));

            // replaying a second time is a no-op
            *(r.ops().off_to_ptr(1024) as *mut u64) = 0;
            recover(base, &|_| true, r.ops());
            assert_eq!(*(r.ops().off_to_ptr(1024) as *const u64), 0);
        }
    }
}
