//! The operation context: an in-flight atomic set of memory modifications
//!
//! The context collects every modification that must happen atomically and
//! abstracts away where it lands: value entries accumulate in a DRAM shadow
//! log (and are bulk-copied into the persistent chain at processing time),
//! buffer entries stream directly into the chain, and entries destined for
//! volatile memory go to a transient log that never touches media.
//!
//! Nothing is visible until the context is processed.

use crate::error::{fail, Error, Result};
use crate::pmem::PmemOps;
use crate::ulog::{self, Ulog, UlogOp, ENTRY_BUF_HEADER_SIZE, ENTRY_VAL_SIZE, ULOG_HEADER_SIZE};
use crate::util::{align_down, align_up, Ring};
use crate::CACHELINE_SIZE;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

/// Shadow log growth quantum
pub const ULOG_BASE_SIZE: usize = 1024;

/// How many recent value entries are scanned for merge candidates
pub const OP_MERGE_SEARCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Undo,
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    InProgress,
    Cleanup,
}

/// A client-provided in-pool region offered as ulog storage
#[derive(Debug, Clone, Copy)]
pub struct UserBufferDef {
    pub addr_off: u64,
    pub size: usize,
}

/// Services the context needs from its owning pool
pub trait OperationBackend: Send + Sync {
    /// Atomically allocates a record sized for `log_type` extensions and
    /// links it through the `next` field at `next_field_off`
    fn ulog_extend(&self, next_field_off: u64, gen_num: u64, log_type: LogType) -> Result<()>;

    /// Atomically frees the record linked at `next_field_off`, zeroing the
    /// field
    fn ulog_free(&self, next_field_off: u64);

    /// Registers a user buffer range; rejects overlaps when verification is
    /// enabled
    fn userbuf_insert(&self, def: &UserBufferDef) -> Result<()>;

    /// Forgets a user buffer by its record offset
    fn userbuf_remove(&self, ulog_off: u64);

    /// Whether `off` may appear as an entry destination
    fn off_is_valid(&self, off: u64) -> bool;
}

/// DRAM-resident log image: a ulog header plus payload, cache-line aligned
/// so the same chain-walking code can read it
struct OperationLog {
    capacity: usize,
    offset: usize,
    ulog: *mut Ulog,
}

impl OperationLog {
    fn new(capacity: usize) -> Self {
        let ulog = unsafe {
            let layout =
                Layout::from_size_align(ULOG_HEADER_SIZE + capacity, CACHELINE_SIZE).unwrap();
            let p = alloc_zeroed(layout) as *mut Ulog;
            assert!(!p.is_null());
            (*p).capacity = capacity as u64;
            p
        };
        Self {
            capacity,
            offset: 0,
            ulog,
        }
    }

    fn grow(&mut self, by: usize) {
        unsafe {
            let ncap = self.capacity + by;
            let layout =
                Layout::from_size_align(ULOG_HEADER_SIZE + ncap, CACHELINE_SIZE).unwrap();
            let p = alloc_zeroed(layout) as *mut Ulog;
            assert!(!p.is_null());
            std::ptr::copy_nonoverlapping(
                self.ulog as *const u8,
                p as *mut u8,
                ULOG_HEADER_SIZE + self.capacity,
            );
            let old = Layout::from_size_align(
                ULOG_HEADER_SIZE + self.capacity,
                CACHELINE_SIZE,
            )
            .unwrap();
            dealloc(self.ulog as *mut u8, old);
            self.ulog = p;
            self.capacity = ncap;
            (*p).capacity = ncap as u64;
        }
    }

    #[inline]
    fn ulog(&self) -> &Ulog {
        unsafe { &*self.ulog }
    }

    fn reset(&mut self) {
        self.offset = 0;
        unsafe {
            // only the first entry header needs to read as zero
            std::ptr::write_bytes((*self.ulog).data(), 0, 8.min(self.capacity));
        }
    }
}

impl Drop for OperationLog {
    fn drop(&mut self) {
        unsafe {
            let layout =
                Layout::from_size_align(ULOG_HEADER_SIZE + self.capacity, CACHELINE_SIZE)
                    .unwrap();
            dealloc(self.ulog as *mut u8, layout);
        }
    }
}

/// Context of one ongoing atomic operation
pub struct OperationContext {
    log_type: LogType,
    backend: Arc<dyn OperationBackend>,
    extendable: bool,

    p_ops: PmemOps,
    t_ops: PmemOps,

    ulog_off: u64,
    ulog_base_nbytes: usize,
    ulog_capacity: usize,

    ulog_curr: u64,
    ulog_curr_offset: usize,
    ulog_curr_capacity: usize,
    ulog_curr_gen_num: u64,
    total_logged: usize,

    ulog_auto_reserve: bool,
    ulog_any_user_buffer: bool,

    next: Vec<u64>,
    state: OperationState,

    pshadow_ops: OperationLog,
    transient_ops: OperationLog,

    // recent persistent value entries, as offsets into the shadow payload
    merge_entries: Ring<u32, 65>,
}

unsafe impl Send for OperationContext {}
unsafe impl Sync for OperationContext {}

impl OperationContext {
    pub fn new(
        ulog_off: u64,
        ulog_base_nbytes: usize,
        backend: Arc<dyn OperationBackend>,
        extendable: bool,
        p_ops: PmemOps,
        log_type: LogType,
    ) -> Self {
        let mut next = Vec::new();
        let ulog_capacity = unsafe {
            ulog::rebuild_next_vec(ulog_off, &mut next, &p_ops);
            ulog::capacity_total(ulog_off, ulog_base_nbytes, &p_ops)
        };
        Self {
            log_type,
            backend,
            extendable,
            p_ops,
            t_ops: PmemOps::absolute(),
            ulog_off,
            ulog_base_nbytes,
            ulog_capacity,
            ulog_curr: 0,
            ulog_curr_offset: 0,
            ulog_curr_capacity: 0,
            ulog_curr_gen_num: 0,
            total_logged: 0,
            ulog_auto_reserve: true,
            ulog_any_user_buffer: false,
            next,
            state: OperationState::Idle,
            pshadow_ops: OperationLog::new(ULOG_BASE_SIZE),
            transient_ops: OperationLog::new(ULOG_BASE_SIZE),
            merge_entries: Ring::new(),
        }
    }

    #[inline]
    pub fn log_type(&self) -> LogType {
        self.log_type
    }

    #[inline]
    pub fn state(&self) -> OperationState {
        self.state
    }

    #[inline]
    pub fn ulog_off(&self) -> u64 {
        self.ulog_off
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ulog_capacity
    }

    #[inline]
    pub fn set_auto_reserve(&mut self, on: bool) {
        self.ulog_auto_reserve = on;
    }

    #[inline]
    pub fn any_user_buffer(&self) -> bool {
        self.ulog_any_user_buffer
    }

    #[inline]
    pub fn set_any_user_buffer(&mut self, on: bool) {
        self.ulog_any_user_buffer = on;
    }

    /// Resets runtime state; the persistent log itself is untouched
    pub fn init(&mut self) {
        self.pshadow_ops.reset();
        self.transient_ops.reset();
        self.merge_entries.clear();
        self.ulog_curr = 0;
        self.ulog_curr_offset = 0;
        self.ulog_curr_capacity = 0;
        self.ulog_curr_gen_num = 0;
        self.total_logged = 0;
        self.ulog_auto_reserve = true;
        self.ulog_any_user_buffer = false;
    }

    /// Starts a new operation; the context must be idle
    pub fn start(&mut self) {
        self.init();
        assert_eq!(self.state, OperationState::Idle);
        self.state = OperationState::InProgress;
    }

    /// Starts processing of a log found on media, e.g. during recovery
    pub fn resume(&mut self) {
        self.start();
        self.total_logged = unsafe { ulog::base_nbytes(self.ulog_off, &self.p_ops) };
    }

    /// Discards the collected entries without touching media
    pub fn cancel(&mut self) {
        assert_eq!(self.state, OperationState::InProgress);
        self.state = OperationState::Idle;
    }

    // -- value entries ------------------------------------------------------

    fn try_merge_entry(&mut self, dest_off: u64, value: u64, op: UlogOp) -> bool {
        let data = self.pshadow_ops.ulog().data();
        let mut merged = false;
        self.merge_entries.foreach_reverse_while(|eoff| {
            let e = unsafe { data.add(eoff as usize) };
            if unsafe { ulog::entry_offset(e) } == dest_off {
                if unsafe { ulog::entry_type(e) } == op {
                    let v = e as *mut ulog::UlogEntryVal;
                    unsafe {
                        match op {
                            UlogOp::And => (*v).value &= value,
                            UlogOp::Or => (*v).value |= value,
                            UlogOp::Set => (*v).value = value,
                            _ => unreachable!(),
                        }
                    }
                    merged = true;
                }
                // a type clash terminates the scan: ordering matters now
                return false;
            }
            true
        });
        merged
    }

    fn merge_entry_add(&mut self, entry_off: usize) {
        if self.merge_entries.len() == OP_MERGE_SEARCH {
            let _ = self.merge_entries.pop();
        }
        self.merge_entries.push(entry_off as u32);
    }

    /// Adds a value entry to the selected log
    ///
    /// `dest_off` is a pool offset for persistent entries and an absolute
    /// address for transient ones.
    pub fn add_typed_entry(
        &mut self,
        dest_off: u64,
        value: u64,
        op: UlogOp,
        persistent: bool,
    ) -> Result<()> {
        debug_assert!(matches!(op, UlogOp::Set | UlogOp::And | UlogOp::Or));

        let oplog = if persistent {
            &mut self.pshadow_ops
        } else {
            &mut self.transient_ops
        };

        // keep one spare cache line so entry creation has room for zeroing
        if oplog.offset + CACHELINE_SIZE >= oplog.capacity {
            oplog.grow(ULOG_BASE_SIZE);
            if persistent {
                // the old payload moved; cached entry locations are dead
                self.merge_entries.clear();
            }
        }

        if persistent && self.try_merge_entry(dest_off, value, op) {
            return Ok(());
        }

        let oplog = if persistent {
            &mut self.pshadow_ops
        } else {
            &mut self.transient_ops
        };
        let entry_off = oplog.offset;
        unsafe {
            ulog::entry_val_create(&*oplog.ulog, entry_off, dest_off, value, op, &self.t_ops);
        }
        oplog.offset += ENTRY_VAL_SIZE;

        if persistent {
            self.merge_entry_add(entry_off);
        }

        log!(
            Yellow,
            "ENTRY",
            "{:?} at {:#x} = {:#x} ({})",
            op,
            dest_off,
            value,
            if persistent { "persistent" } else { "transient" }
        );
        Ok(())
    }

    /// Adds a value entry, classifying the destination automatically:
    /// pool-interior pointers are persistent, anything else is transient
    pub fn add_entry(&mut self, ptr: *mut u64, value: u64, op: UlogOp) -> Result<()> {
        let p = ptr as *const u8;
        if self.p_ops.contains_ptr(p) && self.backend.off_is_valid(self.p_ops.ptr_to_off(p)) {
            self.add_typed_entry(self.p_ops.ptr_to_off(p), value, op, true)
        } else {
            self.add_typed_entry(ptr as u64, value, op, false)
        }
    }

    /// Adds a persistent value entry by pool offset
    pub fn add_entry_off(&mut self, dest_off: u64, value: u64, op: UlogOp) -> Result<()> {
        debug_assert!(self.backend.off_is_valid(dest_off));
        self.add_typed_entry(dest_off, value, op, true)
    }

    // -- buffer entries -----------------------------------------------------

    /// Streams a buffer entry directly into the persistent chain, splitting
    /// it across records as capacity allows
    pub fn add_buffer(
        &mut self,
        mut dest_off: u64,
        mut src: *const u8,
        mut size: usize,
        op: UlogOp,
    ) -> Result<()> {
        debug_assert!(op.is_buf());
        loop {
            let real_size = size + ENTRY_BUF_HEADER_SIZE;

            if self.ulog_curr_capacity == 0 {
                self.ulog_curr_gen_num =
                    unsafe { ulog::by_offset(self.ulog_off, &self.p_ops).unwrap().gen_num };
                self.reserve(self.total_logged + real_size)?;

                self.ulog_curr = if self.ulog_curr == 0 {
                    self.ulog_off
                } else {
                    unsafe { ulog::by_offset(self.ulog_curr, &self.p_ops).unwrap().next }
                };
                assert_ne!(self.ulog_curr, 0, "reserved chain ended prematurely");
                self.ulog_curr_offset = 0;
                self.ulog_curr_capacity =
                    unsafe { ulog::by_offset(self.ulog_curr, &self.p_ops).unwrap().capacity }
                        as usize;
            }

            let curr_size = real_size.min(self.ulog_curr_capacity);
            let data_size = curr_size - ENTRY_BUF_HEADER_SIZE;
            let entry_size = align_up(curr_size, CACHELINE_SIZE);
            debug_assert!(entry_size <= self.ulog_curr_capacity);

            unsafe {
                let curr = ulog::by_offset(self.ulog_curr, &self.p_ops).unwrap();

                // the header of whatever would follow this entry must read
                // as zero, so replay terminates at the logical end of log
                let next_entry: Option<*mut u8> = if entry_size == self.ulog_curr_capacity {
                    ulog::next_record(curr, &self.p_ops).map(|u| u.data())
                } else {
                    Some(curr.data().add(self.ulog_curr_offset + entry_size))
                };
                if let Some(ne) = next_entry {
                    ulog::clobber_entry(ne, &self.p_ops);
                }

                ulog::entry_buf_create(
                    curr,
                    self.ulog_curr_offset,
                    self.ulog_curr_gen_num,
                    dest_off,
                    src,
                    data_size,
                    op,
                    &self.p_ops,
                );
            }

            self.total_logged += entry_size;
            self.ulog_curr_offset += entry_size;
            self.ulog_curr_capacity -= entry_size;

            if size == data_size {
                return Ok(());
            }
            dest_off += data_size as u64;
            src = unsafe { src.add(data_size) };
            size -= data_size;
        }
    }

    // -- user buffers -------------------------------------------------------

    /// Verifies that a client buffer can serve as log storage and normalizes
    /// it: the start is aligned up, the size trimmed down, and the range
    /// registered for overlap detection
    pub fn user_buffer_verify_align(&self, def: &mut UserBufferDef) -> Result<()> {
        let aligned = align_up(def.addr_off as usize, CACHELINE_SIZE);
        let size_diff = aligned - def.addr_off as usize;
        let avail = def.size as isize - size_diff as isize - ULOG_HEADER_SIZE as isize;
        if avail < CACHELINE_SIZE as isize {
            return fail(Error::Invalid("user buffer capacity insufficient"));
        }
        let capacity = align_down(avail as usize, CACHELINE_SIZE);

        def.addr_off = aligned as u64;
        def.size = capacity + ULOG_HEADER_SIZE;

        self.backend.userbuf_insert(def)
    }

    /// Links a verified user buffer at the end of the chain
    pub fn add_user_buffer(&mut self, def: &UserBufferDef) {
        let capacity = def.size - ULOG_HEADER_SIZE;
        unsafe {
            let gen = ulog::by_offset(self.ulog_off, &self.p_ops).unwrap().gen_num;
            ulog::construct(
                def.addr_off,
                capacity,
                gen,
                true,
                ulog::ULOG_USER_OWNED,
                &self.p_ops,
            );

            let last_off = self.next.last().copied().unwrap_or(self.ulog_off);
            let last = ulog::by_offset(last_off, &self.p_ops).unwrap();
            last.next = def.addr_off;
            self.p_ops
                .persist(&last.next as *const u64 as *const u8, 8);
        }
        self.next.push(def.addr_off);
        self.ulog_capacity += capacity;
        self.ulog_any_user_buffer = true;

        log!(Cyan, "USERBUF", "attached at {:#x} (+{} bytes)", def.addr_off, capacity);
    }

    /// Drops every continuation, e.g. before attaching the first user buffer
    pub fn free_logs(&mut self, flags: u64) {
        let backend = Arc::clone(&self.backend);
        let p_ops = self.p_ops;
        let freed = unsafe {
            ulog::free_next(
                self.ulog_off,
                &|nf| backend.ulog_free(nf),
                &|off| backend.userbuf_remove(off),
                flags,
                &p_ops,
            )
        };
        if freed {
            self.rebuild();
        }
        debug_assert!(self.next.is_empty());
    }

    fn rebuild(&mut self) {
        unsafe {
            self.ulog_capacity =
                ulog::capacity_total(self.ulog_off, self.ulog_base_nbytes, &self.p_ops);
            ulog::rebuild_next_vec(self.ulog_off, &mut self.next, &self.p_ops);
        }
    }

    // -- capacity -----------------------------------------------------------

    /// Ensures the persistent chain can hold `new_capacity` bytes, growing
    /// it through the backend when allowed
    pub fn reserve(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.ulog_capacity {
            return Ok(());
        }
        if !self.extendable {
            return fail(Error::OutOfMemory);
        }
        let mut cap = new_capacity;
        let backend = Arc::clone(&self.backend);
        let lt = self.log_type;
        let p_ops = self.p_ops;
        unsafe {
            ulog::reserve(
                self.ulog_off,
                self.ulog_base_nbytes,
                self.ulog_curr_gen_num,
                self.ulog_auto_reserve,
                &mut cap,
                &|nf, gen| backend.ulog_extend(nf, gen, lt),
                &mut self.next,
                &p_ops,
            )?;
        }
        self.ulog_capacity = cap;
        Ok(())
    }

    // -- processing ---------------------------------------------------------

    /// Makes the collected modifications effective
    ///
    /// A redo shadow holding exactly one value entry skips the log: the
    /// single aligned store is already atomic.
    pub fn process(&mut self) {
        let backend = Arc::clone(&self.backend);
        let p_ops = self.p_ops;
        let check = |off: u64| backend.off_is_valid(off);

        let mut redo_process =
            self.log_type == LogType::Redo && self.pshadow_ops.offset != 0;

        if redo_process && self.pshadow_ops.offset == ENTRY_VAL_SIZE {
            let e = self.pshadow_ops.ulog().data() as *const u8;
            let t = unsafe { ulog::entry_type(e) };
            if matches!(t, UlogOp::Set | UlogOp::And | UlogOp::Or) {
                unsafe { ulog::entry_apply(e, true, &p_ops) };
                redo_process = false;
            }
        }

        if redo_process {
            unsafe {
                ulog::store(
                    self.ulog_off,
                    self.pshadow_ops.ulog,
                    self.pshadow_ops.offset,
                    self.ulog_base_nbytes,
                    &self.next,
                    &p_ops,
                );
                ulog::process(self.ulog_off, &check, &p_ops);
                ulog::clobber(self.ulog_off, Some(&self.next), &p_ops);
            }
            self.state = OperationState::Cleanup;
        } else if self.log_type == LogType::Undo && self.total_logged != 0 {
            unsafe { ulog::process(self.ulog_off, &check, &p_ops) };
            self.state = OperationState::Cleanup;
        }

        // transient entries apply against ordinary memory, in order, last
        if self.transient_ops.offset != 0 {
            let t_ops = self.t_ops;
            unsafe {
                ulog::foreach_entry(
                    self.transient_ops.ulog as u64,
                    |e| {
                        ulog::entry_apply(e, false, &t_ops);
                        true
                    },
                    &t_ops,
                );
            }
        }
    }

    /// Finalizes the operation and returns the context to idle
    pub fn finish(&mut self, mut flags: u64) {
        assert_ne!(self.state, OperationState::Idle);

        if self.log_type == LogType::Undo && self.total_logged != 0 {
            self.state = OperationState::Cleanup;
        }
        if self.ulog_any_user_buffer {
            flags |= ulog::ULOG_ANY_USER_BUFFER;
            self.state = OperationState::Cleanup;
        }

        if self.state == OperationState::Cleanup {
            let backend = Arc::clone(&self.backend);
            let p_ops = self.p_ops;
            let free = |nf: u64| backend.ulog_free(nf);
            let rm = |off: u64| backend.userbuf_remove(off);

            let changed = unsafe {
                match self.log_type {
                    LogType::Undo => {
                        ulog::clobber_data(self.ulog_off, &free, &rm, flags, &p_ops)
                    }
                    LogType::Redo => ulog::free_next(self.ulog_off, &free, &rm, flags, &p_ops),
                }
            };
            if changed {
                self.rebuild();
            }
        }

        self.state = OperationState::Idle;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::util::testbuf::TestRegion;
    use std::sync::Mutex;

    /// Backend over a scratch region with a bump allocator for extensions
    pub(crate) struct MockBackend {
        pub region_len: usize,
        pub ops: PmemOps,
        pub bump: Mutex<u64>,
        pub userbufs: Mutex<std::collections::BTreeMap<u64, usize>>,
        pub verify: bool,
    }

    impl MockBackend {
        pub fn new(r: &TestRegion, bump_start: u64) -> Arc<Self> {
            Arc::new(Self {
                region_len: r.ops().len(),
                ops: *r.ops(),
                bump: Mutex::new(bump_start),
                userbufs: Mutex::new(Default::default()),
                verify: true,
            })
        }
    }

    impl OperationBackend for MockBackend {
        fn ulog_extend(&self, next_field_off: u64, gen_num: u64, _lt: LogType) -> Result<()> {
            let mut bump = self.bump.lock().unwrap();
            let cap = 1024;
            let total = ulog::aligned_extension_size(cap);
            if *bump as usize + total > self.region_len {
                return Err(Error::OutOfMemory);
            }
            let off = *bump;
            *bump += total as u64;
            unsafe {
                ulog::construct(off, cap, gen_num, true, 0, &self.ops);
                let field = self.ops.off_to_ptr(next_field_off) as *mut u64;
                *field = off;
                self.ops.persist(field as *const u8, 8);
            }
            Ok(())
        }

        fn ulog_free(&self, next_field_off: u64) {
            unsafe {
                let field = self.ops.off_to_ptr(next_field_off) as *mut u64;
                *field = 0;
                self.ops.persist(field as *const u8, 8);
            }
        }

        fn userbuf_insert(&self, def: &UserBufferDef) -> Result<()> {
            if !self.verify {
                return Ok(());
            }
            let mut t = self.userbufs.lock().unwrap();
            let end = def.addr_off + def.size as u64;
            if let Some((&s, &len)) = t.range(..end).next_back() {
                if s + len as u64 > def.addr_off {
                    return Err(Error::Invalid("user buffer overlap"));
                }
            }
            t.insert(def.addr_off, def.size);
            Ok(())
        }

        fn userbuf_remove(&self, ulog_off: u64) {
            self.userbufs.lock().unwrap().remove(&ulog_off);
        }

        fn off_is_valid(&self, off: u64) -> bool {
            (off as usize) < self.region_len
        }
    }

    fn ctx_over(
        r: &TestRegion,
        log_off: u64,
        base: usize,
        lt: LogType,
        extendable: bool,
    ) -> OperationContext {
        unsafe { ulog::construct(log_off, base, 0, true, 0, r.ops()) };
        let backend = MockBackend::new(r, 16 * 1024);
        OperationContext::new(log_off, base, backend, extendable, *r.ops(), lt)
    }

    #[test]
    fn single_set_entry_skips_the_log() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, false);
        ctx.start();
        ctx.add_entry_off(1024, 77, UlogOp::Set).unwrap();
        ctx.process();
        unsafe {
            assert_eq!(*(r.ops().off_to_ptr(1024) as *const u64), 77);
            // nothing was stored on media
            assert!(ulog::is_empty(4096, r.ops()));
        }
        ctx.finish(0);
    }

    #[test]
    fn consecutive_sets_to_one_offset_merge() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, false);
        ctx.start();
        for v in 1..=10u64 {
            ctx.add_entry_off(1024, v, UlogOp::Set).unwrap();
        }
        // all ten collapsed into one entry, so the fast path still applies
        ctx.process();
        unsafe {
            assert_eq!(*(r.ops().off_to_ptr(1024) as *const u64), 10);
            assert!(ulog::is_empty(4096, r.ops()));
        }
        ctx.finish(0);
    }

    #[test]
    fn bit_operations_merge_by_kind_only() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 256, LogType::Redo, false);
        ctx.start();
        ctx.add_entry_off(1024, 0b0001, UlogOp::Or).unwrap();
        ctx.add_entry_off(1024, 0b0010, UlogOp::Or).unwrap(); // merges
        ctx.add_entry_off(1024, !0b0001u64, UlogOp::And).unwrap(); // clash, appends
        ctx.add_entry_off(1032, 5, UlogOp::Set).unwrap();
        ctx.process();
        unsafe {
            assert_eq!(*(r.ops().off_to_ptr(1024) as *const u64), 0b0010);
            assert_eq!(*(r.ops().off_to_ptr(1032) as *const u64), 5);
        }
        ctx.finish(0);
    }

    #[test]
    fn transient_entries_never_touch_media() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, false);
        let mut volatile_word: u64 = 0;
        ctx.start();
        ctx.add_entry(&mut volatile_word as *mut u64, 42, UlogOp::Set)
            .unwrap();
        ctx.process();
        assert_eq!(volatile_word, 42);
        unsafe { assert!(ulog::is_empty(4096, r.ops())) };
        ctx.finish(0);
    }

    #[test]
    fn redo_overflow_extends_the_chain() {
        let r = TestRegion::new(256 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, true);
        ctx.start();
        // 41 entries at 16 bytes = 656 bytes, far beyond the 128-byte base
        let n = 41u64;
        ctx.reserve(n as usize * ENTRY_VAL_SIZE).unwrap();
        for i in 0..n {
            ctx.add_entry_off(1024 + i * 8, i + 1, UlogOp::Set).unwrap();
        }
        ctx.process();
        unsafe {
            for i in 0..n {
                assert_eq!(
                    *(r.ops().off_to_ptr(1024 + i * 8) as *const u64),
                    i + 1,
                    "entry {} was not applied",
                    i
                );
            }
        }
        ctx.finish(0);
        assert_eq!(ctx.state(), OperationState::Idle);
    }

    #[test]
    fn reserve_without_extension_reports_oom() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, false);
        ctx.start();
        assert!(matches!(ctx.reserve(4096), Err(Error::OutOfMemory)));
        ctx.cancel();
    }

    #[test]
    fn auto_reserve_off_reports_oom() {
        let r = TestRegion::new(64 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, true);
        ctx.start();
        ctx.set_auto_reserve(false);
        assert!(matches!(ctx.reserve(4096), Err(Error::OutOfMemory)));
        ctx.cancel();
    }

    #[test]
    fn undo_buffer_split_across_records_restores_all() {
        let r = TestRegion::new(256 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Undo, true);

        // a 300-byte region: the snapshot cannot fit one 128-byte record
        let dest = 8 * 1024u64;
        let original: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        unsafe {
            std::ptr::copy_nonoverlapping(
                original.as_ptr(),
                r.ops().off_to_ptr(dest),
                original.len(),
            );
        }

        ctx.start();
        unsafe {
            ctx.add_buffer(dest, r.ops().off_to_ptr(dest), 300, UlogOp::BufCpy)
                .unwrap();
            // clobber the region, then roll it back
            std::ptr::write_bytes(r.ops().off_to_ptr(dest), 0xee, 300);
        }
        ctx.process();
        ctx.finish(ulog::ULOG_INC_FIRST_GEN_NUM);

        let now = unsafe { std::slice::from_raw_parts(r.ops().off_to_ptr(dest), 300) };
        assert_eq!(now, &original[..]);
    }

    #[test]
    fn user_buffer_substitutes_for_allocation() {
        let r = TestRegion::new(256 * 1024);
        let mut ctx = ctx_over(&r, 4096, 128, LogType::Redo, true);
        ctx.start();
        ctx.set_auto_reserve(false);

        let need = 60 * ENTRY_VAL_SIZE;
        assert!(ctx.reserve(need).is_err());

        let mut def = UserBufferDef {
            addr_off: 32 * 1024 + 8, // deliberately misaligned
            size: 4096,
        };
        ctx.user_buffer_verify_align(&mut def).unwrap();
        assert_eq!(def.addr_off % 64, 0);
        ctx.add_user_buffer(&def);

        ctx.reserve(need).unwrap();
        for i in 0..60u64 {
            ctx.add_entry_off(1024 + i * 8, i, UlogOp::Set).unwrap();
        }
        ctx.process();
        unsafe {
            for i in 0..60u64 {
                assert_eq!(*(r.ops().off_to_ptr(1024 + i * 8) as *const u64), i);
            }
        }
        ctx.finish(0);
        // the buffer was unlinked and unregistered at finish
        let backend_empty = unsafe {
            ulog::by_offset(4096, r.ops()).unwrap().next == 0
        };
        assert!(backend_empty);
    }

    #[test]
    fn double_user_buffer_append_is_rejected() {
        let r = TestRegion::new(256 * 1024);
        let ctx = ctx_over(&r, 4096, 128, LogType::Redo, true);
        let mut a = UserBufferDef { addr_off: 32 * 1024, size: 2048 };
        let mut b = UserBufferDef { addr_off: 32 * 1024 + 512, size: 1024 };
        ctx.user_buffer_verify_align(&mut a).unwrap();
        assert!(ctx.user_buffer_verify_align(&mut b).is_err());
    }
}
