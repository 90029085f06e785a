//! The transaction runtime
//!
//! A transaction walks the stages `None → Work → (OnCommit | OnAbort) →
//! Finally → None`. The classic jump-based control transfer is replaced by
//! a closure: [`transaction`] begins a transaction, runs the closure, and
//! commits on `Ok` or rolls back on `Err`, so every transactional call
//! threads its failure through an explicit `Result`.
//!
//! While in `Work`, snapshots are recorded in a range tree that merges
//! adjacent and overlapping requests, so the undo log receives each byte
//! at most once. The first snapshot of a transaction also queues a redo
//! action that bumps the undo log's generation number: the moment the redo
//! log commits, the undo log dies with it, and that single write is the
//! commit point of the whole transaction.
//!
//! Transactions nest by stacking frames; an abort at an inner level latches
//! the error and cascades outward as each level ends.

use crate::error::{fail, set_errormsg, Error, Result};
use crate::lane::{self, Lane};
use crate::memops::UserBufferDef;
use crate::palloc::{self, PobjAction};
use crate::pmem::flags as mf;
use crate::pool::{ObjPool, Oid, PmemObjPool};
use crate::sync::{PMutex, PRwlock};
use crate::ulog::{self, UlogEntryBuf, UlogOp, ENTRY_BUF_HEADER_SIZE};
use crate::CACHELINE_SIZE;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Largest single allocation or snapshot the format permits
pub const PMEMOBJ_MAX_ALLOC_SIZE: usize = 0x3FFD_FFFC0;

/// Overheads used by the log sizing helpers
pub const TX_SNAPSHOT_LOG_ENTRY_OVERHEAD: usize = ENTRY_BUF_HEADER_SIZE;
pub const TX_SNAPSHOT_LOG_ENTRY_ALIGNMENT: usize = CACHELINE_SIZE;
pub const TX_SNAPSHOT_LOG_BUFFER_OVERHEAD: usize = ulog::ULOG_HEADER_SIZE;
pub const TX_INTENT_LOG_ENTRY_OVERHEAD: usize = ulog::ENTRY_VAL_SIZE;
pub const TX_INTENT_LOG_BUFFER_ALIGNMENT: usize = CACHELINE_SIZE;
pub const TX_INTENT_LOG_BUFFER_OVERHEAD: usize = ulog::ULOG_HEADER_SIZE;

/// Per-call flags of the extended transactional operations
pub mod flags {
    /// Zero the allocated object
    pub const POBJ_XALLOC_ZERO: u64 = 1 << 0;
    /// Skip the pre-commit flush of this range
    pub const POBJ_XADD_NO_FLUSH: u64 = 1 << 1;
    /// Track the range but do not snapshot it
    pub const POBJ_XADD_NO_SNAPSHOT: u64 = 1 << 2;
    /// The range is known to hold initialized data
    pub const POBJ_XADD_ASSUME_INITIALIZED: u64 = 1 << 3;
    /// On failure, return instead of aborting the transaction
    pub const POBJ_TX_NO_ABORT: u64 = 1 << 4;

    pub(super) const XALLOC_VALID: u64 =
        POBJ_XALLOC_ZERO | POBJ_XADD_NO_FLUSH | POBJ_TX_NO_ABORT;
    pub(super) const XADD_VALID: u64 = POBJ_XADD_NO_FLUSH
        | POBJ_XADD_NO_SNAPSHOT
        | POBJ_XADD_ASSUME_INITIALIZED
        | POBJ_TX_NO_ABORT;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    None,
    Work,
    OnAbort,
    OnCommit,
    Finally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBehavior {
    /// A failing call aborts the transaction before returning its error
    Abort,
    /// A failing call returns its error and leaves the transaction working
    Return,
}

/// Stage notifications for the outermost transaction
pub type TxCallback = fn(&PmemObjPool, TxStage);

/// Parameters accepted by [`transaction`] and [`Tx::lock`]
#[derive(Clone, Copy)]
pub enum TxParam<'a> {
    Mutex(&'a PMutex),
    Rwlock(&'a PRwlock),
    Callback(TxCallback),
}

#[derive(Clone, Copy, PartialEq)]
enum LockKind {
    Mutex,
    Rwlock,
}

#[derive(Clone, Copy)]
struct TxLockRec {
    kind: LockKind,
    addr: usize,
}

struct TxFrame {
    failure_behavior: FailureBehavior,
}

#[derive(Debug, Clone, Copy)]
struct RangeDef {
    size: u64,
    flags: u64,
}

struct TxState {
    pool: *const PmemObjPool,
    stage: TxStage,
    last_errnum: i32,
    lane_idx: u64,
    has_lane: bool,

    ranges: BTreeMap<u64, RangeDef>,
    actions: Vec<PobjAction>,
    redo_userbufs: Vec<UserBufferDef>,
    redo_userbufs_capacity: usize,
    locks: Vec<TxLockRec>,
    frames: Vec<TxFrame>,

    first_snapshot: bool,
    /// carried into commit, which restarts the intent log
    intent_auto_reserve: bool,
    stage_callback: Option<TxCallback>,
    user_data: usize,
}

impl TxState {
    fn new() -> Self {
        Self {
            pool: std::ptr::null(),
            stage: TxStage::None,
            last_errnum: 0,
            lane_idx: 0,
            has_lane: false,
            ranges: BTreeMap::new(),
            actions: Vec::new(),
            redo_userbufs: Vec::new(),
            redo_userbufs_capacity: 0,
            locks: Vec::new(),
            frames: Vec::new(),
            first_snapshot: true,
            intent_auto_reserve: true,
            stage_callback: None,
            user_data: 0,
        }
    }

    /// The transaction's pool; the reference escapes the `RefCell` borrow
    /// on purpose, the pool outlives every frame
    #[inline]
    fn pool<'a>(&self) -> &'a PmemObjPool {
        debug_assert!(!self.pool.is_null());
        unsafe { &*self.pool }
    }

    /// The held lane; exclusive by virtue of the lane lock
    #[inline]
    fn lane<'a>(&self) -> &'a mut Lane {
        debug_assert!(self.has_lane);
        unsafe { self.pool().lanes.lane_at(self.lane_idx) }
    }

    #[inline]
    fn outermost(&self) -> bool {
        self.frames.len() == 1
    }

    fn dispatch_callback(&self) {
        if let Some(cb) = self.stage_callback {
            if self.outermost() {
                cb(self.pool(), self.stage);
            }
        }
    }
}

thread_local! {
    static TX: RefCell<TxState> = RefCell::new(TxState::new());
}

fn assert_work(stage: TxStage) {
    if stage != TxStage::Work {
        panic!("transactional call outside of the work stage ({:?})", stage);
    }
}

/// Effective failure disposition for one call
fn abort_on_failure(tx: &TxState, call_flags: u64) -> bool {
    if call_flags & flags::POBJ_TX_NO_ABORT != 0 {
        return false;
    }
    match tx.frames.last() {
        Some(f) => f.failure_behavior == FailureBehavior::Abort,
        None => true,
    }
}

/// Fails a transactional call, aborting first when the disposition says so
///
/// With the return disposition the transaction stays in `Work` and nothing
/// is latched; the caller alone decides what the failure means.
fn tx_fail<T>(tx: &mut TxState, e: Error, call_flags: u64) -> Result<T> {
    if abort_on_failure(tx, call_flags) {
        abort_impl(tx, e.errno());
    }
    set_errormsg(&e);
    Err(e)
}

// -- begin / commit / abort / end -------------------------------------------

fn add_to_tx_and_lock(tx: &mut TxState, kind: LockKind, addr: usize) -> Result<()> {
    if tx.locks.iter().any(|l| l.addr == addr) {
        return Ok(());
    }
    let run_id = tx.pool().run_id();
    match kind {
        LockKind::Mutex => unsafe { (*(addr as *const PMutex)).lock(run_id)? },
        LockKind::Rwlock => unsafe { (*(addr as *const PRwlock)).write_lock(run_id)? },
    }
    tx.locks.push(TxLockRec { kind, addr });
    Ok(())
}

fn release_tx_locks(tx: &mut TxState) {
    let run_id = tx.pool().run_id();
    while let Some(rec) = tx.locks.pop() {
        let _ = match rec.kind {
            LockKind::Mutex => unsafe { (*(rec.addr as *const PMutex)).unlock(run_id) },
            LockKind::Rwlock => unsafe { (*(rec.addr as *const PRwlock)).unlock(run_id) },
        };
    }
}

fn begin(pool: &PmemObjPool, params: &[TxParam]) -> Result<()> {
    TX.with(|cell| {
        {
            let mut tx = cell.borrow_mut();
            let mut failure_behavior = FailureBehavior::Abort;

            match tx.stage {
                TxStage::Work => {
                    debug_assert!(tx.has_lane);
                    if tx.pool != pool as *const PmemObjPool {
                        return tx_fail(
                            &mut tx,
                            Error::Invalid("nested transaction for a different pool"),
                            0,
                        );
                    }
                    failure_behavior = tx.frames.last().unwrap().failure_behavior;
                }
                TxStage::None => {
                    let (idx, lane) = unsafe { lane::hold_lane(&pool.lanes, pool.uuid_lo()) };
                    lane.undo.start();

                    tx.pool = pool;
                    tx.lane_idx = idx;
                    tx.has_lane = true;
                    tx.ranges.clear();
                    tx.actions.clear();
                    tx.redo_userbufs.clear();
                    tx.redo_userbufs_capacity = 0;
                    tx.locks.clear();
                    tx.first_snapshot = true;
                    tx.intent_auto_reserve = true;
                    tx.user_data = 0;
                }
                s => panic!("beginning a transaction in stage {:?}", s),
            }

            tx.last_errnum = 0;
            tx.frames.push(TxFrame { failure_behavior });
            tx.stage = TxStage::Work;
        }

        let param_result = {
            let mut tx = cell.borrow_mut();
            apply_params(&mut tx, params)
        };
        if let Err(e) = param_result {
            {
                let mut tx = cell.borrow_mut();
                let errnum = e.errno();
                abort_impl(&mut tx, errnum);
            }
            end(cell);
            set_errormsg(&e);
            return Err(e);
        }
        Ok(())
    })
}

fn apply_params(tx: &mut TxState, params: &[TxParam]) -> Result<()> {
    for p in params {
        match p {
            TxParam::Callback(cb) => {
                if let Some(old) = tx.stage_callback {
                    if old as usize != *cb as usize {
                        panic!("transaction stage callback is already set");
                    }
                }
                tx.stage_callback = Some(*cb);
            }
            TxParam::Mutex(m) => {
                add_to_tx_and_lock(tx, LockKind::Mutex, *m as *const PMutex as usize)?
            }
            TxParam::Rwlock(l) => {
                add_to_tx_and_lock(tx, LockKind::Rwlock, *l as *const PRwlock as usize)?
            }
        }
    }
    Ok(())
}

/// Restores one undo buffer entry, stepping around every lock the
/// transaction holds: those cells are live and must keep their state
unsafe fn restore_range(pool: &PmemObjPool, locks: &[TxLockRec], e: *const u8) {
    let hdr = &*(e as *const UlogEntryBuf);
    let dest_off = ulog::entry_offset(e);
    let size = hdr.size as usize;
    let dest_addr = pool.p_ops().off_to_ptr(dest_off) as usize;

    let mut segs: Vec<(usize, usize)> = vec![(dest_addr, dest_addr + size)];
    for l in locks {
        let (lb, le) = (l.addr, l.addr + CACHELINE_SIZE);
        let mut next = Vec::with_capacity(segs.len() + 1);
        for (s, end) in segs {
            if lb >= end || le <= s {
                next.push((s, end));
                continue;
            }
            if s < lb {
                next.push((s, lb));
            }
            if end > le {
                next.push((le, end));
            }
        }
        segs = next;
    }

    let data = e.add(ENTRY_BUF_HEADER_SIZE);
    for (s, end) in segs {
        let src = data.add(s - dest_addr);
        pool.p_ops().memcpy(s as *mut u8, src, end - s, 0);
    }
}

/// Rolls the outermost transaction back; also used for inner aborts, where
/// it only latches the error
fn abort_impl(tx: &mut TxState, errnum: i32) {
    assert_work(tx.stage);
    debug_assert!(tx.has_lane);

    tx.stage = TxStage::OnAbort;

    if tx.outermost() {
        let pool = tx.pool();
        let lane = tx.lane();
        let undo_off = lane.undo.ulog_off();

        unsafe {
            let locks = &tx.locks;
            ulog::foreach_entry(
                undo_off,
                |e| {
                    match ulog::entry_type(e) {
                        UlogOp::BufCpy => restore_range(pool, locks, e),
                        t => panic!("unexpected {:?} entry in an undo log", t),
                    }
                    true
                },
                pool.p_ops(),
            );
        }
        pool.p_ops().drain();
        lane.undo.finish(ulog::ULOG_INC_FIRST_GEN_NUM);

        tx.ranges.clear();
        palloc::cancel(&pool.heap, &tx.actions);
        tx.actions.clear();
        // queued intent buffers never attached; unregister them by hand
        for def in tx.redo_userbufs.drain(..) {
            pool.user_buffers.remove(def.addr_off);
        }
        tx.redo_userbufs_capacity = 0;

        lane::release(&pool.lanes, pool.uuid_lo());
        tx.has_lane = false;
    }

    tx.last_errnum = errnum;
    tx.dispatch_callback();
}

/// Commits the current transaction; real work happens only when outermost
fn commit(cell: &RefCell<TxState>) -> Result<()> {
    let mut tx = cell.borrow_mut();
    assert_work(tx.stage);
    debug_assert!(tx.has_lane);

    // WORK notification fires on the way into commit
    tx.dispatch_callback();

    if tx.outermost() {
        let pool = tx.pool();

        // pre-commit: flush every snapshotted range, then forget the tree
        for (off, def) in std::mem::take(&mut tx.ranges) {
            if def.flags & flags::POBJ_XADD_NO_FLUSH == 0 {
                unsafe {
                    pool.p_ops().xflush(
                        pool.p_ops().off_to_ptr(off),
                        def.size as usize,
                        mf::RELAXED,
                    );
                }
            }
        }
        pool.p_ops().drain();

        let lane = tx.lane();
        lane.external.start();
        lane.external.set_auto_reserve(tx.intent_auto_reserve);
        for def in tx.redo_userbufs.clone() {
            lane.external.add_user_buffer(&def);
        }

        if let Err(e) = palloc::publish(&pool.heap, &tx.actions, &mut lane.external) {
            // unlinks any attached user buffers and drops extensions
            lane.external.finish(0);
            let errnum = e.errno();
            abort_impl(&mut tx, errnum);
            set_errormsg(&e);
            return Err(e);
        }
        tx.actions.clear();
        tx.redo_userbufs.clear();
        tx.redo_userbufs_capacity = 0;

        // the redo publish invalidated the undo log; shrink it back
        tx.lane().undo.finish(0);

        lane::release(&pool.lanes, pool.uuid_lo());
        tx.has_lane = false;
    }

    tx.stage = TxStage::OnCommit;
    tx.dispatch_callback();
    Ok(())
}

/// Ends the innermost transaction level; returns the latched error number
fn end(cell: &RefCell<TxState>) -> i32 {
    let mut tx = cell.borrow_mut();
    if tx.stage == TxStage::Work {
        panic!("transaction ended without commit or abort");
    }

    if tx.stage_callback.is_some()
        && (tx.stage == TxStage::OnCommit || tx.stage == TxStage::OnAbort)
    {
        tx.stage = TxStage::Finally;
        tx.dispatch_callback();
    }

    tx.frames.pop();
    let ret = tx.last_errnum;

    if tx.frames.is_empty() {
        debug_assert!(!tx.has_lane);
        release_tx_locks(&mut tx);
        let pool = tx.pool;
        tx.pool = std::ptr::null();
        tx.stage = TxStage::None;
        tx.ranges.clear();
        tx.actions.clear();
        tx.redo_userbufs.clear();

        if let Some(cb) = tx.stage_callback.take() {
            cb(unsafe { &*pool }, TxStage::None);
        }
    } else {
        tx.stage = TxStage::Work;
        if tx.last_errnum != 0 {
            // waterfall the inner abort outward
            let errnum = tx.last_errnum;
            abort_impl(&mut tx, errnum);
        }
    }
    ret
}

/// Runs `f` inside a transaction on `pool`
///
/// Locks given in `params` are acquired in order before `f` runs and are
/// held until the outermost level ends. `Ok` commits, `Err` aborts; the
/// first latched failure wins.
pub fn transaction<T, F>(pool: &ObjPool, params: &[TxParam], f: F) -> Result<T>
where
    F: FnOnce(&mut Tx) -> Result<T>,
{
    begin(pool, params)?;

    let mut token = Tx {
        pool: &**pool as *const PmemObjPool,
        _not_send: PhantomData,
    };
    let result = f(&mut token);

    TX.with(|cell| {
        let out = match result {
            Ok(v) => {
                let stage = cell.borrow().stage;
                if stage == TxStage::Work {
                    commit(cell).map(|_| v)
                } else {
                    // an inner level already aborted and the error was
                    // swallowed; the latched error stands
                    let e = Error::from_errno(cell.borrow().last_errnum);
                    Err(e)
                }
            }
            Err(e) => {
                let stage = cell.borrow().stage;
                if stage == TxStage::Work {
                    let mut tx = cell.borrow_mut();
                    let errnum = e.errno();
                    abort_impl(&mut tx, errnum);
                }
                Err(e)
            }
        };
        end(cell);
        out
    })
}

/// The last transaction error number latched on this thread
pub fn errno() -> i32 {
    TX.with(|cell| cell.borrow().last_errnum)
}

/// The current transaction stage of this thread
pub fn stage() -> TxStage {
    TX.with(|cell| cell.borrow().stage)
}

// -- the in-transaction handle ----------------------------------------------

/// Capability handed to the transaction closure
///
/// All methods operate on the calling thread's transaction; the handle is
/// deliberately not `Send`.
pub struct Tx {
    pool: *const PmemObjPool,
    _not_send: PhantomData<*mut ()>,
}

impl Tx {
    /// The pool this transaction works on
    pub fn pool(&self) -> &PmemObjPool {
        unsafe { &*self.pool }
    }

    /// Aborts the transaction, handing back the error to propagate
    pub fn abort(&mut self, e: Error) -> Error {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            let errnum = e.errno();
            abort_impl(&mut tx, errnum);
            set_errormsg(&e);
        });
        e
    }

    /// Acquires a lock for the rest of the transaction
    pub fn lock(&mut self, param: TxParam) -> Result<()> {
        self.xlock(param, 0)
    }

    pub fn xlock(&mut self, param: TxParam, call_flags: u64) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            let r = match param {
                TxParam::Mutex(m) => {
                    add_to_tx_and_lock(&mut tx, LockKind::Mutex, m as *const PMutex as usize)
                }
                TxParam::Rwlock(l) => {
                    add_to_tx_and_lock(&mut tx, LockKind::Rwlock, l as *const PRwlock as usize)
                }
                TxParam::Callback(_) => fail(Error::Invalid("callbacks are not locks")),
            };
            match r {
                Ok(()) => Ok(()),
                Err(e) => tx_fail(&mut tx, e, call_flags),
            }
        })
    }

    // -- snapshots ----------------------------------------------------------

    /// Snapshots `size` bytes at `hoff` inside the object `oid`
    pub fn add_range(&mut self, oid: Oid, hoff: u64, size: usize) -> Result<()> {
        self.xadd_range(oid, hoff, size, 0)
    }

    pub fn xadd_range(&mut self, oid: Oid, hoff: u64, size: usize, call_flags: u64) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            if call_flags & !flags::XADD_VALID != 0 {
                return tx_fail(&mut tx, Error::Invalid("unknown flags"), call_flags);
            }
            if oid.pool_uuid_lo != tx.pool().uuid_lo() {
                return tx_fail(&mut tx, Error::Invalid("OID from a different pool"), call_flags);
            }
            add_common(&mut tx, oid.off + hoff, size, call_flags)
        })
    }

    /// Snapshots the region behind a direct pointer
    pub fn add_range_direct(&mut self, ptr: *const u8, size: usize) -> Result<()> {
        self.xadd_range_direct(ptr, size, 0)
    }

    pub fn xadd_range_direct(&mut self, ptr: *const u8, size: usize, call_flags: u64) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            if call_flags & !flags::XADD_VALID != 0 {
                return tx_fail(&mut tx, Error::Invalid("unknown flags"), call_flags);
            }
            let pool = tx.pool();
            if !pool.p_ops().contains_ptr(ptr) {
                return tx_fail(&mut tx, Error::Invalid("pointer outside of the pool"), call_flags);
            }
            let off = pool.p_ops().ptr_to_off(ptr);
            add_common(&mut tx, off, size, call_flags)
        })
    }

    // -- allocation ---------------------------------------------------------

    pub fn alloc(&mut self, size: usize, type_num: u64) -> Result<Oid> {
        self.xalloc(size, type_num, 0)
    }

    /// Allocates a zeroed object
    pub fn zalloc(&mut self, size: usize, type_num: u64) -> Result<Oid> {
        self.xalloc(size, type_num, flags::POBJ_XALLOC_ZERO)
    }

    pub fn xalloc(&mut self, size: usize, type_num: u64, call_flags: u64) -> Result<Oid> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            if call_flags & !flags::XALLOC_VALID != 0 {
                return tx_fail(&mut tx, Error::Invalid("unknown flags"), call_flags);
            }
            alloc_common(&mut tx, size, type_num, call_flags, None)
        })
    }

    /// Frees an object; an allocation made by this transaction is simply
    /// taken back, anything else becomes a deferred free
    pub fn free(&mut self, oid: Oid) -> Result<()> {
        self.xfree(oid, 0)
    }

    pub fn xfree(&mut self, oid: Oid, call_flags: u64) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            free_common(&mut tx, oid, call_flags)
        })
    }

    /// Reallocation with the usual aliases: a null `oid` allocates, a zero
    /// `size` frees
    pub fn realloc(&mut self, oid: Oid, size: usize, type_num: u64) -> Result<Oid> {
        self.realloc_common(oid, size, type_num, 0)
    }

    /// Like [`Tx::realloc`], but a grown tail reads as zero
    pub fn zrealloc(&mut self, oid: Oid, size: usize, type_num: u64) -> Result<Oid> {
        self.realloc_common(oid, size, type_num, flags::POBJ_XALLOC_ZERO)
    }

    fn realloc_common(
        &mut self,
        oid: Oid,
        size: usize,
        type_num: u64,
        call_flags: u64,
    ) -> Result<Oid> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);

            if oid.is_null() {
                return alloc_common(&mut tx, size, type_num, call_flags, None);
            }
            if oid.pool_uuid_lo != tx.pool().uuid_lo() {
                return tx_fail(&mut tx, Error::Invalid("OID from a different pool"), call_flags);
            }
            if size == 0 {
                free_common(&mut tx, oid, call_flags)?;
                return Ok(Oid::NULL);
            }

            let pool = tx.pool();
            let old_size = pool.heap.usable_size(oid.off);
            let copy_size = old_size.min(size);
            let old_ptr = pool.p_ops().off_to_ptr(oid.off);

            let new_oid =
                alloc_common(&mut tx, size, type_num, call_flags, Some((old_ptr, copy_size)))?;
            if let Err(e) = free_common(&mut tx, oid, call_flags) {
                // take the fresh reservation back and report the failure
                if let Some(act) = tx.actions.pop() {
                    palloc::cancel(&tx.pool().heap, &[act]);
                    tx.ranges.remove(&new_oid.off);
                }
                return Err(e);
            }
            Ok(new_oid)
        })
    }

    // -- user log buffers ----------------------------------------------------

    /// Offers an in-pool buffer as log storage
    ///
    /// Snapshot buffers attach to the undo log immediately; intent buffers
    /// are queued and attach when the commit publishes.
    pub fn log_append_buffer(&mut self, intent: bool, ptr: *const u8, size: usize) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);

            let pool = tx.pool();
            if !pool.p_ops().contains_ptr(ptr) {
                return tx_fail(&mut tx, Error::Invalid("buffer from a different pool"), 0);
            }
            let mut def = UserBufferDef {
                addr_off: pool.p_ops().ptr_to_off(ptr),
                size,
            };

            let outer = tx.outermost();
            let lane = tx.lane();
            let ctx = if intent { &mut lane.external } else { &mut lane.undo };

            if outer && !ctx.any_user_buffer() {
                // drop inherited extensions so the user buffer comes first
                ctx.free_logs(ulog::ULOG_ANY_USER_BUFFER);
            }

            if let Err(e) = ctx.user_buffer_verify_align(&mut def) {
                return tx_fail(&mut tx, e, 0);
            }

            if intent {
                tx.redo_userbufs.push(def);
                tx.redo_userbufs_capacity += def.size - TX_INTENT_LOG_BUFFER_OVERHEAD;
            } else {
                ctx.add_user_buffer(&def);
            }
            Ok(())
        })
    }

    /// Enables or disables automatic log extension for one of the logs
    pub fn log_auto_alloc(&mut self, intent: bool, on: bool) -> Result<()> {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            let lane = tx.lane();
            if intent {
                // the intent log restarts at commit; remember the setting
                tx.intent_auto_reserve = on;
                lane.external.set_auto_reserve(on);
            } else {
                lane.undo.set_auto_reserve(on);
            }
            Ok(())
        })
    }

    // -- odds and ends -------------------------------------------------------

    pub fn set_user_data(&mut self, data: usize) {
        TX.with(|cell| cell.borrow_mut().user_data = data);
    }

    pub fn user_data(&self) -> usize {
        TX.with(|cell| cell.borrow().user_data)
    }

    pub fn set_failure_behavior(&mut self, behavior: FailureBehavior) {
        TX.with(|cell| {
            let mut tx = cell.borrow_mut();
            assert_work(tx.stage);
            tx.frames.last_mut().unwrap().failure_behavior = behavior;
        });
    }

    pub fn stage(&self) -> TxStage {
        stage()
    }
}

// -- internals ---------------------------------------------------------------

/// Emits the undo snapshot for a range that is not yet covered
fn add_snapshot(tx: &mut TxState, off: u64, size: u64, range_flags: u64) -> Result<()> {
    if range_flags & flags::POBJ_XADD_NO_SNAPSHOT != 0 {
        return Ok(());
    }

    if tx.first_snapshot {
        // queue the redo action that orphans the undo log at commit: its
        // application is the commit point of every snapshot taken here
        let undo_off = tx.lane().undo.ulog_off();
        let gen_field = undo_off + 24;
        let gen = unsafe { ulog::by_offset(undo_off, tx.pool().p_ops()).unwrap().gen_num };
        tx.actions.push(palloc::set_value(gen_field, gen + 1));
        tx.first_snapshot = false;
    }

    let src = tx.pool().p_ops().off_to_ptr(off);
    tx.lane()
        .undo
        .add_buffer(off, src, size as usize, UlogOp::BufCpy)
}

/// `POBJ_XADD_NO_FLUSH` survives a merge only if both ranges carry it
fn merge_flags(dest: &mut RangeDef, merged_flags: u64) {
    if dest.flags & flags::POBJ_XADD_NO_FLUSH != 0
        && merged_flags & flags::POBJ_XADD_NO_FLUSH == 0
    {
        dest.flags &= !flags::POBJ_XADD_NO_FLUSH;
    }
}

/// The range-merging core of snapshotting
///
/// Walks existing ranges leftwards from the end of the request, extending
/// and fusing neighbors so that the union of requested bytes is snapshotted
/// exactly once.
fn add_common(tx: &mut TxState, offset: u64, size: usize, call_flags: u64) -> Result<()> {
    if size > PMEMOBJ_MAX_ALLOC_SIZE {
        return tx_fail(tx, Error::Invalid("snapshot size too large"), call_flags);
    }
    if !tx.pool().off_in_heap(offset, size) {
        return tx_fail(tx, Error::Invalid("object outside of the heap"), call_flags);
    }

    let mut r_off = offset;
    let mut r_size = size as u64;
    let mut first_iter = true;
    let mut nprev: Option<u64> = None;

    while r_size != 0 {
        let rend = r_off + r_size;
        // the first probe may land on the range we would merge with on the
        // right; afterwards only strictly-left ranges are interesting
        let found = if first_iter {
            tx.ranges.range(..=rend).next_back()
        } else {
            tx.ranges.range(..rend).next_back()
        }
        .map(|(k, v)| (*k, *v));
        first_iter = false;

        let fend = found.map_or(0, |(k, v)| k + v.size);

        if fend == 0 || fend < r_off {
            // nothing overlapping or adjacent on the left
            if let Some(pk) = nprev {
                // but an adjacent range on the right absorbs the request
                debug_assert_eq!(pk, rend);
                let mut pd = tx.ranges.remove(&pk).unwrap();
                pd.size += r_size;
                tx.ranges.insert(pk - r_size, pd);
            } else {
                tx.ranges.insert(
                    r_off,
                    RangeDef {
                        size: r_size,
                        flags: call_flags,
                    },
                );
            }
            if let Err(e) = add_snapshot(tx, r_off, r_size, call_flags) {
                return tx_fail(tx, e, call_flags);
            }
            break;
        }

        let (fkey, _) = found.unwrap();
        if fend <= rend {
            // the found range ends inside the request: extend it over the
            // uncovered tail and snapshot only that tail
            let snap_off = fend;
            let snap_size = rend - fend;
            let intersection = fend - fkey.max(r_off);
            r_size -= intersection + snap_size;

            {
                let f = tx.ranges.get_mut(&fkey).unwrap();
                f.size += snap_size;
                merge_flags(f, call_flags);
            }

            if snap_size != 0 {
                if let Err(e) = add_snapshot(tx, snap_off, snap_size, call_flags) {
                    return tx_fail(tx, e, call_flags);
                }
            }

            if let Some(pk) = nprev {
                debug_assert_eq!(pk, rend);
                let pd = tx.ranges.remove(&pk).unwrap();
                let f = tx.ranges.get_mut(&fkey).unwrap();
                f.size += pd.size;
                merge_flags(f, pd.flags);
            }
            nprev = Some(fkey);
        } else if fend >= r_off {
            // the found range covers the request's tail; shrink the request
            // and keep looking left
            let overlap = rend - fkey.max(r_off);
            r_size -= overlap;
            let f = tx.ranges.get_mut(&fkey).unwrap();
            merge_flags(f, call_flags);
            nprev = Some(fkey);
        } else {
            unreachable!();
        }
    }

    Ok(())
}

fn alloc_common(
    tx: &mut TxState,
    size: usize,
    type_num: u64,
    call_flags: u64,
    copy_from: Option<(*mut u8, usize)>,
) -> Result<Oid> {
    if size == 0 {
        return tx_fail(tx, Error::Invalid("zero-sized allocation"), call_flags);
    }
    if size > PMEMOBJ_MAX_ALLOC_SIZE {
        return tx_fail(tx, Error::OutOfMemory, call_flags);
    }

    let pool = tx.pool();
    let zero = call_flags & flags::POBJ_XALLOC_ZERO != 0;
    let mut ctor = |ptr: *mut u8, usable: usize| unsafe {
        if zero {
            std::ptr::write_bytes(ptr, 0, usable);
        }
        if let Some((src, n)) = copy_from {
            std::ptr::copy_nonoverlapping(src, ptr, n);
        }
    };

    let act = match palloc::reserve(&pool.heap, size, Some(&mut ctor), type_num, false, 0, 0) {
        Ok(a) => a,
        Err(e) => return tx_fail(tx, e, call_flags),
    };
    let off = act.payload_off().unwrap();
    let usable = pool.heap.usable_size(off);
    tx.actions.push(act);

    // memory this transaction allocated has no prior state to restore, so
    // mark it covered and never snapshot it
    let prev = tx.ranges.insert(
        off,
        RangeDef {
            size: usable as u64,
            flags: call_flags,
        },
    );
    debug_assert!(prev.is_none(), "fresh allocation already tracked");

    Ok(Oid {
        pool_uuid_lo: pool.uuid_lo(),
        off,
    })
}

fn free_common(tx: &mut TxState, oid: Oid, call_flags: u64) -> Result<()> {
    if oid.is_null() {
        return Ok(());
    }
    if oid.pool_uuid_lo != tx.pool().uuid_lo() {
        return tx_fail(tx, Error::Invalid("OID from a different pool"), call_flags);
    }

    // an object allocated by this very transaction is taken back directly
    let mine = tx.actions.iter().position(|a| match a {
        PobjAction::Alloc { block, .. } => block.payload_off == oid.off,
        _ => false,
    });
    if let Some(i) = mine {
        let act = tx.actions.swap_remove(i);
        palloc::cancel(&tx.pool().heap, &[act]);
        tx.ranges.remove(&oid.off);
        return Ok(());
    }

    match palloc::defer_free(&tx.pool().heap, oid.off) {
        Ok(act) => {
            tx.actions.push(act);
            Ok(())
        }
        Err(e) => tx_fail(tx, e, call_flags),
    }
}

// -- log sizing helpers ------------------------------------------------------

/// Smallest buffer able to hold `nintents` published actions
pub fn log_intents_max_size(nintents: usize) -> Result<usize> {
    let entries = nintents
        .checked_mul(TX_INTENT_LOG_ENTRY_OVERHEAD)
        .ok_or(Error::Range)?;
    let aligned = entries
        .checked_add(TX_INTENT_LOG_BUFFER_ALIGNMENT - 1)
        .ok_or(Error::Range)?
        & !(TX_INTENT_LOG_BUFFER_ALIGNMENT - 1);
    let mut result = aligned
        .checked_add(TX_INTENT_LOG_BUFFER_OVERHEAD)
        .ok_or(Error::Range)?;

    // a request above the single-allocation cap fragments into several
    // buffers, each with its own header and entry overhead
    let allocs_overhead = (result / PMEMOBJ_MAX_ALLOC_SIZE)
        .checked_mul(TX_INTENT_LOG_BUFFER_OVERHEAD + TX_INTENT_LOG_ENTRY_OVERHEAD)
        .ok_or(Error::Range)?;
    result = result.checked_add(allocs_overhead).ok_or(Error::Range)?;
    Ok(result)
}

/// Smallest buffer able to hold one snapshot of each given size
pub fn log_snapshots_max_size(sizes: &[usize]) -> Result<usize> {
    let mut result = TX_SNAPSHOT_LOG_BUFFER_OVERHEAD;
    for s in sizes {
        let entry = s
            .checked_add(TX_SNAPSHOT_LOG_ENTRY_OVERHEAD)
            .ok_or(Error::Range)?
            .checked_add(TX_SNAPSHOT_LOG_ENTRY_ALIGNMENT - 1)
            .ok_or(Error::Range)?
            & !(TX_SNAPSHOT_LOG_ENTRY_ALIGNMENT - 1);
        result = result.checked_add(entry).ok_or(Error::Range)?;
    }
    let allocs_overhead = (result / PMEMOBJ_MAX_ALLOC_SIZE)
        .checked_mul(TX_SNAPSHOT_LOG_BUFFER_OVERHEAD + TX_SNAPSHOT_LOG_ENTRY_OVERHEAD)
        .ok_or(Error::Range)?;
    result.checked_add(allocs_overhead).ok_or(Error::Range)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::test::pool_path;
    use crate::pool::PMEMOBJ_MIN_POOL;

    fn with_pool<F: FnOnce(&ObjPool)>(name: &str, f: F) {
        let path = pool_path(name);
        let pool = ObjPool::create(&path, "tx-test", PMEMOBJ_MIN_POOL).unwrap();
        f(&pool);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    /// Offset of the running transaction's undo log
    fn current_undo_off(pool: &PmemObjPool) -> u64 {
        let idx = TX.with(|c| c.borrow().lane_idx);
        unsafe { pool.lanes.lane_at(idx) }.undo.ulog_off()
    }

    #[test]
    fn empty_transaction_commits() {
        with_pool("tx-empty", |pool| {
            transaction(pool, &[], |_| Ok(())).unwrap();
            assert_eq!(stage(), TxStage::None);
            assert!(pool.check().is_ok());
            assert!(pool.first().is_null());
        });
    }

    #[test]
    fn abort_restores_snapshot() {
        with_pool("tx-abort", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            let p = pool.direct(oid).unwrap() as *mut u64;
            unsafe {
                *p = 42;
                pool.p_ops().persist(p as *const u8, 8);
            }

            let r: Result<()> = transaction(pool, &[], |tx| {
                tx.add_range(oid, 0, 8)?;
                unsafe { *p = 7 };
                Err(tx.abort(Error::Canceled))
            });
            assert!(matches!(r, Err(Error::Canceled)));
            assert_eq!(unsafe { *p }, 42);
            assert_eq!(errno(), libc::ECANCELED);
        });
    }

    #[test]
    fn commit_makes_writes_stick() {
        with_pool("tx-commit", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            let p = pool.direct(oid).unwrap() as *mut u64;

            transaction(pool, &[], |tx| {
                tx.add_range(oid, 0, 8)?;
                unsafe { *p = 1234 };
                Ok(())
            })
            .unwrap();
            assert_eq!(unsafe { *p }, 1234);
        });
    }

    #[test]
    fn repeated_snapshots_log_once() {
        with_pool("tx-coalesce", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            transaction(pool, &[], |tx| {
                tx.add_range(oid, 0, 8)?;
                tx.add_range(oid, 0, 8)?;

                // exactly one 8-byte undo entry was emitted
                let pool = tx.pool();
                let undo_off = current_undo_off(pool);
                let mut entries = vec![];
                unsafe {
                    ulog::foreach_entry(
                        undo_off,
                        |e| {
                            let b = &*(e as *const UlogEntryBuf);
                            entries.push(b.size);
                            true
                        },
                        pool.p_ops(),
                    );
                }
                assert_eq!(entries, vec![8]);
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn overlapping_snapshots_cover_the_union() {
        with_pool("tx-union", |pool| {
            let oid = pool.alloc_atomic(256, 0, None).unwrap();
            transaction(pool, &[], |tx| {
                tx.add_range(oid, 64, 64)?;
                tx.add_range(oid, 0, 64)?; // adjacent on the left
                tx.add_range(oid, 32, 128)?; // fully covered
                tx.add_range(oid, 96, 96)?; // extends to the right

                let pool = tx.pool();
                let undo_off = current_undo_off(pool);
                let mut total = 0;
                unsafe {
                    ulog::foreach_entry(
                        undo_off,
                        |e| {
                            total += (*(e as *const UlogEntryBuf)).size;
                            true
                        },
                        pool.p_ops(),
                    );
                }
                // union of [64,128) ∪ [0,64) ∪ [32,160) ∪ [96,192) = [0,192)
                assert_eq!(total, 192);
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn tx_alloc_commits_and_aborts() {
        with_pool("tx-alloc", |pool| {
            let committed = transaction(pool, &[], |tx| tx.alloc(128, 3)).unwrap();
            assert_eq!(pool.type_num(committed), 3);
            assert!(!pool.first().is_null());

            let r: Result<Oid> = transaction(pool, &[], |tx| {
                let oid = tx.alloc(128, 4)?;
                assert!(!oid.is_null());
                Err(tx.abort(Error::Canceled))
            });
            assert!(r.is_err());

            // only the committed object remains
            let mut count = 0;
            let mut cur = pool.first();
            while !cur.is_null() {
                count += 1;
                cur = pool.next(cur);
            }
            assert_eq!(count, 1);
        });
    }

    #[test]
    fn fresh_allocations_are_never_snapshotted() {
        with_pool("tx-fresh", |pool| {
            transaction(pool, &[], |tx| {
                let oid = tx.zalloc(4096, 0)?;
                // snapshotting freshly allocated memory must not grow the log
                tx.add_range(oid, 0, 4096)?;
                let pool = tx.pool();
                let undo_off = current_undo_off(pool);
                let mut entries = 0;
                unsafe {
                    ulog::foreach_entry(undo_off, |_| { entries += 1; true }, pool.p_ops());
                }
                assert_eq!(entries, 0);
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn free_of_own_allocation_cancels_it() {
        with_pool("tx-freeown", |pool| {
            transaction(pool, &[], |tx| {
                let oid = tx.alloc(128, 0)?;
                tx.free(oid)?;
                Ok(())
            })
            .unwrap();
            assert!(pool.first().is_null());
        });
    }

    #[test]
    fn free_then_abort_keeps_the_object() {
        with_pool("tx-freeabort", |pool| {
            let oid = pool.alloc_atomic(128, 9, None).unwrap();
            let r: Result<()> = transaction(pool, &[], |tx| {
                tx.free(oid)?;
                Err(tx.abort(Error::Canceled))
            });
            assert!(r.is_err());
            assert_eq!(pool.first().off, oid.off);

            transaction(pool, &[], |tx| tx.free(oid)).unwrap();
            assert!(pool.first().is_null());
        });
    }

    #[test]
    fn realloc_aliases_and_preservation() {
        with_pool("tx-realloc", |pool| {
            // null oid allocates
            let oid = transaction(pool, &[], |tx| tx.realloc(Oid::NULL, 128, 1)).unwrap();
            let p = pool.direct(oid).unwrap();
            unsafe {
                std::ptr::copy_nonoverlapping(b"payload".as_ptr(), p, 7);
                pool.p_ops().persist(p, 7);
            }

            // growth preserves data, zrealloc zeroes the tail
            let grown = transaction(pool, &[], |tx| tx.zrealloc(oid, 600_000, 1)).unwrap();
            assert!(pool.usable_size(grown) >= 600_000);
            let gp = pool.direct(grown).unwrap();
            unsafe {
                assert_eq!(std::slice::from_raw_parts(gp, 7), b"payload");
                assert_eq!(*gp.add(599_999), 0);
            }

            // shrink keeps the prefix
            let shrunk = transaction(pool, &[], |tx| tx.realloc(grown, 1, 1)).unwrap();
            let sp = pool.direct(shrunk).unwrap();
            unsafe { assert_eq!(*sp, b'p') };

            // zero size frees
            let none = transaction(pool, &[], |tx| tx.realloc(shrunk, 0, 1)).unwrap();
            assert!(none.is_null());
            assert!(pool.first().is_null());
            assert!(pool.check().is_ok());
        });
    }

    #[test]
    fn nested_transactions_commit_together() {
        with_pool("tx-nested", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            let p = pool.direct(oid).unwrap() as *mut u64;

            transaction(pool, &[], |_outer| {
                transaction(pool, &[], |tx| {
                    tx.add_range(oid, 0, 8)?;
                    unsafe { *p = 5 };
                    Ok(())
                })
            })
            .unwrap();
            assert_eq!(unsafe { *p }, 5);
        });
    }

    #[test]
    fn inner_abort_cascades_to_outer() {
        with_pool("tx-cascade", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            let p = pool.direct(oid).unwrap() as *mut u64;
            unsafe {
                *p = 10;
                pool.p_ops().persist(p as *const u8, 8);
            }

            let r: Result<()> = transaction(pool, &[], |tx| {
                tx.add_range(oid, 0, 8)?;
                unsafe { *p = 11 };
                let inner: Result<()> =
                    transaction(pool, &[], |itx| Err(itx.abort(Error::Canceled)));
                assert!(inner.is_err());
                // the outer work stage is already doomed
                assert_eq!(stage(), TxStage::OnAbort);
                inner
            });
            assert!(r.is_err());
            assert_eq!(unsafe { *p }, 10);
        });
    }

    #[test]
    fn estimators_are_monotone_and_overflow_checked() {
        let mut prev = 0;
        for n in 0..2000 {
            let s = log_intents_max_size(n).unwrap();
            assert!(s >= prev);
            prev = s;
        }
        assert!(matches!(log_intents_max_size(usize::MAX), Err(Error::Range)));

        let a = log_snapshots_max_size(&[8, 16, 4096]).unwrap();
        let b = log_snapshots_max_size(&[8, 16, 4096, 1]).unwrap();
        assert!(b > a);
        assert!(matches!(
            log_snapshots_max_size(&[usize::MAX - 8]),
            Err(Error::Range)
        ));
    }

    #[test]
    fn user_data_roundtrip() {
        with_pool("tx-udata", |pool| {
            transaction(pool, &[], |tx| {
                assert_eq!(tx.user_data(), 0);
                tx.set_user_data(0xfeed);
                assert_eq!(tx.user_data(), 0xfeed);
                Ok(())
            })
            .unwrap();
        });
    }

    #[test]
    fn locks_are_taken_and_released() {
        with_pool("tx-locks", |pool| {
            let root = pool.root(256).unwrap();
            let base = pool.direct(root).unwrap();
            let mutex = unsafe { &*(base as *const PMutex) };
            mutex.zero(pool.p_ops());

            transaction(pool, &[TxParam::Mutex(mutex)], |_tx| Ok(())).unwrap();

            // released at end: an immediate try-lock succeeds
            mutex.try_lock(pool.run_id()).unwrap();
            mutex.unlock(pool.run_id()).unwrap();
        });
    }

    #[test]
    fn undo_restore_steps_around_held_locks() {
        with_pool("tx-lockskip", |pool| {
            let root = pool.root(256).unwrap();
            let base = pool.direct(root).unwrap();
            let mutex = unsafe { &*(base as *const PMutex) };
            mutex.zero(pool.p_ops());
            let data = unsafe { base.add(64) as *mut u64 };
            unsafe {
                *data = 77;
                pool.p_ops().persist(data as *const u8, 8);
            }

            let r: Result<()> = transaction(pool, &[TxParam::Mutex(mutex)], |tx| {
                // snapshot covers the lock cell and the data next to it
                tx.add_range(root, 0, 128)?;
                unsafe { *data = 88 };
                Err(tx.abort(Error::Canceled))
            });
            assert!(r.is_err());

            // the data rolled back, and the lock survived being inside the
            // restored range: it still works
            assert_eq!(unsafe { *data }, 77);
            mutex.try_lock(pool.run_id()).unwrap();
            mutex.unlock(pool.run_id()).unwrap();
        });
    }

    #[test]
    fn stage_callback_sees_the_whole_walk() {
        use std::sync::Mutex as StdMutex;
        lazy_static! {
            static ref STAGES: StdMutex<Vec<TxStage>> = StdMutex::new(vec![]);
        }
        fn cb(_pool: &PmemObjPool, stage: TxStage) {
            STAGES.lock().unwrap().push(stage);
        }

        with_pool("tx-callback", |pool| {
            STAGES.lock().unwrap().clear();
            transaction(pool, &[TxParam::Callback(cb)], |_| Ok(())).unwrap();
            assert_eq!(
                *STAGES.lock().unwrap(),
                vec![TxStage::Work, TxStage::OnCommit, TxStage::Finally, TxStage::None]
            );
        });
    }

    #[test]
    fn snapshot_outside_heap_is_rejected() {
        with_pool("tx-range", |pool| {
            let r: Result<()> = transaction(pool, &[], |tx| {
                tx.add_range(
                    Oid {
                        pool_uuid_lo: pool.uuid_lo(),
                        off: 8,
                    },
                    0,
                    64,
                )
            });
            assert!(matches!(r, Err(Error::Invalid(_))));
        });
    }

    #[test]
    fn zero_sized_alloc_is_invalid() {
        with_pool("tx-zeroalloc", |pool| {
            let r = transaction(pool, &[], |tx| tx.alloc(0, 0));
            assert!(matches!(r, Err(Error::Invalid(_))));
            let r = transaction(pool, &[], |tx| tx.alloc(PMEMOBJ_MAX_ALLOC_SIZE + 1, 0));
            assert!(matches!(r, Err(Error::OutOfMemory)));
        });
    }

    #[test]
    fn no_abort_flag_keeps_the_transaction_alive() {
        with_pool("tx-noabort", |pool| {
            let oid = pool.alloc_atomic(64, 0, None).unwrap();
            let p = pool.direct(oid).unwrap() as *mut u64;

            transaction(pool, &[], |tx| {
                let r = tx.xalloc(0, 0, flags::POBJ_TX_NO_ABORT);
                assert!(r.is_err());
                // still in work: the transaction goes on
                assert_eq!(tx.stage(), TxStage::Work);
                tx.add_range(oid, 0, 8)?;
                unsafe { *p = 3 };
                Ok(())
            })
            .unwrap();
            assert_eq!(unsafe { *p }, 3);
        });
    }
}
