//! Lanes: per-transaction journaling slots
//!
//! Every pool carries a fixed array of lanes on media, each holding three
//! unified logs in a fixed order: a small non-extensible redo log for the
//! allocator's own operations, an extensible redo log for published
//! actions, and an extensible undo log for transactional snapshots.
//!
//! At runtime a thread acquires a lane with a single-bit spinlock and keeps
//! a per-pool affinity to it: the same lane index is tried first on every
//! acquisition, and only after repeated failures does the thread adopt a
//! new primary. Fresh threads are spread a cache line apart to keep the
//! lock words from false sharing.

use crate::critnib::Critnib;
use crate::memops::{LogType, OperationBackend, OperationContext};
use crate::pmem::{flags as mf, PmemOps};
use crate::ulog::{self, ULOG_HEADER_SIZE};
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// On-media bytes of one lane
pub const LANE_TOTAL_SIZE: usize = 3072;

/// Capacity of the allocator's internal redo log: a dozen value entries is
/// more than any single heap operation emits
pub const LANE_REDO_INTERNAL_SIZE: usize = 192;

/// Capacity of the transactional redo log (40 value entries)
pub const LANE_REDO_EXTERNAL_SIZE: usize = 640;

/// Capacity of the undo log; snapshots dominate, so it gets the rest
pub const LANE_UNDO_SIZE: usize = LANE_TOTAL_SIZE
    - LANE_REDO_INTERNAL_SIZE
    - LANE_REDO_EXTERNAL_SIZE
    - 3 * ULOG_HEADER_SIZE;

const _: [(); 2048] = [(); LANE_UNDO_SIZE];

/// Lane-index spread between threads (one cache line of lock words)
pub const LANE_JUMP: u64 = 64 / 8;

/// Failed primary acquisitions tolerated before the thread migrates
pub const LANE_PRIMARY_ATTEMPTS: i32 = 128;

/// Number of lanes in a pool
pub const OBJ_NLANES: u64 = 1024;

#[inline]
pub fn internal_off(lane_off: u64) -> u64 {
    lane_off
}

#[inline]
pub fn external_off(lane_off: u64) -> u64 {
    lane_off + (ULOG_HEADER_SIZE + LANE_REDO_INTERNAL_SIZE) as u64
}

#[inline]
pub fn undo_off(lane_off: u64) -> u64 {
    external_off(lane_off) + (ULOG_HEADER_SIZE + LANE_REDO_EXTERNAL_SIZE) as u64
}

/// One lane's runtime face: the layout position plus the three contexts
pub struct Lane {
    pub layout_off: u64,
    pub internal: OperationContext,
    pub external: OperationContext,
    pub undo: OperationContext,
}

impl Lane {
    fn new(layout_off: u64, backend: Arc<dyn OperationBackend>, p_ops: PmemOps) -> Lane {
        Lane {
            layout_off,
            internal: OperationContext::new(
                internal_off(layout_off),
                LANE_REDO_INTERNAL_SIZE,
                Arc::clone(&backend),
                false,
                p_ops,
                LogType::Redo,
            ),
            external: OperationContext::new(
                external_off(layout_off),
                LANE_REDO_EXTERNAL_SIZE,
                Arc::clone(&backend),
                true,
                p_ops,
                LogType::Redo,
            ),
            undo: OperationContext::new(
                undo_off(layout_off),
                LANE_UNDO_SIZE,
                backend,
                true,
                p_ops,
                LogType::Undo,
            ),
        }
    }
}

/// Runtime lane array and its lock words
pub struct LaneDescriptor {
    pub nlanes: u64,
    pub runtime_nlanes: u64,
    next_lane_idx: AtomicU64,
    lane_locks: Vec<AtomicU64>,
    lanes: Vec<UnsafeCell<Lane>>,
}

unsafe impl Sync for LaneDescriptor {}
unsafe impl Send for LaneDescriptor {}

impl LaneDescriptor {
    /// Builds the runtime state for every lane in the pool
    pub fn boot(
        backend: Arc<dyn OperationBackend>,
        p_ops: PmemOps,
        lanes_offset: u64,
        nlanes: u64,
        runtime_nlanes: u64,
    ) -> LaneDescriptor {
        let mut lanes = Vec::with_capacity(nlanes as usize);
        for i in 0..nlanes {
            let off = lanes_offset + i * LANE_TOTAL_SIZE as u64;
            lanes.push(UnsafeCell::new(Lane::new(off, Arc::clone(&backend), p_ops)));
        }
        LaneDescriptor {
            nlanes,
            runtime_nlanes: runtime_nlanes.max(1).min(nlanes),
            next_lane_idx: AtomicU64::new(0),
            lane_locks: (0..nlanes).map(|_| AtomicU64::new(0)).collect(),
            lanes,
        }
    }

    /// Direct access to a lane by index, for recovery and diagnostics
    ///
    /// # Safety
    /// The caller must guarantee exclusive use of the lane.
    pub unsafe fn lane_at(&self, idx: u64) -> &mut Lane {
        &mut *self.lanes[idx as usize].get()
    }
}

/// Formats the lane region: three empty logs per lane
pub unsafe fn init_data(p_ops: &PmemOps, lanes_offset: u64, nlanes: u64) {
    for i in 0..nlanes {
        let off = lanes_offset + i * LANE_TOTAL_SIZE as u64;
        ulog::construct(internal_off(off), LANE_REDO_INTERNAL_SIZE, 0, false, 0, p_ops);
        ulog::construct(external_off(off), LANE_REDO_EXTERNAL_SIZE, 0, false, 0, p_ops);
        ulog::construct(undo_off(off), LANE_UNDO_SIZE, 0, false, 0, p_ops);
    }
    p_ops.xpersist(
        p_ops.off_to_ptr(lanes_offset),
        nlanes as usize * LANE_TOTAL_SIZE,
        mf::RELAXED,
    );
    p_ops.drain();
}

/// Replays the redo logs of every lane; must run before the heap boots so
/// the allocator state is consistent
pub unsafe fn recover_redo<C: Fn(u64) -> bool>(
    p_ops: &PmemOps,
    lanes_offset: u64,
    nlanes: u64,
    check: &C,
) {
    for i in 0..nlanes {
        let off = lanes_offset + i * LANE_TOTAL_SIZE as u64;
        ulog::recover(internal_off(off), check, p_ops);
        ulog::recover(external_off(off), check, p_ops);
    }
}

/// Structural check of every lane's internal redo log
pub unsafe fn check<C: Fn(u64) -> bool>(
    p_ops: &PmemOps,
    lanes_offset: u64,
    nlanes: u64,
    check: &C,
) -> crate::error::Result<()> {
    for i in 0..nlanes {
        let off = lanes_offset + i * LANE_TOTAL_SIZE as u64;
        ulog::check(internal_off(off), check, p_ops)?;
    }
    Ok(())
}

// -- thread-affine acquisition ----------------------------------------------

struct LaneInfo {
    lane_idx: u64,
    nest_count: u64,
    primary: u64,
    primary_attempts: i32,
}

struct LaneInfoTls {
    map: Critnib<*mut LaneInfo>,
    records: Vec<Box<LaneInfo>>,
    cache: Option<(u64, *mut LaneInfo)>,
}

thread_local! {
    static LANE_INFO: RefCell<LaneInfoTls> = RefCell::new(LaneInfoTls {
        map: Critnib::new(),
        records: Vec::new(),
        cache: None,
    });
}

fn with_info<T>(uuid_lo: u64, f: impl FnOnce(&mut LaneInfo) -> T) -> T {
    LANE_INFO.with(|tls| {
        let mut tls = tls.borrow_mut();
        if let Some((uuid, p)) = tls.cache {
            if uuid == uuid_lo {
                return f(unsafe { &mut *p });
            }
        }
        let p = match tls.map.get(uuid_lo) {
            Some(p) => p,
            None => {
                let mut rec = Box::new(LaneInfo {
                    lane_idx: u64::MAX,
                    nest_count: 0,
                    primary: 0,
                    primary_attempts: LANE_PRIMARY_ATTEMPTS,
                });
                let p: *mut LaneInfo = &mut *rec;
                tls.records.push(rec);
                tls.map.insert(uuid_lo, p).unwrap();
                p
            }
        };
        tls.cache = Some((uuid_lo, p));
        f(unsafe { &mut *p })
    })
}

/// Forgets this thread's affinity record for a closing pool
pub fn info_cleanup(uuid_lo: u64) {
    LANE_INFO.with(|tls| {
        let mut tls = tls.borrow_mut();
        if let Some(p) = tls.map.remove(uuid_lo) {
            if let Some((uuid, _)) = tls.cache {
                if uuid == uuid_lo {
                    tls.cache = None;
                }
            }
            tls.records.retain(|r| {
                let rp: *const LaneInfo = &**r;
                rp != p as *const LaneInfo
            });
        }
    });
}

fn grab_lane(desc: &LaneDescriptor, info: &mut LaneInfo) {
    let nlocks = desc.runtime_nlanes;
    info.lane_idx = info.primary;
    loop {
        loop {
            info.lane_idx %= nlocks;
            let lock = &desc.lane_locks[info.lane_idx as usize];
            if lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if info.lane_idx == info.primary {
                    info.primary_attempts = LANE_PRIMARY_ATTEMPTS;
                } else if info.primary_attempts == 0 {
                    // the primary is contended; make this lane the new home
                    info.primary = info.lane_idx;
                    info.primary_attempts = LANE_PRIMARY_ATTEMPTS;
                }
                return;
            }

            if info.lane_idx == info.primary && info.primary_attempts > 0 {
                info.primary_attempts -= 1;
            }

            info.lane_idx += 1;
            if info.lane_idx >= nlocks {
                break;
            }
        }
        std::thread::yield_now();
    }
}

/// Acquires a lane index for the calling thread; reentrant per pool
pub fn hold(desc: &LaneDescriptor, uuid_lo: u64) -> u64 {
    with_info(uuid_lo, |info| {
        while info.lane_idx == u64::MAX {
            let idx = desc.next_lane_idx.fetch_add(LANE_JUMP, Ordering::Relaxed);
            info.primary = idx;
            info.lane_idx = idx;
        }
        if info.nest_count == 0 {
            grab_lane(desc, info);
        }
        info.nest_count += 1;
        info.lane_idx
    })
}

/// Acquires a lane and hands out its runtime state; on the outermost hold
/// the three operation contexts are reinitialized
///
/// # Safety
/// The returned reference is valid while the hold lasts; the caller must
/// not keep it past `release`.
pub unsafe fn hold_lane<'a>(desc: &'a LaneDescriptor, uuid_lo: u64) -> (u64, &'a mut Lane) {
    let idx = hold(desc, uuid_lo);
    let lane = desc.lane_at(idx);
    let outermost = with_info(uuid_lo, |info| info.nest_count == 1);
    if outermost {
        lane.external.init();
        lane.internal.init();
        lane.undo.init();
    }
    (idx, lane)
}

/// Drops one level of the calling thread's hold
pub fn release(desc: &LaneDescriptor, uuid_lo: u64) {
    with_info(uuid_lo, |info| {
        if info.nest_count == 0 {
            panic!("lane released more often than held");
        }
        info.nest_count -= 1;
        if info.nest_count == 0 {
            let lock = &desc.lane_locks[info.lane_idx as usize];
            if lock
                .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                panic!("lane lock corrupted");
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memops::test::MockBackend;
    use crate::util::testbuf::TestRegion;

    const LANES_OFF: u64 = 4096;
    const NLANES: u64 = 4;

    fn descriptor(r: &TestRegion) -> LaneDescriptor {
        unsafe { init_data(r.ops(), LANES_OFF, NLANES) };
        let backend = MockBackend::new(r, 256 * 1024);
        LaneDescriptor::boot(backend, *r.ops(), LANES_OFF, NLANES, NLANES)
    }

    #[test]
    fn layout_offsets_partition_the_lane() {
        assert_eq!(
            3 * ULOG_HEADER_SIZE
                + LANE_REDO_INTERNAL_SIZE
                + LANE_REDO_EXTERNAL_SIZE
                + LANE_UNDO_SIZE,
            LANE_TOTAL_SIZE
        );
        assert_eq!(undo_off(0) as usize + ULOG_HEADER_SIZE + LANE_UNDO_SIZE, LANE_TOTAL_SIZE);
    }

    #[test]
    fn init_data_leaves_empty_logs() {
        let r = TestRegion::new(512 * 1024);
        let _d = descriptor(&r);
        for i in 0..NLANES {
            let off = LANES_OFF + i * LANE_TOTAL_SIZE as u64;
            unsafe {
                assert!(ulog::is_empty(internal_off(off), r.ops()));
                assert!(ulog::is_empty(external_off(off), r.ops()));
                assert!(ulog::is_empty(undo_off(off), r.ops()));
                assert!(!ulog::recovery_needed(external_off(off), true, r.ops()));
            }
        }
        unsafe { check(r.ops(), LANES_OFF, NLANES, &|_| true).unwrap() };
    }

    #[test]
    fn nested_holds_reuse_the_lane() {
        let r = TestRegion::new(512 * 1024);
        let d = descriptor(&r);
        let uuid = 0x1111;

        let a = hold(&d, uuid);
        let b = hold(&d, uuid);
        assert_eq!(a, b);
        release(&d, uuid);
        // still held: the lock must be taken
        assert_eq!(d.lane_locks[a as usize].load(Ordering::Relaxed), 1);
        release(&d, uuid);
        assert_eq!(d.lane_locks[a as usize].load(Ordering::Relaxed), 0);

        info_cleanup(uuid);
    }

    #[test]
    fn distinct_pools_have_distinct_affinity() {
        let r = TestRegion::new(512 * 1024);
        let d = descriptor(&r);
        let a = hold(&d, 0xaaaa);
        let b = hold(&d, 0xbbbb);
        // the spread constant lands them on different indexes modulo nlanes
        assert_ne!(a, b);
        release(&d, 0xaaaa);
        release(&d, 0xbbbb);
        info_cleanup(0xaaaa);
        info_cleanup(0xbbbb);
    }

    #[test]
    #[should_panic(expected = "released more often")]
    fn release_underflow_is_fatal() {
        let r = TestRegion::new(512 * 1024);
        let d = descriptor(&r);
        let uuid = 0x2222;
        let _ = hold(&d, uuid);
        release(&d, uuid);
        release(&d, uuid);
    }

    #[test]
    fn outermost_hold_reinitializes_contexts() {
        let r = TestRegion::new(512 * 1024);
        let d = descriptor(&r);
        let uuid = 0x3333;
        unsafe {
            let (idx, lane) = hold_lane(&d, uuid);
            lane.undo.start();
            lane.undo.cancel();
            release(&d, uuid);

            let (idx2, lane2) = hold_lane(&d, uuid);
            assert_eq!(idx, idx2);
            // a fresh outermost hold finds idle, reusable contexts
            lane2.undo.start();
            lane2.undo.cancel();
            release(&d, uuid);
        }
        info_cleanup(uuid);
    }
}
