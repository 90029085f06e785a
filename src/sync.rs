//! Persistent locks
//!
//! A lock that lives on media pairs a generation counter (`runid`) with a
//! native lock body. The body is garbage after every reopen; the first
//! access of a session rebuilds it, exactly once, through a three-state
//! protocol over the counter:
//!
//! 1. `runid == pool.run_id`: the body is live, use it.
//! 2. `runid == pool.run_id - 1`: another thread is constructing; spin.
//! 3. anything else: race a CAS to `run_id - 1`, construct the body, then
//!    advance to `run_id` (or back to zero on failure).
//!
//! The pool's `run_id` advances by two on every open, so a crashed session
//! can never leave a counter that a later session would mistake for its
//! own. Abrupt close needs no cleanup at all: the stale counter simply
//! loses.
//!
//! The counter is deliberately never flushed; its value only means
//! anything to the run that wrote it.

use crate::error::{fail, Error, Result};
use crate::pmem::PmemOps;
use crate::CACHELINE_SIZE;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

extern "C" {
    fn pthread_rwlock_timedrdlock(
        lock: *mut libc::pthread_rwlock_t,
        abs_timeout: *const libc::timespec,
    ) -> libc::c_int;
    fn pthread_rwlock_timedwrlock(
        lock: *mut libc::pthread_rwlock_t,
        abs_timeout: *const libc::timespec,
    ) -> libc::c_int;
}

/// Runs the one-shot construction protocol; returns whether this thread
/// was the initializer
unsafe fn volatile_init<F: Fn() -> Result<()>>(
    pool_run_id: u64,
    runid: &AtomicU64,
    init: F,
) -> Result<bool> {
    debug_assert!(pool_run_id >= 2 && pool_run_id % 2 == 0);
    let mut initializer = false;
    loop {
        let tmp = runid.load(Ordering::Acquire);
        if tmp == pool_run_id {
            return Ok(initializer);
        }
        if tmp == pool_run_id - 1 {
            // someone else is constructing
            std::hint::spin_loop();
            continue;
        }
        if runid
            .compare_exchange(tmp, pool_run_id - 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        initializer = true;
        if init().is_err() {
            runid.store(0, Ordering::Release);
            return fail(Error::Invalid("lock initialization failed"));
        }
        if runid
            .compare_exchange(
                pool_run_id - 1,
                pool_run_id,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return fail(Error::Invalid("lock runid advanced unexpectedly"));
        }
    }
}

fn map_pthread(r: libc::c_int) -> Result<()> {
    match r {
        0 => Ok(()),
        libc::EBUSY => fail(Error::Busy),
        libc::ETIMEDOUT => fail(Error::TimedOut),
        _ => fail(Error::Invalid("lock operation failed")),
    }
}

fn abs_timeout(rel: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let nsec = now.tv_nsec as i64 + rel.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + rel.as_secs() as libc::time_t + (nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: (nsec % 1_000_000_000) as _,
    }
}

/// A pool-resident mutex; one cache line on media
#[repr(C, align(64))]
pub struct PMutex {
    runid: u64,
    lock: UnsafeCell<libc::pthread_mutex_t>,
}

const _: () = assert!(std::mem::size_of::<PMutex>() == CACHELINE_SIZE);

unsafe impl Send for PMutex {}
unsafe impl Sync for PMutex {}

impl PMutex {
    #[inline]
    fn runid(&self) -> &AtomicU64 {
        unsafe { &*(&self.runid as *const u64 as *const AtomicU64) }
    }

    /// Marks a freshly allocated lock as never constructed
    pub fn zero(&self, p_ops: &PmemOps) {
        self.runid().store(0, Ordering::Release);
        unsafe { p_ops.persist(&self.runid as *const u64 as *const u8, 8) };
    }

    unsafe fn body(&self, run_id: u64) -> Result<*mut libc::pthread_mutex_t> {
        volatile_init(run_id, self.runid(), || {
            map_pthread(libc::pthread_mutex_init(self.lock.get(), std::ptr::null()))
        })?;
        Ok(self.lock.get())
    }

    pub fn lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_mutex_lock(self.body(run_id)?)) }
    }

    pub fn try_lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_mutex_trylock(self.body(run_id)?)) }
    }

    pub fn timed_lock(&self, run_id: u64, timeout: Duration) -> Result<()> {
        let ts = abs_timeout(timeout);
        unsafe { map_pthread(libc::pthread_mutex_timedlock(self.body(run_id)?, &ts)) }
    }

    pub fn unlock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_mutex_unlock(self.body(run_id)?)) }
    }
}

/// A pool-resident reader-writer lock; one cache line on media
#[repr(C, align(64))]
pub struct PRwlock {
    runid: u64,
    lock: UnsafeCell<libc::pthread_rwlock_t>,
}

const _: () = assert!(std::mem::size_of::<PRwlock>() == CACHELINE_SIZE);

unsafe impl Send for PRwlock {}
unsafe impl Sync for PRwlock {}

impl PRwlock {
    #[inline]
    fn runid(&self) -> &AtomicU64 {
        unsafe { &*(&self.runid as *const u64 as *const AtomicU64) }
    }

    pub fn zero(&self, p_ops: &PmemOps) {
        self.runid().store(0, Ordering::Release);
        unsafe { p_ops.persist(&self.runid as *const u64 as *const u8, 8) };
    }

    unsafe fn body(&self, run_id: u64) -> Result<*mut libc::pthread_rwlock_t> {
        volatile_init(run_id, self.runid(), || {
            map_pthread(libc::pthread_rwlock_init(self.lock.get(), std::ptr::null()))
        })?;
        Ok(self.lock.get())
    }

    pub fn read_lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_rwlock_rdlock(self.body(run_id)?)) }
    }

    pub fn write_lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_rwlock_wrlock(self.body(run_id)?)) }
    }

    pub fn try_read_lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_rwlock_tryrdlock(self.body(run_id)?)) }
    }

    pub fn try_write_lock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_rwlock_trywrlock(self.body(run_id)?)) }
    }

    pub fn timed_read_lock(&self, run_id: u64, timeout: Duration) -> Result<()> {
        let ts = abs_timeout(timeout);
        unsafe { map_pthread(pthread_rwlock_timedrdlock(self.body(run_id)?, &ts)) }
    }

    pub fn timed_write_lock(&self, run_id: u64, timeout: Duration) -> Result<()> {
        let ts = abs_timeout(timeout);
        unsafe { map_pthread(pthread_rwlock_timedwrlock(self.body(run_id)?, &ts)) }
    }

    pub fn unlock(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_rwlock_unlock(self.body(run_id)?)) }
    }
}

/// A pool-resident condition variable; one cache line on media
#[repr(C, align(64))]
pub struct PCond {
    runid: u64,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

const _: () = assert!(std::mem::size_of::<PCond>() == CACHELINE_SIZE);

unsafe impl Send for PCond {}
unsafe impl Sync for PCond {}

impl PCond {
    #[inline]
    fn runid(&self) -> &AtomicU64 {
        unsafe { &*(&self.runid as *const u64 as *const AtomicU64) }
    }

    pub fn zero(&self, p_ops: &PmemOps) {
        self.runid().store(0, Ordering::Release);
        unsafe { p_ops.persist(&self.runid as *const u64 as *const u8, 8) };
    }

    unsafe fn body(&self, run_id: u64) -> Result<*mut libc::pthread_cond_t> {
        volatile_init(run_id, self.runid(), || {
            map_pthread(libc::pthread_cond_init(self.cond.get(), std::ptr::null()))
        })?;
        Ok(self.cond.get())
    }

    /// Blocks on the condition; the mutex must be held by the caller
    pub fn wait(&self, mutex: &PMutex, run_id: u64) -> Result<()> {
        unsafe {
            let m = mutex.body(run_id)?;
            map_pthread(libc::pthread_cond_wait(self.body(run_id)?, m))
        }
    }

    pub fn timed_wait(&self, mutex: &PMutex, run_id: u64, timeout: Duration) -> Result<()> {
        let ts = abs_timeout(timeout);
        unsafe {
            let m = mutex.body(run_id)?;
            map_pthread(libc::pthread_cond_timedwait(self.body(run_id)?, m, &ts))
        }
    }

    pub fn signal(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_cond_signal(self.body(run_id)?)) }
    }

    pub fn broadcast(&self, run_id: u64) -> Result<()> {
        unsafe { map_pthread(libc::pthread_cond_broadcast(self.body(run_id)?)) }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::testbuf::TestRegion;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn mutex_at(r: &TestRegion, off: u64) -> &'static PMutex {
        unsafe { &*(r.ops().off_to_ptr(off) as *const PMutex) }
    }

    #[test]
    fn stale_body_is_rebuilt_once() {
        let r = TestRegion::new(4096);
        // garbage where the lock body would be after a reopen
        unsafe { std::ptr::write_bytes(r.ops().off_to_ptr(0), 0xcd, 64) };
        let m = mutex_at(&r, 0);
        m.zero(r.ops());

        m.lock(4).unwrap();
        assert!(matches!(m.try_lock(4), Err(Error::Busy)));
        m.unlock(4).unwrap();
        m.try_lock(4).unwrap();
        m.unlock(4).unwrap();
    }

    #[test]
    fn new_run_discards_old_body() {
        let r = TestRegion::new(4096);
        let m = mutex_at(&r, 0);
        m.zero(r.ops());
        m.lock(4).unwrap();
        // a "reopened" pool has run_id 6; the held body from run 4 is dead
        m.lock(6).unwrap();
        m.unlock(6).unwrap();
    }

    #[test]
    fn contended_increments_stay_serialized() {
        let r = Arc::new(TestRegion::new(4096));
        mutex_at(&r, 0).zero(r.ops());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut threads = vec![];
        for _ in 0..4 {
            let r = Arc::clone(&r);
            let counter = Arc::clone(&counter);
            threads.push(std::thread::spawn(move || {
                let m = mutex_at(&r, 0);
                for _ in 0..1000 {
                    m.lock(2).unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.unlock(2).unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn timed_lock_expires() {
        let r = Arc::new(TestRegion::new(4096));
        let m = mutex_at(&r, 0);
        m.zero(r.ops());
        m.lock(2).unwrap();

        let r2 = Arc::clone(&r);
        let t = std::thread::spawn(move || {
            let m = mutex_at(&r2, 0);
            m.timed_lock(2, Duration::from_millis(50))
        });
        assert!(matches!(t.join().unwrap(), Err(Error::TimedOut)));
        m.unlock(2).unwrap();
    }

    #[test]
    fn rwlock_readers_share_writers_exclude() {
        let r = TestRegion::new(4096);
        let rw = unsafe { &*(r.ops().off_to_ptr(64) as *const PRwlock) };
        rw.zero(r.ops());

        rw.read_lock(2).unwrap();
        rw.try_read_lock(2).unwrap();
        assert!(matches!(rw.try_write_lock(2), Err(Error::Busy)));
        rw.unlock(2).unwrap();
        rw.unlock(2).unwrap();

        rw.write_lock(2).unwrap();
        assert!(matches!(rw.try_read_lock(2), Err(Error::Busy)));
        rw.unlock(2).unwrap();
    }

    #[test]
    fn condvar_handoff() {
        let r = Arc::new(TestRegion::new(4096));
        let m = mutex_at(&r, 0);
        m.zero(r.ops());
        let c = unsafe { &*(r.ops().off_to_ptr(128) as *const PCond) };
        c.zero(r.ops());
        let flag = Arc::new(AtomicUsize::new(0));

        let r2 = Arc::clone(&r);
        let flag2 = Arc::clone(&flag);
        let t = std::thread::spawn(move || {
            let m = mutex_at(&r2, 0);
            let c = unsafe { &*(r2.ops().off_to_ptr(128) as *const PCond) };
            m.lock(2).unwrap();
            while flag2.load(Ordering::Acquire) == 0 {
                c.wait(m, 2).unwrap();
            }
            m.unlock(2).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        m.lock(2).unwrap();
        flag.store(1, Ordering::Release);
        c.signal(2).unwrap();
        m.unlock(2).unwrap();
        t.join().unwrap();
    }
}
