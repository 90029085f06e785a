//! Atomic persistent doubly-linked lists
//!
//! An intrusive, circular list whose links live inside the objects at a
//! caller-fixed offset. Every operation — insert, remove, move, and the
//! allocate-and-insert combination — is one redo-log publish that updates
//! at most a few object link fields plus the head, so a crash either
//! leaves the list untouched or fully adjusted.
//!
//! These are standalone atomic operations serialized by the per-head lock;
//! they are not meant to run inside an open transaction on the same
//! thread, which would contend for the lane's redo log.

use crate::error::{fail, Error, Result};
use crate::lane;
use crate::memops::OperationContext;
use crate::palloc;
use crate::pool::{Oid, PmemObjPool};
use crate::sync::PMutex;
use crate::ulog::{UlogOp, ENTRY_VAL_SIZE};

/// Links embedded in every list element
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ListEntry {
    pub pe_next: Oid,
    pub pe_prev: Oid,
}

/// A list head: the first element and the lock serializing mutations
#[repr(C, align(64))]
pub struct ListHead {
    pub pe_first: Oid,
    lock: PMutex,
}

const _: [(); 128] = [(); std::mem::size_of::<ListHead>()];

impl ListHead {
    /// Prepares a freshly allocated head for use
    pub fn init(&self, pool: &PmemObjPool) {
        self.lock.zero(pool.p_ops());
    }
}

#[inline]
unsafe fn head_at<'a>(pool: &PmemObjPool, head_off: u64) -> &'a ListHead {
    &*(pool.p_ops().off_to_ptr(head_off) as *const ListHead)
}

#[inline]
unsafe fn entry_at<'a>(pool: &PmemObjPool, pe_offset: usize, oid: Oid) -> &'a ListEntry {
    &*(pool.p_ops().off_to_ptr(oid.off + pe_offset as u64) as *const ListEntry)
}

/// Queues two redo entries writing an OID-sized field
fn log_oid(ctx: &mut OperationContext, field_off: u64, value: Oid) -> Result<()> {
    ctx.add_entry_off(field_off, value.pool_uuid_lo, UlogOp::Set)?;
    ctx.add_entry_off(field_off + 8, value.off, UlogOp::Set)
}

#[inline]
fn next_field(pe_offset: usize, oid: Oid) -> u64 {
    oid.off + pe_offset as u64
}

#[inline]
fn prev_field(pe_offset: usize, oid: Oid) -> u64 {
    oid.off + pe_offset as u64 + 16
}

struct LinkPlan {
    prev: Oid,
    next: Oid,
    set_head: bool,
}

/// Decides the neighbors of an element inserted relative to `dest`
unsafe fn plan_insert(
    pool: &PmemObjPool,
    pe_offset: usize,
    head: &ListHead,
    dest: Oid,
    before: bool,
) -> LinkPlan {
    let first = head.pe_first;
    if first.is_null() {
        return LinkPlan {
            prev: Oid::NULL,
            next: Oid::NULL,
            set_head: true,
        };
    }
    if dest.is_null() {
        // the boundary: the list is circular, so both the front and the
        // back splice between the last element and the first; only the
        // head pointer decides which one it was
        let prev = entry_at(pool, pe_offset, first).pe_prev;
        return LinkPlan {
            prev,
            next: first,
            set_head: before,
        };
    }

    if before {
        let prev = entry_at(pool, pe_offset, dest).pe_prev;
        LinkPlan {
            prev,
            next: dest,
            set_head: dest == head.pe_first,
        }
    } else {
        let next = entry_at(pool, pe_offset, dest).pe_next;
        LinkPlan {
            prev: dest,
            next,
            set_head: false,
        }
    }
}

/// Emits the link updates around a fully planned insertion of `oid`
unsafe fn publish_insert(
    pool: &PmemObjPool,
    ctx: &mut OperationContext,
    pe_offset: usize,
    head_off: u64,
    plan: &LinkPlan,
    oid: Oid,
    link_via_log: bool,
) -> Result<()> {
    let (my_next, my_prev) = if plan.next.is_null() {
        // empty list: the element becomes its own neighborhood
        (oid, oid)
    } else {
        (plan.next, plan.prev)
    };

    if link_via_log {
        log_oid(ctx, next_field(pe_offset, oid), my_next)?;
        log_oid(ctx, prev_field(pe_offset, oid), my_prev)?;
    } else {
        // the object is not yet visible; plain stores suffice
        let e = pool.p_ops().off_to_ptr(oid.off + pe_offset as u64) as *mut ListEntry;
        (*e).pe_next = my_next;
        (*e).pe_prev = my_prev;
        pool.p_ops()
            .persist(e as *const u8, std::mem::size_of::<ListEntry>());
    }

    if plan.next.is_null() {
        log_oid(ctx, head_off, oid)?;
    } else {
        log_oid(ctx, next_field(pe_offset, plan.prev), oid)?;
        log_oid(ctx, prev_field(pe_offset, plan.next), oid)?;
        if plan.set_head {
            log_oid(ctx, head_off, oid)?;
        }
    }
    Ok(())
}

fn with_locked_head<T>(
    pool: &PmemObjPool,
    head_off: u64,
    f: impl FnOnce(&ListHead, &mut OperationContext) -> Result<T>,
) -> Result<T> {
    let head = unsafe { head_at(pool, head_off) };
    head.lock.lock(pool.run_id())?;

    let idx = lane::hold(&pool.lanes, pool.uuid_lo());
    let lane = unsafe { pool.lanes.lane_at(idx) };
    lane.external.start();

    let r = f(head, &mut lane.external);
    if r.is_err() {
        lane.external.cancel();
    }

    lane::release(&pool.lanes, pool.uuid_lo());
    let _ = head.lock.unlock(pool.run_id());
    r
}

/// Inserts an existing object into the list
///
/// With a null `dest`, `before` selects the front or the back; otherwise
/// the element lands before or after `dest`.
pub fn insert(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_off: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
) -> Result<()> {
    if oid.is_null() || oid.pool_uuid_lo != pool.uuid_lo() {
        return fail(Error::Invalid("cannot insert a foreign object"));
    }
    with_locked_head(pool, head_off, |head, ctx| {
        let plan = unsafe { plan_insert(pool, pe_offset, head, dest, before) };
        ctx.reserve(10 * ENTRY_VAL_SIZE)?;
        unsafe { publish_insert(pool, ctx, pe_offset, head_off, &plan, oid, true)? };
        ctx.process();
        ctx.finish(0);
        Ok(())
    })
}

/// Allocates an object and inserts it, visible only as one unit
pub fn insert_new(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_off: u64,
    dest: Oid,
    before: bool,
    size: usize,
    type_num: u64,
    constructor: Option<&mut dyn FnMut(*mut u8, usize)>,
) -> Result<Oid> {
    with_locked_head(pool, head_off, |head, ctx| {
        let act = palloc::reserve(&pool.heap, size, constructor, type_num, false, 0, 0)?;
        let oid = Oid {
            pool_uuid_lo: pool.uuid_lo(),
            off: act.payload_off().unwrap(),
        };

        let plan = unsafe { plan_insert(pool, pe_offset, head, dest, before) };
        let r = (|| {
            ctx.reserve(7 * ENTRY_VAL_SIZE)?;
            let (off, value) = match &act {
                palloc::PobjAction::Alloc { block, .. } => {
                    pool.heap.publish_alloc_value(block, false)
                }
                _ => unreachable!(),
            };
            ctx.add_entry_off(off, value, UlogOp::Set)?;
            unsafe { publish_insert(pool, ctx, pe_offset, head_off, &plan, oid, false) }
        })();
        if let Err(e) = r {
            palloc::cancel(&pool.heap, &[act]);
            return Err(e);
        }

        ctx.process();
        if let palloc::PobjAction::Alloc { block, .. } = &act {
            pool.heap.on_alloc_committed(block);
        }
        ctx.finish(0);
        Ok(oid)
    })
}

/// Unlinks an object; with `free`, its storage is retired in the same
/// atomic publish
pub fn remove(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_off: u64,
    oid: Oid,
    free: bool,
) -> Result<()> {
    if oid.is_null() || oid.pool_uuid_lo != pool.uuid_lo() {
        return fail(Error::Invalid("cannot remove a foreign object"));
    }
    with_locked_head(pool, head_off, |head, ctx| {
        let e = unsafe { entry_at(pool, pe_offset, oid) };
        let (next, prev) = (e.pe_next, e.pe_prev);

        ctx.reserve(8 * ENTRY_VAL_SIZE)?;

        let free_act = if free {
            Some(palloc::defer_free(&pool.heap, oid.off)?)
        } else {
            None
        };

        if next == oid {
            // the only element
            log_oid(ctx, head_off, Oid::NULL)?;
        } else {
            log_oid(ctx, next_field(pe_offset, prev), next)?;
            log_oid(ctx, prev_field(pe_offset, next), prev)?;
            if head.pe_first == oid {
                log_oid(ctx, head_off, next)?;
            }
        }
        if let Some(act) = &free_act {
            if let palloc::PobjAction::Free { block_off } = act {
                let (off, value) = pool.heap.publish_free_value(*block_off);
                ctx.add_entry_off(off, value, UlogOp::Set)?;
            }
        }

        ctx.process();
        if let Some(palloc::PobjAction::Free { block_off }) = free_act {
            pool.heap.on_free_committed(block_off);
        }
        ctx.finish(0);
        Ok(())
    })
}

/// Moves an object between two lists in one atomic publish
///
/// Both head locks are taken in address order, so concurrent movers can
/// never deadlock against each other.
pub fn move_element(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_old_off: u64,
    head_new_off: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
) -> Result<()> {
    if head_old_off == head_new_off {
        return insert_after_remove_same(pool, pe_offset, head_old_off, dest, before, oid);
    }
    if oid.is_null() || oid.pool_uuid_lo != pool.uuid_lo() {
        return fail(Error::Invalid("cannot move a foreign object"));
    }

    let (first_off, second_off) = if head_old_off < head_new_off {
        (head_old_off, head_new_off)
    } else {
        (head_new_off, head_old_off)
    };
    let first = unsafe { head_at(pool, first_off) };
    let second = unsafe { head_at(pool, second_off) };
    first.lock.lock(pool.run_id())?;
    if let Err(e) = second.lock.lock(pool.run_id()) {
        let _ = first.lock.unlock(pool.run_id());
        return Err(e);
    }

    let idx = lane::hold(&pool.lanes, pool.uuid_lo());
    let lane = unsafe { pool.lanes.lane_at(idx) };
    lane.external.start();

    let r = (|| {
        let old_head = unsafe { head_at(pool, head_old_off) };
        let new_head = unsafe { head_at(pool, head_new_off) };
        let ctx = &mut lane.external;
        ctx.reserve(18 * ENTRY_VAL_SIZE)?;

        // unlink from the old neighborhood
        let e = unsafe { entry_at(pool, pe_offset, oid) };
        let (next, prev) = (e.pe_next, e.pe_prev);
        if next == oid {
            log_oid(ctx, head_old_off, Oid::NULL)?;
        } else {
            log_oid(ctx, next_field(pe_offset, prev), next)?;
            log_oid(ctx, prev_field(pe_offset, next), prev)?;
            if old_head.pe_first == oid {
                log_oid(ctx, head_old_off, next)?;
            }
        }

        // link into the new one; the element's own links go through the
        // log too, it stays reachable from the old list until commit
        let plan = unsafe { plan_insert(pool, pe_offset, new_head, dest, before) };
        unsafe { publish_insert(pool, ctx, pe_offset, head_new_off, &plan, oid, true) }
    })();

    match r {
        Ok(()) => {
            lane.external.process();
            lane.external.finish(0);
        }
        Err(_) => lane.external.cancel(),
    }

    lane::release(&pool.lanes, pool.uuid_lo());
    let _ = second.lock.unlock(pool.run_id());
    let _ = first.lock.unlock(pool.run_id());
    r
}

/// Repositioning within one list runs as two atomic steps: the element is
/// unlinked first, then reinserted at its destination
fn insert_after_remove_same(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_off: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
) -> Result<()> {
    if oid.is_null() || oid.pool_uuid_lo != pool.uuid_lo() {
        return fail(Error::Invalid("cannot move a foreign object"));
    }
    if dest == oid {
        return Ok(());
    }
    remove(pool, pe_offset, head_off, oid, false)?;
    insert(pool, pe_offset, head_off, dest, before, oid)
}

/// Walks the list front to back
pub fn foreach(
    pool: &PmemObjPool,
    pe_offset: usize,
    head_off: u64,
    mut f: impl FnMut(Oid),
) {
    let head = unsafe { head_at(pool, head_off) };
    let first = head.pe_first;
    if first.is_null() {
        return;
    }
    let mut cur = first;
    loop {
        f(cur);
        cur = unsafe { entry_at(pool, pe_offset, cur) }.pe_next;
        if cur == first {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::test::pool_path;
    use crate::pool::{ObjPool, PMEMOBJ_MIN_POOL};

    // test objects embed their links first, then a value
    const PE_OFFSET: usize = 0;
    const VALUE_OFFSET: usize = 32;

    struct Fixture {
        pool: ObjPool,
        head_off: u64,
        head2_off: u64,
        path: std::path::PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn fixture(name: &str) -> Fixture {
        let path = pool_path(name);
        let pool = ObjPool::create(&path, "list-test", PMEMOBJ_MIN_POOL).unwrap();
        let root = pool.root(2 * std::mem::size_of::<ListHead>()).unwrap();
        let head_off = root.off;
        let head2_off = root.off + std::mem::size_of::<ListHead>() as u64;
        unsafe {
            head_at(&pool, head_off).init(&pool);
            head_at(&pool, head2_off).init(&pool);
        }
        Fixture {
            pool,
            head_off,
            head2_off,
            path,
        }
    }

    fn push_value(fx: &Fixture, head_off: u64, v: u64, front: bool) -> Oid {
        let mut ctor = move |p: *mut u8, _n: usize| unsafe {
            *(p.add(VALUE_OFFSET) as *mut u64) = v;
        };
        insert_new(
            &fx.pool,
            PE_OFFSET,
            head_off,
            Oid::NULL,
            front,
            64,
            1,
            Some(&mut ctor),
        )
        .unwrap()
    }

    fn values(fx: &Fixture, head_off: u64) -> Vec<u64> {
        let mut out = vec![];
        foreach(&fx.pool, PE_OFFSET, head_off, |oid| {
            let p = fx.pool.direct(oid).unwrap();
            out.push(unsafe { *(p.add(VALUE_OFFSET) as *const u64) });
        });
        out
    }

    #[test]
    fn push_front_and_back_order() {
        let fx = fixture("list-order");
        push_value(&fx, fx.head_off, 2, false);
        push_value(&fx, fx.head_off, 1, true);
        push_value(&fx, fx.head_off, 3, false);
        assert_eq!(values(&fx, fx.head_off), vec![1, 2, 3]);
    }

    #[test]
    fn insert_relative_to_destination() {
        let fx = fixture("list-dest");
        let a = push_value(&fx, fx.head_off, 10, false);
        let _b = push_value(&fx, fx.head_off, 30, false);

        let mut ctor = |p: *mut u8, _n: usize| unsafe {
            *(p.add(VALUE_OFFSET) as *mut u64) = 20;
        };
        insert_new(
            &fx.pool,
            PE_OFFSET,
            fx.head_off,
            a,
            false, // after a
            64,
            1,
            Some(&mut ctor),
        )
        .unwrap();
        assert_eq!(values(&fx, fx.head_off), vec![10, 20, 30]);
    }

    #[test]
    fn remove_first_middle_only() {
        let fx = fixture("list-remove");
        let a = push_value(&fx, fx.head_off, 1, false);
        let b = push_value(&fx, fx.head_off, 2, false);
        let c = push_value(&fx, fx.head_off, 3, false);

        remove(&fx.pool, PE_OFFSET, fx.head_off, b, false).unwrap();
        assert_eq!(values(&fx, fx.head_off), vec![1, 3]);

        remove(&fx.pool, PE_OFFSET, fx.head_off, a, true).unwrap();
        assert_eq!(values(&fx, fx.head_off), vec![3]);

        remove(&fx.pool, PE_OFFSET, fx.head_off, c, true).unwrap();
        assert!(values(&fx, fx.head_off).is_empty());
        unsafe {
            assert!(head_at(&fx.pool, fx.head_off).pe_first.is_null());
        }
    }

    #[test]
    fn remove_free_retires_storage() {
        let fx = fixture("list-free");
        let a = push_value(&fx, fx.head_off, 1, false);
        assert!(fx.pool.heap.is_allocated(a.off));
        remove(&fx.pool, PE_OFFSET, fx.head_off, a, true).unwrap();
        assert!(!fx.pool.heap.is_allocated(a.off));
    }

    #[test]
    fn move_between_lists() {
        let fx = fixture("list-move");
        let a = push_value(&fx, fx.head_off, 1, false);
        push_value(&fx, fx.head_off, 2, false);
        push_value(&fx, fx.head2_off, 9, false);

        move_element(
            &fx.pool,
            PE_OFFSET,
            fx.head_off,
            fx.head2_off,
            Oid::NULL,
            false,
            a,
        )
        .unwrap();
        assert_eq!(values(&fx, fx.head_off), vec![2]);
        assert_eq!(values(&fx, fx.head2_off), vec![9, 1]);
    }

    #[test]
    fn reposition_within_one_list() {
        let fx = fixture("list-repos");
        let a = push_value(&fx, fx.head_off, 1, false);
        push_value(&fx, fx.head_off, 2, false);
        push_value(&fx, fx.head_off, 3, false);

        // move the front element to the back
        move_element(
            &fx.pool,
            PE_OFFSET,
            fx.head_off,
            fx.head_off,
            Oid::NULL,
            false,
            a,
        )
        .unwrap();
        assert_eq!(values(&fx, fx.head_off), vec![2, 3, 1]);
    }

    #[test]
    fn survives_reopen() {
        let path = pool_path("list-reopen");
        let head_off;
        {
            let pool = ObjPool::create(&path, "list-test", PMEMOBJ_MIN_POOL).unwrap();
            let root = pool.root(std::mem::size_of::<ListHead>()).unwrap();
            head_off = root.off;
            unsafe { head_at(&pool, head_off).init(&pool) };
            for v in 1..=3u64 {
                let mut ctor = move |p: *mut u8, _n: usize| unsafe {
                    *(p.add(VALUE_OFFSET) as *mut u64) = v;
                };
                insert_new(&pool, PE_OFFSET, head_off, Oid::NULL, false, 64, 1, Some(&mut ctor))
                    .unwrap();
            }
        }
        {
            let pool = ObjPool::open(&path, "list-test").unwrap();
            unsafe { head_at(&pool, head_off).init(&pool) };
            let mut out = vec![];
            foreach(&pool, PE_OFFSET, head_off, |oid| {
                let p = pool.direct(oid).unwrap();
                out.push(unsafe { *(p.add(VALUE_OFFSET) as *const u64) });
            });
            assert_eq!(out, vec![1, 2, 3]);
        }
        std::fs::remove_file(&path).unwrap();
    }
}
