//! Pool lifecycle: mapping, layout, registries, and object identity
//!
//! A pool file starts with a checksummed header and descriptor, followed by
//! the lane region and the heap. Opening a pool maps the file, validates
//! the layout, advances the run counter, replays the lanes' redo logs,
//! boots the heap, and finally rolls back any undo logs left by a crashed
//! transaction. The order matters: undo processing may free log
//! extensions, which needs a live allocator.
//!
//! Two process-wide indexes track every open pool: one keyed by UUID (for
//! OID resolution) and one keyed by base address (for pointer resolution
//! via a less-or-equal lookup).

use crate::critnib::Critnib;
use crate::ctl;
use crate::error::{fail, Error, Result};
use crate::heap::Heap;
use crate::lane::{self, LaneDescriptor, LANE_TOTAL_SIZE, OBJ_NLANES};
use crate::memops::{LogType, OperationBackend, UserBufferDef};
use crate::palloc;
use crate::pmem::PmemOps;
use crate::stats::Stats;
use crate::ulog;
use crate::util::{align_up, checksum_skip, rand64};
use crate::PAGE_SIZE;
use memmap::MmapMut;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const POOL_SIGNATURE: [u8; 8] = *b"PMEMOBJ\0";
pub const OBJ_FORMAT_MAJOR: u32 = 6;

/// Longest layout name, terminator included
pub const PMEMOBJ_MAX_LAYOUT: usize = 1024;

/// Smallest pool this format can hold (header + 1024 lanes + some heap)
pub const PMEMOBJ_MIN_POOL: u64 = 8 * 1024 * 1024;

const POOL_DESC_SIZE: usize = 2048;
const POOL_HDR_OFF: usize = 0;
const POOL_DESC_OFF: usize = 64;
const POOL_RT_OFF: usize = POOL_DESC_OFF + POOL_DESC_SIZE;
const LANES_OFFSET: u64 = PAGE_SIZE as u64;

/// A persistent object identifier: pool identity plus byte offset
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid {
    pub pool_uuid_lo: u64,
    pub off: u64,
}

impl Oid {
    pub const NULL: Oid = Oid {
        pool_uuid_lo: 0,
        off: 0,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off == 0
    }
}

#[repr(C)]
struct PoolHdr {
    signature: [u8; 8],
    major: u32,
    features: u32,
    uuid: [u8; 16],
    crtime: u64,
    unused: [u8; 16],
    checksum: u64,
}

const _: [(); 64] = [(); std::mem::size_of::<PoolHdr>()];
const HDR_CSUM_SKIP: usize = 56;

#[repr(C)]
struct PoolDesc {
    layout: [u8; PMEMOBJ_MAX_LAYOUT],
    lanes_offset: u64,
    nlanes: u64,
    heap_offset: u64,
    heap_size: u64,
    unused: [u8; POOL_DESC_SIZE - PMEMOBJ_MAX_LAYOUT - 4 * 8 - 8],
    checksum: u64,
}

const _: [(); POOL_DESC_SIZE] = [(); std::mem::size_of::<PoolDesc>()];
const DESC_CSUM_SKIP: usize = POOL_DESC_SIZE - 8;

/// Persistent but unchecksummed runtime fields
#[repr(C)]
struct PoolRt {
    root_offset: u64,
    run_id: u64,
    root_size: u64,
    conversion_flags: u64,
    curr_allocated: u64,
}

pub(crate) struct TxParams {
    pub skip_expensive_checks: AtomicBool,
    pub cache_size: AtomicU64,
}

/// Default capacity of an undo-log extension
pub const TX_DEFAULT_RANGE_CACHE_SIZE: u64 = 32 * 1024;

/// Registered user-buffer ranges, keyed by aligned start offset
pub(crate) struct UserBufTable {
    pub verify: AtomicBool,
    map: Mutex<BTreeMap<u64, usize>>,
}

impl UserBufTable {
    pub(crate) fn try_insert(&self, def: &UserBufferDef) -> Result<()> {
        if !self.verify.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut map = self.map.lock().unwrap();
        let end = def.addr_off + def.size as u64;
        if let Some((&start, &len)) = map.range(..end).next_back() {
            if start + len as u64 > def.addr_off {
                return fail(Error::Invalid("user buffer overlaps a registered one"));
            }
        }
        map.insert(def.addr_off, def.size);
        Ok(())
    }

    pub(crate) fn remove(&self, addr_off: u64) {
        if !self.verify.load(Ordering::Relaxed) {
            return;
        }
        self.map.lock().unwrap().remove(&addr_off);
    }
}

// -- process-wide registries ------------------------------------------------

lazy_static! {
    static ref POOLS_HT: Critnib<usize> = Critnib::new();
    static ref POOLS_TREE: Critnib<usize> = Critnib::new();
}

/// Bumped whenever any pool closes; invalidates the per-thread OID caches
static POOL_RUNTIME_GEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (pool_uuid_lo, runtime generation, base, len)
    static DIRECT_CACHE: Cell<[(u64, u64, usize, usize); 2]> = Cell::new([(0, 0, 0, 0); 2]);
}

/// The open pool owning `uuid_lo`, if any
pub(crate) fn pool_by_uuid(uuid_lo: u64) -> Option<&'static PmemObjPool> {
    POOLS_HT
        .get(uuid_lo)
        .map(|p| unsafe { &*(p as *const PmemObjPool) })
}

/// The open pool whose mapping contains `addr`, if any
pub(crate) fn pool_by_addr(addr: usize) -> Option<&'static PmemObjPool> {
    let (_, p) = POOLS_TREE.find_le(addr as u64)?;
    let pool = unsafe { &*(p as *const PmemObjPool) };
    if addr < pool.base as usize + pool.len {
        Some(pool)
    } else {
        None
    }
}

/// Translates an in-pool pointer to its OID; null OID if unowned
pub fn oid_of(ptr: *const u8) -> Oid {
    match pool_by_addr(ptr as usize) {
        Some(pool) => Oid {
            pool_uuid_lo: pool.uuid_lo,
            off: ptr as u64 - pool.base as u64,
        },
        None => Oid::NULL,
    }
}

/// The engine backend wired into every operation context of a pool
///
/// It lives behind an `Arc` handed to the lane contexts before the pool
/// box exists, so the pool pointer is patched in afterwards.
pub(crate) struct PoolBackend {
    pool: Cell<*const PmemObjPool>,
}

unsafe impl Send for PoolBackend {}
unsafe impl Sync for PoolBackend {}

impl PoolBackend {
    fn pool(&self) -> &PmemObjPool {
        let p = self.pool.get();
        debug_assert!(!p.is_null(), "backend used before the pool was wired");
        unsafe { &*p }
    }
}

impl OperationBackend for PoolBackend {
    fn ulog_extend(&self, next_field_off: u64, gen_num: u64, log_type: LogType) -> Result<()> {
        let pool = self.pool();
        let capacity = match log_type {
            LogType::Redo => lane::LANE_REDO_EXTERNAL_SIZE,
            LogType::Undo => pool
                .tx_params
                .cache_size
                .load(Ordering::Relaxed)
                .max(1024) as usize,
        };
        pool.atomic_ulog_alloc(capacity, gen_num, next_field_off)
    }

    fn ulog_free(&self, next_field_off: u64) {
        self.pool().atomic_ulog_free(next_field_off);
    }

    fn userbuf_insert(&self, def: &UserBufferDef) -> Result<()> {
        self.pool().user_buffers.try_insert(def)
    }

    fn userbuf_remove(&self, ulog_off: u64) {
        self.pool().user_buffers.remove(ulog_off);
    }

    fn off_is_valid(&self, off: u64) -> bool {
        self.pool().off_is_valid(off)
    }
}

/// An open pool's runtime state
pub struct PmemObjPool {
    path: PathBuf,
    mapping: Option<MmapMut>,
    base: *mut u8,
    len: usize,
    p_ops: PmemOps,

    pub(crate) uuid_lo: u64,
    run_id: u64,

    heap_offset: u64,
    heap_size: usize,

    pub(crate) heap: Heap,
    pub(crate) lanes: LaneDescriptor,
    pub(crate) stats: Arc<Stats>,
    pub(crate) user_buffers: UserBufTable,
    pub(crate) tx_params: TxParams,

    root_lock: Mutex<()>,
}

unsafe impl Send for PmemObjPool {}
unsafe impl Sync for PmemObjPool {}

/// Owning handle of an open pool; dropping it closes the pool
pub struct ObjPool {
    inner: Option<Box<PmemObjPool>>,
}

impl Deref for ObjPool {
    type Target = PmemObjPool;

    fn deref(&self) -> &PmemObjPool {
        self.inner.as_ref().unwrap()
    }
}

impl Drop for ObjPool {
    fn drop(&mut self) {
        if let Some(pool) = self.inner.take() {
            pool.close();
        }
    }
}

fn runtime_nlanes(nlanes: u64) -> u64 {
    let default = (num_cpus::get() as u64 * 4).max(64).min(nlanes);
    match std::env::var("PMEMOBJ_NLANES") {
        Ok(v) => match v.parse::<u64>() {
            Ok(n) if n > 0 => n.min(nlanes),
            _ => default,
        },
        Err(_) => default,
    }
}

impl ObjPool {
    /// Creates and formats a new pool file
    pub fn create<P: AsRef<Path>>(path: P, layout: &str, size: u64) -> Result<ObjPool> {
        if layout.as_bytes().len() >= PMEMOBJ_MAX_LAYOUT {
            return fail(Error::Invalid("layout name too long"));
        }
        if size < PMEMOBJ_MIN_POOL {
            return fail(Error::Invalid("pool size below the minimum"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        let mut mapping = unsafe { MmapMut::map_mut(&file)? };
        let base = mapping.as_mut_ptr();
        let len = mapping.len();
        let p_ops = PmemOps::for_pool(base, len);

        unsafe {
            // descriptor first, header (with its checksum) last
            let desc = &mut *(base.add(POOL_DESC_OFF) as *mut PoolDesc);
            desc.layout = [0; PMEMOBJ_MAX_LAYOUT];
            desc.layout[..layout.len()].copy_from_slice(layout.as_bytes());
            desc.lanes_offset = LANES_OFFSET;
            desc.nlanes = OBJ_NLANES;
            desc.heap_offset = align_up(
                LANES_OFFSET as usize + OBJ_NLANES as usize * LANE_TOTAL_SIZE,
                PAGE_SIZE,
            ) as u64;
            desc.heap_size = size - desc.heap_offset;
            desc.unused = [0; POOL_DESC_SIZE - PMEMOBJ_MAX_LAYOUT - 4 * 8 - 8];
            desc.checksum = checksum_skip(
                std::slice::from_raw_parts(base.add(POOL_DESC_OFF), POOL_DESC_SIZE),
                DESC_CSUM_SKIP,
            );
            p_ops.persist(base.add(POOL_DESC_OFF), POOL_DESC_SIZE);

            let rt = &mut *(base.add(POOL_RT_OFF) as *mut PoolRt);
            rt.root_offset = 0;
            rt.run_id = 0; // advanced to 2 by the common boot path
            rt.root_size = 0;
            rt.conversion_flags = 0;
            rt.curr_allocated = 0;
            p_ops.persist(base.add(POOL_RT_OFF), std::mem::size_of::<PoolRt>());

            lane::init_data(&p_ops, desc.lanes_offset, desc.nlanes);
            Heap::init(&p_ops, desc.heap_offset, desc.heap_size as usize);

            let mut uuid = [0u8; 16];
            uuid[..8].copy_from_slice(&rand64()?.to_le_bytes());
            uuid[8..].copy_from_slice(&rand64()?.to_le_bytes());

            let hdr = &mut *(base.add(POOL_HDR_OFF) as *mut PoolHdr);
            hdr.signature = POOL_SIGNATURE;
            hdr.major = OBJ_FORMAT_MAJOR;
            hdr.features = 0;
            hdr.uuid = uuid;
            hdr.crtime = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            hdr.unused = [0; 16];
            hdr.checksum = checksum_skip(
                std::slice::from_raw_parts(base.add(POOL_HDR_OFF), 64),
                HDR_CSUM_SKIP,
            );
            p_ops.persist(base, 64);
        }

        Self::boot(path.as_ref().to_path_buf(), mapping, layout)
    }

    /// Opens an existing pool, verifying format and layout name
    pub fn open<P: AsRef<Path>>(path: P, layout: &str) -> Result<ObjPool> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mapping = unsafe { MmapMut::map_mut(&file)? };
        if mapping.len() < PMEMOBJ_MIN_POOL as usize {
            return fail(Error::Corrupt("pool file truncated"));
        }
        Self::boot(path.as_ref().to_path_buf(), mapping, layout)
    }

    /// The shared path of create and open: validate, recover, register
    fn boot(path: PathBuf, mut mapping: MmapMut, layout: &str) -> Result<ObjPool> {
        let base = mapping.as_mut_ptr();
        let len = mapping.len();
        let p_ops = PmemOps::for_pool(base, len);

        let (uuid_lo, run_id, heap_offset, heap_size, nlanes, lanes_offset, curr_allocated) = unsafe {
            let hdr = &*(base.add(POOL_HDR_OFF) as *const PoolHdr);
            if hdr.signature != POOL_SIGNATURE {
                return fail(Error::Corrupt("wrong pool signature"));
            }
            if hdr.major != OBJ_FORMAT_MAJOR {
                return fail(Error::Corrupt("unsupported format version"));
            }
            let hdr_bytes = std::slice::from_raw_parts(base.add(POOL_HDR_OFF), 64);
            if checksum_skip(hdr_bytes, HDR_CSUM_SKIP) != hdr.checksum {
                return fail(Error::Corrupt("pool header checksum mismatch"));
            }

            let desc = &*(base.add(POOL_DESC_OFF) as *const PoolDesc);
            let desc_bytes = std::slice::from_raw_parts(base.add(POOL_DESC_OFF), POOL_DESC_SIZE);
            if checksum_skip(desc_bytes, DESC_CSUM_SKIP) != desc.checksum {
                return fail(Error::Corrupt("pool descriptor checksum mismatch"));
            }
            let stored = &desc.layout;
            let given = layout.as_bytes();
            let matches = given.len() < PMEMOBJ_MAX_LAYOUT
                && stored[..given.len()] == *given
                && stored[given.len()] == 0;
            if !matches {
                return fail(Error::Invalid("wrong layout name"));
            }
            if desc.lanes_offset != LANES_OFFSET
                || desc.nlanes == 0
                || desc.heap_offset + desc.heap_size != len as u64
            {
                return fail(Error::Corrupt("pool geometry mismatch"));
            }

            // every open gets a fresh, even run number
            let rt = &mut *(base.add(POOL_RT_OFF) as *mut PoolRt);
            rt.run_id += 2;
            if rt.run_id < 2 {
                rt.run_id = 2;
            }
            p_ops.persist(&rt.run_id as *const u64 as *const u8, 8);

            let mut uuid_lo: u64 = 0;
            for i in 0..8 {
                uuid_lo = (uuid_lo << 8) | (hdr.uuid[i] ^ hdr.uuid[i + 8]) as u64;
            }

            (
                uuid_lo,
                rt.run_id,
                desc.heap_offset,
                desc.heap_size as usize,
                desc.nlanes,
                desc.lanes_offset,
                rt.curr_allocated,
            )
        };

        let root_field_off = POOL_RT_OFF as u64;
        let root_size_field_off = POOL_RT_OFF as u64 + 16;
        let lanes_end = lanes_offset + nlanes * LANE_TOTAL_SIZE as u64;
        let off_ok = move |off: u64| {
            (off >= heap_offset && off < heap_offset + heap_size as u64)
                || off == root_field_off
                || off == root_size_field_off
                || (off >= lanes_offset && off < lanes_end)
        };

        // redo logs first: the heap walk must see consistent headers
        unsafe { lane::recover_redo(&p_ops, lanes_offset, nlanes, &off_ok) };

        let stats = Arc::new(Stats::new(curr_allocated as i64));
        let heap =
            unsafe { Heap::boot(p_ops, heap_offset, heap_size, Arc::clone(&stats))? };

        let backend = Arc::new(PoolBackend {
            pool: Cell::new(std::ptr::null()),
        });
        let dyn_backend: Arc<dyn OperationBackend> = backend.clone();
        let lanes = LaneDescriptor::boot(
            dyn_backend,
            p_ops,
            lanes_offset,
            nlanes,
            runtime_nlanes(nlanes),
        );

        let pool = Box::new(PmemObjPool {
            path,
            mapping: Some(mapping),
            base,
            len,
            p_ops,
            uuid_lo,
            run_id,
            heap_offset,
            heap_size,
            heap,
            lanes,
            stats,
            user_buffers: UserBufTable {
                verify: AtomicBool::new(false),
                map: Mutex::new(BTreeMap::new()),
            },
            tx_params: TxParams {
                skip_expensive_checks: AtomicBool::new(false),
                cache_size: AtomicU64::new(TX_DEFAULT_RANGE_CACHE_SIZE),
            },
            root_lock: Mutex::new(()),
        });
        backend.pool.set(&*pool as *const PmemObjPool);

        // undo logs last: rolling them back may free extensions
        for i in 0..nlanes {
            let l = unsafe { pool.lanes.lane_at(i) };
            l.undo.resume();
            l.undo.process();
            l.undo
                .finish(ulog::ULOG_INC_FIRST_GEN_NUM | ulog::ULOG_FREE_AFTER_FIRST);
        }

        ctl::load_env_config(&pool)?;

        POOLS_HT
            .insert(pool.uuid_lo, &*pool as *const PmemObjPool as usize)
            .map_err(|_| Error::Exists)?;
        POOLS_TREE
            .insert(pool.base as u64, &*pool as *const PmemObjPool as usize)
            .map_err(|_| Error::Exists)?;
        POOL_RUNTIME_GEN.fetch_add(1, Ordering::Release);

        Ok(ObjPool { inner: Some(pool) })
    }
}

impl PmemObjPool {
    #[inline]
    pub(crate) fn p_ops(&self) -> &PmemOps {
        &self.p_ops
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn uuid_lo(&self) -> u64 {
        self.uuid_lo
    }

    #[inline]
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On-media position of a lane's layout
    pub(crate) fn lane_layout_off(&self, idx: u64) -> u64 {
        LANES_OFFSET + idx * LANE_TOTAL_SIZE as u64
    }

    /// Whether `off` may appear as a log entry destination
    pub(crate) fn off_is_valid(&self, off: u64) -> bool {
        let lanes_end = LANES_OFFSET + self.lanes.nlanes * LANE_TOTAL_SIZE as u64;
        (off >= self.heap_offset && off < self.heap_offset + self.heap_size as u64)
            || off == POOL_RT_OFF as u64
            || off == POOL_RT_OFF as u64 + 16
            || (off >= LANES_OFFSET && off < lanes_end)
    }

    /// Whether `[off, off + size)` lies inside the heap area
    pub(crate) fn off_in_heap(&self, off: u64, size: usize) -> bool {
        off >= self.heap_offset
            && off + size as u64 <= self.heap_offset + self.heap_size as u64
    }

    // -- object identity ----------------------------------------------------

    /// Translates an OID to a pointer, `None` for null or foreign OIDs
    ///
    /// A two-slot per-thread cache keyed by pool identity and a global
    /// close counter makes the common case a pair of compares.
    pub fn direct(&self, oid: Oid) -> Option<*mut u8> {
        if oid.is_null() {
            return None;
        }
        let gen = POOL_RUNTIME_GEN.load(Ordering::Acquire);
        let (base, len) = DIRECT_CACHE.with(|c| {
            let mut slots = c.get();
            for s in slots.iter() {
                if s.0 == oid.pool_uuid_lo && s.1 == gen {
                    return Some((s.2, s.3));
                }
            }
            let pool = pool_by_uuid(oid.pool_uuid_lo)?;
            slots[1] = slots[0];
            slots[0] = (oid.pool_uuid_lo, gen, pool.base as usize, pool.len);
            c.set(slots);
            Some((pool.base as usize, pool.len))
        })?;
        if oid.off as usize >= len {
            return None;
        }
        Some((base + oid.off as usize) as *mut u8)
    }

    /// The OID of an in-pool pointer; null OID for foreign pointers
    pub fn oid(&self, ptr: *const u8) -> Oid {
        oid_of(ptr)
    }

    // -- atomic allocation --------------------------------------------------

    /// Allocates and publishes an object in one self-contained operation
    pub fn alloc_atomic(
        &self,
        size: usize,
        type_num: u64,
        constructor: Option<&mut dyn FnMut(*mut u8, usize)>,
    ) -> Result<Oid> {
        let idx = lane::hold(&self.lanes, self.uuid_lo);
        let result = (|| {
            let act = palloc::reserve(&self.heap, size, constructor, type_num, false, 0, 0)?;
            let lane = unsafe { self.lanes.lane_at(idx) };
            lane.internal.start();
            if let Err(e) = palloc::publish(&self.heap, &[act], &mut lane.internal) {
                lane.internal.cancel();
                palloc::cancel(&self.heap, &[act]);
                return Err(e);
            }
            Ok(Oid {
                pool_uuid_lo: self.uuid_lo,
                off: act.payload_off().unwrap(),
            })
        })();
        lane::release(&self.lanes, self.uuid_lo);
        result
    }

    /// Frees an object in one self-contained operation
    pub fn free_atomic(&self, oid: Oid) -> Result<()> {
        if oid.is_null() {
            return Ok(());
        }
        if oid.pool_uuid_lo != self.uuid_lo {
            return fail(Error::Invalid("OID belongs to a different pool"));
        }
        let idx = lane::hold(&self.lanes, self.uuid_lo);
        let result = (|| {
            let act = palloc::defer_free(&self.heap, oid.off)?;
            let lane = unsafe { self.lanes.lane_at(idx) };
            lane.internal.start();
            if let Err(e) = palloc::publish(&self.heap, &[act], &mut lane.internal) {
                lane.internal.cancel();
                return Err(e);
            }
            Ok(())
        })();
        lane::release(&self.lanes, self.uuid_lo);
        result
    }

    /// Allocates a ulog extension and links it at `next_field_off`, all in
    /// one published operation
    pub(crate) fn atomic_ulog_alloc(
        &self,
        capacity: usize,
        gen_num: u64,
        next_field_off: u64,
    ) -> Result<()> {
        let size = ulog::aligned_extension_size(capacity);
        let p_ops = self.p_ops;
        let idx = lane::hold(&self.lanes, self.uuid_lo);
        let result = (|| {
            let mut ctor = |ptr: *mut u8, _usable: usize| unsafe {
                ulog::construct(p_ops.ptr_to_off(ptr), capacity, gen_num, true, 0, &p_ops);
            };
            let act = palloc::reserve(&self.heap, size, Some(&mut ctor), 0, true, 0, 0)?;
            let link = palloc::set_value(next_field_off, act.payload_off().unwrap());
            let lane = unsafe { self.lanes.lane_at(idx) };
            lane.internal.start();
            if let Err(e) = palloc::publish(&self.heap, &[act, link], &mut lane.internal) {
                lane.internal.cancel();
                palloc::cancel(&self.heap, &[act]);
                return Err(e);
            }
            Ok(())
        })();
        lane::release(&self.lanes, self.uuid_lo);
        result
    }

    /// Frees the ulog extension linked at `next_field_off` and zeroes the
    /// link, atomically
    pub(crate) fn atomic_ulog_free(&self, next_field_off: u64) {
        let payload_off = unsafe { *(self.p_ops.off_to_ptr(next_field_off) as *const u64) };
        if payload_off == 0 {
            return;
        }
        let idx = lane::hold(&self.lanes, self.uuid_lo);
        let r = (|| -> Result<()> {
            let free = palloc::defer_free(&self.heap, payload_off)?;
            let unlink = palloc::set_value(next_field_off, 0);
            let lane = unsafe { self.lanes.lane_at(idx) };
            lane.internal.start();
            if let Err(e) = palloc::publish(&self.heap, &[free, unlink], &mut lane.internal) {
                lane.internal.cancel();
                return Err(e);
            }
            Ok(())
        })();
        lane::release(&self.lanes, self.uuid_lo);
        if r.is_err() {
            panic!("cannot release a log extension: media state inconsistent");
        }
    }

    // -- root object --------------------------------------------------------

    /// Returns the pool's singleton root object, creating or growing it to
    /// at least `size` bytes; fresh bytes read as zero
    pub fn root(&self, size: usize) -> Result<Oid> {
        let _guard = self.root_lock.lock().unwrap();
        let rt = unsafe { &mut *(self.base.add(POOL_RT_OFF) as *mut PoolRt) };

        if size == 0 {
            return if rt.root_offset == 0 {
                Ok(Oid::NULL)
            } else {
                Ok(Oid {
                    pool_uuid_lo: self.uuid_lo,
                    off: rt.root_offset,
                })
            };
        }

        if rt.root_offset != 0 && size <= rt.root_size as usize {
            return Ok(Oid {
                pool_uuid_lo: self.uuid_lo,
                off: rt.root_offset,
            });
        }

        let old_off = rt.root_offset;
        let old_size = rt.root_size as usize;
        let base = self.base;

        let idx = lane::hold(&self.lanes, self.uuid_lo);
        let result = (|| {
            let mut ctor = |ptr: *mut u8, usable: usize| unsafe {
                std::ptr::write_bytes(ptr, 0, usable);
                if old_off != 0 {
                    std::ptr::copy_nonoverlapping(base.add(old_off as usize), ptr, old_size);
                }
                self.p_ops.persist(ptr, usable);
            };
            let act = palloc::reserve(&self.heap, size, Some(&mut ctor), 0, true, 0, 0)?;
            let new_off = act.payload_off().unwrap();

            let mut actions = vec![
                act,
                palloc::set_value(POOL_RT_OFF as u64, new_off),
                palloc::set_value(POOL_RT_OFF as u64 + 16, size as u64),
            ];
            if old_off != 0 {
                actions.push(palloc::defer_free(&self.heap, old_off)?);
            }

            let lane = unsafe { self.lanes.lane_at(idx) };
            lane.internal.start();
            if let Err(e) = palloc::publish(&self.heap, &actions, &mut lane.internal) {
                lane.internal.cancel();
                palloc::cancel(&self.heap, &actions);
                return Err(e);
            }
            Ok(Oid {
                pool_uuid_lo: self.uuid_lo,
                off: new_off,
            })
        })();
        lane::release(&self.lanes, self.uuid_lo);
        result
    }

    /// Size of the root object; zero when none was ever allocated
    pub fn root_size(&self) -> usize {
        let rt = unsafe { &*(self.base.add(POOL_RT_OFF) as *const PoolRt) };
        rt.root_size as usize
    }

    // -- iteration and queries ----------------------------------------------

    /// First client object in address order
    pub fn first(&self) -> Oid {
        match self.heap.first() {
            Some(off) => Oid {
                pool_uuid_lo: self.uuid_lo,
                off,
            },
            None => Oid::NULL,
        }
    }

    /// Object following `oid` in address order
    pub fn next(&self, oid: Oid) -> Oid {
        if oid.is_null() || oid.pool_uuid_lo != self.uuid_lo {
            return Oid::NULL;
        }
        match self.heap.next(oid.off) {
            Some(off) => Oid {
                pool_uuid_lo: self.uuid_lo,
                off,
            },
            None => Oid::NULL,
        }
    }

    pub fn usable_size(&self, oid: Oid) -> usize {
        self.heap.usable_size(oid.off)
    }

    /// The type number recorded at allocation
    pub fn type_num(&self, oid: Oid) -> u64 {
        self.heap.extra(oid.off)
    }

    // -- control ------------------------------------------------------------

    pub fn ctl_get(&self, name: &str) -> Result<ctl::CtlValue> {
        ctl::get(self, name)
    }

    pub fn ctl_set(&self, name: &str, arg: ctl::CtlValue) -> Result<()> {
        ctl::set(self, name, arg)
    }

    pub fn ctl_exec(&self, name: &str, arg: ctl::CtlValue) -> Result<()> {
        ctl::exec(self, name, arg)
    }

    // -- consistency ---------------------------------------------------------

    /// Structural check of the header, descriptor, lanes, and heap
    pub fn check(&self) -> Result<()> {
        unsafe {
            let hdr_bytes = std::slice::from_raw_parts(self.base, 64);
            let hdr = &*(self.base as *const PoolHdr);
            if checksum_skip(hdr_bytes, HDR_CSUM_SKIP) != hdr.checksum {
                return fail(Error::Corrupt("pool header checksum mismatch"));
            }
            let desc_bytes =
                std::slice::from_raw_parts(self.base.add(POOL_DESC_OFF), POOL_DESC_SIZE);
            let desc = &*(self.base.add(POOL_DESC_OFF) as *const PoolDesc);
            if checksum_skip(desc_bytes, DESC_CSUM_SKIP) != desc.checksum {
                return fail(Error::Corrupt("pool descriptor checksum mismatch"));
            }
            let off_ok = |off: u64| self.off_is_valid(off);
            lane::check(&self.p_ops, LANES_OFFSET, self.lanes.nlanes, &off_ok)?;
        }
        self.heap.check()
    }

    fn close(mut self: Box<Self>) {
        // write back the persistent allocation counter
        unsafe {
            let rt = &mut *(self.base.add(POOL_RT_OFF) as *mut PoolRt);
            rt.curr_allocated = self.stats.curr_allocated.load(Ordering::Relaxed).max(0) as u64;
            self.p_ops
                .persist(&rt.curr_allocated as *const u64 as *const u8, 8);
        }

        POOLS_HT.remove(self.uuid_lo);
        POOLS_TREE.remove(self.base as u64);
        POOL_RUNTIME_GEN.fetch_add(1, Ordering::Release);
        lane::info_cleanup(self.uuid_lo);

        self.mapping.take(); // unmap last
    }
}
