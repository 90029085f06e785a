//! *Carnelian* is a transactional object-store engine for byte-addressable
//! persistent memory. A client maps a pool file, obtains a root handle, and
//! then allocates, mutates, frees, and reserves objects with the guarantee
//! that, after any crash, the pool reopens in a state equivalent to the last
//! completed transaction.
//!
//! The engine is built from a small number of cooperating subsystems:
//!
//! * [`ulog`] — a persistent, chained, checksummed log with redo and undo
//!   modes and user-extendable storage.
//! * [`memops`] — the operation context: the in-flight transaction's
//!   journal, which accumulates entries, merges redundant writes, and drives
//!   apply and recovery.
//! * [`lane`] — a fixed pool of per-transaction journaling slots with a
//!   thread-affine acquisition scheme.
//! * [`palloc`] — reservation / publish / defer-free actions over the block
//!   heap, cooperating with the unified log.
//! * [`tx`] — nested transaction stages, snapshot-range bookkeeping, and
//!   abort/commit/finally dispatch.
//! * [`sync`] — persistent locks whose DRAM bodies are rebuilt exactly once
//!   per pool lifetime through a generation-counter protocol.
//! * [`critnib`] — the ordered index used for pool lookup by address and by
//!   UUID.
//!
//! # Example
//!
//! ```no_run
//! use carnelian::pool::ObjPool;
//!
//! let pool = ObjPool::create("foo.pool", "demo", 8 * 1024 * 1024).unwrap();
//! carnelian::tx::transaction(&pool, &[], |tx| {
//!     let oid = tx.alloc(128, 1)?;
//!     let p = pool.direct(oid).unwrap() as *mut u64;
//!     tx.add_range_direct(p as *const u8, 8)?;
//!     unsafe { *p = 42 };
//!     Ok(())
//! }).unwrap();
//! ```
//!
//! All modifications made inside the closure become visible atomically when
//! it returns `Ok`; returning `Err` (or any failing engine call, with the
//! default failure behavior) rolls every snapshotted byte back and cancels
//! every reservation.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod util;
pub mod ll;
pub mod error;
pub mod pmem;
pub mod critnib;
pub mod ulog;
pub mod memops;
pub mod lane;
pub mod heap;
pub mod palloc;
pub mod stats;
pub mod sync;
pub mod ctl;
pub mod pool;
pub mod tx;
pub mod list;


pub use error::{Error, Result};
pub use pool::{ObjPool, Oid};
pub use tx::transaction;

/// Size of a processor cache line; every on-media log structure is aligned
/// to this boundary.
pub const CACHELINE_SIZE: usize = 64;

pub(crate) const PAGE_SIZE: usize = 4096;
