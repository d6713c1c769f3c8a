//! Memory substrate for concurrent lock-free data structures
//!
//! Lock-free lists, hash tables, and skip lists cannot free an unlinked
//! node the moment it disappears from the structure: another thread may
//! still be holding a raw reference it picked up before the unlink became
//! visible. `smrmem` provides the usual answer (per-thread bump
//! allocation plus epoch-based safe memory reclamation) in the style of
//! the `ssmem` allocator that ships with ASCYLIB: freed objects sit in
//! batches until a per-thread version-counter scheme proves that every
//! thread has quiesced, then circulate back through allocation.
//!
//! Allocators are strictly thread-owned (allocate and free happen on the
//! owning thread; no hazard pointers, no cross-thread free). Each
//! allocator can draw its memory from DRAM or from a process-wide
//! persistent-memory pool, so persistent data structures get the same
//! reclamation discipline; see [backend::Tier] and [backend::pmem_pool_init].
//!
//! Explicit instances via [SmrAllocator]; or use the thread-local
//! per-tier instances behind [alloc]/[free]/[release]/[term].

pub mod allocator;
pub mod backend;
pub mod timestamp;

mod loom_testing;
mod util;

pub use allocator::{
    alloc, free, release, term, AllocConfig, SmrAllocator, TsIncr, DEFAULT_MEM_SIZE,
    GC_FREE_SET_SIZE, GC_RLSE_SET_SIZE, MEM_SIZE_MAX,
};
pub use backend::{pmem_pool_init, BackendError, Tier};
pub use timestamp::{thread_slot_id, ts_next};
