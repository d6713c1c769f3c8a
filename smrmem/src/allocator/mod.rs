//! Per-thread bump allocator with epoch-based safe memory reclamation
//!
//! This follows the shape of the quiescence-based object allocators that
//! back lock-free search structures (ASCYLIB's `ssmem` is the best-known
//! one): each thread owns an allocator instance outright, allocation is a
//! bump pointer over a chain of backend chunks, and `free` never hands
//! memory back directly. Freed pointers are batched into a fixed-capacity
//! *free-set*; when a set fills it is sealed with a [Snapshot] of every
//! registered thread's version counter. A sealed set whose successor's
//! snapshot it strictly exceeds (every thread advanced at least once in
//! between) is *collected*, and its pointers are served again before the
//! bump pointer is touched. Emptied containers park on an *available* list
//! for reuse.
//!
//! Instances never share anything except the process-wide timestamp
//! registry, so every operation here is plain single-threaded code; the
//! concurrency lives entirely in [crate::timestamp].
//!
//! Objects flowing through one allocator are expected to be of one size
//! (list or tree nodes, typically). Collected pointers are handed back
//! for whatever size is requested, exactly as large as they were born.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::Level;

use crate::backend::{self, Tier};
use crate::loom_testing::AtomicPtr;
use crate::timestamp::{global_registry, Snapshot, TsRegistry, TsSlot};
use crate::util::{prefetch_write, UsizePtr, CACHE_LINE_SIZE};

/// Initial arena chunk size for allocators created with defaults
pub const DEFAULT_MEM_SIZE: usize = 32 * 1024 * 1024;
/// Default cap on the per-chunk size reached by doubling
pub const MEM_SIZE_MAX: usize = 4 * 1024 * 1024 * 1024;
/// Default free-set capacity (freed objects per batch)
pub const GC_FREE_SET_SIZE: usize = 507;
/// Default number of released records that triggers a reclamation pass
pub const GC_RLSE_SET_SIZE: usize = 5;

/// When an allocator automatically advances its thread's version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsIncr {
    /// Only [crate::timestamp::ts_next] advances it
    Manual,
    OnAlloc,
    OnFree,
    OnBoth,
}

impl TsIncr {
    #[inline]
    fn bumps_on_alloc(self) -> bool {
        matches!(self, TsIncr::OnAlloc | TsIncr::OnBoth)
    }
    #[inline]
    fn bumps_on_free(self) -> bool {
        matches!(self, TsIncr::OnFree | TsIncr::OnBoth)
    }
}

/// Per-instance knobs. The defaults match the crate constants above.
#[derive(Debug, Clone, Copy)]
pub struct AllocConfig {
    /// Cap on the per-chunk size after doublings
    pub mem_size_max: usize,
    /// Double the chunk size on each growth (else fixed-size chunks)
    pub mem_size_double: bool,
    /// Zero-fill newly allocated chunks (persisted line by line on the
    /// persistent tier)
    pub zero_memory: bool,
    pub ts_incr: TsIncr,
    /// Released-record count at which a release triggers reclamation
    pub rlse_threshold: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            mem_size_max: MEM_SIZE_MAX,
            mem_size_double: true,
            zero_memory: false,
            ts_incr: TsIncr::OnBoth,
            rlse_threshold: GC_RLSE_SET_SIZE,
        }
    }
}

/// Id sequences for lazily created allocators, one per tier.
///
/// The two run independently, so a process that *lazily* creates
/// allocators of both tiers can end up with colliding slot ids in the
/// shared registry; clients mixing tiers should assign ids themselves.
static ID_DRAM: AtomicU32 = AtomicU32::new(0);
static ID_PMEM: AtomicU32 = AtomicU32::new(0);

fn next_tier_id(tier: Tier) -> u32 {
    match tier {
        Tier::Dram => ID_DRAM.fetch_add(1, Ordering::Relaxed),
        Tier::Persistent => ID_PMEM.fetch_add(1, Ordering::Relaxed),
    }
}

/// Everything one thread keeps for its allocators: the cached registry
/// slot, the lazily created per-tier instances, and a count of live
/// instances so the slot can be retired with the last one.
pub(crate) struct ThreadRecord {
    pub(crate) ts_slot: Cell<*mut TsSlot>,
    pub(crate) ts_registry: Cell<*const TsRegistry>,
    live_allocators: Cell<usize>,
    lazy_dram: RefCell<Option<Box<SmrAllocator>>>,
    lazy_pmem: RefCell<Option<Box<SmrAllocator>>>,
}

thread_local! {
    pub(crate) static THREAD: ThreadRecord = ThreadRecord {
        ts_slot: Cell::new(ptr::null_mut()),
        ts_registry: Cell::new(ptr::null()),
        live_allocators: Cell::new(0),
        lazy_dram: RefCell::new(None),
        lazy_pmem: RefCell::new(None),
    };
}

/// A batch of freed pointers, header and buffer in a single backend
/// allocation. `ts` is `None` while the set is accepting pointers and is
/// stamped exactly once, when the set fills.
#[repr(C)]
struct FreeSet {
    cap: usize,
    fill: usize,
    ts: Option<Snapshot>,
    next: *mut FreeSet,
    // `cap` pointer slots live directly after the header
}

impl FreeSet {
    fn layout(cap: usize) -> Layout {
        Layout::from_size_align(
            size_of::<FreeSet>() + cap * size_of::<*mut u8>(),
            CACHE_LINE_SIZE,
        )
        .unwrap()
    }

    unsafe fn create(cap: usize, next: *mut FreeSet, tier: Tier) -> *mut FreeSet {
        let fs = tier.alloc_aligned(Self::layout(cap)) as *mut FreeSet;
        ptr::write(
            fs,
            FreeSet {
                cap,
                fill: 0,
                ts: None,
                next,
            },
        );
        fs
    }

    #[inline]
    unsafe fn buf(fs: *mut FreeSet) -> *mut *mut u8 {
        fs.add(1) as *mut *mut u8
    }

    unsafe fn destroy(fs: *mut FreeSet, tier: Tier) {
        let cap = (*fs).cap;
        if let Some(ts) = (*fs).ts.take() {
            ts.destroy(tier);
        }
        tier.free(fs as *mut u8, Self::layout(cap));
    }
}

/// A single object released outside the batch machinery, stamped with its
/// own snapshot. The layout rides along so the backend free is exact.
#[repr(C)]
struct ReleasedNode {
    obj: *mut u8,
    obj_layout: Layout,
    ts: Snapshot,
    next: *mut ReleasedNode,
}

/// One link in the LIFO chain of arena chunks.
#[repr(C)]
struct MemChunk {
    base: *mut u8,
    size: usize,
    next: *mut MemChunk,
}

/// A per-thread allocator instance.
///
/// Single-writer by construction: only the owning thread may call anything
/// here (the raw pointers inside keep the type `!Send`). Instances on
/// different threads interact solely through the timestamp registry.
pub struct SmrAllocator {
    tier: Tier,
    config: AllocConfig,
    registry: &'static TsRegistry,
    ts: *mut TsSlot,
    mem: *mut u8,
    mem_curr: usize,
    mem_size: usize,
    tot_size: usize,
    mem_chunks: AtomicPtr<MemChunk>,
    free_set_list: *mut FreeSet,
    free_set_num: usize,
    collected_set_list: *mut FreeSet,
    collected_set_num: usize,
    available_set_list: *mut FreeSet,
    released_list: *mut ReleasedNode,
    released_num: usize,
    fs_cap: usize,
}

impl SmrAllocator {
    /// Allocator with default chunk size and free-set capacity; the slot id
    /// comes from the tier's id sequence.
    pub fn new(tier: Tier) -> SmrAllocator {
        Self::with_mem_size(DEFAULT_MEM_SIZE, next_tier_id(tier), tier)
    }

    /// Allocator with a custom initial chunk size.
    pub fn with_mem_size(mem_size: usize, id: u32, tier: Tier) -> SmrAllocator {
        Self::with_free_set_cap(mem_size, GC_FREE_SET_SIZE, id, tier)
    }

    /// Allocator with custom chunk size and free-set capacity.
    pub fn with_free_set_cap(mem_size: usize, fs_cap: usize, id: u32, tier: Tier) -> SmrAllocator {
        Self::with_config(mem_size, fs_cap, id, tier, AllocConfig::default())
    }

    pub fn with_config(
        mem_size: usize,
        fs_cap: usize,
        id: u32,
        tier: Tier,
        config: AllocConfig,
    ) -> SmrAllocator {
        Self::init_in(global_registry(), mem_size, fs_cap, id, tier, config)
    }

    pub(crate) fn init_in(
        registry: &'static TsRegistry,
        mem_size: usize,
        fs_cap: usize,
        id: u32,
        tier: Tier,
        config: AllocConfig,
    ) -> SmrAllocator {
        assert!(mem_size > 0 && fs_cap > 0);

        // subscribe this thread to the registry on its first allocator;
        // later allocators (whatever id they were given) share the slot
        let ts = THREAD.with(|t| {
            t.live_allocators.set(t.live_allocators.get() + 1);
            let cached = t.ts_slot.get();
            if !cached.is_null() && ptr::eq(t.ts_registry.get(), registry) {
                cached
            } else {
                let slot = registry.register(id, tier);
                t.ts_slot.set(slot);
                t.ts_registry.set(registry);
                slot
            }
        });

        let mut a = SmrAllocator {
            tier,
            config,
            registry,
            ts,
            mem: ptr::null_mut(),
            mem_curr: 0,
            mem_size,
            tot_size: 0,
            mem_chunks: AtomicPtr::new(ptr::null_mut()),
            free_set_list: ptr::null_mut(),
            free_set_num: 0,
            collected_set_list: ptr::null_mut(),
            collected_set_num: 0,
            available_set_list: ptr::null_mut(),
            released_list: ptr::null_mut(),
            released_num: 0,
            fs_cap,
        };
        a.push_chunk(mem_size);
        a.free_set_list = unsafe { FreeSet::create(fs_cap, ptr::null_mut(), tier) };
        a.free_set_num = 1;
        a
    }

    #[inline]
    fn slot_id(&self) -> u32 {
        unsafe { (*self.ts).id }
    }

    /// Allocate a fresh chunk of `size` bytes and make it the bump target.
    fn push_chunk(&mut self, size: usize) {
        let mem = self
            .tier
            .alloc_aligned(Layout::from_size_align(size, CACHE_LINE_SIZE).unwrap());
        if self.config.zero_memory {
            unsafe { ptr::write_bytes(mem, 0, size) };
            if self.tier == Tier::Persistent {
                backend::persist(mem, size);
            }
        }

        let node = self.tier.alloc_aligned(Layout::new::<MemChunk>()) as *mut MemChunk;
        unsafe {
            ptr::write(
                node,
                MemChunk {
                    base: mem,
                    size,
                    next: self.mem_chunks.load(Ordering::Relaxed),
                },
            );
        }
        if self.tier == Tier::Persistent {
            backend::persist(node as *const u8, size_of::<MemChunk>());
        }
        // order: release publish so anyone chasing the chunk list sees the
        // node's fields initialized (only debug introspection ever does)
        self.mem_chunks.store(node, Ordering::Release);

        self.mem = mem;
        self.mem_curr = 0;
        self.tot_size += size;
        tracing::event!(Level::TRACE, size, base = ?UsizePtr::from(mem), "new arena chunk");
    }

    /// Pick the next chunk size for a request that missed the current one.
    fn grow(&mut self, size: usize) {
        if self.config.mem_size_double {
            self.mem_size <<= 1;
            if self.mem_size > self.config.mem_size_max {
                self.mem_size = self.config.mem_size_max;
            }
        }
        if size > self.mem_size {
            // a single oversized request gets a chunk that fits it
            while self.mem_size < size {
                if self.mem_size >= self.config.mem_size_max {
                    panic!(
                        "requested chunk larger than max ({} bytes)",
                        self.config.mem_size_max
                    );
                }
                self.mem_size <<= 1;
            }
        }
    }

    /// Allocate `size` bytes.
    ///
    /// Collected memory is served first, newest batch first, newest pointer
    /// first; only when nothing has quiesced does the bump pointer move.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let trace_span = tracing::span!(
            Level::TRACE,
            "allocator::alloc",
            id = self.slot_id(),
            size
        );
        let _span_enter = trace_span.enter();

        let m;
        let cs = self.collected_set_list;
        if !cs.is_null() {
            unsafe {
                (*cs).fill -= 1;
                m = *FreeSet::buf(cs).add((*cs).fill);
                prefetch_write(m);
                if (*cs).fill == 0 {
                    self.collected_set_list = (*cs).next;
                    self.collected_set_num -= 1;
                    self.make_available(cs);
                }
            }
        } else {
            if self.mem_curr + size > self.mem_size {
                self.grow(size);
                let new_size = self.mem_size;
                self.push_chunk(new_size);
            }
            m = unsafe { self.mem.add(self.mem_curr) };
            self.mem_curr += size;
        }

        if self.config.ts_incr.bumps_on_alloc() {
            unsafe { (*self.ts).bump() };
        }
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(m));
        m
    }

    /// Queue `obj` for deferred reclamation.
    ///
    /// Safety: `obj` must have come from [alloc](Self::alloc) on this
    /// allocator, must not be freed twice, and the caller must hold no
    /// other use of it after the call (other threads may, until they
    /// advance their version).
    pub unsafe fn free(&mut self, obj: *mut u8) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::free", id = self.slot_id());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(obj));

        let fs = self.free_set_list;
        debug_assert!((*fs).fill < (*fs).cap);
        *FreeSet::buf(fs).add((*fs).fill) = obj;
        (*fs).fill += 1;

        if (*fs).fill == (*fs).cap {
            // the set is sealed: stamp it with the registry state, sweep
            // whatever has quiesced, and start a fresh head
            (*fs).ts = Some(Snapshot::collect(self.registry, self.tier));
            let promoted = self.reclaim_pass();
            let head = self.take_available(fs);
            self.free_set_list = head;
            self.free_set_num += 1;
            tracing::event!(
                Level::TRACE,
                promoted,
                sealed = ?UsizePtr::from(fs),
                "free set sealed"
            );
        }

        if self.config.ts_incr.bumps_on_free() {
            // release store in bump(): the pointer append above becomes
            // visible before the advanced version does
            (*self.ts).bump();
        }
    }

    /// Defer-free a single object outside the batch machinery, for objects
    /// with atypical size or lifetime. The object is handed to the backend
    /// once every thread has advanced past this call's snapshot.
    ///
    /// Safety: `obj` must have come from [Tier::alloc_aligned] on this
    /// allocator's tier with `layout`, and must not be used again by this
    /// thread.
    pub unsafe fn release(&mut self, obj: *mut u8, layout: Layout) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::release", id = self.slot_id());
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(obj));

        let node = self.tier.alloc_aligned(Layout::new::<ReleasedNode>()) as *mut ReleasedNode;
        ptr::write(
            node,
            ReleasedNode {
                obj,
                obj_layout: layout,
                ts: Snapshot::collect(self.registry, self.tier),
                next: self.released_list,
            },
        );
        self.released_list = node;
        self.released_num += 1;
        if self.released_num >= self.config.rlse_threshold {
            self.reclaim_pass();
        }
    }

    /// Free every chunk, set, and record owned by this allocator, and
    /// retire the thread's version slot if this was its last instance.
    /// Equivalent to dropping it.
    pub fn terminate(self) {}

    /// Run a reclamation pass by hand. Returns the number of free-sets
    /// promoted to the collected list.
    pub fn reclaim(&mut self) -> usize {
        let promoted = self.reclaim_pass();
        tracing::event!(Level::TRACE, promoted, "manual reclamation pass");
        promoted
    }

    fn reclaim_pass(&mut self) -> usize {
        // released records: if the head's stamp strictly exceeds its
        // successor's, everything from the successor down has quiesced
        if self.released_num > 0 {
            unsafe {
                let rel_cur = self.released_list;
                let rel_nxt = (*rel_cur).next;
                if !rel_nxt.is_null() && (*rel_cur).ts.strictly_newer(&(*rel_nxt).ts) {
                    (*rel_cur).next = ptr::null_mut();
                    let swept = self.released_num - 1;
                    self.released_num = 1;
                    let mut cur = rel_nxt;
                    while !cur.is_null() {
                        let nxt = (*cur).next;
                        self.tier.free((*cur).obj, (*cur).obj_layout);
                        (*cur).ts.destroy(self.tier);
                        self.tier.free(cur as *mut u8, Layout::new::<ReleasedNode>());
                        cur = nxt;
                    }
                    tracing::event!(Level::TRACE, swept, "released records freed");
                }
            }
        }

        unsafe {
            let fs_cur = self.free_set_list;
            let cur_ts = match &(*fs_cur).ts {
                Some(ts) => ts,
                None => return 0,
            };
            let fs_nxt = (*fs_cur).next;
            if fs_nxt.is_null() {
                return 0;
            }
            let nxt_ts = match &(*fs_nxt).ts {
                // need two sealed sets to compare
                Some(ts) => ts,
                None => return 0,
            };
            if !cur_ts.strictly_newer(nxt_ts) {
                return 0;
            }

            // every thread stepped past the successor's stamp, and stamps
            // only get older further down the list, so the entire suffix
            // has quiesced: move it, in order, to the collected tail
            let promoted = self.free_set_num - 1;
            (*fs_cur).next = ptr::null_mut();
            self.free_set_num = 1;

            if self.collected_set_list.is_null() {
                self.collected_set_list = fs_nxt;
            } else {
                let mut tail = self.collected_set_list;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = fs_nxt;
            }
            self.collected_set_num += promoted;
            promoted
        }
    }

    /// Pop a container off the available list (or make a new one) and link
    /// it in front of `next` as the filling head.
    fn take_available(&mut self, next: *mut FreeSet) -> *mut FreeSet {
        let avail = self.available_set_list;
        if avail.is_null() {
            return unsafe { FreeSet::create(self.fs_cap, next, self.tier) };
        }
        unsafe {
            self.available_set_list = (*avail).next;
            (*avail).fill = 0;
            (*avail).next = next;
        }
        avail
    }

    /// Reset an emptied container and park it for reuse. The stale stamp
    /// is dropped here: a reused set must read as "not sealed yet".
    fn make_available(&mut self, fs: *mut FreeSet) {
        unsafe {
            (*fs).fill = 0;
            if let Some(ts) = (*fs).ts.take() {
                ts.destroy(self.tier);
            }
            (*fs).next = self.available_set_list;
        }
        self.available_set_list = fs;
    }
}

impl Drop for SmrAllocator {
    fn drop(&mut self) {
        tracing::event!(
            Level::DEBUG,
            id = self.slot_id(),
            total_bytes = self.tot_size,
            "allocator terminating"
        );

        unsafe {
            let mut mcur = self.mem_chunks.load(Ordering::Relaxed);
            while !mcur.is_null() {
                let nxt = (*mcur).next;
                self.tier.free(
                    (*mcur).base,
                    Layout::from_size_align((*mcur).size, CACHE_LINE_SIZE).unwrap(),
                );
                self.tier.free(mcur as *mut u8, Layout::new::<MemChunk>());
                mcur = nxt;
            }

            for list in [
                self.free_set_list,
                self.collected_set_list,
                self.available_set_list,
            ] {
                let mut fs = list;
                while !fs.is_null() {
                    let nxt = (*fs).next;
                    FreeSet::destroy(fs, self.tier);
                    fs = nxt;
                }
            }

            let mut rel = self.released_list;
            while !rel.is_null() {
                let nxt = (*rel).next;
                self.tier.free((*rel).obj, (*rel).obj_layout);
                (*rel).ts.destroy(self.tier);
                self.tier.free(rel as *mut u8, Layout::new::<ReleasedNode>());
                rel = nxt;
            }
        }

        // try_with: at thread exit the record may already be tearing down,
        // in which case the bookkeeping below is moot anyway
        let _ = THREAD.try_with(|t| {
            let n = t.live_allocators.get();
            if n == 0 {
                tracing::event!(Level::WARN, "allocator was not accounted on this thread");
                return;
            }
            t.live_allocators.set(n - 1);
            if n == 1 {
                // last allocator on this thread: retire the version slot
                let slot = t.ts_slot.get();
                if !slot.is_null() {
                    let registry = t.ts_registry.get();
                    unsafe { (*registry).retire(slot) };
                    t.ts_slot.set(ptr::null_mut());
                    t.ts_registry.set(ptr::null());
                }
            }
        });
    }
}

struct SetListDebug(*mut FreeSet);

impl Debug for SetListDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cur = self.0;
        while !cur.is_null() {
            unsafe {
                match &(*cur).ts {
                    Some(ts) => list.entry(&format_args!(
                        "{:?} {}/{} {:?}",
                        UsizePtr::from(cur),
                        (*cur).fill,
                        (*cur).cap,
                        ts
                    )),
                    None => list.entry(&format_args!(
                        "{:?} {}/{} [no stamp yet]",
                        UsizePtr::from(cur),
                        (*cur).fill,
                        (*cur).cap
                    )),
                };
                cur = (*cur).next;
            }
        }
        list.finish()
    }
}

impl Debug for SmrAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmrAllocator")
            .field("@addr", &(self as *const _))
            .field("tier", &self.tier)
            .field("slot_id", &self.slot_id())
            .field("mem", &UsizePtr::from(self.mem))
            .field("mem_curr", &self.mem_curr)
            .field("mem_size", &self.mem_size)
            .field("tot_size", &self.tot_size)
            .field("free_sets", &SetListDebug(self.free_set_list))
            .field("collected_sets", &SetListDebug(self.collected_set_list))
            .field("available_sets", &SetListDebug(self.available_set_list))
            .field("released_num", &self.released_num)
            .finish()
    }
}

fn with_lazy<R>(tier: Tier, f: impl FnOnce(&mut SmrAllocator) -> R) -> R {
    THREAD.with(|t| {
        let cell = match tier {
            Tier::Dram => &t.lazy_dram,
            Tier::Persistent => &t.lazy_pmem,
        };
        let mut slot = cell.borrow_mut();
        let a = slot.get_or_insert_with(|| Box::new(SmrAllocator::new(tier)));
        f(a)
    })
}

/// Allocate from the calling thread's allocator for `tier`, creating it
/// with defaults on first use.
pub fn alloc(size: usize, tier: Tier) -> *mut u8 {
    with_lazy(tier, |a| a.alloc(size))
}

/// Free through the calling thread's allocator for `tier`.
///
/// Safety: as for [SmrAllocator::free]; in particular `obj` must have come
/// from [alloc] on this same thread and tier.
pub unsafe fn free(obj: *mut u8, tier: Tier) {
    with_lazy(tier, |a| unsafe { a.free(obj) })
}

/// Release through the calling thread's allocator for `tier`.
///
/// Safety: as for [SmrAllocator::release].
pub unsafe fn release(obj: *mut u8, layout: Layout, tier: Tier) {
    with_lazy(tier, |a| unsafe { a.release(obj, layout) })
}

/// Terminate every lazily created allocator on the calling thread,
/// freeing all memory they own.
pub fn term() {
    THREAD.with(|t| {
        t.lazy_dram.borrow_mut().take();
        t.lazy_pmem.borrow_mut().take();
    });
}
