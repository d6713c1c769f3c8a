//! Memory backends for the two allocation tiers
//!
//! Everything the allocator owns (chunks, free-set containers, timestamp
//! slots, released records, snapshot vectors) is carved out of one of two
//! backends: plain DRAM via [std::alloc], or a process-wide pool mapped from
//! a file on a DAX-mounted persistent-memory device. The pool is the moral
//! equivalent of a `libvmem` pool handle: opened once at process start with
//! a fixed path and size, then shared by every persistent-tier allocator.
//!
//! The pool allocator itself is intentionally small. Traffic through it is
//! rare (chunk growth and container churn only, never per-object), so a
//! mutex-guarded size-matched free list over a bump cursor is plenty.

use std::alloc::{self, Layout};
use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::OnceLock;

use parking_lot::Mutex;
use thiserror::Error;

use crate::util::{roundto, UsizePtr, CACHE_LINE_SIZE};

/// Which kind of memory an allocator (and everything it owns) lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Volatile memory from the system allocator
    Dram,
    /// The process-wide persistent-memory pool
    Persistent,
}

/// Errors from setting up the persistent-memory pool.
///
/// Allocation itself never returns an error: running out of backend memory
/// is fatal for the allocator built on top, so it aborts with a diagnostic.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("pmem pool i/o: {0}")]
    Io(#[from] io::Error),
    #[error("pmem pool is already initialized")]
    AlreadyInitialized,
}

impl Tier {
    /// Allocate `layout.size()` bytes at `layout.align()` from this tier.
    ///
    /// Aborts on exhaustion; there is no recovery path from a backend that
    /// cannot serve the substrate.
    pub fn alloc_aligned(self, layout: Layout) -> *mut u8 {
        let p = match self {
            Tier::Dram => unsafe { alloc::alloc(layout) },
            Tier::Persistent => pmem_pool().alloc(layout),
        };
        if p.is_null() {
            panic!("out of memory: {:?} backend failed for {:?}", self, layout);
        }
        p
    }

    /// Return memory obtained from [Tier::alloc_aligned] with the same layout.
    ///
    /// Safety: `p` must have come from `alloc_aligned` on the *same* tier
    /// with the same `layout`, and must not be used afterwards.
    pub unsafe fn free(self, p: *mut u8, layout: Layout) {
        match self {
            Tier::Dram => alloc::dealloc(p, layout),
            Tier::Persistent => pmem_pool().free(p, layout),
        }
    }
}

/// Force `len` bytes at `p` out to the persistence domain, one cache line
/// at a time.
#[inline]
pub(crate) fn persist(p: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_clflush, _mm_sfence};
        let mut line = (p as usize) & !(CACHE_LINE_SIZE - 1);
        let end = p as usize + len;
        while line < end {
            _mm_clflush(line as *const u8);
            line += CACHE_LINE_SIZE;
        }
        _mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (p, len);
}

static PMEM_POOL: OnceLock<PmemPool> = OnceLock::new();

/// Open (creating if necessary) the named pool file of exactly `bytes`
/// bytes and map it into the process. Must be called once, before any
/// [Tier::Persistent] allocation; a second call fails with
/// [BackendError::AlreadyInitialized].
pub fn pmem_pool_init(path: &Path, bytes: usize) -> Result<(), BackendError> {
    let pool = PmemPool::open(path, bytes)?;
    tracing::event!(
        tracing::Level::DEBUG,
        path = %path.display(),
        bytes,
        base = ?UsizePtr::from(pool.base),
        "pmem pool mapped"
    );
    PMEM_POOL
        .set(pool)
        .map_err(|_| BackendError::AlreadyInitialized)
}

// tests run in one shared process, and the process-wide pool can only be
// set once; each test thread maps a private pool instead, the same way
// tests build private (leaked) timestamp registries
#[cfg(test)]
thread_local! {
    static TEST_POOL: std::cell::Cell<*const PmemPool> =
        std::cell::Cell::new(std::ptr::null());
}

fn pmem_pool() -> &'static PmemPool {
    #[cfg(test)]
    {
        let pool = TEST_POOL.with(|t| t.get());
        if !pool.is_null() {
            return unsafe { &*pool };
        }
    }
    PMEM_POOL
        .get()
        .expect("pmem pool not initialized; call pmem_pool_init at process start")
}

/// Header written into a pool block when it is returned, forming an
/// intrusive free list.
#[repr(C)]
struct PoolFreeBlock {
    size: usize,
    next: *mut PoolFreeBlock,
}

struct PoolInner {
    cursor: usize,
    free_head: *mut PoolFreeBlock,
}

struct PmemPool {
    base: *mut u8,
    size: usize,
    inner: Mutex<PoolInner>,
}

// safety: the raw base pointer is only dereferenced under the inner mutex
// or by whoever the block was handed out to
unsafe impl Send for PmemPool {}
unsafe impl Sync for PmemPool {}

impl PmemPool {
    fn open(path: &Path, bytes: usize) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(bytes as u64)?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            base: base as *mut u8,
            size: bytes,
            inner: Mutex::new(PoolInner {
                cursor: 0,
                free_head: ptr::null_mut(),
            }),
        })
    }

    /// Every pool block is rounded up to a whole number of cache lines, so
    /// the bump cursor stays line-aligned and freed blocks can be matched
    /// back up by size alone.
    fn block_size(layout: Layout) -> usize {
        assert!(
            layout.align() <= CACHE_LINE_SIZE,
            "pool cannot serve alignment {}",
            layout.align()
        );
        roundto(layout.size().max(size_of::<PoolFreeBlock>()), CACHE_LINE_SIZE)
    }

    fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = Self::block_size(layout);
        let mut inner = self.inner.lock();

        // size-matched reuse of a previously returned block
        let mut prev: *mut PoolFreeBlock = ptr::null_mut();
        let mut cur = inner.free_head;
        while !cur.is_null() {
            unsafe {
                if (*cur).size == size {
                    if prev.is_null() {
                        inner.free_head = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    return cur as *mut u8;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }

        // TODO: coalesce neighboring free blocks so mixed-size churn cannot
        // strand the tail of the pool
        let off = inner.cursor;
        if off + size > self.size {
            return ptr::null_mut();
        }
        inner.cursor = off + size;
        unsafe { self.base.add(off) }
    }

    unsafe fn free(&self, p: *mut u8, layout: Layout) {
        let size = Self::block_size(layout);
        let block = p as *mut PoolFreeBlock;
        let mut inner = self.inner.lock();
        (*block).size = size;
        (*block).next = inner.free_head;
        inner.free_head = block;
    }
}

/// Give the calling test thread its own private pool, leaked like the
/// per-test registries.
#[cfg(test)]
pub(crate) fn pool_for_tests() {
    use std::sync::atomic::{AtomicU32, Ordering};
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let path = std::env::temp_dir().join(format!(
        "smrmem-test-pool-{}-{}.bin",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let pool: &'static PmemPool = Box::leak(Box::new(
        PmemPool::open(&path, 64 * 1024 * 1024).expect("pool setup failed"),
    ));
    TEST_POOL.with(|t| t.set(pool as *const PmemPool));
}

#[cfg(test)]
mod tests;
