//! Process-wide registry of per-thread version counters
//!
//! Reclamation is quiescence-based: every thread that touches shared data
//! structures owns one cache-line-aligned slot in an intrusive, append-only
//! singly-linked list. A thread advances its own `version` (a plain
//! monotonic counter); anyone deciding whether freed memory is safe to hand
//! out again takes a [Snapshot] of every registered version and compares
//! snapshots elementwise. Strict `>` per entry proves every thread took at
//! least one step in between, so no reference from before the first
//! snapshot can still be live.
//!
//! The version counter is written only by its owning thread and read by
//! everyone; a single 64-bit store/load is atomic on every ISA we target,
//! so the writer side is a release store and readers use relaxed loads.
//! Slots are never unlinked while the owning thread might still be running;
//! see [TsRegistry::retire] for the one narrow exception.

use std::alloc::Layout;
use std::fmt::{self, Debug};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use tracing::Level;

use crate::backend::Tier;
use crate::loom_testing::*;
use crate::util::UsizePtr;

/// One thread's entry in the registry.
///
/// `id` is a dense index into snapshot vectors, assigned by the caller at
/// registration (allocator instances draw it from a per-tier counter).
#[repr(C, align(64))]
pub(crate) struct TsSlot {
    pub(crate) version: AtomicU64,
    pub(crate) id: u32,
    next: AtomicPtr<TsSlot>,
}

impl TsSlot {
    /// Advance this thread's version by one.
    ///
    /// Single writer. The release store orders everything the owning thread
    /// wrote before the bump (in particular a pointer appended to a
    /// free-set) before the new version becomes visible to snapshots.
    #[inline]
    pub(crate) fn bump(&self) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v + 1, Ordering::Release);
    }
}

/// Head pointer plus length counter for the slot list.
///
/// The two are updated separately (CAS on the head, then fetch-add on the
/// length), so a snapshot can observe a freshly inserted slot whose
/// `id >= len`; such slots belong to threads newer than the history being
/// compared against and are skipped.
pub(crate) struct TsRegistry {
    head: AtomicPtr<TsSlot>,
    len: AtomicU32,
}

impl TsRegistry {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicU32::new(0),
        }
    }

    /// Allocate a slot from `tier` and CAS-insert it at the head.
    ///
    /// Lock-free; contends only while threads are starting up.
    pub(crate) fn register(&self, id: u32, tier: Tier) -> *mut TsSlot {
        let slot = tier.alloc_aligned(Layout::new::<TsSlot>()) as *mut TsSlot;
        unsafe {
            ptr::write(
                slot,
                TsSlot {
                    version: AtomicU64::new(0),
                    id,
                    next: AtomicPtr::new(ptr::null_mut()),
                },
            );
        }

        // order: the release CAS publishes the slot's fields; walkers load
        // the head with acquire and may then chase next with relaxed loads,
        // since next never changes once the slot is published
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*slot).next.store(old, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(old, slot, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);

        tracing::event!(
            Level::TRACE,
            id,
            slot = ?UsizePtr::from(slot),
            "registered version slot"
        );
        slot
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    /// Wait-free single pass over the list, writing each slot with
    /// `id < len` into `dest[id]`. `dest` must hold `len` entries.
    pub(crate) unsafe fn snapshot_into(&self, dest: *mut u64, len: u32) {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let id = (*cur).id;
            if id < len {
                *dest.add(id as usize) = (*cur).version.load(Ordering::Relaxed);
            }
            cur = (*cur).next.load(Ordering::Relaxed);
        }
    }

    /// Best-effort removal of `slot` when its thread is done with it.
    ///
    /// Only the head can be unlinked with a single CAS in a singly-linked
    /// list, and the storage is leaked either way: a concurrent
    /// [snapshot_into](Self::snapshot_into) walk may still be holding the
    /// pointer, and with no quiescence mechanism *below* this one there is
    /// no moment at which freeing is provably safe. Threads are assumed to
    /// be long-lived and bounded in number.
    pub(crate) fn retire(&self, slot: *mut TsSlot) -> bool {
        let next = unsafe { (*slot).next.load(Ordering::Relaxed) };
        let unlinked = self
            .head
            .compare_exchange(slot, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        tracing::event!(
            Level::TRACE,
            slot = ?UsizePtr::from(slot),
            unlinked,
            "retired version slot"
        );
        unlinked
    }
}

impl Debug for TsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                list.entry(&format_args!(
                    "id {} / version {}",
                    (*cur).id,
                    (*cur).version.load(Ordering::Relaxed)
                ));
                cur = (*cur).next.load(Ordering::Relaxed);
            }
        }
        list.finish()
    }
}

/// The registry shared by every allocator in the process.
pub(crate) fn global_registry() -> &'static TsRegistry {
    static GLOBAL: OnceLock<TsRegistry> = OnceLock::new();
    GLOBAL.get_or_init(TsRegistry::new)
}

/// An array of per-thread versions captured in one registry pass, sized by
/// the registry length at capture time. Lives in the owning allocator's
/// tier so persistent-tier metadata stays inside the pool.
pub(crate) struct Snapshot {
    vers: *mut u64,
    len: u32,
}

impl Snapshot {
    fn layout(len: u32) -> Layout {
        Layout::array::<u64>(len as usize).unwrap()
    }

    pub(crate) fn collect(registry: &TsRegistry, tier: Tier) -> Snapshot {
        let len = registry.len();
        debug_assert!(len > 0, "collect with no registered threads");
        let vers = tier.alloc_aligned(Self::layout(len)) as *mut u64;
        unsafe {
            // zero first: entries whose slot has been retired (or whose id
            // is not yet observable) must read as "never advanced"
            ptr::write_bytes(vers, 0, len as usize);
            registry.snapshot_into(vers, len);
        }
        Snapshot { vers, len }
    }

    /// Elementwise strict `>` over the common prefix of the two vectors.
    ///
    /// `self` must be the snapshot taken later. Entries present only in the
    /// newer vector belong to threads that registered after the older
    /// snapshot was taken; they cannot hold references from before it and
    /// are ignored. Strict inequality (never `>=`) is what proves a real
    /// observed advance rather than a re-read of an idle thread.
    pub(crate) fn strictly_newer(&self, older: &Snapshot) -> bool {
        let n = self.len.min(older.len) as usize;
        for i in 0..n {
            unsafe {
                if *self.vers.add(i) <= *older.vers.add(i) {
                    return false;
                }
            }
        }
        true
    }

    /// Safety: must match the tier the snapshot was collected with, and the
    /// snapshot must not be used afterwards.
    pub(crate) unsafe fn destroy(&self, tier: Tier) {
        tier.free(self.vers as *mut u8, Self::layout(self.len));
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.len as usize {
            write!(f, "{}|", unsafe { *self.vers.add(i) })?;
        }
        write!(f, "]")
    }
}

/// Manually advance the calling thread's version.
///
/// This is the hook for clients that bump at their own safe points instead
/// of (or in addition to) the automatic on-alloc/on-free policies.
///
/// Panics if the thread has never initialized an allocator.
pub fn ts_next() {
    crate::allocator::THREAD.with(|t| {
        let slot = t.ts_slot.get();
        assert!(
            !slot.is_null(),
            "ts_next on a thread with no registered allocator"
        );
        unsafe { (*slot).bump() };
    });
}

/// The calling thread's slot id, if it has one.
pub fn thread_slot_id() -> Option<u32> {
    crate::allocator::THREAD.with(|t| {
        let slot = t.ts_slot.get();
        if slot.is_null() {
            None
        } else {
            Some(unsafe { (*slot).id })
        }
    })
}

#[cfg(test)]
mod tests;
