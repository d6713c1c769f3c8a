use std::sync::atomic::Ordering;

use super::*;

fn leaked_registry() -> &'static TsRegistry {
    Box::leak(Box::new(TsRegistry::new()))
}

fn slot_ids(reg: &TsRegistry) -> Vec<u32> {
    let mut ids = Vec::new();
    let mut cur = reg.head.load(Ordering::SeqCst);
    while !cur.is_null() {
        unsafe {
            ids.push((*cur).id);
            cur = (*cur).next.load(Ordering::SeqCst);
        }
    }
    ids
}

#[cfg(not(loom))]
#[test]
fn register_links_at_head() {
    let reg = leaked_registry();
    let s0 = reg.register(0, Tier::Dram);
    let s1 = reg.register(1, Tier::Dram);
    assert_eq!(reg.len(), 2);
    assert_eq!(reg.head.load(Ordering::SeqCst), s1);
    assert_eq!(slot_ids(reg), vec![1, 0]);
    assert_eq!(unsafe { (*s0).version.load(Ordering::SeqCst) }, 0);
}

#[cfg(not(loom))]
#[test]
fn snapshot_reads_every_version() {
    let reg = leaked_registry();
    let s0 = reg.register(0, Tier::Dram);
    let s1 = reg.register(1, Tier::Dram);
    unsafe {
        (*s0).bump();
        (*s0).bump();
        (*s1).bump();
    }
    let snap = Snapshot::collect(reg, Tier::Dram);
    assert_eq!(snap.len, 2);
    unsafe {
        assert_eq!(*snap.vers.add(0), 2);
        assert_eq!(*snap.vers.add(1), 1);
        snap.destroy(Tier::Dram);
    }
}

#[cfg(not(loom))]
#[test]
fn snapshot_skips_ids_beyond_len() {
    let reg = leaked_registry();
    reg.register(0, Tier::Dram);
    reg.register(1, Tier::Dram);
    // a slot whose id is not a dense index yet, as seen mid-registration
    let stray = reg.register(9, Tier::Dram);
    unsafe { (*stray).bump() };
    let snap = Snapshot::collect(reg, Tier::Dram);
    assert_eq!(snap.len, 3);
    unsafe {
        // dest[2] was never written by the walk and stays zeroed
        assert_eq!(*snap.vers.add(2), 0);
        snap.destroy(Tier::Dram);
    }
}

#[cfg(not(loom))]
#[test]
fn strictly_newer_needs_every_entry_to_advance() {
    let reg = leaked_registry();
    let s0 = reg.register(0, Tier::Dram);
    let s1 = reg.register(1, Tier::Dram);
    let old = Snapshot::collect(reg, Tier::Dram);

    unsafe { (*s0).bump() };
    let half = Snapshot::collect(reg, Tier::Dram);
    assert!(!half.strictly_newer(&old));
    // an unchanged vector is never newer than itself
    assert!(!old.strictly_newer(&old));

    unsafe { (*s1).bump() };
    let full = Snapshot::collect(reg, Tier::Dram);
    assert!(full.strictly_newer(&old));
    assert!(!old.strictly_newer(&full));

    unsafe {
        old.destroy(Tier::Dram);
        half.destroy(Tier::Dram);
        full.destroy(Tier::Dram);
    }
}

#[cfg(not(loom))]
#[test]
fn strictly_newer_ignores_threads_registered_later() {
    let reg = leaked_registry();
    let s0 = reg.register(0, Tier::Dram);
    let old = Snapshot::collect(reg, Tier::Dram);

    // a thread that shows up afterwards never gates the comparison, even
    // at version 0
    reg.register(1, Tier::Dram);
    unsafe { (*s0).bump() };
    let newer = Snapshot::collect(reg, Tier::Dram);
    assert_eq!(newer.len, 2);
    assert!(newer.strictly_newer(&old));

    unsafe {
        old.destroy(Tier::Dram);
        newer.destroy(Tier::Dram);
    }
}

#[cfg(not(loom))]
#[test]
fn retire_unlinks_only_the_head() {
    let reg = leaked_registry();
    let s0 = reg.register(0, Tier::Dram);
    let s1 = reg.register(1, Tier::Dram);

    // s0 is buried behind s1, so it cannot be unlinked
    assert!(!reg.retire(s0));
    assert_eq!(slot_ids(reg), vec![1, 0]);

    assert!(reg.retire(s1));
    assert_eq!(slot_ids(reg), vec![0]);
    assert_eq!(reg.len(), 2);
}

#[cfg(not(loom))]
#[test]
fn concurrent_registration_keeps_every_slot() {
    let reg = leaked_registry();
    let mut handles = Vec::new();
    for id in 0..8u32 {
        handles.push(std::thread::spawn(move || {
            reg.register(id, Tier::Dram);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(reg.len(), 8);
    let mut ids = slot_ids(reg);
    ids.sort_unstable();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
}

#[cfg(loom)]
#[test]
fn loom_register_race() {
    loom::model(|| {
        let reg: &'static TsRegistry = Box::leak(Box::new(TsRegistry::new()));

        let t0 = loom::thread::spawn(move || {
            reg.register(0, Tier::Dram);
        });
        let t1 = loom::thread::spawn(move || {
            reg.register(1, Tier::Dram);
        });
        t0.join().unwrap();
        t1.join().unwrap();

        assert_eq!(reg.len(), 2);
        let mut ids = slot_ids(reg);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    })
}
