use std::alloc::Layout;

use super::*;

#[test]
fn dram_roundtrip() {
    let layout = Layout::from_size_align(128, CACHE_LINE_SIZE).unwrap();
    let p = Tier::Dram.alloc_aligned(layout);
    assert!(!p.is_null());
    assert_eq!(p as usize % CACHE_LINE_SIZE, 0);
    unsafe {
        p.write_bytes(0xab, 128);
        assert_eq!(*p.add(127), 0xab);
        Tier::Dram.free(p, layout);
    }
}

#[test]
fn pool_init_twice_errors() {
    let path = std::env::temp_dir().join(format!(
        "smrmem-global-pool-{}.bin",
        std::process::id()
    ));
    // the process-wide slot is set at most once; whoever wins, a repeat
    // call must be refused
    let _ = pmem_pool_init(&path, 1024 * 1024);
    match pmem_pool_init(&path, 1024 * 1024) {
        Err(BackendError::AlreadyInitialized) => {}
        other => panic!("expected AlreadyInitialized, got {:?}", other.err()),
    }
}

#[test]
fn pool_blocks_are_cache_line_aligned() {
    pool_for_tests();
    let layout = Layout::from_size_align(24, 8).unwrap();
    let p1 = Tier::Persistent.alloc_aligned(layout);
    let p2 = Tier::Persistent.alloc_aligned(layout);
    println!("pool block 1 {:?}", p1);
    println!("pool block 2 {:?}", p2);
    assert_eq!(p1 as usize % CACHE_LINE_SIZE, 0);
    assert_eq!(p2 as usize % CACHE_LINE_SIZE, 0);
    assert_ne!(p1, p2);
    unsafe {
        Tier::Persistent.free(p1, layout);
        Tier::Persistent.free(p2, layout);
    }
}

#[test]
fn pool_reuses_freed_block_of_same_size() {
    pool_for_tests();
    let layout = Layout::from_size_align(200, CACHE_LINE_SIZE).unwrap();
    let p = Tier::Persistent.alloc_aligned(layout);
    unsafe { Tier::Persistent.free(p, layout) };

    // a different size must not take the freed block
    let other_layout = Layout::from_size_align(4096, CACHE_LINE_SIZE).unwrap();
    let other = Tier::Persistent.alloc_aligned(other_layout);
    assert_ne!(other, p);

    // the same size gets the block straight back
    let again = Tier::Persistent.alloc_aligned(layout);
    assert_eq!(again, p);
    unsafe {
        Tier::Persistent.free(other, other_layout);
        Tier::Persistent.free(again, layout);
    }
}

#[test]
fn persist_is_harmless_on_dram() {
    let layout = Layout::from_size_align(256, CACHE_LINE_SIZE).unwrap();
    let p = Tier::Dram.alloc_aligned(layout);
    unsafe {
        p.write_bytes(0, 256);
        persist(p, 256);
        assert_eq!(*p, 0);
        Tier::Dram.free(p, layout);
    }
}
