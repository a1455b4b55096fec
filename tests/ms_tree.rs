//! End-to-end scenarios over the memory-system tree: several nodes deep,
//! cleanups registered at different levels, destroyed from the root.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use sysrt::ms::MemorySystem;

static EVENTS: AtomicUsize = AtomicUsize::new(0);

fn touch(_: *mut c_void) -> sysrt::error::Result<()> {
    EVENTS.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn destroying_root_tears_down_whole_subtree() {
    EVENTS.store(0, Ordering::SeqCst);

    let root = MemorySystem::root_tracking();
    let child_a = root.new_tracking_child();
    let child_b = root.new_non_tracking_child();
    let grandchild = child_a.new_tracking_child();

    for node in [&root, &child_a, &child_b, &grandchild] {
        node.register_cleanup(1, std::ptr::null_mut(), touch);
    }

    root.destroy().unwrap();

    assert_eq!(EVENTS.load(Ordering::SeqCst), 4);
}

#[test]
fn allocations_survive_across_siblings() {
    let root = MemorySystem::root_tracking();
    let a = root.new_tracking_child();
    let b = root.new_tracking_child();

    let pa = a.malloc(128).unwrap();
    let pb = b.malloc(128).unwrap();
    assert_ne!(pa, pb);

    unsafe {
        std::ptr::write_bytes(pa, 0x11, 128);
        std::ptr::write_bytes(pb, 0x22, 128);
        assert_eq!(*pa, 0x11);
        assert_eq!(*pb, 0x22);
    }

    root.destroy().unwrap();
}

#[test]
fn non_tracking_node_requires_explicit_free() {
    let ms = MemorySystem::root_non_tracking();
    let ptr = ms.malloc(256).unwrap();
    assert!(!ptr.is_null());
    unsafe {
        std::ptr::write_bytes(ptr, 0xEE, 256);
        ms.free(ptr).unwrap();
    }
    ms.destroy().unwrap();
}

#[test]
fn is_ancestor_reflects_the_live_tree_shape() {
    let root = MemorySystem::root_tracking();
    let branch = root.new_tracking_child();
    let other_root = MemorySystem::root_tracking();

    assert!(root.is_ancestor(&branch));
    assert!(!other_root.is_ancestor(&branch));
    assert!(!branch.is_ancestor(&root));

    root.destroy().unwrap();
    other_root.destroy().unwrap();
}

#[test]
fn reset_runs_cleanups_without_destroying_the_node() {
    EVENTS.store(0, Ordering::SeqCst);
    let root = MemorySystem::root_tracking();
    root.register_cleanup(1, std::ptr::null_mut(), touch);
    root.reset().unwrap();
    assert_eq!(EVENTS.load(Ordering::SeqCst), 1);

    // The node is still usable after reset.
    let ptr = root.malloc(32).unwrap();
    assert!(!ptr.is_null());
    root.destroy().unwrap();
}
