#![no_std]

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: treealloc::Allocator<HEAP_SIZE> = treealloc::Allocator::new();

extern crate alloc;

#[test]
fn vec() {
    let mut v = alloc::vec![1, 2, 3];
    v.push(4);

    assert_eq!((1..=4).collect::<alloc::vec::Vec<_>>(), v);
}

#[test]
fn map_and_formatting() {
    let mut map = alloc::collections::BTreeMap::new();
    map.insert(10, "Hello");
    map.insert(11, "world");
    map.insert(20, "Hallo");
    map.insert(21, "Welt");
    map.insert(-1, "english");
    map.insert(-2, "german");

    let english = alloc::format!("[{}]: {}, {}!", map[&-1], map[&10], map[&11]);
    let german = alloc::format!("[{}]: {}, {}!", map[&-2], map[&20], map[&21]);
    assert_eq!(english, "[english]: Hello, world!");
    assert_eq!(german, "[german]: Hallo, Welt!");
}

#[test]
fn growing_collections_reallocate() {
    // repeated pushes force the vector through many reallocations, which
    // exercises both the in-place growth path and the move-and-copy path
    let mut v = alloc::vec::Vec::new();
    for i in 0..10_000_u32 {
        v.push(i);
    }
    for (i, value) in v.iter().enumerate() {
        assert_eq!(*value, i as u32);
    }

    v.shrink_to_fit();
    assert_eq!(v.len(), 10_000);
    assert_eq!(v[9_999], 9_999);
}

#[test]
fn interleaved_lifetimes() {
    use alloc::boxed::Box;

    let a = Box::new([0xAB_u8; 100]);
    let b = Box::new([0xCD_u8; 50]);
    drop(a);
    let c = Box::new([0xEF_u8; 75]);

    assert!(b.iter().all(|&byte| byte == 0xCD));
    assert!(c.iter().all(|&byte| byte == 0xEF));
}

#[test]
fn zeroed_allocations_are_zero() {
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};

    let layout = Layout::from_size_align(256, 8).unwrap();
    // SAFETY: a fresh, non-zero-sized allocation, released before the test
    // ends
    unsafe {
        let ptr = alloc_zeroed(layout);
        assert!(!ptr.is_null());
        for i in 0..layout.size() {
            assert_eq!(ptr.add(i).read(), 0);
        }
        dealloc(ptr, layout);
    }
}
