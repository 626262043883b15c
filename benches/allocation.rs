use std::alloc::{GlobalAlloc as _, Layout};

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

static ALLOCATOR: treealloc::Allocator<{ 1024 * 1024 }> = treealloc::Allocator::new();

/// Repeatedly allocate and deallocate one block while the heap holds the
/// given amount of unrelated live allocations. With an indexed free list the
/// cost should stay flat as the pre-allocation count grows.
fn alloc_dealloc_with_preallocation(c: &mut Criterion, name: &str, pre_allocations: usize) {
    let filler = Layout::from_size_align(24, 8).unwrap();
    let mut fillers = Vec::with_capacity(pre_allocations);
    for _ in 0..pre_allocations {
        // SAFETY: non-zero-sized layout
        let ptr = unsafe { ALLOCATOR.alloc(filler) };
        assert!(!ptr.is_null(), "pre-allocations exceed the heap");
        fillers.push(ptr);
    }

    let layout = Layout::from_size_align(64, 8).unwrap();
    c.bench_function(name, |b| {
        b.iter(|| {
            // SAFETY: allocate and immediately release a valid layout
            unsafe {
                let ptr = ALLOCATOR.alloc(layout);
                black_box(ptr);
                ALLOCATOR.dealloc(ptr, layout);
            }
        })
    });

    for ptr in fillers {
        // SAFETY: allocated above with the filler layout
        unsafe { ALLOCATOR.dealloc(ptr, filler) };
    }
}

fn repeated_allocation_deallocation(c: &mut Criterion) {
    alloc_dealloc_with_preallocation(c, "alloc_dealloc/empty_heap", 0);
    alloc_dealloc_with_preallocation(c, "alloc_dealloc/100_live", 100);
    alloc_dealloc_with_preallocation(c, "alloc_dealloc/10000_live", 10_000);
}

fn grow_reallocation(c: &mut Criterion) {
    let layout = Layout::from_size_align(32, 8).unwrap();
    c.bench_function("realloc/grow_and_release", |b| {
        b.iter(|| {
            // SAFETY: a self-contained allocate/grow/release cycle
            unsafe {
                let ptr = ALLOCATOR.alloc(layout);
                let grown = ALLOCATOR.realloc(ptr, layout, 128);
                black_box(grown);
                ALLOCATOR.dealloc(grown, Layout::from_size_align(128, 8).unwrap());
            }
        })
    });
}

criterion_group!(benches, repeated_allocation_deallocation, grow_reallocation);
criterion_main!(benches);
