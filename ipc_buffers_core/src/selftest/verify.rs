//! Checks of page state after each step of an allocation cycle.

use log::error;

use crate::memory::BufferAllocator;

/// Check that every page touched by the buffer at `offset` of `size` bytes is resident and not
/// reclaimable. Stops at the first page that is not.
pub(super) fn buffer_pages_allocated<A: BufferAllocator + ?Sized>(
    allocator: &A,
    offset: usize,
    size: usize,
) -> bool {
    for index in allocator.page_size().span(offset, size) {
        let state = allocator.page_state(index);
        if !state.resident || state.reclaimable {
            error!("expect alloc but is {state} at page index {index}");
            return false;
        }
    }
    true
}

/// Check that every page wholly inside `0..extent` is on the reclaim list.
///
/// Returns the number of pages that are not.
pub(super) fn pages_reclaimable<A: BufferAllocator + ?Sized>(allocator: &A, extent: usize) -> usize {
    (0..extent / allocator.page_size().bytes())
        .filter(|&index| {
            let state = allocator.page_state(index);
            if state.reclaimable {
                false
            } else {
                error!("expect lru but is {state} at page index {index}");
                true
            }
        })
        .count()
}

/// Check that no page of the region is resident.
///
/// Returns the number of pages that still are.
pub(super) fn pages_released<A: BufferAllocator + ?Sized>(allocator: &A) -> usize {
    (0..allocator.region_size() / allocator.page_size().bytes())
        .filter(|&index| {
            let state = allocator.page_state(index);
            if state.resident {
                error!("expect free but is {state} at page index {index}");
            }
            state.resident
        })
        .count()
}
