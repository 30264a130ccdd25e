//! One full allocate/free/reclaim cycle against an allocator.

use itertools::Itertools as _;
use log::error;

use crate::memory::{Buffer, BufferAllocator};

use super::verify;

/// Drives an allocator through allocation cycles, counting every failure it sees.
pub(super) struct Executor<'a, A: ?Sized> {
    allocator: &'a A,
    failures: usize,
}

impl<'a, A: BufferAllocator + ?Sized> Executor<'a, A> {
    pub(super) fn new(allocator: &'a A) -> Self {
        Self {
            allocator,
            failures: 0,
        }
    }

    /// Number of failures recorded so far.
    pub(super) fn failures(&self) -> usize {
        self.failures
    }

    /// Run one cycle for buffers of `sizes` that are freed in `order`, where the buffers fill
    /// `0..extent` of the region:
    ///
    /// 1. allocate every buffer, checking its pages are resident
    /// 2. free in `order`, checking every page in the extent became reclaimable
    /// 3. allocate every buffer again, which must reuse all the reclaimable pages
    /// 4. free in `order` again
    /// 5. drain the reclaim list, checking nothing in the region is left resident
    pub(super) fn run<const N: usize>(&mut self, sizes: &[usize; N], order: &[usize; N], extent: usize) {
        let mut buffers: [Option<Buffer>; N] = core::array::from_fn(|_| None);

        self.allocate_all(&mut buffers, sizes, order);
        self.free_all(&mut buffers, sizes, order, extent);

        self.allocate_all(&mut buffers, sizes, order);
        let leftover = self.allocator.reclaimable_pages();
        if leftover > 0 {
            error!("lru list should be empty but has {leftover} pages");
            report(sizes, order);
            self.failures += 1;
        }

        self.free_all(&mut buffers, sizes, order, extent);
        self.drain();
    }

    fn allocate_all<const N: usize>(
        &mut self,
        buffers: &mut [Option<Buffer>; N],
        sizes: &[usize; N],
        order: &[usize; N],
    ) {
        for (slot, &size) in buffers.iter_mut().zip(sizes) {
            let ok = match self.allocator.allocate(size) {
                Ok(buffer) => {
                    let ok = verify::buffer_pages_allocated(
                        self.allocator,
                        buffer.offset(),
                        buffer.size(),
                    );
                    *slot = Some(buffer);
                    ok
                }
                Err(e) => {
                    error!("failed to allocate {size} bytes: {e}");
                    false
                }
            };
            if !ok {
                report(sizes, order);
                self.failures += 1;
            }
        }
    }

    fn free_all<const N: usize>(
        &mut self,
        buffers: &mut [Option<Buffer>; N],
        sizes: &[usize; N],
        order: &[usize; N],
        extent: usize,
    ) {
        for &index in order {
            let Some(buffer) = buffers[index].take() else {
                continue;
            };
            if let Err(e) = self.allocator.free(buffer) {
                error!("failed to free buffer {index}: {e}");
                report(sizes, order);
                self.failures += 1;
            }
        }

        let mismatches = verify::pages_reclaimable(self.allocator, extent);
        if mismatches > 0 {
            report(sizes, order);
            self.failures += mismatches;
        }
    }

    fn drain(&mut self) {
        loop {
            let count = self.allocator.reclaimable_pages();
            if count == 0 {
                break;
            }
            if self.allocator.evict(count) == 0 {
                error!("lru list stuck with {count} pages");
                self.failures += 1;
                break;
            }
        }
        self.failures += verify::pages_released(self.allocator);
    }
}

/// Log the sizes and free order of the cycle that just failed.
fn report(sizes: &[usize], order: &[usize]) {
    error!(
        "alloc sizes: {}",
        sizes.iter().format_with("", |s, f| f(&format_args!("[{s}]")))
    );
    error!(
        "free seq: {}",
        order.iter().format_with("", |i, f| f(&format_args!("[{i}]")))
    );
}
