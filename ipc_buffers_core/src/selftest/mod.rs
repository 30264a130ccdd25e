//! Exhaustive self-test of a [`BufferAllocator`].
//!
//! Getting page bookkeeping right where buffers start or end exactly on a page boundary, or
//! straddle one, depends on the order buffers are allocated and freed in, so rather than sampling
//! a few cases the self-test walks through all of them:
//!
//! - for each of the `5^N` ways to place the ends of `N` buffers around page boundaries
//!   ([`offsets`]),
//! - for the resulting buffer sizes, both in forward order and mirrored to end at the end of the
//!   region ([`sizes`]),
//! - for each of the `N!` orders to free the buffers in ([`order`]),
//!
//! the allocator is taken through a full allocate, free, reallocate, free, drain cycle ([`exec`]),
//! and the state of every relevant page is checked after each step ([`verify`]).
//!
//! Problems are logged and counted rather than aborting the run, so a single run reports every
//! violation at once. The run happens at most once per [`SelfTest`].

use core::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use spin::Mutex;

use crate::memory::BufferAllocator;

mod exec;
mod offsets;
mod order;
mod sizes;
mod verify;

/// Number of buffers allocated in each cycle of a default [`SelfTest`].
pub const DEFAULT_BUFFER_COUNT: usize = 5;

/// The smallest buffer the self-test allocates is one page divided by this.
pub const MIN_BUFFER_DIVISOR: usize = 8;

/// A session of the allocator self-test with `BUFFERS` buffers per allocation cycle.
///
/// The session remembers whether it has already run and how many failures it found. However
/// many times, and from however many threads, [`SelfTest::run`] is called, the test itself runs
/// only once.
pub struct SelfTest<const BUFFERS: usize = DEFAULT_BUFFER_COUNT> {
    done: AtomicBool,
    /// Total failures found. Also serializes runs.
    failures: Mutex<usize>,
}

impl<const BUFFERS: usize> SelfTest<BUFFERS> {
    const BUFFERS_FIT_IN_ONE_PAGE: () = assert!(
        BUFFERS > 0 && BUFFERS < MIN_BUFFER_DIVISOR,
        "the minimum sized buffers of one cycle must not fill a whole page"
    );

    /// The smallest region, in pages, that every buffer placement fits into.
    pub const MIN_REGION_PAGES: usize = 2 * BUFFERS + 1;

    /// Create a new session that has not run yet.
    #[must_use]
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::BUFFERS_FIT_IN_ONE_PAGE;
        Self {
            done: AtomicBool::new(false),
            failures: Mutex::new(0),
        }
    }

    /// True once the self-test has run to completion.
    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Run the self-test against `allocator`, unless it has already been run.
    ///
    /// The allocator must be mapped, unused, and its region at least [`Self::MIN_REGION_PAGES`]
    /// pages; if it is not, nothing happens and a later call can try again. The outcome is only
    /// reported in the log.
    pub fn run<A: BufferAllocator + ?Sized>(&self, allocator: &A) {
        if self.has_run() {
            return;
        }
        let mut failures = self.failures.lock();
        if self.has_run() || !allocator.is_mapped() {
            return;
        }

        let page_size = allocator.page_size();
        let region_size = allocator.region_size();
        if region_size < Self::MIN_REGION_PAGES * page_size.bytes() {
            error!(
                "region of {region_size} bytes is too small, need {} pages",
                Self::MIN_REGION_PAGES
            );
            return;
        }
        debug_assert!(offsets::max_end::<BUFFERS>(page_size) <= region_size);

        info!("STARTED");
        let mut executor = exec::Executor::new(allocator);
        offsets::for_each_configuration::<BUFFERS>(page_size, |ends| {
            for sequence in sizes::derive(ends, region_size) {
                order::for_each_permutation::<BUFFERS>(|order| {
                    executor.run(&sequence.sizes, order, sequence.extent);
                });
            }
        });
        *failures += executor.failures();
        self.done.store(true, Ordering::Release);

        if *failures > 0 {
            info!("{} tests FAILED", *failures);
        } else {
            info!("PASSED");
        }
    }
}

impl<const BUFFERS: usize> Default for SelfTest<BUFFERS> {
    fn default() -> Self {
        Self::new()
    }
}
