use alloc::vec::Vec;
use core::{
    num::NonZeroU32,
    sync::atomic::{AtomicUsize, Ordering},
};
use snafu::ensure;

use super::{FrameAllocator, OutOfMemorySnafu, Result, UnknownFrameSnafu};

/// A physical frame handed out by a [`FrameAllocator`].
///
/// Frames are not `Copy`. Whoever holds one owns the backing memory until it is
/// returned with [`FrameAllocator::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct Frame(u32);

impl Frame {
    /// The frame number within its pool.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.0
    }
}

/// A fixed pool of frames tracked with an atomic bit set.
///
/// Allocation and freeing are lock-free, so the pool can be shared between regions without any
/// outside synchronization.
pub struct FramePool {
    /// One bit per frame, set while the frame is allocated.
    bits: Vec<AtomicUsize>,
    capacity: NonZeroU32,
    free: AtomicUsize,
}

impl FramePool {
    /// Create a pool of `capacity` frames, all initially free.
    #[must_use]
    pub fn new(capacity: NonZeroU32) -> Self {
        let num_words = capacity.get().div_ceil(usize::BITS);
        let mut bits = Vec::with_capacity(num_words as usize);
        for _ in 0..num_words {
            bits.push(AtomicUsize::new(0));
        }
        Self {
            bits,
            capacity,
            free: AtomicUsize::new(capacity.get() as usize),
        }
    }

    /// Total number of frames in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get() as usize
    }

    /// Number of frames not currently allocated.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }
}

impl FrameAllocator for FramePool {
    // the frame number always fits in a u32 because it is less than `capacity`
    #[allow(clippy::cast_possible_truncation)]
    fn allocate(&self) -> Result<Frame> {
        for (word_index, word) in self.bits.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != usize::MAX {
                let zero_bit = (!current).trailing_zeros();
                let number = word_index as u32 * usize::BITS + zero_bit;
                if number >= self.capacity.get() {
                    break;
                }
                match word.compare_exchange_weak(
                    current,
                    current | (1 << zero_bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.free.fetch_sub(1, Ordering::AcqRel);
                        return Ok(Frame(number));
                    }
                    Err(prev) => current = prev,
                }
            }
        }
        OutOfMemorySnafu.fail()
    }

    fn free(&self, frame: Frame) -> Result<()> {
        ensure!(frame.0 < self.capacity.get(), UnknownFrameSnafu);
        let word = &self.bits[(frame.0 / usize::BITS) as usize];
        let mask = 1 << (frame.0 % usize::BITS);
        let prev = word.fetch_and(!mask, Ordering::AcqRel);
        ensure!(prev & mask != 0, UnknownFrameSnafu);
        self.free.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
