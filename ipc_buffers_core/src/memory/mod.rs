//! Page-backed buffer allocation for IPC transactions.
//!
//! A [`BufferRegion`] carves variable sized buffers out of a fixed region of virtual memory.
//! Pages of the region are only backed by physical frames (from a [`FrameAllocator`]) while some
//! buffer touches them. When the last buffer on a page is freed the page is not released right
//! away, but placed on a shared [`ReclaimList`] where it waits until it is either reused by a new
//! buffer or evicted.

use core::{fmt, ops::Range};
use snafu::Snafu;

mod frames;
pub use frames::{Frame, FramePool};

mod lru;
pub use lru::{Reclaim, ReclaimList, Walk};

mod region;
pub use region::BufferRegion;

/// Errors that arise due to buffer and frame allocation.
#[derive(Debug, Snafu)]
pub enum Error {
    /// There is no free space in the region, or no free frame to back it.
    OutOfMemory,
    /// A size was provided that is not valid (i.e. is zero, or is too large).
    InvalidSize,
    /// A buffer was provided that is not known to the allocator.
    UnknownBuffer,
    /// A frame was freed that is not currently allocated from the pool.
    UnknownFrame,
    /// The region has not been mapped yet, so no buffers can be allocated from it.
    NotMapped,
}

/// Result type for memory operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The size of a page.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageSize {
    /// 4 KiB pages.
    #[default]
    FourKiB,
    /// 16 KiB pages.
    SixteenKiB,
    /// 64 KiB pages.
    SixtyFourKiB,
}

impl PageSize {
    /// The number of bytes in one page.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::FourKiB => 4 * 1024,
            PageSize::SixteenKiB => 16 * 1024,
            PageSize::SixtyFourKiB => 64 * 1024,
        }
    }

    /// Round `offset` up to the next page boundary.
    #[must_use]
    pub const fn align_up(self, offset: usize) -> usize {
        offset.next_multiple_of(self.bytes())
    }

    /// The indices of every page touched by the byte range `offset..offset + size`.
    #[must_use]
    pub const fn span(self, offset: usize, size: usize) -> Range<usize> {
        offset / self.bytes()..(offset + size).div_ceil(self.bytes())
    }
}

impl From<PageSize> for usize {
    fn from(value: PageSize) -> Self {
        value.bytes()
    }
}

impl TryFrom<usize> for PageSize {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            0x1000 => Ok(PageSize::FourKiB),
            0x4000 => Ok(PageSize::SixteenKiB),
            0x10000 => Ok(PageSize::SixtyFourKiB),
            _ => InvalidSizeSnafu.fail(),
        }
    }
}

/// A buffer allocated from a [`BufferAllocator`].
///
/// The handle is owned by whoever allocated it until it is given back with
/// [`BufferAllocator::free`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    offset: usize,
    size: usize,
}

impl Buffer {
    /// Create a handle for the buffer at byte `offset` in the region that was requested with `size` bytes.
    #[must_use]
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// Offset in bytes of the start of the buffer from the start of the region.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// The size in bytes that was requested for this buffer.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Observable state of one page of a region.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PageState {
    /// A physical frame currently backs the page.
    pub resident: bool,
    /// The page is linked into the reclaim list.
    pub reclaimable: bool,
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.reclaimable {
            "lru"
        } else if self.resident {
            "alloc"
        } else {
            "free"
        })
    }
}

/// A source of physical frames to back the pages of a region.
///
/// Implementers of this trait must provide internal synchronization.
pub trait FrameAllocator {
    /// Allocate one frame.
    ///
    /// # Errors
    /// - [`Error::OutOfMemory`] if there are no free frames left.
    fn allocate(&self) -> Result<Frame>;

    /// Return `frame` to the allocator.
    ///
    /// # Errors
    /// - [`Error::UnknownFrame`] if `frame` was not allocated by this allocator.
    fn free(&self, frame: Frame) -> Result<()>;
}

/// An allocator of variable sized buffers inside a page-backed region.
///
/// This is the complete interface the [`crate::selftest`] harness uses to drive and observe an
/// allocator, so it exposes the per-page state alongside allocation.
#[cfg_attr(test, mockall::automock)]
pub trait BufferAllocator {
    /// The size of the pages making up the region.
    fn page_size(&self) -> PageSize;

    /// Total size in bytes of the region. Always a whole number of pages.
    fn region_size(&self) -> usize;

    /// True once the region has been mapped and buffers can be allocated from it.
    fn is_mapped(&self) -> bool;

    /// Allocate a buffer of `size` bytes.
    ///
    /// # Errors
    /// - [`Error::InvalidSize`] if `size` is zero.
    /// - [`Error::OutOfMemory`] if no free space or backing frames are available.
    /// - [`Error::NotMapped`] if the region has not been mapped yet.
    fn allocate(&self, size: usize) -> Result<Buffer>;

    /// Free a buffer previously returned by [`BufferAllocator::allocate`].
    ///
    /// # Errors
    /// - [`Error::UnknownBuffer`] if the buffer is not currently allocated from this region.
    fn free(&self, buffer: Buffer) -> Result<()>;

    /// The current state of page `index`. Pages outside the region are never resident.
    fn page_state(&self, index: usize) -> PageState;

    /// Number of pages waiting on the reclaim list.
    fn reclaimable_pages(&self) -> usize;

    /// Evict up to `max` pages from the reclaim list, returning how many entries were removed.
    fn evict(&self, max: usize) -> usize;
}
