//! A region of buffers backed lazily by physical frames.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ops::Range;

use log::{debug, trace, warn};
use snafu::{ensure, OptionExt as _};
use spin::Mutex;

use super::{
    Buffer, BufferAllocator, Frame, FrameAllocator, InvalidSizeSnafu, NotMappedSnafu,
    OutOfMemorySnafu, PageSize, PageState, Reclaim, ReclaimList, Result, UnknownBufferSnafu, Walk,
};

/// Buffer sizes are rounded up to a multiple of this.
const BUFFER_ALIGN: usize = core::mem::size_of::<usize>();

#[derive(Default)]
struct Page {
    frame: Option<Frame>,
    /// Number of allocated buffers that touch this page.
    users: usize,
    on_lru: bool,
}

#[derive(Debug)]
struct Chunk {
    size: usize,
    free: bool,
}

struct State {
    mapped: bool,
    /// Every byte of the region belongs to exactly one chunk, keyed by its offset.
    chunks: BTreeMap<usize, Chunk>,
    pages: Vec<Page>,
}

impl State {
    /// Find the smallest free chunk that can hold `size` bytes, preferring the lowest offset.
    fn best_fit(&self, size: usize) -> Option<usize> {
        self.chunks
            .iter()
            .filter(|(_, c)| c.free && c.size >= size)
            .min_by_key(|(_, c)| c.size)
            .map(|(offset, _)| *offset)
    }

    /// Mark the first `size` bytes of the free chunk at `offset` allocated, splitting off the rest.
    fn split(&mut self, offset: usize, size: usize) {
        let Some(chunk) = self.chunks.get_mut(&offset) else {
            return;
        };
        let rest = chunk.size - size;
        chunk.size = size;
        chunk.free = false;
        if rest > 0 {
            self.chunks.insert(
                offset + size,
                Chunk {
                    size: rest,
                    free: true,
                },
            );
        }
    }

    /// Mark the allocated chunk at `offset` free and merge it with free neighbours.
    fn merge(&mut self, offset: usize) {
        let Some(chunk) = self.chunks.get_mut(&offset) else {
            return;
        };
        chunk.free = true;

        let next_offset = offset + chunk.size;
        if self.chunks.get(&next_offset).is_some_and(|c| c.free) {
            let next = self.chunks.remove(&next_offset).map_or(0, |c| c.size);
            self.grow(offset, next);
        }

        let prev_offset = self
            .chunks
            .range(..offset)
            .next_back()
            .filter(|(_, c)| c.free)
            .map(|(o, _)| *o);
        if let Some(prev_offset) = prev_offset {
            let size = self.chunks.remove(&offset).map_or(0, |c| c.size);
            self.grow(prev_offset, size);
        }
    }

    fn grow(&mut self, offset: usize, by: usize) {
        if let Some(chunk) = self.chunks.get_mut(&offset) {
            chunk.size += by;
        }
    }
}

struct Inner<F: FrameAllocator> {
    page_size: PageSize,
    size: usize,
    frames: Arc<F>,
    lru: Arc<ReclaimList>,
    state: Mutex<State>,
}

impl<F: FrameAllocator> Inner<F> {
    /// Add a user to every page in `pages`, pulling pages off the reclaim list or backing them with
    /// fresh frames as they go from unused to used.
    ///
    /// If a frame cannot be allocated every page taken so far is released again.
    fn take_pages(
        &self,
        state: &mut State,
        owner: &Weak<dyn Reclaim>,
        pages: Range<usize>,
    ) -> Result<()> {
        for index in pages.clone() {
            let page = &mut state.pages[index];
            page.users += 1;
            if page.users > 1 {
                continue;
            }
            if page.on_lru {
                page.on_lru = false;
                if !self.lru.remove(owner, index) {
                    trace!("page {index} was mid-walk when reused");
                }
            } else if page.frame.is_none() {
                match self.frames.allocate() {
                    Ok(frame) => {
                        trace!("page {index} backed by frame {}", frame.number());
                        page.frame = Some(frame);
                    }
                    Err(e) => {
                        page.users -= 1;
                        self.release_pages(state, owner, pages.start..index);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a user from every page in `pages`, moving pages that become unused to the reclaim list.
    fn release_pages(&self, state: &mut State, owner: &Weak<dyn Reclaim>, pages: Range<usize>) {
        for index in pages {
            let page = &mut state.pages[index];
            page.users -= 1;
            if page.users == 0 {
                page.on_lru = true;
                self.lru.push(owner.clone(), index);
            }
        }
    }
}

impl<F: FrameAllocator + Send + Sync> Reclaim for Inner<F> {
    fn reclaim(&self, index: usize) -> Walk {
        let Some(mut state) = self.state.try_lock() else {
            return Walk::Busy;
        };
        let Some(page) = state.pages.get_mut(index) else {
            return Walk::Removed;
        };
        if !page.on_lru || page.users > 0 {
            // reused while the walk had it off the list
            return Walk::Removed;
        }
        page.on_lru = false;
        if let Some(frame) = page.frame.take() {
            trace!("evicting page {index} from frame {}", frame.number());
            if let Err(e) = self.frames.free(frame) {
                warn!("failed to return frame of page {index}: {e}");
            }
        }
        Walk::Removed
    }
}

impl<F: FrameAllocator> Drop for Inner<F> {
    fn drop(&mut self) {
        for page in &mut self.state.get_mut().pages {
            if let Some(frame) = page.frame.take() {
                if let Err(e) = self.frames.free(frame) {
                    warn!("failed to return frame on region drop: {e}");
                }
            }
        }
    }
}

/// A fixed region of memory that buffers are allocated from.
///
/// Buffers are placed best-fit. A page of the region is backed by a frame from `F` only while some
/// buffer touches it; once no buffer does, the page goes onto the shared [`ReclaimList`] and keeps
/// its frame until it is either used again or evicted by [`ReclaimList::walk`].
pub struct BufferRegion<F: FrameAllocator + Send + Sync + 'static> {
    inner: Arc<Inner<F>>,
}

impl<F: FrameAllocator + Send + Sync + 'static> BufferRegion<F> {
    /// Create a region of `pages` pages of `page_size`, backed by frames from `frames`, whose
    /// unused pages go on `lru`.
    ///
    /// The region starts out unmapped; see [`BufferRegion::map`].
    ///
    /// # Panics
    /// If `pages` is zero.
    pub fn new(page_size: PageSize, pages: usize, frames: Arc<F>, lru: Arc<ReclaimList>) -> Self {
        assert!(pages > 0, "region must have at least one page");
        let size = pages * page_size.bytes();
        let mut chunks = BTreeMap::new();
        chunks.insert(0, Chunk { size, free: true });
        let mut page_list = Vec::with_capacity(pages);
        page_list.resize_with(pages, Page::default);
        Self {
            inner: Arc::new(Inner {
                page_size,
                size,
                frames,
                lru,
                state: Mutex::new(State {
                    mapped: false,
                    chunks,
                    pages: page_list,
                }),
            }),
        }
    }

    /// Make the region available for allocation.
    pub fn map(&self) {
        self.inner.state.lock().mapped = true;
        debug!(
            "mapped buffer region of {} bytes ({} pages)",
            self.inner.size,
            self.inner.size / self.inner.page_size.bytes()
        );
    }

    /// Number of bytes not currently allocated to a buffer.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.inner
            .state
            .lock()
            .chunks
            .values()
            .filter(|c| c.free)
            .map(|c| c.size)
            .sum()
    }

    fn owner(&self) -> Weak<dyn Reclaim> {
        let inner: Arc<dyn Reclaim> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

impl<F: FrameAllocator + Send + Sync + 'static> BufferAllocator for BufferRegion<F> {
    fn page_size(&self) -> PageSize {
        self.inner.page_size
    }

    fn region_size(&self) -> usize {
        self.inner.size
    }

    fn is_mapped(&self) -> bool {
        self.inner.state.lock().mapped
    }

    fn allocate(&self, size: usize) -> Result<Buffer> {
        ensure!(size > 0, InvalidSizeSnafu);
        let aligned = size
            .checked_next_multiple_of(BUFFER_ALIGN)
            .context(InvalidSizeSnafu)?;

        let owner = self.owner();
        let mut state = self.inner.state.lock();
        ensure!(state.mapped, NotMappedSnafu);
        let offset = state.best_fit(aligned).context(OutOfMemorySnafu)?;
        self.inner.take_pages(
            &mut state,
            &owner,
            self.inner.page_size.span(offset, aligned),
        )?;
        state.split(offset, aligned);

        trace!("allocated {size} bytes at {offset:#x}");
        Ok(Buffer::new(offset, size))
    }

    fn free(&self, buffer: Buffer) -> Result<()> {
        let owner = self.owner();
        let mut state = self.inner.state.lock();
        let expected = buffer.size().checked_next_multiple_of(BUFFER_ALIGN);
        let size = state
            .chunks
            .get(&buffer.offset())
            .filter(|c| !c.free && Some(c.size) == expected)
            .map(|c| c.size)
            .context(UnknownBufferSnafu)?;

        state.merge(buffer.offset());
        self.inner.release_pages(
            &mut state,
            &owner,
            self.inner.page_size.span(buffer.offset(), size),
        );

        trace!("freed {} bytes at {:#x}", buffer.size(), buffer.offset());
        Ok(())
    }

    fn page_state(&self, index: usize) -> PageState {
        self.inner
            .state
            .lock()
            .pages
            .get(index)
            .map(|p| PageState {
                resident: p.frame.is_some(),
                reclaimable: p.on_lru,
            })
            .unwrap_or_default()
    }

    fn reclaimable_pages(&self) -> usize {
        self.inner.lru.len()
    }

    fn evict(&self, max: usize) -> usize {
        self.inner.lru.walk(max)
    }
}

impl<F: FrameAllocator + Send + Sync + 'static> Drop for BufferRegion<F> {
    fn drop(&mut self) {
        self.inner.lru.purge(&self.owner());
    }
}

#[cfg(test)]
mod tests {
    use core::num::NonZeroU32;

    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use std::vec::Vec;
    use test_case::test_case;

    use super::*;
    use crate::memory::{Error, FramePool};

    const PAGE: usize = 4096;

    struct Fixture {
        frames: Arc<FramePool>,
        lru: Arc<ReclaimList>,
        region: BufferRegion<FramePool>,
    }

    fn setup(pages: usize, frames: u32) -> Fixture {
        let frames = Arc::new(FramePool::new(NonZeroU32::new(frames).unwrap()));
        let lru = Arc::new(ReclaimList::new());
        let region = BufferRegion::new(PageSize::FourKiB, pages, frames.clone(), lru.clone());
        region.map();
        Fixture {
            frames,
            lru,
            region,
        }
    }

    fn state(resident: bool, reclaimable: bool) -> PageState {
        PageState {
            resident,
            reclaimable,
        }
    }

    #[test]
    fn unmapped_region_refuses_allocation() {
        let frames = Arc::new(FramePool::new(NonZeroU32::new(4).unwrap()));
        let region = BufferRegion::new(PageSize::FourKiB, 4, frames, Arc::default());
        assert!(!region.is_mapped());
        assert!(matches!(region.allocate(64), Err(Error::NotMapped)));
        region.map();
        assert!(region.is_mapped());
        assert!(region.allocate(64).is_ok());
    }

    #[test]
    fn zero_size_is_invalid() {
        let f = setup(4, 4);
        assert!(matches!(f.region.allocate(0), Err(Error::InvalidSize)));
    }

    #[test]
    fn too_large_is_out_of_memory() {
        let f = setup(4, 4);
        assert!(matches!(
            f.region.allocate(4 * PAGE + 1),
            Err(Error::OutOfMemory)
        ));
        assert!(matches!(
            f.region.allocate(usize::MAX),
            Err(Error::InvalidSize)
        ));
    }

    #[test]
    fn buffers_are_placed_in_order() {
        let f = setup(4, 4);
        let a = f.region.allocate(512).unwrap();
        let b = f.region.allocate(3584).unwrap();
        let c = f.region.allocate(100).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 512);
        assert_eq!(c.offset(), 4096);
        // sizes are rounded up to pointer alignment
        let d = f.region.allocate(1).unwrap();
        assert_eq!(d.offset(), 4096 + 104);
        assert_eq!(d.size(), 1);
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let f = setup(4, 4);
        let a = f.region.allocate(1024).unwrap();
        let _b = f.region.allocate(64).unwrap();
        let c = f.region.allocate(256).unwrap();
        let _d = f.region.allocate(64).unwrap();
        f.region.free(a).unwrap();
        f.region.free(c).unwrap();
        // both the 1024 and the 256 byte holes fit, the smaller one wins
        let e = f.region.allocate(200).unwrap();
        assert_eq!(e.offset(), 1024 + 64);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let f = setup(2, 2);
        let total = f.region.region_size();
        let buffers: Vec<_> = [1000, 2000, 3000]
            .into_iter()
            .map(|s| f.region.allocate(s).unwrap())
            .collect();
        let mut buffers = buffers.into_iter();
        let (a, b, c) = (
            buffers.next().unwrap(),
            buffers.next().unwrap(),
            buffers.next().unwrap(),
        );
        f.region.free(a).unwrap();
        f.region.free(c).unwrap();
        f.region.free(b).unwrap();
        assert_eq!(f.region.free_bytes(), total);
        // the whole region is one chunk again
        let all = f.region.allocate(total).unwrap();
        assert_eq!(all.offset(), 0);
    }

    #[test]
    fn unknown_and_double_free() {
        let f = setup(4, 4);
        let a = f.region.allocate(128).unwrap();
        assert!(matches!(
            f.region.free(Buffer::new(8, 128)),
            Err(Error::UnknownBuffer)
        ));
        assert!(matches!(
            f.region.free(Buffer::new(0, 4000)),
            Err(Error::UnknownBuffer)
        ));
        f.region.free(a).unwrap();
        assert!(matches!(
            f.region.free(Buffer::new(0, 128)),
            Err(Error::UnknownBuffer)
        ));
    }

    #[test_case(512, &[0])]
    #[test_case(4096, &[0])]
    #[test_case(4097, &[0, 1])]
    #[test_case(3 * 4096, &[0, 1, 2])]
    fn allocation_backs_spanned_pages(size: usize, pages: &[usize]) {
        let f = setup(4, 4);
        let _buffer = f.region.allocate(size).unwrap();
        for index in 0..4 {
            let expected = pages.contains(&index);
            assert_eq!(
                f.region.page_state(index),
                state(expected, false),
                "page {index}"
            );
        }
        assert_eq!(f.frames.free_count(), 4 - pages.len());
    }

    #[test]
    fn shared_page_stays_until_last_user_frees() {
        let f = setup(2, 2);
        let a = f.region.allocate(3000).unwrap();
        let b = f.region.allocate(3000).unwrap();
        f.region.free(a).unwrap();
        // page 0 is still used by `b`
        assert_eq!(f.region.page_state(0), state(true, false));
        f.region.free(b).unwrap();
        assert_eq!(f.region.page_state(0), state(true, true));
        assert_eq!(f.region.page_state(1), state(true, true));
        assert_eq!(f.region.reclaimable_pages(), 2);
    }

    #[test]
    fn reuse_takes_pages_off_the_list() {
        let f = setup(4, 4);
        let a = f.region.allocate(2 * PAGE).unwrap();
        f.region.free(a).unwrap();
        assert_eq!(f.lru.len(), 2);

        let _b = f.region.allocate(2 * PAGE).unwrap();
        assert!(f.lru.is_empty());
        assert_eq!(f.region.page_state(0), state(true, false));
        assert_eq!(f.region.page_state(1), state(true, false));
        // no new frames were needed
        assert_eq!(f.frames.free_count(), 2);
    }

    #[test]
    fn eviction_returns_frames() {
        let f = setup(4, 4);
        let a = f.region.allocate(3 * PAGE).unwrap();
        f.region.free(a).unwrap();
        assert_eq!(f.frames.free_count(), 1);

        assert_eq!(f.region.evict(2), 2);
        assert_eq!(f.region.page_state(0), state(false, false));
        assert_eq!(f.region.page_state(1), state(false, false));
        assert_eq!(f.region.page_state(2), state(true, true));
        assert_eq!(f.frames.free_count(), 3);

        assert_eq!(f.region.evict(usize::MAX), 1);
        assert_eq!(f.frames.free_count(), 4);
        assert_eq!(f.region.reclaimable_pages(), 0);
    }

    #[test]
    fn frame_exhaustion_rolls_back() {
        let f = setup(4, 2);
        let a = f.region.allocate(PAGE).unwrap();
        // needs pages 1..4 but only one frame is left
        assert!(matches!(
            f.region.allocate(3 * PAGE),
            Err(Error::OutOfMemory)
        ));
        assert_eq!(f.region.page_state(0), state(true, false));
        // the page that did get a frame is now reclaimable rather than leaked
        assert_eq!(f.region.page_state(1), state(true, true));
        assert_eq!(f.region.page_state(2), state(false, false));
        assert_eq!(f.region.free_bytes(), 3 * PAGE);

        f.region.free(a).unwrap();
        f.region.evict(usize::MAX);
        assert_eq!(f.frames.free_count(), 2);
    }

    #[test]
    fn regions_share_one_list() {
        let frames = Arc::new(FramePool::new(NonZeroU32::new(8).unwrap()));
        let lru = Arc::new(ReclaimList::new());
        let r1 = BufferRegion::new(PageSize::FourKiB, 2, frames.clone(), lru.clone());
        let r2 = BufferRegion::new(PageSize::FourKiB, 2, frames.clone(), lru.clone());
        r1.map();
        r2.map();

        let a = r1.allocate(PAGE).unwrap();
        let b = r2.allocate(2 * PAGE).unwrap();
        r1.free(a).unwrap();
        r2.free(b).unwrap();
        assert_eq!(lru.len(), 3);
        assert_eq!(r1.reclaimable_pages(), 3);

        // evicting through one region drains pages of both
        assert_eq!(r1.evict(usize::MAX), 3);
        assert_eq!(r2.page_state(1), state(false, false));
        assert_eq!(frames.free_count(), 8);
    }

    #[test]
    fn dropping_region_releases_everything() {
        let f = setup(4, 4);
        let a = f.region.allocate(PAGE).unwrap();
        let _b = f.region.allocate(2 * PAGE).unwrap();
        f.region.free(a).unwrap();
        assert_eq!(f.lru.len(), 1);

        let Fixture {
            frames,
            lru,
            region,
        } = f;
        drop(region);
        assert!(lru.is_empty());
        assert_eq!(frames.free_count(), 4);
    }

    #[test]
    fn random_alloc_free_keeps_pages_consistent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut rng = StdRng::seed_from_u64(0x1eaf);
        let f = setup(16, 16);
        let mut live: Vec<Buffer> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=3 * PAGE);
                match f.region.allocate(size) {
                    Ok(buffer) => live.push(buffer),
                    Err(Error::OutOfMemory) => {}
                    Err(e) => panic!("unexpected error allocating: {e}"),
                }
            } else {
                live.shuffle(&mut rng);
                let buffer = live.pop().unwrap();
                f.region.free(buffer).expect("free live buffer");
            }
            if rng.gen_ratio(1, 10) {
                f.region.evict(rng.gen_range(1..4));
            }

            for buffer in &live {
                for index in PageSize::FourKiB.span(buffer.offset(), buffer.size()) {
                    assert_eq!(f.region.page_state(index), state(true, false));
                }
            }
        }

        for buffer in live.drain(..) {
            f.region.free(buffer).unwrap();
        }
        assert_eq!(f.region.free_bytes(), f.region.region_size());
        f.region.evict(usize::MAX);
        assert!(f.lru.is_empty());
        assert_eq!(f.frames.free_count(), f.frames.capacity());
    }
}
