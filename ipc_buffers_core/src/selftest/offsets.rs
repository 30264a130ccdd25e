//! Enumeration of buffer end offsets around page boundaries.

use crate::memory::PageSize;

use super::MIN_BUFFER_DIVISOR;

/// Ways the end of a buffer can fall relative to the page boundaries after the end of the
/// previous buffer.
///
/// Each rule starts from where the previous rule left off, so the rules must be applied in order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum AlignRule {
    SamePageUnaligned,
    SamePageAligned,
    NextPageUnaligned,
    NextPageAligned,
    NextNextUnaligned,
}

impl AlignRule {
    pub(super) const ALL: [AlignRule; 5] = [
        AlignRule::SamePageUnaligned,
        AlignRule::SamePageAligned,
        AlignRule::NextPageUnaligned,
        AlignRule::NextPageAligned,
        AlignRule::NextNextUnaligned,
    ];

    /// Move `end` on to the candidate for this rule.
    fn advance(self, end: usize, page_size: PageSize) -> usize {
        match self {
            AlignRule::SamePageAligned | AlignRule::NextPageAligned => page_size.align_up(end),
            AlignRule::SamePageUnaligned
            | AlignRule::NextPageUnaligned
            | AlignRule::NextNextUnaligned => end + min_buffer_size(page_size),
        }
    }

    /// The end offset this rule produces for a buffer starting at `prev`.
    #[cfg(test)]
    pub(super) fn end_after(self, prev: usize, page_size: PageSize) -> usize {
        Self::ALL
            .iter()
            .take_while(|r| **r != self)
            .chain(core::iter::once(&self))
            .fold(prev, |end, r| r.advance(end, page_size))
    }
}

/// The smallest buffer the harness allocates.
pub(super) const fn min_buffer_size(page_size: PageSize) -> usize {
    page_size.bytes() / MIN_BUFFER_DIVISOR
}

/// The largest final end offset [`for_each_configuration`] can produce for `N` buffers.
pub(super) const fn max_end<const N: usize>(page_size: PageSize) -> usize {
    2 * N * page_size.bytes() + min_buffer_size(page_size)
}

/// Call `f` with every combination of [`AlignRule`]s applied to the ends of `N` consecutive
/// buffers. There are `5^N` combinations.
pub(super) fn for_each_configuration<const N: usize>(
    page_size: PageSize,
    mut f: impl FnMut(&[usize; N]),
) {
    let mut ends = [0; N];
    fill(&mut ends, 0, page_size, &mut f);
}

fn fill<const N: usize, F: FnMut(&[usize; N])>(
    ends: &mut [usize; N],
    index: usize,
    page_size: PageSize,
    f: &mut F,
) {
    if index == N {
        f(ends);
        return;
    }
    let mut end = if index == 0 { 0 } else { ends[index - 1] };
    for rule in AlignRule::ALL {
        end = rule.advance(end, page_size);
        ends[index] = end;
        fill(ends, index + 1, page_size, f);
    }
}
