//! Buffer sizes derived from a set of end offsets.

/// Sizes of `N` buffers that, allocated in order from the start of a region, exactly fill
/// `0..extent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SizeSequence<const N: usize> {
    pub sizes: [usize; N],
    pub extent: usize,
}

/// Derive the two size sequences for buffers ending at `ends`.
///
/// The first is the forward sequence: the gaps between consecutive ends, filling `0..ends[N-1]`.
/// The second is the same gaps in reverse order, with the space left between the last end and
/// `region_size` added to its first buffer so that it fills the whole region.
pub(super) fn derive<const N: usize>(ends: &[usize; N], region_size: usize) -> [SizeSequence<N>; 2] {
    let mut forward = [0; N];
    let mut mirrored = [0; N];
    let mut prev = 0;
    for (i, &end) in ends.iter().enumerate() {
        forward[i] = end - prev;
        mirrored[N - i - 1] = forward[i];
        prev = end;
    }
    mirrored[0] += region_size - prev;
    [
        SizeSequence {
            sizes: forward,
            extent: prev,
        },
        SizeSequence {
            sizes: mirrored,
            extent: region_size,
        },
    ]
}
