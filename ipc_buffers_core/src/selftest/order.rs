//! Free-order permutations.

/// Call `f` with every permutation of `0..N`, in lexicographic order.
pub(super) fn for_each_permutation<const N: usize>(mut f: impl FnMut(&[usize; N])) {
    let mut order = [0; N];
    fill(&mut order, 0, &mut f);
}

fn fill<const N: usize, F: FnMut(&[usize; N])>(order: &mut [usize; N], depth: usize, f: &mut F) {
    if depth == N {
        f(order);
        return;
    }
    for i in 0..N {
        if order[..depth].contains(&i) {
            continue;
        }
        order[depth] = i;
        fill(order, depth + 1, f);
    }
}
