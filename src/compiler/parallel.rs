//! Work partitioning helpers for external dispatchers.
//!
//! The engine runs no threads itself; these helpers only describe how a flat
//! iteration space splits across `nthr` workers so each receives a disjoint,
//! contiguous range.

use std::ops::Range;

/// Split `n` items over `nthr` workers, returning worker `ithr`'s range.
///
/// The first `n - (ceil(n / nthr) - 1) * nthr` workers receive
/// `ceil(n / nthr)` items and the rest one fewer, so sizes differ by at most
/// one and ranges are ordered by worker index.
pub fn balance211(n: usize, nthr: usize, ithr: usize) -> Range<usize> {
    if nthr <= 1 || n == 0 {
        return if ithr == 0 { 0..n } else { n..n };
    }
    let n1 = n.div_ceil(nthr);
    let n2 = n1 - 1;
    let t1 = n - n2 * nthr;
    let (start, len) = if ithr < t1 {
        (ithr * n1, n1)
    } else {
        (t1 * n1 + (ithr - t1) * n2, n2)
    };
    let start = start.min(n);
    start..(start + len).min(n)
}
