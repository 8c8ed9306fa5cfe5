//! Overflow safe sizing for array allocations. The classical `count * size`
//! multiplication is wrong because the product can wrap around and silently
//! allocate less memory than the caller asked for, see
//! <https://cert.uni-stuttgart.de/ticker/advisories/calloc.en.html>.

/// Computes `count * size` for an array allocation request. Returns `None`
/// if either factor is zero or if the product does not fit in [`usize`], so
/// the caller can refuse the request instead of truncating it.
#[inline]
pub(crate) fn checked_array_size(count: usize, size: usize) -> Option<usize> {
    if count == 0 || size == 0 {
        return None;
    }

    count.checked_mul(size)
}
