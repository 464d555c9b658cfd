//! Work-group sizing shared by both engines.
//!
//! Every dispatch covers a range that is a whole number of work-groups.
//! Inputs are rounded up to that width and the tail is filled with a value
//! the kernel treats as a no-op (the `EMPTY_32` key for hashing, `0` for
//! scanning).

/// Wavefront width used to pad hash table key/value batches.
pub const WAVEFRONT_SIZE: usize = 32;

/// Work-group width of the local scan kernel (must match SCAN_BLOCK_SIZE
/// in prefix_sum.cl).
pub const SCAN_BLOCK_SIZE: usize = 256;

/// Upper bound for the local size of hash table dispatches.
pub const THREAD_BLOCK_SIZE: usize = 256;

/// Unoccupied table slot / missing lookup result (all 64 bits set).
pub const EMPTY: u64 = u64::MAX;

/// 32-bit view of [`EMPTY`]: padding key and "not found" value.
pub const EMPTY_32: u32 = u32::MAX;

/// Round `n` up to the next multiple of `multiple`.
///
/// `0` stays `0`; callers skip the dispatch in that case.
pub fn next_multiple_of(n: usize, multiple: usize) -> usize {
    debug_assert!(multiple > 0);
    n.div_ceil(multiple) * multiple
}

/// Copy `values` and extend the copy with `fill` up to the next multiple
/// of `multiple`.
pub fn pad_to<T: Copy>(values: &[T], multiple: usize, fill: T) -> Vec<T> {
    let padded_len = next_multiple_of(values.len(), multiple);
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(values);
    padded.resize(padded_len, fill);
    padded
}

/// Local work size for a hash table dispatch over `global` lanes.
///
/// `global` is a multiple of [`WAVEFRONT_SIZE`], so the result always
/// divides it.
pub fn hash_local_size(global: usize) -> usize {
    let mut local = global.min(THREAD_BLOCK_SIZE);
    while global % local != 0 {
        local -= WAVEFRONT_SIZE;
    }
    local
}
