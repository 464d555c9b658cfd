//! Work-efficient exclusive prefix sum.
//!
//! The device path splits the input into [`SCAN_BLOCK_SIZE`]-wide blocks,
//! scans every block independently, then scans the per-block totals the
//! same way and adds each block's offset back in:
//!
//! ```text
//! level 0:  [ b0 | b1 | b2 | ... ]  ScanBlocks  → local prefixes + totals[]
//! level 1:  totals[]                ScanBlocks  → offsets[]  (recurse while > 1 block)
//! level 0:  local prefixes + offsets[block]      AddBlockOffsets → global prefix
//! ```
//!
//! Every level divides the element count by the block width, so the
//! recursion depth is `ceil(log_256 n)`. Sums wrap on overflow, matching
//! 32-bit two's-complement device arithmetic.

use crate::device::{
    Device, KernelArg, MemAccess, KERNEL_ADD_BLOCK_OFFSETS, KERNEL_SCAN_BLOCKS,
    PREFIX_SUM_SOURCE,
};
use crate::sizing::{next_multiple_of, pad_to, SCAN_BLOCK_SIZE};
use crate::{MppError, MppResult};

use tracing::debug;

/// Sequential exclusive prefix sum: `out[0] = 0`,
/// `out[i] = out[i - 1] + elements[i - 1]`.
///
/// Reference result for [`PrefixSum::calculate_gpu`].
pub fn calculate_cpu(elements: &[i32]) -> Vec<i32> {
    let mut sum = 0i32;
    elements
        .iter()
        .map(|&x| {
            let prefix = sum;
            sum = sum.wrapping_add(x);
            prefix
        })
        .collect()
}

/// Prefix sum engine bound to one device.
///
/// Holds no device memory between calls: every buffer is allocated inside
/// [`calculate_gpu`](Self::calculate_gpu) and released before it returns.
pub struct PrefixSum<'d, D: Device> {
    device: &'d D,
}

impl<D: Device> std::fmt::Debug for PrefixSum<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixSum")
            .field("device", &self.device.name())
            .finish()
    }
}

impl<'d, D: Device> PrefixSum<'d, D> {
    /// Register the scan kernels with `device`.
    pub fn load_kernels(device: &mut D) -> MppResult<()> {
        device.load_kernel(
            PREFIX_SUM_SOURCE,
            &[KERNEL_SCAN_BLOCKS, KERNEL_ADD_BLOCK_OFFSETS],
        )
    }

    pub fn new(device: &'d D) -> Self {
        PrefixSum { device }
    }

    /// Exclusive prefix sum computed on the device.
    ///
    /// Produces exactly what [`calculate_cpu`] produces.
    pub fn calculate_gpu(&self, elements: &[i32]) -> MppResult<Vec<i32>> {
        if elements.is_empty() {
            return Ok(Vec::new());
        }

        let padded = pad_to(elements, SCAN_BLOCK_SIZE, 0);
        let n = padded.len();
        let mut input = self.device.allocate(byte_len(n), MemAccess::ReadOnly)?;
        self.device.write(&mut input, &padded)?;
        let output = self.device.allocate(byte_len(n), MemAccess::ReadWrite)?;

        self.scan(&input, &output, n, 0)?;

        let mut result = vec![0i32; elements.len()];
        self.device.read(&output, &mut result)?;
        Ok(result)
    }

    /// Scan `n` elements of `input` into `output`; `n` is a whole number
    /// of blocks. Scratch buffers live only for this level.
    fn scan(&self, input: &D::Buffer, output: &D::Buffer, n: usize, depth: usize) -> MppResult<()> {
        debug_assert_eq!(n % SCAN_BLOCK_SIZE, 0);
        let num_blocks = n / SCAN_BLOCK_SIZE;
        // Totals are padded with zeros so the next level is block-aligned too.
        let padded_blocks = next_multiple_of(num_blocks, SCAN_BLOCK_SIZE);

        let mut block_totals = self
            .device
            .allocate(byte_len(padded_blocks), MemAccess::ReadWrite)?;
        self.device
            .write(&mut block_totals, &vec![0i32; padded_blocks])?;

        debug!(depth, n, num_blocks, "scan level");
        self.device.dispatch(
            KERNEL_SCAN_BLOCKS,
            &[
                KernelArg::Buffer(input),
                KernelArg::Buffer(output),
                KernelArg::Buffer(&block_totals),
            ],
            n,
            SCAN_BLOCK_SIZE,
        )?;

        if num_blocks == 1 {
            return Ok(());
        }
        let count = u32::try_from(n).map_err(|_| MppError::InvalidInput)?;

        let block_offsets = self
            .device
            .allocate(byte_len(padded_blocks), MemAccess::ReadWrite)?;
        self.scan(&block_totals, &block_offsets, padded_blocks, depth + 1)?;

        self.device.dispatch(
            KERNEL_ADD_BLOCK_OFFSETS,
            &[
                KernelArg::Buffer(output),
                KernelArg::Buffer(&block_offsets),
                KernelArg::Buffer(output),
                KernelArg::U32(count),
            ],
            n,
            SCAN_BLOCK_SIZE,
        )
    }
}

fn byte_len(elements: usize) -> usize {
    elements * std::mem::size_of::<i32>()
}
