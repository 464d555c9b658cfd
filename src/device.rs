//! Device executor contract shared by every backend.
//!
//! A [`Device`] owns one execution context, one command queue and a
//! name → kernel registry. Engines borrow the device; they never create
//! contexts or compile programs themselves.
//!
//! ```text
//! ┌──────────────┐  alloc/write   ┌──────────────────┐   read   ┌─────────────┐
//! │    Engine    │───────────────▶│      Device      │─────────▶│   Engine    │
//! │ pad + params │   dispatch     │ kernels, buffers │          │  unpad/test │
//! └──────────────┘                └──────────────────┘          └─────────────┘
//! ```
//!
//! All operations are blocking: a write happens-before the dispatch that
//! reads the buffer, and a dispatch happens-before the read that follows.

use crate::MppResult;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Kernel source holding the cuckoo hash kernels.
pub const CUCKOO_HASH_SOURCE: &str = "cuckoo_hash.cl";
/// `(keys, values, table, params[10], status)`
pub const KERNEL_INSERT: &str = "Insert";
/// `(keys, out_values, table, params[10])`
pub const KERNEL_RETRIEVE: &str = "Retrieve";

/// Kernel source holding the prefix sum kernels.
pub const PREFIX_SUM_SOURCE: &str = "prefix_sum.cl";
/// `(input, block_prefix, block_totals)`
pub const KERNEL_SCAN_BLOCKS: &str = "ScanBlocks";
/// `(block_prefix, block_offsets, output, element_count)`
pub const KERNEL_ADD_BLOCK_OFFSETS: &str = "AddBlockOffsets";

/// How kernels may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    /// Whether kernels may store into a buffer with this access mode.
    pub fn kernel_writable(self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    U32(u32),
}

/// Device executor: buffer primitives, a kernel registry and dispatch.
///
/// Buffers are released when their handle is dropped.
pub trait Device {
    /// Opaque device allocation.
    type Buffer;

    /// Human-readable device description.
    fn name(&self) -> &str;

    /// Build the named kernel source and register each of `kernel_names`.
    ///
    /// Must be called once per source before any dispatch of its kernels.
    fn load_kernel(&mut self, source_name: &str, kernel_names: &[&str]) -> MppResult<()>;

    /// Allocate `size_bytes` bytes of device memory.
    fn allocate(&self, size_bytes: usize, access: MemAccess) -> MppResult<Self::Buffer>;

    /// Blocking host → device copy into the start of `buffer`.
    fn write<T: bytemuck::Pod>(&self, buffer: &mut Self::Buffer, data: &[T]) -> MppResult<()>;

    /// Blocking device → host copy of the first `out.len()` elements.
    fn read<T: bytemuck::Pod>(&self, buffer: &Self::Buffer, out: &mut [T]) -> MppResult<()>;

    /// Bind `args` positionally and run `kernel` over `global` lanes in
    /// work-groups of `local`.
    fn dispatch(
        &self,
        kernel: &str,
        args: &[KernelArg<'_, Self::Buffer>],
        global: usize,
        local: usize,
    ) -> MppResult<()>;

    /// Release every registered kernel. Safe to call more than once.
    fn teardown(&mut self);

    /// Number of allocations currently alive.
    fn live_buffers(&self) -> usize;
}

/// Counts live device allocations across all buffers of one device.
#[derive(Debug, Clone, Default)]
pub(crate) struct BufferLedger(Arc<AtomicUsize>);

impl BufferLedger {
    pub(crate) fn acquire(&self) -> LedgerEntry {
        self.0.fetch_add(1, Ordering::Relaxed);
        LedgerEntry(Arc::clone(&self.0))
    }

    pub(crate) fn live(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Held by a buffer; gives its slot back to the ledger on drop.
#[derive(Debug)]
pub(crate) struct LedgerEntry(Arc<AtomicUsize>);

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Check that a dispatch range is a whole number of work-groups.
pub(crate) fn check_range(kernel: &str, global: usize, local: usize) -> MppResult<()> {
    if global == 0 || local == 0 || global % local != 0 {
        return Err(crate::MppError::Device(format!(
            "{kernel}: global size {global} is not a multiple of local size {local}"
        )));
    }
    Ok(())
}
