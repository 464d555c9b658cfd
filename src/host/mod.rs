//! In-process device executor.
//!
//! [`HostDevice`] implements the [`Device`] contract without any GPU
//! runtime: buffers are byte vectors and every kernel is a Rust function
//! that runs the dispatch's lanes one after another. Sequential lane order
//! is one legal schedule of the parallel kernel, so host results match
//! what a device produces for the deterministic kernels (scan, retrieve).
//!
//! It is always available, which makes it the reference backend for tests
//! and the fallback when no OpenCL device is present.

use crate::device::{check_range, BufferLedger, Device, KernelArg, LedgerEntry, MemAccess};
use crate::{MppError, MppResult};

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;

mod kernels;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// Host-side kernel body: `(args, global_size, local_size)`.
type HostKernel = fn(&[KernelArg<'_, HostBuffer>], usize, usize) -> MppResult<()>;

/// Device memory emulated in host RAM.
pub struct HostBuffer {
    bytes: RefCell<Vec<u8>>,
    access: MemAccess,
    _entry: LedgerEntry,
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.bytes.borrow().len())
            .field("access", &self.access)
            .finish()
    }
}

impl HostBuffer {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the whole buffer out as `T` elements.
    fn load<T: bytemuck::Pod>(&self) -> Vec<T> {
        let bytes = self.bytes.borrow();
        let mut out = vec![T::zeroed(); bytes.len() / std::mem::size_of::<T>()];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        let n = dst.len();
        dst.copy_from_slice(&bytes[..n]);
        out
    }

    /// Kernel-side store into the start of the buffer.
    fn store<T: bytemuck::Pod>(&self, data: &[T]) -> MppResult<()> {
        if !self.access.kernel_writable() {
            return Err(MppError::Device(
                "kernel store into a read-only buffer".to_string(),
            ));
        }
        self.copy_in(data)
    }

    fn copy_in<T: bytemuck::Pod>(&self, data: &[T]) -> MppResult<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let mut bytes = self.bytes.borrow_mut();
        if src.len() > bytes.len() {
            return Err(MppError::Device(format!(
                "write of {} bytes into a {}-byte buffer",
                src.len(),
                bytes.len()
            )));
        }
        bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Executor that runs kernels on the calling thread.
#[derive(Default)]
pub struct HostDevice {
    kernels: HashMap<String, HostKernel>,
    ledger: BufferLedger,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HostDevice")
            .field("kernels", &names)
            .field("live_buffers", &self.ledger.live())
            .finish()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `kernel` is registered.
    pub fn has_kernel(&self, kernel: &str) -> bool {
        self.kernels.contains_key(kernel)
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "host"
    }

    fn load_kernel(&mut self, source_name: &str, kernel_names: &[&str]) -> MppResult<()> {
        if !kernels::has_source(source_name) {
            return Err(MppError::KernelSource(format!(
                "unknown kernel source '{source_name}'"
            )));
        }
        for &name in kernel_names {
            let kernel = kernels::lookup(source_name, name).ok_or_else(|| {
                MppError::KernelSource(format!("{source_name}: no kernel named '{name}'"))
            })?;
            self.kernels.insert(name.to_string(), kernel);
        }
        debug!(source = source_name, kernels = kernel_names.len(), "host kernels registered");
        Ok(())
    }

    fn allocate(&self, size_bytes: usize, access: MemAccess) -> MppResult<HostBuffer> {
        if size_bytes == 0 {
            return Err(MppError::InvalidInput);
        }
        Ok(HostBuffer {
            bytes: RefCell::new(vec![0u8; size_bytes]),
            access,
            _entry: self.ledger.acquire(),
        })
    }

    fn write<T: bytemuck::Pod>(&self, buffer: &mut HostBuffer, data: &[T]) -> MppResult<()> {
        buffer.copy_in(data)
    }

    fn read<T: bytemuck::Pod>(&self, buffer: &HostBuffer, out: &mut [T]) -> MppResult<()> {
        let dst: &mut [u8] = bytemuck::cast_slice_mut(out);
        let bytes = buffer.bytes.borrow();
        if dst.len() > bytes.len() {
            return Err(MppError::Device(format!(
                "read of {} bytes from a {}-byte buffer",
                dst.len(),
                bytes.len()
            )));
        }
        dst.copy_from_slice(&bytes[..dst.len()]);
        Ok(())
    }

    fn dispatch(
        &self,
        kernel: &str,
        args: &[KernelArg<'_, HostBuffer>],
        global: usize,
        local: usize,
    ) -> MppResult<()> {
        let run = self
            .kernels
            .get(kernel)
            .copied()
            .ok_or_else(|| MppError::KernelNotLoaded(kernel.to_string()))?;
        check_range(kernel, global, local)?;
        debug!(kernel, global, local, "host dispatch");
        run(args, global, local)
    }

    fn teardown(&mut self) {
        self.kernels.clear();
    }

    fn live_buffers(&self) -> usize {
        self.ledger.live()
    }
}
