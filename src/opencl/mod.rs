//! OpenCL device executor.
//!
//! Runs the cuckoo hash and prefix sum kernels from `kernels/*.cl` on an
//! OpenCL device through the `opencl3` bindings.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "opencl")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use mpp::opencl::OpenClDevice;
//! use mpp::scan::PrefixSum;
//!
//! let mut device = OpenClDevice::new()?;
//! println!("Using device: {}", device.device_name());
//!
//! PrefixSum::load_kernels(&mut device)?;
//! let sums = PrefixSum::new(&device).calculate_gpu(&[1, 2, 3])?;
//! assert_eq!(sums, vec![0, 1, 3]);
//! # Ok(())
//! # }
//! ```

use crate::device::{
    check_range, BufferLedger, Device, KernelArg, LedgerEntry, MemAccess, CUCKOO_HASH_SOURCE,
    PREFIX_SUM_SOURCE,
};
use crate::sizing::SCAN_BLOCK_SIZE;
use crate::{MppError, MppResult};

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    get_all_devices, Device as ClDevice, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU,
};
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::program::Program;
use opencl3::types::{cl_device_type, cl_mem_flags, CL_BLOCKING};

use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr;

use tracing::{debug, info};


/// Embedded OpenCL kernel source: cuckoo hash `Insert` and `Retrieve`.
const CUCKOO_HASH_KERNEL_SOURCE: &str = include_str!("../../kernels/cuckoo_hash.cl");

/// Embedded OpenCL kernel source: `ScanBlocks` and `AddBlockOffsets`.
const PREFIX_SUM_KERNEL_SOURCE: &str = include_str!("../../kernels/prefix_sum.cl");

/// Extension required by the cuckoo insert kernel's 64-bit exchange.
const INT64_ATOMICS_EXTENSION: &str = "cl_khr_int64_base_atomics";

/// Embedded source for a kernel file name.
fn embedded_source(source_name: &str) -> Option<&'static str> {
    match source_name {
        CUCKOO_HASH_SOURCE => Some(CUCKOO_HASH_KERNEL_SOURCE),
        PREFIX_SUM_SOURCE => Some(PREFIX_SUM_KERNEL_SOURCE),
        _ => None,
    }
}

/// Compiler flags shared by every program.
fn build_options() -> String {
    format!(
        "-DSCAN_BLOCK_SIZE={SCAN_BLOCK_SIZE} -DNUM_HASH_FUNCTIONS={}",
        crate::cuckoo::NUM_HASH_FUNCTIONS
    )
}

fn mem_flags(access: MemAccess) -> cl_mem_flags {
    match access {
        MemAccess::ReadOnly => CL_MEM_READ_ONLY,
        MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        MemAccess::ReadWrite => CL_MEM_READ_WRITE,
    }
}

/// Information about a discovered OpenCL device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name (e.g. "NVIDIA GeForce RTX 3080").
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a GPU device (vs CPU or accelerator).
    pub is_gpu: bool,
    /// Maximum work-group size supported by the device.
    pub max_work_group_size: usize,
    /// Global memory size in bytes.
    pub global_mem_size: u64,
    /// Whether 64-bit global atomics (needed by the hash table) are available.
    pub int64_atomics: bool,
}

/// Probe all available OpenCL devices without creating a context.
///
/// Returns an empty vec if no OpenCL runtime is installed or no
/// devices are found (never errors).
pub fn probe_devices() -> Vec<DeviceInfo> {
    let device_ids = match get_all_devices(CL_DEVICE_TYPE_ALL) {
        Ok(ids) => ids,
        Err(_) => return Vec::new(),
    };

    device_ids
        .into_iter()
        .map(|id| {
            let dev = ClDevice::new(id);
            let dev_type: cl_device_type = dev.dev_type().unwrap_or(0);
            DeviceInfo {
                name: dev.name().unwrap_or_default().trim().to_string(),
                vendor: dev.vendor().unwrap_or_default().trim().to_string(),
                is_gpu: (dev_type & CL_DEVICE_TYPE_GPU) != 0,
                max_work_group_size: dev.max_work_group_size().unwrap_or(1),
                global_mem_size: dev.global_mem_size().unwrap_or(0),
                int64_atomics: dev
                    .extensions()
                    .map(|ext| ext.contains(INT64_ATOMICS_EXTENSION))
                    .unwrap_or(false),
            }
        })
        .collect()
}

/// Return the number of available OpenCL devices.
///
/// This is a lightweight probe that doesn't create contexts or compile
/// kernels. Returns 0 if OpenCL is not available.
pub fn device_count() -> usize {
    get_all_devices(CL_DEVICE_TYPE_ALL)
        .map(|ids| ids.len())
        .unwrap_or(0)
}

/// How to pick and configure the device.
#[derive(Debug, Clone)]
pub struct OpenClOptions {
    /// Try GPUs (largest global memory first) before any other device.
    pub prefer_gpu: bool,
    /// Enable `CL_QUEUE_PROFILING_ENABLE` and log per-command timings.
    pub profiling: bool,
    /// Read kernel sources from `<kernel_dir>/<source_name>` instead of the
    /// copies embedded in the library.
    pub kernel_dir: Option<PathBuf>,
}

impl Default for OpenClOptions {
    fn default() -> Self {
        OpenClOptions {
            prefer_gpu: true,
            profiling: false,
            kernel_dir: None,
        }
    }
}

/// Device allocation owned by an [`OpenClDevice`].
pub struct ClBuffer {
    inner: Buffer<u8>,
    size: usize,
    _entry: LedgerEntry,
}

impl ClBuffer {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl std::fmt::Debug for ClBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClBuffer")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// OpenCL execution context: one device, one in-order queue, and the
/// kernels registered through [`Device::load_kernel`].
///
/// Note: `Debug` is implemented manually because the OpenCL handle
/// types from `opencl3` don't implement `Debug`.
pub struct OpenClDevice {
    _device: ClDevice,
    context: Context,
    queue: CommandQueue,
    kernels: HashMap<String, Kernel>,
    /// Device name for diagnostics.
    device_name: String,
    /// Maximum work-group size.
    max_work_group_size: usize,
    /// Whether the selected device is a CPU (vs GPU/accelerator).
    is_cpu: bool,
    /// Whether the device supports 64-bit global atomics.
    int64_atomics: bool,
    options: OpenClOptions,
    ledger: BufferLedger,
}

impl std::fmt::Debug for OpenClDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClDevice")
            .field("device_name", &self.device_name)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("kernels", &self.kernels.len())
            .finish_non_exhaustive()
    }
}

impl OpenClDevice {
    /// Create a device, selecting the best available GPU.
    ///
    /// Returns `MppError::Unsupported` if no OpenCL device can run the
    /// kernels.
    pub fn new() -> MppResult<Self> {
        Self::with_options(OpenClOptions::default())
    }

    pub fn with_options(options: OpenClOptions) -> MppResult<Self> {
        let all_ids = get_all_devices(CL_DEVICE_TYPE_ALL).map_err(|_| MppError::Unsupported)?;
        if all_ids.is_empty() {
            return Err(MppError::Unsupported);
        }

        // Prefer discrete over integrated GPUs: sort by global memory,
        // then fall back to every device in enumeration order.
        let gpu_ids = if options.prefer_gpu {
            let mut ids = get_all_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
            ids.sort_by(|a, b| {
                let mem_a = ClDevice::new(*a).global_mem_size().unwrap_or(0);
                let mem_b = ClDevice::new(*b).global_mem_size().unwrap_or(0);
                mem_b.cmp(&mem_a)
            });
            ids
        } else {
            Vec::new()
        };
        let candidates: Vec<_> = gpu_ids
            .iter()
            .copied()
            .chain(all_ids.iter().copied())
            .collect();

        let queue_props = if options.profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };

        // A device only counts once it has a context, a queue, and can
        // compile the scan program; some drivers accept the first two and
        // fail on real kernel code.
        let smoke_options = build_options();
        let mut selected = None;
        for &id in &candidates {
            let dev = ClDevice::new(id);
            let Ok(ctx) = Context::from_device(&dev) else {
                continue;
            };
            #[allow(deprecated)]
            let Ok(queue) = CommandQueue::create_default(&ctx, queue_props) else {
                continue;
            };
            if Program::create_and_build_from_source(&ctx, PREFIX_SUM_KERNEL_SOURCE, &smoke_options)
                .is_err()
            {
                continue;
            }
            selected = Some((dev, ctx, queue));
            break;
        }
        let (device, context, queue) = selected.ok_or(MppError::Unsupported)?;

        let device_name = device.name().unwrap_or_default().trim().to_string();
        let max_work_group_size = device.max_work_group_size().unwrap_or(1);
        let dev_type: cl_device_type = device.dev_type().unwrap_or(0);
        let is_cpu = (dev_type & CL_DEVICE_TYPE_GPU) == 0;
        let int64_atomics = device
            .extensions()
            .map(|ext| ext.contains(INT64_ATOMICS_EXTENSION))
            .unwrap_or(false);

        info!(
            device = %device_name,
            max_work_group_size,
            is_cpu,
            int64_atomics,
            "opencl device selected"
        );

        Ok(OpenClDevice {
            _device: device,
            context,
            queue,
            kernels: HashMap::new(),
            device_name,
            max_work_group_size,
            is_cpu,
            int64_atomics,
            options,
            ledger: BufferLedger::default(),
        })
    }

    /// Return the name of the selected compute device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Return the maximum work-group size for the device.
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    /// Check if the selected device is a CPU (not a GPU or accelerator).
    pub fn is_cpu_device(&self) -> bool {
        self.is_cpu
    }

    /// Whether profiling is enabled (CL_QUEUE_PROFILING_ENABLE).
    pub fn profiling(&self) -> bool {
        self.options.profiling
    }

    /// Extract elapsed time in milliseconds from a completed OpenCL event.
    ///
    /// Requires the command queue to have been created with
    /// `CL_QUEUE_PROFILING_ENABLE`. Returns `None` if profiling is
    /// disabled or the event doesn't have timing data.
    pub fn event_elapsed_ms(event: &Event) -> Option<f64> {
        let start = event.profiling_command_start().ok()?;
        let end = event.profiling_command_end().ok()?;
        Some((end - start) as f64 / 1_000_000.0)
    }

    /// Log timing for a completed event when profiling is enabled.
    fn profile_event(&self, label: &str, event: &Event) {
        if self.options.profiling {
            if let Some(ms) = Self::event_elapsed_ms(event) {
                debug!(label, ms, "opencl command timing");
            }
        }
    }

    /// Kernel source text for `source_name`, from `kernel_dir` when set.
    fn kernel_source(&self, source_name: &str) -> MppResult<String> {
        if let Some(dir) = &self.options.kernel_dir {
            let path = dir.join(source_name);
            return std::fs::read_to_string(&path)
                .map_err(|e| MppError::KernelSource(format!("{}: {e}", path.display())));
        }
        embedded_source(source_name)
            .map(str::to_string)
            .ok_or_else(|| MppError::KernelSource(format!("unknown kernel source '{source_name}'")))
    }
}

impl Device for OpenClDevice {
    type Buffer = ClBuffer;

    fn name(&self) -> &str {
        &self.device_name
    }

    fn load_kernel(&mut self, source_name: &str, kernel_names: &[&str]) -> MppResult<()> {
        if source_name == CUCKOO_HASH_SOURCE && !self.int64_atomics {
            return Err(MppError::Unsupported);
        }
        let source = self.kernel_source(source_name)?;
        let program =
            Program::create_and_build_from_source(&self.context, &source, &build_options())
                .map_err(|log| MppError::KernelSource(format!("{source_name}: {log}")))?;

        for &name in kernel_names {
            let kernel = Kernel::create(&program, name)
                .map_err(|e| MppError::KernelSource(format!("{source_name}: {name}: {e}")))?;
            self.kernels.insert(name.to_string(), kernel);
        }
        debug!(source = source_name, kernels = kernel_names.len(), "opencl program built");
        Ok(())
    }

    fn allocate(&self, size_bytes: usize, access: MemAccess) -> MppResult<ClBuffer> {
        if size_bytes == 0 {
            return Err(MppError::InvalidInput);
        }
        let inner = unsafe {
            Buffer::<u8>::create(&self.context, mem_flags(access), size_bytes, ptr::null_mut())
                .map_err(|e| MppError::Device(format!("allocate {size_bytes} bytes: {e}")))?
        };
        Ok(ClBuffer {
            inner,
            size: size_bytes,
            _entry: self.ledger.acquire(),
        })
    }

    fn write<T: bytemuck::Pod>(&self, buffer: &mut ClBuffer, data: &[T]) -> MppResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() > buffer.size {
            return Err(MppError::Device(format!(
                "write of {} bytes into a {}-byte buffer",
                bytes.len(),
                buffer.size
            )));
        }
        let write_event = unsafe {
            self.queue
                .enqueue_write_buffer(&mut buffer.inner, CL_BLOCKING, 0, bytes, &[])
                .map_err(|e| MppError::Device(format!("write buffer: {e}")))?
        };
        write_event
            .wait()
            .map_err(|e| MppError::Device(format!("write buffer: {e}")))?;
        self.profile_event("write", &write_event);
        Ok(())
    }

    fn read<T: bytemuck::Pod>(&self, buffer: &ClBuffer, out: &mut [T]) -> MppResult<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        if bytes.len() > buffer.size {
            return Err(MppError::Device(format!(
                "read of {} bytes from a {}-byte buffer",
                bytes.len(),
                buffer.size
            )));
        }
        let read_event = unsafe {
            self.queue
                .enqueue_read_buffer(&buffer.inner, CL_BLOCKING, 0, bytes, &[])
                .map_err(|e| MppError::Device(format!("read buffer: {e}")))?
        };
        read_event
            .wait()
            .map_err(|e| MppError::Device(format!("read buffer: {e}")))?;
        self.profile_event("read", &read_event);
        Ok(())
    }

    fn dispatch(
        &self,
        kernel: &str,
        args: &[KernelArg<'_, ClBuffer>],
        global: usize,
        local: usize,
    ) -> MppResult<()> {
        let compiled = self
            .kernels
            .get(kernel)
            .ok_or_else(|| MppError::KernelNotLoaded(kernel.to_string()))?;
        check_range(kernel, global, local)?;
        if local > self.max_work_group_size {
            return Err(MppError::Device(format!(
                "{kernel}: local size {local} exceeds device limit {}",
                self.max_work_group_size
            )));
        }

        let kernel_event = unsafe {
            let mut exec = ExecuteKernel::new(compiled);
            for arg in args {
                match arg {
                    KernelArg::Buffer(buf) => exec.set_arg(&buf.inner),
                    KernelArg::U32(value) => exec.set_arg(value),
                };
            }
            exec.set_global_work_size(global)
                .set_local_work_size(local)
                .enqueue_nd_range(&self.queue)
                .map_err(|e| MppError::Device(format!("{kernel}: enqueue: {e}")))?
        };
        kernel_event
            .wait()
            .map_err(|e| MppError::Device(format!("{kernel}: {e}")))?;
        self.profile_event(kernel, &kernel_event);
        Ok(())
    }

    fn teardown(&mut self) {
        self.kernels.clear();
    }

    fn live_buffers(&self) -> usize {
        self.ledger.live()
    }
}
