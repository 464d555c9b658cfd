//! Massively parallel primitives: a device-resident cuckoo hash table and a
//! work-efficient exclusive prefix sum.
//!
//! Both engines are host-side orchestration over a [`device::Device`]
//! executor. The executor owns the context, the queue and the compiled
//! kernels; the engines own their buffers and drive the kernel dispatches.
//!
//! ```rust
//! use mpp::cuckoo::{Construction, CuckooConfig, CuckooHashTable};
//! use mpp::host::HostDevice;
//! use mpp::scan::PrefixSum;
//!
//! # fn main() -> mpp::MppResult<()> {
//! let mut device = HostDevice::new();
//! CuckooHashTable::load_kernels(&mut device)?;
//! PrefixSum::load_kernels(&mut device)?;
//!
//! let mut table = CuckooHashTable::new(&device, CuckooConfig::default().with_seed(7));
//! let built = table.build(3, &[10, 20, 30], &[1, 2, 3])?;
//! assert!(matches!(built, Construction::Built { .. }));
//! assert_eq!(table.get(&[20, 30, 10])?, vec![2, 3, 1]);
//!
//! let scan = PrefixSum::new(&device);
//! assert_eq!(scan.calculate_gpu(&[3, 1, 4, 1])?, vec![0, 3, 4, 8]);
//! # Ok(())
//! # }
//! ```

pub mod cuckoo;
pub mod device;
pub mod host;
pub mod scan;
pub mod sizing;

#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(test)]
mod validation;

/// Error types for mpp operations.
///
/// Failing to place every key inside the eviction/reconstruction budget
/// is *not* an error: it is reported as data by
/// [`cuckoo::CuckooHashTable::insert`] and [`cuckoo::CuckooHashTable::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MppError {
    /// No usable device or backend.
    Unsupported,
    /// Input violates a precondition (reserved key, zero-sized buffer, ...).
    InvalidInput,
    /// Key and value sequences differ in length.
    LengthMismatch { keys: usize, values: usize },
    /// A kernel source could not be found, read, or compiled.
    KernelSource(String),
    /// Dispatch of a kernel that was never registered with `load_kernel`.
    KernelNotLoaded(String),
    /// A kernel argument is missing or has the wrong kind.
    KernelArgument { kernel: String, index: usize },
    /// The device runtime rejected an operation.
    Device(String),
}

impl std::fmt::Display for MppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported => write!(f, "no usable compute device"),
            Self::InvalidInput => write!(f, "invalid input"),
            Self::LengthMismatch { keys, values } => {
                write!(f, "{keys} keys but {values} values")
            }
            Self::KernelSource(msg) => write!(f, "kernel source error: {msg}"),
            Self::KernelNotLoaded(name) => write!(f, "kernel '{name}' is not loaded"),
            Self::KernelArgument { kernel, index } => {
                write!(f, "kernel '{kernel}': bad argument at position {index}")
            }
            Self::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

impl std::error::Error for MppError {}

pub type MppResult<T> = Result<T, MppError>;
