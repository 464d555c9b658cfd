//! Device-resident cuckoo hash table.
//!
//! The table is a flat array of 64-bit slots, each packing a 32-bit key
//! (high half) and a 32-bit value (low half), or [`EMPTY`] when free. Four
//! universal hash functions `h_i(k) = ((a_i·k + b_i) mod p) mod capacity`
//! give every key four candidate slots. The insert kernel places each key
//! by exchanging it into a slot and re-homing whatever it evicted, for at
//! most `max_iterations` evictions per key.
//!
//! Construction is probabilistic. When any lane runs out of evictions the
//! table content is undefined, so [`CuckooHashTable::build`] throws the
//! whole table away and starts over with new random hash functions, up
//! to `max_reconstructions` times. A table is never repaired in place.
//!
//! # Example
//!
//! ```rust
//! use mpp::cuckoo::{CuckooConfig, CuckooHashTable};
//! use mpp::host::HostDevice;
//! use mpp::sizing::EMPTY_32;
//!
//! # fn main() -> mpp::MppResult<()> {
//! let mut device = HostDevice::new();
//! CuckooHashTable::load_kernels(&mut device)?;
//!
//! let mut table = CuckooHashTable::new(&device, CuckooConfig::default());
//! let keys: Vec<u32> = (1..=100).collect();
//! let values: Vec<u32> = keys.iter().map(|k| k * 10).collect();
//! assert!(table.build(keys.len(), &keys, &values)?.is_built());
//! assert_eq!(table.get(&[7, 1000])?, vec![70, EMPTY_32]);
//! # Ok(())
//! # }
//! ```

use crate::device::{
    Device, KernelArg, MemAccess, CUCKOO_HASH_SOURCE, KERNEL_INSERT, KERNEL_RETRIEVE,
};
use crate::sizing::{hash_local_size, next_multiple_of, pad_to, EMPTY, EMPTY_32, WAVEFRONT_SIZE};
use crate::{MppError, MppResult};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

/// Number of independent hash functions per key.
pub const NUM_HASH_FUNCTIONS: usize = 4;

/// Length of the parameter block handed to the kernels.
pub const NUM_PARAMS: usize = 2 * NUM_HASH_FUNCTIONS + 2;

/// Index of `max_iterations` in the parameter block.
pub const PARAM_IDX_MAX_ITERATIONS: usize = 2 * NUM_HASH_FUNCTIONS;

/// Index of the table capacity in the parameter block.
pub const PARAM_IDX_CAPACITY: usize = PARAM_IDX_MAX_ITERATIONS + 1;

/// Largest prime below 2^32 (must match HASH_PRIME in cuckoo_hash.cl).
pub const HASH_PRIME: u64 = 4_294_967_291;

/// Status word value while every lane has found a slot.
pub const STATUS_SUCCESS: u32 = 0;

/// Status word value once some lane exhausted its eviction budget.
pub const STATUS_FAILED: u32 = 1;

/// Tuning knobs for table construction.
///
/// Larger `table_size_factor` lowers the load factor; larger
/// `max_iterations` lets eviction chains run longer; larger
/// `max_reconstructions` allows more fresh hash functions. All three
/// raise the chance that [`CuckooHashTable::build`] succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CuckooConfig {
    /// `capacity = ceil(size × table_size_factor)`.
    pub table_size_factor: f64,
    /// Evictions allowed per inserted key. The initial placement is not
    /// counted, so `0` still fills an empty slot.
    pub max_iterations: u32,
    /// Full rebuild attempts before giving up.
    pub max_reconstructions: u32,
    /// Seed for hash parameter generation. `None` seeds from OS entropy.
    /// Read once, when the table is created.
    pub seed: Option<u64>,
}

impl Default for CuckooConfig {
    fn default() -> Self {
        CuckooConfig {
            table_size_factor: 1.25,
            max_iterations: 8,
            max_reconstructions: 3,
            seed: None,
        }
    }
}

impl CuckooConfig {
    pub fn with_table_size_factor(mut self, factor: f64) -> Self {
        self.table_size_factor = factor;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_reconstructions(mut self, max_reconstructions: u32) -> Self {
        self.max_reconstructions = max_reconstructions;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of slots allocated for a table sized for `size` entries.
    ///
    /// Never smaller than `size`, and at least one slot so the hash
    /// functions have a non-zero modulus.
    pub fn capacity_for(&self, size: usize) -> usize {
        let scaled = (size as f64 * self.table_size_factor).ceil();
        // NaN and negative factors saturate to 0 here.
        (scaled as usize).max(size).max(1)
    }
}

/// Eviction bound `ceil(7 · ln n)` that lets `n` keys settle with high
/// probability at moderate load.
pub fn suggested_max_iterations(n: usize) -> u32 {
    if n < 2 {
        return 1;
    }
    ((7.0 * (n as f64).ln()).ceil() as u32).max(1)
}

/// Coefficients of the four hash functions plus the kernel limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    /// `(a_i, b_i)` for each hash function, `a_i ∈ [1, p)`, `b_i ∈ [0, p)`.
    pub coefficients: [(u32, u32); NUM_HASH_FUNCTIONS],
    pub max_iterations: u32,
    pub capacity: u32,
}

impl HashParams {
    /// Draw fresh random coefficients.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, max_iterations: u32, capacity: u32) -> Self {
        let mut coefficients = [(0u32, 0u32); NUM_HASH_FUNCTIONS];
        for pair in coefficients.iter_mut() {
            let a = rng.gen_range(1..HASH_PRIME) as u32;
            let b = rng.gen_range(0..HASH_PRIME) as u32;
            *pair = (a, b);
        }
        HashParams {
            coefficients,
            max_iterations,
            capacity,
        }
    }

    /// Serialize to the kernel layout `[a0, b0, .., a3, b3, max_iterations, capacity]`.
    pub fn to_words(&self) -> [u32; NUM_PARAMS] {
        let mut words = [0u32; NUM_PARAMS];
        for (i, &(a, b)) in self.coefficients.iter().enumerate() {
            words[2 * i] = a;
            words[2 * i + 1] = b;
        }
        words[PARAM_IDX_MAX_ITERATIONS] = self.max_iterations;
        words[PARAM_IDX_CAPACITY] = self.capacity;
        words
    }

    pub fn from_words(words: &[u32; NUM_PARAMS]) -> Self {
        let mut coefficients = [(0u32, 0u32); NUM_HASH_FUNCTIONS];
        for (i, pair) in coefficients.iter_mut().enumerate() {
            *pair = (words[2 * i], words[2 * i + 1]);
        }
        HashParams {
            coefficients,
            max_iterations: words[PARAM_IDX_MAX_ITERATIONS],
            capacity: words[PARAM_IDX_CAPACITY],
        }
    }

    /// Slot index of `key` under hash function `function`.
    pub fn slot(&self, function: usize, key: u32) -> usize {
        let (a, b) = self.coefficients[function];
        // a < 2^32 - 5 and b < 2^32 - 5 keep a·k + b below 2^64.
        let h = (a as u64 * key as u64 + b as u64) % HASH_PRIME;
        (h % self.capacity.max(1) as u64) as usize
    }

    /// Where a key evicted from `current` goes next: the slot of the hash
    /// function after the one that placed it at `current`.
    pub fn next_slot(&self, key: u32, current: usize) -> usize {
        for function in 0..NUM_HASH_FUNCTIONS {
            if self.slot(function, key) == current {
                return self.slot((function + 1) % NUM_HASH_FUNCTIONS, key);
            }
        }
        self.slot(0, key)
    }
}

/// One table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Occupied { key: u32, value: u32 },
}

impl Slot {
    /// Pack to the 64-bit device representation.
    pub fn pack(self) -> u64 {
        match self {
            Slot::Empty => EMPTY,
            Slot::Occupied { key, value } => ((key as u64) << 32) | value as u64,
        }
    }

    pub fn unpack(raw: u64) -> Self {
        if raw == EMPTY {
            Slot::Empty
        } else {
            Slot::Occupied {
                key: (raw >> 32) as u32,
                value: raw as u32,
            }
        }
    }
}

/// Result of [`CuckooHashTable::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    /// Every key was placed; `attempts` counts the table generations used.
    Built { attempts: u32 },
    /// No generation within the reconstruction budget placed every key.
    Exhausted { attempts: u32 },
}

impl Construction {
    pub fn is_built(&self) -> bool {
        matches!(self, Construction::Built { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            Construction::Built { attempts } | Construction::Exhausted { attempts } => attempts,
        }
    }
}

/// Cuckoo hash table living in device memory.
///
/// Owns its table buffer and its parameter buffer exclusively; both are
/// released when the table is dropped or rebuilt.
pub struct CuckooHashTable<'d, D: Device> {
    device: &'d D,
    config: CuckooConfig,
    rng: StdRng,
    params: HashParams,
    capacity: usize,
    table: Option<D::Buffer>,
    params_buf: Option<D::Buffer>,
    attempts: u32,
}

impl<D: Device> std::fmt::Debug for CuckooHashTable<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuckooHashTable")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .field("capacity", &self.capacity)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl<'d, D: Device> CuckooHashTable<'d, D> {
    /// Register the insert and retrieve kernels with `device`.
    pub fn load_kernels(device: &mut D) -> MppResult<()> {
        device.load_kernel(CUCKOO_HASH_SOURCE, &[KERNEL_INSERT, KERNEL_RETRIEVE])
    }

    /// Create an unallocated table. Call [`init`](Self::init) or
    /// [`build`](Self::build) before use.
    pub fn new(device: &'d D, config: CuckooConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let params = HashParams::generate(&mut rng, config.max_iterations, 0);
        CuckooHashTable {
            device,
            config,
            rng,
            params,
            capacity: 0,
            table: None,
            params_buf: None,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &CuckooConfig {
        &self.config
    }

    /// Options take effect at the next [`init`](Self::init).
    pub fn config_mut(&mut self) -> &mut CuckooConfig {
        &mut self.config
    }

    /// Slot count of the current table generation (0 before `init`).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hash parameters of the current table generation.
    pub fn params(&self) -> &HashParams {
        &self.params
    }

    /// Table generations used by the last [`build`](Self::build).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Allocate an empty table for `size` entries with fresh hash functions.
    ///
    /// The previous table, if any, is released first.
    pub fn init(&mut self, size: usize) -> MppResult<()> {
        let capacity = self.config.capacity_for(size);
        let capacity_word = u32::try_from(capacity).map_err(|_| MppError::InvalidInput)?;

        self.table = None;
        self.capacity = 0;
        self.params = HashParams::generate(&mut self.rng, self.config.max_iterations, capacity_word);

        let mut table = self
            .device
            .allocate(capacity * std::mem::size_of::<u64>(), MemAccess::ReadWrite)?;
        self.device.write(&mut table, &vec![EMPTY; capacity])?;

        if self.params_buf.is_none() {
            self.params_buf = Some(
                self.device
                    .allocate(NUM_PARAMS * std::mem::size_of::<u32>(), MemAccess::ReadOnly)?,
            );
        }
        if let Some(params_buf) = self.params_buf.as_mut() {
            self.device.write(params_buf, &self.params.to_words())?;
        }

        self.table = Some(table);
        self.capacity = capacity;
        Ok(())
    }

    /// Build a table for `size` entries holding `keys[i] → values[i]`.
    ///
    /// Each attempt allocates a fresh table with new hash functions and
    /// inserts the full key set. Stops at the first attempt that places
    /// every key, or after `max_reconstructions` attempts.
    pub fn build(&mut self, size: usize, keys: &[u32], values: &[u32]) -> MppResult<Construction> {
        check_entries(keys, values)?;

        self.attempts = 0;
        for attempt in 1..=self.config.max_reconstructions {
            self.attempts = attempt;
            self.init(size)?;
            if keys.is_empty() || self.insert(keys, values)? {
                debug!(attempt, capacity = self.capacity, keys = keys.len(), "cuckoo table built");
                return Ok(Construction::Built { attempts: attempt });
            }
            debug!(
                attempt,
                capacity = self.capacity,
                max_iterations = self.params.max_iterations,
                "insertion exceeded eviction bound, rebuilding table"
            );
        }

        warn!(
            attempts = self.attempts,
            keys = keys.len(),
            capacity = self.capacity,
            "cuckoo table construction exhausted its reconstruction budget"
        );
        Ok(Construction::Exhausted {
            attempts: self.attempts,
        })
    }

    /// Insert `keys[i] → values[i]` into the current table.
    ///
    /// Returns `Ok(false)` when some key could not be placed within
    /// `max_iterations` evictions. The table content is then undefined and
    /// the table must be rebuilt, not inserted into again.
    ///
    /// A value of [`EMPTY_32`] is stored as given, but [`get`](Self::get)
    /// cannot tell it apart from a miss.
    pub fn insert(&mut self, keys: &[u32], values: &[u32]) -> MppResult<bool> {
        check_entries(keys, values)?;
        let table = self.table.as_ref().ok_or(MppError::InvalidInput)?;
        let params_buf = self.params_buf.as_ref().ok_or(MppError::InvalidInput)?;
        if keys.is_empty() {
            return Ok(true);
        }

        let lanes = next_multiple_of(keys.len(), WAVEFRONT_SIZE);
        let word = std::mem::size_of::<u32>();

        let mut keys_buf = self.device.allocate(lanes * word, MemAccess::ReadOnly)?;
        self.device
            .write(&mut keys_buf, &pad_to(keys, WAVEFRONT_SIZE, EMPTY_32))?;

        let mut values_buf = self.device.allocate(lanes * word, MemAccess::ReadOnly)?;
        self.device
            .write(&mut values_buf, &pad_to(values, WAVEFRONT_SIZE, EMPTY_32))?;

        let mut status_buf = self.device.allocate(word, MemAccess::ReadWrite)?;
        self.device.write(&mut status_buf, &[STATUS_SUCCESS])?;

        self.device.dispatch(
            KERNEL_INSERT,
            &[
                KernelArg::Buffer(&keys_buf),
                KernelArg::Buffer(&values_buf),
                KernelArg::Buffer(table),
                KernelArg::Buffer(params_buf),
                KernelArg::Buffer(&status_buf),
            ],
            lanes,
            hash_local_size(lanes),
        )?;

        let mut status = [STATUS_FAILED];
        self.device.read(&status_buf, &mut status)?;
        Ok(status[0] == STATUS_SUCCESS)
    }

    /// Look up `keys`, returning the stored value or [`EMPTY_32`] per key,
    /// in input order.
    ///
    /// A key stored with the value [`EMPTY_32`] reads back the same as a
    /// key that is absent.
    pub fn get(&self, keys: &[u32]) -> MppResult<Vec<u32>> {
        let table = self.table.as_ref().ok_or(MppError::InvalidInput)?;
        let params_buf = self.params_buf.as_ref().ok_or(MppError::InvalidInput)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let lanes = next_multiple_of(keys.len(), WAVEFRONT_SIZE);
        let word = std::mem::size_of::<u32>();

        let mut keys_buf = self.device.allocate(lanes * word, MemAccess::ReadOnly)?;
        self.device
            .write(&mut keys_buf, &pad_to(keys, WAVEFRONT_SIZE, EMPTY_32))?;
        let values_buf = self.device.allocate(lanes * word, MemAccess::WriteOnly)?;

        self.device.dispatch(
            KERNEL_RETRIEVE,
            &[
                KernelArg::Buffer(&keys_buf),
                KernelArg::Buffer(&values_buf),
                KernelArg::Buffer(table),
                KernelArg::Buffer(params_buf),
            ],
            lanes,
            hash_local_size(lanes),
        )?;

        let mut values = vec![EMPTY_32; keys.len()];
        self.device.read(&values_buf, &mut values)?;
        Ok(values)
    }

    /// Read back every slot of the current table.
    pub fn slots(&self) -> MppResult<Vec<Slot>> {
        let table = self.table.as_ref().ok_or(MppError::InvalidInput)?;
        let mut raw = vec![EMPTY; self.capacity];
        self.device.read(table, &mut raw)?;
        Ok(raw.into_iter().map(Slot::unpack).collect())
    }
}

/// Keys and values must pair up, and the padding key is reserved.
fn check_entries(keys: &[u32], values: &[u32]) -> MppResult<()> {
    if keys.len() != values.len() {
        return Err(MppError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }
    if keys.contains(&EMPTY_32) {
        return Err(MppError::InvalidInput);
    }
    Ok(())
}
