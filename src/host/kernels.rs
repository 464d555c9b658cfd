//! Host implementations of the kernels in `kernels/*.cl`.
//!
//! Each function honours the same positional argument contract as its
//! OpenCL counterpart and walks the dispatch range lane by lane.

use super::{HostBuffer, HostKernel};
use crate::cuckoo::{HashParams, Slot, NUM_HASH_FUNCTIONS, NUM_PARAMS, STATUS_FAILED};
use crate::device::{
    KernelArg, CUCKOO_HASH_SOURCE, KERNEL_ADD_BLOCK_OFFSETS, KERNEL_INSERT, KERNEL_RETRIEVE,
    KERNEL_SCAN_BLOCKS, PREFIX_SUM_SOURCE,
};
use crate::sizing::{EMPTY, EMPTY_32};
use crate::{MppError, MppResult};

pub(super) fn has_source(source: &str) -> bool {
    matches!(source, CUCKOO_HASH_SOURCE | PREFIX_SUM_SOURCE)
}

pub(super) fn lookup(source: &str, kernel: &str) -> Option<HostKernel> {
    let run: HostKernel = match (source, kernel) {
        (CUCKOO_HASH_SOURCE, KERNEL_INSERT) => insert,
        (CUCKOO_HASH_SOURCE, KERNEL_RETRIEVE) => retrieve,
        (PREFIX_SUM_SOURCE, KERNEL_SCAN_BLOCKS) => scan_blocks,
        (PREFIX_SUM_SOURCE, KERNEL_ADD_BLOCK_OFFSETS) => add_block_offsets,
        _ => return None,
    };
    Some(run)
}

fn check_arity(kernel: &str, args: &[KernelArg<'_, HostBuffer>], expected: usize) -> MppResult<()> {
    if args.len() != expected {
        return Err(MppError::KernelArgument {
            kernel: kernel.to_string(),
            index: args.len().min(expected),
        });
    }
    Ok(())
}

fn buffer<'a>(
    kernel: &str,
    args: &[KernelArg<'a, HostBuffer>],
    index: usize,
) -> MppResult<&'a HostBuffer> {
    match args.get(index) {
        Some(KernelArg::Buffer(buf)) => Ok(*buf),
        _ => Err(MppError::KernelArgument {
            kernel: kernel.to_string(),
            index,
        }),
    }
}

fn scalar(kernel: &str, args: &[KernelArg<'_, HostBuffer>], index: usize) -> MppResult<u32> {
    match args.get(index) {
        Some(KernelArg::U32(value)) => Ok(*value),
        _ => Err(MppError::KernelArgument {
            kernel: kernel.to_string(),
            index,
        }),
    }
}

/// Lanes index past the end of a buffer that is shorter than the range.
fn check_len(kernel: &str, len: usize, global: usize) -> MppResult<()> {
    if len < global {
        return Err(MppError::Device(format!(
            "{kernel}: buffer holds {len} elements, dispatch covers {global}"
        )));
    }
    Ok(())
}

fn load_params(kernel: &str, buf: &HostBuffer) -> MppResult<HashParams> {
    let words: Vec<u32> = buf.load();
    let words: [u32; NUM_PARAMS] = words
        .get(..NUM_PARAMS)
        .and_then(|w| w.try_into().ok())
        .ok_or_else(|| MppError::Device(format!("{kernel}: short parameter buffer")))?;
    Ok(HashParams::from_words(&words))
}

/// `Insert(keys, values, table, params, status)`
fn insert(args: &[KernelArg<'_, HostBuffer>], global: usize, _local: usize) -> MppResult<()> {
    check_arity(KERNEL_INSERT, args, 5)?;
    let keys: Vec<u32> = buffer(KERNEL_INSERT, args, 0)?.load();
    let values: Vec<u32> = buffer(KERNEL_INSERT, args, 1)?.load();
    let table_buf = buffer(KERNEL_INSERT, args, 2)?;
    let params = load_params(KERNEL_INSERT, buffer(KERNEL_INSERT, args, 3)?)?;
    let status_buf = buffer(KERNEL_INSERT, args, 4)?;
    check_len(KERNEL_INSERT, keys.len().min(values.len()), global)?;

    let mut table: Vec<u64> = table_buf.load();
    if table.len() < params.capacity as usize {
        return Err(MppError::Device(format!(
            "{KERNEL_INSERT}: table holds {} slots, params say {}",
            table.len(),
            params.capacity
        )));
    }

    let mut failed = false;
    for lane in 0..global {
        let key = keys[lane];
        if key == EMPTY_32 {
            continue;
        }
        if !place(&mut table, &params, key, values[lane]) {
            failed = true;
        }
    }

    table_buf.store(&table)?;
    if failed {
        status_buf.store(&[STATUS_FAILED])?;
    }
    Ok(())
}

/// Bounded cuckoo eviction chain for one lane: the initial placement plus
/// up to `max_iterations` re-placements of evicted entries.
fn place(table: &mut [u64], params: &HashParams, key: u32, value: u32) -> bool {
    let mut location = params.slot(0, key);
    let mut entry = std::mem::replace(&mut table[location], Slot::Occupied { key, value }.pack());
    if entry == EMPTY {
        return true;
    }
    for _ in 0..params.max_iterations {
        location = params.next_slot((entry >> 32) as u32, location);
        entry = std::mem::replace(&mut table[location], entry);
        if entry == EMPTY {
            return true;
        }
    }
    false
}

/// `Retrieve(keys, out_values, table, params)`
fn retrieve(args: &[KernelArg<'_, HostBuffer>], global: usize, _local: usize) -> MppResult<()> {
    check_arity(KERNEL_RETRIEVE, args, 4)?;
    let keys: Vec<u32> = buffer(KERNEL_RETRIEVE, args, 0)?.load();
    let out_buf = buffer(KERNEL_RETRIEVE, args, 1)?;
    let table: Vec<u64> = buffer(KERNEL_RETRIEVE, args, 2)?.load();
    let params = load_params(KERNEL_RETRIEVE, buffer(KERNEL_RETRIEVE, args, 3)?)?;
    check_len(KERNEL_RETRIEVE, keys.len(), global)?;

    let out: Vec<u32> = keys[..global]
        .iter()
        .map(|&key| lookup_key(&table, &params, key))
        .collect();
    out_buf.store(&out)
}

fn lookup_key(table: &[u64], params: &HashParams, key: u32) -> u32 {
    if key == EMPTY_32 {
        return EMPTY_32;
    }
    for function in 0..NUM_HASH_FUNCTIONS {
        let raw = table.get(params.slot(function, key)).copied().unwrap_or(EMPTY);
        if let Slot::Occupied { key: stored, value } = Slot::unpack(raw) {
            if stored == key {
                return value;
            }
        }
    }
    EMPTY_32
}

/// `ScanBlocks(input, block_prefix, block_totals)`
///
/// Exclusive scan of every `local`-sized group, restarting at 0 per group;
/// each group's inclusive total goes to `block_totals[group]`.
fn scan_blocks(args: &[KernelArg<'_, HostBuffer>], global: usize, local: usize) -> MppResult<()> {
    check_arity(KERNEL_SCAN_BLOCKS, args, 3)?;
    let input: Vec<i32> = buffer(KERNEL_SCAN_BLOCKS, args, 0)?.load();
    let prefix_buf = buffer(KERNEL_SCAN_BLOCKS, args, 1)?;
    let totals_buf = buffer(KERNEL_SCAN_BLOCKS, args, 2)?;
    check_len(KERNEL_SCAN_BLOCKS, input.len(), global)?;

    let mut prefix = vec![0i32; global];
    let mut totals = Vec::with_capacity(global / local);
    for (block_in, block_out) in input[..global].chunks(local).zip(prefix.chunks_mut(local)) {
        let mut running = 0i32;
        for (x, out) in block_in.iter().zip(block_out.iter_mut()) {
            *out = running;
            running = running.wrapping_add(*x);
        }
        totals.push(running);
    }

    prefix_buf.store(&prefix)?;
    totals_buf.store(&totals)
}

/// `AddBlockOffsets(block_prefix, block_offsets, output, element_count)`
fn add_block_offsets(
    args: &[KernelArg<'_, HostBuffer>],
    global: usize,
    local: usize,
) -> MppResult<()> {
    check_arity(KERNEL_ADD_BLOCK_OFFSETS, args, 4)?;
    let prefix: Vec<i32> = buffer(KERNEL_ADD_BLOCK_OFFSETS, args, 0)?.load();
    let offsets: Vec<i32> = buffer(KERNEL_ADD_BLOCK_OFFSETS, args, 1)?.load();
    let out_buf = buffer(KERNEL_ADD_BLOCK_OFFSETS, args, 2)?;
    let count = scalar(KERNEL_ADD_BLOCK_OFFSETS, args, 3)? as usize;
    let active = count.min(global);
    check_len(KERNEL_ADD_BLOCK_OFFSETS, prefix.len(), active)?;
    check_len(KERNEL_ADD_BLOCK_OFFSETS, offsets.len(), active.div_ceil(local))?;

    // Lanes past `element_count` leave the output untouched.
    let mut out: Vec<i32> = out_buf.load();
    check_len(KERNEL_ADD_BLOCK_OFFSETS, out.len(), active)?;
    for (i, slot) in out[..active].iter_mut().enumerate() {
        *slot = prefix[i].wrapping_add(offsets[i / local]);
    }
    out_buf.store(&out)
}
