use super::*;
use crate::cuckoo::{Slot, STATUS_FAILED, STATUS_SUCCESS};
use crate::device::{
    CUCKOO_HASH_SOURCE, KERNEL_ADD_BLOCK_OFFSETS, KERNEL_INSERT, KERNEL_RETRIEVE,
    KERNEL_SCAN_BLOCKS, PREFIX_SUM_SOURCE,
};

fn scan_device() -> HostDevice {
    let mut device = HostDevice::new();
    device
        .load_kernel(PREFIX_SUM_SOURCE, &[KERNEL_SCAN_BLOCKS, KERNEL_ADD_BLOCK_OFFSETS])
        .unwrap();
    device
}

fn buffer_with(device: &HostDevice, data: &[i32], access: MemAccess) -> HostBuffer {
    let mut buf = device.allocate(std::mem::size_of_val(data), access).unwrap();
    device.write(&mut buf, data).unwrap();
    buf
}

fn read_all(device: &HostDevice, buf: &HostBuffer) -> Vec<i32> {
    let mut out = vec![0i32; buf.len() / 4];
    device.read(buf, &mut out).unwrap();
    out
}

#[test]
fn test_write_read_round_trip() {
    let device = HostDevice::new();
    let buf = buffer_with(&device, &[1, -2, 3, i32::MIN], MemAccess::ReadWrite);
    assert_eq!(buf.len(), 16);
    assert_eq!(read_all(&device, &buf), vec![1, -2, 3, i32::MIN]);
}

#[test]
fn test_partial_read() {
    let device = HostDevice::new();
    let buf = buffer_with(&device, &[7, 8, 9, 10], MemAccess::ReadOnly);
    let mut head = [0i32; 2];
    device.read(&buf, &mut head).unwrap();
    assert_eq!(head, [7, 8]);
}

#[test]
fn test_out_of_bounds_transfers() {
    let device = HostDevice::new();
    let mut buf = device.allocate(8, MemAccess::ReadWrite).unwrap();
    assert!(matches!(
        device.write(&mut buf, &[1u32, 2, 3]),
        Err(MppError::Device(_))
    ));
    let mut out = [0u64; 2];
    assert!(matches!(device.read(&buf, &mut out), Err(MppError::Device(_))));
}

#[test]
fn test_zero_sized_allocation_rejected() {
    let device = HostDevice::new();
    assert_eq!(
        device.allocate(0, MemAccess::ReadWrite).unwrap_err(),
        MppError::InvalidInput
    );
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_live_buffer_accounting() {
    let device = HostDevice::new();
    let a = device.allocate(4, MemAccess::ReadWrite).unwrap();
    let b = device.allocate(4, MemAccess::ReadOnly).unwrap();
    assert_eq!(device.live_buffers(), 2);
    drop(a);
    assert_eq!(device.live_buffers(), 1);
    drop(b);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_unknown_source() {
    let mut device = HostDevice::new();
    let err = device.load_kernel("missing.cl", &["Foo"]).unwrap_err();
    assert!(matches!(err, MppError::KernelSource(_)));
}

#[test]
fn test_unknown_kernel_in_source() {
    let mut device = HostDevice::new();
    let err = device
        .load_kernel(CUCKOO_HASH_SOURCE, &[KERNEL_INSERT, KERNEL_SCAN_BLOCKS])
        .unwrap_err();
    assert!(matches!(err, MppError::KernelSource(_)));
}

#[test]
fn test_load_registers_kernels() {
    let mut device = HostDevice::new();
    device
        .load_kernel(CUCKOO_HASH_SOURCE, &[KERNEL_INSERT, KERNEL_RETRIEVE])
        .unwrap();
    assert!(device.has_kernel(KERNEL_INSERT));
    assert!(device.has_kernel(KERNEL_RETRIEVE));
    assert!(!device.has_kernel(KERNEL_SCAN_BLOCKS));
}

#[test]
fn test_dispatch_unloaded_kernel() {
    let device = HostDevice::new();
    let err = device.dispatch(KERNEL_SCAN_BLOCKS, &[], 256, 256).unwrap_err();
    assert_eq!(err, MppError::KernelNotLoaded(KERNEL_SCAN_BLOCKS.to_string()));
}

#[test]
fn test_teardown_is_idempotent() {
    let mut device = scan_device();
    device.teardown();
    device.teardown();
    assert!(!device.has_kernel(KERNEL_SCAN_BLOCKS));
    assert!(matches!(
        device.dispatch(KERNEL_SCAN_BLOCKS, &[], 256, 256),
        Err(MppError::KernelNotLoaded(_))
    ));
}

#[test]
fn test_dispatch_rejects_partial_work_group() {
    let device = scan_device();
    let input = buffer_with(&device, &[1; 300], MemAccess::ReadOnly);
    let prefix = device.allocate(300 * 4, MemAccess::ReadWrite).unwrap();
    let totals = device.allocate(4 * 2, MemAccess::ReadWrite).unwrap();
    let err = device
        .dispatch(
            KERNEL_SCAN_BLOCKS,
            &[
                KernelArg::Buffer(&input),
                KernelArg::Buffer(&prefix),
                KernelArg::Buffer(&totals),
            ],
            300,
            256,
        )
        .unwrap_err();
    assert!(matches!(err, MppError::Device(_)));
}

#[test]
fn test_wrong_argument_kind() {
    let device = scan_device();
    let input = buffer_with(&device, &[1; 256], MemAccess::ReadOnly);
    let prefix = device.allocate(256 * 4, MemAccess::ReadWrite).unwrap();
    let err = device
        .dispatch(
            KERNEL_SCAN_BLOCKS,
            &[
                KernelArg::Buffer(&input),
                KernelArg::Buffer(&prefix),
                KernelArg::U32(0),
            ],
            256,
            256,
        )
        .unwrap_err();
    assert_eq!(
        err,
        MppError::KernelArgument {
            kernel: KERNEL_SCAN_BLOCKS.to_string(),
            index: 2
        }
    );
}

#[test]
fn test_missing_argument() {
    let device = scan_device();
    let input = buffer_with(&device, &[1; 256], MemAccess::ReadOnly);
    let err = device
        .dispatch(KERNEL_SCAN_BLOCKS, &[KernelArg::Buffer(&input)], 256, 256)
        .unwrap_err();
    assert!(matches!(err, MppError::KernelArgument { index: 1, .. }));
}

#[test]
fn test_store_into_read_only_buffer_fails() {
    let device = scan_device();
    let input = buffer_with(&device, &[1; 256], MemAccess::ReadOnly);
    let prefix = device.allocate(256 * 4, MemAccess::ReadOnly).unwrap();
    let totals = device.allocate(4, MemAccess::ReadWrite).unwrap();
    let err = device
        .dispatch(
            KERNEL_SCAN_BLOCKS,
            &[
                KernelArg::Buffer(&input),
                KernelArg::Buffer(&prefix),
                KernelArg::Buffer(&totals),
            ],
            256,
            256,
        )
        .unwrap_err();
    assert!(matches!(err, MppError::Device(_)));
}

#[test]
fn test_scan_blocks_restarts_per_block() {
    let device = scan_device();
    let input = buffer_with(&device, &[1, 2, 3, 4, 5, 6, 7, 8], MemAccess::ReadOnly);
    let prefix = device.allocate(8 * 4, MemAccess::ReadWrite).unwrap();
    let totals = device.allocate(2 * 4, MemAccess::ReadWrite).unwrap();
    device
        .dispatch(
            KERNEL_SCAN_BLOCKS,
            &[
                KernelArg::Buffer(&input),
                KernelArg::Buffer(&prefix),
                KernelArg::Buffer(&totals),
            ],
            8,
            4,
        )
        .unwrap();
    assert_eq!(read_all(&device, &prefix), vec![0, 1, 3, 6, 0, 5, 11, 18]);
    assert_eq!(read_all(&device, &totals), vec![10, 26]);
}

#[test]
fn test_add_block_offsets_in_place() {
    let device = scan_device();
    let data = buffer_with(&device, &[0, 1, 3, 6, 0, 5, 11, 18], MemAccess::ReadWrite);
    let offsets = buffer_with(&device, &[0, 10], MemAccess::ReadOnly);
    device
        .dispatch(
            KERNEL_ADD_BLOCK_OFFSETS,
            &[
                KernelArg::Buffer(&data),
                KernelArg::Buffer(&offsets),
                KernelArg::Buffer(&data),
                KernelArg::U32(8),
            ],
            8,
            4,
        )
        .unwrap();
    assert_eq!(read_all(&device, &data), vec![0, 1, 3, 6, 10, 15, 21, 28]);
}

#[test]
fn test_add_block_offsets_respects_element_count() {
    let device = scan_device();
    let data = buffer_with(&device, &[1, 1, 1, 1, 1, 1, 1, 1], MemAccess::ReadOnly);
    let offsets = buffer_with(&device, &[100, 200], MemAccess::ReadOnly);
    let out = buffer_with(&device, &[-1; 8], MemAccess::WriteOnly);
    device
        .dispatch(
            KERNEL_ADD_BLOCK_OFFSETS,
            &[
                KernelArg::Buffer(&data),
                KernelArg::Buffer(&offsets),
                KernelArg::Buffer(&out),
                KernelArg::U32(6),
            ],
            8,
            4,
        )
        .unwrap();
    assert_eq!(
        read_all(&device, &out),
        vec![101, 101, 101, 101, 201, 201, -1, -1]
    );
}

/// Two-slot table where h0(k) = k mod 2 and h1(k) = (k + 1) mod 2, so keys
/// 0 and 2 share slot 0 and both have slot 1 as their alternative.
fn colliding_params(max_iterations: u32) -> [u32; 10] {
    [1, 0, 1, 1, 1, 0, 1, 1, max_iterations, 2]
}

/// Run `Insert` for keys 0 then 2 and return (status, table).
fn insert_colliding_pair(max_iterations: u32) -> (u32, Vec<Slot>) {
    let mut device = HostDevice::new();
    device
        .load_kernel(CUCKOO_HASH_SOURCE, &[KERNEL_INSERT])
        .unwrap();

    let mut keys = device.allocate(8, MemAccess::ReadOnly).unwrap();
    device.write(&mut keys, &[0u32, 2]).unwrap();
    let mut values = device.allocate(8, MemAccess::ReadOnly).unwrap();
    device.write(&mut values, &[10u32, 20]).unwrap();
    let mut table = device.allocate(16, MemAccess::ReadWrite).unwrap();
    device.write(&mut table, &[u64::MAX; 2]).unwrap();
    let mut params = device.allocate(40, MemAccess::ReadOnly).unwrap();
    device.write(&mut params, &colliding_params(max_iterations)).unwrap();
    let mut status = device.allocate(4, MemAccess::ReadWrite).unwrap();
    device.write(&mut status, &[STATUS_SUCCESS]).unwrap();

    device
        .dispatch(
            KERNEL_INSERT,
            &[
                KernelArg::Buffer(&keys),
                KernelArg::Buffer(&values),
                KernelArg::Buffer(&table),
                KernelArg::Buffer(&params),
                KernelArg::Buffer(&status),
            ],
            2,
            2,
        )
        .unwrap();

    let mut word = [0u32];
    device.read(&status, &mut word).unwrap();
    let mut raw = [0u64; 2];
    device.read(&table, &mut raw).unwrap();
    (word[0], raw.into_iter().map(Slot::unpack).collect())
}

#[test]
fn test_insert_resolves_single_eviction() {
    let (status, slots) = insert_colliding_pair(1);
    assert_eq!(status, STATUS_SUCCESS);
    assert_eq!(
        slots,
        vec![
            Slot::Occupied { key: 2, value: 20 },
            Slot::Occupied { key: 0, value: 10 },
        ]
    );
}

#[test]
fn test_insert_without_eviction_budget_fails_on_collision() {
    let (status, _) = insert_colliding_pair(0);
    assert_eq!(status, STATUS_FAILED);
}
