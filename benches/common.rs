#![allow(dead_code)]

use criterion::measurement::WallTime;
use criterion::BenchmarkGroup;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::Duration;

pub const SCAN_SIZES: &[usize] = &[4096, 262_144, 4_194_304];
pub const HASH_SIZES: &[usize] = &[4096, 65_536, 1_048_576];

pub fn cap(group: &mut BenchmarkGroup<'_, WallTime>) {
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
}

/// Small signed values so sums stay readable when a run is inspected.
pub fn scan_input(len: usize) -> Vec<i32> {
    let mut rng = StdRng::seed_from_u64(0x5ca9);
    (0..len).map(|_| rng.gen_range(-100..100)).collect()
}

/// `len` unique keys (never the reserved all-ones key) and their values.
pub fn hash_entries(len: usize) -> (Vec<u32>, Vec<u32>) {
    let mut rng = StdRng::seed_from_u64(0xc0c0);
    let mut seen = HashSet::with_capacity(len);
    let mut keys = Vec::with_capacity(len);
    while keys.len() < len {
        let key = rng.gen_range(0..u32::MAX);
        if seen.insert(key) {
            keys.push(key);
        }
    }
    let values = (0..len as u32).collect();
    (keys, values)
}
