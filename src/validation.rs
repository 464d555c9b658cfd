/// Cross-module validation on the host executor.
///
/// These tests verify:
/// 1. **Scan equivalence** - the blocked device scan equals the sequential scan
/// 2. **Table round-trip** - every inserted key reads back its value
/// 3. **Absent keys** - lookups that miss return the empty marker
/// 4. **Resource hygiene** - repeated runs leave no device buffers behind
/// 5. **Failure reporting** - impossible budgets surface as data, not errors
#[cfg(test)]
mod tests {
    use crate::cuckoo::{suggested_max_iterations, Construction, CuckooConfig, CuckooHashTable};
    use crate::device::Device;
    use crate::host::HostDevice;
    use crate::scan::{calculate_cpu, PrefixSum};
    use crate::sizing::EMPTY_32;

    use proptest::collection::{hash_set, vec};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn device() -> HostDevice {
        let mut device = HostDevice::new();
        CuckooHashTable::load_kernels(&mut device).unwrap();
        PrefixSum::load_kernels(&mut device).unwrap();
        device
    }

    /// Scan inputs with a bias towards the extremes that expose overflow.
    fn arb_element() -> impl Strategy<Value = i32> {
        prop_oneof![
            4 => -1000i32..1000,
            1 => Just(i32::MAX),
            1 => Just(i32::MIN),
            1 => any::<i32>(),
        ]
    }

    /// Distinct keys that avoid the reserved padding key.
    fn arb_keys(max: usize) -> impl Strategy<Value = Vec<u32>> {
        hash_set(0u32..EMPTY_32, 1..max).prop_map(|set| set.into_iter().collect())
    }

    fn roomy_config(n: usize, seed: u64) -> CuckooConfig {
        CuckooConfig::default()
            .with_table_size_factor(4.0)
            .with_max_iterations(suggested_max_iterations(n).max(8))
            .with_max_reconstructions(8)
            .with_seed(seed)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn scan_matches_sequential(input in vec(arb_element(), 0..3000)) {
            let device = device();
            let scan = PrefixSum::new(&device);
            prop_assert_eq!(scan.calculate_gpu(&input).unwrap(), calculate_cpu(&input));
            prop_assert_eq!(device.live_buffers(), 0);
        }

        #[test]
        fn table_round_trip(keys in arb_keys(600), seed in any::<u64>()) {
            let device = device();
            let values: Vec<u32> = keys.iter().map(|k| k.rotate_left(7) ^ 0x5a5a_5a5a).collect();

            let mut table = CuckooHashTable::new(&device, roomy_config(keys.len(), seed));
            let built = table.build(keys.len(), &keys, &values).unwrap();
            prop_assert!(built.is_built(), "{:?}", built);
            prop_assert_eq!(table.get(&keys).unwrap(), values);
        }

        #[test]
        fn absent_keys_miss(keys in arb_keys(200), probes in vec(0u32..EMPTY_32, 1..100)) {
            let device = device();
            let values: Vec<u32> = keys.iter().map(|&k| k / 2).collect();
            let mut table = CuckooHashTable::new(&device, roomy_config(keys.len(), 11));
            prop_assume!(table.build(keys.len(), &keys, &values).unwrap().is_built());

            let found = table.get(&probes).unwrap();
            for (probe, got) in probes.iter().zip(found) {
                match keys.iter().position(|k| k == probe) {
                    Some(i) => prop_assert_eq!(got, values[i]),
                    None => prop_assert_eq!(got, EMPTY_32),
                }
            }
        }
    }

    #[test]
    fn test_empty_table_lookup() {
        let device = device();
        let mut table = CuckooHashTable::new(&device, CuckooConfig::default().with_seed(3));
        table.init(1000).unwrap();
        let probes: Vec<u32> = (0..500).collect();
        assert!(table.get(&probes).unwrap().iter().all(|&v| v == EMPTY_32));
    }

    #[test]
    fn test_repeated_runs_release_buffers() {
        let device = device();
        let mut rng = StdRng::seed_from_u64(99);
        for round in 0..10 {
            let n = rng.gen_range(1..5000);
            let keys: Vec<u32> = (0..n as u32).map(|k| k * 3 + round).collect();
            let values: Vec<u32> = keys.iter().map(|k| k + 1).collect();
            {
                let mut table = CuckooHashTable::new(&device, roomy_config(n, round as u64));
                assert!(table.build(n, &keys, &values).unwrap().is_built());
                // The table and its parameter block stay resident.
                assert_eq!(device.live_buffers(), 2);
            }

            let elements: Vec<i32> = (0..n).map(|_| rng.gen_range(-50..50)).collect();
            PrefixSum::new(&device).calculate_gpu(&elements).unwrap();
            assert_eq!(device.live_buffers(), 0, "round {round}");
        }
    }

    #[test]
    fn test_impossible_budget_is_reported() {
        let device = device();
        // Two slots cannot hold a hundred keys whatever the hash functions.
        let config = CuckooConfig::default()
            .with_table_size_factor(1.0)
            .with_max_iterations(4)
            .with_max_reconstructions(3)
            .with_seed(5);
        let keys: Vec<u32> = (0..100).collect();
        let mut table = CuckooHashTable::new(&device, config);
        assert_eq!(
            table.build(2, &keys, &keys).unwrap(),
            Construction::Exhausted { attempts: 3 }
        );
    }

    #[test]
    fn test_scan_then_hash_prefix_positions() {
        // Compact the nonzero flags with a scan, then index the survivors
        // by their compacted position.
        let device = device();
        let flags: Vec<i32> = (0..2000).map(|i| i32::from(i % 3 == 0)).collect();
        let positions = PrefixSum::new(&device).calculate_gpu(&flags).unwrap();

        let (keys, values): (Vec<u32>, Vec<u32>) = flags
            .iter()
            .zip(&positions)
            .enumerate()
            .filter(|(_, (flag, _))| **flag == 1)
            .map(|(i, (_, &pos))| (i as u32, pos as u32))
            .unzip();

        let mut table = CuckooHashTable::new(&device, roomy_config(keys.len(), 21));
        assert!(table.build(keys.len(), &keys, &values).unwrap().is_built());
        assert_eq!(table.get(&[0, 3, 1998]).unwrap(), vec![0, 1, 666]);
        assert_eq!(table.get(&[1]).unwrap(), vec![EMPTY_32]);
    }
}
