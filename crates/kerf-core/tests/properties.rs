//! Property tests for the validator, allocator and overlay engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kerf_core::{
    diff_instances, validate, AllocationRequest, Allocator, CpuSet, Instance, Inventory,
    MemoryPool, MemoryRegion, Overlay, ValidatedState, PAGE_SIZE,
};
use proptest::prelude::*;

const GB: u64 = 1 << 30;
const SLICE: u64 = 64 << 20;
const POOL_BASE: u64 = 0x8000_0000;

fn inventory() -> Arc<Inventory> {
    Arc::new(Inventory {
        cpus: CpuSet::new(32, 0..4),
        memory: MemoryPool {
            total_bytes: 16 * GB,
            host_reserved_bytes: 2 * GB,
            pool_base: POOL_BASE,
            pool_bytes: 14 * GB,
        },
        topology: None,
        devices: BTreeMap::new(),
    })
}

/// Instances drawn from a small space so that collisions are common
fn arb_instances() -> impl Strategy<Value = Vec<Instance>> {
    prop::collection::vec(
        (
            prop::collection::btree_set(0u32..34, 1..6),
            0u64..24,
            1u64..4,
        ),
        0..6,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (cpus, slot, len))| {
                Instance::new(
                    format!("i{}", i),
                    i as u32 + 1,
                    cpus,
                    MemoryRegion::new(POOL_BASE + slot * SLICE, len * SLICE),
                )
            })
            .collect()
    })
}

fn same_result(
    a: &Result<ValidatedState, Vec<kerf_core::Violation>>,
    b: &Result<ValidatedState, Vec<kerf_core::Violation>>,
) -> bool {
    match (a, b) {
        (Ok(x), Ok(y)) => x.same_as(y),
        (Err(x), Err(y)) => x == y,
        _ => false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn validate_is_deterministic(instances in arb_instances()) {
        let first = validate(inventory(), instances.clone());
        let second = validate(inventory(), instances);
        prop_assert!(same_result(&first, &second));
    }

    #[test]
    fn valid_states_are_disjoint(instances in arb_instances()) {
        if let Ok(state) = validate(inventory(), instances) {
            let all: Vec<&Instance> = state.instances().collect();
            for (i, a) in all.iter().enumerate() {
                for b in &all[i + 1..] {
                    prop_assert!(a.cpus.is_disjoint(&b.cpus));
                    for ra in &a.memory {
                        for rb in &b.memory {
                            prop_assert!(!ra.overlaps(rb));
                        }
                    }
                    prop_assert_ne!(a.id, b.id);
                }
            }
        }
    }

    #[test]
    fn allocator_claims_validate(
        requests in prop::collection::vec((1u32..10, 1u64..40), 1..8)
    ) {
        let allocator = Allocator::default();
        let mut state = validate(inventory(), vec![]).unwrap();

        for (i, (count, slices)) in requests.into_iter().enumerate() {
            let bytes = slices * SLICE;
            let req = AllocationRequest::new(count, bytes);
            let occupancy = state.occupancy(None);
            let feasible = occupancy.free_cpus(state.inventory()).len() >= count as usize
                && occupancy
                    .free_base(state.inventory().memory.region(), bytes, PAGE_SIZE)
                    .is_some();

            match allocator.allocate(&state, &req) {
                Ok(claim) => {
                    prop_assert!(feasible);
                    prop_assert_eq!(claim.cpus.len(), count as usize);
                    prop_assert_eq!(claim.memory.iter().map(|r| r.bytes).sum::<u64>(), bytes);

                    let mut instances = state.to_instances();
                    instances.push(Instance {
                        cpus: claim.cpus,
                        memory: claim.memory,
                        ..Instance::new(
                            format!("a{}", i),
                            i as u32 + 1,
                            std::iter::empty(),
                            MemoryRegion::new(0, 0),
                        )
                    });
                    let next = validate(inventory(), instances);
                    prop_assert!(next.is_ok(), "claim rejected: {:?}", next.err());
                    state = next.unwrap();
                }
                Err(_) => prop_assert!(!feasible),
            }
        }
    }

    #[test]
    fn diff_of_identical_states_is_empty(instances in arb_instances()) {
        if let Ok(state) = validate(inventory(), instances) {
            prop_assert!(diff_instances(state.instance_map(), state.instance_map()).is_empty());
        }
    }

    #[test]
    fn overlay_then_inverse_restores(
        old in arb_instances(),
        new in arb_instances(),
        drop in prop::collection::btree_set(0usize..6, 0..3),
    ) {
        let old: BTreeMap<String, Instance> =
            old.into_iter().map(|i| (i.name.clone(), i)).collect();
        let new: BTreeMap<String, Instance> = new
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !drop.contains(i))
            .map(|(_, i)| (i.name.clone(), i))
            .collect();

        let overlay = Overlay::new(1, diff_instances(&old, &new));
        let forward = overlay.apply(&old).unwrap();
        prop_assert_eq!(&forward, &new);

        let back = overlay.inverse().apply(&forward).unwrap();
        prop_assert_eq!(&back, &old);

        // A second diff after applying has nothing left to do
        let names: BTreeSet<&String> = forward.keys().collect();
        prop_assert_eq!(names.len(), new.len());
        prop_assert!(diff_instances(&forward, &new).is_empty());
    }
}
