//! Free-space queries
//!
//! What is left over once a set of instances has claimed its resources.
//! Used by the allocator to place new claims and by the validator to
//! compute remediations.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crate::instance::Instance;
use crate::inventory::Inventory;
use crate::types::{align_up, CpuId, DeviceClaim, InstanceId, MemoryRegion};

/// Resources claimed by a set of instances
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub cpus: BTreeSet<CpuId>,
    pub regions: Vec<MemoryRegion>,
    pub claims: BTreeSet<DeviceClaim>,
    pub ids: BTreeSet<InstanceId>,
}

impl Occupancy {
    /// Union of the claims of `instances`
    pub fn of<'a>(instances: impl IntoIterator<Item = &'a Instance>) -> Self {
        let mut occupancy = Occupancy::default();
        for inst in instances {
            occupancy.add(inst);
        }
        occupancy.regions.sort();
        occupancy
    }

    fn add(&mut self, inst: &Instance) {
        self.cpus.extend(inst.cpus.iter().copied());
        self.regions.extend(inst.memory.iter().copied());
        self.claims.extend(inst.devices.iter().cloned());
        self.ids.insert(inst.id);
    }

    /// Available CPUs nobody claims
    pub fn free_cpus(&self, inventory: &Inventory) -> BTreeSet<CpuId> {
        inventory
            .cpus
            .available
            .difference(&self.cpus)
            .copied()
            .collect()
    }

    /// Lowest aligned base for `bytes` inside `bound` that avoids every
    /// claimed region
    pub fn free_base(&self, bound: MemoryRegion, bytes: u64, align: u64) -> Option<u64> {
        find_free_base(bound, &self.regions, bytes, align)
    }

    /// Lowest available, unclaimed sub-resource of `device`
    pub fn free_subresource(&self, inventory: &Inventory, device: &str) -> Option<DeviceClaim> {
        let dev = inventory.device(device)?;
        let space = dev.resources.space()?;
        space
            .available
            .iter()
            .map(|id| DeviceClaim {
                device: device.to_string(),
                sub: dev.resources.sub_resource(*id),
            })
            .find(|claim| !self.claims.iter().any(|c| c.conflicts_with(claim)))
    }

    /// Lowest instance id in `1..=max` nobody uses
    pub fn free_id(&self, max: InstanceId) -> Option<InstanceId> {
        lowest_free(&self.ids, 1..=max)
    }
}

/// First-fit search over the gaps between `occupied` regions.
///
/// Regions outside `bound` are ignored. Returns `None` for a zero size or
/// when no gap is large enough.
pub fn find_free_base(
    bound: MemoryRegion,
    occupied: &[MemoryRegion],
    bytes: u64,
    align: u64,
) -> Option<u64> {
    if bytes == 0 {
        return None;
    }
    let mut taken: Vec<&MemoryRegion> = occupied.iter().filter(|r| r.overlaps(&bound)).collect();
    taken.sort();

    let mut cursor = align_up(bound.base, align)?;
    for region in taken {
        if cursor.checked_add(bytes)? <= region.base {
            return Some(cursor);
        }
        if region.end() > cursor {
            cursor = align_up(region.end(), align)?;
        }
    }
    (cursor.checked_add(bytes)? <= bound.end()).then_some(cursor)
}

/// First run of `count` consecutive ids in `free`, falling back to the
/// lowest `count` ids when no consecutive run exists.
pub fn suggest_cpus(free: &BTreeSet<CpuId>, count: usize) -> Option<Vec<CpuId>> {
    if count == 0 || free.len() < count {
        return None;
    }
    let mut run: Vec<CpuId> = Vec::with_capacity(count);
    for cpu in free {
        match run.last() {
            Some(last) if last + 1 == *cpu => run.push(*cpu),
            _ => {
                run.clear();
                run.push(*cpu);
            }
        }
        if run.len() == count {
            return Some(run);
        }
    }
    Some(free.iter().take(count).copied().collect())
}

/// Lowest value in `range` not in `used`
pub fn lowest_free(used: &BTreeSet<u32>, range: RangeInclusive<u32>) -> Option<u32> {
    range.into_iter().find(|id| !used.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::fixtures::{flat, GB};
    use crate::types::PAGE_SIZE;

    #[test]
    fn test_first_fit_skips_occupied() {
        let bound = MemoryRegion::new(0x1000, 0x10000);
        let occupied = [
            MemoryRegion::new(0x1000, 0x2000),
            MemoryRegion::new(0x4000, 0x1000),
        ];
        assert_eq!(find_free_base(bound, &occupied, 0x1000, PAGE_SIZE), Some(0x3000));
        assert_eq!(find_free_base(bound, &occupied, 0x2000, PAGE_SIZE), Some(0x5000));
        assert_eq!(find_free_base(bound, &occupied, 0x20000, PAGE_SIZE), None);
        assert_eq!(find_free_base(bound, &occupied, 0, PAGE_SIZE), None);
    }

    #[test]
    fn test_first_fit_aligns_after_unaligned_region() {
        let bound = MemoryRegion::new(0, 0x10000);
        let occupied = [MemoryRegion::new(0, 0x1800)];
        assert_eq!(find_free_base(bound, &occupied, 0x1000, PAGE_SIZE), Some(0x2000));
    }

    #[test]
    fn test_first_fit_exact_tail() {
        let bound = MemoryRegion::new(0, 0x3000);
        let occupied = [MemoryRegion::new(0, 0x2000)];
        assert_eq!(find_free_base(bound, &occupied, 0x1000, PAGE_SIZE), Some(0x2000));
    }

    #[test]
    fn test_suggest_prefers_consecutive_run() {
        let free: BTreeSet<CpuId> = [4, 6, 7, 8, 9, 12].into_iter().collect();
        assert_eq!(suggest_cpus(&free, 3), Some(vec![6, 7, 8]));
        assert_eq!(suggest_cpus(&free, 5), Some(vec![4, 6, 7, 8, 9]));
        assert_eq!(suggest_cpus(&free, 7), None);
    }

    #[test]
    fn test_occupancy_queries() {
        let inv = flat();
        let a = Instance::new("a", 1, 4..8, MemoryRegion::new(0x8000_0000, GB))
            .with_devices([DeviceClaim::vf("eth0", 1)]);
        let occupancy = Occupancy::of([&a]);

        assert_eq!(occupancy.free_cpus(&inv).len(), 24);
        assert_eq!(
            occupancy.free_base(inv.memory.region(), GB, PAGE_SIZE),
            Some(0x8000_0000 + GB)
        );
        assert_eq!(
            occupancy.free_subresource(&inv, "eth0"),
            Some(DeviceClaim::vf("eth0", 2))
        );
        assert_eq!(
            occupancy.free_subresource(&inv, "nvme0"),
            Some(DeviceClaim::namespace("nvme0", 2))
        );
        assert_eq!(occupancy.free_subresource(&inv, "gpu0"), None);
        assert_eq!(occupancy.free_id(511), Some(2));
    }
}
