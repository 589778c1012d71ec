//! Topology-aware allocator
//!
//! Resolves count-based requests into concrete CPU ids and memory regions.
//! The allocator only proposes: every result is fed back through the
//! validator before it becomes part of a state.
//!
//! # CPU affinity
//!
//! - `compact` / `local`: one NUMA node, the window of `count` CPUs (ordered
//!   by socket, core, id) touching the fewest cores, then the narrowest id
//!   span. Never falls back to spreading.
//! - `spread`: round-robin over nodes in ascending order until satisfied.
//!
//! # Memory policy
//!
//! - none: first fit in the pool
//! - `local` (or `local` affinity): first fit inside the CPUs' node ranges
//! - `interleave`: page-aligned chunks, one per node, merged when contiguous
//! - `bind`: first fit inside the requested nodes only
//!
//! Without topology every CPU is on an implicit node 0 whose memory is the
//! whole pool.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::AllocationError;
use crate::freespace::{find_free_base, Occupancy};
use crate::inventory::Inventory;
use crate::state::ValidatedState;
use crate::types::{align_up, CpuAffinity, CpuId, MemoryPolicy, MemoryRegion, NodeId, PAGE_SIZE};

/// Allocator tunables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub page_size: u64,
    pub default_cpu_affinity: CpuAffinity,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            default_cpu_affinity: CpuAffinity::Compact,
        }
    }
}

impl From<&Config> for AllocatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            default_cpu_affinity: config.default_cpu_affinity,
        }
    }
}

/// A count-based request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub numa_nodes: Option<BTreeSet<NodeId>>,
    pub cpu_affinity: Option<CpuAffinity>,
    pub memory_policy: Option<MemoryPolicy>,
}

impl AllocationRequest {
    pub fn new(cpu_count: u32, memory_bytes: u64) -> Self {
        Self {
            cpu_count,
            memory_bytes,
            numa_nodes: None,
            cpu_affinity: None,
            memory_policy: None,
        }
    }

    pub fn with_numa_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.numa_nodes = Some(nodes.into_iter().collect());
        self
    }

    pub fn with_cpu_affinity(mut self, affinity: CpuAffinity) -> Self {
        self.cpu_affinity = Some(affinity);
        self
    }

    pub fn with_memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = Some(policy);
        self
    }
}

/// Concrete CPUs and memory chosen for a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteClaim {
    pub cpus: BTreeSet<CpuId>,
    pub memory: Vec<MemoryRegion>,
}

/// Policy-driven placement over a free-resource view
#[derive(Clone, Debug, Default)]
pub struct Allocator {
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Resolve `request` against everything `existing` already claims
    pub fn allocate(
        &self,
        existing: &ValidatedState,
        request: &AllocationRequest,
    ) -> Result<ConcreteClaim, AllocationError> {
        self.allocate_excluding(existing, request, None)
    }

    /// Like [`allocate`](Self::allocate), treating the claims of instance
    /// `exclude` as free (used when resizing an existing instance)
    pub fn allocate_excluding(
        &self,
        existing: &ValidatedState,
        request: &AllocationRequest,
        exclude: Option<&str>,
    ) -> Result<ConcreteClaim, AllocationError> {
        let inventory = existing.inventory();
        let occupancy = existing.occupancy(exclude);

        let cpus = self.select_cpus(inventory, &occupancy, request)?;
        let memory = self.place_memory(inventory, &occupancy, request, &cpus)?;

        debug!(
            cpus = cpus.len(),
            regions = memory.len(),
            "allocated concrete claim"
        );
        Ok(ConcreteClaim { cpus, memory })
    }

    // ========================================================================
    // CPUs
    // ========================================================================

    /// Pick `request.cpu_count` free CPUs according to the affinity policy
    pub fn select_cpus(
        &self,
        inventory: &Inventory,
        occupancy: &Occupancy,
        request: &AllocationRequest,
    ) -> Result<BTreeSet<CpuId>, AllocationError> {
        let count = request.cpu_count as usize;
        if count == 0 {
            return Err(AllocationError::InvalidRequest(
                "CPU count must be at least 1".to_string(),
            ));
        }
        check_nodes(inventory, request.numa_nodes.as_ref())?;

        let mut free = occupancy.free_cpus(inventory);
        if let Some(nodes) = &request.numa_nodes {
            free.retain(|c| inventory.node_of(*c).is_some_and(|n| nodes.contains(&n)));
        }
        let groups = group_by_node(inventory, &free);

        let affinity = request
            .cpu_affinity
            .unwrap_or(self.config.default_cpu_affinity);
        match affinity {
            CpuAffinity::Compact | CpuAffinity::Local => compact(inventory, &groups, count),
            CpuAffinity::Spread => spread(&groups, count),
        }
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Place `request.memory_bytes` according to the memory policy, given
    /// the CPUs already chosen for the instance
    pub fn place_memory(
        &self,
        inventory: &Inventory,
        occupancy: &Occupancy,
        request: &AllocationRequest,
        cpus: &BTreeSet<CpuId>,
    ) -> Result<Vec<MemoryRegion>, AllocationError> {
        let bytes = request.memory_bytes;
        if bytes == 0 {
            return Err(AllocationError::InvalidRequest(
                "memory size must be non-zero".to_string(),
            ));
        }
        check_nodes(inventory, request.numa_nodes.as_ref())?;

        let pool = inventory.memory.region();
        let align = self.config.page_size;
        let cpu_nodes: BTreeSet<NodeId> =
            cpus.iter().filter_map(|c| inventory.node_of(*c)).collect();
        let local = request.memory_policy == Some(MemoryPolicy::Local)
            || request.cpu_affinity == Some(CpuAffinity::Local);

        match (&inventory.topology, request.memory_policy) {
            (None, Some(MemoryPolicy::Bind)) => Err(AllocationError::TopologyRequired),
            (None, _) => occupancy
                .free_base(pool, bytes, align)
                .map(|base| vec![MemoryRegion::new(base, bytes)])
                .ok_or(AllocationError::NoSpace { bytes }),
            (Some(_), Some(MemoryPolicy::Bind)) => {
                let nodes = request.numa_nodes.as_ref().ok_or_else(|| {
                    AllocationError::InvalidRequest(
                        "bind memory policy requires NUMA nodes".to_string(),
                    )
                })?;
                self.fit_in_nodes(inventory, occupancy, nodes, bytes)
                    .ok_or_else(|| AllocationError::NoSpaceInBoundNodes {
                        bytes,
                        nodes: nodes.iter().copied().collect(),
                    })
            }
            (Some(_), Some(MemoryPolicy::Interleave)) => {
                let nodes = request.numa_nodes.clone().unwrap_or(cpu_nodes);
                self.interleave(inventory, occupancy, &nodes, bytes)
            }
            (Some(_), _) if local => self
                .fit_in_nodes(inventory, occupancy, &cpu_nodes, bytes)
                .ok_or_else(|| AllocationError::NoSpaceInLocalNodes {
                    bytes,
                    nodes: cpu_nodes.iter().copied().collect(),
                }),
            (Some(_), _) => occupancy
                .free_base(pool, bytes, align)
                .map(|base| vec![MemoryRegion::new(base, bytes)])
                .ok_or(AllocationError::NoSpace { bytes }),
        }
    }

    /// First fit inside the pool-clipped memory of `nodes`, lowest node first
    fn fit_in_nodes(
        &self,
        inventory: &Inventory,
        occupancy: &Occupancy,
        nodes: &BTreeSet<NodeId>,
        bytes: u64,
    ) -> Option<Vec<MemoryRegion>> {
        nodes.iter().find_map(|node| {
            let bound = node_window(inventory, *node)?;
            occupancy
                .free_base(bound, bytes, self.config.page_size)
                .map(|base| vec![MemoryRegion::new(base, bytes)])
        })
    }

    fn interleave(
        &self,
        inventory: &Inventory,
        occupancy: &Occupancy,
        nodes: &BTreeSet<NodeId>,
        bytes: u64,
    ) -> Result<Vec<MemoryRegion>, AllocationError> {
        let align = self.config.page_size;
        let share = bytes.div_ceil(nodes.len().max(1) as u64);
        let chunk = align_up(share, align).ok_or(AllocationError::NoSpace { bytes })?;

        let mut taken = occupancy.regions.clone();
        let mut regions: Vec<MemoryRegion> = Vec::new();
        let mut remaining = bytes;
        for node in nodes {
            if remaining == 0 {
                break;
            }
            let size = chunk.min(remaining);
            let bound = node_window(inventory, *node).ok_or(AllocationError::NoSpaceForInterleave {
                bytes: size,
                node: *node,
            })?;
            let base = find_free_base(bound, &taken, size, align).ok_or(
                AllocationError::NoSpaceForInterleave {
                    bytes: size,
                    node: *node,
                },
            )?;
            let region = MemoryRegion::new(base, size);
            taken.push(region);
            regions.push(region);
            remaining -= size;
        }

        Ok(merge_contiguous(regions))
    }
}

/// Reject NUMA restrictions the inventory cannot honor
fn check_nodes(
    inventory: &Inventory,
    nodes: Option<&BTreeSet<NodeId>>,
) -> Result<(), AllocationError> {
    let Some(nodes) = nodes else {
        return Ok(());
    };
    let topology = inventory
        .topology
        .as_ref()
        .ok_or(AllocationError::TopologyRequired)?;
    if nodes.is_empty() {
        return Err(AllocationError::InvalidRequest(
            "NUMA node list is empty".to_string(),
        ));
    }
    match nodes.iter().find(|n| !topology.has_node(**n)) {
        Some(unknown) => Err(AllocationError::UnknownNumaNode(*unknown)),
        None => Ok(()),
    }
}

/// Node memory range clipped to the pool
fn node_window(inventory: &Inventory, node: NodeId) -> Option<MemoryRegion> {
    let pool = inventory.memory.region();
    match &inventory.topology {
        Some(topology) => topology.nodes.get(&node)?.memory.intersection(&pool),
        None => (node == 0).then_some(pool),
    }
}

/// Free CPUs per node, each ordered by (socket, core, id)
fn group_by_node(inventory: &Inventory, free: &BTreeSet<CpuId>) -> BTreeMap<NodeId, Vec<CpuId>> {
    let mut groups: BTreeMap<NodeId, Vec<CpuId>> = BTreeMap::new();
    for cpu in free {
        if let Some(node) = inventory.node_of(*cpu) {
            groups.entry(node).or_default().push(*cpu);
        }
    }
    for cpus in groups.values_mut() {
        cpus.sort_by_key(|c| (core_key(inventory, *c), *c));
    }
    groups
}

fn core_key(inventory: &Inventory, cpu: CpuId) -> (u32, u32) {
    inventory
        .topology
        .as_ref()
        .map(|t| t.core_of(cpu))
        .unwrap_or((0, cpu))
}

fn compact(
    inventory: &Inventory,
    groups: &BTreeMap<NodeId, Vec<CpuId>>,
    count: usize,
) -> Result<BTreeSet<CpuId>, AllocationError> {
    let mut best: Option<((usize, u32), &[CpuId])> = None;

    for cpus in groups.values().filter(|g| g.len() >= count) {
        for window in cpus.windows(count) {
            let cores: BTreeSet<(u32, u32)> =
                window.iter().map(|c| core_key(inventory, *c)).collect();
            let lo = window.iter().min().copied().unwrap_or(0);
            let hi = window.iter().max().copied().unwrap_or(0);
            let score = (cores.len(), hi - lo);
            if best.map_or(true, |(s, _)| score < s) {
                best = Some((score, window));
            }
        }
    }

    match best {
        Some((_, window)) => Ok(window.iter().copied().collect()),
        None => Err(AllocationError::InsufficientLocalCapacity {
            requested: count as u32,
            largest: groups.values().map(|g| g.len()).max().unwrap_or(0) as u32,
        }),
    }
}

fn spread(
    groups: &BTreeMap<NodeId, Vec<CpuId>>,
    count: usize,
) -> Result<BTreeSet<CpuId>, AllocationError> {
    let free: usize = groups.values().map(Vec::len).sum();
    if free < count {
        return Err(AllocationError::InsufficientCapacity {
            requested: count as u32,
            available: free as u32,
        });
    }

    let mut picked = BTreeSet::new();
    let mut round = 0;
    while picked.len() < count {
        for cpus in groups.values() {
            if let Some(cpu) = cpus.get(round) {
                picked.insert(*cpu);
                if picked.len() == count {
                    break;
                }
            }
        }
        round += 1;
    }
    Ok(picked)
}

/// Sort by base and join regions that touch
fn merge_contiguous(mut regions: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
    regions.sort();
    let mut merged: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        match merged.last_mut() {
            Some(last) if last.end() == region.base => last.bytes += region.bytes,
            _ => merged.push(region),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::instance::Instance;
    use crate::invariants::validate;
    use crate::inventory::fixtures::{flat, numa, GB};

    fn state(inventory: Inventory, instances: Vec<Instance>) -> ValidatedState {
        validate(Arc::new(inventory), instances).unwrap()
    }

    // ========================================================================
    // CPU selection
    // ========================================================================

    #[test]
    fn test_compact_without_topology_takes_lowest_run() {
        let s = state(flat(), vec![]);
        let claim = Allocator::default()
            .allocate(&s, &AllocationRequest::new(4, GB))
            .unwrap();
        assert_eq!(claim.cpus, (4..8).collect());
        assert_eq!(claim.memory, vec![MemoryRegion::new(0x8000_0000, GB)]);
    }

    #[test]
    fn test_compact_skips_claimed_cpus() {
        let a = Instance::new("a", 1, [4, 5, 9], MemoryRegion::new(0x8000_0000, GB));
        let s = state(flat(), vec![a]);
        let claim = Allocator::default()
            .allocate(&s, &AllocationRequest::new(3, GB))
            .unwrap();
        assert_eq!(claim.cpus, (6..9).collect());
        assert_eq!(claim.memory, vec![MemoryRegion::new(0x8000_0000 + GB, GB)]);
    }

    #[test]
    fn test_compact_prefers_whole_cores() {
        // Two hyperthreads per core: CPU 5 claimed leaves core 2 half used
        let a = Instance::new("a", 1, [5], MemoryRegion::new(0x8000_0000, GB));
        let s = state(numa(), vec![a]);
        let claim = Allocator::default()
            .allocate(&s, &AllocationRequest::new(2, GB))
            .unwrap();
        assert_eq!(claim.cpus, [6, 7].into_iter().collect());
    }

    #[test]
    fn test_compact_insufficient_local_capacity() {
        let a = Instance::new("a", 1, 4..14, MemoryRegion::new(0x8000_0000, GB));
        let s = state(numa(), vec![a]);
        let req = AllocationRequest::new(8, GB)
            .with_cpu_affinity(CpuAffinity::Compact)
            .with_numa_nodes([0]);
        let err = Allocator::default().allocate(&s, &req).unwrap_err();
        assert_eq!(err.kind(), "insufficient-local-capacity");
    }

    #[test]
    fn test_spread_round_robins_nodes() {
        let s = state(numa(), vec![]);
        let req = AllocationRequest::new(4, GB).with_cpu_affinity(CpuAffinity::Spread);
        let claim = Allocator::default().allocate(&s, &req).unwrap();
        assert_eq!(claim.cpus, [4, 5, 16, 17].into_iter().collect());
    }

    #[test]
    fn test_spread_insufficient_capacity() {
        let s = state(flat(), vec![]);
        let req = AllocationRequest::new(29, GB).with_cpu_affinity(CpuAffinity::Spread);
        let err = Allocator::default().allocate(&s, &req).unwrap_err();
        assert_eq!(
            err,
            AllocationError::InsufficientCapacity {
                requested: 29,
                available: 28
            }
        );
    }

    #[test]
    fn test_request_errors() {
        let s = state(flat(), vec![]);
        let alloc = Allocator::default();
        assert!(matches!(
            alloc.allocate(&s, &AllocationRequest::new(0, GB)),
            Err(AllocationError::InvalidRequest(_))
        ));
        assert_eq!(
            alloc.allocate(&s, &AllocationRequest::new(1, GB).with_numa_nodes([0])),
            Err(AllocationError::TopologyRequired)
        );

        let s = state(numa(), vec![]);
        assert_eq!(
            alloc.allocate(&s, &AllocationRequest::new(1, GB).with_numa_nodes([7])),
            Err(AllocationError::UnknownNumaNode(7))
        );
    }

    // ========================================================================
    // Memory placement
    // ========================================================================

    #[test]
    fn test_local_memory_follows_cpus() {
        let s = state(numa(), vec![]);
        let req = AllocationRequest::new(2, GB)
            .with_numa_nodes([1])
            .with_cpu_affinity(CpuAffinity::Local);
        let claim = Allocator::default().allocate(&s, &req).unwrap();
        assert_eq!(claim.cpus, [16, 17].into_iter().collect());
        assert_eq!(claim.memory, vec![MemoryRegion::new(8 * GB, GB)]);
    }

    #[test]
    fn test_bind_fails_when_nodes_full() {
        let a = Instance::new("a", 1, [4], MemoryRegion::new(2 * GB, 6 * GB));
        let s = state(numa(), vec![a]);
        let req = AllocationRequest::new(1, GB)
            .with_numa_nodes([0])
            .with_memory_policy(MemoryPolicy::Bind);
        let err = Allocator::default().allocate(&s, &req).unwrap_err();
        assert_eq!(
            err,
            AllocationError::NoSpaceInBoundNodes {
                bytes: GB,
                nodes: vec![0]
            }
        );
    }

    #[test]
    fn test_bind_without_topology() {
        let s = state(flat(), vec![]);
        let req = AllocationRequest::new(1, GB).with_memory_policy(MemoryPolicy::Bind);
        assert_eq!(
            Allocator::default().allocate(&s, &req),
            Err(AllocationError::TopologyRequired)
        );
    }

    #[test]
    fn test_interleave_splits_across_nodes() {
        let s = state(numa(), vec![]);
        let req = AllocationRequest::new(2, 2 * GB)
            .with_numa_nodes([0, 1])
            .with_cpu_affinity(CpuAffinity::Spread)
            .with_memory_policy(MemoryPolicy::Interleave);
        let claim = Allocator::default().allocate(&s, &req).unwrap();
        assert_eq!(
            claim.memory,
            vec![MemoryRegion::new(2 * GB, GB), MemoryRegion::new(8 * GB, GB)]
        );
    }

    #[test]
    fn test_interleave_merges_contiguous_chunks() {
        let regions = merge_contiguous(vec![
            MemoryRegion::new(0x2000, 0x1000),
            MemoryRegion::new(0x1000, 0x1000),
            MemoryRegion::new(0x5000, 0x1000),
        ]);
        assert_eq!(
            regions,
            vec![MemoryRegion::new(0x1000, 0x2000), MemoryRegion::new(0x5000, 0x1000)]
        );
    }

    #[test]
    fn test_allocate_excluding_reuses_own_claims() {
        let a = Instance::new("a", 1, 4..32, MemoryRegion::new(0x8000_0000, 14 * GB));
        let s = state(flat(), vec![a]);
        let req = AllocationRequest::new(8, GB);
        assert!(Allocator::default().allocate(&s, &req).is_err());
        let claim = Allocator::default()
            .allocate_excluding(&s, &req, Some("a"))
            .unwrap();
        assert_eq!(claim.cpus, (4..12).collect());
    }
}
