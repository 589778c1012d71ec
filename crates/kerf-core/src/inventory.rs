//! Hardware resource inventory
//!
//! The immutable catalog of everything that can be partitioned: CPUs (with
//! host-reserved ones), the memory pool, optional NUMA topology and the
//! device catalog with SR-IOV functions and storage namespaces.
//!
//! An `Inventory` is built once (by the device-tree decoder or in code),
//! checked with [`Inventory::check`], and then shared read-only behind an
//! `Arc` by every state derived from it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::{CpuId, MemoryRegion, NodeId, SubResource};
use crate::violation::{Category, Conflict, Violation};

// ============================================================================
// CPUs
// ============================================================================

/// Logical CPUs `0..total`, partitioned into host-reserved and available
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet {
    pub total: u32,
    pub host_reserved: BTreeSet<CpuId>,
    pub available: BTreeSet<CpuId>,
}

impl CpuSet {
    /// Every CPU not in `host_reserved` is available.
    pub fn new(total: u32, host_reserved: impl IntoIterator<Item = CpuId>) -> Self {
        let host_reserved: BTreeSet<CpuId> = host_reserved.into_iter().collect();
        let available = (0..total).filter(|c| !host_reserved.contains(c)).collect();
        Self {
            total,
            host_reserved,
            available,
        }
    }

    /// True if `cpu` is a valid logical id
    pub fn exists(&self, cpu: CpuId) -> bool {
        cpu < self.total
    }

    pub fn is_available(&self, cpu: CpuId) -> bool {
        self.available.contains(&cpu)
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Physical memory layout: host region at `[0, host_reserved_bytes)` and
/// the partitionable pool at `[pool_base, pool_base + pool_bytes)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPool {
    pub total_bytes: u64,
    pub host_reserved_bytes: u64,
    pub pool_base: u64,
    pub pool_bytes: u64,
}

impl MemoryPool {
    /// The partitionable pool as a region
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.pool_base, self.pool_bytes)
    }

    /// The host-reserved region
    pub fn host_region(&self) -> MemoryRegion {
        MemoryRegion::new(0, self.host_reserved_bytes)
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Sub-resource id space of an SR-IOV or storage device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResourceSpace {
    pub total: u32,
    pub host_reserved: BTreeSet<u32>,
    pub available: BTreeSet<u32>,
}

impl SubResourceSpace {
    pub fn new(
        total: u32,
        host_reserved: impl IntoIterator<Item = u32>,
        available: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            total,
            host_reserved: host_reserved.into_iter().collect(),
            available: available.into_iter().collect(),
        }
    }
}

/// What a device can be split into
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "space", rename_all = "snake_case")]
pub enum DeviceResources {
    /// Passed through whole
    Plain,
    /// Virtual functions `0..total`
    Sriov(SubResourceSpace),
    /// Namespaces `1..=total`
    Storage(SubResourceSpace),
}

impl DeviceResources {
    /// Valid sub-resource ids for this kind
    pub fn id_range(&self) -> Option<Range<u32>> {
        match self {
            DeviceResources::Plain => None,
            DeviceResources::Sriov(space) => Some(0..space.total),
            DeviceResources::Storage(space) => Some(1..space.total.saturating_add(1)),
        }
    }

    pub fn space(&self) -> Option<&SubResourceSpace> {
        match self {
            DeviceResources::Plain => None,
            DeviceResources::Sriov(space) | DeviceResources::Storage(space) => Some(space),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DeviceResources::Plain => "plain",
            DeviceResources::Sriov(_) => "sriov",
            DeviceResources::Storage(_) => "storage",
        }
    }

    /// Build the sub-resource selector of this kind for `id`
    pub fn sub_resource(&self, id: u32) -> SubResource {
        match self {
            DeviceResources::Plain => SubResource::Whole,
            DeviceResources::Sriov(_) => SubResource::Vf(id),
            DeviceResources::Storage(_) => SubResource::Namespace(id),
        }
    }
}

/// A device in the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub compatible: String,
    pub pci_id: Option<String>,
    pub resources: DeviceResources,
}

impl Device {
    /// True if `sub` is the right kind for this device and within its id range
    pub fn accepts(&self, sub: SubResource) -> bool {
        match (&self.resources, sub) {
            (DeviceResources::Plain, SubResource::Whole) => true,
            (DeviceResources::Sriov(_), SubResource::Vf(id))
            | (DeviceResources::Storage(_), SubResource::Namespace(id)) => self
                .resources
                .id_range()
                .map(|r| r.contains(&id))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// True if `sub` may be handed to an instance
    pub fn is_available(&self, sub: SubResource) -> bool {
        match (self.resources.space(), sub.id()) {
            (None, None) => true,
            (Some(space), Some(id)) => space.available.contains(&id),
            _ => false,
        }
    }
}

// ============================================================================
// NUMA topology
// ============================================================================

/// Physical placement of one logical CPU
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPlacement {
    pub socket: u32,
    pub core: u32,
    pub numa_node: NodeId,
}

/// One NUMA node: its memory range and CPUs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub memory: MemoryRegion,
    pub cpus: BTreeSet<CpuId>,
}

/// NUMA topology: per-CPU placement, nodes and a row-major distance matrix
/// indexed by node position (ascending node id).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub cpus: BTreeMap<CpuId, CpuPlacement>,
    pub nodes: BTreeMap<NodeId, NumaNode>,
    pub distances: Vec<u32>,
}

impl Topology {
    /// Node owning `cpu`
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.cpus.get(&cpu).map(|p| p.numa_node).or_else(|| {
            self.nodes
                .iter()
                .find(|(_, node)| node.cpus.contains(&cpu))
                .map(|(id, _)| *id)
        })
    }

    /// `(socket, core)` of `cpu`; CPUs without placement sort as their own core
    pub fn core_of(&self, cpu: CpuId) -> (u32, u32) {
        self.cpus
            .get(&cpu)
            .map(|p| (p.socket, p.core))
            .unwrap_or((0, cpu))
    }

    /// Nodes whose memory ranges intersect `region`
    pub fn nodes_for_region(&self, region: &MemoryRegion) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.memory.overlaps(region))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_node(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    fn check(&self, cpus: &CpuSet, violations: &mut Vec<Violation>) {
        let mut seen: BTreeMap<CpuId, NodeId> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for cpu in &node.cpus {
                if let Some(prev) = seen.insert(*cpu, *id) {
                    violations.push(Violation::error(
                        Category::TopologyMismatch,
                        &[],
                        Conflict::Cpus {
                            cpus: [*cpu].into_iter().collect(),
                        },
                        format!("CPU {} is listed in NUMA nodes {} and {}", cpu, prev, id),
                    ));
                }
            }
        }

        let unplaced: BTreeSet<CpuId> = (0..cpus.total)
            .filter(|c| !seen.contains_key(c))
            .collect();
        if !unplaced.is_empty() {
            violations.push(Violation::error(
                Category::TopologyMismatch,
                &[],
                Conflict::Cpus { cpus: unplaced },
                "CPUs are not assigned to any NUMA node",
            ));
        }

        let stray: BTreeSet<CpuId> = seen.keys().filter(|c| !cpus.exists(**c)).copied().collect();
        if !stray.is_empty() {
            violations.push(Violation::error(
                Category::TopologyMismatch,
                &[],
                Conflict::Cpus { cpus: stray },
                "NUMA nodes list CPUs beyond the CPU count",
            ));
        }

        for (cpu, placement) in &self.cpus {
            match seen.get(cpu) {
                Some(node) if *node != placement.numa_node => {
                    violations.push(Violation::error(
                        Category::TopologyMismatch,
                        &[],
                        Conflict::Nodes {
                            nodes: vec![placement.numa_node, *node],
                        },
                        format!(
                            "CPU {} is placed on node {} but listed under node {}",
                            cpu, placement.numa_node, node
                        ),
                    ));
                }
                None if !self.has_node(placement.numa_node) => {
                    violations.push(Violation::error(
                        Category::TopologyMismatch,
                        &[],
                        Conflict::Nodes {
                            nodes: vec![placement.numa_node],
                        },
                        format!(
                            "CPU {} is placed on unknown NUMA node {}",
                            cpu, placement.numa_node
                        ),
                    ));
                }
                _ => {}
            }
        }

        let n = self.nodes.len();
        if !self.distances.is_empty() {
            if self.distances.len() != n * n {
                violations.push(Violation::error(
                    Category::TopologyMismatch,
                    &[],
                    Conflict::Capacity {
                        requested: self.distances.len() as u64,
                        limit: (n * n) as u64,
                    },
                    format!(
                        "distance matrix has {} entries, expected {} for {} nodes",
                        self.distances.len(),
                        n * n,
                        n
                    ),
                ));
            } else {
                for i in 0..n {
                    if self.distances[i * n + i] != 0 {
                        violations.push(Violation::error(
                            Category::TopologyMismatch,
                            &[],
                            Conflict::None,
                            format!(
                                "distance matrix diagonal is {} at ({}, {}), expected 0",
                                self.distances[i * n + i],
                                i,
                                i
                            ),
                        ));
                    }
                    for j in i + 1..n {
                        if self.distances[i * n + j] != self.distances[j * n + i] {
                            violations.push(Violation::error(
                                Category::TopologyMismatch,
                                &[],
                                Conflict::None,
                                format!("distance matrix is not symmetric at ({}, {})", i, j),
                            ));
                        }
                    }
                }
            }
        }

        let ids: Vec<&NodeId> = self.nodes.keys().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let (ra, rb) = (&self.nodes[*a].memory, &self.nodes[*b].memory);
                if let Some(overlap) = ra.intersection(rb) {
                    violations.push(Violation::error(
                        Category::TopologyMismatch,
                        &[],
                        Conflict::Overlap { region: overlap },
                        format!("memory ranges of NUMA nodes {} and {} overlap", a, b),
                    ));
                }
            }
        }
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// The complete hardware catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub cpus: CpuSet,
    pub memory: MemoryPool,
    pub topology: Option<Topology>,
    pub devices: BTreeMap<String, Device>,
}

impl Inventory {
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Node owning `cpu`; without topology every CPU is on node 0
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        match &self.topology {
            Some(topology) => topology.node_of(cpu),
            None => self.cpus.exists(cpu).then_some(0),
        }
    }

    /// Check internal consistency.
    ///
    /// Returns `inventory_invalid` and `topology_mismatch` errors; an empty
    /// result means the inventory can back a state.
    pub fn check(&self, page_size: u64) -> Vec<Violation> {
        let mut violations = Vec::new();

        self.check_cpus(&mut violations);
        self.check_memory(page_size, &mut violations);
        self.check_devices(&mut violations);
        if let Some(topology) = &self.topology {
            topology.check(&self.cpus, &mut violations);
        }

        violations
    }

    fn check_cpus(&self, violations: &mut Vec<Violation>) {
        let cpus = &self.cpus;
        if cpus.total == 0 {
            violations.push(invalid(Conflict::None, "inventory has no CPUs"));
            return;
        }

        let both: BTreeSet<CpuId> = cpus
            .available
            .intersection(&cpus.host_reserved)
            .copied()
            .collect();
        if !both.is_empty() {
            violations.push(invalid(
                Conflict::Cpus { cpus: both },
                "CPUs are both host-reserved and available",
            ));
        }

        let out: BTreeSet<CpuId> = cpus
            .available
            .union(&cpus.host_reserved)
            .filter(|c| !cpus.exists(**c))
            .copied()
            .collect();
        if !out.is_empty() {
            violations.push(invalid(
                Conflict::Cpus { cpus: out },
                format!("CPU ids exceed the total of {}", cpus.total),
            ));
        }

        let missing: BTreeSet<CpuId> = (0..cpus.total)
            .filter(|c| !cpus.available.contains(c) && !cpus.host_reserved.contains(c))
            .collect();
        if !missing.is_empty() {
            violations.push(invalid(
                Conflict::Cpus { cpus: missing },
                "CPUs are neither host-reserved nor available",
            ));
        }

        if cpus.available.is_empty() {
            violations.push(invalid(Conflict::None, "no CPUs are available for instances"));
        }
    }

    fn check_memory(&self, page_size: u64, violations: &mut Vec<Violation>) {
        let memory = &self.memory;
        let pool = memory.region();
        let total = MemoryRegion::new(0, memory.total_bytes);

        if memory.pool_bytes == 0 {
            violations.push(invalid(Conflict::None, "memory pool is empty"));
        }
        if page_size != 0 && (memory.pool_base % page_size != 0 || memory.pool_bytes % page_size != 0)
        {
            violations.push(invalid(
                Conflict::Address {
                    base: memory.pool_base,
                },
                format!("memory pool {} is not aligned to {:#x}", pool, page_size),
            ));
        }
        if memory.host_reserved_bytes > memory.total_bytes {
            violations.push(invalid(
                Conflict::Capacity {
                    requested: memory.host_reserved_bytes,
                    limit: memory.total_bytes,
                },
                "host-reserved memory exceeds total memory",
            ));
        }
        if memory.pool_base.checked_add(memory.pool_bytes).is_none() || !total.contains(&pool) {
            violations.push(invalid(
                Conflict::Region {
                    region: pool,
                    bound: total,
                },
                format!("memory pool {} extends beyond total memory", pool),
            ));
        }
        if let Some(overlap) = memory.host_region().intersection(&pool) {
            violations.push(invalid(
                Conflict::Overlap { region: overlap },
                "memory pool overlaps the host-reserved region",
            ));
        }
    }

    fn check_devices(&self, violations: &mut Vec<Violation>) {
        for (name, device) in &self.devices {
            let (Some(space), Some(range)) = (device.resources.space(), device.resources.id_range())
            else {
                continue;
            };

            let both: Vec<u32> = space
                .available
                .intersection(&space.host_reserved)
                .copied()
                .collect();
            if !both.is_empty() {
                violations.push(invalid(
                    Conflict::Ids { ids: both },
                    format!("device {}: sub-resources both host-reserved and available", name),
                ));
            }

            let out: Vec<u32> = space
                .available
                .union(&space.host_reserved)
                .filter(|id| !range.contains(id))
                .copied()
                .collect();
            if !out.is_empty() {
                violations.push(invalid(
                    Conflict::Ids { ids: out },
                    format!(
                        "device {}: sub-resource ids outside {}..{}",
                        name, range.start, range.end
                    ),
                ));
            }

            let missing: Vec<u32> = range
                .clone()
                .filter(|id| !space.available.contains(id) && !space.host_reserved.contains(id))
                .collect();
            if !missing.is_empty() {
                violations.push(invalid(
                    Conflict::Ids { ids: missing },
                    format!(
                        "device {}: sub-resources neither host-reserved nor available",
                        name
                    ),
                ));
            }
        }
    }
}

fn invalid(conflict: Conflict, message: impl Into<String>) -> Violation {
    Violation::error(Category::InventoryInvalid, &[], conflict, message)
}
