//! Allocation validator
//!
//! Checks a set of instances against an inventory and reports every
//! problem at once. Checks run as fixed passes, so the order of findings
//! is deterministic for a given input:
//!
//! 1. **Inventory**: the catalog itself is consistent (partitions, pool
//!    bounds, topology)
//! 2. **Range**: each instance names existing CPUs, in-pool memory,
//!    existing devices and nodes, and a valid id
//! 3. **Reservation**: nothing host-reserved is claimed
//! 4. **Exclusivity**: no two instances share a name, id, CPU, memory
//!    byte or device sub-resource
//! 5. **Capacity**: aggregate claims fit in what is available
//! 6. **Policy**: NUMA placement agrees with the requested affinity and
//!    memory policy (warnings only)
//!
//! Pairwise findings name the instances as `(earlier, later)` in input
//! order, and remediations are computed for the later one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::Config;
use crate::freespace::{suggest_cpus, Occupancy};
use crate::instance::Instance;
use crate::inventory::{Inventory, Topology};
use crate::state::ValidatedState;
use crate::types::{CpuAffinity, CpuId, InstanceId, MemoryPolicy, NodeId, MAX_INSTANCE_ID, PAGE_SIZE};
use crate::violation::{has_errors, Category, Conflict, Remediation, Violation};

/// Validator tunables
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub page_size: u64,
    pub strict_alignment: bool,
    pub max_instance_id: InstanceId,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            strict_alignment: false,
            max_instance_id: MAX_INSTANCE_ID,
        }
    }
}

impl From<&Config> for ValidatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            strict_alignment: config.strict_alignment,
            max_instance_id: config.max_instance_id,
        }
    }
}

/// Pure validator: same inputs, same findings
#[derive(Clone, Debug, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

/// Validate with the default configuration
pub fn validate(
    inventory: Arc<Inventory>,
    instances: Vec<Instance>,
) -> Result<ValidatedState, Vec<Violation>> {
    Validator::default().validate(inventory, instances)
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate `instances` against `inventory`.
    ///
    /// On success the warnings are kept on the returned state. On failure
    /// every finding, warnings included, is returned.
    pub fn validate(
        &self,
        inventory: Arc<Inventory>,
        instances: Vec<Instance>,
    ) -> Result<ValidatedState, Vec<Violation>> {
        let violations = self.check(&inventory, &instances);
        if has_errors(&violations) {
            debug!(
                instances = instances.len(),
                findings = violations.len(),
                "validation rejected allocation"
            );
            return Err(violations);
        }
        debug!(
            instances = instances.len(),
            warnings = violations.len(),
            "validation accepted allocation"
        );
        Ok(ValidatedState::new(inventory, instances, violations))
    }

    /// Run every pass and return all findings
    pub fn check(&self, inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
        let mut violations = inventory.check(self.config.page_size);

        violations.extend(self.check_ranges(inventory, instances));
        violations.extend(check_reservations(inventory, instances));
        violations.extend(self.check_exclusivity(inventory, instances));
        violations.extend(check_capacity(inventory, instances));
        violations.extend(check_policies(inventory, instances));

        trace!(findings = violations.len(), "validator passes complete");
        violations
    }

    // ========================================================================
    // Pass 2: range
    // ========================================================================

    fn check_ranges(&self, inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
        let mut violations = Vec::new();
        let pool = inventory.memory.region();
        let page_size = self.config.page_size;

        for (i, inst) in instances.iter().enumerate() {
            let name = inst.name.as_str();
            let others = others(instances, i);

            if inst.cpus.is_empty() {
                violations.push(Violation::error(
                    Category::EmptyCpus,
                    &[name],
                    Conflict::None,
                    "instance claims no CPUs",
                ));
            }

            let out: BTreeSet<CpuId> = inst
                .cpus
                .iter()
                .filter(|c| !inventory.cpus.exists(**c))
                .copied()
                .collect();
            if !out.is_empty() {
                violations.push(
                    Violation::error(
                        Category::CpuOutOfRange,
                        &[name],
                        Conflict::Cpus { cpus: out.clone() },
                        format!(
                            "CPUs {} do not exist (valid range 0-{})",
                            format_ids(&out),
                            inventory.cpus.total.saturating_sub(1)
                        ),
                    )
                    .with_remediation(cpu_remediation(inventory, &others, inst.cpus.len())),
                );
            }

            if inst.memory.is_empty() || inst.memory.iter().any(|r| r.bytes == 0) {
                violations.push(Violation::error(
                    Category::EmptyMemory,
                    &[name],
                    Conflict::None,
                    "instance claims no memory",
                ));
            }

            for region in inst.memory.iter().filter(|r| r.bytes > 0) {
                if !pool.contains(region) {
                    violations.push(
                        Violation::error(
                            Category::MemoryOutOfPool,
                            &[name],
                            Conflict::Region {
                                region: *region,
                                bound: pool,
                            },
                            format!("memory {} lies outside the pool {}", region, pool),
                        )
                        .with_remediation(
                            others
                                .free_base(pool, region.bytes, page_size)
                                .map(|base| Remediation::MemoryBase { base }),
                        ),
                    );
                }
                if !region.is_aligned(page_size) {
                    let message = format!(
                        "memory base {:#x} is not aligned to {:#x}",
                        region.base, page_size
                    );
                    let conflict = Conflict::Address { base: region.base };
                    let violation = if self.config.strict_alignment {
                        Violation::error(Category::MisalignedBase, &[name], conflict, message)
                    } else {
                        Violation::warning(Category::MisalignedBase, &[name], conflict, message)
                    };
                    violations.push(
                        violation.with_remediation(
                            others
                                .free_base(pool, region.bytes, page_size)
                                .map(|base| Remediation::MemoryBase { base }),
                        ),
                    );
                }
            }

            let dangling: Vec<_> = inst
                .devices
                .iter()
                .filter(|claim| inventory.device(&claim.device).is_none())
                .cloned()
                .collect();
            if !dangling.is_empty() {
                let names: Vec<String> = dangling.iter().map(|c| c.device.clone()).collect();
                violations.push(Violation::error(
                    Category::DanglingReference,
                    &[name],
                    Conflict::Claims { claims: dangling },
                    format!("unknown device(s) {}", names.join(", ")),
                ));
            }

            if let Some(nodes) = &inst.numa_nodes {
                let unknown: Vec<NodeId> = nodes
                    .iter()
                    .filter(|n| {
                        !inventory
                            .topology
                            .as_ref()
                            .map(|t| t.has_node(**n))
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect();
                if !unknown.is_empty() {
                    let message = if inventory.topology.is_none() {
                        "NUMA nodes requested but the inventory has no topology".to_string()
                    } else {
                        format!("unknown NUMA node(s) {:?}", unknown)
                    };
                    violations.push(Violation::error(
                        Category::DanglingReference,
                        &[name],
                        Conflict::Nodes { nodes: unknown },
                        message,
                    ));
                }
            }

            for claim in &inst.devices {
                let Some(device) = inventory.device(&claim.device) else {
                    continue;
                };
                if !device.accepts(claim.sub) {
                    let range = device
                        .resources
                        .id_range()
                        .map(|r| format!("{}-{}", r.start, r.end.saturating_sub(1)))
                        .unwrap_or_else(|| "whole device only".to_string());
                    violations.push(
                        Violation::error(
                            Category::SubresourceOutOfRange,
                            &[name],
                            Conflict::Claims {
                                claims: vec![claim.clone()],
                            },
                            format!(
                                "{} is not a valid {} sub-resource ({})",
                                claim,
                                device.resources.kind_name(),
                                range
                            ),
                        )
                        .with_remediation(
                            others
                                .free_subresource(inventory, &claim.device)
                                .map(|claim| Remediation::SubResource { claim }),
                        ),
                    );
                }
            }

            if inst.id == 0 || inst.id > self.config.max_instance_id {
                violations.push(
                    Violation::error(
                        Category::InvalidId,
                        &[name],
                        Conflict::Ids { ids: vec![inst.id] },
                        format!(
                            "instance id {} outside 1-{}",
                            inst.id, self.config.max_instance_id
                        ),
                    )
                    .with_remediation(
                        others
                            .free_id(self.config.max_instance_id)
                            .map(|id| Remediation::InstanceId { id }),
                    ),
                );
            }
        }

        violations
    }

    // ========================================================================
    // Pass 4: exclusivity
    // ========================================================================

    fn check_exclusivity(&self, inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
        let mut violations = Vec::new();
        let all = Occupancy::of(instances);
        let pool = inventory.memory.region();

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, inst) in instances.iter().enumerate() {
            if seen.insert(inst.name.as_str(), i).is_some() {
                violations.push(Violation::error(
                    Category::DuplicateName,
                    &[inst.name.as_str()],
                    Conflict::Name {
                        name: inst.name.clone(),
                    },
                    format!("instance name '{}' is used more than once", inst.name),
                ));
            }
        }

        for_each_pair(instances, |a, b, _| {
            if a.id == b.id {
                violations.push(
                    Violation::error(
                        Category::DuplicateId,
                        &[a.name.as_str(), b.name.as_str()],
                        Conflict::Ids { ids: vec![a.id] },
                        format!("instance id {} is used by both instances", a.id),
                    )
                    .with_remediation(
                        all.free_id(self.config.max_instance_id)
                            .map(|id| Remediation::InstanceId { id }),
                    ),
                );
            }
        });

        for_each_pair(instances, |a, b, j| {
            let shared: BTreeSet<CpuId> = a.cpus.intersection(&b.cpus).copied().collect();
            if !shared.is_empty() {
                let others = others(instances, j);
                violations.push(
                    Violation::error(
                        Category::CpuOverlap,
                        &[a.name.as_str(), b.name.as_str()],
                        Conflict::Cpus {
                            cpus: shared.clone(),
                        },
                        format!("CPUs {} are claimed by both instances", format_ids(&shared)),
                    )
                    .with_remediation(cpu_remediation(inventory, &others, b.cpus.len())),
                );
            }
        });

        for_each_pair(instances, |a, b, j| {
            for ra in &a.memory {
                for rb in &b.memory {
                    if let Some(overlap) = ra.intersection(rb) {
                        let others = others(instances, j);
                        violations.push(
                            Violation::error(
                                Category::MemoryOverlap,
                                &[a.name.as_str(), b.name.as_str()],
                                Conflict::Overlap { region: overlap },
                                format!("memory {} is claimed by both instances", overlap),
                            )
                            .with_remediation(
                                others
                                    .free_base(pool, rb.bytes, self.config.page_size)
                                    .map(|base| Remediation::MemoryBase { base }),
                            ),
                        );
                    }
                }
            }
        });

        for_each_pair(instances, |a, b, _| {
            let conflicting: Vec<_> = b
                .devices
                .iter()
                .filter(|cb| a.devices.iter().any(|ca| ca.conflicts_with(cb)))
                .cloned()
                .collect();
            if let Some(first) = conflicting.first() {
                let remediation = all
                    .free_subresource(inventory, &first.device)
                    .map(|claim| Remediation::SubResource { claim });
                let names: Vec<String> = conflicting.iter().map(|c| c.to_string()).collect();
                violations.push(
                    Violation::error(
                        Category::DeviceOverlap,
                        &[a.name.as_str(), b.name.as_str()],
                        Conflict::Claims {
                            claims: conflicting.clone(),
                        },
                        format!("{} claimed by both instances", names.join(", ")),
                    )
                    .with_remediation(remediation),
                );
            }
        });

        violations
    }
}

// ============================================================================
// Pass 3: reservation
// ============================================================================

fn check_reservations(inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (i, inst) in instances.iter().enumerate() {
        let name = inst.name.as_str();

        let reserved: BTreeSet<CpuId> = inst
            .cpus
            .iter()
            .filter(|c| inventory.cpus.exists(**c) && !inventory.cpus.is_available(**c))
            .copied()
            .collect();
        if !reserved.is_empty() {
            violations.push(
                Violation::error(
                    Category::CpuReserved,
                    &[name],
                    Conflict::Cpus {
                        cpus: reserved.clone(),
                    },
                    format!("CPUs {} are reserved for the host", format_ids(&reserved)),
                )
                .with_remediation(cpu_remediation(
                    inventory,
                    &others(instances, i),
                    inst.cpus.len(),
                )),
            );
        }

        for claim in &inst.devices {
            let Some(device) = inventory.device(&claim.device) else {
                continue;
            };
            if device.accepts(claim.sub) && !device.is_available(claim.sub) {
                violations.push(
                    Violation::error(
                        Category::SubresourceReserved,
                        &[name],
                        Conflict::Claims {
                            claims: vec![claim.clone()],
                        },
                        format!("{} is reserved for the host", claim),
                    )
                    .with_remediation(
                        Occupancy::of(instances)
                            .free_subresource(inventory, &claim.device)
                            .map(|claim| Remediation::SubResource { claim }),
                    ),
                );
            }
        }
    }

    violations
}

// ============================================================================
// Pass 5: capacity
// ============================================================================

fn check_capacity(inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
    let mut violations = Vec::new();

    let cpus: u64 = instances.iter().map(|i| i.cpus.len() as u64).sum();
    let available = inventory.cpus.available.len() as u64;
    if cpus > available {
        violations.push(Violation::error(
            Category::CpuExhausted,
            &[],
            Conflict::Capacity {
                requested: cpus,
                limit: available,
            },
            format!("instances claim {} CPUs, only {} are available", cpus, available),
        ));
    }

    let bytes = instances
        .iter()
        .fold(0u64, |acc, i| acc.saturating_add(i.memory_bytes()));
    let pool = inventory.memory.pool_bytes;
    if bytes > pool {
        violations.push(Violation::error(
            Category::MemoryExhausted,
            &[],
            Conflict::Capacity {
                requested: bytes,
                limit: pool,
            },
            format!(
                "instances claim {:#x} bytes of memory, the pool holds {:#x}",
                bytes, pool
            ),
        ));
    }

    violations
}

// ============================================================================
// Pass 6: policy
// ============================================================================

fn check_policies(inventory: &Inventory, instances: &[Instance]) -> Vec<Violation> {
    let mut violations = Vec::new();

    for inst in instances {
        let name = inst.name.as_str();

        let Some(topology) = &inventory.topology else {
            if inst.memory_policy == Some(MemoryPolicy::Bind) && inst.numa_nodes.is_none() {
                violations.push(bind_without_nodes(name));
            }
            continue;
        };

        let cpu_nodes: BTreeSet<NodeId> =
            inst.cpus.iter().filter_map(|c| topology.node_of(*c)).collect();
        let mem_nodes = memory_nodes(topology, inst);

        if let Some(requested) = &inst.numa_nodes {
            let remote: BTreeSet<CpuId> = inst
                .cpus
                .iter()
                .filter(|c| {
                    topology
                        .node_of(**c)
                        .map(|n| !requested.contains(&n))
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            if !remote.is_empty() {
                violations.push(Violation::warning(
                    Category::NumaRemote,
                    &[name],
                    Conflict::Cpus {
                        cpus: remote.clone(),
                    },
                    format!(
                        "CPUs {} are outside the requested NUMA nodes {:?}",
                        format_ids(&remote),
                        requested
                    ),
                ));
            }
            let remote_mem: Vec<NodeId> = mem_nodes.difference(requested).copied().collect();
            if !remote_mem.is_empty() {
                violations.push(Violation::warning(
                    Category::NumaRemote,
                    &[name],
                    Conflict::Nodes { nodes: remote_mem },
                    format!("memory lies outside the requested NUMA nodes {:?}", requested),
                ));
            }
        }

        let eligible_nodes = inst
            .numa_nodes
            .as_ref()
            .map_or(topology.nodes.len(), |nodes| nodes.len());
        match inst.cpu_affinity {
            Some(CpuAffinity::Compact) if cpu_nodes.len() > 1 => {
                violations.push(Violation::warning(
                    Category::AffinityMismatch,
                    &[name],
                    Conflict::Nodes {
                        nodes: cpu_nodes.iter().copied().collect(),
                    },
                    format!("compact affinity but CPUs span {} NUMA nodes", cpu_nodes.len()),
                ));
            }
            Some(CpuAffinity::Spread)
                if inst.cpus.len() > 1 && eligible_nodes > 1 && cpu_nodes.len() == 1 =>
            {
                violations.push(Violation::warning(
                    Category::AffinityMismatch,
                    &[name],
                    Conflict::Nodes {
                        nodes: cpu_nodes.iter().copied().collect(),
                    },
                    "spread affinity but all CPUs are on a single NUMA node",
                ));
            }
            Some(CpuAffinity::Local) if !mem_nodes.is_subset(&cpu_nodes) => {
                violations.push(Violation::warning(
                    Category::AffinityMismatch,
                    &[name],
                    Conflict::Nodes {
                        nodes: mem_nodes.difference(&cpu_nodes).copied().collect(),
                    },
                    "local affinity but memory is not on the CPUs' NUMA nodes",
                ));
            }
            _ => {}
        }

        match inst.memory_policy {
            Some(MemoryPolicy::Local) if !mem_nodes.is_subset(&cpu_nodes) => {
                violations.push(Violation::warning(
                    Category::PolicyMismatch,
                    &[name],
                    Conflict::Nodes {
                        nodes: mem_nodes.difference(&cpu_nodes).copied().collect(),
                    },
                    "local memory policy but memory is not on the CPUs' NUMA nodes",
                ));
            }
            Some(MemoryPolicy::Interleave) if topology.nodes.len() > 1 && mem_nodes.len() < 2 => {
                violations.push(Violation::warning(
                    Category::PolicyMismatch,
                    &[name],
                    Conflict::Nodes {
                        nodes: mem_nodes.iter().copied().collect(),
                    },
                    "interleave memory policy but memory is on a single NUMA node",
                ));
            }
            Some(MemoryPolicy::Bind) => match &inst.numa_nodes {
                None => violations.push(bind_without_nodes(name)),
                Some(bound) if !mem_nodes.is_subset(bound) => {
                    violations.push(Violation::warning(
                        Category::PolicyMismatch,
                        &[name],
                        Conflict::Nodes {
                            nodes: mem_nodes.difference(bound).copied().collect(),
                        },
                        format!("bind memory policy but memory is outside nodes {:?}", bound),
                    ));
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    violations
}

fn bind_without_nodes(name: &str) -> Violation {
    Violation::warning(
        Category::PolicyMismatch,
        &[name],
        Conflict::None,
        "bind memory policy without NUMA nodes",
    )
}

// ============================================================================
// Helpers
// ============================================================================

/// Nodes whose memory ranges hold any of the instance's memory
fn memory_nodes(topology: &Topology, inst: &Instance) -> BTreeSet<NodeId> {
    inst.memory
        .iter()
        .flat_map(|r| topology.nodes_for_region(r))
        .collect()
}

/// Claims of every instance except the one at `skip`
fn others(instances: &[Instance], skip: usize) -> Occupancy {
    Occupancy::of(
        instances
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .map(|(_, inst)| inst),
    )
}

fn cpu_remediation(inventory: &Inventory, others: &Occupancy, count: usize) -> Option<Remediation> {
    suggest_cpus(&others.free_cpus(inventory), count).map(|cpus| Remediation::Cpus { cpus })
}

/// Visit `(earlier, later, later_index)` for every pair
fn for_each_pair<'a>(instances: &'a [Instance], mut f: impl FnMut(&'a Instance, &'a Instance, usize)) {
    for (i, a) in instances.iter().enumerate() {
        for (j, b) in instances.iter().enumerate().skip(i + 1) {
            f(a, b, j);
        }
    }
}

/// Compact `4-7,10` rendering of an id set
pub fn format_ids(ids: &BTreeSet<u32>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = ids.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(next) = end.checked_add(1).filter(|n| iter.peek() == Some(n)) {
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::fixtures::{flat, numa, GB};
    use crate::types::{DeviceClaim, MemoryRegion};

    fn inst(name: &str, id: InstanceId, cpus: std::ops::Range<u32>, base: u64, bytes: u64) -> Instance {
        Instance::new(name, id, cpus, MemoryRegion::new(base, bytes))
    }

    fn categories(v: &[Violation]) -> Vec<Category> {
        v.iter().map(|v| v.category).collect()
    }

    // ========================================================================
    // Acceptance
    // ========================================================================

    #[test]
    fn test_empty_state_is_valid() {
        let state = validate(Arc::new(flat()), vec![]).unwrap();
        assert!(state.is_empty());
        assert!(state.warnings().is_empty());
    }

    #[test]
    fn test_disjoint_instances_are_valid() {
        let a = inst("a", 1, 4..8, 0x8000_0000, GB)
            .with_devices([DeviceClaim::vf("eth0", 1), DeviceClaim::whole("gpu0")]);
        let b = inst("b", 2, 8..12, 0x8000_0000 + GB, GB)
            .with_devices([DeviceClaim::vf("eth0", 2), DeviceClaim::namespace("nvme0", 2)]);
        let state = validate(Arc::new(flat()), vec![a, b]).unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.instance_by_id(2).map(|i| i.name.as_str()), Some("b"));
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let a = inst("a", 1, 4..5, 0x8000_0000, 0x1000);
        let b = inst("b", 2, 5..6, 0x8000_1000, 0x1000);
        assert!(validate(Arc::new(flat()), vec![a, b]).is_ok());
    }

    // ========================================================================
    // Range and reservation
    // ========================================================================

    #[test]
    fn test_range_errors() {
        let a = inst("a", 0, 30..34, 0x1000, 0x1000)
            .with_devices([DeviceClaim::vf("eth9", 1), DeviceClaim::vf("eth0", 8)]);
        let errs = validate(Arc::new(flat()), vec![a]).unwrap_err();
        let cats = categories(&errs);
        assert_eq!(
            cats,
            vec![
                Category::CpuOutOfRange,
                Category::MemoryOutOfPool,
                Category::DanglingReference,
                Category::SubresourceOutOfRange,
                Category::InvalidId,
            ]
        );
        assert_eq!(
            errs[0].conflict,
            Conflict::Cpus {
                cpus: [32, 33].into_iter().collect()
            }
        );
        assert_eq!(errs[1].remediation, Some(Remediation::MemoryBase { base: 0x8000_0000 }));
        assert_eq!(
            errs[3].remediation,
            Some(Remediation::SubResource {
                claim: DeviceClaim::vf("eth0", 1)
            })
        );
        assert_eq!(errs[4].remediation, Some(Remediation::InstanceId { id: 1 }));
    }

    #[test]
    fn test_empty_claims() {
        let a = Instance::new("a", 1, [], MemoryRegion::new(0x8000_0000, 0));
        let errs = validate(Arc::new(flat()), vec![a]).unwrap_err();
        assert_eq!(categories(&errs), vec![Category::EmptyCpus, Category::EmptyMemory]);
    }

    #[test]
    fn test_reserved_cpu_and_vf() {
        let a = inst("a", 1, 2..6, 0x8000_0000, GB)
            .with_devices([DeviceClaim::vf("eth0", 0), DeviceClaim::namespace("nvme0", 1)]);
        let errs = validate(Arc::new(flat()), vec![a]).unwrap_err();
        assert_eq!(
            categories(&errs),
            vec![
                Category::CpuReserved,
                Category::SubresourceReserved,
                Category::SubresourceReserved
            ]
        );
        assert_eq!(
            errs[0].remediation,
            Some(Remediation::Cpus {
                cpus: vec![4, 5, 6, 7]
            })
        );
    }

    #[test]
    fn test_misaligned_is_warning_unless_strict() {
        let a = inst("a", 1, 4..8, 0x8000_0800, GB);
        let state = validate(Arc::new(flat()), vec![a.clone()]).unwrap();
        assert_eq!(categories(state.warnings()), vec![Category::MisalignedBase]);

        let strict = Validator::new(ValidatorConfig {
            strict_alignment: true,
            ..ValidatorConfig::default()
        });
        let errs = strict.validate(Arc::new(flat()), vec![a]).unwrap_err();
        assert_eq!(errs[0].category, Category::MisalignedBase);
        assert!(errs[0].is_error());
    }

    #[test]
    fn test_numa_nodes_without_topology() {
        let a = inst("a", 1, 4..8, 0x8000_0000, GB).with_numa_nodes([0]);
        let errs = validate(Arc::new(flat()), vec![a]).unwrap_err();
        assert_eq!(categories(&errs), vec![Category::DanglingReference]);
    }

    // ========================================================================
    // Exclusivity
    // ========================================================================

    #[test]
    fn test_cpu_overlap_names_pair_in_input_order() {
        let a = inst("web", 1, 4..8, 0x8000_0000, GB);
        let b = inst("db", 2, 6..10, 0x8000_0000 + GB, GB);
        let errs = validate(Arc::new(flat()), vec![a, b]).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].category, Category::CpuOverlap);
        assert_eq!(errs[0].subjects, vec!["web".to_string(), "db".to_string()]);
        assert_eq!(
            errs[0].conflict,
            Conflict::Cpus {
                cpus: [6, 7].into_iter().collect()
            }
        );
        assert_eq!(
            errs[0].remediation,
            Some(Remediation::Cpus {
                cpus: vec![8, 9, 10, 11]
            })
        );
    }

    #[test]
    fn test_memory_and_device_overlap() {
        let a = inst("a", 1, 4..8, 0x8000_0000, 2 * GB).with_devices([DeviceClaim::whole("gpu0")]);
        let b = inst("b", 2, 8..12, 0x8000_0000 + GB, GB).with_devices([DeviceClaim::whole("gpu0")]);
        let errs = validate(Arc::new(flat()), vec![a, b]).unwrap_err();
        assert_eq!(
            categories(&errs),
            vec![Category::MemoryOverlap, Category::DeviceOverlap]
        );
        assert_eq!(
            errs[0].conflict,
            Conflict::Overlap {
                region: MemoryRegion::new(0x8000_0000 + GB, GB)
            }
        );
        assert_eq!(
            errs[0].remediation,
            Some(Remediation::MemoryBase {
                base: 0x8000_0000 + 2 * GB
            })
        );
        assert_eq!(errs[1].remediation, None);
    }

    #[test]
    fn test_duplicate_name_and_id() {
        let a = inst("a", 3, 4..5, 0x8000_0000, GB);
        let b = inst("a", 3, 5..6, 0x8000_0000 + GB, GB);
        let errs = validate(Arc::new(flat()), vec![a, b]).unwrap_err();
        assert_eq!(
            categories(&errs),
            vec![Category::DuplicateName, Category::DuplicateId]
        );
        assert_eq!(errs[1].remediation, Some(Remediation::InstanceId { id: 1 }));
    }

    // ========================================================================
    // Capacity and policy
    // ========================================================================

    #[test]
    fn test_memory_exhausted() {
        let mut inv = flat();
        inv.memory.pool_bytes = GB;
        inv.memory.total_bytes = 3 * GB;
        let a = Instance::new("a", 1, 4..8, MemoryRegion::new(0x8000_0000, GB))
            .with_regions([
                MemoryRegion::new(0x8000_0000, GB),
                MemoryRegion::new(0x8000_0000, GB),
            ]);
        let errs = validate(Arc::new(inv), vec![a]).unwrap_err();
        assert!(categories(&errs).contains(&Category::MemoryExhausted));
    }

    #[test]
    fn test_policy_warnings() {
        let a = inst("a", 1, 14..18, 0x8000_0000, GB)
            .with_cpu_affinity(CpuAffinity::Compact)
            .with_numa_nodes([0]);
        let b = inst("b", 2, 20..24, 0x8000_0000 + GB, GB)
            .with_memory_policy(MemoryPolicy::Local);
        let c = inst("c", 3, 24..26, 0x8000_0000 + 2 * GB, GB)
            .with_memory_policy(MemoryPolicy::Bind);
        let state = validate(Arc::new(numa()), vec![a, b, c]).unwrap();
        assert_eq!(
            categories(state.warnings()),
            vec![
                Category::NumaRemote,
                Category::AffinityMismatch,
                Category::PolicyMismatch,
                Category::PolicyMismatch,
            ]
        );
    }

    #[test]
    fn test_spread_on_single_node_warns() {
        let a = inst("a", 1, 4..8, 0x8000_0000, GB).with_cpu_affinity(CpuAffinity::Spread);
        let state = validate(Arc::new(numa()), vec![a]).unwrap();
        assert_eq!(categories(state.warnings()), vec![Category::AffinityMismatch]);
    }

    #[test]
    fn test_spread_within_one_requested_node_is_quiet() {
        let a = inst("a", 1, 4..8, 0x8000_0000, GB)
            .with_cpu_affinity(CpuAffinity::Spread)
            .with_numa_nodes([0]);
        let state = validate(Arc::new(numa()), vec![a]).unwrap();
        assert!(state.warnings().is_empty());
    }

    #[test]
    fn test_idempotent() {
        let a = inst("a", 1, 4..8, 0x8000_0800, GB);
        let inv = Arc::new(flat());
        let first = validate(inv.clone(), vec![a.clone()]).unwrap();
        let second = validate(inv, first.to_instances()).unwrap();
        assert!(first.same_as(&second));
        assert_eq!(first.warnings(), second.warnings());
    }

    #[test]
    fn test_format_ids() {
        let ids: BTreeSet<u32> = [1, 2, 3, 5, 7, 8].into_iter().collect();
        assert_eq!(format_ids(&ids), "1-3,5,7-8");

        let top: BTreeSet<u32> = [u32::MAX - 1, u32::MAX].into_iter().collect();
        assert_eq!(format_ids(&top), format!("{}-{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn test_highest_cpu_id_is_out_of_range() {
        let a = Instance::new("a", 1, [u32::MAX], MemoryRegion::new(0x8000_0000, GB));
        let v = validate(Arc::new(flat()), vec![a]).unwrap_err();
        assert_eq!(categories(&v), vec![Category::CpuOutOfRange]);
        assert!(v[0].message.contains(&u32::MAX.to_string()));
    }
}
