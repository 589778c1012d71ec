//! Baseline documents
//!
//! ```text
//! / {
//!     compatible = "linux,multikernel-host";
//!     resources {
//!         cpus     { total; host-reserved; available; };
//!         memory   { total-bytes; host-reserved-bytes;
//!                    memory-pool-base; memory-pool-bytes; };
//!         topology { distance-matrix;
//!                    cpu-map { cpus; sockets; cores; numa-nodes; };
//!                    node@N { memory-base; memory-size; cpus; }; };
//!         devices  { eth0 { compatible; pci-id; sriov-vfs;
//!                           host-reserved-vf; available-vfs; };
//!                    nvme0 { compatible; namespaces;
//!                            host-reserved-ns; available-ns; };
//!                    gpu0 { compatible; }; };
//!     };
//! };
//! ```
//!
//! A baseline never contains `/instances`; instances only arrive through
//! overlays.

use std::collections::{BTreeMap, BTreeSet};

use kerf_core::{
    CpuPlacement, CpuSet, Device, DeviceResources, Inventory, MemoryPool, MemoryRegion, NumaNode,
    SubResourceSpace, Topology,
};

use super::{
    node_name, opt_ids, opt_string, read_ids, read_list, read_string, read_u32, read_u64,
    require_child, unique_child_name, unit_id,
};
use crate::error::DecodeError;
use crate::tree::{NodeIndex, PropValue, RawTree};

pub const HOST_COMPATIBLE: &str = "linux,multikernel-host";

// ============================================================================
// Writing
// ============================================================================

/// Baseline document for an inventory
pub fn inventory_to_tree(inventory: &Inventory) -> RawTree {
    let mut tree = RawTree::new();
    tree.set_prop(RawTree::ROOT, "compatible", PropValue::string(HOST_COMPATIBLE));
    write_resources(&mut tree, inventory);
    tree
}

pub(crate) fn write_resources(tree: &mut RawTree, inventory: &Inventory) -> NodeIndex {
    let res = tree.add_child(RawTree::ROOT, "resources");

    let cpus = tree.add_child(res, "cpus");
    tree.set_prop(cpus, "total", PropValue::u32(inventory.cpus.total));
    tree.set_prop(
        cpus,
        "host-reserved",
        PropValue::u32_list(inventory.cpus.host_reserved.iter().copied()),
    );
    tree.set_prop(
        cpus,
        "available",
        PropValue::u32_list(inventory.cpus.available.iter().copied()),
    );

    let mem = tree.add_child(res, "memory");
    let pool = &inventory.memory;
    tree.set_prop(mem, "total-bytes", PropValue::u64(pool.total_bytes));
    tree.set_prop(mem, "host-reserved-bytes", PropValue::u64(pool.host_reserved_bytes));
    tree.set_prop(mem, "memory-pool-base", PropValue::u64(pool.pool_base));
    tree.set_prop(mem, "memory-pool-bytes", PropValue::u64(pool.pool_bytes));

    if let Some(topology) = &inventory.topology {
        write_topology(tree, res, topology);
    }

    let devices = tree.add_child(res, "devices");
    for (name, device) in &inventory.devices {
        write_device(tree, devices, name, device);
    }
    res
}

fn write_topology(tree: &mut RawTree, res: NodeIndex, topology: &Topology) {
    let topo = tree.add_child(res, "topology");
    tree.set_prop(
        topo,
        "distance-matrix",
        PropValue::u32_list(topology.distances.iter().copied()),
    );

    let map = tree.add_child(topo, "cpu-map");
    let placements = &topology.cpus;
    tree.set_prop(map, "cpus", PropValue::u32_list(placements.keys().copied()));
    tree.set_prop(
        map,
        "sockets",
        PropValue::u32_list(placements.values().map(|p| p.socket)),
    );
    tree.set_prop(
        map,
        "cores",
        PropValue::u32_list(placements.values().map(|p| p.core)),
    );
    tree.set_prop(
        map,
        "numa-nodes",
        PropValue::u32_list(placements.values().map(|p| p.numa_node)),
    );

    for (id, node) in &topology.nodes {
        let idx = tree.add_child(topo, format!("node@{}", id));
        tree.set_prop(idx, "memory-base", PropValue::u64(node.memory.base));
        tree.set_prop(idx, "memory-size", PropValue::u64(node.memory.bytes));
        tree.set_prop(idx, "cpus", PropValue::u32_list(node.cpus.iter().copied()));
    }
}

fn write_device(tree: &mut RawTree, devices: NodeIndex, name: &str, device: &Device) {
    let child = unique_child_name(tree, devices, node_name(name));
    let renamed = child != name;
    let idx = tree.add_child(devices, child);
    if renamed {
        tree.set_prop(idx, "device-name", PropValue::string(name));
    }
    tree.set_prop(idx, "compatible", PropValue::string(device.compatible.clone()));
    if let Some(pci) = &device.pci_id {
        tree.set_prop(idx, "pci-id", PropValue::string(pci.clone()));
    }

    let (count, reserved, available, space) = match &device.resources {
        DeviceResources::Plain => return,
        DeviceResources::Sriov(space) => ("sriov-vfs", "host-reserved-vf", "available-vfs", space),
        DeviceResources::Storage(space) => {
            ("namespaces", "host-reserved-ns", "available-ns", space)
        }
    };
    tree.set_prop(idx, count, PropValue::u32(space.total));
    tree.set_prop(
        idx,
        reserved,
        PropValue::u32_list(space.host_reserved.iter().copied()),
    );
    tree.set_prop(
        idx,
        available,
        PropValue::u32_list(space.available.iter().copied()),
    );
}

// ============================================================================
// Reading
// ============================================================================

/// Inventory of a baseline document
pub fn inventory_from_tree(tree: &RawTree) -> Result<Inventory, DecodeError> {
    if tree.child(RawTree::ROOT, "instances").is_some() {
        return Err(DecodeError::InstancesInBaseline);
    }
    read_resources(tree)
}

/// The `/resources` subtree of any full document
pub(crate) fn read_resources(tree: &RawTree) -> Result<Inventory, DecodeError> {
    let res = require_child(tree, RawTree::ROOT, "resources")?;

    let cpus_node = require_child(tree, res, "cpus")?;
    let total = read_u32(tree, cpus_node, "total")?;
    let host_reserved = opt_ids(tree, cpus_node, "host-reserved")?.unwrap_or_default();
    let cpus = match opt_ids(tree, cpus_node, "available")? {
        Some(available) => CpuSet {
            total,
            host_reserved,
            available,
        },
        None => CpuSet::new(total, host_reserved),
    };

    let mem = require_child(tree, res, "memory")?;
    let memory = MemoryPool {
        total_bytes: read_u64(tree, mem, "total-bytes")?,
        host_reserved_bytes: read_u64(tree, mem, "host-reserved-bytes")?,
        pool_base: read_u64(tree, mem, "memory-pool-base")?,
        pool_bytes: read_u64(tree, mem, "memory-pool-bytes")?,
    };

    let topology = match tree.child(res, "topology") {
        Some(topo) => Some(read_topology(tree, topo)?),
        None => None,
    };

    let mut devices = BTreeMap::new();
    if let Some(devs) = tree.child(res, "devices") {
        for idx in tree.children(devs) {
            let name = match opt_string(tree, idx, "device-name")? {
                Some(name) => name,
                None => tree.node(idx).name.clone(),
            };
            if devices.insert(name, read_device(tree, idx)?).is_some() {
                return Err(DecodeError::bad_property(
                    tree.path(idx),
                    "device-name",
                    "repeats a device name",
                ));
            }
        }
    }

    Ok(Inventory {
        cpus,
        memory,
        topology,
        devices,
    })
}

fn read_topology(tree: &RawTree, topo: NodeIndex) -> Result<Topology, DecodeError> {
    let distances = match tree.prop(topo, "distance-matrix") {
        Some(_) => read_list(tree, topo, "distance-matrix")?,
        None => Vec::new(),
    };

    let mut cpus = BTreeMap::new();
    if let Some(map) = tree.child(topo, "cpu-map") {
        let ids = read_list(tree, map, "cpus")?;
        let sockets = read_list(tree, map, "sockets")?;
        let cores = read_list(tree, map, "cores")?;
        let nodes = read_list(tree, map, "numa-nodes")?;
        if sockets.len() != ids.len() || cores.len() != ids.len() || nodes.len() != ids.len() {
            return Err(DecodeError::bad_property(
                tree.path(map),
                "cpus",
                "does not match the length of sockets, cores and numa-nodes",
            ));
        }
        for (i, cpu) in ids.into_iter().enumerate() {
            cpus.insert(
                cpu,
                CpuPlacement {
                    socket: sockets[i],
                    core: cores[i],
                    numa_node: nodes[i],
                },
            );
        }
    }

    let mut nodes = BTreeMap::new();
    for idx in tree.children(topo) {
        if tree.node(idx).base_name() != "node" {
            continue;
        }
        let id = unit_id(tree, idx)?;
        let node = NumaNode {
            memory: MemoryRegion::new(
                read_u64(tree, idx, "memory-base")?,
                read_u64(tree, idx, "memory-size")?,
            ),
            cpus: read_ids(tree, idx, "cpus")?,
        };
        if nodes.insert(id, node).is_some() {
            return Err(DecodeError::bad_property(
                tree.path(idx),
                "@unit",
                "repeats a NUMA node id",
            ));
        }
    }

    Ok(Topology {
        cpus,
        nodes,
        distances,
    })
}

fn read_space(
    tree: &RawTree,
    idx: NodeIndex,
    count: &str,
    reserved: &str,
    available: &str,
    ids: impl Fn(u32) -> BTreeSet<u32>,
) -> Result<SubResourceSpace, DecodeError> {
    let total = read_u32(tree, idx, count)?;
    let host_reserved = opt_ids(tree, idx, reserved)?.unwrap_or_default();
    let available = match opt_ids(tree, idx, available)? {
        Some(available) => available,
        None => ids(total).difference(&host_reserved).copied().collect(),
    };
    Ok(SubResourceSpace {
        total,
        host_reserved,
        available,
    })
}

fn read_device(tree: &RawTree, idx: NodeIndex) -> Result<Device, DecodeError> {
    let sriov = tree.prop(idx, "sriov-vfs").is_some();
    let storage = tree.prop(idx, "namespaces").is_some();
    let resources = match (sriov, storage) {
        (true, true) => {
            return Err(DecodeError::bad_property(
                tree.path(idx),
                "namespaces",
                "cannot be combined with sriov-vfs",
            ))
        }
        (true, false) => DeviceResources::Sriov(read_space(
            tree,
            idx,
            "sriov-vfs",
            "host-reserved-vf",
            "available-vfs",
            |total| (0..total).collect(),
        )?),
        (false, true) => DeviceResources::Storage(read_space(
            tree,
            idx,
            "namespaces",
            "host-reserved-ns",
            "available-ns",
            |total| (1..=total).collect(),
        )?),
        (false, false) => DeviceResources::Plain,
    };

    Ok(Device {
        compatible: read_string(tree, idx, "compatible")?,
        pci_id: opt_string(tree, idx, "pci-id")?,
        resources,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const GB: u64 = 1 << 30;

    /// 32 CPUs on two nodes, a 14 GiB pool, a NIC, an NVMe and a GPU
    pub fn inventory() -> Inventory {
        let mut placements = BTreeMap::new();
        for cpu in 0..32 {
            placements.insert(
                cpu,
                CpuPlacement {
                    socket: cpu / 16,
                    core: cpu / 2,
                    numa_node: cpu / 16,
                },
            );
        }
        let mut nodes = BTreeMap::new();
        nodes.insert(
            0,
            NumaNode {
                memory: MemoryRegion::new(0, 8 * GB),
                cpus: (0..16).collect(),
            },
        );
        nodes.insert(
            1,
            NumaNode {
                memory: MemoryRegion::new(8 * GB, 8 * GB),
                cpus: (16..32).collect(),
            },
        );

        let mut devices = BTreeMap::new();
        devices.insert(
            "eth0".to_string(),
            Device {
                compatible: "intel,i40e".to_string(),
                pci_id: Some("0000:01:00.0".to_string()),
                resources: DeviceResources::Sriov(SubResourceSpace::new(8, [0], 1..8)),
            },
        );
        devices.insert(
            "nvme0".to_string(),
            Device {
                compatible: "nvme".to_string(),
                pci_id: None,
                resources: DeviceResources::Storage(SubResourceSpace::new(4, [1], 2..=4)),
            },
        );
        devices.insert(
            "gpu0".to_string(),
            Device {
                compatible: "nvidia,gpu".to_string(),
                pci_id: None,
                resources: DeviceResources::Plain,
            },
        );

        Inventory {
            cpus: CpuSet::new(32, 0..4),
            memory: MemoryPool {
                total_bytes: 16 * GB,
                host_reserved_bytes: 2 * GB,
                pool_base: 2 * GB,
                pool_bytes: 14 * GB,
            },
            topology: Some(Topology {
                cpus: placements,
                nodes,
                distances: vec![0, 20, 20, 0],
            }),
            devices,
        }
    }
}
