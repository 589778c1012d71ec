//! Instance nodes
//!
//! ```text
//! web {
//!     instance-name = "web";
//!     id = <1>;
//!     resources {
//!         cpus = <4 5 6 7>;
//!         memory-base = /bits/ 64 <0x80000000>;
//!         memory-bytes = /bits/ 64 <0x80000000>;
//!         devices = <&web_eth0_vf1>;
//!         web_eth0_vf1: eth0-vf@1 { device = "eth0"; vf = <1>; };
//!         numa-nodes = <0>;
//!         cpu-affinity = "compact";
//!         memory-policy = "local";
//!     };
//! };
//! ```
//!
//! `memory-regions` (base/size pairs) appears only when an instance holds
//! other than exactly one region. Device claims are child nodes referenced
//! from `devices`, so every claim resolves inside the document.

use std::collections::BTreeSet;

use kerf_core::{
    CpuAffinity, CpuId, DeviceClaim, Instance, MemoryPolicy, MemoryRegion, NodeId, SubResource,
};

use super::{
    node_name, opt_ids, opt_parsed, opt_string, read_ids, read_string, read_u32, read_u64,
    read_u64_list, require_child, unique_child_name, LabelAllocator,
};
use crate::error::DecodeError;
use crate::resolve::Symbols;
use crate::tree::{NodeIndex, PropValue, RawTree};

// ============================================================================
// Fields
// ============================================================================

pub(crate) fn write_cpus(tree: &mut RawTree, node: NodeIndex, cpus: &BTreeSet<CpuId>) {
    tree.set_prop(node, "cpus", PropValue::u32_list(cpus.iter().copied()));
}

pub(crate) fn write_memory(tree: &mut RawTree, node: NodeIndex, regions: &[MemoryRegion]) {
    let base = regions.first().map_or(0, |r| r.base);
    let bytes = regions.iter().fold(0u64, |sum, r| sum.saturating_add(r.bytes));
    tree.set_prop(node, "memory-base", PropValue::u64(base));
    tree.set_prop(node, "memory-bytes", PropValue::u64(bytes));
    if regions.len() != 1 {
        tree.set_prop(
            node,
            "memory-regions",
            PropValue::u64_list(regions.iter().flat_map(|r| [r.base, r.bytes])),
        );
    }
}

pub(crate) fn read_memory(
    tree: &RawTree,
    node: NodeIndex,
) -> Result<Vec<MemoryRegion>, DecodeError> {
    if tree.prop(node, "memory-regions").is_some() {
        let cells = read_u64_list(tree, node, "memory-regions")?;
        if cells.len() % 2 != 0 {
            return Err(DecodeError::bad_property(
                tree.path(node),
                "memory-regions",
                "is not a list of base/size pairs",
            ));
        }
        return Ok(cells
            .chunks(2)
            .map(|pair| MemoryRegion::new(pair[0], pair[1]))
            .collect());
    }
    Ok(vec![MemoryRegion::new(
        read_u64(tree, node, "memory-base")?,
        read_u64(tree, node, "memory-bytes")?,
    )])
}

/// A claim node under `parent`, without a label
pub(crate) fn write_claim_node(
    tree: &mut RawTree,
    parent: NodeIndex,
    claim: &DeviceClaim,
) -> NodeIndex {
    let base = node_name(&claim.device);
    let name = match claim.sub {
        SubResource::Whole => base,
        SubResource::Vf(n) => format!("{}-vf@{}", base, n),
        SubResource::Namespace(n) => format!("{}-ns@{}", base, n),
    };
    let name = unique_child_name(tree, parent, name);
    let idx = tree.add_child(parent, name);
    tree.set_prop(idx, "device", PropValue::string(claim.device.clone()));
    match claim.sub {
        SubResource::Whole => tree.set_prop(idx, "whole", PropValue::Empty),
        SubResource::Vf(n) => tree.set_prop(idx, "vf", PropValue::u32(n)),
        SubResource::Namespace(n) => tree.set_prop(idx, "namespace", PropValue::u32(n)),
    }
    idx
}

pub(crate) fn read_claim(tree: &RawTree, idx: NodeIndex) -> Result<DeviceClaim, DecodeError> {
    let device = read_string(tree, idx, "device")?;
    let sub = if tree.prop(idx, "vf").is_some() {
        SubResource::Vf(read_u32(tree, idx, "vf")?)
    } else if tree.prop(idx, "namespace").is_some() {
        SubResource::Namespace(read_u32(tree, idx, "namespace")?)
    } else if tree.prop(idx, "whole").is_some() {
        SubResource::Whole
    } else {
        return Err(DecodeError::bad_property(
            tree.path(idx),
            "device",
            "has no vf, namespace or whole selector",
        ));
    };
    Ok(DeviceClaim { device, sub })
}

/// Claim nodes plus the `devices` reference list
pub(crate) fn write_devices(
    tree: &mut RawTree,
    node: NodeIndex,
    owner: &str,
    claims: &BTreeSet<DeviceClaim>,
    labels: &mut LabelAllocator,
) {
    if claims.is_empty() {
        return;
    }
    let mut refs = Vec::with_capacity(claims.len());
    for claim in claims {
        let idx = write_claim_node(tree, node, claim);
        let label = labels.fresh(&format!("{}_{}", owner, claim));
        tree.set_label(idx, label.clone());
        refs.push(label);
    }
    tree.set_prop(node, "devices", PropValue::refs(refs));
}

pub(crate) fn read_devices(
    tree: &RawTree,
    symbols: &Symbols,
    node: NodeIndex,
) -> Result<BTreeSet<DeviceClaim>, DecodeError> {
    let Some(value) = tree.prop(node, "devices") else {
        return Ok(BTreeSet::new());
    };
    let labels = value.as_refs().ok_or_else(|| {
        DecodeError::bad_property(tree.path(node), "devices", "is not a reference list")
    })?;

    labels
        .into_iter()
        .map(|label| {
            let target = symbols
                .get(label)
                .ok_or_else(|| DecodeError::DanglingReference {
                    label: label.to_string(),
                    path: format!("{}:devices", tree.path(node)),
                })?;
            read_claim(tree, target)
        })
        .collect()
}

pub(crate) fn write_numa_nodes(
    tree: &mut RawTree,
    node: NodeIndex,
    nodes: Option<&BTreeSet<NodeId>>,
) {
    if let Some(nodes) = nodes {
        tree.set_prop(node, "numa-nodes", PropValue::u32_list(nodes.iter().copied()));
    }
}

pub(crate) fn read_numa_nodes(
    tree: &RawTree,
    node: NodeIndex,
) -> Result<Option<BTreeSet<NodeId>>, DecodeError> {
    opt_ids(tree, node, "numa-nodes")
}

pub(crate) fn write_cpu_affinity(tree: &mut RawTree, node: NodeIndex, value: Option<CpuAffinity>) {
    if let Some(affinity) = value {
        tree.set_prop(node, "cpu-affinity", PropValue::string(affinity.as_str()));
    }
}

pub(crate) fn read_cpu_affinity(
    tree: &RawTree,
    node: NodeIndex,
) -> Result<Option<CpuAffinity>, DecodeError> {
    opt_parsed(tree, node, "cpu-affinity")
}

pub(crate) fn write_memory_policy(
    tree: &mut RawTree,
    node: NodeIndex,
    value: Option<MemoryPolicy>,
) {
    if let Some(policy) = value {
        tree.set_prop(node, "memory-policy", PropValue::string(policy.as_str()));
    }
}

pub(crate) fn read_memory_policy(
    tree: &RawTree,
    node: NodeIndex,
) -> Result<Option<MemoryPolicy>, DecodeError> {
    opt_parsed(tree, node, "memory-policy")
}

// ============================================================================
// Whole instances
// ============================================================================

/// Instance properties and `resources` written into an existing node
pub(crate) fn write_instance_into(
    tree: &mut RawTree,
    idx: NodeIndex,
    instance: &Instance,
    labels: &mut LabelAllocator,
) {
    tree.set_prop(idx, "instance-name", PropValue::string(instance.name.clone()));
    tree.set_prop(idx, "id", PropValue::u32(instance.id));

    let res = tree.add_child(idx, "resources");
    write_cpus(tree, res, &instance.cpus);
    write_memory(tree, res, &instance.memory);
    write_devices(tree, res, &instance.name, &instance.devices, labels);
    write_numa_nodes(tree, res, instance.numa_nodes.as_ref());
    write_cpu_affinity(tree, res, instance.cpu_affinity);
    write_memory_policy(tree, res, instance.memory_policy);
}

/// Instance as a new child of `parent`, named after the instance
pub(crate) fn write_instance(
    tree: &mut RawTree,
    parent: NodeIndex,
    instance: &Instance,
    labels: &mut LabelAllocator,
) -> NodeIndex {
    let name = unique_child_name(tree, parent, node_name(&instance.name));
    let idx = tree.add_child(parent, name);
    write_instance_into(tree, idx, instance, labels);
    idx
}

pub(crate) fn read_instance(
    tree: &RawTree,
    symbols: &Symbols,
    idx: NodeIndex,
) -> Result<Instance, DecodeError> {
    let name = match opt_string(tree, idx, "instance-name")? {
        Some(name) => name,
        None => tree.node(idx).name.clone(),
    };
    let res = require_child(tree, idx, "resources")?;

    Ok(Instance {
        name,
        id: read_u32(tree, idx, "id")?,
        cpus: read_ids(tree, res, "cpus")?,
        memory: read_memory(tree, res)?,
        devices: read_devices(tree, symbols, res)?,
        numa_nodes: read_numa_nodes(tree, res)?,
        cpu_affinity: read_cpu_affinity(tree, res)?,
        memory_policy: read_memory_policy(tree, res)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::resolve;
    use crate::{dtb, dts};

    fn web() -> Instance {
        Instance::new("web", 1, 4..8, MemoryRegion::new(0x8000_0000, 1 << 30))
            .with_devices([
                DeviceClaim::vf("eth0", 1),
                DeviceClaim::namespace("nvme0", 2),
                DeviceClaim::whole("gpu0"),
            ])
            .with_numa_nodes([0])
            .with_cpu_affinity(CpuAffinity::Compact)
            .with_memory_policy(MemoryPolicy::Local)
    }

    fn roundtrip(instance: &Instance) -> Instance {
        let mut tree = RawTree::new();
        let mut labels = LabelAllocator::default();
        let idx = write_instance(&mut tree, RawTree::ROOT, instance, &mut labels);
        let symbols = resolve(&tree).unwrap();
        read_instance(&tree, &symbols, idx).unwrap()
    }

    #[test]
    fn test_instance_roundtrip() {
        let inst = web();
        assert_eq!(roundtrip(&inst), inst);
    }

    #[test]
    fn test_multi_region_instance() {
        let inst = Instance::new("db", 2, [8], MemoryRegion::new(0x1000, 0x1000))
            .with_regions([MemoryRegion::new(0x1000, 0x1000), MemoryRegion::new(0x8000, 0x2000)]);
        assert_eq!(roundtrip(&inst), inst);
    }

    #[test]
    fn test_claim_labels_in_text() {
        let mut tree = RawTree::new();
        let mut labels = LabelAllocator::default();
        write_instance(&mut tree, RawTree::ROOT, &web(), &mut labels);
        let text = dts::write(&tree);
        assert!(text.contains("web_eth0_vf1: eth0-vf@1 {"));
        assert!(text.contains("devices = <&web_eth0_vf1 &web_gpu0 &web_nvme0_ns2>;"));

        let parsed = dts::parse(&text).unwrap();
        let symbols = resolve(&parsed).unwrap();
        let idx = parsed.find("/web").unwrap();
        assert_eq!(read_instance(&parsed, &symbols, idx).unwrap(), web());

        let decoded = dtb::decode(&dtb::encode(&tree)).unwrap();
        let symbols = resolve(&decoded).unwrap();
        let idx = decoded.find("/web").unwrap();
        assert_eq!(read_instance(&decoded, &symbols, idx).unwrap(), web());
    }

    #[test]
    fn test_unknown_policy_name() {
        let mut tree = RawTree::new();
        let mut labels = LabelAllocator::default();
        let idx = write_instance(&mut tree, RawTree::ROOT, &web(), &mut labels);
        let res = tree.child(idx, "resources").unwrap();
        tree.set_prop(res, "cpu-affinity", PropValue::string("tight"));
        let symbols = resolve(&tree).unwrap();
        assert!(matches!(
            read_instance(&tree, &symbols, idx),
            Err(DecodeError::BadProperty { .. })
        ));
    }
}
