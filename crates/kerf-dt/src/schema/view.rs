//! Per-instance views
//!
//! The tree a loader receives for one instance. It holds that instance's
//! assignment and nothing about its siblings or the rest of the host.
//!
//! ```text
//! / {
//!     compatible = "linux,multikernel-instance";
//!
//!     chosen {
//!         linux,multikernel-instance-id = <1>;
//!         linux,multikernel-instance-name = "web";
//!         linux,multikernel-cpus = <4 5 6 7>;
//!         linux,multikernel-memory-base = /bits/ 64 <0x80000000>;
//!         linux,multikernel-memory-size = /bits/ 64 <0x40000000>;
//!     };
//!
//!     devices {
//!         eth0-vf@1 { device = "eth0"; vf = <1>; compatible = "intel,i40e"; };
//!     };
//! };
//! ```

use std::collections::BTreeSet;

use kerf_core::{CpuId, DeviceClaim, Instance, InstanceId, Inventory, MemoryRegion, ValidatedState};

use super::instance::{read_claim, write_claim_node};
use super::{read_ids, read_string, read_u32, read_u64, read_u64_list, require_child};
use crate::error::DecodeError;
use crate::tree::{PropValue, RawTree};

pub const INSTANCE_COMPATIBLE: &str = "linux,multikernel-instance";

const ID: &str = "linux,multikernel-instance-id";
const NAME: &str = "linux,multikernel-instance-name";
const CPUS: &str = "linux,multikernel-cpus";
const MEMORY_BASE: &str = "linux,multikernel-memory-base";
const MEMORY_SIZE: &str = "linux,multikernel-memory-size";
const MEMORY_REGIONS: &str = "linux,multikernel-memory-regions";

/// What an instance view carries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceView {
    pub name: String,
    pub id: InstanceId,
    pub cpus: BTreeSet<CpuId>,
    pub memory: Vec<MemoryRegion>,
    pub devices: BTreeSet<DeviceClaim>,
}

impl From<&Instance> for InstanceView {
    fn from(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            id: instance.id,
            cpus: instance.cpus.clone(),
            memory: instance.memory.clone(),
            devices: instance.devices.clone(),
        }
    }
}

pub fn instance_view(inventory: &Inventory, instance: &Instance) -> RawTree {
    let mut tree = RawTree::new();
    let root = tree.root();
    tree.set_prop(root, "compatible", PropValue::string(INSTANCE_COMPATIBLE));

    let chosen = tree.add_child(root, "chosen");
    tree.set_prop(chosen, ID, PropValue::u32(instance.id));
    tree.set_prop(chosen, NAME, PropValue::string(instance.name.clone()));
    tree.set_prop(chosen, CPUS, PropValue::u32_list(instance.cpus.iter().copied()));
    let base = instance.memory.first().map_or(0, |r| r.base);
    let size = instance.memory.iter().fold(0u64, |sum, r| sum.saturating_add(r.bytes));
    tree.set_prop(chosen, MEMORY_BASE, PropValue::u64(base));
    tree.set_prop(chosen, MEMORY_SIZE, PropValue::u64(size));
    if instance.memory.len() != 1 {
        tree.set_prop(
            chosen,
            MEMORY_REGIONS,
            PropValue::u64_list(instance.memory.iter().flat_map(|r| [r.base, r.bytes])),
        );
    }

    let devices = tree.add_child(root, "devices");
    for claim in &instance.devices {
        let idx = write_claim_node(&mut tree, devices, claim);
        if let Some(device) = inventory.devices.get(&claim.device) {
            tree.set_prop(idx, "compatible", PropValue::string(device.compatible.clone()));
            if let Some(pci_id) = &device.pci_id {
                tree.set_prop(idx, "pci-id", PropValue::string(pci_id.clone()));
            }
        }
    }
    tree
}

/// View of the named instance, if the state holds it
pub fn state_view(state: &ValidatedState, name: &str) -> Option<RawTree> {
    state
        .instance(name)
        .map(|instance| instance_view(state.inventory(), instance))
}

pub fn view_from_tree(tree: &RawTree) -> Result<InstanceView, DecodeError> {
    let root = tree.root();
    let compatible = read_string(tree, root, "compatible")?;
    if compatible != INSTANCE_COMPATIBLE {
        return Err(DecodeError::bad_property(
            "/",
            "compatible",
            format!("is '{}', not an instance view", compatible),
        ));
    }

    let chosen = require_child(tree, root, "chosen")?;
    let memory = if tree.prop(chosen, MEMORY_REGIONS).is_some() {
        let cells = read_u64_list(tree, chosen, MEMORY_REGIONS)?;
        if cells.len() % 2 != 0 {
            return Err(DecodeError::bad_property(
                tree.path(chosen),
                MEMORY_REGIONS,
                "is not a list of base/size pairs",
            ));
        }
        cells
            .chunks(2)
            .map(|pair| MemoryRegion::new(pair[0], pair[1]))
            .collect()
    } else {
        vec![MemoryRegion::new(
            read_u64(tree, chosen, MEMORY_BASE)?,
            read_u64(tree, chosen, MEMORY_SIZE)?,
        )]
    };

    let devices = match tree.child(root, "devices") {
        Some(node) => tree
            .children(node)
            .map(|idx| read_claim(tree, idx))
            .collect::<Result<BTreeSet<_>, _>>()?,
        None => BTreeSet::new(),
    };

    Ok(InstanceView {
        name: read_string(tree, chosen, NAME)?,
        id: read_u32(tree, chosen, ID)?,
        cpus: read_ids(tree, chosen, CPUS)?,
        memory,
        devices,
    })
}
