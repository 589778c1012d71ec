//! Transaction overlays
//!
//! ```text
//! / {
//!     compatible = "linux,multikernel-overlay";
//!     transaction-id = /bits/ 64 <7>;
//!     status = "pending";
//!
//!     fragment@0 {
//!         target-path = "/instances";
//!         __overlay__ {
//!             instance-create { instance-name = "web"; id = <1>; resources { ... }; };
//!         };
//!     };
//!
//!     fragment@1 {
//!         target-path = "/instances";
//!         __overlay__ {
//!             instance-update {
//!                 instance-name = "db";
//!                 fields = "cpus", "memory-policy";
//!                 old { cpus = <8 9>; };
//!                 new { cpus = <8 9 10>; memory-policy = "local"; };
//!             };
//!         };
//!     };
//! };
//! ```
//!
//! Creates and removes carry the whole instance so every overlay can be
//! inverted from the document alone. An optional field absent from `old`
//! or `new` means the field was unset on that side.

use kerf_core::{FieldChange, Instance, Overlay, OverlayOp, TxStatus};

use super::instance::{
    read_cpu_affinity, read_devices, read_instance, read_memory, read_memory_policy,
    read_numa_nodes, write_cpu_affinity, write_cpus, write_devices, write_instance_into,
    write_memory, write_memory_policy, write_numa_nodes,
};
use super::{read_ids, read_string, read_u32, read_u64, require_child, unit_id, LabelAllocator};
use crate::error::DecodeError;
use crate::resolve::{resolve, Symbols};
use crate::tree::{NodeIndex, PropValue, RawTree};

pub const OVERLAY_COMPATIBLE: &str = "linux,multikernel-overlay";

const TARGET_PATH: &str = "/instances";
const OVERLAY_NODE: &str = "__overlay__";
const CREATE: &str = "instance-create";
const REMOVE: &str = "instance-remove";
const UPDATE: &str = "instance-update";

// ============================================================================
// Writing
// ============================================================================

pub fn overlay_to_tree(overlay: &Overlay) -> RawTree {
    let mut tree = RawTree::new();
    let root = tree.root();
    tree.set_prop(root, "compatible", PropValue::string(OVERLAY_COMPATIBLE));
    tree.set_prop(root, "transaction-id", PropValue::u64(overlay.transaction));
    tree.set_prop(root, "status", PropValue::string(overlay.status.as_str()));

    let mut labels = LabelAllocator::default();
    for (i, op) in overlay.ops.iter().enumerate() {
        let fragment = tree.add_child(root, format!("fragment@{}", i));
        tree.set_prop(fragment, "target-path", PropValue::string(TARGET_PATH));
        let body = tree.add_child(fragment, OVERLAY_NODE);
        write_op(&mut tree, body, op, &mut labels);
    }
    tree
}

fn write_op(tree: &mut RawTree, body: NodeIndex, op: &OverlayOp, labels: &mut LabelAllocator) {
    match op {
        OverlayOp::AddInstance { instance } => {
            let idx = tree.add_child(body, CREATE);
            write_instance_into(tree, idx, instance, labels);
        }
        OverlayOp::RemoveInstance { instance } => {
            let idx = tree.add_child(body, REMOVE);
            write_instance_into(tree, idx, instance, labels);
        }
        OverlayOp::ModifyInstance { name, changes } => {
            let idx = tree.add_child(body, UPDATE);
            tree.set_prop(idx, "instance-name", PropValue::string(name.clone()));
            tree.set_prop(
                idx,
                "fields",
                PropValue::Strings(changes.iter().map(|c| c.field().to_string()).collect()),
            );
            let old = tree.add_child(idx, "old");
            let new = tree.add_child(idx, "new");
            for change in changes {
                write_change(tree, old, new, name, change, labels);
            }
        }
    }
}

fn write_change(
    tree: &mut RawTree,
    old_node: NodeIndex,
    new_node: NodeIndex,
    owner: &str,
    change: &FieldChange,
    labels: &mut LabelAllocator,
) {
    match change {
        FieldChange::Id { old, new } => {
            tree.set_prop(old_node, "id", PropValue::u32(*old));
            tree.set_prop(new_node, "id", PropValue::u32(*new));
        }
        FieldChange::Cpus { old, new } => {
            write_cpus(tree, old_node, old);
            write_cpus(tree, new_node, new);
        }
        FieldChange::Memory { old, new } => {
            write_memory(tree, old_node, old);
            write_memory(tree, new_node, new);
        }
        FieldChange::Devices { old, new } => {
            write_devices(tree, old_node, &format!("{}_old", owner), old, labels);
            write_devices(tree, new_node, &format!("{}_new", owner), new, labels);
        }
        FieldChange::NumaNodes { old, new } => {
            write_numa_nodes(tree, old_node, old.as_ref());
            write_numa_nodes(tree, new_node, new.as_ref());
        }
        FieldChange::CpuAffinity { old, new } => {
            write_cpu_affinity(tree, old_node, *old);
            write_cpu_affinity(tree, new_node, *new);
        }
        FieldChange::MemoryPolicy { old, new } => {
            write_memory_policy(tree, old_node, *old);
            write_memory_policy(tree, new_node, *new);
        }
    }
}

// ============================================================================
// Reading
// ============================================================================

pub fn overlay_from_tree(tree: &RawTree) -> Result<Overlay, DecodeError> {
    let symbols = resolve(tree)?;
    let root = tree.root();

    let compatible = read_string(tree, root, "compatible")?;
    if compatible != OVERLAY_COMPATIBLE {
        return Err(DecodeError::bad_property(
            "/",
            "compatible",
            &format!("is '{}', not an overlay", compatible),
        ));
    }
    let transaction = read_u64(tree, root, "transaction-id")?;
    let status = match tree.prop(root, "status") {
        Some(_) => parse_status(tree, root)?,
        None => TxStatus::Pending,
    };

    let mut fragments = tree
        .children(root)
        .filter(|&idx| tree.node(idx).base_name() == "fragment")
        .map(|idx| Ok((unit_id(tree, idx)?, idx)))
        .collect::<Result<Vec<_>, DecodeError>>()?;
    fragments.sort_by_key(|&(unit, _)| unit);

    let mut ops = Vec::with_capacity(fragments.len());
    for (_, fragment) in fragments {
        let target = read_string(tree, fragment, "target-path")?;
        if target != TARGET_PATH {
            return Err(DecodeError::bad_property(
                tree.path(fragment),
                "target-path",
                &format!("'{}' is not {}", target, TARGET_PATH),
            ));
        }
        let body = require_child(tree, fragment, OVERLAY_NODE)?;
        for idx in tree.children(body) {
            ops.push(read_op(tree, &symbols, idx)?);
        }
    }

    Ok(Overlay {
        transaction,
        status,
        ops,
    })
}

fn parse_status(tree: &RawTree, root: NodeIndex) -> Result<TxStatus, DecodeError> {
    let text = read_string(tree, root, "status")?;
    match text.as_str() {
        "pending" => Ok(TxStatus::Pending),
        "applied" => Ok(TxStatus::Applied),
        "failed" => Ok(TxStatus::Failed),
        "removed" => Ok(TxStatus::Removed),
        other => Err(DecodeError::bad_property(
            "/",
            "status",
            &format!("has unknown value '{}'", other),
        )),
    }
}

fn read_op(tree: &RawTree, symbols: &Symbols, idx: NodeIndex) -> Result<OverlayOp, DecodeError> {
    match tree.node(idx).base_name() {
        CREATE => Ok(OverlayOp::AddInstance {
            instance: read_whole(tree, symbols, idx)?,
        }),
        REMOVE => Ok(OverlayOp::RemoveInstance {
            instance: read_whole(tree, symbols, idx)?,
        }),
        UPDATE => {
            let name = read_string(tree, idx, "instance-name")?;
            let fields = super::required(tree, idx, "fields")?
                .as_strings()
                .map(<[String]>::to_vec)
                .ok_or_else(|| {
                    DecodeError::bad_property(tree.path(idx), "fields", "is not a string list")
                })?;
            let old = require_child(tree, idx, "old")?;
            let new = require_child(tree, idx, "new")?;
            let changes = fields
                .iter()
                .map(|field| read_change(tree, symbols, idx, old, new, field))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(OverlayOp::ModifyInstance { name, changes })
        }
        other => Err(DecodeError::Malformed {
            offset: 0,
            reason: format!("{}: unknown overlay operation '{}'", tree.path(idx), other),
        }),
    }
}

/// Instance written straight into an operation node
fn read_whole(tree: &RawTree, symbols: &Symbols, idx: NodeIndex) -> Result<Instance, DecodeError> {
    read_string(tree, idx, "instance-name")?;
    read_instance(tree, symbols, idx)
}

fn read_change(
    tree: &RawTree,
    symbols: &Symbols,
    op: NodeIndex,
    old: NodeIndex,
    new: NodeIndex,
    field: &str,
) -> Result<FieldChange, DecodeError> {
    let change = match field {
        "id" => FieldChange::Id {
            old: read_u32(tree, old, "id")?,
            new: read_u32(tree, new, "id")?,
        },
        "cpus" => FieldChange::Cpus {
            old: read_ids(tree, old, "cpus")?,
            new: read_ids(tree, new, "cpus")?,
        },
        "memory" => FieldChange::Memory {
            old: read_memory(tree, old)?,
            new: read_memory(tree, new)?,
        },
        "devices" => FieldChange::Devices {
            old: read_devices(tree, symbols, old)?,
            new: read_devices(tree, symbols, new)?,
        },
        "numa-nodes" => FieldChange::NumaNodes {
            old: read_numa_nodes(tree, old)?,
            new: read_numa_nodes(tree, new)?,
        },
        "cpu-affinity" => FieldChange::CpuAffinity {
            old: read_cpu_affinity(tree, old)?,
            new: read_cpu_affinity(tree, new)?,
        },
        "memory-policy" => FieldChange::MemoryPolicy {
            old: read_memory_policy(tree, old)?,
            new: read_memory_policy(tree, new)?,
        },
        other => {
            return Err(DecodeError::bad_property(
                tree.path(op),
                "fields",
                &format!("names unknown field '{}'", other),
            ))
        }
    };
    Ok(change)
}
