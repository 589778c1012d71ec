//! Overlay delta engine
//!
//! Computes the minimal change set between two validated states and
//! packages it as an [`Overlay`] with a transaction id.
//!
//! # Core Invariant
//!
//! > `validate(old + overlay) == new`
//!
//! The engine refuses to hand out an overlay that does not reproduce the
//! planned state when applied to the state it was computed from.
//!
//! Operations are ordered removals, then modifications, then additions,
//! each by instance name. Modifications carry only the fields that differ,
//! with both the old and the new value, so every overlay has an exact
//! inverse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OverlayError;
use crate::instance::Instance;
use crate::invariants::Validator;
use crate::state::ValidatedState;
use crate::types::{
    CpuAffinity, CpuId, DeviceClaim, InstanceId, MemoryPolicy, MemoryRegion, NodeId,
    TransactionId,
};

/// Lifecycle of an overlay transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Applied,
    Failed,
    Removed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Applied => "applied",
            TxStatus::Failed => "failed",
            TxStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Field changes
// ============================================================================

/// One changed instance field, with its value before and after
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldChange {
    Id {
        old: InstanceId,
        new: InstanceId,
    },
    Cpus {
        old: BTreeSet<CpuId>,
        new: BTreeSet<CpuId>,
    },
    Memory {
        old: Vec<MemoryRegion>,
        new: Vec<MemoryRegion>,
    },
    Devices {
        old: BTreeSet<DeviceClaim>,
        new: BTreeSet<DeviceClaim>,
    },
    NumaNodes {
        old: Option<BTreeSet<NodeId>>,
        new: Option<BTreeSet<NodeId>>,
    },
    CpuAffinity {
        old: Option<CpuAffinity>,
        new: Option<CpuAffinity>,
    },
    MemoryPolicy {
        old: Option<MemoryPolicy>,
        new: Option<MemoryPolicy>,
    },
}

impl FieldChange {
    /// Field name as used in documents
    pub fn field(&self) -> &'static str {
        match self {
            FieldChange::Id { .. } => "id",
            FieldChange::Cpus { .. } => "cpus",
            FieldChange::Memory { .. } => "memory",
            FieldChange::Devices { .. } => "devices",
            FieldChange::NumaNodes { .. } => "numa-nodes",
            FieldChange::CpuAffinity { .. } => "cpu-affinity",
            FieldChange::MemoryPolicy { .. } => "memory-policy",
        }
    }

    /// Swap old and new
    pub fn inverse(&self) -> FieldChange {
        match self.clone() {
            FieldChange::Id { old, new } => FieldChange::Id { old: new, new: old },
            FieldChange::Cpus { old, new } => FieldChange::Cpus { old: new, new: old },
            FieldChange::Memory { old, new } => FieldChange::Memory { old: new, new: old },
            FieldChange::Devices { old, new } => FieldChange::Devices { old: new, new: old },
            FieldChange::NumaNodes { old, new } => FieldChange::NumaNodes { old: new, new: old },
            FieldChange::CpuAffinity { old, new } => {
                FieldChange::CpuAffinity { old: new, new: old }
            }
            FieldChange::MemoryPolicy { old, new } => {
                FieldChange::MemoryPolicy { old: new, new: old }
            }
        }
    }

    /// Set the field to `new`, provided it currently holds `old`
    fn apply(&self, inst: &mut Instance) -> Result<(), OverlayError> {
        fn swap<T: PartialEq + Clone>(
            slot: &mut T,
            old: &T,
            new: &T,
            name: &str,
            field: &'static str,
        ) -> Result<(), OverlayError> {
            if slot != old {
                return Err(OverlayError::StaleField {
                    name: name.to_string(),
                    field,
                });
            }
            *slot = new.clone();
            Ok(())
        }

        let field = self.field();
        let name = inst.name.clone();
        match self {
            FieldChange::Id { old, new } => swap(&mut inst.id, old, new, &name, field),
            FieldChange::Cpus { old, new } => swap(&mut inst.cpus, old, new, &name, field),
            FieldChange::Memory { old, new } => swap(&mut inst.memory, old, new, &name, field),
            FieldChange::Devices { old, new } => swap(&mut inst.devices, old, new, &name, field),
            FieldChange::NumaNodes { old, new } => {
                swap(&mut inst.numa_nodes, old, new, &name, field)
            }
            FieldChange::CpuAffinity { old, new } => {
                swap(&mut inst.cpu_affinity, old, new, &name, field)
            }
            FieldChange::MemoryPolicy { old, new } => {
                swap(&mut inst.memory_policy, old, new, &name, field)
            }
        }
    }
}

/// Field-granular difference between two versions of one instance
pub fn field_changes(old: &Instance, new: &Instance) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if old.id != new.id {
        changes.push(FieldChange::Id {
            old: old.id,
            new: new.id,
        });
    }
    if old.cpus != new.cpus {
        changes.push(FieldChange::Cpus {
            old: old.cpus.clone(),
            new: new.cpus.clone(),
        });
    }
    if old.memory != new.memory {
        changes.push(FieldChange::Memory {
            old: old.memory.clone(),
            new: new.memory.clone(),
        });
    }
    if old.devices != new.devices {
        changes.push(FieldChange::Devices {
            old: old.devices.clone(),
            new: new.devices.clone(),
        });
    }
    if old.numa_nodes != new.numa_nodes {
        changes.push(FieldChange::NumaNodes {
            old: old.numa_nodes.clone(),
            new: new.numa_nodes.clone(),
        });
    }
    if old.cpu_affinity != new.cpu_affinity {
        changes.push(FieldChange::CpuAffinity {
            old: old.cpu_affinity,
            new: new.cpu_affinity,
        });
    }
    if old.memory_policy != new.memory_policy {
        changes.push(FieldChange::MemoryPolicy {
            old: old.memory_policy,
            new: new.memory_policy,
        });
    }

    changes
}

// ============================================================================
// Overlay operations
// ============================================================================

/// One entity-level operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OverlayOp {
    AddInstance { instance: Instance },
    /// Carries the removed instance so the inverse can restore it
    RemoveInstance { instance: Instance },
    ModifyInstance {
        name: String,
        changes: Vec<FieldChange>,
    },
}

impl OverlayOp {
    pub fn instance_name(&self) -> &str {
        match self {
            OverlayOp::AddInstance { instance } | OverlayOp::RemoveInstance { instance } => {
                &instance.name
            }
            OverlayOp::ModifyInstance { name, .. } => name,
        }
    }

    pub fn inverse(&self) -> OverlayOp {
        match self {
            OverlayOp::AddInstance { instance } => OverlayOp::RemoveInstance {
                instance: instance.clone(),
            },
            OverlayOp::RemoveInstance { instance } => OverlayOp::AddInstance {
                instance: instance.clone(),
            },
            OverlayOp::ModifyInstance { name, changes } => OverlayOp::ModifyInstance {
                name: name.clone(),
                changes: changes.iter().map(FieldChange::inverse).collect(),
            },
        }
    }

    fn apply(&self, instances: &mut BTreeMap<String, Instance>) -> Result<(), OverlayError> {
        match self {
            OverlayOp::AddInstance { instance } => {
                if instances.contains_key(&instance.name) {
                    return Err(OverlayError::InstanceExists(instance.name.clone()));
                }
                instances.insert(instance.name.clone(), instance.clone());
            }
            OverlayOp::RemoveInstance { instance } => match instances.get(&instance.name) {
                None => return Err(OverlayError::InstanceMissing(instance.name.clone())),
                Some(current) if current != instance => {
                    return Err(OverlayError::StaleSnapshot(instance.name.clone()))
                }
                Some(_) => {
                    instances.remove(&instance.name);
                }
            },
            OverlayOp::ModifyInstance { name, changes } => {
                let inst = instances
                    .get_mut(name)
                    .ok_or_else(|| OverlayError::InstanceMissing(name.clone()))?;
                for change in changes {
                    change.apply(inst)?;
                }
            }
        }
        Ok(())
    }
}

/// Minimal operation list turning `old` into `new`
pub fn diff_instances(
    old: &BTreeMap<String, Instance>,
    new: &BTreeMap<String, Instance>,
) -> Vec<OverlayOp> {
    let mut ops = Vec::new();

    for (name, inst) in old {
        if !new.contains_key(name) {
            ops.push(OverlayOp::RemoveInstance {
                instance: inst.clone(),
            });
        }
    }
    for (name, before) in old {
        if let Some(after) = new.get(name) {
            let changes = field_changes(before, after);
            if !changes.is_empty() {
                ops.push(OverlayOp::ModifyInstance {
                    name: name.clone(),
                    changes,
                });
            }
        }
    }
    for (name, inst) in new {
        if !old.contains_key(name) {
            ops.push(OverlayOp::AddInstance {
                instance: inst.clone(),
            });
        }
    }

    ops
}

// ============================================================================
// Overlay
// ============================================================================

/// A transaction: ordered operations, an id and a status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    pub transaction: TransactionId,
    pub status: TxStatus,
    pub ops: Vec<OverlayOp>,
}

impl Overlay {
    /// A pending overlay
    pub fn new(transaction: TransactionId, ops: Vec<OverlayOp>) -> Self {
        Self {
            transaction,
            status: TxStatus::Pending,
            ops,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Undo overlay under the same transaction id
    pub fn inverse(&self) -> Overlay {
        Overlay::new(
            self.transaction,
            self.ops.iter().rev().map(OverlayOp::inverse).collect(),
        )
    }

    /// Apply to an instance map, checking every recorded old value
    pub fn apply(
        &self,
        instances: &BTreeMap<String, Instance>,
    ) -> Result<BTreeMap<String, Instance>, OverlayError> {
        let mut next = instances.clone();
        for op in &self.ops {
            op.apply(&mut next)?;
        }
        Ok(next)
    }

    pub fn added(&self) -> impl Iterator<Item = &Instance> {
        self.ops.iter().filter_map(|op| match op {
            OverlayOp::AddInstance { instance } => Some(instance),
            _ => None,
        })
    }

    pub fn removed(&self) -> impl Iterator<Item = &Instance> {
        self.ops.iter().filter_map(|op| match op {
            OverlayOp::RemoveInstance { instance } => Some(instance),
            _ => None,
        })
    }

    pub fn modified(&self) -> impl Iterator<Item = (&str, &[FieldChange])> {
        self.ops.iter().filter_map(|op| match op {
            OverlayOp::ModifyInstance { name, changes } => {
                Some((name.as_str(), changes.as_slice()))
            }
            _ => None,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Assigns transaction ids and checks overlays before they leave the core
#[derive(Clone, Debug)]
pub struct OverlayEngine {
    next_transaction: TransactionId,
}

impl Default for OverlayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayEngine {
    /// Transaction ids start at 1
    pub fn new() -> Self {
        Self {
            next_transaction: 1,
        }
    }

    /// Continue numbering after `last`
    pub fn starting_after(last: TransactionId) -> Self {
        Self {
            next_transaction: last.saturating_add(1),
        }
    }

    /// Id the next committed overlay will carry
    pub fn peek(&self) -> TransactionId {
        self.next_transaction
    }

    /// Consume the next id
    pub fn advance(&mut self) -> TransactionId {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.saturating_add(1);
        id
    }

    /// Pending overlay from `old` to `new`, tagged with the next id
    pub fn diff(&self, old: &ValidatedState, new: &ValidatedState) -> Overlay {
        let overlay = Overlay::new(
            self.next_transaction,
            diff_instances(old.instance_map(), new.instance_map()),
        );
        debug!(
            tx = overlay.transaction,
            ops = overlay.ops.len(),
            "computed overlay"
        );
        overlay
    }

    /// Consistency self-check: re-validating `old + overlay` must reproduce
    /// exactly the instances of `new`
    pub fn verify(
        &self,
        validator: &Validator,
        old: &ValidatedState,
        overlay: &Overlay,
        new: &ValidatedState,
    ) -> Result<(), OverlayError> {
        let applied = overlay.apply(old.instance_map())?;
        let candidate = validator
            .validate(
                old.inventory_arc().clone(),
                applied.into_values().collect(),
            )
            .map_err(OverlayError::Invalid)?;
        if !candidate.same_as(new) {
            warn!(tx = overlay.transaction, "overlay failed self-check");
            return Err(OverlayError::Inconsistent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::invariants::validate;
    use crate::inventory::fixtures::{flat, GB};

    fn map(instances: &[Instance]) -> BTreeMap<String, Instance> {
        instances
            .iter()
            .map(|i| (i.name.clone(), i.clone()))
            .collect()
    }

    fn a() -> Instance {
        Instance::new("a", 1, 4..8, MemoryRegion::new(0x8000_0000, GB))
    }

    fn b() -> Instance {
        Instance::new("b", 2, 8..12, MemoryRegion::new(0x8000_0000 + GB, GB))
    }

    #[test]
    fn test_diff_of_equal_maps_is_empty() {
        let m = map(&[a(), b()]);
        assert!(diff_instances(&m, &m).is_empty());
    }

    #[test]
    fn test_diff_orders_remove_modify_add() {
        let old = map(&[a(), b()]);
        let mut a2 = a();
        a2.memory = vec![MemoryRegion::new(0x8000_0000, 2 * GB)];
        let c = Instance::new("c", 3, 12..14, MemoryRegion::new(0x8000_0000 + 3 * GB, GB));
        let new = map(&[a2.clone(), c.clone()]);

        let ops = diff_instances(&old, &new);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], OverlayOp::RemoveInstance { instance: b() });
        assert_eq!(
            ops[1],
            OverlayOp::ModifyInstance {
                name: "a".to_string(),
                changes: vec![FieldChange::Memory {
                    old: a().memory,
                    new: a2.memory,
                }],
            }
        );
        assert_eq!(ops[2], OverlayOp::AddInstance { instance: c });
    }

    #[test]
    fn test_apply_then_inverse_restores() {
        let old = map(&[a(), b()]);
        let mut a2 = a().with_devices([DeviceClaim::vf("eth0", 3)]);
        a2.id = 9;
        let new = map(&[a2]);

        let overlay = Overlay::new(1, diff_instances(&old, &new));
        let applied = overlay.apply(&old).unwrap();
        assert_eq!(applied, new);

        let inverse = overlay.inverse();
        assert_eq!(inverse.transaction, 1);
        assert_eq!(inverse.apply(&applied).unwrap(), old);
    }

    #[test]
    fn test_apply_detects_stale_values() {
        let old = map(&[a()]);
        let mut a2 = a();
        a2.cpus = (16..20).collect();
        let overlay = Overlay::new(1, diff_instances(&old, &map(&[a2.clone()])));

        // Applying twice: the recorded old CPU set no longer matches
        let once = overlay.apply(&old).unwrap();
        assert_eq!(
            overlay.apply(&once),
            Err(OverlayError::StaleField {
                name: "a".to_string(),
                field: "cpus"
            })
        );

        let add = Overlay::new(2, vec![OverlayOp::AddInstance { instance: a() }]);
        assert_eq!(add.apply(&old), Err(OverlayError::InstanceExists("a".to_string())));

        let remove = Overlay::new(3, vec![OverlayOp::RemoveInstance { instance: b() }]);
        assert_eq!(
            remove.apply(&old),
            Err(OverlayError::InstanceMissing("b".to_string()))
        );
    }

    #[test]
    fn test_engine_verify() {
        let inv = Arc::new(flat());
        let old = validate(inv.clone(), vec![a()]).unwrap();
        let new = validate(inv.clone(), vec![a(), b()]).unwrap();
        let engine = OverlayEngine::new();
        let validator = Validator::default();

        let overlay = engine.diff(&old, &new);
        assert_eq!(overlay.transaction, 1);
        assert_eq!(overlay.status, TxStatus::Pending);
        assert!(engine.verify(&validator, &old, &overlay, &new).is_ok());

        let wrong = Overlay::new(1, vec![]);
        assert_eq!(
            engine.verify(&validator, &old, &wrong, &new),
            Err(OverlayError::Inconsistent)
        );
    }

    #[test]
    fn test_engine_ids_are_monotonic() {
        let mut engine = OverlayEngine::starting_after(41);
        assert_eq!(engine.peek(), 42);
        assert_eq!(engine.advance(), 42);
        assert_eq!(engine.advance(), 43);
    }
}
