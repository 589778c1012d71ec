//! Validated allocation state
//!
//! A [`ValidatedState`] pairs a shared inventory with a set of instances
//! that passed every fatal check. The only way to obtain one is through
//! [`Validator::validate`](crate::invariants::Validator::validate), so
//! holding one is proof that the allocation is sound.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::freespace::Occupancy;
use crate::instance::Instance;
use crate::inventory::Inventory;
use crate::types::InstanceId;
use crate::violation::Violation;

/// Inventory plus validated instances, keyed by name
#[derive(Clone, Debug)]
pub struct ValidatedState {
    inventory: Arc<Inventory>,
    instances: BTreeMap<String, Instance>,
    warnings: Vec<Violation>,
}

impl ValidatedState {
    pub(crate) fn new(
        inventory: Arc<Inventory>,
        instances: Vec<Instance>,
        warnings: Vec<Violation>,
    ) -> Self {
        let instances = instances
            .into_iter()
            .map(|inst| (inst.name.clone(), inst))
            .collect();
        Self {
            inventory,
            instances,
            warnings,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Shared handle to the inventory
    pub fn inventory_arc(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Instances in name order
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instance_map(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn instance_by_id(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.values().find(|inst| inst.id == id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Non-fatal findings from validation
    pub fn warnings(&self) -> &[Violation] {
        &self.warnings
    }

    /// Owned copy of the instances, in name order
    pub fn to_instances(&self) -> Vec<Instance> {
        self.instances.values().cloned().collect()
    }

    /// Claims of every instance except `exclude`
    pub fn occupancy(&self, exclude: Option<&str>) -> Occupancy {
        Occupancy::of(
            self.instances
                .values()
                .filter(|inst| Some(inst.name.as_str()) != exclude),
        )
    }

    /// Same inventory and same instances
    pub fn same_as(&self, other: &ValidatedState) -> bool {
        (Arc::ptr_eq(&self.inventory, &other.inventory) || self.inventory == other.inventory)
            && self.instances == other.instances
    }
}
