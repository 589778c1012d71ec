//! Full state documents: the baseline plus `/instances`
//!
//! Decoding a state document yields its parts, not a
//! [`ValidatedState`]: the only way to one is through the validator.

use std::sync::Arc;

use kerf_core::{Instance, Inventory, ValidatedState, Validator, Violation};

use super::instance::{read_instance, write_instance};
use super::inventory::{read_resources, write_resources, HOST_COMPATIBLE};
use super::LabelAllocator;
use crate::error::DecodeError;
use crate::resolve::resolve;
use crate::tree::{PropValue, RawTree};

/// Inventory and instances read from a state document, not yet validated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateDocument {
    pub inventory: Inventory,
    pub instances: Vec<Instance>,
}

impl StateDocument {
    pub fn validate(self, validator: &Validator) -> Result<ValidatedState, Vec<Violation>> {
        validator.validate(Arc::new(self.inventory), self.instances)
    }
}

/// Document for an inventory and a set of instances
pub fn instances_to_tree<'a>(
    inventory: &Inventory,
    instances: impl IntoIterator<Item = &'a Instance>,
) -> RawTree {
    let mut tree = RawTree::new();
    tree.set_prop(RawTree::ROOT, "compatible", PropValue::string(HOST_COMPATIBLE));
    write_resources(&mut tree, inventory);

    let parent = tree.add_child(RawTree::ROOT, "instances");
    let mut labels = LabelAllocator::default();
    for instance in instances {
        write_instance(&mut tree, parent, instance, &mut labels);
    }
    tree
}

pub fn state_to_tree(state: &ValidatedState) -> RawTree {
    instances_to_tree(state.inventory(), state.instances())
}

/// Inventory and instances of a state document, in document order
pub fn state_from_tree(tree: &RawTree) -> Result<StateDocument, DecodeError> {
    let symbols = resolve(tree)?;
    let inventory = read_resources(tree)?;
    let instances = match tree.child(RawTree::ROOT, "instances") {
        Some(parent) => tree
            .children(parent)
            .map(|idx| read_instance(tree, &symbols, idx))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    Ok(StateDocument {
        inventory,
        instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::inventory::fixtures::{inventory, GB};
    use crate::schema::inventory::inventory_from_tree;
    use crate::dts;
    use kerf_core::{DeviceClaim, MemoryRegion};

    fn state() -> ValidatedState {
        let web = Instance::new("web", 1, 4..8, MemoryRegion::new(2 * GB, GB))
            .with_devices([DeviceClaim::vf("eth0", 1)]);
        let db = Instance::new("db", 2, 16..20, MemoryRegion::new(8 * GB, 2 * GB))
            .with_devices([DeviceClaim::vf("eth0", 2), DeviceClaim::namespace("nvme0", 2)]);
        kerf_core::validate(Arc::new(inventory()), vec![web, db]).unwrap()
    }

    #[test]
    fn test_state_roundtrip_through_text() {
        let state = state();
        let text = dts::write(&state_to_tree(&state));
        let doc = state_from_tree(&dts::parse(&text).unwrap()).unwrap();

        let restored = doc.validate(&Validator::default()).unwrap();
        assert!(restored.same_as(&state));
    }

    #[test]
    fn test_state_is_not_a_baseline() {
        let tree = state_to_tree(&state());
        assert_eq!(
            inventory_from_tree(&tree),
            Err(DecodeError::InstancesInBaseline)
        );
    }

    #[test]
    fn test_invalid_document_reports_violations() {
        let state = state();
        let mut instances = state.to_instances();
        let web = instances.iter_mut().find(|i| i.name == "web").unwrap();
        web.cpus = (16..18).collect();
        let tree = instances_to_tree(state.inventory(), &instances);

        let doc = state_from_tree(&tree).unwrap();
        let violations = doc.validate(&Validator::default()).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| v.category == kerf_core::Category::CpuOverlap));
    }
}
