//! Reference resolution pass
//!
//! Runs after the structural parse of either encoding. Builds the label
//! lookup table once and rejects documents with duplicate labels or
//! references to labels that are not defined anywhere in the document.
//! A root child named `__symbols__` is rejected too: the blob form carries
//! labels in a node of that name, so a document's own would not survive.

use std::collections::BTreeMap;

use tracing::debug;

use crate::dtb::SYMBOLS_NODE;
use crate::error::DecodeError;
use crate::tree::{NodeIndex, RawTree};

/// Label to node lookup table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Symbols {
    labels: BTreeMap<String, NodeIndex>,
}

impl Symbols {
    pub fn get(&self, label: &str) -> Option<NodeIndex> {
        self.labels.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeIndex)> {
        self.labels.iter().map(|(l, i)| (l.as_str(), *i))
    }
}

/// Build the symbol table and check every reference against it
pub fn resolve(tree: &RawTree) -> Result<Symbols, DecodeError> {
    if let Some(idx) = tree.child(RawTree::ROOT, SYMBOLS_NODE) {
        return Err(DecodeError::ReservedNode {
            path: tree.path(idx),
        });
    }

    let mut labels = BTreeMap::new();
    for (label, idx) in tree.labels() {
        if labels.insert(label.to_string(), idx).is_some() {
            return Err(DecodeError::DuplicateLabel {
                label: label.to_string(),
            });
        }
    }

    let mut references = 0usize;
    for idx in tree.walk() {
        for prop in &tree.node(idx).props {
            for label in prop.value.references() {
                if !labels.contains_key(label) {
                    return Err(DecodeError::DanglingReference {
                        label: label.to_string(),
                        path: format!("{}:{}", tree.path(idx), prop.name),
                    });
                }
                references += 1;
            }
        }
    }

    debug!(labels = labels.len(), references, "references resolved");
    Ok(Symbols { labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::PropValue;

    #[test]
    fn test_resolves_labels() {
        let mut tree = RawTree::new();
        let target = tree.add_child(tree.root(), "vf@1");
        tree.set_label(target, "nic");
        tree.set_prop(tree.root(), "devices", PropValue::refs(["nic"]));

        let symbols = resolve(&tree).unwrap();
        assert_eq!(symbols.get("nic"), Some(target));
        assert_eq!(symbols.len(), 1);
    }

    #[test]
    fn test_dangling_reference() {
        let mut tree = RawTree::new();
        let inst = tree.add_child(tree.root(), "web");
        tree.set_prop(inst, "devices", PropValue::refs(["missing"]));

        assert_eq!(
            resolve(&tree),
            Err(DecodeError::DanglingReference {
                label: "missing".to_string(),
                path: "/web:devices".to_string(),
            })
        );
    }

    #[test]
    fn test_symbols_node_is_reserved() {
        let mut tree = RawTree::new();
        tree.add_child(tree.root(), "x");
        let table = tree.add_child(tree.root(), "__symbols__");
        tree.set_prop(table, "lbl", PropValue::string("/x"));
        assert_eq!(
            resolve(&tree),
            Err(DecodeError::ReservedNode {
                path: "/__symbols__".to_string(),
            })
        );

        let mut tree = RawTree::new();
        let x = tree.add_child(tree.root(), "x");
        tree.add_child(x, "__symbols__");
        assert!(resolve(&tree).is_ok());
    }

    #[test]
    fn test_duplicate_label() {
        let mut tree = RawTree::new();
        let a = tree.add_child(tree.root(), "a");
        let b = tree.add_child(tree.root(), "b");
        tree.set_label(a, "x");
        tree.set_label(b, "x");
        assert!(matches!(
            resolve(&tree),
            Err(DecodeError::DuplicateLabel { .. })
        ));
    }
}
