//! Mapping between device-tree documents and the resource model
//!
//! - `inventory` - Baseline: `/resources` only
//! - `instance` - Instance nodes and their resource properties
//! - `state` - Full state: baseline plus `/instances`
//! - `overlay` - Transaction overlays built from fragments
//! - `view` - Per-instance minimal tree handed to a loader
//!
//! Readers report the path and property name of anything missing or
//! malformed. Writers never fail.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::DecodeError;
use crate::tree::{NodeIndex, PropValue, RawTree};

pub mod instance;
pub mod inventory;
pub mod overlay;
pub mod state;
pub mod view;

// ============================================================================
// Reading
// ============================================================================

pub(crate) fn require_child(
    tree: &RawTree,
    parent: NodeIndex,
    name: &str,
) -> Result<NodeIndex, DecodeError> {
    tree.child(parent, name).ok_or_else(|| DecodeError::MissingNode {
        path: join(&tree.path(parent), name),
    })
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

pub(crate) fn required<'a>(
    tree: &'a RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<&'a PropValue, DecodeError> {
    tree.prop(node, name)
        .ok_or_else(|| DecodeError::MissingProperty {
            path: tree.path(node),
            name: name.to_string(),
        })
}

fn bad(tree: &RawTree, node: NodeIndex, name: &str, reason: &str) -> DecodeError {
    DecodeError::bad_property(tree.path(node), name, reason)
}

pub(crate) fn read_u32(tree: &RawTree, node: NodeIndex, name: &str) -> Result<u32, DecodeError> {
    required(tree, node, name)?
        .as_u32()
        .ok_or_else(|| bad(tree, node, name, "is not a single cell"))
}

pub(crate) fn read_u64(tree: &RawTree, node: NodeIndex, name: &str) -> Result<u64, DecodeError> {
    required(tree, node, name)?
        .as_u64()
        .ok_or_else(|| bad(tree, node, name, "is not a 64-bit value"))
}

pub(crate) fn read_u64_list(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<Vec<u64>, DecodeError> {
    required(tree, node, name)?
        .as_u64_list()
        .map(<[u64]>::to_vec)
        .ok_or_else(|| bad(tree, node, name, "is not a 64-bit list"))
}

pub(crate) fn read_list(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<Vec<u32>, DecodeError> {
    required(tree, node, name)?
        .as_u32_list()
        .ok_or_else(|| bad(tree, node, name, "is not a numeric cell list"))
}

pub(crate) fn read_ids(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<BTreeSet<u32>, DecodeError> {
    Ok(read_list(tree, node, name)?.into_iter().collect())
}

pub(crate) fn opt_ids(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<Option<BTreeSet<u32>>, DecodeError> {
    match tree.prop(node, name) {
        Some(_) => read_ids(tree, node, name).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn read_string(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<String, DecodeError> {
    required(tree, node, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| bad(tree, node, name, "is not a string"))
}

pub(crate) fn opt_string(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<Option<String>, DecodeError> {
    match tree.prop(node, name) {
        Some(_) => read_string(tree, node, name).map(Some),
        None => Ok(None),
    }
}

/// Optional string property parsed with `FromStr`
pub(crate) fn opt_parsed<T: FromStr>(
    tree: &RawTree,
    node: NodeIndex,
    name: &str,
) -> Result<Option<T>, DecodeError> {
    match opt_string(tree, node, name)? {
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| bad(tree, node, name, &format!("has unknown value '{}'", text))),
        None => Ok(None),
    }
}

/// Numeric unit address of a node such as `node@1`
pub(crate) fn unit_id(tree: &RawTree, node: NodeIndex) -> Result<u32, DecodeError> {
    tree.node(node)
        .unit()
        .and_then(|u| u.parse().ok())
        .ok_or_else(|| bad(tree, node, "@unit", "is not a number"))
}

// ============================================================================
// Writing
// ============================================================================

/// Make `name` usable as a node name: no unit separator, no characters
/// the text form cannot carry.
pub(crate) fn node_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !out.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        out.insert(0, '_');
    }
    out
}

/// Pick a sibling name not yet used under `parent`
pub(crate) fn unique_child_name(tree: &RawTree, parent: NodeIndex, name: String) -> String {
    if tree.child(parent, &name).is_none() {
        return name;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", name, n);
        if tree.child(parent, &candidate).is_none() {
            return candidate;
        }
        n += 1;
    }
}

/// Hands out labels that are valid and unique within one document
#[derive(Debug, Default)]
pub(crate) struct LabelAllocator {
    used: BTreeSet<String>,
}

impl LabelAllocator {
    pub(crate) fn fresh(&mut self, base: &str) -> String {
        let mut label: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if !label.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            label.insert(0, '_');
        }
        if !self.used.contains(&label) {
            self.used.insert(label.clone());
            return label;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", label, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}
