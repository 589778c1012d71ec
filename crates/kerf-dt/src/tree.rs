//! Generic device-tree arena
//!
//! A [`RawTree`] is a labeled tree of nodes with typed properties. Nodes
//! live in one `Vec` and refer to each other by [`NodeIndex`]; the root is
//! always index 0. Cross-references are kept symbolic (`&label` cells) and
//! resolved through a lookup table built by [`crate::resolve`], never as
//! pointers.
//!
//! Equality is structural: two trees are equal when their nodes, labels,
//! properties and child order match, regardless of arena layout.

use std::collections::BTreeSet;

/// Position of a node in its tree's arena
pub type NodeIndex = usize;

/// One 32-bit cell of a `<...>` array
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cell {
    Num(u32),
    /// Reference to the node carrying this label
    Ref(String),
}

/// A property value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropValue {
    /// Boolean property: present or not
    Empty,
    Cells(Vec<Cell>),
    /// `/bits/ 64 <...>`
    Wide(Vec<u64>),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
}

impl PropValue {
    pub fn u32(value: u32) -> Self {
        PropValue::Cells(vec![Cell::Num(value)])
    }

    pub fn u32_list(values: impl IntoIterator<Item = u32>) -> Self {
        PropValue::Cells(values.into_iter().map(Cell::Num).collect())
    }

    pub fn u64(value: u64) -> Self {
        PropValue::Wide(vec![value])
    }

    pub fn u64_list(values: impl IntoIterator<Item = u64>) -> Self {
        PropValue::Wide(values.into_iter().collect())
    }

    pub fn string(value: impl Into<String>) -> Self {
        PropValue::Strings(vec![value.into()])
    }

    pub fn refs<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        PropValue::Cells(labels.into_iter().map(|l| Cell::Ref(l.into())).collect())
    }

    /// A single numeric cell
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropValue::Cells(cells) => match cells.as_slice() {
                [Cell::Num(v)] => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }

    /// All cells, if every one is numeric
    pub fn as_u32_list(&self) -> Option<Vec<u32>> {
        match self {
            PropValue::Cells(cells) => cells
                .iter()
                .map(|c| match c {
                    Cell::Num(v) => Some(*v),
                    Cell::Ref(_) => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// A 64-bit value written as `/bits/ 64 <v>`, `<hi lo>` or `<v>`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::Wide(values) => match values.as_slice() {
                [v] => Some(*v),
                _ => None,
            },
            PropValue::Cells(cells) => match cells.as_slice() {
                [Cell::Num(v)] => Some(u64::from(*v)),
                [Cell::Num(hi), Cell::Num(lo)] => Some((u64::from(*hi) << 32) | u64::from(*lo)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_u64_list(&self) -> Option<&[u64]> {
        match self {
            PropValue::Wide(values) => Some(values),
            _ => None,
        }
    }

    /// A single string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Strings(values) => match values.as_slice() {
                [s] => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            PropValue::Strings(values) => Some(values),
            _ => None,
        }
    }

    /// All cells, if every one is a reference
    pub fn as_refs(&self) -> Option<Vec<&str>> {
        match self {
            PropValue::Cells(cells) => cells
                .iter()
                .map(|c| match c {
                    Cell::Ref(label) => Some(label.as_str()),
                    Cell::Num(_) => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Labels referenced from this value
    pub fn references(&self) -> impl Iterator<Item = &str> {
        let cells: &[Cell] = match self {
            PropValue::Cells(cells) => cells,
            _ => &[],
        };
        cells.iter().filter_map(|c| match c {
            Cell::Ref(label) => Some(label.as_str()),
            Cell::Num(_) => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: PropValue,
}

#[derive(Clone, Debug)]
pub struct Node {
    /// Full node name including any `@unit` suffix; empty for the root
    pub name: String,
    pub label: Option<String>,
    pub props: Vec<Property>,
    pub children: Vec<NodeIndex>,
    pub parent: Option<NodeIndex>,
}

impl Node {
    fn new(name: String, parent: Option<NodeIndex>) -> Self {
        Self {
            name,
            label: None,
            props: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }

    /// Name without the unit address
    pub fn base_name(&self) -> &str {
        self.name.split_once('@').map_or(&self.name, |(base, _)| base)
    }

    /// Unit address after `@`, if any
    pub fn unit(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, unit)| unit)
    }

    pub fn prop(&self, name: &str) -> Option<&PropValue> {
        self.props.iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

/// Arena-backed device tree
#[derive(Clone, Debug)]
pub struct RawTree {
    nodes: Vec<Node>,
}

impl Default for RawTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTree {
    pub const ROOT: NodeIndex = 0;

    /// A tree holding only an empty root
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), None)],
        }
    }

    pub fn root(&self) -> NodeIndex {
        Self::ROOT
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0].props.is_empty()
    }

    /// Node at `idx`.
    ///
    /// # Panics
    ///
    /// If `idx` did not come from this tree.
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Append a child named `name` under `parent`
    pub fn add_child(&mut self, parent: NodeIndex, name: impl Into<String>) -> NodeIndex {
        let idx = self.nodes.len();
        self.nodes.push(Node::new(name.into(), Some(parent)));
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn set_label(&mut self, idx: NodeIndex, label: impl Into<String>) {
        self.nodes[idx].label = Some(label.into());
    }

    /// Set a property, replacing any previous value of the same name
    pub fn set_prop(&mut self, idx: NodeIndex, name: impl Into<String>, value: PropValue) {
        let name = name.into();
        let props = &mut self.nodes[idx].props;
        match props.iter_mut().find(|p| p.name == name) {
            Some(prop) => prop.value = value,
            None => props.push(Property { name, value }),
        }
    }

    pub fn prop(&self, idx: NodeIndex, name: &str) -> Option<&PropValue> {
        self.nodes[idx].prop(name)
    }

    pub fn children(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.nodes[idx].children.iter().copied()
    }

    /// Direct child by full name
    pub fn child(&self, idx: NodeIndex, name: &str) -> Option<NodeIndex> {
        self.children(idx).find(|c| self.nodes[*c].name == name)
    }

    /// Remove a direct child from its parent's child list. The node stays
    /// in the arena but is no longer reachable.
    pub(crate) fn detach(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.nodes[parent].children.retain(|c| *c != child);
    }

    /// Node at an absolute path such as `/resources/cpus`
    pub fn find(&self, path: &str) -> Option<NodeIndex> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(Self::ROOT, |idx, part| self.child(idx, part))
    }

    /// Absolute path of a node
    pub fn path(&self, idx: NodeIndex) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            if i != Self::ROOT {
                parts.push(self.nodes[i].name.as_str());
            }
            cur = self.nodes[i].parent;
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Reachable nodes in depth-first pre-order
    pub fn walk(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Self::ROOT];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(self.nodes[idx].children.iter().rev().copied());
        }
        order
    }

    /// Labels defined on reachable nodes
    pub fn labels(&self) -> impl Iterator<Item = (&str, NodeIndex)> + '_ {
        self.walk()
            .into_iter()
            .filter_map(move |idx| self.nodes[idx].label.as_deref().map(|l| (l, idx)))
    }

    /// Every label in use, for picking fresh ones
    pub fn label_set(&self) -> BTreeSet<String> {
        self.labels().map(|(l, _)| l.to_string()).collect()
    }

    fn subtree_eq(&self, a: NodeIndex, other: &RawTree, b: NodeIndex) -> bool {
        let (x, y) = (&self.nodes[a], &other.nodes[b]);
        x.name == y.name
            && x.label == y.label
            && x.props == y.props
            && x.children.len() == y.children.len()
            && x
                .children
                .iter()
                .zip(&y.children)
                .all(|(ca, cb)| self.subtree_eq(*ca, other, *cb))
    }
}

impl PartialEq for RawTree {
    fn eq(&self, other: &Self) -> bool {
        self.subtree_eq(Self::ROOT, other, Self::ROOT)
    }
}

impl Eq for RawTree {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawTree {
        let mut tree = RawTree::new();
        let res = tree.add_child(tree.root(), "resources");
        let cpus = tree.add_child(res, "cpus");
        tree.set_prop(cpus, "total", PropValue::u32(8));
        let dev = tree.add_child(res, "vf@1");
        tree.set_label(dev, "web_eth0_vf1");
        tree
    }

    #[test]
    fn test_paths() {
        let tree = sample();
        let cpus = tree.find("/resources/cpus").unwrap();
        assert_eq!(tree.path(cpus), "/resources/cpus");
        assert_eq!(tree.path(tree.root()), "/");
        assert!(tree.find("/resources/memory").is_none());
        assert_eq!(tree.find("/"), Some(RawTree::ROOT));
    }

    #[test]
    fn test_unit_address() {
        let tree = sample();
        let vf = tree.find("/resources/vf@1").unwrap();
        assert_eq!(tree.node(vf).base_name(), "vf");
        assert_eq!(tree.node(vf).unit(), Some("1"));
    }

    #[test]
    fn test_set_prop_replaces() {
        let mut tree = sample();
        let cpus = tree.find("/resources/cpus").unwrap();
        tree.set_prop(cpus, "total", PropValue::u32(16));
        assert_eq!(tree.node(cpus).props.len(), 1);
        assert_eq!(tree.prop(cpus, "total").and_then(PropValue::as_u32), Some(16));
    }

    #[test]
    fn test_structural_equality() {
        // Same shape built in a different arena order
        let mut a = RawTree::new();
        let x = a.add_child(0, "x");
        let y = a.add_child(0, "y");
        a.add_child(x, "x1");
        a.add_child(y, "y1");

        let mut b = RawTree::new();
        let x = b.add_child(0, "x");
        b.add_child(x, "x1");
        let y = b.add_child(0, "y");
        b.add_child(y, "y1");

        assert_eq!(a, b);
        b.set_label(y, "why");
        assert_ne!(a, b);
    }

    #[test]
    fn test_u64_forms() {
        assert_eq!(PropValue::u64(1 << 40).as_u64(), Some(1 << 40));
        assert_eq!(PropValue::u32_list([1, 0]).as_u64(), Some(1 << 32));
        assert_eq!(PropValue::u32(7).as_u64(), Some(7));
        assert_eq!(PropValue::string("x").as_u64(), None);
    }

    #[test]
    fn test_refs() {
        let value = PropValue::refs(["a", "b"]);
        assert_eq!(value.as_refs(), Some(vec!["a", "b"]));
        assert_eq!(value.as_u32_list(), None);
        let mixed = PropValue::Cells(vec![Cell::Num(1), Cell::Ref("a".into())]);
        assert_eq!(mixed.references().collect::<Vec<_>>(), vec!["a"]);
    }
}
