//! Property tests for the text and binary codecs over generated trees.

use kerf_dt::{dtb, dts, Cell, DecodeError, PropValue, RawTree};
use proptest::prelude::*;

const MAX_DEPTH: usize = 4;

#[derive(Clone, Debug)]
enum ValueSpec {
    Empty,
    /// `(is_ref, value)`; refs pick a label by value
    Cells(Vec<(bool, u32)>),
    Wide(Vec<u64>),
    Strings(Vec<String>),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug)]
struct NodeSpec {
    parent: prop::sample::Index,
    name: u8,
    unit: Option<u16>,
    labelled: bool,
    props: Vec<(u8, ValueSpec)>,
}

fn arb_value() -> impl Strategy<Value = ValueSpec> {
    prop_oneof![
        Just(ValueSpec::Empty),
        prop::collection::vec((any::<bool>(), any::<u32>()), 0..5).prop_map(ValueSpec::Cells),
        prop::collection::vec(any::<u64>(), 0..4).prop_map(ValueSpec::Wide),
        prop::collection::vec("[ -~]{0,8}", 1..4).prop_map(ValueSpec::Strings),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(ValueSpec::Bytes),
    ]
}

fn arb_node() -> impl Strategy<Value = NodeSpec> {
    (
        any::<prop::sample::Index>(),
        0u8..6,
        prop::option::of(any::<u16>()),
        any::<bool>(),
        prop::collection::vec((0u8..5, arb_value()), 0..4),
    )
        .prop_map(|(parent, name, unit, labelled, props)| NodeSpec {
            parent,
            name,
            unit,
            labelled,
            props,
        })
}

/// Trees with unique sibling names, unique labels, references only to
/// defined labels and bounded depth
fn arb_tree() -> impl Strategy<Value = RawTree> {
    (
        prop::collection::vec((0u8..5, arb_value()), 0..3),
        prop::collection::vec(arb_node(), 0..12),
    )
        .prop_map(|(root_props, specs)| build(root_props, specs))
}

fn build(root_props: Vec<(u8, ValueSpec)>, specs: Vec<NodeSpec>) -> RawTree {
    let mut tree = RawTree::new();
    let mut depth = vec![0usize];
    let mut placed = vec![(tree.root(), root_props)];
    let mut labels = Vec::new();

    for (i, spec) in specs.into_iter().enumerate() {
        let open: Vec<usize> = (0..depth.len()).filter(|&n| depth[n] < MAX_DEPTH).collect();
        let parent = open[spec.parent.index(open.len())];
        let name = match spec.unit {
            Some(unit) => format!("n{}@{:x}", spec.name, unit),
            None => format!("n{}", spec.name),
        };
        if tree.child(parent, &name).is_some() {
            continue;
        }
        let idx = tree.add_child(parent, name);
        depth.push(depth[parent] + 1);
        if spec.labelled {
            let label = format!("l{}", i);
            tree.set_label(idx, label.clone());
            labels.push(label);
        }
        placed.push((idx, spec.props));
    }

    for (idx, props) in placed {
        for (name, value) in props {
            let value = match value {
                ValueSpec::Empty => PropValue::Empty,
                ValueSpec::Cells(cells) => PropValue::Cells(
                    cells
                        .into_iter()
                        .map(|(is_ref, v)| {
                            if is_ref && !labels.is_empty() {
                                Cell::Ref(labels[v as usize % labels.len()].clone())
                            } else {
                                Cell::Num(v)
                            }
                        })
                        .collect(),
                ),
                ValueSpec::Wide(values) => PropValue::Wide(values),
                ValueSpec::Strings(values) => PropValue::Strings(values),
                ValueSpec::Bytes(bytes) => PropValue::Bytes(bytes),
            };
            tree.set_prop(idx, format!("p{}", name), value);
        }
    }
    tree
}

#[test]
fn own_symbols_node_is_rejected_in_both_forms() {
    let text = "/dts-v1/;\n/ { x { }; __symbols__ { lbl = \"/x\"; }; };\n";
    let reserved = Err(DecodeError::ReservedNode {
        path: "/__symbols__".to_string(),
    });
    assert_eq!(kerf_dt::decode_text(text), reserved);

    let tree = dts::parse(text).unwrap();
    assert_eq!(kerf_dt::decode_binary(&dtb::encode(&tree)), reserved);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn text_roundtrip(tree in arb_tree()) {
        let text = dts::write(&tree);
        let back = kerf_dt::decode_text(&text).unwrap();
        prop_assert_eq!(&back, &tree);
        prop_assert_eq!(dts::write(&back), text);
    }

    #[test]
    fn binary_roundtrip(tree in arb_tree()) {
        let blob = dtb::encode(&tree);
        let back = kerf_dt::decode_binary(&blob).unwrap();
        prop_assert_eq!(&back, &tree);
        prop_assert_eq!(dtb::encode(&back), blob);
    }

    #[test]
    fn forms_agree(tree in arb_tree()) {
        let from_text = kerf_dt::decode(kerf_dt::encode_text(&tree).as_bytes()).unwrap();
        let from_blob = kerf_dt::decode(&kerf_dt::encode_binary(&tree)).unwrap();
        prop_assert_eq!(from_text, from_blob);
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = kerf_dt::decode(&data);
        let _ = dtb::decode(&data);
    }

    #[test]
    fn corrupted_blobs_never_panic(
        tree in arb_tree(),
        hits in prop::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 1..8),
    ) {
        let mut blob = dtb::encode(&tree);
        for (at, byte) in hits {
            let i = at.index(blob.len());
            blob[i] = byte;
        }
        let _ = kerf_dt::decode_binary(&blob);
    }

    #[test]
    fn arbitrary_text_never_panics(text in "[/a-z0-9@:&<>{}\\[\\];=,\" \n-]{0,96}") {
        let _ = kerf_dt::decode_text(&text);
        let _ = kerf_dt::decode_text(&format!("/dts-v1/;\n/ {{ {} }};", text));
    }
}
