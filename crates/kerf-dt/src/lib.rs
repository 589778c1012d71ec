//! kerf dt - Device-Tree Codec
//!
//! Reads and writes the documents that carry a multikernel partitioning:
//! host baselines, full states, transaction overlays and per-instance
//! views. Both the source text form and the binary blob form decode into
//! the same [`RawTree`], and every reference in a decoded tree resolves
//! to a node of that tree.
//!
//! # Architecture
//!
//! ```text
//!   text (.dts)                          binary (FDT-style)
//!       │                                       │
//!       ▼ dts::parse                            ▼ dtb::decode
//! ┌──────────────────────────────────────────────────────────┐
//! │                        RawTree                           │
//! │        arena of nodes, labels, typed properties          │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ resolve: labels unique, refs defined
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                        schema                            │
//! │  inventory  │  state  │  overlay  │  view                │
//! └──────────────────────────┬───────────────────────────────┘
//!                            ▼
//!                       kerf-core model
//! ```
//!
//! Writing runs the same path backwards. Writers never fail; readers
//! return [`DecodeError`] with a position, offset or node path.
//!
//! # Module Organization
//!
//! - `tree` - Generic node arena and property values
//! - `dts` - Source text lexer, parser and canonical writer
//! - `dtb` - Binary blob encoder and bounds-checked decoder
//! - `resolve` - Label table and reference checks
//! - `schema` - Mapping between documents and the resource model
//! - `error` - Decode errors

pub mod dtb;
pub mod dts;
pub mod error;
pub mod resolve;
pub mod schema;
pub mod tree;

pub use error::DecodeError;
pub use resolve::{resolve, Symbols};
pub use schema::inventory::{inventory_from_tree, inventory_to_tree, HOST_COMPATIBLE};
pub use schema::overlay::{overlay_from_tree, overlay_to_tree, OVERLAY_COMPATIBLE};
pub use schema::state::{instances_to_tree, state_from_tree, state_to_tree, StateDocument};
pub use schema::view::{
    instance_view, state_view, view_from_tree, InstanceView, INSTANCE_COMPATIBLE,
};
pub use tree::{Cell, Node, NodeIndex, PropValue, Property, RawTree};

use kerf_core::{Inventory, Overlay};

// ============================================================================
// Whole-document entry points
// ============================================================================

/// Parse source text and check its references
pub fn decode_text(input: &str) -> Result<RawTree, DecodeError> {
    let tree = dts::parse(input)?;
    resolve(&tree)?;
    Ok(tree)
}

/// Decode a binary blob and check its references
pub fn decode_binary(data: &[u8]) -> Result<RawTree, DecodeError> {
    let tree = dtb::decode(data)?;
    resolve(&tree)?;
    Ok(tree)
}

/// Decode either form, telling them apart by the blob magic
pub fn decode(data: &[u8]) -> Result<RawTree, DecodeError> {
    if data.len() >= 4 && data[..4] == dtb::FDT_MAGIC.to_be_bytes() {
        return decode_binary(data);
    }
    match std::str::from_utf8(data) {
        Ok(text) => decode_text(text),
        Err(e) => Err(DecodeError::Malformed {
            offset: e.valid_up_to(),
            reason: "neither a blob nor UTF-8 text".to_string(),
        }),
    }
}

pub fn encode_text(tree: &RawTree) -> String {
    dts::write(tree)
}

pub fn encode_binary(tree: &RawTree) -> Vec<u8> {
    dtb::encode(tree)
}

/// Baseline inventory from either form
pub fn decode_baseline(data: &[u8]) -> Result<Inventory, DecodeError> {
    inventory_from_tree(&decode(data)?)
}

/// State document from either form; validate it to get a state
pub fn decode_state(data: &[u8]) -> Result<StateDocument, DecodeError> {
    state_from_tree(&decode(data)?)
}

/// Overlay from either form
pub fn decode_overlay(data: &[u8]) -> Result<Overlay, DecodeError> {
    overlay_from_tree(&decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE: &str = r#"/dts-v1/;

/ {
    compatible = "linux,multikernel-host";

    resources {
        cpus {
            total = <8>;
            host-reserved = <0 1>;
        };
        memory {
            total-bytes = /bits/ 64 <0x100000000>;
            host-reserved-bytes = /bits/ 64 <0x40000000>;
            memory-pool-base = /bits/ 64 <0x40000000>;
            memory-pool-bytes = /bits/ 64 <0xc0000000>;
        };
        devices {
        };
    };
};
"#;

    #[test]
    fn test_decode_sniffs_form() {
        let text = decode(BASELINE.as_bytes()).unwrap();
        let blob = decode(&encode_binary(&text)).unwrap();
        assert_eq!(text, blob);
    }

    #[test]
    fn test_decode_baseline_text() {
        let inv = decode_baseline(BASELINE.as_bytes()).unwrap();
        assert_eq!(inv.cpus.total, 8);
        assert_eq!(inv.memory.pool_base, 1 << 30);
        assert!(inv.devices.is_empty());
    }

    #[test]
    fn test_decode_rejects_binary_garbage() {
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00, 0x01]),
            Err(DecodeError::Malformed { offset: 0, .. })
        ));
    }

    #[test]
    fn test_dangling_reference_reported() {
        let text = "/dts-v1/;\n/ { a { devices = <&missing>; }; };\n";
        assert_eq!(
            decode_text(text),
            Err(DecodeError::DanglingReference {
                label: "missing".to_string(),
                path: "/a:devices".to_string(),
            })
        );
    }
}
