//! Binary device-tree container
//!
//! Flattened-tree layout with the standard header, an empty memory
//! reservation map, a big-endian structure block and a strings block:
//!
//! ```text
//! ┌──────────────┬────────────┬─────────────────────────┬──────────────┐
//! │ header (40B) │ rsvmap     │ struct block            │ strings      │
//! │ magic, sizes │ (0, 0)     │ BEGIN name ... PROP ... │ "name\0..."  │
//! │ offsets, v17 │            │ ... END_NODE ... END    │              │
//! └──────────────┴────────────┴─────────────────────────┴──────────────┘
//! ```
//!
//! Every property payload starts with a one-byte type tag, so a decoded
//! value is exactly the value that was encoded. Labels travel in a
//! `__symbols__` node under the root (label = path), which the decoder
//! folds back into node labels.
//!
//! Decoding checks every offset and length against the input and returns
//! an error instead of panicking on arbitrary bytes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::dts::MAX_DEPTH;
use crate::error::DecodeError;
use crate::tree::{Cell, NodeIndex, PropValue, RawTree};

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_VERSION: u32 = 17;
pub const FDT_LAST_COMP_VERSION: u32 = 16;

const HEADER_SIZE: usize = 40;
const RSVMAP_SIZE: usize = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

const TAG_EMPTY: u8 = 0;
const TAG_CELLS: u8 = 1;
const TAG_WIDE: u8 = 2;
const TAG_STRINGS: u8 = 3;
const TAG_BYTES: u8 = 4;

const CELL_NUM: u8 = 0;
const CELL_REF: u8 = 1;

/// Name of the label table node
pub const SYMBOLS_NODE: &str = "__symbols__";

// ============================================================================
// Encoding
// ============================================================================

#[derive(Default)]
struct StringTable {
    bytes: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl StringTable {
    fn offset(&mut self, name: &str) -> u32 {
        if let Some(off) = self.offsets.get(name) {
            return *off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), off);
        off
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn encode_value(value: &PropValue) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        PropValue::Empty => out.push(TAG_EMPTY),
        PropValue::Cells(cells) => {
            out.push(TAG_CELLS);
            push_u32(&mut out, cells.len() as u32);
            for cell in cells {
                match cell {
                    Cell::Num(v) => {
                        out.push(CELL_NUM);
                        push_u32(&mut out, *v);
                    }
                    Cell::Ref(label) => {
                        out.push(CELL_REF);
                        push_str(&mut out, label);
                    }
                }
            }
        }
        PropValue::Wide(values) => {
            out.push(TAG_WIDE);
            for v in values {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        PropValue::Strings(values) => {
            out.push(TAG_STRINGS);
            push_u32(&mut out, values.len() as u32);
            for s in values {
                push_str(&mut out, s);
            }
        }
        PropValue::Bytes(bytes) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(bytes);
        }
    }
    out
}

fn emit_prop(out: &mut Vec<u8>, strings: &mut StringTable, name: &str, value: &PropValue) {
    let payload = encode_value(value);
    push_u32(out, FDT_PROP);
    push_u32(out, payload.len() as u32);
    push_u32(out, strings.offset(name));
    out.extend_from_slice(&payload);
    pad4(out);
}

fn emit_node(
    out: &mut Vec<u8>,
    strings: &mut StringTable,
    tree: &RawTree,
    idx: NodeIndex,
    symbols: Option<&[(String, String)]>,
) {
    let node = tree.node(idx);
    push_u32(out, FDT_BEGIN_NODE);
    out.extend_from_slice(node.name.as_bytes());
    out.push(0);
    pad4(out);

    for prop in &node.props {
        emit_prop(out, strings, &prop.name, &prop.value);
    }
    for child in &node.children {
        emit_node(out, strings, tree, *child, None);
    }

    if let Some(symbols) = symbols {
        push_u32(out, FDT_BEGIN_NODE);
        out.extend_from_slice(SYMBOLS_NODE.as_bytes());
        out.push(0);
        pad4(out);
        for (label, path) in symbols {
            emit_prop(out, strings, label, &PropValue::string(path.clone()));
        }
        push_u32(out, FDT_END_NODE);
    }

    push_u32(out, FDT_END_NODE);
}

/// Flatten a tree into a blob
pub fn encode(tree: &RawTree) -> Vec<u8> {
    let symbols: Vec<(String, String)> = tree
        .labels()
        .map(|(label, idx)| (label.to_string(), tree.path(idx)))
        .collect();

    let mut strings = StringTable::default();
    let mut structure = Vec::new();
    // A root child of the reserved name forces a table so decoding keeps it
    let table = (!symbols.is_empty() || tree.child(RawTree::ROOT, SYMBOLS_NODE).is_some())
        .then_some(symbols.as_slice());
    emit_node(&mut structure, &mut strings, tree, RawTree::ROOT, table);
    push_u32(&mut structure, FDT_END);

    let off_rsvmap = HEADER_SIZE;
    let off_struct = off_rsvmap + RSVMAP_SIZE;
    let off_strings = off_struct + structure.len();
    let total = off_strings + strings.bytes.len();

    let mut out = Vec::with_capacity(total);
    for field in [
        FDT_MAGIC,
        total as u32,
        off_struct as u32,
        off_strings as u32,
        off_rsvmap as u32,
        FDT_VERSION,
        FDT_LAST_COMP_VERSION,
        0,
        strings.bytes.len() as u32,
        structure.len() as u32,
    ] {
        push_u32(&mut out, field);
    }
    out.extend_from_slice(&[0u8; RSVMAP_SIZE]);
    out.extend_from_slice(&structure);
    out.extend_from_slice(&strings.bytes);
    out
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked reader over one block of the blob
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data` within the blob, for error reporting
    base: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated {
                offset: self.offset(),
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// Length-prefixed UTF-8 string
    fn string(&mut self) -> Result<String, DecodeError> {
        let at = self.offset();
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::malformed(at, "invalid UTF-8"))
    }

    /// NUL-terminated UTF-8 string
    fn cstr(&mut self) -> Result<String, DecodeError> {
        let at = self.offset();
        let rest = &self.data[self.pos.min(self.data.len())..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::Truncated {
                offset: self.base + self.data.len(),
            })?;
        let bytes = self.take(len)?;
        self.pos += 1;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::malformed(at, "invalid UTF-8"))
    }

    fn align4(&mut self) {
        self.pos = self.pos.saturating_add(3) & !3;
    }
}

fn header_field(data: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Sub-slice `[off, off + len)` of the blob, or an error naming `what`
fn block<'a>(data: &'a [u8], off: u32, len: u32, what: &str) -> Result<&'a [u8], DecodeError> {
    let (off, len) = (off as usize, len as usize);
    off.checked_add(len)
        .filter(|end| *end <= data.len())
        .map(|end| &data[off..end])
        .ok_or_else(|| DecodeError::malformed(off, format!("{} block out of bounds", what)))
}

fn decode_value(payload: &[u8], base: usize) -> Result<PropValue, DecodeError> {
    let mut cur = Cursor::new(payload, base);
    let tag = cur.u8()?;
    let value = match tag {
        TAG_EMPTY => PropValue::Empty,
        TAG_CELLS => {
            let count = cur.u32()?;
            let mut cells = Vec::new();
            for _ in 0..count {
                let at = cur.offset();
                match cur.u8()? {
                    CELL_NUM => cells.push(Cell::Num(cur.u32()?)),
                    CELL_REF => cells.push(Cell::Ref(cur.string()?)),
                    other => {
                        return Err(DecodeError::malformed(
                            at,
                            format!("unknown cell kind {}", other),
                        ))
                    }
                }
            }
            PropValue::Cells(cells)
        }
        TAG_WIDE => {
            if (payload.len() - 1) % 8 != 0 {
                return Err(DecodeError::malformed(base, "64-bit cells not a multiple of 8"));
            }
            let mut values = Vec::with_capacity((payload.len() - 1) / 8);
            while !cur.is_done() {
                values.push(cur.u64()?);
            }
            PropValue::Wide(values)
        }
        TAG_STRINGS => {
            let count = cur.u32()?;
            let mut values = Vec::new();
            for _ in 0..count {
                values.push(cur.string()?);
            }
            PropValue::Strings(values)
        }
        TAG_BYTES => PropValue::Bytes(payload[1..].to_vec()),
        other => {
            return Err(DecodeError::malformed(
                base,
                format!("unknown value tag {}", other),
            ))
        }
    };

    if !matches!(value, PropValue::Wide(_) | PropValue::Bytes(_)) && !cur.is_done() {
        return Err(DecodeError::malformed(cur.offset(), "trailing bytes in value"));
    }
    Ok(value)
}

fn string_at(strings: &[u8], off: u32, base: usize) -> Result<String, DecodeError> {
    let off = off as usize;
    if off >= strings.len() {
        return Err(DecodeError::malformed(base, "name offset out of bounds"));
    }
    Cursor::new(&strings[off..], base + off).cstr()
}

/// Rebuild a tree from a blob. References are not checked here; see
/// [`crate::resolve`].
pub fn decode(data: &[u8]) -> Result<RawTree, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { offset: data.len() });
    }
    let magic = header_field(data, 0);
    if magic != FDT_MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let total = header_field(data, 1) as usize;
    let off_struct = header_field(data, 2);
    let off_strings = header_field(data, 3);
    let version = header_field(data, 5);
    let last_comp = header_field(data, 6);
    let size_strings = header_field(data, 8);
    let size_struct = header_field(data, 9);

    if version < FDT_LAST_COMP_VERSION || last_comp > FDT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    if total < HEADER_SIZE {
        return Err(DecodeError::malformed(4, "total size smaller than header"));
    }
    if total > data.len() {
        return Err(DecodeError::Truncated { offset: data.len() });
    }
    let data = &data[..total];
    let structure = block(data, off_struct, size_struct, "struct")?;
    let strings = block(data, off_strings, size_strings, "strings")?;

    let mut tree = RawTree::new();
    let mut stack: Vec<NodeIndex> = Vec::new();
    let mut seen_root = false;
    let mut cur = Cursor::new(structure, off_struct as usize);

    loop {
        let at = cur.offset();
        match cur.u32()? {
            FDT_BEGIN_NODE => {
                let name = cur.cstr()?;
                cur.align4();
                match stack.last().copied() {
                    None if seen_root => return Err(DecodeError::malformed(at, "second root node")),
                    None if !name.is_empty() => {
                        return Err(DecodeError::malformed(at, "root node has a name"))
                    }
                    None => {
                        seen_root = true;
                        stack.push(RawTree::ROOT);
                    }
                    Some(_) if stack.len() > MAX_DEPTH => {
                        return Err(DecodeError::malformed(at, "nodes nested too deeply"))
                    }
                    Some(parent) => {
                        if name.is_empty() || tree.child(parent, &name).is_some() {
                            return Err(DecodeError::malformed(
                                at,
                                format!("bad or duplicate node name '{}'", name),
                            ));
                        }
                        stack.push(tree.add_child(parent, name));
                    }
                }
            }
            FDT_END_NODE => {
                stack
                    .pop()
                    .ok_or_else(|| DecodeError::malformed(at, "unbalanced end of node"))?;
            }
            FDT_PROP => {
                let node = *stack
                    .last()
                    .ok_or_else(|| DecodeError::malformed(at, "property outside a node"))?;
                let len = cur.u32()? as usize;
                let name_off = cur.u32()?;
                let payload_at = cur.offset();
                let payload = cur.take(len)?;
                cur.align4();
                let name = string_at(strings, name_off, off_strings as usize)?;
                if tree.prop(node, &name).is_some() {
                    return Err(DecodeError::malformed(
                        at,
                        format!("duplicate property '{}'", name),
                    ));
                }
                let value = decode_value(payload, payload_at)?;
                tree.set_prop(node, name, value);
            }
            FDT_NOP => {}
            FDT_END => {
                if !seen_root || !stack.is_empty() {
                    return Err(DecodeError::malformed(at, "end token inside a node"));
                }
                break;
            }
            other => {
                return Err(DecodeError::malformed(
                    at,
                    format!("unknown token {:#x}", other),
                ))
            }
        }
    }

    apply_symbols(&mut tree)?;
    debug!(bytes = total, nodes = tree.len(), "blob decoded");
    Ok(tree)
}

/// Fold a trailing `__symbols__` node back into node labels
fn apply_symbols(tree: &mut RawTree) -> Result<(), DecodeError> {
    let Some(symbols) = tree.children(RawTree::ROOT).last() else {
        return Ok(());
    };
    if tree.node(symbols).name != SYMBOLS_NODE {
        return Ok(());
    }

    let entries: Vec<(String, PropValue)> = tree
        .node(symbols)
        .props
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect();
    tree.detach(RawTree::ROOT, symbols);

    for (label, value) in entries {
        let path = value.as_str().ok_or_else(|| {
            DecodeError::bad_property(format!("/{}", SYMBOLS_NODE), &label, "is not a path")
        })?;
        let idx = tree.find(path).ok_or_else(|| DecodeError::MissingNode {
            path: path.to_string(),
        })?;
        if tree.node(idx).label.is_some() {
            return Err(DecodeError::DuplicateLabel { label });
        }
        tree.set_label(idx, label);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawTree {
        let mut tree = RawTree::new();
        tree.set_prop(tree.root(), "compatible", PropValue::string("linux,multikernel-host"));
        let res = tree.add_child(tree.root(), "resources");
        tree.set_prop(res, "total", PropValue::u32(32));
        tree.set_prop(res, "base", PropValue::u64(0x8000_0000));
        tree.set_prop(res, "flag", PropValue::Empty);
        tree.set_prop(res, "raw", PropValue::Bytes(vec![1, 2, 3]));
        let vf = tree.add_child(res, "vf@1");
        tree.set_label(vf, "nic");
        tree.set_prop(tree.root(), "users", PropValue::refs(["nic"]));
        tree
    }

    #[test]
    fn test_header_layout() {
        let blob = encode(&sample());
        assert_eq!(header_field(&blob, 0), FDT_MAGIC);
        assert_eq!(header_field(&blob, 1) as usize, blob.len());
        assert_eq!(header_field(&blob, 5), FDT_VERSION);
        assert_eq!(header_field(&blob, 2) % 4, 0);
    }

    #[test]
    fn test_roundtrip_with_labels() {
        let tree = sample();
        let decoded = decode(&encode(&tree)).unwrap();
        assert_eq!(decoded, tree);
        let vf = decoded.find("/resources/vf@1").unwrap();
        assert_eq!(decoded.node(vf).label.as_deref(), Some("nic"));
        assert!(decoded.find("/__symbols__").is_none());
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let blob = encode(&sample());
        let mut bad = blob.clone();
        bad[0] = 0;
        assert!(matches!(decode(&bad), Err(DecodeError::BadMagic(_))));
        assert!(matches!(
            decode(&blob[..20]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(decode(&blob[..blob.len() - 1]).is_err());
    }

    #[test]
    fn test_every_prefix_is_rejected_without_panic() {
        let blob = encode(&sample());
        for len in 0..blob.len() {
            assert!(decode(&blob[..len]).is_err());
        }
    }

    #[test]
    fn test_corrupted_bytes_do_not_panic() {
        let blob = encode(&sample());
        for i in 0..blob.len() {
            let mut copy = blob.clone();
            copy[i] ^= 0xff;
            let _ = decode(&copy);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert!(decode_value(&[9, 0, 0], 0).is_err());
        assert!(decode_value(&[], 0).is_err());
        assert!(decode_value(&[TAG_WIDE, 1, 2, 3], 0).is_err());
        assert!(decode_value(&[TAG_EMPTY, 0], 0).is_err());
    }
}
