//! Reader and writer for the CompactAST binary format (v3.2).
//!
//! A blob is: a 20-byte header (magic, version, flags, node count, string
//! table offset and byte length), a node table, and a deduplicated string
//! table. All integers are little-endian. The decoder materializes an owned
//! [AstNode] tree; nothing borrows from the input after [decode] returns.
//!
//! Node layout: tag byte, child-count byte, `u16` attribute bitmap, then the
//! optional payloads the bitmap declares (name index, type index, literal,
//! operator code, flag byte), then the children — serialized inline
//! depth-first when [AttrBits::INLINE_CHILDREN] is set, otherwise as `u32`
//! byte-offsets into the node table.

use crate::ast::{AstNode, LiteralValue, NodeFlags, NodeTag, OpCode};
use crate::consts::{
    COMPACT_AST_MAGIC, COMPACT_AST_VERSION, HEADER_LEN, MAX_DECODE_DEPTH,
};
use crate::error::{DecodeError, DecodeErrorKind};
use bitflags::bitflags;
use std::collections::HashMap;
use std::convert::TryFrom;

bitflags! {
    /// Attribute bitmap: which optional payloads follow the node header,
    /// and how the children are expressed.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct AttrBits: u16 {
        const NAME = 1 << 0;
        const TYPE_NAME = 1 << 1;
        const VALUE = 1 << 2;
        const OPERATOR = 1 << 3;
        const FLAGS = 1 << 4;
        /// Children follow inline, depth-first, instead of as offsets
        const INLINE_CHILDREN = 1 << 5;
    }
}

// Literal kind bytes
const LIT_NULL: u8 = 0;
const LIT_BOOL: u8 = 1;
const LIT_INT: u8 = 2;
const LIT_UINT: u8 = 3;
const LIT_DOUBLE: u8 = 4;
const LIT_STRING: u8 = 5;
const LIT_CHAR: u8 = 6;

/// Bounds-checked little-endian cursor over a byte slice. Every failed read
/// reports the offset it was attempted at.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            DecodeError::new(DecodeErrorKind::Truncated, self.pos)
        })?;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            DecodeError::new(DecodeErrorKind::Truncated, self.pos)
        })?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }
}

/// Decode a CompactAST blob into an owned tree.
pub fn decode(bytes: &[u8]) -> Result<AstNode, DecodeError> {
    let mut cur = Cursor::new(bytes);

    let magic = cur.read_bytes(4)?;
    if magic != &COMPACT_AST_MAGIC[..] {
        return Err(DecodeError::new(DecodeErrorKind::BadMagic, 0));
    }
    let version = cur.read_u16()?;
    if version != COMPACT_AST_VERSION {
        return Err(DecodeError::new(DecodeErrorKind::UnsupportedVersion, 4));
    }
    let _flags = cur.read_u16()?;
    let _node_count = cur.read_u32()?;
    let table_offset_pos = cur.pos;
    let string_offset = cur.read_u32()? as usize;
    let string_len = cur.read_u32()? as usize;

    if string_offset < HEADER_LEN
        || string_offset.checked_add(string_len).map_or(true, |end| {
            end > bytes.len()
        })
    {
        return Err(DecodeError::new(
            DecodeErrorKind::Truncated,
            table_offset_pos,
        ));
    }

    let strings = decode_string_table(
        &bytes[string_offset..string_offset + string_len],
        string_offset,
    )?;

    let table = &bytes[HEADER_LEN..string_offset];
    let (root, _) = decode_node(table, 0, &strings, 0)
        .map_err(|e| DecodeError::new(e.kind, e.offset + HEADER_LEN))?;
    Ok(root)
}

fn decode_string_table(
    slice: &[u8],
    base: usize,
) -> Result<Vec<String>, DecodeError> {
    let shift = |e: DecodeError| DecodeError::new(e.kind, e.offset + base);
    let mut cur = Cursor::new(slice);
    let count = cur.read_u32().map_err(shift)?;
    let mut strings = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cur.read_u16().map_err(shift)? as usize;
        let start = cur.pos;
        let bytes = cur.read_bytes(len).map_err(shift)?;
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| {
            DecodeError::new(DecodeErrorKind::BadLiteral, base + start)
        })?;
        strings.push(s);
    }
    Ok(strings)
}

/// Decode the node at `offset` within the node table. Returns the node and
/// the offset just past its inline representation (used when walking
/// inline children). Errors carry table-relative offsets; [decode] shifts
/// them to absolute positions.
fn decode_node(
    table: &[u8],
    offset: usize,
    strings: &[String],
    depth: usize,
) -> Result<(AstNode, usize), DecodeError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(DecodeError::new(DecodeErrorKind::BadOffset, offset));
    }

    let mut cur = Cursor::at(table, offset);

    let tag_pos = cur.pos;
    let tag_byte = cur.read_u8()?;
    let tag = NodeTag::try_from(tag_byte)
        .map_err(|_| DecodeError::new(DecodeErrorKind::BadTag, tag_pos))?;
    let child_count = cur.read_u8()? as usize;
    let attrs = AttrBits::from_bits_truncate(cur.read_u16()?);

    let mut node = AstNode::new(tag);
    node.offset = offset as u32;

    if attrs.contains(AttrBits::NAME) {
        node.name = Some(read_string(&mut cur, strings)?);
    }
    if attrs.contains(AttrBits::TYPE_NAME) {
        node.type_name = Some(read_string(&mut cur, strings)?);
    }
    if attrs.contains(AttrBits::VALUE) {
        node.value = Some(read_literal(&mut cur, strings)?);
    }
    if attrs.contains(AttrBits::OPERATOR) {
        let op_pos = cur.pos;
        let op_byte = cur.read_u8()?;
        let op = OpCode::try_from(op_byte).map_err(|_| {
            DecodeError::new(DecodeErrorKind::BadTag, op_pos)
        })?;
        node.op = Some(op);
    }
    if attrs.contains(AttrBits::FLAGS) {
        node.flags = NodeFlags::from_bits_truncate(cur.read_u8()?);
    }

    if attrs.contains(AttrBits::INLINE_CHILDREN) {
        for _ in 0..child_count {
            let (child, next) =
                decode_node(table, cur.pos, strings, depth + 1)?;
            node.children.push(child);
            cur.pos = next;
        }
    } else {
        for _ in 0..child_count {
            let ref_pos = cur.pos;
            let child_offset = cur.read_u32()? as usize;
            if child_offset >= table.len() {
                return Err(DecodeError::new(
                    DecodeErrorKind::BadOffset,
                    ref_pos,
                ));
            }
            let (child, _) =
                decode_node(table, child_offset, strings, depth + 1)?;
            node.children.push(child);
        }
    }

    Ok((node, cur.pos))
}

fn read_string(
    cur: &mut Cursor<'_>,
    strings: &[String],
) -> Result<String, DecodeError> {
    let pos = cur.pos;
    let index = cur.read_u16()? as usize;
    strings.get(index).cloned().ok_or_else(|| {
        DecodeError::new(DecodeErrorKind::BadStringIndex, pos)
    })
}

fn read_literal(
    cur: &mut Cursor<'_>,
    strings: &[String],
) -> Result<LiteralValue, DecodeError> {
    let kind_pos = cur.pos;
    let kind = cur.read_u8()?;
    Ok(match kind {
        LIT_NULL => LiteralValue::Null,
        LIT_BOOL => LiteralValue::Bool(cur.read_u8()? != 0),
        LIT_INT => LiteralValue::Int(cur.read_i32()?),
        LIT_UINT => LiteralValue::UInt(cur.read_u32()?),
        LIT_DOUBLE => LiteralValue::Double(cur.read_f64()?),
        LIT_STRING => LiteralValue::Str(read_string(cur, strings)?),
        LIT_CHAR => LiteralValue::Char(cur.read_u8()?),
        _ => {
            return Err(DecodeError::new(
                DecodeErrorKind::BadLiteral,
                kind_pos,
            ))
        }
    })
}

/// Interns strings in first-use order, handing out `u16` indices.
#[derive(Default)]
struct StringInterner {
    list: Vec<String>,
    indices: HashMap<String, u16>,
}

impl StringInterner {
    fn intern(&mut self, s: &str) -> u16 {
        if let Some(&index) = self.indices.get(s) {
            return index;
        }
        assert!(self.list.len() < u16::MAX as usize, "string table full");
        let index = self.list.len() as u16;
        self.list.push(s.to_string());
        self.indices.insert(s.to_string(), index);
        index
    }
}

/// Encode a tree into a CompactAST blob the decoder accepts. Children are
/// serialized inline. Panics if the tree exceeds the format's limits
/// (more than 255 children on one node, or more than 65535 distinct
/// strings) — real sketches are nowhere near either.
pub fn encode(root: &AstNode) -> Vec<u8> {
    let mut strings = StringInterner::default();
    let mut table = Vec::new();
    let node_count = write_node(&mut table, root, &mut strings);

    let mut string_table = Vec::new();
    string_table.extend_from_slice(&(strings.list.len() as u32).to_le_bytes());
    for s in &strings.list {
        assert!(s.len() <= u16::MAX as usize, "string too long for format");
        string_table.extend_from_slice(&(s.len() as u16).to_le_bytes());
        string_table.extend_from_slice(s.as_bytes());
    }

    let string_offset = (HEADER_LEN + table.len()) as u32;
    let mut blob = Vec::with_capacity(
        HEADER_LEN + table.len() + string_table.len(),
    );
    blob.extend_from_slice(&COMPACT_AST_MAGIC);
    blob.extend_from_slice(&COMPACT_AST_VERSION.to_le_bytes());
    blob.extend_from_slice(&0u16.to_le_bytes()); // flags
    blob.extend_from_slice(&node_count.to_le_bytes());
    blob.extend_from_slice(&string_offset.to_le_bytes());
    blob.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
    blob.extend_from_slice(&table);
    blob.extend_from_slice(&string_table);
    blob
}

/// Serialize one node (and its children, inline) into the node table.
/// Returns the number of nodes written.
fn write_node(
    out: &mut Vec<u8>,
    node: &AstNode,
    strings: &mut StringInterner,
) -> u32 {
    assert!(node.children.len() <= u8::MAX as usize, "too many children");

    let mut attrs = AttrBits::empty();
    if node.name.is_some() {
        attrs |= AttrBits::NAME;
    }
    if node.type_name.is_some() {
        attrs |= AttrBits::TYPE_NAME;
    }
    if node.value.is_some() {
        attrs |= AttrBits::VALUE;
    }
    if node.op.is_some() {
        attrs |= AttrBits::OPERATOR;
    }
    if !node.flags.is_empty() {
        attrs |= AttrBits::FLAGS;
    }
    if !node.children.is_empty() {
        attrs |= AttrBits::INLINE_CHILDREN;
    }

    out.push(node.tag as u8);
    out.push(node.children.len() as u8);
    out.extend_from_slice(&attrs.bits().to_le_bytes());

    if let Some(name) = &node.name {
        out.extend_from_slice(&strings.intern(name).to_le_bytes());
    }
    if let Some(type_name) = &node.type_name {
        out.extend_from_slice(&strings.intern(type_name).to_le_bytes());
    }
    if let Some(value) = &node.value {
        write_literal(out, value, strings);
    }
    if let Some(op) = node.op {
        out.push(op as u8);
    }
    if !node.flags.is_empty() {
        out.push(node.flags.bits());
    }

    let mut count = 1;
    for child in &node.children {
        count += write_node(out, child, strings);
    }
    count
}

fn write_literal(
    out: &mut Vec<u8>,
    value: &LiteralValue,
    strings: &mut StringInterner,
) {
    match value {
        LiteralValue::Null => out.push(LIT_NULL),
        LiteralValue::Bool(b) => {
            out.push(LIT_BOOL);
            out.push(*b as u8);
        }
        LiteralValue::Int(i) => {
            out.push(LIT_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        LiteralValue::UInt(u) => {
            out.push(LIT_UINT);
            out.extend_from_slice(&u.to_le_bytes());
        }
        LiteralValue::Double(d) => {
            out.push(LIT_DOUBLE);
            out.extend_from_slice(&d.to_le_bytes());
        }
        LiteralValue::Str(s) => {
            out.push(LIT_STRING);
            out.extend_from_slice(&strings.intern(s).to_le_bytes());
        }
        LiteralValue::Char(c) => {
            out.push(LIT_CHAR);
            out.push(*c);
        }
    }
}
