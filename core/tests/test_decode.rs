//! Integration tests for the CompactAST reader and writer: round trips
//! and every structural failure mode.

mod common;

use ardlk::error::{DecodeError, DecodeErrorKind};
use ardlk::{
    decode, encode, AstNode, LiteralValue, NodeFlags, NodeTag, OpCode,
};
use common::*;

/// A tree exercising every attribute: names, types, all literal kinds,
/// operator codes and flag bits.
fn rich_tree() -> AstNode {
    program(vec![
        var_decl("flag", "bool", Some(boolean(true)))
            .with_flags(NodeFlags::CONST),
        var_decl("ratio", "double", Some(dbl(0.25))),
        var_decl("label", "String", Some(string("boot"))),
        var_decl(
            "mark",
            "char",
            Some(
                AstNode::new(NodeTag::CharLiteral)
                    .with_value(LiteralValue::Char(b'x')),
            ),
        ),
        var_decl(
            "count",
            "unsigned long",
            Some(
                AstNode::new(NodeTag::IntLiteral)
                    .with_value(LiteralValue::UInt(4_000_000_000)),
            ),
        ),
        func_with_params(
            "tick",
            "int",
            vec![("n", "int")],
            vec![ret(Some(binop(OpCode::Shl, ident("n"), int(2))))],
        ),
        func(
            "loop",
            "void",
            vec![expr_stmt(call("delay", vec![int(10)]))],
        ),
    ])
}

#[test]
fn test_encode_decode_round_trip() {
    let tree = rich_tree();
    let blob = encode(&tree);
    let decoded = decode(&blob).expect("round trip should decode");

    // Offsets differ between a built tree and a decoded one, so compare
    // re-encoded bytes: the encoder output must be a fixed point.
    assert_eq!(encode(&decoded), blob);

    // And spot-check the decoded structure.
    assert_eq!(decoded.tag, NodeTag::Program);
    assert_eq!(decoded.children.len(), 7);
    assert_eq!(decoded.children[0].name.as_deref(), Some("flag"));
    assert!(decoded.children[0].flags.contains(NodeFlags::CONST));
    assert_eq!(
        decoded.children[1].children[0].value,
        Some(LiteralValue::Double(0.25)),
    );
    assert_eq!(
        decoded.children[4].children[0].value,
        Some(LiteralValue::UInt(4_000_000_000)),
    );
    let tick = &decoded.children[5];
    assert_eq!(tick.type_name.as_deref(), Some("int"));
    assert_eq!(tick.children[0].tag, NodeTag::Param);
}

#[test]
fn test_decoded_tree_executes() {
    let blob = encode(&program(vec![func(
        "loop",
        "void",
        vec![expr_stmt(call("delay", vec![int(250)]))],
    )]));
    let mut interpreter = ardlk::Interpreter::new(
        &blob,
        ardlk::InterpreterOptions {
            max_loop_iterations: 1,
            ..ardlk::InterpreterOptions::default()
        },
    )
    .expect("blob should decode");
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    assert!(commands.borrow().iter().any(|c| c.kind() == "DELAY"));
}

// ---- Structural failures ----

fn expect_error(blob: &[u8], kind: DecodeErrorKind, offset: usize) {
    assert_eq!(decode(blob), Err(DecodeError::new(kind, offset)));
}

/// Header for a hand-crafted blob: node table `table`, then a string
/// table holding `strings`.
fn craft(table: &[u8], strings: &[&str]) -> Vec<u8> {
    let mut string_table = Vec::new();
    string_table.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in strings {
        string_table.extend_from_slice(&(s.len() as u16).to_le_bytes());
        string_table.extend_from_slice(s.as_bytes());
    }

    let mut blob = Vec::new();
    blob.extend_from_slice(b"CAST");
    blob.extend_from_slice(&0x0302u16.to_le_bytes());
    blob.extend_from_slice(&0u16.to_le_bytes()); // flags
    blob.extend_from_slice(&1u32.to_le_bytes()); // node count
    blob.extend_from_slice(&(20 + table.len() as u32).to_le_bytes());
    blob.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
    blob.extend_from_slice(table);
    blob.extend_from_slice(&string_table);
    blob
}

#[test]
fn test_bad_magic() {
    let mut blob = encode(&program(vec![]));
    blob[0] = b'X';
    expect_error(&blob, DecodeErrorKind::BadMagic, 0);
}

#[test]
fn test_unsupported_version() {
    let mut blob = encode(&program(vec![]));
    blob[4] = 0x01;
    blob[5] = 0x01;
    expect_error(&blob, DecodeErrorKind::UnsupportedVersion, 4);
}

#[test]
fn test_truncated_header() {
    expect_error(&[], DecodeErrorKind::Truncated, 0);
    expect_error(b"CAST", DecodeErrorKind::Truncated, 4);
}

#[test]
fn test_string_table_out_of_bounds() {
    let blob = encode(&program(vec![]));
    // Claim a string table that runs past the end of the blob.
    let mut bad = blob;
    let len = bad.len();
    bad[16..20].copy_from_slice(&(len as u32).to_le_bytes());
    expect_error(&bad, DecodeErrorKind::Truncated, 12);
}

#[test]
fn test_bad_tag() {
    // tag 0xFF, no children, no attributes
    let table = [0xFFu8, 0, 0, 0];
    expect_error(&craft(&table, &[]), DecodeErrorKind::BadTag, 20);
}

#[test]
fn test_bad_string_index() {
    // Program node claiming name string #5 with an empty string table.
    let mut table = vec![0x01u8, 0, 0x01, 0]; // tag, children, attrs=NAME
    table.extend_from_slice(&5u16.to_le_bytes());
    expect_error(&craft(&table, &[]), DecodeErrorKind::BadStringIndex, 24);
}

#[test]
fn test_bad_child_offset() {
    // Program node with one offset child pointing past the table.
    let mut table = vec![0x01u8, 1, 0, 0];
    table.extend_from_slice(&9999u32.to_le_bytes());
    expect_error(&craft(&table, &[]), DecodeErrorKind::BadOffset, 24);
}

#[test]
fn test_cyclic_offsets_rejected() {
    // Program node whose child offset points back at itself.
    let mut table = vec![0x01u8, 1, 0, 0];
    table.extend_from_slice(&0u32.to_le_bytes());
    let result = decode(&craft(&table, &[]));
    assert_eq!(
        result.map(|_| ()).unwrap_err().kind,
        DecodeErrorKind::BadOffset,
    );
}

#[test]
fn test_bad_literal_kind() {
    // IntLiteral node with literal kind 0xEE.
    let table = [0x30u8, 0, 0x04, 0, 0xEE];
    expect_error(&craft(&table, &[]), DecodeErrorKind::BadLiteral, 24);
}

#[test]
fn test_truncated_literal_payload() {
    // IntLiteral declaring an i32 payload with only two bytes present.
    let table = [0x30u8, 0, 0x04, 0, 0x02, 0x01, 0x02];
    expect_error(&craft(&table, &[]), DecodeErrorKind::Truncated, 25);
}

#[test]
fn test_offset_children_decode() {
    // Root at table offset 0 with one offset child at offset 8:
    // an IntLiteral(7).
    let mut table = vec![0x01u8, 1, 0, 0]; // Program, 1 child, offsets
    table.extend_from_slice(&8u32.to_le_bytes());
    table.extend_from_slice(&[0x30u8, 0, 0x04, 0, 0x02]); // IntLiteral
    table.extend_from_slice(&7i32.to_le_bytes());

    let root = decode(&craft(&table, &[])).expect("offset blob decodes");
    assert_eq!(root.tag, NodeTag::Program);
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].value, Some(LiteralValue::Int(7)));
}

#[test]
fn test_string_deduplication() {
    // The same identifier used many times must intern to one entry.
    let tree = program(vec![func(
        "loop",
        "void",
        vec![
            expr_stmt(call("delay", vec![int(1)])),
            expr_stmt(call("delay", vec![int(2)])),
            expr_stmt(call("delay", vec![int(3)])),
        ],
    )]);
    let blob = encode(&tree);
    let occurrences = blob
        .windows(5)
        .filter(|window| *window == &b"delay"[..])
        .count();
    assert_eq!(occurrences, 1);
}
