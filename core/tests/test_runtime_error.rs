//! Integration tests for sketches that fail at runtime. Every fatal error
//! must unwind cleanly, emit a single `ERROR` command, and leave the
//! interpreter in the `Error` state with the error stored.

mod common;

use ardlk::{
    AstNode, Command, ExecutionState, Interpreter, InterpreterOptions,
    NodeFlags, NodeTag, OpCode,
};
use common::*;

/// Runs the program, expects a fatal error, and checks its kind and
/// message plus the terminal `ERROR` command.
macro_rules! assert_runtime_error {
    ($program:expr, $expected_kind:expr, $expected_msg:expr $(,)?) => {{
        let mut interpreter = Interpreter::from_ast(
            $program,
            InterpreterOptions {
                max_loop_iterations: 1,
                ..InterpreterOptions::default()
            },
        );
        let commands = attach_collector(&mut interpreter);
        interpreter.start();

        assert_eq!(interpreter.state(), ExecutionState::Error);
        let error = interpreter.error().expect("error should be stored");
        assert_eq!(error.kind(), $expected_kind);
        assert_eq!(error.to_string(), $expected_msg);

        let commands = commands.borrow();
        let last = commands.last().expect("at least one command");
        match last {
            Command::Error { kind, message, .. } => {
                assert_eq!(kind, $expected_kind);
                assert_eq!(message, $expected_msg);
            }
            other => panic!("expected ERROR command, got {:?}", other),
        }
        // ERROR replaces PROGRAM_END.
        assert!(commands.iter().all(|c| c.kind() != "PROGRAM_END"));
    }};
}

#[test]
fn test_index_out_of_range() {
    assert_runtime_error!(
        program(vec![
            array_decl("a", "int", Some(2), Some(vec![int(1), int(2)])),
            func(
                "setup",
                "void",
                vec![println_of(
                    AstNode::new(NodeTag::ArrayAccess)
                        .with_child(ident("a"))
                        .with_child(int(5)),
                )],
            ),
        ]),
        "IndexOutOfRange",
        "index 5 out of range for `a` (length 2)",
    );
}

#[test]
fn test_undefined_function() {
    assert_runtime_error!(
        program(vec![func(
            "setup",
            "void",
            vec![expr_stmt(call("blorp", vec![]))],
        )]),
        "UndefinedFunction",
        "undefined function `blorp`",
    );
}

#[test]
fn test_undefined_identifier() {
    assert_runtime_error!(
        program(vec![func("setup", "void", vec![println_of(ident("ghost"))])]),
        "NameError",
        "undefined identifier `ghost`",
    );
}

#[test]
fn test_const_violation() {
    let decl = var_decl("c", "int", Some(int(5))).with_flags(NodeFlags::CONST);
    assert_runtime_error!(
        program(vec![
            decl,
            func("setup", "void", vec![expr_stmt(assign(ident("c"), int(6)))]),
        ]),
        "ConstViolation",
        "cannot assign to const `c`",
    );
}

#[test]
fn test_integer_division_by_zero() {
    assert_runtime_error!(
        program(vec![func(
            "setup",
            "void",
            vec![println_of(binop(OpCode::Div, int(1), int(0)))],
        )]),
        "DivideByZero",
        "integer division by zero",
    );
}

#[test]
fn test_integer_modulo_by_zero() {
    assert_runtime_error!(
        program(vec![func(
            "setup",
            "void",
            vec![println_of(binop(OpCode::Mod, int(1), int(0)))],
        )]),
        "DivideByZero",
        "integer division by zero",
    );
}

#[test]
fn test_null_pointer_dereference() {
    assert_runtime_error!(
        program(vec![
            var_decl("p", "int*", None),
            func(
                "setup",
                "void",
                vec![println_of(
                    AstNode::new(NodeTag::Dereference).with_child(ident("p")),
                )],
            ),
        ]),
        "NullDereference",
        "null pointer dereference",
    );
}

#[test]
fn test_stack_overflow_on_unbounded_recursion() {
    assert_runtime_error!(
        program(vec![
            func("recurse", "void", vec![expr_stmt(call("recurse", vec![]))]),
            func("setup", "void", vec![expr_stmt(call("recurse", vec![]))]),
        ]),
        "StackOverflow",
        "call depth exceeded the configured maximum of 64",
    );
}

#[test]
fn test_missing_provider() {
    assert_runtime_error!(
        program(vec![func(
            "setup",
            "void",
            vec![println_of(call("analogRead", vec![int(0)]))],
        )]),
        "MissingProvider",
        "no sync data provider installed",
    );
}

#[test]
fn test_memory_limit_exceeded() {
    let sketch = program(vec![func(
        "setup",
        "void",
        // A 4096-slot int array against a tiny heap ceiling.
        vec![array_decl("big", "int", Some(4096), None)],
    )]);
    let mut interpreter = Interpreter::from_ast(
        sketch,
        InterpreterOptions {
            memory_limit_bytes: 1024,
            ..InterpreterOptions::default()
        },
    );
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    assert_eq!(interpreter.state(), ExecutionState::Error);
    let error = interpreter.error().expect("error should be stored");
    assert_eq!(error.kind(), "MemoryLimitExceeded");
    assert!(commands.borrow().iter().any(|c| c.kind() == "ERROR"));
}

#[test]
fn test_redeclaration_in_same_scope() {
    assert_runtime_error!(
        program(vec![func(
            "setup",
            "void",
            vec![
                var_decl("x", "int", Some(int(1))),
                var_decl("x", "int", Some(int(2))),
            ],
        )]),
        "NameError",
        "`x` is already declared in this scope",
    );
}

#[test]
fn test_execution_stops_at_first_error() {
    // The second println must never run.
    let mut interpreter = Interpreter::from_ast(
        program(vec![func(
            "setup",
            "void",
            vec![
                println_of(ident("ghost")),
                println_of(int(1)),
            ],
        )]),
        InterpreterOptions::default(),
    );
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    assert_eq!(interpreter.state(), ExecutionState::Error);
    let commands = commands.borrow();
    assert!(commands.iter().all(|c| c.kind() != "SERIAL_PRINTLN"));
}
