//! Integration tests for full program execution: the command streams that
//! well-formed sketches produce.

mod common;

use ardlk::{
    AstNode, Command, ExecutionState, Interpreter, InterpreterOptions,
    NodeFlags, NodeTag, OpCode,
};
use common::*;

fn options(max_loop_iterations: u32) -> InterpreterOptions {
    InterpreterOptions {
        max_loop_iterations,
        ..InterpreterOptions::default()
    }
}

/// Runs a program and returns the collected command stream.
fn run_program(
    program_node: AstNode,
    opts: InterpreterOptions,
) -> (Interpreter, Vec<Command>) {
    let mut interpreter = Interpreter::from_ast(program_node, opts);
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    let collected = commands.borrow().clone();
    (interpreter, collected)
}

fn blink() -> AstNode {
    program(vec![
        func(
            "setup",
            "void",
            vec![expr_stmt(call("pinMode", vec![int(13), int(1)]))],
        ),
        func(
            "loop",
            "void",
            vec![
                expr_stmt(call("digitalWrite", vec![int(13), int(1)])),
                expr_stmt(call("delay", vec![int(500)])),
                expr_stmt(call("digitalWrite", vec![int(13), int(0)])),
                expr_stmt(call("delay", vec![int(500)])),
            ],
        ),
    ])
}

#[test]
fn test_blink_command_sequence() {
    let (interpreter, commands) = run_program(blink(), options(2));

    assert_eq!(
        kinds(&commands),
        vec![
            "VERSION_INFO",
            "PROGRAM_START",
            "SETUP_START",
            "PIN_MODE",
            "SETUP_END",
            "LOOP_START",
            "DIGITAL_WRITE",
            "DELAY",
            "DIGITAL_WRITE",
            "DELAY",
            "LOOP_END",
            "LOOP_START",
            "DIGITAL_WRITE",
            "DELAY",
            "DIGITAL_WRITE",
            "DELAY",
            "LOOP_END",
            "PROGRAM_END",
        ],
    );
    assert_eq!(interpreter.state(), ExecutionState::Complete);

    // Loop iterations are numbered from zero.
    assert_eq!(
        commands[5],
        Command::LoopStart {
            seq: 6,
            ts: 0,
            iteration: 0
        },
    );
    match &commands[11] {
        Command::LoopStart { iteration, .. } => assert_eq!(*iteration, 1),
        other => panic!("expected LOOP_START, got {:?}", other),
    }
    // The ceiling ends the run cleanly.
    match commands.last() {
        Some(Command::ProgramEnd { reason, .. }) => {
            assert_eq!(reason, "loop_limit")
        }
        other => panic!("expected PROGRAM_END, got {:?}", other),
    }
}

#[test]
fn test_seq_contiguous_and_clock_advances() {
    let (_, commands) = run_program(blink(), options(2));

    for (i, cmd) in commands.iter().enumerate() {
        assert_eq!(cmd.seq(), i as u32 + 1, "seq must be contiguous from 1");
    }
    // The interpreter clock only advances through delay().
    match &commands[8] {
        Command::DigitalWrite { ts, .. } => assert_eq!(*ts, 500),
        other => panic!("expected DIGITAL_WRITE, got {:?}", other),
    }
    match commands.last() {
        Some(Command::ProgramEnd { ts, .. }) => assert_eq!(*ts, 2000),
        other => panic!("expected PROGRAM_END, got {:?}", other),
    }
}

#[test]
fn test_analog_read_round_trips_through_provider() {
    let sketch = program(vec![func(
        "loop",
        "void",
        vec![
            var_decl("v", "int", Some(call("analogRead", vec![ident("A0")]))),
            println_of(ident("v")),
        ],
    )]);

    let mut interpreter = Interpreter::from_ast(sketch, options(2));
    interpreter.set_sync_data_provider(Box::new(TestProvider::with_analog(
        vec![512, 1023],
    )));
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    let commands = commands.borrow();

    let requests: Vec<&Command> = commands
        .iter()
        .filter(|c| c.kind() == "ANALOG_READ_REQUEST")
        .collect();
    assert_eq!(requests.len(), 2);
    match (requests[0], requests[1]) {
        (
            Command::AnalogReadRequest {
                pin, request_id, ..
            },
            Command::AnalogReadRequest {
                request_id: second_id,
                ..
            },
        ) => {
            assert_eq!(*pin, 14); // A0
            assert_eq!(request_id, "r-1");
            assert_eq!(second_id, "r-2");
        }
        other => panic!("expected two requests, got {:?}", other),
    }

    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["512", "1023"]);
}

#[test]
fn test_user_function_emits_no_commands() {
    let sketch = program(vec![
        func_with_params(
            "square",
            "int",
            vec![("x", "int")],
            vec![ret(Some(binop(OpCode::Mul, ident("x"), ident("x"))))],
        ),
        func(
            "setup",
            "void",
            vec![println_of(call("square", vec![int(7)]))],
        ),
    ]);

    let (interpreter, commands) = run_program(sketch, options(0));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["49"]);
    // The call itself is silent: setup wraps exactly one print.
    assert_eq!(
        kinds(&commands),
        vec![
            "VERSION_INFO",
            "PROGRAM_START",
            "SETUP_START",
            "SERIAL_PRINTLN",
            "SETUP_END",
            "PROGRAM_END",
        ],
    );
}

#[test]
fn test_builtin_sq_matches_user_square() {
    let sketch = program(vec![func(
        "setup",
        "void",
        vec![println_of(call("sq", vec![int(7)]))],
    )]);
    let (_, commands) = run_program(sketch, options(0));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["49"]);
}

#[test]
fn test_loop_limit_with_empty_body() {
    let sketch = program(vec![func("loop", "void", vec![])]);
    let (interpreter, commands) = run_program(sketch, options(3));

    assert_eq!(
        kinds(&commands),
        vec![
            "VERSION_INFO",
            "PROGRAM_START",
            "SETUP_START",
            "SETUP_END",
            "LOOP_START",
            "LOOP_END",
            "LOOP_START",
            "LOOP_END",
            "LOOP_START",
            "LOOP_END",
            "PROGRAM_END",
        ],
    );
    match commands.last() {
        Some(Command::ProgramEnd { reason, .. }) => {
            assert_eq!(reason, "loop_limit")
        }
        other => panic!("expected PROGRAM_END, got {:?}", other),
    }
    assert_eq!(interpreter.stats().loop_iterations, 3);
}

#[test]
fn test_zero_loop_iterations_allowed() {
    let sketch = program(vec![func("loop", "void", vec![])]);
    let (interpreter, commands) = run_program(sketch, options(0));

    assert_eq!(
        kinds(&commands),
        vec![
            "VERSION_INFO",
            "PROGRAM_START",
            "SETUP_START",
            "SETUP_END",
            "PROGRAM_END",
        ],
    );
    assert_eq!(interpreter.state(), ExecutionState::Complete);
}

#[test]
fn test_struct_alias_through_pointer() {
    // struct P { int x; }; P p; P* q = &p;
    // setup() { q->x = 5; Serial.println(p.x); }
    let arrow_access = AstNode::new(NodeTag::MemberAccess)
        .with_name("x")
        .with_flags(NodeFlags::ARROW)
        .with_child(ident("q"));
    let sketch = program(vec![
        AstNode::new(NodeTag::StructDef).with_name("P").with_child(
            AstNode::new(NodeTag::VarDecl)
                .with_name("x")
                .with_type_name("int"),
        ),
        var_decl("p", "P", None),
        var_decl(
            "q",
            "P*",
            Some(AstNode::new(NodeTag::AddressOf).with_child(ident("p"))),
        ),
        func(
            "setup",
            "void",
            vec![
                expr_stmt(assign(arrow_access, int(5))),
                println_of(
                    AstNode::new(NodeTag::MemberAccess)
                        .with_name("x")
                        .with_child(ident("p")),
                ),
            ],
        ),
    ]);

    let (interpreter, commands) = run_program(sketch, options(0));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["5"]);
}

#[test]
fn test_identical_runs_emit_identical_streams() {
    let first = {
        let (_, commands) = run_program(blink(), options(2));
        commands.iter().map(Command::to_json).collect::<Vec<_>>()
    };
    let second = {
        let (_, commands) = run_program(blink(), options(2));
        commands.iter().map(Command::to_json).collect::<Vec<_>>()
    };
    assert_eq!(first, second);
}

#[test]
fn test_reset_clears_state_and_reruns_identically() {
    let mut interpreter = Interpreter::from_ast(blink(), options(2));
    let commands = attach_collector(&mut interpreter);
    interpreter.start();
    let first: Vec<String> =
        commands.borrow().iter().map(Command::to_json).collect();
    assert_eq!(interpreter.state(), ExecutionState::Complete);

    interpreter.reset();
    assert_eq!(interpreter.state(), ExecutionState::Idle);
    assert_eq!(interpreter.stats().commands_emitted, 0);
    assert_eq!(interpreter.stats().loop_iterations, 0);

    commands.borrow_mut().clear();
    interpreter.start();
    let second: Vec<String> =
        commands.borrow().iter().map(Command::to_json).collect();
    assert_eq!(first, second);
}

#[test]
fn test_async_mode_returns_zero_with_advisory_request() {
    let sketch = program(vec![func(
        "loop",
        "void",
        vec![
            var_decl("v", "int", Some(call("analogRead", vec![int(0)]))),
            println_of(ident("v")),
        ],
    )]);
    let opts = InterpreterOptions {
        max_loop_iterations: 1,
        sync_mode: false,
        ..InterpreterOptions::default()
    };
    // No provider installed; async mode must not need one.
    let (interpreter, commands) = run_program(sketch, opts);
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    assert!(commands.iter().any(|c| c.kind() == "ANALOG_READ_REQUEST"));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["0"]);
}

#[test]
fn test_integer_overflow_wraps() {
    let sketch = program(vec![func(
        "setup",
        "void",
        vec![println_of(binop(OpCode::Add, int(i32::MAX), int(1)))],
    )]);
    let (_, commands) = run_program(sketch, options(0));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, [&i32::MIN.to_string()]);
}

#[test]
fn test_string_concat_with_empty_operands() {
    let concat = binop(
        OpCode::Add,
        binop(OpCode::Add, string("foo"), string("")),
        string("bar"),
    );
    let sketch = program(vec![func("setup", "void", vec![println_of(concat)])]);
    let (_, commands) = run_program(sketch, options(0));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["foobar"]);
}

#[test]
fn test_deeply_nested_ternary() {
    // cond ? (cond ? ... 32 levels ... : 0) : 0, all conditions true.
    let mut expr = int(42);
    for _ in 0..32 {
        expr = AstNode::new(NodeTag::Ternary)
            .with_child(boolean(true))
            .with_child(expr)
            .with_child(int(0));
    }
    let sketch = program(vec![func("setup", "void", vec![println_of(expr)])]);
    let (interpreter, commands) = run_program(sketch, options(0));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["42"]);
}

#[test]
fn test_ternary_short_circuits_unselected_arm() {
    // false ? analogRead(0) : 7 — the read must not emit a request.
    let expr = AstNode::new(NodeTag::Ternary)
        .with_child(boolean(false))
        .with_child(call("analogRead", vec![int(0)]))
        .with_child(int(7));
    let sketch = program(vec![func("setup", "void", vec![println_of(expr)])]);
    let (_, commands) = run_program(sketch, options(0));
    assert!(commands.iter().all(|c| c.kind() != "ANALOG_READ_REQUEST"));
}

#[test]
fn test_switch_falls_through_until_break() {
    let case = |value: i32, text: &str| {
        AstNode::new(NodeTag::Case)
            .with_child(int(value))
            .with_child(println_of(string(text)))
    };
    let case_with_break = AstNode::new(NodeTag::Case)
        .with_child(int(3))
        .with_child(println_of(string("three")))
        .with_child(AstNode::new(NodeTag::Break));
    let switch = AstNode::new(NodeTag::Switch)
        .with_child(int(2))
        .with_child(case(1, "one"))
        .with_child(case(2, "two"))
        .with_child(case_with_break)
        .with_child(
            AstNode::new(NodeTag::Default)
                .with_child(println_of(string("default"))),
        );
    let sketch = program(vec![func("setup", "void", vec![switch])]);
    let (_, commands) = run_program(sketch, options(0));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["two", "three"]);
}

#[test]
fn test_for_loop_accumulates() {
    // int total = 0; for (int i = 1; i <= 4; i = i + 1) total += i;
    let for_node = AstNode::new(NodeTag::For)
        .with_child(var_decl("i", "int", Some(int(1))))
        .with_child(binop(OpCode::Le, ident("i"), int(4)))
        .with_child(assign(ident("i"), binop(OpCode::Add, ident("i"), int(1))))
        .with_child(
            AstNode::new(NodeTag::Compound).with_child(expr_stmt(
                AstNode::new(NodeTag::CompoundAssign)
                    .with_op(OpCode::AddAssign)
                    .with_child(ident("total"))
                    .with_child(ident("i")),
            )),
        );
    let sketch = program(vec![func(
        "setup",
        "void",
        vec![
            var_decl("total", "int", Some(int(0))),
            for_node,
            println_of(ident("total")),
        ],
    )]);
    let (_, commands) = run_program(sketch, options(10));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["10"]);
}

#[test]
fn test_inner_loop_hitting_ceiling_terminates_cleanly() {
    // while (true) {} inside setup: ends the whole run as a clean
    // loop-limit termination, not an error.
    let while_node = AstNode::new(NodeTag::While)
        .with_child(boolean(true))
        .with_child(AstNode::new(NodeTag::Compound));
    let sketch = program(vec![func("setup", "void", vec![while_node])]);
    let (interpreter, commands) = run_program(sketch, options(5));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    match commands.last() {
        Some(Command::ProgramEnd { reason, .. }) => {
            assert_eq!(reason, "loop_limit")
        }
        other => panic!("expected PROGRAM_END, got {:?}", other),
    }
}

#[test]
fn test_chained_assignment_returns_assigned_value() {
    // int a; int b; a = b = 9; println(a + b);
    let sketch = program(vec![func(
        "setup",
        "void",
        vec![
            var_decl("a", "int", None),
            var_decl("b", "int", None),
            expr_stmt(assign(ident("a"), assign(ident("b"), int(9)))),
            println_of(binop(OpCode::Add, ident("a"), ident("b"))),
        ],
    )]);
    let (_, commands) = run_program(sketch, options(0));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["18"]);
}

#[test]
fn test_function_pointer_resolves_at_call_time() {
    // int seven() { return 7; }
    // setup() { int (*fp)() = seven; Serial.println(fp()); }
    let sketch = program(vec![
        func("seven", "int", vec![ret(Some(int(7)))]),
        func(
            "setup",
            "void",
            vec![
                var_decl("fp", "int (*)()", Some(ident("seven"))),
                println_of(AstNode::new(NodeTag::FunctionCall).with_child(
                    ident("fp"),
                )),
            ],
        ),
    ]);
    let (interpreter, commands) = run_program(sketch, options(0));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["7"]);
}

#[test]
fn test_double_division_by_zero_is_infinite_not_fatal() {
    let sketch = program(vec![func(
        "setup",
        "void",
        vec![println_of(binop(OpCode::Div, dbl(1.0), dbl(0.0)))],
    )]);
    let (interpreter, commands) = run_program(sketch, options(0));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["inf"]);
}

#[test]
fn test_step_runs_one_unit_at_a_time() {
    let mut interpreter = Interpreter::from_ast(blink(), options(2));
    let commands = attach_collector(&mut interpreter);

    // First step: globals and setup.
    interpreter.step();
    assert_eq!(interpreter.state(), ExecutionState::Paused);
    assert_eq!(
        kinds(&commands.borrow()),
        vec!["VERSION_INFO", "PROGRAM_START", "SETUP_START", "PIN_MODE",
             "SETUP_END"],
    );

    // One loop iteration per further step.
    interpreter.step();
    assert_eq!(interpreter.state(), ExecutionState::Paused);
    assert_eq!(interpreter.stats().loop_iterations, 1);

    interpreter.step();
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    assert_eq!(interpreter.stats().loop_iterations, 2);
    let borrowed = commands.borrow();
    match borrowed.last() {
        Some(Command::ProgramEnd { reason, .. }) => {
            assert_eq!(reason, "loop_limit")
        }
        other => panic!("expected PROGRAM_END, got {:?}", other),
    }
}

#[test]
fn test_scope_depth_restored_after_calls() {
    let sketch = program(vec![
        func_with_params(
            "noisy",
            "int",
            vec![("x", "int")],
            vec![
                var_decl("local", "int", Some(int(1))),
                ret(Some(binop(OpCode::Add, ident("x"), ident("local")))),
            ],
        ),
        func(
            "loop",
            "void",
            vec![println_of(call("noisy", vec![int(1)]))],
        ),
    ]);
    let (interpreter, _) = run_program(sketch, options(3));
    assert_eq!(interpreter.state(), ExecutionState::Complete);
    // Function frames push and pop symmetrically across iterations.
    assert!(interpreter.stats().peak_scope_depth >= 3);
    // Three `loop()` invocations plus three `noisy()` calls.
    assert_eq!(interpreter.stats().functions_called, 6);
}

#[test]
fn test_tracer_records_only_when_verbose() {
    let opts = InterpreterOptions {
        max_loop_iterations: 1,
        verbose: true,
        ..InterpreterOptions::default()
    };
    let (interpreter, _) = run_program(blink(), opts);
    assert!(!interpreter.tracer().is_empty());

    let (quiet, _) = run_program(blink(), options(1));
    assert!(quiet.tracer().is_empty());
}

#[test]
fn test_global_variables_persist_across_iterations() {
    // int n = 0; loop() { n = n + 1; Serial.println(n); }
    let sketch = program(vec![
        var_decl("n", "int", Some(int(0))),
        func(
            "loop",
            "void",
            vec![
                expr_stmt(assign(
                    ident("n"),
                    binop(OpCode::Add, ident("n"), int(1)),
                )),
                println_of(ident("n")),
            ],
        ),
    ]);
    let (_, commands) = run_program(sketch, options(3));
    let printed: Vec<&String> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SerialPrintln { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(printed, ["1", "2", "3"]);
}
