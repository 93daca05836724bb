//! Shared helpers for the integration tests: AST builders producing the
//! same shapes the decoder materializes, a command collector, and a
//! scripted data provider.

#![allow(dead_code)]

use ardlk::{
    AstNode, Command, Interpreter, LiteralValue, NodeTag, OpCode,
    SyncDataProvider,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub fn program(children: Vec<AstNode>) -> AstNode {
    AstNode::new(NodeTag::Program).with_children(children)
}

pub fn func(name: &str, ret: &str, body: Vec<AstNode>) -> AstNode {
    AstNode::new(NodeTag::FuncDef)
        .with_name(name)
        .with_type_name(ret)
        .with_child(AstNode::new(NodeTag::Compound).with_children(body))
}

pub fn func_with_params(
    name: &str,
    ret: &str,
    params: Vec<(&str, &str)>,
    body: Vec<AstNode>,
) -> AstNode {
    let mut node = AstNode::new(NodeTag::FuncDef)
        .with_name(name)
        .with_type_name(ret);
    for (param_name, param_type) in params {
        node = node.with_child(
            AstNode::new(NodeTag::Param)
                .with_name(param_name)
                .with_type_name(param_type),
        );
    }
    node.with_child(AstNode::new(NodeTag::Compound).with_children(body))
}

pub fn int(value: i32) -> AstNode {
    AstNode::new(NodeTag::IntLiteral).with_value(LiteralValue::Int(value))
}

pub fn dbl(value: f64) -> AstNode {
    AstNode::new(NodeTag::FloatLiteral)
        .with_value(LiteralValue::Double(value))
}

pub fn string(value: &str) -> AstNode {
    AstNode::new(NodeTag::StringLiteral)
        .with_value(LiteralValue::Str(value.to_string()))
}

pub fn boolean(value: bool) -> AstNode {
    AstNode::new(NodeTag::BoolLiteral).with_value(LiteralValue::Bool(value))
}

pub fn ident(name: &str) -> AstNode {
    AstNode::new(NodeTag::Identifier).with_name(name)
}

pub fn expr_stmt(expr: AstNode) -> AstNode {
    AstNode::new(NodeTag::ExpressionStmt).with_child(expr)
}

pub fn call(name: &str, args: Vec<AstNode>) -> AstNode {
    AstNode::new(NodeTag::FunctionCall)
        .with_child(ident(name))
        .with_children(args)
}

/// `object.method(args)`
pub fn method_call(object: &str, method: &str, args: Vec<AstNode>) -> AstNode {
    AstNode::new(NodeTag::FunctionCall)
        .with_child(
            AstNode::new(NodeTag::MemberAccess)
                .with_name(method)
                .with_child(ident(object)),
        )
        .with_children(args)
}

pub fn println_of(expr: AstNode) -> AstNode {
    expr_stmt(
        AstNode::new(NodeTag::FunctionCall)
            .with_child(
                AstNode::new(NodeTag::MemberAccess)
                    .with_name("println")
                    .with_child(ident("Serial")),
            )
            .with_child(expr),
    )
}

pub fn var_decl(name: &str, type_name: &str, init: Option<AstNode>) -> AstNode {
    let node = AstNode::new(NodeTag::VarDecl)
        .with_name(name)
        .with_type_name(type_name);
    match init {
        Some(init) => node.with_child(init),
        None => node,
    }
}

/// `type name[len] = {items}` (the dimension is carried by the
/// initializer when `len` is None)
pub fn array_decl(
    name: &str,
    type_name: &str,
    len: Option<i32>,
    items: Option<Vec<AstNode>>,
) -> AstNode {
    let mut node = AstNode::new(NodeTag::VarDecl)
        .with_name(name)
        .with_type_name(type_name);
    let dim = AstNode::new(NodeTag::ArrayDim);
    node = node.with_child(match len {
        Some(len) => dim.with_child(int(len)),
        None => dim,
    });
    if let Some(items) = items {
        node = node
            .with_child(AstNode::new(NodeTag::ArrayInit).with_children(items));
    }
    node
}

pub fn binop(op: OpCode, lhs: AstNode, rhs: AstNode) -> AstNode {
    AstNode::new(NodeTag::BinaryOp)
        .with_op(op)
        .with_child(lhs)
        .with_child(rhs)
}

pub fn assign(target: AstNode, value: AstNode) -> AstNode {
    AstNode::new(NodeTag::Assign)
        .with_child(target)
        .with_child(value)
}

pub fn ret(value: Option<AstNode>) -> AstNode {
    let node = AstNode::new(NodeTag::Return);
    match value {
        Some(value) => node.with_child(value),
        None => node,
    }
}

/// Collects every emitted command into a shared vector.
pub fn attach_collector(
    interpreter: &mut Interpreter,
) -> Rc<RefCell<Vec<Command>>> {
    let commands = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&commands);
    interpreter.set_command_callback(Box::new(move |cmd| {
        sink.borrow_mut().push(cmd.clone());
    }));
    commands
}

/// The `type` strings of a command slice, for sequence assertions.
pub fn kinds(commands: &[Command]) -> Vec<&'static str> {
    commands.iter().map(Command::kind).collect()
}

/// A provider answering from fixed queues; exhausted queues answer 0.
#[derive(Debug, Default)]
pub struct TestProvider {
    pub analog: VecDeque<i32>,
    pub digital: VecDeque<i32>,
    pub millis: VecDeque<u32>,
    pub micros: VecDeque<u32>,
    pub pulse: VecDeque<u32>,
    pub sensor: VecDeque<i32>,
}

impl TestProvider {
    pub fn with_analog(values: Vec<i32>) -> Self {
        Self {
            analog: values.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl SyncDataProvider for TestProvider {
    fn analog_read(&mut self, _pin: i32) -> i32 {
        self.analog.pop_front().unwrap_or(0)
    }

    fn digital_read(&mut self, _pin: i32) -> i32 {
        self.digital.pop_front().unwrap_or(0)
    }

    fn millis(&mut self) -> u32 {
        self.millis.pop_front().unwrap_or(0)
    }

    fn micros(&mut self) -> u32 {
        self.micros.pop_front().unwrap_or(0)
    }

    fn pulse_in(&mut self, _pin: i32, _state: i32, _timeout_us: u32) -> u32 {
        self.pulse.pop_front().unwrap_or(0)
    }

    fn library_sensor(
        &mut self,
        _library: &str,
        _method: &str,
        _arg: i32,
    ) -> i32 {
        self.sensor.pop_front().unwrap_or(0)
    }
}
