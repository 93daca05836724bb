//! Core implementation of the ardlk interpreter. The main usage of this
//! crate is to decode an Arduino sketch compiled to the CompactAST binary
//! format and execute it, emitting one [Command] per observable action
//! through a host callback and resolving external world-reads (pins,
//! timers, sensors) through a host-supplied [SyncDataProvider].
//!
//! ```
//! use ardlk::{
//!     AstNode, Interpreter, InterpreterOptions, LiteralValue, NodeTag,
//! };
//!
//! // Build a tiny sketch by hand: void loop() { delay(100); }
//! let call = AstNode::new(NodeTag::FunctionCall)
//!     .with_child(AstNode::new(NodeTag::Identifier).with_name("delay"))
//!     .with_child(
//!         AstNode::new(NodeTag::IntLiteral)
//!             .with_value(LiteralValue::Int(100)),
//!     );
//! let body = AstNode::new(NodeTag::Compound)
//!     .with_child(AstNode::new(NodeTag::ExpressionStmt).with_child(call));
//! let program = AstNode::new(NodeTag::Program).with_child(
//!     AstNode::new(NodeTag::FuncDef)
//!         .with_name("loop")
//!         .with_type_name("void")
//!         .with_child(body),
//! );
//!
//! // Run it for a single loop iteration.
//! let options = InterpreterOptions {
//!     max_loop_iterations: 1,
//!     ..InterpreterOptions::default()
//! };
//! let mut interpreter = Interpreter::from_ast(program, options);
//! interpreter.start();
//! assert_eq!(interpreter.stats().loop_iterations, 1);
//! ```

#![deny(clippy::all)]

pub mod ast;
mod command;
mod compact;
mod consts;
pub mod error;
mod library;
mod machine;
mod models;
mod provider;
mod scope;
mod tracer;
mod util;
mod value;

pub use ast::{AstNode, LiteralValue, NodeFlags, NodeTag, OpCode};
pub use command::{Command, CommandCallback};
pub use compact::{decode, encode};
pub use consts::{
    DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_LOOP_ITERATIONS,
    DEFAULT_MEMORY_LIMIT,
};
pub use machine::Interpreter;
pub use models::{ExecutionState, ExecutionStats, InterpreterOptions};
pub use provider::SyncDataProvider;
pub use scope::{ScopeManager, Variable};
pub use tracer::{ExecutionTracer, TraceEvent, TraceKind};
pub use value::{
    ArrayValue, FunctionPointer, NumericPair, PointerTarget, PointerValue,
    StructValue, Value,
};
