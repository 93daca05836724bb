//! All error-related ardlk types.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// A structural error found while decoding a CompactAST blob. The error is
/// due to a flaw in the input; decoder bugs will always cause a panic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[error("{kind} at byte {offset}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// Absolute byte offset into the blob where decoding failed.
    pub offset: usize,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

/// The category of a [DecodeError].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DecodeErrorKind {
    /// The blob doesn't start with the CompactAST magic bytes
    BadMagic,
    /// The header declares a format version this crate doesn't support
    UnsupportedVersion,
    /// The blob ended before a read completed
    Truncated,
    /// A child offset points outside the node table (or forms a cycle)
    BadOffset,
    /// A string index points outside the string table
    BadStringIndex,
    /// An unknown node tag or operator code
    BadTag,
    /// An unknown literal kind, or a literal payload that doesn't decode
    BadLiteral,
}

impl Display for DecodeErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadMagic => "bad magic",
            Self::UnsupportedVersion => "unsupported format version",
            Self::Truncated => "truncated input",
            Self::BadOffset => "child offset out of bounds",
            Self::BadStringIndex => "string index out of bounds",
            Self::BadTag => "unknown tag",
            Self::BadLiteral => "bad literal",
        };
        write!(f, "{}", msg)
    }
}

/// An error that occurs during execution of a program. The error is due to a
/// flaw in the interpreted sketch, _not_ a bug in the interpreter.
/// Interpreter bugs will always panic.
///
/// A fatal runtime error unwinds every active frame, emits a single `ERROR`
/// command and leaves the interpreter in the `Error` state. The loop-limit
/// termination is deliberately *not* represented here: it is a clean
/// completion, carried by a separate internal signal.
#[derive(Clone, Debug, PartialEq, Error, Serialize)]
pub enum RuntimeError {
    /// An operand had a type the operation cannot accept
    #[error("type mismatch: {0}")]
    TypeError(String),
    /// Referenced an identifier that isn't declared, or redeclared one that is
    #[error("{0}")]
    NameError(String),
    /// Assigned to a variable declared `const`
    #[error("cannot assign to const `{0}`")]
    ConstViolation(String),
    /// Indexed an array outside its bounds
    #[error("index {index} out of range for `{name}` (length {len})")]
    IndexOutOfRange {
        name: String,
        index: i64,
        len: usize,
    },
    /// Dereferenced a null or dangling pointer
    #[error("null pointer dereference")]
    NullDereference,
    /// Integer division or modulo by zero (doubles produce inf/NaN instead)
    #[error("integer division by zero")]
    DivideByZero,
    /// User-function recursion exceeded the configured call depth
    #[error("call depth exceeded the configured maximum of {0}")]
    StackOverflow(usize),
    /// Called something that is neither a library function nor user-defined
    #[error("undefined function `{0}`")]
    UndefinedFunction(String),
    /// An external read was attempted with no sync data provider installed
    #[error("no sync data provider installed")]
    MissingProvider,
    /// Total value-heap residency exceeded the configured ceiling
    #[error("memory limit exceeded: {used} of {limit} bytes")]
    MemoryLimitExceeded { used: usize, limit: usize },
    /// The command/response pairing was violated
    #[error("protocol violation: {0}")]
    ProtocolError(String),
}

impl RuntimeError {
    /// The stable kind label carried by the `ERROR` command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TypeError(_) => "TypeError",
            Self::NameError(_) => "NameError",
            Self::ConstViolation(_) => "ConstViolation",
            Self::IndexOutOfRange { .. } => "IndexOutOfRange",
            Self::NullDereference => "NullDereference",
            Self::DivideByZero => "DivideByZero",
            Self::StackOverflow(_) => "StackOverflow",
            Self::UndefinedFunction(_) => "UndefinedFunction",
            Self::MissingProvider => "MissingProvider",
            Self::MemoryLimitExceeded { .. } => "MemoryLimitExceeded",
            Self::ProtocolError(_) => "ProtocolError",
        }
    }
}
