//! All the different types that can appear in a decoded CompactAST tree.
//! There is no functionality implemented here, just basic types: the node
//! record, the closed tag set, operator codes, literal payloads and the node
//! flag bits. The tree is immutable once decoded; the interpreter walks it
//! by matching on [NodeTag].

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

/// The closed set of node kinds, with their stable wire discriminants.
/// Decoding rejects any byte outside this set.
///
/// Child conventions (positional, in decode order):
/// - `Program`: top-level declarations and definitions
/// - `FuncDef`: zero or more `Param` children, then the `Compound` body
/// - `Param`: carries `name` and `type_name`; no children
/// - `VarDecl`: optional `ArrayDim` children (one per dimension, each
///   holding the size expression), then an optional initializer
/// - `If`: condition, then-branch, optional else-branch
/// - `While`: condition, body. `DoWhile`: body, condition
/// - `For`: init, condition, update, body (absent parts are `EmptyStmt`)
/// - `Switch`: discriminant, then `Case`/`Default` children in source order
/// - `Case`: match expression, then its statements. `Default`: statements
/// - `Return`: optional value expression
/// - `BinaryOp`/`CompoundAssign`: lhs, rhs (operator in `op`)
/// - `UnaryOp`/`PostfixOp`: single operand (operator in `op`)
/// - `Assign`: lhs, rhs. `Ternary`: condition, then, else
/// - `FunctionCall`: callee (`Identifier` or `MemberAccess`), then arguments
/// - `MemberAccess`: object expression; member name in `name`; the
///   [NodeFlags::ARROW] flag marks `->` access
/// - `ArrayAccess`: array expression, index expression
/// - `Cast`: operand (target type in `type_name`)
/// - `Sizeof`: operand expression, or none with `type_name` set
/// - `AddressOf`/`Dereference`: single operand
/// - `ArrayInit`/`StructInit`: element/field initializers in order
/// - `StructDef`: one `VarDecl` per field. `EnumDef`: `EnumMember` children
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeTag {
    // Top level
    Program = 0x01,
    Comment = 0x02,

    // Statements
    Compound = 0x10,
    ExpressionStmt = 0x11,
    If = 0x12,
    Switch = 0x13,
    Case = 0x14,
    Default = 0x15,
    While = 0x16,
    DoWhile = 0x17,
    For = 0x18,
    RangeFor = 0x19,
    Break = 0x1A,
    Continue = 0x1B,
    Return = 0x1C,
    EmptyStmt = 0x1D,

    // Declarations
    FuncDef = 0x20,
    FuncDecl = 0x21,
    Param = 0x22,
    VarDecl = 0x23,
    ArrayDim = 0x24,
    TypeName = 0x25,
    StructDef = 0x26,
    StructDecl = 0x27,
    EnumDef = 0x28,
    EnumMember = 0x29,
    Typedef = 0x2A,
    UnionDef = 0x2B,
    TemplateDecl = 0x2C,
    NamespaceDecl = 0x2D,
    UsingDecl = 0x2E,
    ConstructorCall = 0x2F,

    // Literals and primary expressions
    IntLiteral = 0x30,
    FloatLiteral = 0x31,
    BoolLiteral = 0x32,
    CharLiteral = 0x33,
    StringLiteral = 0x34,
    Identifier = 0x35,
    ArrayInit = 0x36,
    StructInit = 0x37,
    NullLiteral = 0x38,

    // Expressions
    BinaryOp = 0x40,
    UnaryOp = 0x41,
    PostfixOp = 0x42,
    Assign = 0x43,
    CompoundAssign = 0x44,
    Ternary = 0x45,
    FunctionCall = 0x46,
    MemberAccess = 0x47,
    ArrayAccess = 0x48,
    Cast = 0x49,
    Sizeof = 0x4A,
    AddressOf = 0x4B,
    Dereference = 0x4C,
    CommaExpr = 0x4D,
    FunctionStyleCast = 0x4E,

    // Preprocessor directives that survive to the AST
    PreprocDefine = 0x50,
    PreprocInclude = 0x51,
    PreprocIfdef = 0x52,
    PreprocUndef = 0x53,
    PreprocPragma = 0x54,
}

/// Operator codes shared by `BinaryOp`, `UnaryOp`, `PostfixOp` and
/// `CompoundAssign` nodes, with their stable wire discriminants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // Binary arithmetic / comparison / logic / bitwise
    Add = 0x01,
    Sub = 0x02,
    Mul = 0x03,
    Div = 0x04,
    Mod = 0x05,
    Eq = 0x06,
    Ne = 0x07,
    Lt = 0x08,
    Le = 0x09,
    Gt = 0x0A,
    Ge = 0x0B,
    LogicalAnd = 0x0C,
    LogicalOr = 0x0D,
    BitAnd = 0x0E,
    BitOr = 0x0F,
    BitXor = 0x10,
    Shl = 0x11,
    Shr = 0x12,

    // Compound assignment (the read-modify-write op is the suffix)
    AddAssign = 0x21,
    SubAssign = 0x22,
    MulAssign = 0x23,
    DivAssign = 0x24,
    ModAssign = 0x25,
    AndAssign = 0x26,
    OrAssign = 0x27,
    XorAssign = 0x28,
    ShlAssign = 0x29,
    ShrAssign = 0x2A,

    // Unary / postfix
    Plus = 0x30,
    Neg = 0x31,
    Not = 0x32,
    BitNot = 0x33,
    PreInc = 0x34,
    PreDec = 0x35,
    PostInc = 0x36,
    PostDec = 0x37,
}

impl OpCode {
    /// For a compound-assignment code, the underlying binary op.
    pub fn base_op(self) -> Option<OpCode> {
        Some(match self {
            Self::AddAssign => Self::Add,
            Self::SubAssign => Self::Sub,
            Self::MulAssign => Self::Mul,
            Self::DivAssign => Self::Div,
            Self::ModAssign => Self::Mod,
            Self::AndAssign => Self::BitAnd,
            Self::OrAssign => Self::BitOr,
            Self::XorAssign => Self::BitXor,
            Self::ShlAssign => Self::Shl,
            Self::ShrAssign => Self::Shr,
            _ => return None,
        })
    }
}

/// A typed literal payload attached to a node.
#[derive(Clone, Debug, PartialEq)]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Int(i32),
    UInt(u32),
    Double(f64),
    Str(String),
    Char(u8),
}

bitflags! {
    /// Per-node semantic flag byte.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        /// `MemberAccess` through `->` rather than `.`
        const ARROW = 1 << 0;
        /// Declaration is `const`
        const CONST = 1 << 1;
        /// Declaration is a reference (`int&`)
        const REFERENCE = 1 << 2;
        /// Declaration binds in the global frame regardless of nesting
        const GLOBAL = 1 << 3;
        /// Declared type is unsigned
        const UNSIGNED = 1 << 4;
        /// Declaration is `static`
        const STATIC = 1 << 5;
    }
}

/// One node of the decoded tree: a tag, ordered children, and the optional
/// attributes the compact format can attach. Immutable after decode.
#[derive(Clone, Debug, PartialEq)]
pub struct AstNode {
    pub tag: NodeTag,
    pub children: Vec<AstNode>,
    pub value: Option<LiteralValue>,
    pub name: Option<String>,
    pub type_name: Option<String>,
    pub op: Option<OpCode>,
    pub flags: NodeFlags,
    /// Byte offset of this node in the node table it was decoded from.
    /// Zero for programmatically built trees. Used for error reporting only.
    pub offset: u32,
}

impl AstNode {
    pub fn new(tag: NodeTag) -> Self {
        Self {
            tag,
            children: Vec::new(),
            value: None,
            name: None,
            type_name: None,
            op: None,
            flags: NodeFlags::empty(),
            offset: 0,
        }
    }

    pub fn with_child(mut self, child: AstNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<AstNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_value(mut self, value: LiteralValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_op(mut self, op: OpCode) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The node's name attribute, or an empty string.
    pub fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// The node's declared-type attribute, or an empty string.
    pub fn type_str(&self) -> &str {
        self.type_name.as_deref().unwrap_or("")
    }
}
