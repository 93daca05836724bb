//! The runtime value model. Every operand, variable and command payload in
//! the interpreter is a [Value]: a single tagged union covering the scalar
//! types, the flat array types, and the shared (reference-counted,
//! interior-mutable) composites. Mutating a shared struct, array or string
//! through any alias is visible through every alias.

use crate::error::RuntimeError;
use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

/// Value type for variables, expression results and command payloads.
#[derive(Clone, Debug)]
pub enum Value {
    /// No value (void function results, uninitialized slots)
    Void,
    Bool(bool),
    /// 32-bit signed integer; the default numeric type
    Int(i32),
    /// 32-bit unsigned integer (`unsigned int/long`, `millis()`/`micros()`)
    UInt(u32),
    Double(f64),
    Str(String),
    /// Flat 1-D arrays with value semantics
    IntVec(Vec<i32>),
    DoubleVec(Vec<f64>),
    StrVec(Vec<String>),
    /// Flat 2-D arrays with value semantics
    IntMat(Vec<Vec<i32>>),
    DoubleMat(Vec<Vec<f64>>),
    /// First-class function pointer; resolved by name at call time
    Function(FunctionPointer),
    /// Shared struct instance
    Struct(Rc<RefCell<StructValue>>),
    /// Shared pointer; dereferenced through the scope manager
    Pointer(Rc<RefCell<PointerValue>>),
    /// Shared array of arbitrary element values
    Array(Rc<RefCell<ArrayValue>>),
    /// Shared mutable string
    SharedStr(Rc<RefCell<String>>),
}

/// A function pointer holds the function's symbolic name plus an opaque id.
/// It does not capture frames; the name is resolved when invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionPointer {
    pub name: String,
    pub id: u32,
}

/// A struct instance: type name plus fields in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct StructValue {
    pub type_name: String,
    fields: Vec<(String, Value)>,
}

impl StructValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn push_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Sets a field, appending it if the struct doesn't have it yet.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
}

/// A shared array: element type string plus the items.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
    pub elem_type: String,
    pub items: Vec<Value>,
}

/// Where a pointer points. Targets are symbolic (frame + name), never raw
/// references, so pointer graphs cannot create ownership cycles.
#[derive(Clone, Debug, PartialEq)]
pub enum PointerTarget {
    /// A named variable in a specific scope frame
    Variable { frame: usize, name: String },
    /// One element of a named array variable
    Element {
        frame: usize,
        name: String,
        index: usize,
    },
}

/// A pointer value: an optional target plus the pointed-to type. A pointer
/// with no target is null; dereferencing it (or a target whose frame or
/// name no longer resolves) is a [RuntimeError::NullDereference].
#[derive(Clone, Debug, PartialEq)]
pub struct PointerValue {
    pub target: Option<PointerTarget>,
    pub pointed_type: String,
}

impl PointerValue {
    pub fn null(pointed_type: impl Into<String>) -> Self {
        Self {
            target: None,
            pointed_type: pointed_type.into(),
        }
    }
}

/// The result of promoting two numeric operands to their common type:
/// the wider of int32/double, with uint32 only surviving when both sides
/// are unsigned.
pub enum NumericPair {
    Int(i32, i32),
    UInt(u32, u32),
    Double(f64, f64),
}

impl Value {
    /// Truthiness: zero, empty string and void are false, everything else
    /// is true. Null pointers are false, non-null pointers true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Void => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Double(d) => *d != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::SharedStr(s) => !s.borrow().is_empty(),
            Value::Pointer(p) => p.borrow().target.is_some(),
            _ => true,
        }
    }

    /// Coerce to a 32-bit signed integer. Unsigned and floating values wrap
    /// and truncate respectively; non-numeric values are a type error.
    pub fn as_i32(&self) -> Result<i32, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b as i32),
            Value::Int(i) => Ok(*i),
            Value::UInt(u) => Ok(*u as i32),
            Value::Double(d) => Ok(*d as i32),
            other => Err(RuntimeError::TypeError(format!(
                "expected a number, got {}",
                other.type_label()
            ))),
        }
    }

    /// Coerce to a 32-bit unsigned integer (wrapping for negatives).
    pub fn as_u32(&self) -> Result<u32, RuntimeError> {
        match self {
            Value::UInt(u) => Ok(*u),
            other => other.as_i32().map(|i| i as u32),
        }
    }

    /// Coerce to a double.
    pub fn as_f64(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b as i32 as f64),
            Value::Int(i) => Ok(*i as f64),
            Value::UInt(u) => Ok(*u as f64),
            Value::Double(d) => Ok(*d),
            other => Err(RuntimeError::TypeError(format!(
                "expected a number, got {}",
                other.type_label()
            ))),
        }
    }

    /// True for the numeric scalars (bool included, following C).
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Bool(_) | Value::Int(_) | Value::UInt(_) | Value::Double(_)
        )
    }

    /// A short label for error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "unsigned int",
            Value::Double(_) => "double",
            Value::Str(_) | Value::SharedStr(_) => "String",
            Value::IntVec(_) | Value::IntMat(_) => "int[]",
            Value::DoubleVec(_) | Value::DoubleMat(_) => "double[]",
            Value::StrVec(_) => "String[]",
            Value::Function(_) => "function pointer",
            Value::Struct(_) => "struct",
            Value::Pointer(_) => "pointer",
            Value::Array(_) => "array",
        }
    }

    /// Approximate heap footprint in bytes, used for the memory ceiling.
    pub fn footprint(&self) -> usize {
        const BASE: usize = 16;
        BASE + match self {
            Value::Str(s) => s.len(),
            Value::SharedStr(s) => s.borrow().len(),
            Value::IntVec(v) => v.len() * 4,
            Value::DoubleVec(v) => v.len() * 8,
            Value::StrVec(v) => v.iter().map(|s| s.len() + 24).sum(),
            Value::IntMat(m) => m.iter().map(|r| r.len() * 4 + 24).sum(),
            Value::DoubleMat(m) => m.iter().map(|r| r.len() * 8 + 24).sum(),
            Value::Function(f) => f.name.len(),
            Value::Struct(s) => s
                .borrow()
                .fields()
                .iter()
                .map(|(n, v)| n.len() + v.footprint())
                .sum(),
            Value::Array(a) => {
                a.borrow().items.iter().map(Value::footprint).sum()
            }
            Value::Pointer(_) => 32,
            _ => 0,
        }
    }

    /// Promote two numeric operands to their common arithmetic type.
    pub fn promote(a: &Value, b: &Value) -> Result<NumericPair, RuntimeError> {
        match (a, b) {
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                Ok(NumericPair::Double(a.as_f64()?, b.as_f64()?))
            }
            (Value::UInt(x), Value::UInt(y)) => Ok(NumericPair::UInt(*x, *y)),
            _ => Ok(NumericPair::Int(a.as_i32()?, b.as_i32()?)),
        }
    }
}

/// Render a double the way the reference command stream does: up to six
/// fractional digits, trailing zeros trimmed, integral values without a
/// decimal point.
fn fmt_double(f: &mut Formatter<'_>, d: f64) -> fmt::Result {
    if d.is_nan() {
        return write!(f, "nan");
    }
    if d.is_infinite() {
        return write!(f, "{}", if d < 0.0 { "-inf" } else { "inf" });
    }
    if d == d.trunc() && d.abs() < 1e15 {
        return write!(f, "{}", d as i64);
    }
    let s = format!("{:.6}", d);
    write!(f, "{}", s.trim_end_matches('0').trim_end_matches('.'))
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => Ok(()),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Double(d) => fmt_double(f, *d),
            Value::Str(s) => write!(f, "{}", s),
            Value::SharedStr(s) => write!(f, "{}", s.borrow()),
            Value::IntVec(v) => {
                let parts: Vec<String> =
                    v.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::DoubleVec(v) => {
                let parts: Vec<String> =
                    v.iter().map(|d| Value::Double(*d).to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::StrVec(v) => write!(f, "[{}]", v.join(", ")),
            Value::IntMat(m) => {
                let rows: Vec<String> = m
                    .iter()
                    .map(|r| Value::IntVec(r.clone()).to_string())
                    .collect();
                write!(f, "[{}]", rows.join(", "))
            }
            Value::DoubleMat(m) => {
                let rows: Vec<String> = m
                    .iter()
                    .map(|r| Value::DoubleVec(r.clone()).to_string())
                    .collect();
                write!(f, "[{}]", rows.join(", "))
            }
            Value::Function(fp) => write!(f, "{}", fp.name),
            Value::Struct(s) => {
                let s = s.borrow();
                let parts: Vec<String> = s
                    .fields()
                    .iter()
                    .map(|(n, v)| format!("{}: {}", n, v))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Pointer(p) => match &p.borrow().target {
                Some(_) => write!(f, "<pointer>"),
                None => write!(f, "<null>"),
            },
            Value::Array(a) => {
                let a = a.borrow();
                let parts: Vec<String> =
                    a.items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Structural equality for `==`/`!=`: numeric operands compare after
/// promotion, strings compare by content, shared composites by content.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::SharedStr(a), Value::Str(b)) => *a.borrow() == *b,
            (Value::Str(a), Value::SharedStr(b)) => *a == *b.borrow(),
            (Value::SharedStr(a), Value::SharedStr(b)) => {
                *a.borrow() == *b.borrow()
            }
            (Value::IntVec(a), Value::IntVec(b)) => a == b,
            (Value::DoubleVec(a), Value::DoubleVec(b)) => a == b,
            (Value::StrVec(a), Value::StrVec(b)) => a == b,
            (Value::IntMat(a), Value::IntMat(b)) => a == b,
            (Value::DoubleMat(a), Value::DoubleMat(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => *a.borrow() == *b.borrow(),
            (Value::Array(a), Value::Array(b)) => *a.borrow() == *b.borrow(),
            (Value::Pointer(a), Value::Pointer(b)) => {
                *a.borrow() == *b.borrow()
            }
            (a, b) if a.is_numeric() && b.is_numeric() => {
                match Value::promote(a, b) {
                    Ok(NumericPair::Int(x, y)) => x == y,
                    Ok(NumericPair::UInt(x, y)) => x == y,
                    Ok(NumericPair::Double(x, y)) => x == y,
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}
