//! Lexical scope management: an ordered stack of frames mapping names to
//! variables. Frame 0 is the global frame and is never popped. Lookup
//! searches innermost-first; declaration always binds in the top frame;
//! assignment binds in the innermost frame that already holds the name.
//!
//! The manager also owns the member/element access helpers: struct and
//! shared-array values mutate in place through their handles, while legacy
//! composite representations fall back to synthesized `name.member` /
//! `name[i]` bindings so reads observe prior writes either way. A running
//! footprint of all live values backs the soft memory ceiling.

use crate::error::RuntimeError;
use crate::value::Value;
use std::collections::HashMap;

/// One named binding: the value plus its declaration metadata.
#[derive(Clone, Debug)]
pub struct Variable {
    pub value: Value,
    /// The declared type, as spelled in the source (e.g. `"unsigned long"`)
    pub type_name: String,
    pub is_const: bool,
    pub is_reference: bool,
    /// For references: the (frame, name) this variable forwards to.
    /// References may not rebind.
    pub ref_target: Option<(usize, String)>,
}

impl Variable {
    pub fn new(value: Value, type_name: impl Into<String>) -> Self {
        Self {
            value,
            type_name: type_name.into(),
            is_const: false,
            is_reference: false,
            ref_target: None,
        }
    }

    pub fn constant(value: Value, type_name: impl Into<String>) -> Self {
        Self {
            is_const: true,
            ..Self::new(value, type_name)
        }
    }

    pub fn reference(
        frame: usize,
        target: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            is_reference: true,
            ref_target: Some((frame, target.into())),
            ..Self::new(Value::Void, type_name)
        }
    }
}

/// The frame stack.
#[derive(Debug)]
pub struct ScopeManager {
    frames: Vec<HashMap<String, Variable>>,
    mem_used: usize,
    mem_limit: usize,
}

impl ScopeManager {
    pub fn new(mem_limit: usize) -> Self {
        Self {
            frames: vec![HashMap::new()],
            mem_used: 0,
            mem_limit,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Pops the top frame. The global frame is never popped.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            if let Some(frame) = self.frames.pop() {
                for var in frame.values() {
                    self.mem_used =
                        self.mem_used.saturating_sub(var.value.footprint());
                }
            }
        }
    }

    /// Declares `name` in the top frame. Redeclaration within the same
    /// frame is an error; shadowing an outer frame is not.
    pub fn declare(
        &mut self,
        name: &str,
        var: Variable,
    ) -> Result<(), RuntimeError> {
        let top = self.frames.len() - 1;
        self.declare_in(top, name, var)
    }

    /// Declares `name` in the global frame regardless of current nesting
    /// (the `global`-flagged declaration form).
    pub fn declare_global(
        &mut self,
        name: &str,
        var: Variable,
    ) -> Result<(), RuntimeError> {
        self.declare_in(0, name, var)
    }

    fn declare_in(
        &mut self,
        frame: usize,
        name: &str,
        var: Variable,
    ) -> Result<(), RuntimeError> {
        if self.frames[frame].contains_key(name) {
            return Err(RuntimeError::NameError(format!(
                "`{}` is already declared in this scope",
                name
            )));
        }
        self.charge(var.value.footprint())?;
        self.frames[frame].insert(name.to_string(), var);
        Ok(())
    }

    /// Seeds a built-in binding (Arduino constants) into the global frame,
    /// outside of memory accounting.
    pub(crate) fn declare_builtin(&mut self, name: &str, var: Variable) {
        self.frames[0].insert(name.to_string(), var);
    }

    /// Assigns to the innermost binding of `name`, following reference
    /// forwarding. Errors if the name is undeclared or const.
    pub fn assign(
        &mut self,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let (frame, name) = self.resolve(name)?;
        self.assign_in_frame(frame, &name, value)
    }

    /// Assigns directly into a specific frame (used by pointer writes).
    pub fn assign_in_frame(
        &mut self,
        frame: usize,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let var = self
            .frames
            .get_mut(frame)
            .and_then(|f| f.get_mut(name))
            .ok_or_else(|| {
                RuntimeError::NameError(format!(
                    "undefined identifier `{}`",
                    name
                ))
            })?;
        if var.is_const {
            return Err(RuntimeError::ConstViolation(name.to_string()));
        }
        let old = var.value.footprint();
        let new = value.footprint();
        var.value = value;
        self.mem_used = self.mem_used.saturating_sub(old);
        self.charge(new)?;
        Ok(())
    }

    /// Finds the innermost binding of `name`, following references to the
    /// concrete (frame, name) it forwards to.
    fn resolve(&self, name: &str) -> Result<(usize, String), RuntimeError> {
        let mut frame = self.frame_of(name).ok_or_else(|| {
            RuntimeError::NameError(format!("undefined identifier `{}`", name))
        })?;
        let mut name = name.to_string();
        // References bind to concrete targets, so a single hop suffices,
        // but a reference-to-reference chain is still finite.
        loop {
            let var = &self.frames[frame][&name];
            match (&var.ref_target, var.is_reference) {
                (Some((target_frame, target_name)), true) => {
                    if self
                        .frames
                        .get(*target_frame)
                        .map_or(true, |f| !f.contains_key(target_name))
                    {
                        return Err(RuntimeError::NameError(format!(
                            "undefined identifier `{}`",
                            target_name
                        )));
                    }
                    frame = *target_frame;
                    name = target_name.clone();
                }
                _ => return Ok((frame, name)),
            }
        }
    }

    /// Innermost frame index holding `name`, if any.
    pub fn frame_of(&self, name: &str) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.contains_key(name))
            .map(|(i, _)| i)
    }

    /// Looks up `name` innermost-first, following reference forwarding.
    pub fn lookup(&self, name: &str) -> Option<&Variable> {
        let (frame, name) = self.resolve(name).ok()?;
        self.frames[frame].get(&name)
    }

    /// Convenience: the current value bound to `name`.
    pub fn lookup_value(&self, name: &str) -> Option<Value> {
        self.lookup(name).map(|v| v.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frame_of(name).is_some()
    }

    /// Reads a variable out of a specific frame (pointer dereference).
    pub fn get_in_frame(&self, frame: usize, name: &str) -> Option<&Variable> {
        self.frames.get(frame).and_then(|f| f.get(name))
    }

    fn charge(&mut self, bytes: usize) -> Result<(), RuntimeError> {
        self.mem_used += bytes;
        if self.mem_used > self.mem_limit {
            Err(RuntimeError::MemoryLimitExceeded {
                used: self.mem_used,
                limit: self.mem_limit,
            })
        } else {
            Ok(())
        }
    }

    // ---- Member and element access ----

    /// Reads `object.member`. Struct values resolve through the shared
    /// handle; anything else falls back to a synthesized `object.member`
    /// binding.
    pub fn member_value(
        &self,
        object: &str,
        member: &str,
    ) -> Result<Value, RuntimeError> {
        match self.lookup_value(object) {
            Some(Value::Struct(s)) => {
                s.borrow().get(member).cloned().ok_or_else(|| {
                    RuntimeError::NameError(format!(
                        "`{}` has no member `{}`",
                        object, member
                    ))
                })
            }
            Some(_) => {
                let key = composite_member(object, member);
                self.lookup_value(&key).ok_or_else(|| {
                    RuntimeError::NameError(format!(
                        "`{}` has no member `{}`",
                        object, member
                    ))
                })
            }
            None => Err(RuntimeError::NameError(format!(
                "undefined identifier `{}`",
                object
            ))),
        }
    }

    /// Writes `object.member = value`. Mutates shared structs in place so
    /// every alias observes the write; otherwise synthesizes the composite
    /// binding in the object's frame.
    pub fn set_member(
        &mut self,
        object: &str,
        member: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let (frame, object) = self.resolve(object)?;
        let var = &self.frames[frame][&object];
        if var.is_const {
            return Err(RuntimeError::ConstViolation(object));
        }
        match &var.value {
            Value::Struct(s) => {
                s.borrow_mut().set(member, value);
                Ok(())
            }
            _ => {
                let key = composite_member(&object, member);
                if self.frames[frame].contains_key(&key) {
                    self.assign_in_frame(frame, &key, value)
                } else {
                    self.charge(value.footprint())?;
                    self.frames[frame].insert(
                        key,
                        Variable::new(value, String::new()),
                    );
                    Ok(())
                }
            }
        }
    }

    /// Reads `name[index]` with bounds checking. Handles the flat typed
    /// vectors, shared arrays, matrix rows, string bytes, and the legacy
    /// synthesized `name[i]` binding.
    pub fn element_value(
        &self,
        name: &str,
        index: usize,
    ) -> Result<Value, RuntimeError> {
        let value = self.lookup_value(name).ok_or_else(|| {
            RuntimeError::NameError(format!("undefined identifier `{}`", name))
        })?;
        match self.read_indexed(name, &value, index) {
            Err(RuntimeError::TypeError(_)) => {
                let key = composite_element(name, index);
                self.lookup_value(&key).ok_or_else(|| {
                    RuntimeError::TypeError(format!(
                        "`{}` is not an array",
                        name
                    ))
                })
            }
            other => other,
        }
    }

    fn read_indexed(
        &self,
        name: &str,
        value: &Value,
        index: usize,
    ) -> Result<Value, RuntimeError> {
        let oob = |len: usize| RuntimeError::IndexOutOfRange {
            name: name.to_string(),
            index: index as i64,
            len,
        };
        match value {
            Value::IntVec(v) => v
                .get(index)
                .map(|i| Value::Int(*i))
                .ok_or_else(|| oob(v.len())),
            Value::DoubleVec(v) => v
                .get(index)
                .map(|d| Value::Double(*d))
                .ok_or_else(|| oob(v.len())),
            Value::StrVec(v) => v
                .get(index)
                .map(|s| Value::Str(s.clone()))
                .ok_or_else(|| oob(v.len())),
            Value::IntMat(m) => m
                .get(index)
                .map(|row| Value::IntVec(row.clone()))
                .ok_or_else(|| oob(m.len())),
            Value::DoubleMat(m) => m
                .get(index)
                .map(|row| Value::DoubleVec(row.clone()))
                .ok_or_else(|| oob(m.len())),
            Value::Array(a) => {
                let a = a.borrow();
                a.items
                    .get(index)
                    .cloned()
                    .ok_or_else(|| oob(a.items.len()))
            }
            Value::Str(s) => s
                .as_bytes()
                .get(index)
                .map(|b| Value::Int(*b as i32))
                .ok_or_else(|| oob(s.len())),
            Value::SharedStr(s) => {
                let s = s.borrow();
                s.as_bytes()
                    .get(index)
                    .map(|b| Value::Int(*b as i32))
                    .ok_or_else(|| oob(s.len()))
            }
            other => Err(RuntimeError::TypeError(format!(
                "`{}` ({}) is not an array",
                name,
                other.type_label()
            ))),
        }
    }

    /// Writes `name[index] = value` with bounds checking, coercing into the
    /// array's element type.
    pub fn set_element(
        &mut self,
        name: &str,
        index: usize,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let (frame, name) = self.resolve(name)?;
        self.set_element_in_frame(frame, &name, index, value)
    }

    /// Reads one element of a variable addressed by frame (pointer
    /// dereference of an element target).
    pub fn element_value_in_frame(
        &self,
        frame: usize,
        name: &str,
        index: usize,
    ) -> Result<Value, RuntimeError> {
        match self.get_in_frame(frame, name) {
            Some(var) => {
                let value = var.value.clone();
                self.read_indexed(name, &value, index)
            }
            None => Err(RuntimeError::NullDereference),
        }
    }

    /// Writes one element of a variable addressed by frame (pointer write
    /// through an element target).
    pub fn set_element_in_frame(
        &mut self,
        frame: usize,
        name: &str,
        index: usize,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let name = name.to_string();
        let var = self
            .frames
            .get_mut(frame)
            .and_then(|f| f.get_mut(&name))
            .ok_or_else(|| {
                RuntimeError::NameError(format!(
                    "undefined identifier `{}`",
                    name
                ))
            })?;
        if var.is_const {
            return Err(RuntimeError::ConstViolation(name));
        }
        let oob = |len: usize| RuntimeError::IndexOutOfRange {
            name: name.clone(),
            index: index as i64,
            len,
        };
        match &mut var.value {
            Value::IntVec(v) => {
                let len = v.len();
                let slot = v.get_mut(index).ok_or_else(|| oob(len))?;
                *slot = value.as_i32()?;
                Ok(())
            }
            Value::DoubleVec(v) => {
                let len = v.len();
                let slot = v.get_mut(index).ok_or_else(|| oob(len))?;
                *slot = value.as_f64()?;
                Ok(())
            }
            Value::StrVec(v) => {
                let len = v.len();
                let slot = v.get_mut(index).ok_or_else(|| oob(len))?;
                *slot = value.to_string();
                Ok(())
            }
            Value::IntMat(m) => {
                let len = m.len();
                let slot = m.get_mut(index).ok_or_else(|| oob(len))?;
                match value {
                    Value::IntVec(row) => {
                        *slot = row;
                        Ok(())
                    }
                    other => Err(RuntimeError::TypeError(format!(
                        "cannot assign {} to a matrix row",
                        other.type_label()
                    ))),
                }
            }
            Value::DoubleMat(m) => {
                let len = m.len();
                let slot = m.get_mut(index).ok_or_else(|| oob(len))?;
                match value {
                    Value::DoubleVec(row) => {
                        *slot = row;
                        Ok(())
                    }
                    other => Err(RuntimeError::TypeError(format!(
                        "cannot assign {} to a matrix row",
                        other.type_label()
                    ))),
                }
            }
            Value::Array(a) => {
                let mut a = a.borrow_mut();
                let len = a.items.len();
                let slot = a.items.get_mut(index).ok_or_else(|| oob(len))?;
                *slot = value;
                Ok(())
            }
            _ => {
                let key = composite_element(&name, index);
                if self.frames[frame].contains_key(&key) {
                    self.assign_in_frame(frame, &key, value)
                } else {
                    self.charge(value.footprint())?;
                    self.frames[frame].insert(
                        key,
                        Variable::new(value, String::new()),
                    );
                    Ok(())
                }
            }
        }
    }
}

fn composite_member(object: &str, member: &str) -> String {
    format!("{}.{}", object, member)
}

fn composite_element(name: &str, index: usize) -> String {
    format!("{}[{}]", name, index)
}
