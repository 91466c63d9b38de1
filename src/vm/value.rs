//! Runtime values, activation records and the print protocol

use std::cell::RefCell;
use std::fmt::Write as _;
use std::mem;
use std::ops::Deref;
use std::rc::Rc;

use super::builtins::Builtin;
use super::bytecode::{Module, TypeMetadata};
use crate::error::RuntimeErrorKind;

/// A value on the operand stack or in an activation slot.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i32),
    Str(Rc<[u8]>),
    Tuple(Fields),
    /// Constructor value; `meta` is the absolute offset of its type metadata
    Data {
        meta: i32,
        ordinal: i32,
        fields: Fields,
    },
    Closure {
        entry: usize,
        captured: Rc<Activation>,
    },
    Builtin(&'static Builtin),
    /// A builtin that has received some, but not all, of its arguments
    PartialBuiltin(Rc<PartialBuiltin>),
}

/// Shared, immutable items of a tuple or constructor value.
#[derive(Debug, Clone, PartialEq)]
pub struct Fields(Rc<[Value]>);

impl From<Vec<Value>> for Fields {
    fn from(items: Vec<Value>) -> Self {
        Fields(Rc::from(items))
    }
}

impl Deref for Fields {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl Drop for Fields {
    fn drop(&mut self) {
        let mut teardown = Teardown::default();
        teardown.take_fields(self);
        teardown.run();
    }
}

#[derive(Debug)]
pub struct PartialBuiltin {
    pub builtin: &'static Builtin,
    pub args: Vec<Value>,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (
                Value::Data { meta: m1, ordinal: o1, fields: f1 },
                Value::Data { meta: m2, ordinal: o2, fields: f2 },
            ) => m1 == m2 && o1 == o2 && f1 == f2,
            (
                Value::Closure { entry: e1, captured: c1 },
                Value::Closure { entry: e2, captured: c2 },
            ) => e1 == e2 && Rc::ptr_eq(c1, c2),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (Value::PartialBuiltin(a), Value::PartialBuiltin(b)) => {
                a.builtin.name == b.builtin.name && a.args == b.args
            }
            _ => false,
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s.as_bytes()))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Fields::from(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "Unit",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Str(_) => "String",
            Value::Tuple(_) => "Tuple",
            Value::Data { .. } => "Data",
            Value::Closure { .. } => "Closure",
            Value::Builtin(_) => "Builtin",
            Value::PartialBuiltin(_) => "BuiltinClosure",
        }
    }

    pub fn as_int(&self) -> Result<i32, RuntimeErrorKind> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(mismatch("Int", other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeErrorKind> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("Bool", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], RuntimeErrorKind> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("String", other)),
        }
    }
}

pub(crate) fn mismatch(expected: &'static str, found: &Value) -> RuntimeErrorKind {
    RuntimeErrorKind::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

// ── Activations ──────────────────────────────────────────────────────────

/// Where a call returns to.
#[derive(Debug, Clone)]
pub struct ReturnPoint {
    pub ip: usize,
    pub caller: Rc<Activation>,
}

/// A call frame. Shared by every closure created while it is current, so
/// slot writes are visible through all of them.
#[derive(Debug)]
pub struct Activation {
    /// Lexically enclosing frame (the called closure's captured activation)
    parent: Option<Rc<Activation>>,
    /// Entry point of the closure this frame was created for
    entry: Option<usize>,
    return_point: Option<ReturnPoint>,
    /// `None` until `ENTER`; unset slots are `None`
    slots: RefCell<Option<Vec<Option<Value>>>>,
}

impl Activation {
    /// The outermost frame: no parent, no return point.
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            parent: None,
            entry: None,
            return_point: None,
            slots: RefCell::new(None),
        })
    }

    /// A fresh frame for calling the closure at `entry` that captured `parent`.
    pub fn call(parent: Rc<Activation>, entry: usize, return_point: ReturnPoint) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(parent),
            entry: Some(entry),
            return_point: Some(return_point),
            slots: RefCell::new(None),
        })
    }

    pub fn parent(&self) -> Option<&Rc<Activation>> {
        self.parent.as_ref()
    }

    pub fn return_point(&self) -> Option<&ReturnPoint> {
        self.return_point.as_ref()
    }

    pub fn is_entered(&self) -> bool {
        self.slots.borrow().is_some()
    }

    /// Number of frames on the lexical chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    pub fn enter(&self, size: usize) -> Result<(), RuntimeErrorKind> {
        let mut slots = self.slots.borrow_mut();
        if slots.is_some() {
            return Err(RuntimeErrorKind::ActivationAlreadyEntered);
        }
        *slots = Some(vec![None; size]);
        Ok(())
    }

    pub fn load(&self, offset: i32) -> Result<Value, RuntimeErrorKind> {
        let slots = self.slots.borrow();
        let slots = slots.as_ref().ok_or(RuntimeErrorKind::ActivationNotEntered)?;
        let index = slot_index(offset, slots.len())?;
        slots[index]
            .clone()
            .ok_or(RuntimeErrorKind::UninitializedSlot(index))
    }

    pub fn store(&self, offset: i32, value: Value) -> Result<(), RuntimeErrorKind> {
        let mut slots = self.slots.borrow_mut();
        let slots = slots.as_mut().ok_or(RuntimeErrorKind::ActivationNotEntered)?;
        let index = slot_index(offset, slots.len())?;
        slots[index] = Some(value);
        Ok(())
    }

    /// Walk `depth` parent links outward.
    pub fn ancestor(self: &Rc<Self>, depth: i32) -> Result<Rc<Activation>, RuntimeErrorKind> {
        let mut current = Rc::clone(self);
        for _ in 0..depth {
            let parent = current
                .parent
                .clone()
                .ok_or(RuntimeErrorKind::NoEnclosingActivation(depth))?;
            current = parent;
        }
        Ok(current)
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        let mut teardown = Teardown::default();
        teardown.take_frame(self);
        teardown.run();
    }
}

// ── Reclamation ──────────────────────────────────────────────────────────

/// Frees a graph of values and frames with an explicit worklist instead of
/// one nested `drop` per link. Only uniquely owned nodes are opened up; their
/// children move onto the worklist and the emptied node drops in place.
#[derive(Default)]
struct Teardown {
    values: Vec<Value>,
    frames: Vec<Rc<Activation>>,
}

impl Teardown {
    fn run(mut self) {
        loop {
            if let Some(value) = self.values.pop() {
                self.value(value);
            } else if let Some(mut frame) = self.frames.pop() {
                if let Some(frame) = Rc::get_mut(&mut frame) {
                    self.take_frame(frame);
                }
            } else {
                break;
            }
        }
    }

    fn value(&mut self, value: Value) {
        match value {
            Value::Tuple(mut items) | Value::Data { fields: mut items, .. } => {
                self.take_fields(&mut items);
            }
            Value::Closure { captured, .. } => self.frames.push(captured),
            Value::PartialBuiltin(mut partial) => {
                if let Some(partial) = Rc::get_mut(&mut partial) {
                    self.values.append(&mut partial.args);
                }
            }
            _ => {}
        }
    }

    fn take_fields(&mut self, fields: &mut Fields) {
        if let Some(items) = Rc::get_mut(&mut fields.0) {
            self.values
                .extend(items.iter_mut().map(|v| mem::replace(v, Value::Unit)));
        }
    }

    fn take_frame(&mut self, frame: &mut Activation) {
        self.frames.extend(frame.parent.take());
        if let Some(point) = frame.return_point.take() {
            self.frames.push(point.caller);
        }
        if let Some(slots) = frame.slots.get_mut().take() {
            self.values.extend(slots.into_iter().flatten());
        }
    }
}

fn slot_index(offset: i32, len: usize) -> Result<usize, RuntimeErrorKind> {
    usize::try_from(offset)
        .ok()
        .filter(|&i| i < len)
        .ok_or(RuntimeErrorKind::IndexOutOfRange { index: offset, len })
}

// ── Print protocol ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// Strings verbatim, closures as `c<entry>#<depth>`
    Raw,
    /// Strings quoted and escaped, closures as `function`
    Literal,
    /// Literal, followed by `: <type>`
    Typed,
}

/// Renders values; data constructor names come from the module's metadata.
pub struct Printer<'m> {
    module: &'m Module,
}

impl<'m> Printer<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self { module }
    }

    pub fn render(&self, value: &Value, style: Style) -> Result<String, RuntimeErrorKind> {
        let mut out = String::new();
        self.value(value, style, &mut out)?;
        if style == Style::Typed {
            out.push_str(": ");
            self.type_of(value, &mut out)?;
        }
        Ok(out)
    }

    /// Render for diagnostics, where a broken metadata record must not hide the rest.
    pub fn render_lossy(&self, value: &Value, style: Style) -> String {
        self.render(value, style)
            .unwrap_or_else(|e| format!("<{}>", e))
    }

    fn metadata(&self, meta: i32) -> Result<TypeMetadata, RuntimeErrorKind> {
        self.module
            .type_metadata(meta)
            .map_err(|_| RuntimeErrorKind::InvalidMetadata(meta))
    }

    fn value(&self, value: &Value, style: Style, out: &mut String) -> Result<(), RuntimeErrorKind> {
        match value {
            Value::Unit => out.push_str("()"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Str(s) => {
                let text = String::from_utf8_lossy(s);
                if style == Style::Raw {
                    out.push_str(&text);
                } else {
                    out.push('"');
                    for c in text.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                }
            }
            Value::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.value(item, style, out)?;
                }
                out.push(')');
            }
            Value::Data { meta, ordinal, fields } => {
                let metadata = self.metadata(*meta)?;
                let name = metadata
                    .constructor(*ordinal)
                    .ok_or(RuntimeErrorKind::InvalidMetadata(*meta))?;
                out.push_str(name);
                for field in fields.iter() {
                    out.push(' ');
                    match field {
                        Value::Data { fields: inner, .. } if !inner.is_empty() => {
                            out.push('(');
                            self.value(field, style, out)?;
                            out.push(')');
                        }
                        _ => self.value(field, style, out)?,
                    }
                }
            }
            Value::Closure { entry, captured } => {
                if style == Style::Raw {
                    let _ = write!(out, "c{}#{}", entry, captured.depth());
                } else {
                    out.push_str("function");
                }
            }
            Value::Builtin(b) => out.push_str(b.name),
            Value::PartialBuiltin(p) => {
                out.push('<');
                out.push_str(p.builtin.name);
                for arg in &p.args {
                    out.push(' ');
                    self.value(arg, style, out)?;
                }
                out.push('>');
            }
        }
        Ok(())
    }

    fn type_of(&self, value: &Value, out: &mut String) -> Result<(), RuntimeErrorKind> {
        match value {
            Value::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" * ");
                    }
                    self.type_of(item, out)?;
                }
                out.push(')');
            }
            Value::Data { meta, .. } => out.push_str(&self.metadata(*meta)?.type_name),
            other => out.push_str(other.type_name()),
        }
        Ok(())
    }

    /// `<parent, closure, return-ip, [slots]>`, `-` for anything absent.
    pub fn activation(&self, activation: &Activation) -> String {
        let parent = activation
            .parent
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| self.activation(p));
        let closure = match activation.entry {
            Some(entry) => {
                let depth = activation.parent.as_ref().map_or(0, |p| p.depth());
                format!("c{}#{}", entry, depth)
            }
            None => "-".to_string(),
        };
        let ip = activation
            .return_point
            .as_ref()
            .map_or_else(|| "-".to_string(), |r| r.ip.to_string());
        let slots = match activation.slots.borrow().as_ref() {
            Some(slots) => {
                let items: Vec<String> = slots
                    .iter()
                    .map(|s| match s {
                        Some(v) => self.render_lossy(v, Style::Raw),
                        None => "-".to_string(),
                    })
                    .collect();
                format!("[{}]", items.join(", "))
            }
            None => "-".to_string(),
        };
        format!("<{}, {}, {}, {}>", parent, closure, ip, slots)
    }

    /// Operand stack and activation chain, as attached to runtime errors.
    pub fn snapshot(&self, stack: &[Value], activation: &Activation) -> String {
        let items: Vec<String> = stack
            .iter()
            .map(|v| self.render_lossy(v, Style::Raw))
            .collect();
        format!("[{}] :: {}", items.join(", "), self.activation(activation))
    }
}
