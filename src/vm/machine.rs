//! Stack machine executing a linked module
//!
//! The machine walks the module's byte image directly: each step decodes the
//! instruction at `ip`, advances past it, and dispatches. Calls never recurse
//! on the Rust stack; the chain of return points lives in the activations.

use std::io::{self, Write};
use std::rc::Rc;

use tracing::{debug, trace, Level};

use super::builtins::{self, Builtin, Context};
use super::bytecode::{Module, HEADER_SIZE};
use super::opcodes::{decode, Instruction, Opcode, Operand};
use super::value::{mismatch, Activation, PartialBuiltin, Printer, ReturnPoint, Style, Value};
use crate::error::{EncodingError, RuntimeError, RuntimeErrorKind};

type Step<T = ()> = Result<T, RuntimeErrorKind>;

/// The virtual machine. Output from the print builtins and the final result
/// goes to `W`, standard output unless another writer is supplied.
pub struct VM<W: Write = io::Stdout> {
    module: Module,
    ip: usize,
    stack: Vec<Value>,
    activation: Rc<Activation>,
    out: W,
}

impl VM<io::Stdout> {
    pub fn new(module: Module) -> Self {
        Self::with_output(module, io::stdout())
    }
}

impl<W: Write> VM<W> {
    pub fn with_output(module: Module, out: W) -> Self {
        Self {
            module,
            ip: HEADER_SIZE,
            stack: Vec::with_capacity(256),
            activation: Activation::root(),
            out,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    // ── Main execution loop ──────────────────────────────────────────

    /// Run until the root activation returns, yielding the value it returned.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let ip = self.ip;
            if !self.module.in_code(ip) {
                return Err(self.fail(ip, "?", RuntimeErrorKind::IpOutOfBounds(ip)));
            }

            let (inst, len) = match decode(self.module.as_bytes(), ip) {
                Ok(decoded) => decoded,
                Err(EncodingError::UnknownOpcode { opcode, .. }) => {
                    return Err(self.fail(ip, "?", RuntimeErrorKind::UnknownOpcode(opcode)));
                }
                Err(e) => {
                    let mnemonic = self.module.as_bytes()[ip];
                    let mnemonic = Opcode::from_byte(mnemonic).map_or("?", Opcode::mnemonic);
                    return Err(self.fail(ip, mnemonic, RuntimeErrorKind::MalformedInstruction(e)));
                }
            };

            if tracing::enabled!(Level::TRACE) {
                self.trace_step(ip, &inst);
            }

            self.ip = ip + len;
            match self.dispatch(&inst) {
                Ok(None) => {}
                Ok(Some(result)) => {
                    self.out
                        .flush()
                        .map_err(|e| self.fail(ip, "RET", RuntimeErrorKind::Output(e.to_string())))?;
                    return Ok(result);
                }
                Err(kind) => return Err(self.fail(ip, inst.opcode.mnemonic(), kind)),
            }
        }
    }

    fn trace_step(&self, ip: usize, inst: &Instruction) {
        let printer = Printer::new(&self.module);
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|v| printer.render_lossy(v, Style::Raw))
            .collect();
        trace!(
            "{}: {}: [{}] {}",
            ip,
            inst,
            stack.join(", "),
            printer.activation(&self.activation)
        );
    }

    fn fail(&self, ip: usize, mnemonic: &'static str, kind: RuntimeErrorKind) -> RuntimeError {
        let snapshot = Printer::new(&self.module).snapshot(&self.stack, &self.activation);
        RuntimeError {
            ip,
            mnemonic,
            kind,
            snapshot,
        }
    }

    // ── Instruction dispatch ─────────────────────────────────────────

    /// Execute one instruction. `Some` carries the program's result once the
    /// root activation returns.
    fn dispatch(&mut self, inst: &Instruction) -> Step<Option<Value>> {
        use Operand::{Int, Table, Text};

        match (inst.opcode, inst.operands.as_slice()) {
            // ── Push ─────────────────────────────────────────────────
            (Opcode::PushBuiltin, [Text(name)]) => {
                let name = String::from_utf8_lossy(name);
                let builtin = builtins::lookup(&name)
                    .ok_or_else(|| RuntimeErrorKind::UnknownBuiltin(name.into_owned()))?;
                self.stack.push(Value::Builtin(builtin));
            }
            (Opcode::PushClosure, [Int(entry)]) => {
                self.stack.push(Value::Closure {
                    entry: target(*entry),
                    captured: Rc::clone(&self.activation),
                });
            }
            (Opcode::PushData, [Int(meta), Int(ordinal), Int(size)]) => {
                let fields = self.pop_n(*size)?;
                self.stack.push(Value::Data {
                    meta: *meta,
                    ordinal: *ordinal,
                    fields: fields.into(),
                });
            }
            (Opcode::PushDataItem, [Int(offset)]) => {
                let item = match self.pop()? {
                    Value::Data { fields, .. } => item_at(&fields, *offset)?,
                    other => return Err(mismatch("Data", &other)),
                };
                self.stack.push(item);
            }
            (Opcode::PushFalse, []) => self.stack.push(Value::Bool(false)),
            (Opcode::PushTrue, []) => self.stack.push(Value::Bool(true)),
            (Opcode::PushInt, [Int(n)]) => self.stack.push(Value::Int(*n)),
            (Opcode::PushString, [Text(s)]) => self.stack.push(Value::Str(Rc::from(s.as_slice()))),
            (Opcode::PushUnit, []) => self.stack.push(Value::Unit),
            (Opcode::PushTuple, [Int(size)]) => {
                let items = self.pop_n(*size)?;
                self.stack.push(Value::tuple(items));
            }
            (Opcode::PushTupleItem, [Int(offset)]) => {
                let item = match self.pop()? {
                    Value::Tuple(items) => item_at(&items, *offset)?,
                    other => return Err(mismatch("Tuple", &other)),
                };
                self.stack.push(item);
            }
            (Opcode::PushVar, [Int(depth), Int(offset)]) => {
                if *depth < 0 {
                    return Err(RuntimeErrorKind::NoEnclosingActivation(*depth));
                }
                let frame = self.activation.ancestor(*depth)?;
                let value = frame.load(*offset)?;
                self.stack.push(value);
            }

            // ── Stack ────────────────────────────────────────────────
            (Opcode::Dup, []) => {
                let top = self.stack.last().cloned().ok_or(RuntimeErrorKind::StackUnderflow)?;
                self.stack.push(top);
            }
            (Opcode::Discard, []) => {
                self.pop()?;
            }
            (Opcode::Swap, []) => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(a);
            }

            // ── Arithmetic ───────────────────────────────────────────
            (Opcode::Add, []) => self.arith(|a, b| Ok(a.wrapping_add(b)))?,
            (Opcode::Sub, []) => self.arith(|a, b| Ok(a.wrapping_sub(b)))?,
            (Opcode::Mul, []) => self.arith(|a, b| Ok(a.wrapping_mul(b)))?,
            (Opcode::Div, []) => self.arith(|a, b| {
                if b == 0 {
                    Err(RuntimeErrorKind::DivisionByZero)
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            (Opcode::Eq, []) => {
                let b = self.pop()?.as_int()?;
                let a = self.pop()?.as_int()?;
                self.stack.push(Value::Bool(a == b));
            }

            // ── Control Flow ─────────────────────────────────────────
            (Opcode::Jmp, [Int(label)]) => self.ip = target(*label),
            (Opcode::JmpFalse, [Int(label)]) => {
                if !self.pop()?.as_bool()? {
                    self.ip = target(*label);
                }
            }
            (Opcode::JmpTrue, [Int(label)]) => {
                if self.pop()?.as_bool()? {
                    self.ip = target(*label);
                }
            }
            (Opcode::JmpData, [Table(labels)]) => {
                let ordinal = match self.pop()? {
                    Value::Data { ordinal, .. } => ordinal,
                    other => return Err(mismatch("Data", &other)),
                };
                let label = usize::try_from(ordinal)
                    .ok()
                    .and_then(|i| labels.get(i))
                    .ok_or(RuntimeErrorKind::ConstructorDispatchOutOfRange {
                        ordinal,
                        size: labels.len(),
                    })?;
                self.ip = target(*label);
            }

            // ── Calls & Activations ──────────────────────────────────
            (Opcode::SwapCall, []) => {
                let argument = self.pop()?;
                let callee = self.pop()?;
                self.call(callee, argument)?;
            }
            (Opcode::Enter, [Int(size)]) => {
                let size = usize::try_from(*size)
                    .map_err(|_| RuntimeErrorKind::IndexOutOfRange { index: *size, len: 0 })?;
                self.activation.enter(size)?;
            }
            (Opcode::Ret, []) => return self.ret(),
            (Opcode::StoreVar, [Int(offset)]) => {
                let value = self.pop()?;
                self.activation.store(*offset, value)?;
            }

            (opcode, _) => {
                return Err(RuntimeErrorKind::MalformedInstruction(opcode.operand_mismatch()));
            }
        }
        Ok(None)
    }

    fn call(&mut self, callee: Value, argument: Value) -> Step {
        match callee {
            Value::Closure { entry, captured } => {
                let return_point = ReturnPoint {
                    ip: self.ip,
                    caller: Rc::clone(&self.activation),
                };
                self.stack.push(argument);
                self.activation = Activation::call(captured, entry, return_point);
                self.ip = entry;
                Ok(())
            }
            Value::Builtin(builtin) => self.apply(builtin, vec![argument]),
            Value::PartialBuiltin(partial) => {
                let mut args = partial.args.clone();
                args.push(argument);
                self.apply(partial.builtin, args)
            }
            other => Err(RuntimeErrorKind::NotCallable(other.type_name())),
        }
    }

    /// Curry until the builtin has all of its arguments, then run it.
    fn apply(&mut self, builtin: &'static Builtin, args: Vec<Value>) -> Step {
        if args.len() < builtin.arity {
            self.stack
                .push(Value::PartialBuiltin(Rc::new(PartialBuiltin { builtin, args })));
            return Ok(());
        }
        let mut ctx = Context {
            out: &mut self.out,
            module: &self.module,
        };
        if let Some(result) = (builtin.func)(&mut ctx, &args)? {
            self.stack.push(result);
        }
        Ok(())
    }

    fn ret(&mut self) -> Step<Option<Value>> {
        if let Some(return_point) = self.activation.return_point().cloned() {
            self.ip = return_point.ip;
            self.activation = return_point.caller;
            return Ok(None);
        }

        let result = self.pop()?;
        if result != Value::Unit {
            let text = Printer::new(&self.module).render(&result, Style::Typed)?;
            writeln!(self.out, "{}", text).map_err(|e| RuntimeErrorKind::Output(e.to_string()))?;
        }
        if !self.stack.is_empty() {
            debug!(remaining = self.stack.len(), "values left on the stack at exit");
        }
        Ok(Some(result))
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn pop(&mut self) -> Step<Value> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    /// Pop `count` values, returned in the order they were pushed.
    fn pop_n(&mut self, count: i32) -> Step<Vec<Value>> {
        let count = usize::try_from(count).map_err(|_| RuntimeErrorKind::IndexOutOfRange {
            index: count,
            len: self.stack.len(),
        })?;
        if count > self.stack.len() {
            return Err(RuntimeErrorKind::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn arith(&mut self, op: impl FnOnce(i32, i32) -> Step<i32>) -> Step {
        let b = self.pop()?.as_int()?;
        let a = self.pop()?.as_int()?;
        self.stack.push(Value::Int(op(a, b)?));
        Ok(())
    }
}

/// Jump targets outside the code segment are caught when fetched.
fn target(label: i32) -> usize {
    usize::try_from(label).unwrap_or(usize::MAX)
}

fn item_at(items: &[Value], offset: i32) -> Step<Value> {
    usize::try_from(offset)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or(RuntimeErrorKind::IndexOutOfRange {
            index: offset,
            len: items.len(),
        })
}
