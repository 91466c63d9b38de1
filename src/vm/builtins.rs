//! Builtin function registry
//!
//! Builtins are named by `PUSH_BUILTIN` and applied one argument at a time
//! by `SWAP_CALL`; the machine collects arguments until `arity` is reached.

use std::cmp::Ordering;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use super::bytecode::Module;
use super::value::{Printer, Style, Value};
use crate::error::RuntimeErrorKind;

pub const PRINT: &str = "$$builtin-print";
pub const PRINT_LITERAL: &str = "$$builtin-print-literal";
pub const PRINT_TYPED: &str = "$$builtin-print-typed";
pub const PRINTLN: &str = "$$builtin-println";
pub const STRING_LENGTH: &str = "$$builtin-string-length";
pub const STRING_SUBSTRING: &str = "$$builtin-string-substring";
pub const STRING_CONCAT: &str = "$$builtin-string-concat";
pub const STRING_EQUAL: &str = "$$builtin-string-equal";
pub const STRING_COMPARE: &str = "$$builtin-string-compare";
pub const FATAL_ERROR: &str = "$$builtin-fatal-error";

/// What a builtin may touch while it runs.
pub struct Context<'a> {
    pub out: &'a mut dyn Write,
    pub module: &'a Module,
}

/// Receives exactly `arity` arguments, in application order. `None` means
/// nothing is pushed.
pub type BuiltinFn = fn(&mut Context<'_>, &[Value]) -> Result<Option<Value>, RuntimeErrorKind>;

pub struct Builtin {
    pub name: &'static str,
    pub arity: usize,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

pub static BUILTINS: &[Builtin] = &[
    Builtin { name: PRINT, arity: 1, func: print },
    Builtin { name: PRINT_LITERAL, arity: 1, func: print_literal },
    Builtin { name: PRINT_TYPED, arity: 1, func: print_typed },
    Builtin { name: PRINTLN, arity: 1, func: println },
    Builtin { name: STRING_LENGTH, arity: 1, func: string_length },
    Builtin { name: STRING_SUBSTRING, arity: 3, func: string_substring },
    Builtin { name: STRING_CONCAT, arity: 2, func: string_concat },
    Builtin { name: STRING_EQUAL, arity: 2, func: string_equal },
    Builtin { name: STRING_COMPARE, arity: 2, func: string_compare },
    Builtin { name: FATAL_ERROR, arity: 2, func: fatal_error },
];

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

// ── Output ───────────────────────────────────────────────────────────────

fn emit(ctx: &mut Context<'_>, text: &str) -> Result<Option<Value>, RuntimeErrorKind> {
    ctx.out
        .write_all(text.as_bytes())
        .map_err(|e| RuntimeErrorKind::Output(e.to_string()))?;
    Ok(None)
}

fn print_styled(ctx: &mut Context<'_>, value: &Value, style: Style) -> Result<Option<Value>, RuntimeErrorKind> {
    let text = Printer::new(ctx.module).render(value, style)?;
    emit(ctx, &text)
}

fn print(ctx: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    print_styled(ctx, &args[0], Style::Raw)
}

fn print_literal(ctx: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    print_styled(ctx, &args[0], Style::Literal)
}

fn print_typed(ctx: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    print_styled(ctx, &args[0], Style::Typed)
}

fn println(ctx: &mut Context<'_>, _args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    emit(ctx, "\n")
}

// ── Strings ──────────────────────────────────────────────────────────────

fn string_length(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    let s = args[0].as_bytes()?;
    Ok(Some(Value::Int(s.len() as i32)))
}

/// Bytes `[start, end)`, clamped to the string; empty when the range is.
fn string_substring(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    let s = args[0].as_bytes()?;
    let start = args[1].as_int()?.max(0) as usize;
    let end = (args[2].as_int()?.max(0) as usize).min(s.len());
    let slice = if start >= s.len() || end <= start {
        &[][..]
    } else {
        &s[start..end]
    };
    Ok(Some(Value::Str(Rc::from(slice))))
}

fn string_concat(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    let a = args[0].as_bytes()?;
    let b = args[1].as_bytes()?;
    let mut joined = Vec::with_capacity(a.len() + b.len());
    joined.extend_from_slice(a);
    joined.extend_from_slice(b);
    Ok(Some(Value::Str(Rc::from(joined))))
}

fn string_equal(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    Ok(Some(Value::Bool(args[0].as_bytes()? == args[1].as_bytes()?)))
}

fn string_compare(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    let ordering = match args[0].as_bytes()?.cmp(args[1].as_bytes()?) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    Ok(Some(Value::Int(ordering)))
}

// ── Control ──────────────────────────────────────────────────────────────

fn fatal_error(_: &mut Context<'_>, args: &[Value]) -> Result<Option<Value>, RuntimeErrorKind> {
    let message = String::from_utf8_lossy(args[0].as_bytes()?).into_owned();
    let code = args[1].as_int()?;
    Err(RuntimeErrorKind::FatalError { message, code })
}
