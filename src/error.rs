//! Error types for every stage of the toolchain
//!
//! None of these are recoverable: each one means the module (or the source it
//! was assembled from) is malformed, and the caller is expected to report it
//! and stop.

use thiserror::Error;

/// Failure to encode or decode a single instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("unknown opcode {opcode} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("instruction truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
    #[error("{mnemonic}: operands do not match signature {expected}")]
    OperandMismatch {
        mnemonic: &'static str,
        expected: String,
    },
    #[error("string operand contains a NUL byte")]
    EmbeddedNul,
    #[error("negative label table length {length} at offset {offset}")]
    NegativeTableLength { length: i32, offset: usize },
}

/// Failure to relocate the builder's blocks into a module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unresolved label {label} referenced from block {block} at offset {offset}")]
    UnresolvedLabel {
        label: String,
        block: String,
        offset: usize,
    },
    #[error("label {0} was not created by this builder")]
    ForeignLabel(String),
    #[error("address {0} does not fit in a 32-bit operand")]
    AddressOverflow(usize),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Failure to read a binary module.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("module is {0} bytes, shorter than its 4-byte header")]
    TooShort(usize),
    #[error("data segment offset {offset} lies outside the module ({len} bytes)")]
    BadHeader { offset: u32, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyErrorKind {
    #[error("unknown instruction {0}")]
    UnknownMnemonic(String),
    #[error("unknown builtin {0}")]
    UnknownBuiltin(String),
    #[error("unknown label {0}")]
    UnknownLabel(String),
    #[error("wrong number of arguments to {mnemonic}: expected {expected}, got {found}")]
    ArityMismatch {
        mnemonic: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid integer {0}")]
    InvalidInteger(String),
    #[error("invalid hex byte {0}")]
    InvalidHexByte(String),
    #[error("label {0} defined twice")]
    DuplicateLabel(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Assembly failure, tied to the offending source line (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}: {text}")]
pub struct AssemblyError {
    pub line: usize,
    pub text: String,
    pub kind: AssemblyErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeErrorKind {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("malformed instruction: {0}")]
    MalformedInstruction(EncodingError),
    #[error("unknown builtin {0}")]
    UnknownBuiltin(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("constructor ordinal {ordinal} outside dispatch table of {size} entries")]
    ConstructorDispatchOutOfRange { ordinal: i32, size: usize },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i32, len: usize },
    #[error("activation already entered")]
    ActivationAlreadyEntered,
    #[error("activation not entered")]
    ActivationNotEntered,
    #[error("no enclosing activation {0} levels out")]
    NoEnclosingActivation(i32),
    #[error("slot {0} read before anything was stored in it")]
    UninitializedSlot(usize),
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("instruction pointer {0} is outside the code segment")]
    IpOutOfBounds(usize),
    #[error("invalid type metadata at offset {0}")]
    InvalidMetadata(i32),
    #[error("cannot write output: {0}")]
    Output(String),
    #[error("fatal error: {message} (code {code})")]
    FatalError { message: String, code: i32 },
}

/// A runtime failure together with the machine state at the failing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error at {ip} ({mnemonic}): {kind}\n  state: {snapshot}")]
pub struct RuntimeError {
    pub ip: usize,
    pub mnemonic: &'static str,
    pub kind: RuntimeErrorKind,
    pub snapshot: String,
}

impl RuntimeError {
    /// Process exit code the CLI should use for this failure.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            RuntimeErrorKind::FatalError { code, .. } => code,
            _ => 1,
        }
    }
}

/// Any failure the toolchain can report.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
