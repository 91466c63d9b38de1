//! Bytecode instruction set and its byte encoding
//!
//! An instruction is one opcode byte (the opcode's ordinal in [`Opcode::ALL`])
//! followed by the operands named by its signature. Integers and labels are
//! 4-byte little-endian; builtin names and string literals are NUL-terminated.
//! Ordinals are part of the binary format and must never be reordered.

use std::fmt;

use crate::error::EncodingError;

/// Operation codes for the stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ── Push ─────────────────────────────────────────────────────────
    /// Push the named builtin
    PushBuiltin = 0,
    /// Push a closure over the current activation
    PushClosure = 1,
    /// Pop N fields, push a constructor value: (meta, ordinal, N)
    PushData = 2,
    /// Pop a constructor value, push one of its fields
    PushDataItem = 3,
    PushFalse = 4,
    PushInt = 5,
    PushString = 6,
    PushTrue = 7,
    /// Pop N values, push a tuple of them
    PushTuple = 8,
    /// Pop a tuple, push one of its items
    PushTupleItem = 9,
    PushUnit = 10,
    /// Push slot `offset` of the activation `depth` lexical levels out
    PushVar = 11,

    // ── Stack ────────────────────────────────────────────────────────
    Dup = 12,
    Discard = 13,
    Swap = 14,

    // ── Arithmetic ───────────────────────────────────────────────────
    Add = 15,
    Sub = 16,
    Mul = 17,
    Div = 18,
    Eq = 19,

    // ── Control Flow ─────────────────────────────────────────────────
    Jmp = 20,
    /// Pop a constructor value, jump through the table by its ordinal
    JmpData = 21,
    JmpFalse = 22,
    JmpTrue = 23,

    // ── Calls & Activations ──────────────────────────────────────────
    /// Pop argument, pop callee, call
    SwapCall = 24,
    /// Allocate the current activation's slots
    Enter = 25,
    Ret = 26,
    /// Pop into a slot of the current activation
    StoreVar = 27,
}

/// How an operand is laid out in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Raw 32-bit integer
    Int,
    /// 32-bit absolute offset into the module, resolved at link time
    Label,
    /// NUL-terminated builtin name
    BuiltinRef,
    /// NUL-terminated string literal
    Literal,
    /// Count `n` followed by `n` labels (`JMP_DATA` only)
    LabelTable,
}

impl OperandKind {
    pub fn name(self) -> &'static str {
        match self {
            OperandKind::Int => "int",
            OperandKind::Label => "label",
            OperandKind::BuiltinRef => "builtin",
            OperandKind::Literal => "string",
            OperandKind::LabelTable => "label-table",
        }
    }
}

/// A decoded operand value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Int(i32),
    Text(Vec<u8>),
    Table(Vec<i32>),
}

impl Operand {
    fn fits(&self, kind: OperandKind) -> bool {
        matches!(
            (self, kind),
            (Operand::Int(_), OperandKind::Int | OperandKind::Label)
                | (Operand::Text(_), OperandKind::BuiltinRef | OperandKind::Literal)
                | (Operand::Table(_), OperandKind::LabelTable)
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Int(n) => write!(f, "{}", n),
            Operand::Text(s) => write!(f, "{}", String::from_utf8_lossy(s)),
            Operand::Table(labels) => {
                write!(f, "{}", labels.len())?;
                for l in labels {
                    write!(f, " {}", l)?;
                }
                Ok(())
            }
        }
    }
}

/// A single instruction with its immediate operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self { opcode, operands }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        encode(self.opcode, &self.operands)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        for operand in &self.operands {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

impl Opcode {
    pub const ALL: [Opcode; 28] = [
        Opcode::PushBuiltin,
        Opcode::PushClosure,
        Opcode::PushData,
        Opcode::PushDataItem,
        Opcode::PushFalse,
        Opcode::PushInt,
        Opcode::PushString,
        Opcode::PushTrue,
        Opcode::PushTuple,
        Opcode::PushTupleItem,
        Opcode::PushUnit,
        Opcode::PushVar,
        Opcode::Dup,
        Opcode::Discard,
        Opcode::Swap,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Eq,
        Opcode::Jmp,
        Opcode::JmpData,
        Opcode::JmpFalse,
        Opcode::JmpTrue,
        Opcode::SwapCall,
        Opcode::Enter,
        Opcode::Ret,
        Opcode::StoreVar,
    ];

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| op.mnemonic() == name)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::PushBuiltin => "PUSH_BUILTIN",
            Opcode::PushClosure => "PUSH_CLOSURE",
            Opcode::PushData => "PUSH_DATA",
            Opcode::PushDataItem => "PUSH_DATA_ITEM",
            Opcode::PushFalse => "PUSH_FALSE",
            Opcode::PushInt => "PUSH_INT",
            Opcode::PushString => "PUSH_STRING",
            Opcode::PushTrue => "PUSH_TRUE",
            Opcode::PushTuple => "PUSH_TUPLE",
            Opcode::PushTupleItem => "PUSH_TUPLE_ITEM",
            Opcode::PushUnit => "PUSH_UNIT",
            Opcode::PushVar => "PUSH_VAR",
            Opcode::Dup => "DUP",
            Opcode::Discard => "DISCARD",
            Opcode::Swap => "SWAP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Eq => "EQ",
            Opcode::Jmp => "JMP",
            Opcode::JmpData => "JMP_DATA",
            Opcode::JmpFalse => "JMP_FALSE",
            Opcode::JmpTrue => "JMP_TRUE",
            Opcode::SwapCall => "SWAP_CALL",
            Opcode::Enter => "ENTER",
            Opcode::Ret => "RET",
            Opcode::StoreVar => "STORE_VAR",
        }
    }

    /// Operand kinds in encoding order.
    pub fn signature(self) -> &'static [OperandKind] {
        use OperandKind::*;
        match self {
            Opcode::PushBuiltin => &[BuiltinRef],
            Opcode::PushClosure => &[Label],
            Opcode::PushData => &[Label, Int, Int],
            Opcode::PushDataItem => &[Int],
            Opcode::PushInt => &[Int],
            Opcode::PushString => &[Literal],
            Opcode::PushTuple => &[Int],
            Opcode::PushTupleItem => &[Int],
            Opcode::PushVar => &[Int, Int],
            Opcode::Jmp | Opcode::JmpFalse | Opcode::JmpTrue => &[Label],
            Opcode::JmpData => &[LabelTable],
            Opcode::Enter => &[Int],
            Opcode::StoreVar => &[Int],
            Opcode::PushFalse
            | Opcode::PushTrue
            | Opcode::PushUnit
            | Opcode::Dup
            | Opcode::Discard
            | Opcode::Swap
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Eq
            | Opcode::SwapCall
            | Opcode::Ret => &[],
        }
    }

    /// The error for operands that do not fit this opcode's signature.
    pub fn operand_mismatch(self) -> EncodingError {
        let kinds: Vec<&str> = self.signature().iter().map(|k| k.name()).collect();
        EncodingError::OperandMismatch {
            mnemonic: self.mnemonic(),
            expected: format!("[{}]", kinds.join(", ")),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────

/// Check that `operands` fit the signature of `opcode`.
pub fn check_operands(opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError> {
    let signature = opcode.signature();
    let fits = operands.len() == signature.len()
        && operands.iter().zip(signature).all(|(o, k)| o.fits(*k));
    if !fits {
        return Err(opcode.operand_mismatch());
    }
    Ok(())
}

pub fn encode(opcode: Opcode, operands: &[Operand]) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    encode_into(&mut buf, opcode, operands)?;
    Ok(buf)
}

/// Append the encoding of one instruction to `buf`. Nothing is written on error.
pub fn encode_into(buf: &mut Vec<u8>, opcode: Opcode, operands: &[Operand]) -> Result<(), EncodingError> {
    check_operands(opcode, operands)?;
    if operands
        .iter()
        .any(|o| matches!(o, Operand::Text(s) if s.contains(&0)))
    {
        return Err(EncodingError::EmbeddedNul);
    }

    buf.push(opcode.byte());
    for operand in operands {
        match operand {
            Operand::Int(n) => write_i32(buf, *n),
            Operand::Text(s) => {
                buf.extend_from_slice(s);
                buf.push(0);
            }
            Operand::Table(labels) => {
                write_i32(buf, labels.len() as i32);
                for l in labels {
                    write_i32(buf, *l);
                }
            }
        }
    }
    Ok(())
}

/// Decode the instruction at `offset`, returning it and the bytes consumed.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(Instruction, usize), EncodingError> {
    let byte = *bytes.get(offset).ok_or(EncodingError::Truncated { offset })?;
    let opcode = Opcode::from_byte(byte).ok_or(EncodingError::UnknownOpcode { opcode: byte, offset })?;

    let mut pos = offset + 1;
    let mut operands = Vec::with_capacity(opcode.signature().len());
    for kind in opcode.signature() {
        let operand = match kind {
            OperandKind::Int | OperandKind::Label => Operand::Int(read_i32(bytes, &mut pos)?),
            OperandKind::BuiltinRef | OperandKind::Literal => Operand::Text(read_cstr(bytes, &mut pos)?.to_vec()),
            OperandKind::LabelTable => {
                let at = pos;
                let length = read_i32(bytes, &mut pos)?;
                if length < 0 {
                    return Err(EncodingError::NegativeTableLength { length, offset: at });
                }
                // The table must fit in what is left of the buffer.
                if (length as usize).saturating_mul(4) > bytes.len().saturating_sub(pos) {
                    return Err(EncodingError::Truncated { offset: pos });
                }
                let mut labels = Vec::with_capacity(length as usize);
                for _ in 0..length {
                    labels.push(read_i32(bytes, &mut pos)?);
                }
                Operand::Table(labels)
            }
        };
        operands.push(operand);
    }

    Ok((Instruction { opcode, operands }, pos - offset))
}

// ── Byte helpers ─────────────────────────────────────────────────────────

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_i32_at(buf: &mut [u8], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn read_i32(data: &[u8], pos: &mut usize) -> Result<i32, EncodingError> {
    let bytes: [u8; 4] = data
        .get(*pos..*pos + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(EncodingError::Truncated { offset: *pos })?;
    *pos += 4;
    Ok(i32::from_le_bytes(bytes))
}

/// Read a NUL-terminated string, leaving `pos` just past the terminator.
pub fn read_cstr<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], EncodingError> {
    let start = *pos;
    let rest = data
        .get(start..)
        .ok_or(EncodingError::UnterminatedString { offset: start })?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(EncodingError::UnterminatedString { offset: start })?;
    *pos = start + len + 1;
    Ok(&rest[..len])
}
