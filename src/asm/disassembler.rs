//! Disassembler

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::EncodingError;
use crate::vm::bytecode::{Module, HEADER_SIZE};
use crate::vm::opcodes::{decode, Instruction, Operand, OperandKind};

/// Data bytes per line in re-assemblable output.
const HEX_PER_LINE: usize = 16;

/// One decoded instruction and the absolute offset it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub offset: usize,
    pub instruction: Instruction,
}

/// A stretch of the data segment, split on whether bytes look printable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataRun {
    Text { offset: usize, text: String },
    Bytes { offset: usize, bytes: Vec<u8> },
}

/// A disassembled module.
#[derive(Debug, Clone)]
pub struct Listing {
    size: usize,
    data_offset: usize,
    digest: String,
    lines: Vec<Line>,
    data: Vec<u8>,
}

/// Decode every instruction in the code segment of `module`.
pub fn disassemble(module: &Module) -> Result<Listing, EncodingError> {
    let code = &module.as_bytes()[..module.data_offset()];
    let mut lines = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < code.len() {
        let (instruction, len) = decode(code, pos)?;
        lines.push(Line {
            offset: pos,
            instruction,
        });
        pos += len;
    }

    Ok(Listing {
        size: module.len(),
        data_offset: module.data_offset(),
        digest: module.digest(),
        lines,
        data: module.data().to_vec(),
    })
}

impl Listing {
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn data_runs(&self) -> Vec<DataRun> {
        let mut runs = Vec::new();
        let mut start = 0;
        while start < self.data.len() {
            let text = is_text(self.data[start]);
            let len = self.data[start..]
                .iter()
                .take_while(|&&b| is_text(b) == text)
                .count();
            let chunk = &self.data[start..start + len];
            let offset = self.data_offset + start;
            runs.push(if text {
                DataRun::Text {
                    offset,
                    text: String::from_utf8_lossy(chunk).into_owned(),
                }
            } else {
                DataRun::Bytes {
                    offset,
                    bytes: chunk.to_vec(),
                }
            });
            start += len;
        }
        runs
    }

    /// Source that assembles back to the same bytes. Every label operand that
    /// points at an instruction or into the data segment gets a synthetic
    /// `L<offset>` label; data is written as hex.
    pub fn to_assembly(&self) -> String {
        let placeable: BTreeSet<usize> = self
            .lines
            .iter()
            .map(|l| l.offset)
            .chain(self.data_offset..=self.size)
            .collect();
        let targets: BTreeSet<usize> = self
            .label_targets()
            .filter(|t| placeable.contains(t))
            .collect();
        let label = |target: i32| match usize::try_from(target) {
            Ok(t) if targets.contains(&t) => format!("L{}", t),
            _ => target.to_string(),
        };

        let mut out = String::new();
        for line in &self.lines {
            if targets.contains(&line.offset) {
                let _ = writeln!(out, ":L{}", line.offset);
            }
            let inst = &line.instruction;
            out.push_str(inst.opcode.mnemonic());
            for (operand, kind) in inst.operands.iter().zip(inst.opcode.signature()) {
                out.push(' ');
                match (operand, kind) {
                    (Operand::Int(n), OperandKind::Label) => out.push_str(&label(*n)),
                    (Operand::Table(entries), _) => {
                        let _ = write!(out, "{}", entries.len());
                        for e in entries {
                            let _ = write!(out, " {}", label(*e));
                        }
                    }
                    (other, _) => {
                        let _ = write!(out, "{}", other);
                    }
                }
            }
            out.push('\n');
        }

        out.push_str(".data\n");
        let mut pending: Vec<String> = Vec::new();
        for (i, byte) in self.data.iter().enumerate() {
            let offset = self.data_offset + i;
            if targets.contains(&offset) || pending.len() == HEX_PER_LINE {
                flush_hex(&mut out, &mut pending);
            }
            if targets.contains(&offset) {
                let _ = writeln!(out, ":L{}", offset);
            }
            pending.push(format!("0x{:02x}", byte));
        }
        flush_hex(&mut out, &mut pending);
        if targets.contains(&self.size) && self.size > self.data_offset {
            let _ = writeln!(out, ":L{}", self.size);
        }
        if targets.contains(&self.data_offset) && self.data.is_empty() {
            let _ = writeln!(out, ":L{}", self.data_offset);
        }
        out
    }

    fn label_targets(&self) -> impl Iterator<Item = usize> + '_ {
        self.lines.iter().flat_map(|line| {
            let inst = &line.instruction;
            inst.operands
                .iter()
                .zip(inst.opcode.signature())
                .flat_map(|(operand, kind)| match (operand, kind) {
                    (Operand::Int(n), OperandKind::Label) => vec![*n],
                    (Operand::Table(entries), _) => entries.clone(),
                    _ => Vec::new(),
                })
                .filter_map(|t| usize::try_from(t).ok())
                .collect::<Vec<_>>()
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let listing = JsonListing {
            size: self.size,
            data_offset: self.data_offset,
            sha256: &self.digest,
            code: self
                .lines
                .iter()
                .map(|l| JsonLine {
                    offset: l.offset,
                    mnemonic: l.instruction.opcode.mnemonic(),
                    operands: l.instruction.operands.iter().map(JsonOperand::from).collect(),
                })
                .collect(),
            data: self.data_runs(),
        };
        serde_json::to_string_pretty(&listing)
    }
}

fn is_text(byte: u8) -> bool {
    byte >= 32
}

fn flush_hex(out: &mut String, pending: &mut Vec<String>) {
    if !pending.is_empty() {
        out.push_str(&pending.join(" "));
        out.push('\n');
        pending.clear();
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Data segment offset: {} bytes", self.data_offset)?;
        for line in &self.lines {
            writeln!(f, "{}: {}", line.offset, line.instruction)?;
        }
        if !self.data.is_empty() {
            writeln!(f, "Data segment:")?;
            for run in self.data_runs() {
                match run {
                    DataRun::Text { offset, text } => writeln!(f, "{}: {}", offset, text)?,
                    DataRun::Bytes { offset, bytes } => {
                        let hex: Vec<String> = bytes.iter().map(|b| format!("0x{:x}", b)).collect();
                        writeln!(f, "{}: {}", offset, hex.join(" "))?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ── JSON view ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonListing<'a> {
    size: usize,
    data_offset: usize,
    sha256: &'a str,
    code: Vec<JsonLine>,
    data: Vec<DataRun>,
}

#[derive(Serialize)]
struct JsonLine {
    offset: usize,
    mnemonic: &'static str,
    operands: Vec<JsonOperand>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum JsonOperand {
    Int(i32),
    Text(String),
    Table(Vec<i32>),
}

impl From<&Operand> for JsonOperand {
    fn from(operand: &Operand) -> Self {
        match operand {
            Operand::Int(n) => JsonOperand::Int(*n),
            Operand::Text(s) => JsonOperand::Text(String::from_utf8_lossy(s).into_owned()),
            Operand::Table(entries) => JsonOperand::Table(entries.clone()),
        }
    }
}
