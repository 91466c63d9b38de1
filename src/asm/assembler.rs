//! Assembler for the line-oriented text form
//!
//! ```text
//! # comment
//! :main               label at the current byte position
//! ENTER 0
//! PUSH_STRING hi      the rest of the line
//! JMP_DATA 2 nil cons count, then exactly that many labels
//! .data               everything below is data
//! :greeting
//! hello               text, NUL-terminated
//! 0x01 0x00 0x00 0x00 raw bytes
//! ```
//!
//! Lines are trimmed at both ends before anything else, so neither text data
//! nor a `PUSH_STRING` operand can end in whitespace.
//!
//! Labels name absolute byte positions and may be used before they are
//! defined; every reference is patched once the whole source is read.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{AssemblyError, AssemblyErrorKind};
use crate::vm::builtins;
use crate::vm::bytecode::{Module, HEADER_SIZE};
use crate::vm::opcodes::{encode_into, write_i32_at, Opcode, Operand, OperandKind};

fn hex_byte() -> &'static Regex {
    static HEX_BYTE: OnceLock<Regex> = OnceLock::new();
    HEX_BYTE.get_or_init(|| Regex::new(r"^0[xX]([0-9a-fA-F]{1,2})$").expect("hex byte pattern is valid"))
}

/// A label operand waiting for its target: patch site, label name, source line.
struct Fixup {
    at: usize,
    label: String,
    line: usize,
    text: String,
}

struct Assembler {
    /// Line being assembled, 1-based, and its trimmed text
    line: usize,
    text: String,
    image: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
    data_offset: Option<usize>,
}

/// Assemble `source` into a module. Nothing is produced if any line fails.
pub fn assemble(source: &str) -> Result<Module, AssemblyError> {
    let mut asm = Assembler {
        line: 0,
        text: String::new(),
        image: vec![0; HEADER_SIZE],
        labels: HashMap::new(),
        fixups: Vec::new(),
        data_offset: None,
    };

    for (index, raw) in source.lines().enumerate() {
        asm.line = index + 1;
        asm.text = raw.trim().to_string();
        asm.assemble_line(raw).map_err(|kind| AssemblyError {
            line: asm.line,
            text: asm.text.clone(),
            kind,
        })?;
    }

    asm.finish()
}

impl Assembler {
    fn assemble_line(&mut self, raw: &str) -> Result<(), AssemblyErrorKind> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        if let Some(name) = line.strip_prefix(':') {
            return self.define_label(name);
        }
        if line == ".data" {
            if self.data_offset.is_none() {
                self.data_offset = Some(self.image.len());
            }
            return Ok(());
        }
        if self.data_offset.is_some() {
            self.data_line(line)
        } else {
            self.instruction(line)
        }
    }

    fn define_label(&mut self, name: &str) -> Result<(), AssemblyErrorKind> {
        if self.labels.contains_key(name) {
            return Err(AssemblyErrorKind::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name.to_string(), self.image.len());
        Ok(())
    }

    fn data_line(&mut self, line: &str) -> Result<(), AssemblyErrorKind> {
        if line.starts_with("0x") || line.starts_with("0X") {
            let mut bytes = Vec::new();
            for token in line.split_whitespace() {
                let digits = hex_byte()
                    .captures(token)
                    .and_then(|c| c.get(1))
                    .ok_or_else(|| AssemblyErrorKind::InvalidHexByte(token.to_string()))?;
                let byte = u8::from_str_radix(digits.as_str(), 16)
                    .map_err(|_| AssemblyErrorKind::InvalidHexByte(token.to_string()))?;
                bytes.push(byte);
            }
            self.image.extend_from_slice(&bytes);
        } else {
            self.image.extend_from_slice(line.as_bytes());
            self.image.push(0);
        }
        Ok(())
    }

    fn instruction(&mut self, line: &str) -> Result<(), AssemblyErrorKind> {
        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest),
            None => (line, ""),
        };
        let opcode = Opcode::from_mnemonic(mnemonic)
            .ok_or_else(|| AssemblyErrorKind::UnknownMnemonic(mnemonic.to_string()))?;
        let signature = opcode.signature();

        let start = self.image.len();
        let mut pending = Vec::new();
        let operands = if signature == [OperandKind::Literal] {
            vec![Operand::Text(rest.as_bytes().to_vec())]
        } else {
            let args: Vec<&str> = rest.split_whitespace().collect();
            parse_operands(opcode, &args, start, &mut pending)?
        };

        encode_into(&mut self.image, opcode, &operands)?;
        for (at, label) in pending {
            self.fixups.push(Fixup {
                at,
                label,
                line: self.line,
                text: self.text.clone(),
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Module, AssemblyError> {
        for fixup in &self.fixups {
            let target = self.labels.get(&fixup.label).ok_or_else(|| AssemblyError {
                line: fixup.line,
                text: fixup.text.clone(),
                kind: AssemblyErrorKind::UnknownLabel(fixup.label.clone()),
            })?;
            write_i32_at(&mut self.image, fixup.at, *target as i32);
        }

        let data_offset = self.data_offset.unwrap_or(self.image.len());
        write_i32_at(&mut self.image, 0, data_offset as i32);
        debug!(
            size = self.image.len(),
            data_offset,
            labels = self.labels.len(),
            "assembled module"
        );
        Ok(Module::from_linked(self.image, data_offset))
    }
}

/// Parse `args` against the signature of `opcode`. Label names become
/// placeholder zeros plus an entry in `pending` at their position in the
/// encoding.
fn parse_operands(
    opcode: Opcode,
    args: &[&str],
    start: usize,
    pending: &mut Vec<(usize, String)>,
) -> Result<Vec<Operand>, AssemblyErrorKind> {
    let signature = opcode.signature();
    if signature == [OperandKind::LabelTable] {
        let (count, labels) = args.split_first().ok_or(AssemblyErrorKind::ArityMismatch {
            mnemonic: opcode.mnemonic(),
            expected: 1,
            found: 0,
        })?;
        let count = parse_int(count)?;
        if usize::try_from(count).ok() != Some(labels.len()) {
            return Err(AssemblyErrorKind::ArityMismatch {
                mnemonic: opcode.mnemonic(),
                expected: count.max(0) as usize,
                found: labels.len(),
            });
        }
        let mut table = Vec::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            // opcode byte, then the count, then 4 bytes per entry
            table.push(label_operand(label, start + 1 + 4 + 4 * i, pending));
        }
        return Ok(vec![Operand::Table(table)]);
    }

    if args.len() != signature.len() {
        return Err(AssemblyErrorKind::ArityMismatch {
            mnemonic: opcode.mnemonic(),
            expected: signature.len(),
            found: args.len(),
        });
    }

    let mut operands = Vec::with_capacity(args.len());
    for (i, (arg, kind)) in args.iter().zip(signature).enumerate() {
        let operand = match kind {
            OperandKind::Int => Operand::Int(parse_int(arg)?),
            // Labels only follow fixed-width operands.
            OperandKind::Label => Operand::Int(label_operand(arg, start + 1 + 4 * i, pending)),
            OperandKind::BuiltinRef => {
                if builtins::lookup(arg).is_none() {
                    return Err(AssemblyErrorKind::UnknownBuiltin(arg.to_string()));
                }
                Operand::Text(arg.as_bytes().to_vec())
            }
            OperandKind::Literal => Operand::Text(arg.as_bytes().to_vec()),
            OperandKind::LabelTable => return Err(opcode.operand_mismatch().into()),
        };
        operands.push(operand);
    }
    Ok(operands)
}

fn parse_int(arg: &str) -> Result<i32, AssemblyErrorKind> {
    arg.parse()
        .map_err(|_| AssemblyErrorKind::InvalidInteger(arg.to_string()))
}

/// An integer is taken as an absolute position; anything else is a label name.
fn label_operand(arg: &str, at: usize, pending: &mut Vec<(usize, String)>) -> i32 {
    if let Ok(n) = arg.parse::<i32>() {
        return n;
    }
    pending.push((at, arg.to_string()));
    0
}
