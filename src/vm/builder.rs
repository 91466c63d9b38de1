//! Code builder and linker
//!
//! A compiler emits each callable body into its own block and every constant
//! into the shared data pool. Blocks only know block-relative offsets while
//! they are being filled; label and data references are written as 4-byte
//! placeholders and recorded as patches. `link` then lays the blocks out after
//! the header in creation order, appends the data pool, and rewrites every
//! patch site with its absolute address.

use std::fmt;

use tracing::debug;

use super::builtins;
use super::bytecode::{Module, HEADER_SIZE};
use super::opcodes::{write_i32, write_i32_at, Opcode, OperandKind};
use crate::error::{EncodingError, LinkError};

/// Handle to a block owned by a [`Builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

/// A code position, resolved at link time. Every block has a start label;
/// other labels are created with `new_label` and placed with `place_label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Offset into the data pool, relative to the start of the data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataOffset(usize);

impl DataOffset {
    pub fn offset(self) -> usize {
        self.0
    }
}

/// Symbolic operand for [`BlockBuilder::emit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(i32),
    Label(Label),
    Data(DataOffset),
    Text(Vec<u8>),
    Table(Vec<Label>),
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<Label> for Arg {
    fn from(l: Label) -> Self {
        Arg::Label(l)
    }
}

impl From<DataOffset> for Arg {
    fn from(d: DataOffset) -> Self {
        Arg::Data(d)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.as_bytes().to_vec())
    }
}

impl Arg {
    fn fits(&self, kind: OperandKind) -> bool {
        matches!(
            (self, kind),
            (Arg::Int(_), OperandKind::Int | OperandKind::Label)
                | (Arg::Label(_) | Arg::Data(_), OperandKind::Label)
                | (Arg::Text(_), OperandKind::BuiltinRef | OperandKind::Literal)
                | (Arg::Table(_), OperandKind::LabelTable)
        )
    }
}

struct Block {
    start: Label,
    code: Vec<u8>,
    label_patches: Vec<(usize, Label)>,
    data_patches: Vec<(usize, DataOffset)>,
}

/// Accumulates blocks and the data pool for one module.
#[derive(Default)]
pub struct Builder {
    blocks: Vec<Block>,
    /// Owning block and block-relative offset of each placed label
    labels: Vec<Option<(BlockId, usize)>>,
    data: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        let start = self.new_label();
        self.labels[start.0] = Some((id, 0));
        self.blocks.push(Block {
            start,
            code: Vec::new(),
            label_patches: Vec::new(),
            data_patches: Vec::new(),
        });
        id
    }

    /// Open a block for emission.
    pub fn block(&mut self, id: BlockId) -> BlockBuilder<'_> {
        BlockBuilder { builder: self, id }
    }

    /// Declare a label to be placed later, possibly in another block.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// The label at offset 0 of `id`.
    pub fn start_label(&self, id: BlockId) -> Label {
        self.blocks[id.0].start
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> DataOffset {
        let offset = DataOffset(self.data.len());
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Append `s` and a NUL terminator to the data pool.
    pub fn write_data_str(&mut self, s: &str) -> DataOffset {
        let offset = self.write_data(s.as_bytes());
        self.data.push(0);
        offset
    }

    pub fn write_data_int(&mut self, v: i32) -> DataOffset {
        self.write_data(&v.to_le_bytes())
    }

    /// Write the record that `PUSH_DATA` values point at for printing.
    pub fn write_type_metadata(&mut self, type_name: &str, constructors: &[&str]) -> DataOffset {
        let offset = self.write_data_int(constructors.len() as i32);
        self.write_data_str(type_name);
        for c in constructors {
            self.write_data_str(c);
        }
        offset
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Size in bytes of the code emitted so far into every block.
    pub fn code_len(&self) -> usize {
        self.blocks.iter().map(|b| b.code.len()).sum()
    }

    /// Lay out every block, resolve every patch, and produce the module.
    pub fn link(self) -> Result<Module, LinkError> {
        let mut bases = Vec::with_capacity(self.blocks.len());
        let mut next = HEADER_SIZE;
        for block in &self.blocks {
            bases.push(next);
            next += block.code.len();
        }
        let data_offset = next;

        let mut image = Vec::with_capacity(data_offset + self.data.len());
        write_i32(&mut image, address(data_offset)?);

        for (block, &base) in self.blocks.iter().zip(&bases) {
            image.extend_from_slice(&block.code);

            for &(at, label) in &block.label_patches {
                let (owner, offset) = self
                    .labels
                    .get(label.0)
                    .copied()
                    .flatten()
                    .ok_or_else(|| LinkError::UnresolvedLabel {
                        label: label.to_string(),
                        block: block.start.to_string(),
                        offset: at,
                    })?;
                write_i32_at(&mut image, base + at, address(bases[owner.0] + offset)?);
            }
            for &(at, data) in &block.data_patches {
                write_i32_at(&mut image, base + at, address(data_offset + data.0)?);
            }
        }

        image.extend_from_slice(&self.data);
        debug!(
            blocks = self.blocks.len(),
            code = data_offset - HEADER_SIZE,
            data = self.data.len(),
            "linked module"
        );
        Ok(Module::from_linked(image, data_offset))
    }
}

fn address(offset: usize) -> Result<i32, LinkError> {
    i32::try_from(offset).map_err(|_| LinkError::AddressOverflow(offset))
}

/// Emission cursor over one block.
pub struct BlockBuilder<'a> {
    builder: &'a mut Builder,
    id: BlockId,
}

impl BlockBuilder<'_> {
    fn current(&mut self) -> &mut Block {
        &mut self.builder.blocks[self.id.0]
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Block-relative offset of the next byte.
    pub fn offset(&self) -> usize {
        self.builder.blocks[self.id.0].code.len()
    }

    pub fn start_label(&self) -> Label {
        self.builder.start_label(self.id)
    }

    /// Emit one instruction. Operands are checked against the opcode's
    /// signature before anything is written.
    pub fn emit(&mut self, opcode: Opcode, args: &[Arg]) -> Result<(), EncodingError> {
        let signature = opcode.signature();
        let fits = args.len() == signature.len() && args.iter().zip(signature).all(|(a, k)| a.fits(*k));
        if !fits {
            return Err(opcode.operand_mismatch());
        }
        if args.iter().any(|a| matches!(a, Arg::Text(s) if s.contains(&0))) {
            return Err(EncodingError::EmbeddedNul);
        }

        self.current().code.push(opcode.byte());
        for arg in args {
            match arg {
                Arg::Int(v) => self.emit_int(*v),
                Arg::Label(l) => self.emit_label_ref(*l),
                Arg::Data(d) => self.emit_data_ref(*d),
                Arg::Text(s) => {
                    let code = &mut self.current().code;
                    code.extend_from_slice(s);
                    code.push(0);
                }
                Arg::Table(labels) => {
                    self.emit_int(labels.len() as i32);
                    for l in labels {
                        self.emit_label_ref(*l);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn emit_int(&mut self, v: i32) {
        write_i32(&mut self.current().code, v);
    }

    /// Reserve a 4-byte slot that `link` fills with the label's address.
    pub fn emit_label_ref(&mut self, label: Label) {
        let block = self.current();
        block.label_patches.push((block.code.len(), label));
        write_i32(&mut block.code, 0);
    }

    /// Reserve a 4-byte slot that `link` fills with the data item's address.
    pub fn emit_data_ref(&mut self, data: DataOffset) {
        let block = self.current();
        block.data_patches.push((block.code.len(), data));
        write_i32(&mut block.code, 0);
    }

    pub fn new_label(&mut self) -> Label {
        self.builder.new_label()
    }

    /// Create a label at the current position.
    pub fn mark_label(&mut self) -> Label {
        let offset = self.offset();
        self.builder.labels.push(Some((self.id, offset)));
        Label(self.builder.labels.len() - 1)
    }

    /// Bind a forward-declared label to the current position.
    pub fn place_label(&mut self, label: Label) -> Result<(), LinkError> {
        let offset = self.offset();
        let slot = self
            .builder
            .labels
            .get_mut(label.0)
            .ok_or_else(|| LinkError::ForeignLabel(label.to_string()))?;
        *slot = Some((self.id, offset));
        Ok(())
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> DataOffset {
        self.builder.write_data(bytes)
    }

    pub fn write_data_str(&mut self, s: &str) -> DataOffset {
        self.builder.write_data_str(s)
    }

    pub fn write_data_int(&mut self, v: i32) -> DataOffset {
        self.builder.write_data_int(v)
    }

    // ── Print sequences used by generated top-level code ─────────────

    pub fn emit_println(&mut self) -> Result<(), EncodingError> {
        self.emit(Opcode::PushBuiltin, &[builtins::PRINTLN.into()])?;
        self.emit(Opcode::PushUnit, &[])?;
        self.emit(Opcode::SwapCall, &[])
    }

    pub fn emit_print_string(&mut self, s: &str) -> Result<(), EncodingError> {
        self.emit(Opcode::PushBuiltin, &[builtins::PRINT.into()])?;
        self.emit(Opcode::PushString, &[s.into()])?;
        self.emit(Opcode::SwapCall, &[])
    }

    pub fn emit_print_literal_var(&mut self, depth: i32, offset: i32) -> Result<(), EncodingError> {
        self.emit(Opcode::PushBuiltin, &[builtins::PRINT_LITERAL.into()])?;
        self.emit(Opcode::PushVar, &[depth.into(), offset.into()])?;
        self.emit(Opcode::SwapCall, &[])
    }

    pub fn emit_fatal_error(&mut self, reason: &str, code: i32) -> Result<(), EncodingError> {
        self.emit(Opcode::PushBuiltin, &[builtins::FATAL_ERROR.into()])?;
        self.emit(Opcode::PushString, &[reason.into()])?;
        self.emit(Opcode::SwapCall, &[])?;
        self.emit(Opcode::PushInt, &[code.into()])?;
        self.emit(Opcode::SwapCall, &[])
    }
}
