//! Text form of modules
//!
//! The assembler turns line-oriented source into a module; the disassembler
//! walks a module back into a listing for inspection or re-assembly.

pub mod assembler;
pub mod disassembler;

pub use assembler::assemble;
pub use disassembler::{disassemble, Listing};
