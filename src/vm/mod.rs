//! Bytecode virtual machine
//!
//! Instruction set and encoding, the block builder and linker that produce
//! modules, and the stack machine that runs them.

pub mod opcodes;
pub mod bytecode;
pub mod builder;
pub mod builtins;
pub mod value;
pub mod machine;

pub use bytecode::Module;
pub use machine::VM;
pub use value::Value;
