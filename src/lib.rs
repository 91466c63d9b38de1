pub mod error;
pub mod vm;
pub mod asm;

pub use error::{Error, Result};
