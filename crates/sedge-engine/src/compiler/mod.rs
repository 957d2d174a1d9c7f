//! Token tree → code object.

pub mod codegen;
pub mod debug;
pub mod opcode;
