//! Sedge language engine
//!
//! This crate provides the execution core of the Sedge scripting language:
//! - NaN-boxed value representation over typed, non-moving object pools
//! - Stop-the-world mark/sweep garbage collector coordinated across host
//!   threads with a bottleneck safepoint protocol
//! - The open-addressed hash table used both as the language's associative
//!   container and as the activation record of every call
//! - Lexer, token-tree parser, and bytecode generator
//! - The stack-based bytecode interpreter and the host embedding surface

#![warn(rust_2018_idioms)]

pub mod compiler;
pub mod parser;
pub mod vm;

pub use vm::heap::{FuncDef, GhostType};
pub use vm::interp::Vm;
pub use vm::runtime::{Context, HeapStats, Runtime};
pub use vm::value::{Kind, Ref};
pub use vm::{Fail, VmRes};

/// Errors surfaced at the host embedding boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lexing, parsing, or code-generation failure, fatal to the current
    /// compile.
    #[error("{file}:{line}: {message}")]
    Parse {
        /// What went wrong.
        message: String,
        /// Source file name handed to the compile call.
        file: String,
        /// 1-based source line.
        line: u32,
    },

    /// Runtime failure: the error message plus a deepest-first stack trace.
    #[error("{message}")]
    Runtime {
        /// Single-line error message.
        message: String,
        /// (file, line) for each active frame, deepest first.
        trace: Vec<TraceFrame>,
    },
}

/// One entry of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Source file of the frame's code object.
    pub file: String,
    /// Line active at the frame's instruction pointer.
    pub line: u32,
}

impl Error {
    /// Render the message followed by the traceback, one frame per line.
    pub fn traceback(&self) -> String {
        match self {
            Error::Parse { .. } => self.to_string(),
            Error::Runtime { message, trace } => {
                let mut out = message.clone();
                for (i, fr) in trace.iter().enumerate() {
                    if i == 0 {
                        out.push_str(&format!("\n  at {}, line {}", fr.file, fr.line));
                    } else {
                        out.push_str(&format!("\n  called from: {}, line {}", fr.file, fr.line));
                    }
                }
                out
            }
        }
    }
}

/// Result alias for the host-facing API.
pub type Result<T> = std::result::Result<T, Error>;
