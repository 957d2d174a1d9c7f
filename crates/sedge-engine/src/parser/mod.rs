//! Source text → token tree.
//!
//! The lexer emits a flat token list; the parser pairs brackets and folds
//! operator precedence into a homogeneous token tree that the code generator
//! walks directly.

pub mod lexer;
#[allow(clippy::module_inception)]
pub mod parser;
pub mod token;

use token::Node;

/// A lex/parse/codegen failure with its source line.
#[derive(Debug, Clone)]
pub struct ParseFault {
    pub message: String,
    pub line: u32,
}

impl ParseFault {
    pub(crate) fn new(message: impl Into<String>, line: u32) -> ParseFault {
        ParseFault {
            message: message.into(),
            line,
        }
    }
}

/// Lex and parse a source buffer into the token tree root.
pub fn parse(src: &str) -> Result<Node, ParseFault> {
    let tokens = lexer::lex(src)?;
    parser::parse(tokens)
}
