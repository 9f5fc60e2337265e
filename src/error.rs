//! Typed error categories (spec.md §7) composed into a single crate-level
//! `Error` via `thiserror`'s `#[from]`, so embedders can match on phase
//! instead of parsing strings.

use thiserror::Error;

use crate::token::Position;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("{pos}: unterminated {kind}")]
    UnterminatedLiteral { pos: Position, kind: &'static str },
    #[error("{pos}: {message}")]
    Scan { pos: Position, message: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{pos}: no prefix parser for {symbol:?}")]
    NullNud { pos: Position, symbol: String },
    #[error("{pos}: no infix parser for {symbol:?}")]
    NullLed { pos: Position, symbol: String },
    #[error("{pos}: expected {expected:?}, found {found:?}")]
    AdvanceMismatch {
        pos: Position,
        expected: String,
        found: String,
    },
    #[error("{pos}: malformed type expression")]
    MalformedType { pos: Position },
    #[error("{pos}: cannot infer type for untyped auto-initialized declaration")]
    UntypedAutoInit { pos: Position },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("package {0:?} not found")]
    MissingFile(String),
    #[error("package {0:?} declared more than once")]
    MultiplePackages(String),
    #[error("malformed build constraint: {0:?}")]
    MalformedConstraint(String),
    #[error("file in package {file_pkg:?} claims package {decl_pkg:?}")]
    PackageNameMismatch { file_pkg: String, decl_pkg: String },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{pos}: undefined name {name:?}")]
    Undefined { pos: Position, name: String },
    #[error("{pos}: {message}")]
    Internal { pos: Position, message: String },
}

/// A runtime panic, carrying the VM's backtrace at the point it was raised
/// (spec.md §7's literal multi-line format: `pos: OPCODE: message` followed
/// by indented caller frames).
#[derive(Debug, Clone)]
pub struct PanicError {
    pub pos: Position,
    pub opcode: String,
    pub message: String,
    pub backtrace: Vec<(Position, String)>,
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}: {}: {}", self.pos, self.opcode, self.message)?;
        for (pos, name) in &self.backtrace {
            writeln!(f, "\tat {} ({})", name, pos)?;
        }
        Ok(())
    }
}

impl std::error::Error for PanicError {}

impl PanicError {
    pub fn new(pos: Position, opcode: impl Into<String>, message: impl Into<String>) -> Self {
        PanicError {
            pos,
            opcode: opcode.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("error in lexing: {0}")]
    Lex(#[from] LexError),
    #[error("error in parsing: {0}")]
    Parse(#[from] ParseError),
    #[error("error in loading: {0}")]
    Load(#[from] LoadError),
    #[error("error in compiling: {0}")]
    Compile(#[from] CompileError),
    #[error("error in evaluation:\n{0}")]
    Runtime(#[from] PanicError),
}
