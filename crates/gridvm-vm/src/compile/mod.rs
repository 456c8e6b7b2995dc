// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SimpleScript compiler: lexer → line parser → bytecode generator.
//!
//! The language is a line-oriented assembly. A program starts with a
//! `#SIMPLESCRIPT` tag; every following non-blank line is one statement,
//! optionally prefixed by an `L…` label:
//!
//! ```text
//! #SIMPLESCRIPT
//!       SET $n 10
//! LOOP  SUB $n $n 1
//!       PRN "n is " $n
//!       BGT $n 0 LOOP
//!       RET
//! ```

mod ast;
mod codegen;
mod lexer;
mod parser;

pub use ast::{Operand, Statement, Stmt, Target};

use crate::code::CodeObject;
use crate::error::VmError;

/// Compile SimpleScript source text into a code object.
pub fn compile(source: &str) -> Result<CodeObject, VmError> {
    let lines = lexer::tokenize(source)?;
    let statements = parser::parse(&lines)?;
    codegen::generate(&statements)
}
