// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid code object: bad magic")]
    BadMagic,

    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("codegen error at line {line}: {message}")]
    Codegen { line: u32, message: String },

    #[error("invalid program descriptor: {0}")]
    Descriptor(String),

    #[error("{0}")]
    Runtime(String),
}

impl VmError {
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime(message.into())
    }
}
