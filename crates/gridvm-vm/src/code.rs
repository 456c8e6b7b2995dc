// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Compiled code objects and their on-disk `.ssc` form.
//!
//! Framing: 4-byte big-endian magic `0xC0DE10CC`, then the CBOR-encoded
//! object, optionally xz-compressed. Compression is detected on read from
//! the xz stream magic, so both forms load transparently.

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bytecode::Op;
use crate::error::VmError;
use crate::value::Value;

pub const MAGIC: u32 = 0xC0DE_10CC;

const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Immutable output of the compiler, one per program source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    /// Instruction sequence.
    pub ops: Vec<Op>,
    /// Constant pool (deduplicated).
    pub consts: Vec<Value>,
    /// Declared variable names; index 0 is `$argc`.
    pub var_names: Vec<String>,
    /// Declared array names; index 0 is `$argv`.
    pub array_names: Vec<String>,
    /// Jump table: label id → instruction index.
    pub labels: Vec<u32>,
    /// Source label names by defining instruction index, for diagnostics.
    pub label_names: BTreeMap<String, u32>,
}

impl CodeObject {
    pub fn to_bytes(&self, compress: bool) -> Result<Vec<u8>, VmError> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body).map_err(|e| VmError::Codec(e.to_string()))?;

        let mut out = MAGIC.to_be_bytes().to_vec();
        if compress {
            let mut compressed = Vec::new();
            lzma_rs::xz_compress(&mut Cursor::new(&body[..]), &mut compressed)?;
            out.extend_from_slice(&compressed);
        } else {
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, VmError> {
        let magic = buf
            .get(..4)
            .ok_or_else(|| VmError::Codec("code object shorter than magic".into()))?;
        if magic != MAGIC.to_be_bytes() {
            return Err(VmError::BadMagic);
        }
        let body = &buf[4..];

        let plain;
        let body = if body.starts_with(&XZ_MAGIC) {
            let mut decompressed = Vec::new();
            lzma_rs::xz_decompress(&mut Cursor::new(body), &mut decompressed)
                .map_err(|e| VmError::Codec(e.to_string()))?;
            plain = decompressed;
            &plain[..]
        } else {
            body
        };

        ciborium::from_reader(body).map_err(|e| VmError::Codec(e.to_string()))
    }

    pub fn to_file(&self, path: &Path, compress: bool) -> Result<(), VmError> {
        fs::write(path, self.to_bytes(compress)?)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, VmError> {
        CodeObject::from_bytes(&fs::read(path)?)
    }
}
