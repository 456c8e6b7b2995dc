// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Loading thread code from disk, with a bytecode cache.
//!
//! `.ssc` files load directly. `.ss` sources are compiled; sources of at
//! least [`CACHE_THRESHOLD_BYTES`] also keep a hidden compiled sibling
//! (`prog.ss` → `.prog.ssc`) that is reused while it is newer than the
//! source. Tiny files are recompiled every time; the cache would cost more
//! than it saves.

use std::path::{Path, PathBuf};

use crate::code::CodeObject;
use crate::compile::compile;
use crate::error::VmError;

pub const CACHE_THRESHOLD_BYTES: u64 = 600;

/// Load thread code from a `.ss` or `.ssc` file.
pub fn load(path: &Path) -> Result<CodeObject, VmError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ssc") => CodeObject::from_file(path),
        Some("ss") => load_source(path),
        _ => Err(VmError::Descriptor(format!(
            "unsupported code file {}",
            path.display()
        ))),
    }
}

fn cache_path(source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?.to_str()?;
    Some(source.with_file_name(format!(".{stem}.ssc")))
}

fn load_source(path: &Path) -> Result<CodeObject, VmError> {
    let meta = path.metadata()?;
    if meta.len() < CACHE_THRESHOLD_BYTES {
        return compile(&std::fs::read_to_string(path)?);
    }

    let Some(cache) = cache_path(path) else {
        return compile(&std::fs::read_to_string(path)?);
    };

    if let (Ok(cache_meta), Ok(source_mtime)) = (cache.metadata(), meta.modified()) {
        if cache_meta.modified().is_ok_and(|m| m > source_mtime) {
            match CodeObject::from_file(&cache) {
                Ok(code) => return Ok(code),
                Err(e) => tracing::warn!("stale bytecode cache {}: {e}", cache.display()),
            }
        }
    }

    tracing::debug!("building bytecode for {}", path.display());
    let code = compile(&std::fs::read_to_string(path)?)?;
    if let Err(e) = code.to_file(&cache, true) {
        tracing::warn!("cannot write bytecode cache {}: {e}", cache.display());
    }
    Ok(code)
}
