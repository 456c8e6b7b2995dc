// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-threaded program descriptors (`.mtss`).
//!
//! ```text
//! #SIMPLESCRIPT_MULTITHREADED 2
//! #THREAD "producer.ss" 10
//! #THREAD "consumer.ss"
//! ```
//!
//! Each `#THREAD` line spawns one thread whose id is its index and whose
//! argv is the listed integers prefixed by the thread id.

use std::fs;
use std::path::{Path, PathBuf};

use gridvm_proto::{ProgramId, ThreadId};

use crate::error::VmError;

const MT_TAG: &str = "#SIMPLESCRIPT_MULTITHREADED";
const THREAD_TAG: &str = "#THREAD";

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSpec {
    pub program_id: ProgramId,
    pub thread_id: ThreadId,
    pub source_file: PathBuf,
    pub argv: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDescriptor {
    pub program_id: ProgramId,
    pub descriptor_path: PathBuf,
    pub threads: Vec<ThreadSpec>,
}

fn bad(message: impl Into<String>) -> VmError {
    VmError::Descriptor(message.into())
}

/// Parse a `.mtss` descriptor. The program id is derived from the absolute
/// descriptor path so every node computes the same id for the same file.
pub fn parse_descriptor(path: &Path) -> Result<ProgramDescriptor, VmError> {
    let abs = path
        .canonicalize()
        .map_err(|e| bad(format!("{}: {e}", path.display())))?;
    let program_id = ProgramId::derive(&abs.to_string_lossy());
    let text = fs::read_to_string(&abs)?;
    let mut lines = text.lines();

    let header = lines.next().ok_or_else(|| bad("empty descriptor"))?;
    let mut parts = header.split_whitespace();
    if parts.next() != Some(MT_TAG) {
        return Err(bad(format!("first line must start with {MT_TAG}")));
    }
    let count: usize = parts
        .next()
        .ok_or_else(|| bad("missing thread count"))?
        .parse()
        .map_err(|_| bad("thread count is not a number"))?;

    let dir = abs.parent().ok_or_else(|| bad("descriptor has no parent"))?;
    let mut threads = Vec::with_capacity(count);
    for thread_id in 0..count as ThreadId {
        let line = lines
            .next()
            .ok_or_else(|| bad(format!("expected {count} #THREAD lines, got {thread_id}")))?;
        threads.push(parse_thread_line(line, program_id.clone(), thread_id, dir)?);
    }

    Ok(ProgramDescriptor {
        program_id,
        descriptor_path: abs,
        threads,
    })
}

fn parse_thread_line(
    line: &str,
    program_id: ProgramId,
    thread_id: ThreadId,
    dir: &Path,
) -> Result<ThreadSpec, VmError> {
    let rest = line
        .trim_start()
        .strip_prefix(THREAD_TAG)
        .ok_or_else(|| bad(format!("thread {thread_id}: line must start with {THREAD_TAG}")))?
        .trim_start();

    // The source file name is quoted and may contain spaces.
    let rest = rest
        .strip_prefix('"')
        .ok_or_else(|| bad(format!("thread {thread_id}: missing quoted source file")))?;
    let (name, tail) = rest
        .split_once('"')
        .ok_or_else(|| bad(format!("thread {thread_id}: unterminated source file name")))?;

    let source_file = dir.join(name);
    if !source_file.is_file() {
        return Err(bad(format!(
            "thread {thread_id}: no such file {}",
            source_file.display()
        )));
    }

    let mut argv = vec![thread_id as i64];
    for arg in tail.split_whitespace() {
        argv.push(
            arg.parse::<i64>()
                .map_err(|_| bad(format!("thread {thread_id}: bad argument {arg}")))?,
        );
    }

    Ok(ThreadSpec {
        program_id,
        thread_id,
        source_file,
        argv,
    })
}
