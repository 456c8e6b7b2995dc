// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Identities shared across the cluster.
//!
//! Runtimes and programs are named by short URL-safe base64 slices of a
//! SHA-256 digest: long enough to be unique in any realistic cluster, short
//! enough to type into the shell.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// First `len` characters of the URL-safe base64 SHA-256 of `input`.
pub fn short_hash(input: impl AsRef<[u8]>, len: usize) -> String {
    let digest = Sha256::digest(input.as_ref());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(len);
    encoded
}

// ── Runtime identity ──────────────────────────────────────────────────────────

/// Identifies one node (process instance) of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(String);

impl RuntimeId {
    const LEN: usize = 4;

    /// Derive a runtime id from a seed, normally the process start time.
    pub fn derive(seed: &str) -> Self {
        RuntimeId(short_hash(seed, Self::LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuntimeId {
    fn from(s: &str) -> Self {
        RuntimeId(s.to_string())
    }
}

// ── Program / thread identity ─────────────────────────────────────────────────

/// Identifies a loaded program, derived from the absolute path of its
/// `.mtss` descriptor so every node computes the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    const LEN: usize = 8;

    pub fn derive(descriptor_path: &str) -> Self {
        ProgramId(short_hash(descriptor_path, Self::LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(s: &str) -> Self {
        ProgramId(s.to_string())
    }
}

/// Index of a thread within its program (0..N−1).
pub type ThreadId = u32;

/// Cluster-wide unique thread identity.
///
/// Serializes as the two-element array `[program_id, thread_id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadUid(pub ProgramId, pub ThreadId);

impl ThreadUid {
    pub fn program(&self) -> &ProgramId {
        &self.0
    }

    pub fn thread(&self) -> ThreadId {
        self.1
    }
}

impl fmt::Display for ThreadUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

// ── Thread status ─────────────────────────────────────────────────────────────

/// Execution status of one interpreter.
///
/// `wake_up_at` is meaningful only while `Sleeping`; `waiting_from` only
/// while `Blocked`. On the wire the status travels as its integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ThreadStatus {
    Running = 0,
    Sleeping = 1,
    Blocked = 2,
    Stopped = 3,
    Finished = 4,
    Crashed = 5,
}

impl From<ThreadStatus> for u8 {
    fn from(s: ThreadStatus) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for ThreadStatus {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ThreadStatus::Running,
            1 => ThreadStatus::Sleeping,
            2 => ThreadStatus::Blocked,
            3 => ThreadStatus::Stopped,
            4 => ThreadStatus::Finished,
            5 => ThreadStatus::Crashed,
            other => return Err(format!("invalid thread status {other}")),
        })
    }
}

impl ThreadStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadStatus::Finished | ThreadStatus::Crashed)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadStatus::Running => "running",
            ThreadStatus::Sleeping => "sleeping",
            ThreadStatus::Blocked => "blocked",
            ThreadStatus::Stopped => "stopped",
            ThreadStatus::Finished => "finished",
            ThreadStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_stable_and_truncated() {
        let a = short_hash("same input", 8);
        let b = short_hash("same input", 8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_ne!(a, short_hash("other input", 8));
    }

    #[test]
    fn thread_uid_serializes_as_array() {
        let uid = ThreadUid(ProgramId::derive("/tmp/prog.mtss"), 3);
        let json = serde_json::to_value(&uid).unwrap();
        assert!(json.is_array());
        let back: ThreadUid = serde_json::from_value(json).unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn status_round_trips_as_integer() {
        let json = serde_json::to_value(ThreadStatus::Blocked).unwrap();
        assert_eq!(json, serde_json::json!(2));
        let back: ThreadStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, ThreadStatus::Blocked);
        assert!(serde_json::from_value::<ThreadStatus>(serde_json::json!(9)).is_err());
    }
}
