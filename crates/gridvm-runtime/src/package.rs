// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Thread packages: the serialized bundle that carries a thread between
//! nodes.
//!
//! Wire form: xz-compressed `MAGIC ‖ CBOR{origin, program, thread, code,
//! state, pending}`. The magic guards against feeding arbitrary payloads to
//! the CBOR decoder.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use gridvm_comms::MessageBundle;
use gridvm_proto::{ProgramId, RuntimeId, ThreadId, ThreadUid};
use gridvm_vm::{code::MAGIC, CodeObject, Interpreter, InterpreterState};

use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadPackage {
    /// The runtime that first loaded the thread; keeps the bookkeeping
    /// responsibility no matter how often the thread moves.
    pub origin: RuntimeId,
    pub program_id: ProgramId,
    pub thread_id: ThreadId,
    pub code: CodeObject,
    pub state: InterpreterState,
    pub pending: MessageBundle,
}

impl ThreadPackage {
    /// Capture a (removed) interpreter and its drained inbox.
    pub fn from_interpreter(interpreter: Interpreter, pending: MessageBundle) -> Self {
        let origin = interpreter.origin().clone();
        let uid = interpreter.uid().clone();
        let state = interpreter.save_state();
        ThreadPackage {
            origin,
            program_id: uid.program().clone(),
            thread_id: uid.thread(),
            code: interpreter.into_code(),
            state,
            pending,
        }
    }

    pub fn thread_uid(&self) -> ThreadUid {
        ThreadUid(self.program_id.clone(), self.thread_id)
    }

    /// Rebuild the interpreter exactly where it left off.
    pub fn into_interpreter(self) -> (Interpreter, MessageBundle) {
        let mut interpreter = Interpreter::new(
            self.origin,
            self.program_id,
            self.thread_id,
            self.code,
        );
        interpreter.load_state(self.state);
        (interpreter, self.pending)
    }

    pub fn pack(&self) -> Result<Vec<u8>, RuntimeError> {
        let mut body = MAGIC.to_be_bytes().to_vec();
        ciborium::into_writer(self, &mut body).map_err(|e| RuntimeError::Codec(e.to_string()))?;

        let mut compressed = Vec::new();
        lzma_rs::xz_compress(&mut Cursor::new(&body[..]), &mut compressed)
            .map_err(|e| RuntimeError::Codec(e.to_string()))?;
        Ok(compressed)
    }

    pub fn unpack(blob: &[u8]) -> Result<Self, RuntimeError> {
        let mut body = Vec::new();
        lzma_rs::xz_decompress(&mut Cursor::new(blob), &mut body)
            .map_err(|e| RuntimeError::Codec(e.to_string()))?;

        let magic = body
            .get(..4)
            .ok_or_else(|| RuntimeError::Codec("package shorter than magic".into()))?;
        if magic != MAGIC.to_be_bytes() {
            return Err(RuntimeError::Codec("bad package magic".into()));
        }
        ciborium::from_reader(&body[4..]).map_err(|e| RuntimeError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridvm_vm::compile::compile;
    use gridvm_vm::Value;

    fn blocked_interpreter() -> Interpreter {
        let code = compile("#SIMPLESCRIPT\nSET $x 41\nRCV 0 $y\nRET\n").unwrap();
        let mut interp = Interpreter::new(
            RuntimeId::derive("origin"),
            ProgramId::derive("/demo.mtss"),
            1,
            code,
        );
        interp.start(&[1]);
        interp
    }

    #[test]
    fn pack_unpack_preserves_state_and_messages() {
        let interp = blocked_interpreter();
        let uid = interp.uid().clone();
        let state = interp.save_state();
        let pending: MessageBundle = vec![(
            (uid.clone(), ThreadUid(uid.program().clone(), 0)),
            vec![Value::Int(42)],
        )];

        let package = ThreadPackage::from_interpreter(interp, pending.clone());
        let blob = package.pack().unwrap();
        let unpacked = ThreadPackage::unpack(&blob).unwrap();
        assert_eq!(unpacked, package);

        let (restored, restored_pending) = unpacked.into_interpreter();
        assert_eq!(restored.save_state(), state);
        assert_eq!(restored_pending, pending);
        assert_eq!(restored.origin(), &RuntimeId::derive("origin"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ThreadPackage::unpack(b"not even xz").is_err());
    }
}
