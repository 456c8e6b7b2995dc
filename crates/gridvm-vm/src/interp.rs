// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The stack interpreter.
//!
//! One interpreter executes one thread, one instruction per scheduler turn.
//! Every suspension (`SND` failure, blocking `RCV`, `SLP`, `RET`, crash) is
//! reported through the [`StepResult`] returned by [`Interpreter::step`];
//! nothing escapes as a panic or error through the scheduler loop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gridvm_proto::{ProgramId, RuntimeId, ThreadId, ThreadStatus, ThreadUid};

use crate::bytecode::{ArithOp, CmpOp, Op, OpCode};
use crate::code::CodeObject;
use crate::error::VmError;
use crate::value::{arith, compare, Value};

// ── The seam towards the communication bus ────────────────────────────────────

/// Failure to hand a message to the cluster (no node claims the receiver).
#[derive(Debug, Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

/// What an interpreter needs from the outside world.
///
/// Implemented by the communication bus; tests use an in-memory queue map.
pub trait MessagePort {
    /// Deliver `msg` from `sender` to `recv`, possibly across the cluster.
    fn send_message(&self, recv: ThreadUid, sender: ThreadUid, msg: Value)
        -> Result<(), SendError>;

    /// Non-blocking pop of the next message from `sender` to `recv`.
    fn receive_message(&self, sender: ThreadUid, recv: ThreadUid) -> Option<Value>;

    /// Queue `text` for printing at the thread's origin runtime.
    fn send_print(&self, origin: &RuntimeId, thread: ThreadUid, text: String);
}

// ── Step outcome ──────────────────────────────────────────────────────────────

/// Result of executing one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Keep scheduling this thread.
    Continued,
    /// `RCV` found no message; the PC was not advanced so the instruction
    /// retries once the scheduler wakes the thread.
    Blocked,
    /// `SLP` until the given deadline; the PC was advanced.
    Sleeping(Instant),
    /// `RET` executed.
    Finished,
    /// A runtime error; the reason includes the failing instruction.
    Crashed(String),
}

/// Internal control flow of a single opcode.
enum Control {
    Next,
    Jump(usize),
    Block,
    Sleep(Instant),
    Finish,
}

// ── Serialized state ──────────────────────────────────────────────────────────

/// Self-contained snapshot of an interpreter, the `state` part of a thread
/// package. `wake_up_at` is deliberately absent: a migrated sleeper wakes on
/// arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterState {
    pub pc: u32,
    pub vars: BTreeMap<u16, Value>,
    pub arrays: BTreeMap<u16, BTreeMap<i64, Value>>,
    pub stack: Vec<Value>,
    pub status: ThreadStatus,
    pub waiting_from: Option<ThreadUid>,
}

// ── Interpreter ───────────────────────────────────────────────────────────────

pub struct Interpreter {
    origin: RuntimeId,
    uid: ThreadUid,
    code: CodeObject,
    pc: usize,
    vars: BTreeMap<u16, Value>,
    arrays: BTreeMap<u16, BTreeMap<i64, Value>>,
    stack: Vec<Value>,
    status: ThreadStatus,
    wake_up_at: Option<Instant>,
    waiting_from: Option<ThreadUid>,
}

impl Interpreter {
    pub fn new(origin: RuntimeId, program: ProgramId, thread: ThreadId, code: CodeObject) -> Self {
        Interpreter {
            origin,
            uid: ThreadUid(program, thread),
            code,
            pc: 0,
            vars: BTreeMap::new(),
            arrays: BTreeMap::new(),
            stack: Vec::new(),
            status: ThreadStatus::Stopped,
            wake_up_at: None,
            waiting_from: None,
        }
    }

    /// Install `argv` (already prefixed with the thread id) and mark the
    /// thread runnable. Variable 0 is `$argc`, array 0 is `$argv`.
    pub fn start(&mut self, argv: &[i64]) {
        let map: BTreeMap<i64, Value> = argv
            .iter()
            .enumerate()
            .map(|(i, v)| (i as i64, Value::Int(*v)))
            .collect();
        self.vars.insert(0, Value::Int(argv.len() as i64));
        self.arrays.insert(0, map);
        self.status = ThreadStatus::Running;
    }

    // ── Accessors used by the scheduler ──────────────────────────────────────

    pub fn uid(&self) -> &ThreadUid {
        &self.uid
    }

    pub fn origin(&self) -> &RuntimeId {
        &self.origin
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn wake_up_at(&self) -> Option<Instant> {
        self.wake_up_at
    }

    pub fn waiting_from(&self) -> Option<&ThreadUid> {
        self.waiting_from.as_ref()
    }

    /// Transition back to RUNNING (sleep expired or a message arrived).
    pub fn wake(&mut self) {
        self.status = ThreadStatus::Running;
        self.wake_up_at = None;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    // ── Save / load ──────────────────────────────────────────────────────────

    pub fn save_state(&self) -> InterpreterState {
        InterpreterState {
            pc: self.pc as u32,
            vars: self.vars.clone(),
            arrays: self.arrays.clone(),
            stack: self.stack.clone(),
            status: self.status,
            waiting_from: self.waiting_from.clone(),
        }
    }

    pub fn load_state(&mut self, state: InterpreterState) {
        self.pc = state.pc as usize;
        self.vars = state.vars;
        self.arrays = state.arrays;
        self.stack = state.stack;
        self.status = state.status;
        self.waiting_from = state.waiting_from;
        self.wake_up_at = None;
    }

    pub fn code(&self) -> &CodeObject {
        &self.code
    }

    pub fn into_code(self) -> CodeObject {
        self.code
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Execute exactly one instruction.
    pub fn step(&mut self, port: &dyn MessagePort) -> StepResult {
        let Some(op) = self.code.ops.get(self.pc).cloned() else {
            self.status = ThreadStatus::Crashed;
            return StepResult::Crashed("program ran past the last instruction without RET".into());
        };

        match self.exec(&op, port) {
            Ok(Control::Next) => {
                self.pc += 1;
                StepResult::Continued
            }
            Ok(Control::Jump(target)) => {
                self.pc = target;
                StepResult::Continued
            }
            Ok(Control::Block) => {
                // PC untouched: the RCV retries when the thread wakes.
                self.status = ThreadStatus::Blocked;
                StepResult::Blocked
            }
            Ok(Control::Sleep(deadline)) => {
                self.pc += 1;
                self.status = ThreadStatus::Sleeping;
                self.wake_up_at = Some(deadline);
                StepResult::Sleeping(deadline)
            }
            Ok(Control::Finish) => {
                self.pc += 1;
                self.status = ThreadStatus::Finished;
                StepResult::Finished
            }
            Err(e) => {
                self.status = ThreadStatus::Crashed;
                StepResult::Crashed(format!("line {}: {op}: {e}", op.line))
            }
        }
    }

    fn exec(&mut self, op: &Op, port: &dyn MessagePort) -> Result<Control, VmError> {
        let arg = op.arg;
        match op.opcode {
            OpCode::LoadConst => {
                let value = self
                    .code
                    .consts
                    .get(arg as usize)
                    .ok_or_else(|| VmError::runtime(format!("no constant {arg}")))?
                    .clone();
                self.stack.push(value);
                Ok(Control::Next)
            }
            OpCode::LoadVar => {
                let value = self
                    .vars
                    .get(&arg)
                    .ok_or_else(|| VmError::runtime(format!("{} read before set", self.var_name(arg))))?
                    .clone();
                self.stack.push(value);
                Ok(Control::Next)
            }
            OpCode::StoreVar => {
                let value = self.pop()?;
                self.vars.insert(arg, value);
                Ok(Control::Next)
            }
            OpCode::BuildVar => Ok(Control::Next),
            OpCode::LoadArray => {
                let index = self.pop()?.as_index()?;
                let value = self
                    .arrays
                    .get(&arg)
                    .and_then(|a| a.get(&index))
                    .ok_or_else(|| {
                        VmError::runtime(format!("{}[{index}] read before set", self.array_name(arg)))
                    })?
                    .clone();
                self.stack.push(value);
                Ok(Control::Next)
            }
            OpCode::StoreArray => {
                let index = self.pop()?.as_index()?;
                let value = self.pop()?;
                let array_name = self.array_name(arg);
                self.arrays
                    .get_mut(&arg)
                    .ok_or_else(|| {
                        VmError::runtime(format!("{} not built", array_name))
                    })?
                    .insert(index, value);
                Ok(Control::Next)
            }
            OpCode::BuildArray => {
                self.arrays.entry(arg).or_default();
                // One-shot: the declaration rewrites itself to NOP.
                self.code.ops[self.pc] = Op::new(OpCode::Nop, 0, op.line);
                Ok(Control::Next)
            }
            OpCode::RotTwo => Ok(Control::Next),
            OpCode::Arithm => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = arith(ArithOp::from_arg(arg)?, &a, &b)?;
                self.stack.push(r);
                Ok(Control::Next)
            }
            OpCode::CompareOp => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = compare(CmpOp::from_arg(arg)?, &a, &b)?;
                self.stack.push(r);
                Ok(Control::Next)
            }
            OpCode::Jmp => Ok(Control::Jump(self.label_target(arg)?)),
            OpCode::JmpIfTrue => {
                if self.pop()?.truthy() {
                    Ok(Control::Jump(self.label_target(arg)?))
                } else {
                    Ok(Control::Next)
                }
            }
            OpCode::Snd => {
                let value = self.pop()?;
                let dst = self.pop()?.as_index()?;
                let recv = ThreadUid(self.uid.program().clone(), dst as ThreadId);
                port.send_message(recv, self.uid.clone(), value)
                    .map_err(|e| VmError::runtime(e.to_string()))?;
                Ok(Control::Next)
            }
            OpCode::Rcv => {
                let src = self.pop()?;
                let src_id = src.as_index()?;
                let sender = ThreadUid(self.uid.program().clone(), src_id as ThreadId);
                match port.receive_message(sender.clone(), self.uid.clone()) {
                    Some(msg) => {
                        self.stack.push(msg);
                        self.waiting_from = None;
                        Ok(Control::Next)
                    }
                    None => {
                        // Put the sender id back so the retry pops it again.
                        self.stack.push(src);
                        self.waiting_from = Some(sender);
                        Ok(Control::Block)
                    }
                }
            }
            OpCode::Slp => {
                let secs = self.pop()?.as_seconds()?;
                if !secs.is_finite() {
                    return Err(VmError::runtime(format!("{secs} is not a valid sleep time")));
                }
                let deadline = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
                Ok(Control::Sleep(deadline))
            }
            OpCode::Prn => {
                let mut values = Vec::with_capacity(arg as usize);
                for _ in 0..arg {
                    values.push(self.pop()?);
                }
                let format = match self.pop()? {
                    Value::Str(s) => s,
                    other => {
                        return Err(VmError::runtime(format!("{other} is not a format string")))
                    }
                };
                let mut text = format;
                let mut first = true;
                for value in values.iter().rev() {
                    if !first {
                        text.push_str(", ");
                    }
                    text.push_str(&value.to_string());
                    first = false;
                }
                port.send_print(&self.origin, self.uid.clone(), text);
                Ok(Control::Next)
            }
            OpCode::Ret => Ok(Control::Finish),
            OpCode::Nop => Ok(Control::Next),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::runtime("operand stack underflow"))
    }

    fn label_target(&self, arg: u16) -> Result<usize, VmError> {
        let target = self
            .code
            .labels
            .get(arg as usize)
            .ok_or_else(|| VmError::runtime(format!("undefined label {arg}")))?;
        Ok(*target as usize)
    }

    fn var_name(&self, arg: u16) -> String {
        self.code
            .var_names
            .get(arg as usize)
            .cloned()
            .unwrap_or_else(|| format!("variable {arg}"))
    }

    fn array_name(&self, arg: u16) -> String {
        self.code
            .array_names
            .get(arg as usize)
            .cloned()
            .unwrap_or_else(|| format!("array {arg}"))
    }
}
