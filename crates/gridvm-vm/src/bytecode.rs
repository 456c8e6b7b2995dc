// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bytecode instruction set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VmError;

/// The 18 opcodes of the stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OpCode {
    LoadConst = 0,
    LoadVar = 1,
    StoreVar = 2,
    LoadArray = 3,
    StoreArray = 4,
    BuildVar = 5,
    BuildArray = 6,
    RotTwo = 7,
    Arithm = 8,
    CompareOp = 9,
    JmpIfTrue = 10,
    Jmp = 11,
    Snd = 12,
    Rcv = 13,
    Slp = 14,
    Prn = 15,
    Ret = 16,
    Nop = 17,
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => OpCode::LoadConst,
            1 => OpCode::LoadVar,
            2 => OpCode::StoreVar,
            3 => OpCode::LoadArray,
            4 => OpCode::StoreArray,
            5 => OpCode::BuildVar,
            6 => OpCode::BuildArray,
            7 => OpCode::RotTwo,
            8 => OpCode::Arithm,
            9 => OpCode::CompareOp,
            10 => OpCode::JmpIfTrue,
            11 => OpCode::Jmp,
            12 => OpCode::Snd,
            13 => OpCode::Rcv,
            14 => OpCode::Slp,
            15 => OpCode::Prn,
            16 => OpCode::Ret,
            17 => OpCode::Nop,
            other => return Err(format!("unknown opcode {other}")),
        })
    }
}

/// One instruction: opcode, 16-bit argument, source line for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub opcode: OpCode,
    pub arg: u16,
    #[serde(default)]
    pub line: u32,
}

impl Op {
    pub fn new(opcode: OpCode, arg: u16, line: u32) -> Self {
        Op { opcode, arg, line }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.opcode, self.arg)
    }
}

// ── Operator arguments ────────────────────────────────────────────────────────

/// Argument of an `ARITHM` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
}

impl ArithOp {
    pub fn from_arg(arg: u16) -> Result<Self, VmError> {
        Ok(match arg {
            0 => ArithOp::Add,
            1 => ArithOp::Sub,
            2 => ArithOp::Mul,
            3 => ArithOp::Div,
            4 => ArithOp::Mod,
            other => return Err(VmError::runtime(format!("unknown arithmetic op {other}"))),
        })
    }

    pub fn from_mnemonic(m: &str) -> Option<Self> {
        Some(match m {
            "ADD" => ArithOp::Add,
            "SUB" => ArithOp::Sub,
            "MUL" => ArithOp::Mul,
            "DIV" => ArithOp::Div,
            "MOD" => ArithOp::Mod,
            _ => return None,
        })
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        };
        f.write_str(s)
    }
}

/// Argument of a `COMPARE_OP` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt = 0,
    Ge = 1,
    Lt = 2,
    Le = 3,
    Eq = 4,
}

impl CmpOp {
    pub fn from_arg(arg: u16) -> Result<Self, VmError> {
        Ok(match arg {
            0 => CmpOp::Gt,
            1 => CmpOp::Ge,
            2 => CmpOp::Lt,
            3 => CmpOp::Le,
            4 => CmpOp::Eq,
            other => return Err(VmError::runtime(format!("unknown comparison op {other}"))),
        })
    }

    /// Branch mnemonics drop the leading `B`: `BGT` → `GT`.
    pub fn from_suffix(m: &str) -> Option<Self> {
        Some(match m {
            "GT" => CmpOp::Gt,
            "GE" => CmpOp::Ge,
            "LT" => CmpOp::Lt,
            "LE" => CmpOp::Le,
            "EQ" => CmpOp::Eq,
            _ => return None,
        })
    }
}
