// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scalar values manipulated by SimpleScript programs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bytecode::{ArithOp, CmpOp};
use crate::error::VmError;

/// A constant, variable slot, stack entry or inter-thread message.
///
/// Serializes untagged, i.e. as the plain JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Branch conditions accept any value; empty/zero is false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Array subscripts and thread ids must be integers.
    pub fn as_index(&self) -> Result<i64, VmError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(VmError::runtime(format!("{other} is not an integer"))),
        }
    }

    /// Sleep durations accept integers or floats (seconds).
    pub fn as_seconds(&self) -> Result<f64, VmError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(VmError::runtime(format!("{other} is not a duration"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

// ── Operator semantics ────────────────────────────────────────────────────────

/// Apply an arithmetic operator.
///
/// Integer pairs stay integral (`÷` truncates toward zero); a float operand
/// promotes the result. Division and modulo by zero are runtime errors.
pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    use Value::{Float, Int};
    match (a, b) {
        (Int(x), Int(y)) => {
            let r = match op {
                ArithOp::Add => x.wrapping_add(*y),
                ArithOp::Sub => x.wrapping_sub(*y),
                ArithOp::Mul => x.wrapping_mul(*y),
                ArithOp::Div => {
                    if *y == 0 {
                        return Err(VmError::runtime("division by zero"));
                    }
                    x.wrapping_div(*y)
                }
                ArithOp::Mod => {
                    if *y == 0 {
                        return Err(VmError::runtime("modulo by zero"));
                    }
                    x.wrapping_rem(*y)
                }
            };
            Ok(Int(r))
        }
        (Int(_) | Float(_), Int(_) | Float(_)) => {
            let (x, y) = (a.as_seconds()?, b.as_seconds()?);
            if y == 0.0 && matches!(op, ArithOp::Div | ArithOp::Mod) {
                return Err(VmError::runtime("division by zero"));
            }
            let r = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Mod => x % y,
            };
            Ok(Float(r))
        }
        _ => Err(VmError::runtime(format!(
            "cannot apply {op} to {a} and {b}"
        ))),
    }
}

/// Apply a comparison operator; yields a boolean.
pub fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    use std::cmp::Ordering;
    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = (a.as_seconds()?, b.as_seconds()?);
            x.partial_cmp(&y)
                .ok_or_else(|| VmError::runtime("comparison with NaN"))?
        }
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => {
            return Err(VmError::runtime(format!(
                "cannot compare {a} with {b}"
            )))
        }
    };
    let r = match op {
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Eq => ord == Ordering::Equal,
    };
    Ok(Value::Bool(r))
}
