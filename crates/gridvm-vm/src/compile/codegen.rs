// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};

use crate::bytecode::{Op, OpCode};
use crate::code::CodeObject;
use crate::error::VmError;
use crate::value::Value;

use super::ast::{Operand, Statement, Stmt, Target};

/// Generate bytecode for a parsed program.
///
/// Variables and arrays are declared implicitly at first store; `$argc`
/// (variable 0) and `$argv` (array 0) are predeclared. Label references are
/// resolved into a compact jump table after all statements are emitted.
pub fn generate(statements: &[Statement]) -> Result<CodeObject, VmError> {
    let mut gen = Generator::new();
    for statement in statements {
        gen.statement(statement)?;
    }
    gen.finish()
}

struct Generator {
    ops: Vec<Op>,
    consts: Vec<Value>,
    vars: HashMap<String, u16>,
    var_names: Vec<String>,
    arrays: HashMap<String, u16>,
    array_names: Vec<String>,
    label_defs: BTreeMap<String, u32>,
    /// (instruction index, label name, source line) of each JMP/JMP_IF_TRUE.
    label_refs: Vec<(usize, String, u32)>,
    line: u32,
}

fn err(line: u32, message: impl Into<String>) -> VmError {
    VmError::Codegen {
        line,
        message: message.into(),
    }
}

impl Generator {
    fn new() -> Self {
        Generator {
            ops: Vec::new(),
            consts: Vec::new(),
            vars: HashMap::from([("$argc".to_string(), 0)]),
            var_names: vec!["$argc".to_string()],
            arrays: HashMap::from([("$argv".to_string(), 0)]),
            array_names: vec!["$argv".to_string()],
            label_defs: BTreeMap::new(),
            label_refs: Vec::new(),
            line: 0,
        }
    }

    fn emit(&mut self, opcode: OpCode, arg: u16) {
        self.ops.push(Op::new(opcode, arg, self.line));
    }

    fn pool(&mut self, value: Value) -> Result<u16, VmError> {
        if let Some(idx) = self.consts.iter().position(|c| *c == value) {
            return Ok(idx as u16);
        }
        let idx = self.consts.len();
        if idx > u16::MAX as usize {
            return Err(err(self.line, "constant pool overflow"));
        }
        self.consts.push(value);
        Ok(idx as u16)
    }

    // ── Operand loads ────────────────────────────────────────────────────────

    fn load(&mut self, operand: &Operand) -> Result<(), VmError> {
        match operand {
            Operand::Lit(n) => {
                let idx = self.pool(Value::Int(*n))?;
                self.emit(OpCode::LoadConst, idx);
            }
            Operand::Var(name) => {
                let idx = *self
                    .vars
                    .get(name)
                    .ok_or_else(|| err(self.line, format!("undefined variable {name}")))?;
                self.emit(OpCode::LoadVar, idx);
            }
            Operand::Elem(name, index) => {
                let idx = *self
                    .arrays
                    .get(name)
                    .ok_or_else(|| err(self.line, format!("undefined array {name}")))?;
                self.load(index)?;
                self.emit(OpCode::LoadArray, idx);
            }
        }
        Ok(())
    }

    // ── Stores (declare on first use) ────────────────────────────────────────

    fn store(&mut self, target: &Target) -> Result<(), VmError> {
        match target {
            Target::Var(name) => {
                let idx = match self.vars.get(name) {
                    Some(idx) => *idx,
                    None => {
                        let idx = self.declare(name.clone(), false)?;
                        self.emit(OpCode::BuildVar, idx);
                        idx
                    }
                };
                self.emit(OpCode::StoreVar, idx);
            }
            Target::Elem(name, index) => {
                let idx = match self.arrays.get(name) {
                    Some(idx) => *idx,
                    None => {
                        let idx = self.declare(name.clone(), true)?;
                        self.emit(OpCode::BuildArray, idx);
                        idx
                    }
                };
                self.load(index)?;
                self.emit(OpCode::StoreArray, idx);
            }
        }
        Ok(())
    }

    fn declare(&mut self, name: String, array: bool) -> Result<u16, VmError> {
        let (map, names) = if array {
            (&mut self.arrays, &mut self.array_names)
        } else {
            (&mut self.vars, &mut self.var_names)
        };
        let idx = names.len();
        if idx > u16::MAX as usize {
            return Err(err(self.line, "too many declarations"));
        }
        map.insert(name.clone(), idx as u16);
        names.push(name);
        Ok(idx as u16)
    }

    // ── Statements ───────────────────────────────────────────────────────────

    fn statement(&mut self, statement: &Statement) -> Result<(), VmError> {
        self.line = statement.line;
        if let Some(label) = &statement.label {
            let here = self.ops.len() as u32;
            if self.label_defs.insert(label.clone(), here).is_some() {
                return Err(err(self.line, format!("label {label} defined twice")));
            }
        }

        match &statement.stmt {
            Stmt::Set { dst, value } => {
                self.load(value)?;
                self.store(dst)?;
            }
            Stmt::Arith { op, dst, a, b } => {
                self.load(a)?;
                self.load(b)?;
                self.emit(OpCode::Arithm, *op as u16);
                self.store(dst)?;
            }
            Stmt::Branch { cmp, a, b, label } => {
                self.load(a)?;
                self.load(b)?;
                self.emit(OpCode::CompareOp, *cmp as u16);
                self.reference(label.clone());
                self.emit(OpCode::JmpIfTrue, 0);
            }
            Stmt::Jump { label } => {
                self.reference(label.clone());
                self.emit(OpCode::Jmp, 0);
            }
            Stmt::Send { to, value } => {
                self.load(to)?;
                self.load(value)?;
                self.emit(OpCode::Snd, 0);
            }
            Stmt::Recv { from, dst } => {
                self.load(from)?;
                self.emit(OpCode::Rcv, 0);
                self.store(dst)?;
            }
            Stmt::Sleep { secs } => {
                self.load(secs)?;
                self.emit(OpCode::Slp, 0);
            }
            Stmt::Print { format, args } => {
                let idx = self.pool(Value::Str(format.clone()))?;
                self.emit(OpCode::LoadConst, idx);
                for arg in args {
                    self.load(arg)?;
                }
                self.emit(OpCode::Prn, args.len() as u16);
            }
            Stmt::Ret => self.emit(OpCode::Ret, 0),
        }
        Ok(())
    }

    fn reference(&mut self, label: String) {
        // The referencing instruction is emitted right after this call.
        self.label_refs.push((self.ops.len(), label, self.line));
    }

    // ── Label fixup ──────────────────────────────────────────────────────────

    fn finish(mut self) -> Result<CodeObject, VmError> {
        let mut labels: Vec<u32> = Vec::new();
        for (op_index, name, line) in &self.label_refs {
            let target = *self
                .label_defs
                .get(name)
                .ok_or_else(|| err(*line, format!("label {name} not defined")))?;
            let slot = match labels.iter().position(|t| *t == target) {
                Some(slot) => slot,
                None => {
                    labels.push(target);
                    labels.len() - 1
                }
            };
            self.ops[*op_index].arg = slot as u16;
        }

        Ok(CodeObject {
            ops: self.ops,
            consts: self.consts,
            var_names: self.var_names,
            array_names: self.array_names,
            labels,
            label_names: self.label_defs,
        })
    }
}
