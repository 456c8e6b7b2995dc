// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::bytecode::{ArithOp, CmpOp};
use crate::error::VmError;

use super::ast::{Operand, Statement, Stmt, Target};
use super::lexer::{Line, Token};

fn err(line: u32, message: impl Into<String>) -> VmError {
    VmError::Parse {
        line,
        message: message.into(),
    }
}

/// Labels are `L`-prefixed identifiers; no mnemonic starts with `L`.
fn is_label(name: &str) -> bool {
    name.starts_with('L')
}

/// Parse tokenized lines into statements. The first line must be the
/// `#SIMPLESCRIPT` tag.
pub fn parse(lines: &[Line]) -> Result<Vec<Statement>, VmError> {
    let mut iter = lines.iter();
    match iter.next() {
        Some(line) if line.tokens == [Token::Tag] => {}
        Some(line) => return Err(err(line.number, "expected #SIMPLESCRIPT tag")),
        None => return Err(err(1, "empty program")),
    }

    let mut statements = Vec::new();
    for line in iter {
        statements.push(parse_line(line)?);
    }
    Ok(statements)
}

fn parse_line(line: &Line) -> Result<Statement, VmError> {
    let mut cursor = Cursor {
        tokens: &line.tokens,
        pos: 0,
        line: line.number,
    };

    let label = match cursor.peek() {
        Some(Token::Ident(name)) if is_label(name) => {
            let name = name.clone();
            cursor.next();
            Some(name)
        }
        _ => None,
    };

    let stmt = parse_stmt(&mut cursor)?;
    if let Some(extra) = cursor.peek() {
        return Err(err(line.number, format!("unexpected trailing token {extra:?}")));
    }
    Ok(Statement {
        label,
        stmt,
        line: line.number,
    })
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: u32,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, what: &str) -> Result<&'a Token, VmError> {
        self.next().ok_or_else(|| err(self.line, format!("expected {what}")))
    }

    fn operand(&mut self) -> Result<Operand, VmError> {
        match self.expect("an operand")? {
            Token::Number(n) => Ok(Operand::Lit(*n)),
            Token::Var(name) => {
                if matches!(self.peek(), Some(Token::LBracket)) {
                    self.next();
                    let index = self.operand()?;
                    match self.next() {
                        Some(Token::RBracket) => Ok(Operand::Elem(name.clone(), Box::new(index))),
                        _ => Err(err(self.line, "expected ']'")),
                    }
                } else {
                    Ok(Operand::Var(name.clone()))
                }
            }
            other => Err(err(self.line, format!("expected an operand, got {other:?}"))),
        }
    }

    fn target(&mut self) -> Result<Target, VmError> {
        match self.operand()? {
            Operand::Var(name) => Ok(Target::Var(name)),
            Operand::Elem(name, index) => Ok(Target::Elem(name, *index)),
            Operand::Lit(_) => Err(err(self.line, "cannot store into a literal")),
        }
    }

    fn label(&mut self) -> Result<String, VmError> {
        match self.expect("a label")? {
            Token::Ident(name) if is_label(name) => Ok(name.clone()),
            other => Err(err(self.line, format!("expected a label, got {other:?}"))),
        }
    }
}

fn parse_stmt(c: &mut Cursor) -> Result<Stmt, VmError> {
    let mnemonic = match c.expect("a mnemonic")? {
        Token::Ident(name) => name.clone(),
        other => return Err(err(c.line, format!("expected a mnemonic, got {other:?}"))),
    };

    if let Some(op) = ArithOp::from_mnemonic(&mnemonic) {
        let dst = c.target()?;
        let a = c.operand()?;
        let b = c.operand()?;
        return Ok(Stmt::Arith { op, dst, a, b });
    }

    if let Some(suffix) = mnemonic.strip_prefix('B') {
        if mnemonic == "BRA" {
            return Ok(Stmt::Jump { label: c.label()? });
        }
        let cmp = CmpOp::from_suffix(suffix)
            .ok_or_else(|| err(c.line, format!("unknown branch mnemonic {mnemonic}")))?;
        let a = c.operand()?;
        let b = c.operand()?;
        let label = c.label()?;
        return Ok(Stmt::Branch { cmp, a, b, label });
    }

    match mnemonic.as_str() {
        "SET" => {
            let dst = c.target()?;
            let value = c.operand()?;
            Ok(Stmt::Set { dst, value })
        }
        "SND" => {
            let to = c.operand()?;
            let value = c.operand()?;
            Ok(Stmt::Send { to, value })
        }
        "RCV" => {
            let from = c.operand()?;
            let dst = c.target()?;
            Ok(Stmt::Recv { from, dst })
        }
        "SLP" => Ok(Stmt::Sleep { secs: c.operand()? }),
        "PRN" => {
            let format = match c.expect("a format string")? {
                Token::Str(s) => s.clone(),
                other => {
                    return Err(err(c.line, format!("expected a format string, got {other:?}")))
                }
            };
            let mut args = Vec::new();
            while c.peek().is_some() {
                args.push(c.operand()?);
            }
            Ok(Stmt::Print { format, args })
        }
        "RET" => Ok(Stmt::Ret),
        other => Err(err(c.line, format!("unknown mnemonic {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_src(src: &str) -> Result<Vec<Statement>, VmError> {
        parse(&tokenize(src)?)
    }

    #[test]
    fn parses_labels_and_operations() {
        let stmts = parse_src(
            "#SIMPLESCRIPT\n\
             SET $x 42\n\
             LOOP SUB $x $x 1\n\
             BGT $x 0 LOOP\n\
             RET\n",
        )
        .unwrap();
        assert_eq!(stmts.len(), 4);
        assert_eq!(stmts[1].label.as_deref(), Some("LOOP"));
        assert!(matches!(stmts[2].stmt, Stmt::Branch { cmp: CmpOp::Gt, .. }));
    }

    #[test]
    fn parses_array_access() {
        let stmts = parse_src("#SIMPLESCRIPT\nSET $out[2] $argv[0]\nRET\n").unwrap();
        match &stmts[0].stmt {
            Stmt::Set { dst: Target::Elem(name, _), value: Operand::Elem(src, _) } => {
                assert_eq!(name, "$out");
                assert_eq!(src, "$argv");
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn parses_print_with_arguments() {
        let stmts = parse_src("#SIMPLESCRIPT\nPRN \"got \" $x 3\nRET\n").unwrap();
        match &stmts[0].stmt {
            Stmt::Print { format, args } => {
                assert_eq!(format, "got ");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn missing_tag_is_an_error() {
        assert!(parse_src("SET $x 1\n").is_err());
    }

    #[test]
    fn store_into_literal_is_an_error() {
        assert!(parse_src("#SIMPLESCRIPT\nSET 3 4\n").is_err());
    }
}
