// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::error::VmError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `#SIMPLESCRIPT` file tag.
    Tag,
    /// `$name`: scalar or array variable.
    Var(String),
    /// Integer literal, possibly negative.
    Number(i64),
    /// Double-quoted string (PRN format).
    Str(String),
    /// Uppercase identifier: mnemonic or label.
    Ident(String),
    LBracket,
    RBracket,
}

/// Tokens of one source line, blank lines omitted.
#[derive(Debug)]
pub struct Line {
    pub number: u32,
    pub tokens: Vec<Token>,
}

fn err(line: u32, message: impl Into<String>) -> VmError {
    VmError::Parse {
        line,
        message: message.into(),
    }
}

/// Split the source into per-line token lists.
pub fn tokenize(source: &str) -> Result<Vec<Line>, VmError> {
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let number = idx as u32 + 1;
        let tokens = tokenize_line(raw, number)?;
        if !tokens.is_empty() {
            lines.push(Line { number, tokens });
        }
    }
    Ok(lines)
}

fn tokenize_line(raw: &str, number: u32) -> Result<Vec<Token>, VmError> {
    let mut tokens = Vec::new();
    let mut chars = raw.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '#' => {
                let rest = &raw[pos..];
                if let Some(tail) = rest.strip_prefix("#SIMPLESCRIPT") {
                    if !tail.trim().is_empty() {
                        return Err(err(number, format!("unexpected text after tag: {tail}")));
                    }
                    tokens.push(Token::Tag);
                    return Ok(tokens);
                }
                return Err(err(number, "unexpected character: #"));
            }
            '$' => {
                chars.next();
                let mut name = String::from("$");
                match chars.peek() {
                    Some(&(_, c)) if c.is_ascii_alphabetic() => {
                        name.push(c);
                        chars.next();
                    }
                    _ => return Err(err(number, "variable name must start with a letter")),
                }
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Var(name));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(err(number, "unterminated string"));
                }
                tokens.push(Token::Str(text));
            }
            '-' | '0'..='9' => {
                let mut text = String::new();
                if c == '-' {
                    text.push(c);
                    chars.next();
                }
                let mut digits = 0;
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        digits += 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                if digits == 0 {
                    return Err(err(number, "expected digits after '-'"));
                }
                let value = text
                    .parse::<i64>()
                    .map_err(|_| err(number, format!("integer out of range: {text}")))?;
                tokens.push(Token::Number(value));
            }
            'A'..='Z' => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            other => return Err(err(number, format!("unexpected character: {other}"))),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_statement_line() {
        let lines = tokenize("#SIMPLESCRIPT\nLOOP ADD $x $argv[0] -3\n").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].tokens, vec![Token::Tag]);
        assert_eq!(
            lines[1].tokens,
            vec![
                Token::Ident("LOOP".into()),
                Token::Ident("ADD".into()),
                Token::Var("$x".into()),
                Token::Var("$argv".into()),
                Token::LBracket,
                Token::Number(0),
                Token::RBracket,
                Token::Number(-3),
            ]
        );
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(tokenize("#SIMPLESCRIPT\nSET $x @\n").is_err());
        assert!(tokenize("#SIMPLESCRIPT\nPRN \"oops\n").is_err());
    }

    #[test]
    fn blank_lines_are_skipped_with_numbering_kept() {
        let lines = tokenize("#SIMPLESCRIPT\n\n\nRET\n").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].number, 4);
    }
}
