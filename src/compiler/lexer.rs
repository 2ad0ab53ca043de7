//! Tokenizer for infix arithmetic.

use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

/// A token and the byte offset it starts at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

/// Split `input` into tokens, skipping whitespace.
pub fn tokenize(input: &str) -> Result<Vec<Token>, CompileError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'0'..=b'9' | b'.' => {
                let start = i;
                let (value, end) = number(input, start)?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    position: start,
                });
                i = end;
                continue;
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('?');
                return Err(CompileError::syntax(i, format!("unexpected character '{ch}'")));
            }
        };
        tokens.push(Token { kind, position: i });
        i += 1;
    }

    Ok(tokens)
}

/// Scan a decimal literal starting at `start`. Returns the value and the
/// offset just past it.
fn number(input: &str, start: usize) -> Result<(f64, usize), CompileError> {
    let bytes = input.as_bytes();
    let mut end = start;
    let mut digits = 0;
    let mut seen_dot = false;

    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => digits += 1,
            b'.' if !seen_dot => seen_dot = true,
            b'.' => return Err(CompileError::syntax(end, "unexpected '.' in number")),
            _ => break,
        }
        end += 1;
    }

    if digits == 0 {
        return Err(CompileError::syntax(start, "expected digits"));
    }

    input[start..end]
        .parse::<f64>()
        .map(|value| (value, end))
        .map_err(|e| CompileError::syntax(start, format!("invalid number: {e}")))
}
