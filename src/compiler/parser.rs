//! Recursive-descent parser producing an expression tree.
//!
//! Grammar:
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('+' | '-') factor | number | '(' expr ')'
//! ```
//! Chains of one precedence level are kept flat so the lowering pass can
//! decide how to group them.

use super::lexer::{Token, TokenKind};
use crate::error::CompileError;

/// Deepest nesting of parentheses and unary signs accepted.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Negate(Box<Expr>),
    /// `first ± rest...`; the first element's sign is always `Plus`.
    Sum(Vec<(Sign, Expr)>),
    /// `first */ rest...`; the first element's operator is always `Mul`.
    Product(Vec<(Factor, Expr)>),
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    /// `end` is the input length, used as the position of end-of-input errors.
    pub fn new(tokens: &'a [Token], end: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            end,
        }
    }

    pub fn parse(mut self) -> Result<Expr, CompileError> {
        if self.tokens.is_empty() {
            return Err(CompileError::syntax(0, "empty expression"));
        }
        let expr = self.expr()?;
        match self.peek() {
            None => Ok(expr),
            Some(Token {
                kind: TokenKind::RParen,
                position,
            }) => Err(CompileError::syntax(*position, "unbalanced ')'")),
            Some(token) => Err(CompileError::syntax(token.position, "unexpected token")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next_position(&self) -> usize {
        self.peek().map_or(self.end, |t| t.position)
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        let mut terms = vec![(Sign::Plus, self.term()?)];
        loop {
            let sign = match self.peek().map(|t| t.kind) {
                Some(TokenKind::Plus) => Sign::Plus,
                Some(TokenKind::Minus) => Sign::Minus,
                _ => break,
            };
            self.pos += 1;
            terms.push((sign, self.term()?));
        }
        Ok(flatten_sum(terms))
    }

    fn term(&mut self) -> Result<Expr, CompileError> {
        let mut factors = vec![(Factor::Mul, self.factor()?)];
        loop {
            let op = match self.peek().map(|t| t.kind) {
                Some(TokenKind::Star) => Factor::Mul,
                Some(TokenKind::Slash) => Factor::Div,
                _ => break,
            };
            self.pos += 1;
            factors.push((op, self.factor()?));
        }
        Ok(flatten_product(factors))
    }

    fn factor(&mut self) -> Result<Expr, CompileError> {
        let position = self.next_position();
        let Some(token) = self.peek().copied() else {
            return Err(CompileError::syntax(position, "unexpected end of expression"));
        };

        match token.kind {
            TokenKind::Number(value) => {
                self.pos += 1;
                Ok(Expr::Number(value))
            }
            TokenKind::Plus | TokenKind::Minus => {
                self.pos += 1;
                self.descend(position)?;
                let inner = self.factor()?;
                self.depth -= 1;
                Ok(match token.kind {
                    TokenKind::Minus => negate(inner),
                    _ => inner,
                })
            }
            TokenKind::LParen => {
                self.pos += 1;
                self.descend(position)?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.peek() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(CompileError::syntax(
                        self.next_position(),
                        format!("unbalanced '(' opened at position {position}"),
                    )),
                }
            }
            TokenKind::RParen => Err(CompileError::syntax(position, "unexpected ')'")),
            TokenKind::Star | TokenKind::Slash => {
                Err(CompileError::syntax(position, "missing operand"))
            }
        }
    }

    fn descend(&mut self, position: usize) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::syntax(
                position,
                format!("nesting deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }
}

fn negate(expr: Expr) -> Expr {
    match expr {
        Expr::Number(value) => Expr::Number(-value),
        Expr::Negate(inner) => *inner,
        other => Expr::Negate(Box::new(other)),
    }
}

fn flatten_sum(mut terms: Vec<(Sign, Expr)>) -> Expr {
    if terms.len() == 1 {
        terms.remove(0).1
    } else {
        Expr::Sum(terms)
    }
}

fn flatten_product(mut factors: Vec<(Factor, Expr)>) -> Expr {
    if factors.len() == 1 {
        factors.remove(0).1
    } else {
        Expr::Product(factors)
    }
}
