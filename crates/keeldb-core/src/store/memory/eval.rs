//! Condition / update expression interpreter for the in-memory double.
//!
//! Implements exactly the grammar the expression compiler emits: comparator
//! and function conditions joined by `AND`/`OR`/`NOT` with parentheses,
//! `BETWEEN`/`IN` forms, and `SET`/`ADD`/`REMOVE` update sections.
//! Operands are always placeholders (`#n` / `:v`), never literals.

use crate::store::{Item, Scalar, StoreError};
use std::{cmp::Ordering, collections::BTreeMap};

pub(super) struct EvalContext<'a> {
    pub names: &'a BTreeMap<String, String>,
    pub values: &'a BTreeMap<String, Scalar>,
}

impl EvalContext<'_> {
    fn attr(&self, placeholder: &str) -> Result<&str, StoreError> {
        self.names
            .get(placeholder)
            .map(String::as_str)
            .ok_or_else(|| malformed(format!("unbound name placeholder {placeholder}")))
    }

    fn value(&self, placeholder: &str) -> Result<&Scalar, StoreError> {
        self.values
            .get(placeholder)
            .ok_or_else(|| malformed(format!("unbound value placeholder {placeholder}")))
    }
}

fn malformed(message: impl Into<String>) -> StoreError {
    StoreError::MalformedExpression {
        message: message.into(),
    }
}

///
/// Tokens
///

#[derive(Clone, Debug, Eq, PartialEq)]
enum Tok {
    Name(String),
    Value(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Tok>, StoreError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Tok::Eq);
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push(Tok::Ne);
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Tok::Le);
                    i += 2;
                } else {
                    tokens.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Tok::Ge);
                    i += 2;
                } else {
                    tokens.push(Tok::Gt);
                    i += 1;
                }
            }
            '#' | ':' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let text = input[start..i].to_string();
                if c == '#' {
                    tokens.push(Tok::Name(text));
                } else {
                    tokens.push(Tok::Value(text));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Tok::Ident(input[start..i].to_string()));
            }
            other => return Err(malformed(format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

///
/// Condition parser/interpreter
///

struct Parser<'a> {
    tokens: &'a [Tok],
    pos: usize,
    item: &'a Item,
    ctx: &'a EvalContext<'a>,
}

pub(super) fn eval_condition(
    expr: &str,
    item: Option<&Item>,
    ctx: &EvalContext<'_>,
) -> Result<bool, StoreError> {
    let empty = Item::new();
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        item: item.unwrap_or(&empty),
        ctx,
    };
    let result = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(malformed(format!("trailing tokens in condition: {expr}")));
    }

    Ok(result)
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Tok, StoreError> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of expression"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, expected: &Tok) -> Result<(), StoreError> {
        let tok = self.next()?;
        if tok == expected {
            Ok(())
        } else {
            Err(malformed(format!("expected {expected:?}, found {tok:?}")))
        }
    }

    fn keyword(&self, tok: &Tok, word: &str) -> bool {
        matches!(tok, Tok::Ident(ident) if ident.eq_ignore_ascii_case(word))
    }

    fn parse_or(&mut self) -> Result<bool, StoreError> {
        let mut result = self.parse_and()?;
        while let Some(tok) = self.peek() {
            if !self.keyword(tok, "OR") {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_and()?;
            result = result || rhs;
        }
        Ok(result)
    }

    fn parse_and(&mut self) -> Result<bool, StoreError> {
        let mut result = self.parse_unary()?;
        while let Some(tok) = self.peek() {
            if !self.keyword(tok, "AND") {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_unary()?;
            result = result && rhs;
        }
        Ok(result)
    }

    fn parse_unary(&mut self) -> Result<bool, StoreError> {
        if let Some(tok) = self.peek()
            && self.keyword(tok, "NOT")
        {
            self.pos += 1;
            return Ok(!self.parse_unary()?);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<bool, StoreError> {
        match self.next()?.clone() {
            Tok::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            }
            Tok::Ident(func) => self.parse_function(&func),
            Tok::Name(placeholder) => {
                let attr = self.ctx.attr(&placeholder)?.to_string();
                let lhs = self.item.get(&attr).cloned();
                self.parse_comparison(lhs)
            }
            other => Err(malformed(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_function(&mut self, func: &str) -> Result<bool, StoreError> {
        self.expect(&Tok::LParen)?;
        let Tok::Name(placeholder) = self.next()?.clone() else {
            return Err(malformed(format!("{func} expects a name operand")));
        };
        let attr = self.ctx.attr(&placeholder)?.to_string();
        let stored = self.item.get(&attr);

        let result = match func {
            "attribute_exists" => {
                self.expect(&Tok::RParen)?;
                stored.is_some()
            }
            "attribute_not_exists" => {
                self.expect(&Tok::RParen)?;
                stored.is_none()
            }
            "begins_with" => {
                self.expect(&Tok::Comma)?;
                let operand = self.operand()?;
                self.expect(&Tok::RParen)?;
                match (stored, &operand) {
                    (Some(Scalar::S(s)), Scalar::S(prefix)) => s.starts_with(prefix.as_str()),
                    _ => false,
                }
            }
            "contains" => {
                self.expect(&Tok::Comma)?;
                let operand = self.operand()?;
                self.expect(&Tok::RParen)?;
                match (stored, &operand) {
                    (Some(Scalar::S(s)), Scalar::S(needle)) => s.contains(needle.as_str()),
                    _ => false,
                }
            }
            other => return Err(malformed(format!("unknown function {other}"))),
        };

        Ok(result)
    }

    fn parse_comparison(&mut self, lhs: Option<Scalar>) -> Result<bool, StoreError> {
        let tok = self.next()?.clone();

        if self.keyword(&tok, "BETWEEN") {
            let low = self.operand()?;
            let between_and = self.next()?.clone();
            if !self.keyword(&between_and, "AND") {
                return Err(malformed("BETWEEN expects AND"));
            }
            let high = self.operand()?;
            return Ok(lhs.is_some_and(|v| {
                v.wire_cmp(&low) != Ordering::Less && v.wire_cmp(&high) != Ordering::Greater
            }));
        }

        if self.keyword(&tok, "IN") {
            self.expect(&Tok::LParen)?;
            let mut members = vec![self.operand()?];
            while self.peek() == Some(&Tok::Comma) {
                self.pos += 1;
                members.push(self.operand()?);
            }
            self.expect(&Tok::RParen)?;
            return Ok(lhs.is_some_and(|v| members.iter().any(|m| v == *m)));
        }

        let rhs = self.operand()?;
        let Some(lhs) = lhs else {
            // a comparison against a missing attribute never matches
            return Ok(false);
        };

        let ordering = lhs.wire_cmp(&rhs);
        let result = match tok {
            Tok::Eq => lhs == rhs,
            Tok::Ne => lhs != rhs,
            Tok::Lt => ordering == Ordering::Less,
            Tok::Le => ordering != Ordering::Greater,
            Tok::Gt => ordering == Ordering::Greater,
            Tok::Ge => ordering != Ordering::Less,
            other => return Err(malformed(format!("expected comparator, found {other:?}"))),
        };

        Ok(result)
    }

    fn operand(&mut self) -> Result<Scalar, StoreError> {
        match self.next()?.clone() {
            Tok::Value(placeholder) => Ok(self.ctx.value(&placeholder)?.clone()),
            Tok::Name(placeholder) => {
                let attr = self.ctx.attr(&placeholder)?.to_string();
                self.item
                    .get(&attr)
                    .cloned()
                    .ok_or_else(|| malformed(format!("missing attribute {attr} as operand")))
            }
            other => Err(malformed(format!("expected operand, found {other:?}"))),
        }
    }
}

///
/// Update expression interpreter
///

pub(super) fn apply_update(
    expr: &str,
    item: &mut Item,
    ctx: &EvalContext<'_>,
) -> Result<(), StoreError> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;

    while pos < tokens.len() {
        let Tok::Ident(section) = &tokens[pos] else {
            return Err(malformed(format!(
                "expected update section keyword, found {:?}",
                tokens[pos]
            )));
        };
        pos += 1;

        match section.to_ascii_uppercase().as_str() {
            "SET" => pos = apply_set_section(&tokens, pos, item, ctx)?,
            "ADD" => pos = apply_add_section(&tokens, pos, item, ctx)?,
            "REMOVE" => pos = apply_remove_section(&tokens, pos, item, ctx)?,
            other => return Err(malformed(format!("unknown update section {other}"))),
        }
    }

    Ok(())
}

fn section_boundary(tok: &Tok) -> bool {
    matches!(tok, Tok::Ident(ident)
        if ["SET", "ADD", "REMOVE"].contains(&ident.to_ascii_uppercase().as_str()))
}

fn apply_set_section(
    tokens: &[Tok],
    mut pos: usize,
    item: &mut Item,
    ctx: &EvalContext<'_>,
) -> Result<usize, StoreError> {
    loop {
        let Some(Tok::Name(placeholder)) = tokens.get(pos) else {
            return Err(malformed("SET expects a name"));
        };
        let attr = ctx.attr(placeholder)?.to_string();
        pos += 1;

        if tokens.get(pos) != Some(&Tok::Eq) {
            return Err(malformed("SET expects '='"));
        }
        pos += 1;

        let Some(Tok::Value(placeholder)) = tokens.get(pos) else {
            return Err(malformed("SET expects a value"));
        };
        item.insert(attr, ctx.value(placeholder)?.clone());
        pos += 1;

        match tokens.get(pos) {
            Some(Tok::Comma) => pos += 1,
            Some(tok) if section_boundary(tok) => return Ok(pos),
            None => return Ok(pos),
            Some(tok) => return Err(malformed(format!("unexpected token in SET: {tok:?}"))),
        }
    }
}

fn apply_add_section(
    tokens: &[Tok],
    mut pos: usize,
    item: &mut Item,
    ctx: &EvalContext<'_>,
) -> Result<usize, StoreError> {
    loop {
        let Some(Tok::Name(placeholder)) = tokens.get(pos) else {
            return Err(malformed("ADD expects a name"));
        };
        let attr = ctx.attr(placeholder)?.to_string();
        pos += 1;

        let Some(Tok::Value(placeholder)) = tokens.get(pos) else {
            return Err(malformed("ADD expects a value"));
        };
        let delta = ctx
            .value(placeholder)?
            .as_i64()
            .ok_or_else(|| malformed("ADD expects a numeric value"))?;
        pos += 1;

        let current = item.get(&attr).and_then(Scalar::as_i64).unwrap_or(0);
        item.insert(attr, Scalar::number(current + delta));

        match tokens.get(pos) {
            Some(Tok::Comma) => pos += 1,
            Some(tok) if section_boundary(tok) => return Ok(pos),
            None => return Ok(pos),
            Some(tok) => return Err(malformed(format!("unexpected token in ADD: {tok:?}"))),
        }
    }
}

fn apply_remove_section(
    tokens: &[Tok],
    mut pos: usize,
    item: &mut Item,
    ctx: &EvalContext<'_>,
) -> Result<usize, StoreError> {
    loop {
        let Some(Tok::Name(placeholder)) = tokens.get(pos) else {
            return Err(malformed("REMOVE expects a name"));
        };
        item.remove(ctx.attr(placeholder)?);
        pos += 1;

        match tokens.get(pos) {
            Some(Tok::Comma) => pos += 1,
            Some(tok) if section_boundary(tok) => return Ok(pos),
            None => return Ok(pos),
            Some(tok) => return Err(malformed(format!("unexpected token in REMOVE: {tok:?}"))),
        }
    }
}
