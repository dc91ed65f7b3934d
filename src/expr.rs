// Copyright (C) 2020-2023 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of xnde.
//
// xnde is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// xnde is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with xnde.  If not, see <http://www.gnu.org/licenses/>. *
//! A restricted arithmetic expression evaluator for field `offset`/`size` specifications.
//!
//! Map files may write `offset` and `size` as either a literal integer or a small arithmetic
//! expression over `+ - * / // %`, parenthesized subexpressions, and bare identifiers resolved
//! against a [`Context`] (sibling field ids, the containing struct, `root`, `rom`). Anything
//! outside that grammar is rejected at parse time -- there is no general-purpose scripting here.
//!
//! Each expression is parsed once, at map-load time, into either a cached integer
//! ([`FieldExpr::Static`]) or an AST ([`FieldExpr::Dynamic`]); evaluation against a context only
//! happens for the latter.

use parse_display::Display;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           error type                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Display)]
pub enum Cause {
    #[display("An error in another crate or module-- cf. source.")]
    Other,
    #[display("malformed expression {0:?} at position {1}")]
    Syntax(String, usize),
    #[display("unknown identifier {0:?}")]
    UnknownIdentifier(String),
    #[display("division by zero evaluating {0:?}")]
    DivByZero(String),
}

#[derive(Debug, Display)]
#[display("{cause} Source (if any): {source:?} Stack trace (if any): {trace:?}")]
pub struct Error {
    cause: Cause,
    source: Option<Box<dyn std::error::Error>>,
    trace: Option<backtrace::Backtrace>,
}

impl Error {
    fn new(cause: Cause) -> Error {
        Error {
            cause,
            source: None,
            trace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(bx) => Some(bx.as_ref()),
            None => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identifier resolution for dynamic expressions: sibling field ids of the enclosing structure,
/// `root`, and `rom`, all mapped to an integer (the field's current value, or a view's length,
/// as appropriate to what's being evaluated).
pub trait Context {
    fn resolve(&self, ident: &str) -> Option<i64>;
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(i64),
    Ident(String),
    Plus,
    Minus,
    Star,
    SlashSlash,
    Slash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = src.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '%' => {
                toks.push(Tok::Percent);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    toks.push(Tok::SlashSlash);
                    i += 2;
                } else {
                    toks.push(Tok::Slash);
                    i += 1;
                }
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                if c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
                    i += 2;
                    let hstart = i;
                    while i < chars.len() && chars[i].is_ascii_hexdigit() {
                        i += 1;
                    }
                    let val = i64::from_str_radix(&chars[hstart..i].iter().collect::<String>(), 16)
                        .map_err(|_| Error::new(Cause::Syntax(src.to_string(), start)))?;
                    toks.push(Tok::Num(val));
                } else if c == '0' && matches!(chars.get(i + 1), Some('b') | Some('B')) {
                    i += 2;
                    let bstart = i;
                    while i < chars.len() && (chars[i] == '0' || chars[i] == '1') {
                        i += 1;
                    }
                    let val = i64::from_str_radix(&chars[bstart..i].iter().collect::<String>(), 2)
                        .map_err(|_| Error::new(Cause::Syntax(src.to_string(), start)))?;
                    toks.push(Tok::Num(val));
                } else {
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    let val: i64 = chars[start..i]
                        .iter()
                        .collect::<String>()
                        .parse()
                        .map_err(|_| Error::new(Cause::Syntax(src.to_string(), start)))?;
                    toks.push(Tok::Num(val));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(Error::new(Cause::Syntax(src.to_string(), i))),
        }
    }
    Ok(toks)
}

#[derive(Debug, Clone)]
enum Ast {
    Num(i64),
    Ident(String),
    Add(Box<Ast>, Box<Ast>),
    Sub(Box<Ast>, Box<Ast>),
    Mul(Box<Ast>, Box<Ast>),
    FloorDiv(Box<Ast>, Box<Ast>),
    Div(Box<Ast>, Box<Ast>),
    Mod(Box<Ast>, Box<Ast>),
    Neg(Box<Ast>),
}

struct Parser<'a> {
    toks: &'a [Tok],
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn err(&self) -> Error {
        Error::new(Cause::Syntax(self.src.to_string(), self.pos))
    }

    fn parse_expr(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Ast::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Tok::Minus) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Ast::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Ast::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Tok::SlashSlash) => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Ast::FloorDiv(Box::new(lhs), Box::new(rhs));
                }
                Some(Tok::Slash) => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Ast::Div(Box::new(lhs), Box::new(rhs));
                }
                Some(Tok::Percent) => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Ast::Mod(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if let Some(Tok::Minus) = self.peek() {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Ast::Neg(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Tok::Num(n)) => Ok(Ast::Num(n)),
            Some(Tok::Ident(s)) => Ok(Ast::Ident(s)),
            Some(Tok::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(self.err()),
                }
            }
            _ => Err(self.err()),
        }
    }
}

fn eval_ast(ast: &Ast, ctx: &dyn Context, src: &str) -> Result<i64> {
    match ast {
        Ast::Num(n) => Ok(*n),
        Ast::Ident(id) => ctx
            .resolve(id)
            .ok_or_else(|| Error::new(Cause::UnknownIdentifier(id.clone()))),
        Ast::Add(a, b) => Ok(eval_ast(a, ctx, src)? + eval_ast(b, ctx, src)?),
        Ast::Sub(a, b) => Ok(eval_ast(a, ctx, src)? - eval_ast(b, ctx, src)?),
        Ast::Mul(a, b) => Ok(eval_ast(a, ctx, src)? * eval_ast(b, ctx, src)?),
        Ast::Neg(a) => Ok(-eval_ast(a, ctx, src)?),
        Ast::FloorDiv(a, b) => {
            let (av, bv) = (eval_ast(a, ctx, src)?, eval_ast(b, ctx, src)?);
            if bv == 0 {
                return Err(Error::new(Cause::DivByZero(src.to_string())));
            }
            Ok(av.div_euclid(bv))
        }
        Ast::Div(a, b) => {
            let (av, bv) = (eval_ast(a, ctx, src)?, eval_ast(b, ctx, src)?);
            if bv == 0 {
                return Err(Error::new(Cause::DivByZero(src.to_string())));
            }
            Ok(av / bv)
        }
        Ast::Mod(a, b) => {
            let (av, bv) = (eval_ast(a, ctx, src)?, eval_ast(b, ctx, src)?);
            if bv == 0 {
                return Err(Error::new(Cause::DivByZero(src.to_string())));
            }
            Ok(av.rem_euclid(bv))
        }
    }
}

/// A field `offset`/`size` expression, pre-parsed into either a cached static integer or a
/// dynamic AST evaluated against a [`Context`] on every read/write.
#[derive(Debug, Clone)]
pub enum FieldExpr {
    Static(i64),
    Dynamic(String, ExprAst),
}

/// Opaque parsed syntax tree, kept alongside the source text for error messages.
#[derive(Debug, Clone)]
pub struct ExprAst(Ast);

impl FieldExpr {
    /// Parse `spec`: if it's a bare integer literal (decimal, `0x…`, or `0b…`), the expression
    /// is static; otherwise it's compiled once into an AST for repeated dynamic evaluation.
    pub fn parse(spec: &str) -> Result<FieldExpr> {
        let trimmed = spec.trim();
        if let Ok(n) = parse_int_literal(trimmed) {
            return Ok(FieldExpr::Static(n));
        }
        let toks = tokenize(trimmed)?;
        let mut parser = Parser {
            toks: &toks,
            pos: 0,
            src: trimmed,
        };
        let ast = parser.parse_expr()?;
        if parser.pos != toks.len() {
            return Err(Error::new(Cause::Syntax(trimmed.to_string(), parser.pos)));
        }
        Ok(FieldExpr::Dynamic(trimmed.to_string(), ExprAst(ast)))
    }

    /// Evaluate this expression. Static expressions return their cached value with no context
    /// lookup; dynamic ones consult `ctx` for every identifier.
    pub fn eval(&self, ctx: &dyn Context) -> Result<i64> {
        match self {
            FieldExpr::Static(n) => Ok(*n),
            FieldExpr::Dynamic(src, ast) => eval_ast(&ast.0, ctx, src),
        }
    }
}

fn parse_int_literal(s: &str) -> std::result::Result<i64, ()> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_err(|_| ());
    }
    if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        return i64::from_str_radix(bin, 2).map_err(|_| ());
    }
    s.parse::<i64>().map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapCtx(HashMap<String, i64>);
    impl Context for MapCtx {
        fn resolve(&self, ident: &str) -> Option<i64> {
            self.0.get(ident).copied()
        }
    }

    #[test]
    fn static_literal() {
        let e = FieldExpr::parse("16").unwrap();
        let ctx = MapCtx(HashMap::new());
        assert_eq!(e.eval(&ctx).unwrap(), 16);
    }

    #[test]
    fn hex_literal() {
        let e = FieldExpr::parse("0x10").unwrap();
        let ctx = MapCtx(HashMap::new());
        assert_eq!(e.eval(&ctx).unwrap(), 16);
    }

    #[test]
    fn dynamic_expression() {
        let e = FieldExpr::parse("base + count * 2").unwrap();
        let mut m = HashMap::new();
        m.insert("base".to_string(), 10);
        m.insert("count".to_string(), 3);
        let ctx = MapCtx(m);
        assert_eq!(e.eval(&ctx).unwrap(), 16);
    }

    #[test]
    fn floordiv_and_mod() {
        let e = FieldExpr::parse("7 // 2 + 7 % 2").unwrap();
        let ctx = MapCtx(HashMap::new());
        assert_eq!(e.eval(&ctx).unwrap(), 4);
    }

    #[test]
    fn unknown_identifier_fails() {
        let e = FieldExpr::parse("foo + 1").unwrap();
        let ctx = MapCtx(HashMap::new());
        assert!(e.eval(&ctx).is_err());
    }

    #[test]
    fn rejects_unsupported_syntax() {
        assert!(FieldExpr::parse("a ** b").is_err());
    }
}
