//! Expression language for alert conditions and derived report metrics.
//!
//! A small SQL-flavoured grammar over numeric columns:
//!
//! ```text
//! expr       := or
//! or         := and (("OR" | "||") and)*
//! and        := not (("AND" | "&&") not)*
//! not        := "NOT" not | comparison
//! comparison := additive (cmp_op additive | "IS" ["NOT"] "NULL")*
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := ("-" | "+") unary | primary
//! primary    := number | "NULL" | "TRUE" | "FALSE" | ident | ident "(" args ")" | "(" expr ")"
//! ```
//!
//! Evaluation follows SQL null semantics: arithmetic and comparisons with a
//! NULL operand yield NULL, division by zero yields NULL, `AND`/`OR` use
//! three-valued logic. Referencing a column that does not exist is an error.

use std::fmt;

use thiserror::Error;

use crate::metrics::ColumnLookup;
use crate::rates::round2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unexpected '{found}' at position {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("{function} expects {expected} arguments, got {found}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        found: usize,
    },

    #[error("unknown column {0}")]
    UnknownColumn(String),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
    text: String,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, ch) = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let starts_number = ch.is_ascii_digit()
            || (ch == '.' && chars.get(i + 1).is_some_and(|(_, c)| c.is_ascii_digit()));
        let kind = if starts_number {
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let value = text.parse().map_err(|_| ExprError::UnexpectedToken {
                pos,
                found: text.clone(),
            })?;
            TokenKind::Number(value)
        } else if ch.is_ascii_alphabetic() || ch == '_' {
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
            match word.to_ascii_uppercase().as_str() {
                "AND" => TokenKind::And,
                "OR" => TokenKind::Or,
                "NOT" => TokenKind::Not,
                "IS" => TokenKind::Is,
                "NULL" => TokenKind::Null,
                "TRUE" => TokenKind::True,
                "FALSE" => TokenKind::False,
                _ => TokenKind::Ident(word.to_ascii_lowercase()),
            }
        } else {
            let next = chars.get(i + 1).map(|(_, c)| *c);
            let (kind, len) = match (ch, next) {
                ('<', Some('=')) => (TokenKind::LtEq, 2),
                ('<', Some('>')) => (TokenKind::NotEq, 2),
                ('>', Some('=')) => (TokenKind::GtEq, 2),
                ('!', Some('=')) => (TokenKind::NotEq, 2),
                ('&', Some('&')) => (TokenKind::And, 2),
                ('|', Some('|')) => (TokenKind::Or, 2),
                ('=', Some('=')) => (TokenKind::Eq, 2),
                ('<', _) => (TokenKind::Lt, 1),
                ('>', _) => (TokenKind::Gt, 1),
                ('=', _) => (TokenKind::Eq, 1),
                ('!', _) => (TokenKind::Not, 1),
                ('+', _) => (TokenKind::Plus, 1),
                ('-', _) => (TokenKind::Minus, 1),
                ('*', _) => (TokenKind::Star, 1),
                ('/', _) => (TokenKind::Slash, 1),
                ('%', _) => (TokenKind::Percent, 1),
                ('(', _) => (TokenKind::LParen, 1),
                (')', _) => (TokenKind::RParen, 1),
                (',', _) => (TokenKind::Comma, 1),
                _ => return Err(ExprError::UnexpectedChar { pos, ch }),
            };
            i += len;
            kind
        };

        let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
        tokens.push(Token { kind, pos, text });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Round,
    Nullif,
    Ifnull,
    Coalesce,
    Greatest,
    Least,
    Abs,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "round" => Function::Round,
            "nullif" => Function::Nullif,
            "ifnull" => Function::Ifnull,
            "coalesce" => Function::Coalesce,
            "greatest" => Function::Greatest,
            "least" => Function::Least,
            "abs" => Function::Abs,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Function::Round => "ROUND",
            Function::Nullif => "NULLIF",
            Function::Ifnull => "IFNULL",
            Function::Coalesce => "COALESCE",
            Function::Greatest => "GREATEST",
            Function::Least => "LEAST",
            Function::Abs => "ABS",
        }
    }

    fn check_arity(self, found: usize) -> Result<(), ExprError> {
        let (ok, expected) = match self {
            Function::Round => ((1..=2).contains(&found), "1 or 2"),
            Function::Nullif | Function::Ifnull => (found == 2, "2"),
            Function::Abs => (found == 1, "1"),
            Function::Coalesce => (found >= 1, "at least 1"),
            Function::Greatest | Function::Least => (found >= 2, "at least 2"),
        };
        if ok {
            Ok(())
        } else {
            Err(ExprError::Arity {
                function: self.name(),
                expected,
                found,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Null,
    Column(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IsNull { expr: Box<Expr>, negated: bool },
    Call(Function, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.current).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.current);
        if token.is_some() {
            self.current += 1;
        }
        token
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self) -> ExprError {
        match self.tokens.get(self.current) {
            Some(t) => ExprError::UnexpectedToken {
                pos: t.pos,
                found: t.text.clone(),
            },
            None => ExprError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExprError> {
        if self.matches(kind) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_and()?;
        while self.matches(&TokenKind::Or) {
            let right = self.parse_and()?;
            expr = Expr::Binary(BinaryOp::Or, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_not()?;
        while self.matches(&TokenKind::And) {
            let right = self.parse_not()?;
            expr = Expr::Binary(BinaryOp::And, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.matches(&TokenKind::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Eq) => BinaryOp::Eq,
                Some(TokenKind::NotEq) => BinaryOp::NotEq,
                Some(TokenKind::Lt) => BinaryOp::Lt,
                Some(TokenKind::LtEq) => BinaryOp::LtEq,
                Some(TokenKind::Gt) => BinaryOp::Gt,
                Some(TokenKind::GtEq) => BinaryOp::GtEq,
                Some(TokenKind::Is) => {
                    self.current += 1;
                    let negated = self.matches(&TokenKind::Not);
                    self.expect(&TokenKind::Null)?;
                    expr = Expr::IsNull {
                        expr: Box::new(expr),
                        negated,
                    };
                    continue;
                }
                _ => break,
            };
            self.current += 1;
            let right = self.parse_additive()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.current += 1;
            let right = self.parse_term()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.current += 1;
            let right = self.parse_unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.matches(&TokenKind::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        if self.matches(&TokenKind::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.advance().cloned() else {
            return Err(ExprError::UnexpectedEnd);
        };
        match token.kind {
            TokenKind::Number(v) => Ok(Expr::Number(v)),
            TokenKind::Null => Ok(Expr::Null),
            TokenKind::True => Ok(Expr::Number(1.0)),
            TokenKind::False => Ok(Expr::Number(0.0)),
            TokenKind::LParen => {
                let expr = self.parse_or()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                if !self.matches(&TokenKind::LParen) {
                    return Ok(Expr::Column(name));
                }
                let function =
                    Function::from_name(&name).ok_or(ExprError::UnknownFunction(name))?;
                let mut args = Vec::new();
                if !self.matches(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.matches(&TokenKind::Comma) {
                            continue;
                        }
                        self.expect(&TokenKind::RParen)?;
                        break;
                    }
                }
                function.check_arity(args.len())?;
                Ok(Expr::Call(function, args))
            }
            _ => Err(ExprError::UnexpectedToken {
                pos: token.pos,
                found: token.text,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn truth(v: Option<f64>) -> Option<bool> {
    v.map(|x| x != 0.0)
}

fn from_bool(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Rounds half away from zero to `digits` decimals.
fn round_to(v: f64, digits: i32) -> f64 {
    if digits == 2 {
        return round2(v);
    }
    let factor = 10f64.powi(digits);
    (v * factor).round() / factor
}

impl Expr {
    pub fn evaluate(&self, row: &dyn ColumnLookup) -> Result<Option<f64>, ExprError> {
        Ok(match self {
            Expr::Number(v) => Some(*v),
            Expr::Null => None,
            Expr::Column(name) => row
                .lookup(name)
                .ok_or_else(|| ExprError::UnknownColumn(name.clone()))?,
            Expr::Neg(e) => e.evaluate(row)?.map(|v| -v),
            Expr::Not(e) => truth(e.evaluate(row)?).map(|b| from_bool(!b)),
            Expr::IsNull { expr, negated } => {
                Some(from_bool(expr.evaluate(row)?.is_none() != *negated))
            }
            Expr::Binary(BinaryOp::And, l, r) => {
                let (l, r) = (truth(l.evaluate(row)?), truth(r.evaluate(row)?));
                match (l, r) {
                    (Some(false), _) | (_, Some(false)) => Some(0.0),
                    (Some(true), Some(true)) => Some(1.0),
                    _ => None,
                }
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let (l, r) = (truth(l.evaluate(row)?), truth(r.evaluate(row)?));
                match (l, r) {
                    (Some(true), _) | (_, Some(true)) => Some(1.0),
                    (Some(false), Some(false)) => Some(0.0),
                    _ => None,
                }
            }
            Expr::Binary(op, l, r) => {
                let (Some(a), Some(b)) = (l.evaluate(row)?, r.evaluate(row)?) else {
                    return Ok(None);
                };
                match op {
                    BinaryOp::Add => Some(a + b),
                    BinaryOp::Sub => Some(a - b),
                    BinaryOp::Mul => Some(a * b),
                    BinaryOp::Div => (b != 0.0).then(|| a / b),
                    BinaryOp::Mod => (b != 0.0).then(|| a % b),
                    BinaryOp::Eq => Some(from_bool(a == b)),
                    BinaryOp::NotEq => Some(from_bool(a != b)),
                    BinaryOp::Lt => Some(from_bool(a < b)),
                    BinaryOp::LtEq => Some(from_bool(a <= b)),
                    BinaryOp::Gt => Some(from_bool(a > b)),
                    BinaryOp::GtEq => Some(from_bool(a >= b)),
                    BinaryOp::And | BinaryOp::Or => None,
                }
            }
            Expr::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(row))
                    .collect::<Result<Vec<_>, _>>()?;
                match function {
                    Function::Round => {
                        let digits = match values.get(1) {
                            Some(Some(d)) => *d as i32,
                            Some(None) => return Ok(None),
                            None => 0,
                        };
                        values[0].map(|v| round_to(v, digits))
                    }
                    Function::Nullif => match (values[0], values[1]) {
                        (Some(a), Some(b)) if a == b => None,
                        (a, _) => a,
                    },
                    Function::Ifnull | Function::Coalesce => values.into_iter().flatten().next(),
                    Function::Greatest => values
                        .into_iter()
                        .collect::<Option<Vec<f64>>>()
                        .and_then(|v| v.into_iter().reduce(f64::max)),
                    Function::Least => values
                        .into_iter()
                        .collect::<Option<Vec<f64>>>()
                        .and_then(|v| v.into_iter().reduce(f64::min)),
                    Function::Abs => values[0].map(f64::abs),
                }
            }
        })
    }

    /// Column names referenced anywhere in the expression.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => out.push(name),
            Expr::Neg(e) | Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.collect_columns(out),
            Expr::Binary(_, l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_columns(out)),
            Expr::Number(_) | Expr::Null => {}
        }
    }
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            current: 0,
        };
        let ast = parser.parse_or()?;
        if parser.current < parser.tokens.len() {
            return Err(parser.unexpected());
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, row: &dyn ColumnLookup) -> Result<Option<f64>, ExprError> {
        self.ast.evaluate(row)
    }

    /// SQL truth of the expression: `Ok(None)` when it evaluates to NULL.
    pub fn is_true(&self, row: &dyn ColumnLookup) -> Result<Option<bool>, ExprError> {
        Ok(truth(self.evaluate(row)?))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
