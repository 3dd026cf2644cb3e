//! Invariant expression language.
//!
//! A restricted, side-effect-free grammar for boolean conditions over a
//! case's output context: comparisons, `and`/`or`/`not`, the string
//! predicates `contains`/`startsWith`/`endsWith`/`matches`, and path
//! navigation into pre-parsed JSON (`output.json.confidence`,
//! `output.length`, `tools.names[0]`). The parser admits nothing else —
//! no general attribute access, no user-defined calls, no assignment, no
//! loops — so an expression can never reach values outside its context.
//!
//! Compilation and evaluation are pure: identical (expression, context)
//! pairs always produce identical results, evaluation performs no I/O,
//! and both regex compilation and tree evaluation run under fixed budgets.

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use thiserror::Error;

/// Compiled regex programs are capped at this many bytes; the regex crate
/// matches in linear time, so the size cap is the whole execution budget.
const REGEX_SIZE_LIMIT: usize = 1 << 16;

/// Upper bound on AST nodes visited per evaluation.
const EVAL_STEP_LIMIT: u32 = 10_000;

#[derive(Error, Debug, Clone)]
#[error("parse error at offset {offset} in `{expression}`: {message}")]
pub struct ParseError {
    pub expression: String,
    pub offset: usize,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("context path `{path}` does not exist")]
    MissingPath { path: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("expression did not evaluate to a boolean")]
    NotBoolean,

    #[error("evaluation budget of {limit} steps exhausted")]
    BudgetExhausted { limit: u32 },
}

/// Read-only evaluation context: a flat set of named JSON roots.
#[derive(Debug, Clone, Default)]
pub struct Context {
    entries: serde_json::Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

#[derive(Debug, Clone)]
enum Expr {
    Bool(bool),
    Number(f64),
    Str(String),
    Null,
    Path(Vec<PathSegment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Contains {
        subject: Box<Expr>,
        needle: Box<Expr>,
    },
    StartsWith {
        subject: Box<Expr>,
        prefix: Box<Expr>,
    },
    EndsWith {
        subject: Box<Expr>,
        suffix: Box<Expr>,
    },
    Matches {
        subject: Box<Expr>,
        regex: Regex,
    },
}

/// A compiled invariant: the AST plus its original source text.
/// Immutable after compilation and safe to evaluate concurrently.
#[derive(Debug, Clone)]
pub struct Invariant {
    source: String,
    expr: Expr,
}

impl Invariant {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, context: &Context) -> Result<bool, EvalError> {
        let mut steps = 0u32;
        match eval(&self.expr, context, &mut steps)? {
            Value::Bool(b) => Ok(b),
            _ => Err(EvalError::NotBoolean),
        }
    }
}

pub fn compile(source: &str) -> Result<Invariant, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error_at_current("unexpected trailing input"));
    }
    Ok(Invariant {
        source: source.to_string(),
        expr,
    })
}

// ---------------------------------------------------------------------------
// Tokenizer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    Lt,
    Le,
    EqEq,
    Ne,
    Ge,
    Gt,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |offset: usize, message: &str| ParseError {
        expression: source.to_string(),
        offset,
        message: message.to_string(),
    };

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token {
                    tok: Tok::LParen,
                    offset: i,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    tok: Tok::RParen,
                    offset: i,
                });
                i += 1;
            }
            '[' => {
                tokens.push(Token {
                    tok: Tok::LBracket,
                    offset: i,
                });
                i += 1;
            }
            ']' => {
                tokens.push(Token {
                    tok: Tok::RBracket,
                    offset: i,
                });
                i += 1;
            }
            ',' => {
                tokens.push(Token {
                    tok: Tok::Comma,
                    offset: i,
                });
                i += 1;
            }
            '.' => {
                tokens.push(Token {
                    tok: Tok::Dot,
                    offset: i,
                });
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        tok: Tok::Le,
                        offset: i,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        tok: Tok::Lt,
                        offset: i,
                    });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        tok: Tok::Ge,
                        offset: i,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        tok: Tok::Gt,
                        offset: i,
                    });
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        tok: Tok::EqEq,
                        offset: i,
                    });
                    i += 2;
                } else {
                    return Err(err(i, "assignment is not supported; use `==`"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        tok: Tok::Ne,
                        offset: i,
                    });
                    i += 2;
                } else {
                    return Err(err(i, "unexpected `!`; use `not`"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(i).map(|b| *b as char) {
                        None => return Err(err(start, "unterminated string literal")),
                        Some('\\') => {
                            let escaped = bytes.get(i + 1).map(|b| *b as char);
                            match escaped {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some('\\') => value.push('\\'),
                                Some(q) if q == quote => value.push(q),
                                _ => return Err(err(i, "unsupported escape sequence")),
                            }
                            i += 2;
                        }
                        Some(q) if q == quote => {
                            i += 1;
                            break;
                        }
                        Some(_) => {
                            // Multi-byte characters pass through untouched.
                            let rest = &source[i..];
                            let ch = rest.chars().next().unwrap_or('\u{fffd}');
                            value.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    offset: start,
                });
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    i += 1;
                    if !bytes.get(i).map(|b| b.is_ascii_digit()).unwrap_or(false) {
                        return Err(err(start, "expected digits after `-`"));
                    }
                }
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &source[start..i];
                let value: f64 = text
                    .parse()
                    .map_err(|_| err(start, "malformed number literal"))?;
                tokens.push(Token {
                    tok: Tok::Number(value),
                    offset: start,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(source[start..i].to_string()),
                    offset: start,
                });
            }
            _ => return Err(err(i, "unexpected character")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error_at_current(&self, message: &str) -> ParseError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.source.len());
        ParseError {
            expression: self.source.to_string(),
            offset,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, expected: Tok, message: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(tok) if *tok == expected => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error_at_current(message)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Ident(name)) if name == "or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::Ident(name)) if name == "and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Tok::Ident(name)) if name == "not") {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::EqEq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            Some(Tok::Ge) => CmpOp::Ge,
            Some(Tok::Gt) => CmpOp::Gt,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error_at_current("expected a value, path, or predicate"));
        };
        match token.tok {
            Tok::Number(value) => {
                self.pos += 1;
                Ok(Expr::Number(value))
            }
            Tok::Str(value) => {
                self.pos += 1;
                Ok(Expr::Str(value))
            }
            Tok::LParen => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "expected `)`")?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                self.pos += 1;
                match name.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    "null" => Ok(Expr::Null),
                    _ => {
                        if matches!(self.peek(), Some(Tok::LParen)) {
                            self.parse_call(&name)
                        } else {
                            self.parse_path(name)
                        }
                    }
                }
            }
            _ => Err(self.error_at_current("expected a value, path, or predicate")),
        }
    }

    /// Only the fixed builtin predicates are callable; anything else is a
    /// parse error, never a lookup.
    fn parse_call(&mut self, name: &str) -> Result<Expr, ParseError> {
        if !matches!(name, "contains" | "startsWith" | "endsWith" | "matches") {
            self.pos = self.pos.saturating_sub(1);
            return Err(self.error_at_current(&format!("unknown function `{}`", name)));
        }

        self.expect(Tok::LParen, "expected `(`")?;
        let first = self.parse_or()?;
        self.expect(Tok::Comma, "expected `,` between arguments")?;

        let expr = if name == "matches" {
            let pattern_offset = self
                .tokens
                .get(self.pos)
                .map(|t| t.offset)
                .unwrap_or(self.source.len());
            let pattern = match self.advance().map(|t| t.tok) {
                Some(Tok::Str(pattern)) => pattern,
                _ => {
                    return Err(ParseError {
                        expression: self.source.to_string(),
                        offset: pattern_offset,
                        message: "matches() requires a string-literal pattern".to_string(),
                    })
                }
            };
            let regex = RegexBuilder::new(&pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| ParseError {
                    expression: self.source.to_string(),
                    offset: pattern_offset,
                    message: format!("invalid regex pattern: {}", e),
                })?;
            Expr::Matches {
                subject: Box::new(first),
                regex,
            }
        } else {
            let second = self.parse_or()?;
            match name {
                "contains" => Expr::Contains {
                    subject: Box::new(first),
                    needle: Box::new(second),
                },
                "startsWith" => Expr::StartsWith {
                    subject: Box::new(first),
                    prefix: Box::new(second),
                },
                _ => Expr::EndsWith {
                    subject: Box::new(first),
                    suffix: Box::new(second),
                },
            }
        };

        self.expect(Tok::RParen, "expected `)`")?;
        Ok(expr)
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ParseError> {
        let mut segments = vec![PathSegment::Key(root)];
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    match self.advance().map(|t| t.tok) {
                        Some(Tok::Ident(key)) => segments.push(PathSegment::Key(key)),
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.error_at_current("expected identifier after `.`"));
                        }
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let index = match self.advance().map(|t| t.tok) {
                        Some(Tok::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(
                                self.error_at_current("expected a non-negative integer index")
                            );
                        }
                    };
                    self.expect(Tok::RBracket, "expected `]`")?;
                    segments.push(PathSegment::Index(index));
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

// ---------------------------------------------------------------------------
// Evaluation

fn bump(steps: &mut u32) -> Result<(), EvalError> {
    *steps += 1;
    if *steps > EVAL_STEP_LIMIT {
        return Err(EvalError::BudgetExhausted {
            limit: EVAL_STEP_LIMIT,
        });
    }
    Ok(())
}

fn eval(expr: &Expr, context: &Context, steps: &mut u32) -> Result<Value, EvalError> {
    bump(steps)?;
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Null => Ok(Value::Null),
        Expr::Path(segments) => eval_path(segments, context),
        Expr::Not(inner) => {
            let value = eval(inner, context, steps)?;
            match value {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::TypeMismatch {
                    message: format!("`not` requires a boolean, found {}", type_tag(&other)),
                }),
            }
        }
        Expr::And(lhs, rhs) => {
            if as_bool(eval(lhs, context, steps)?, "and")? {
                Ok(Value::Bool(as_bool(eval(rhs, context, steps)?, "and")?))
            } else {
                Ok(Value::Bool(false))
            }
        }
        Expr::Or(lhs, rhs) => {
            if as_bool(eval(lhs, context, steps)?, "or")? {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(as_bool(eval(rhs, context, steps)?, "or")?))
            }
        }
        Expr::Compare { op, lhs, rhs } => {
            let left = eval(lhs, context, steps)?;
            let right = eval(rhs, context, steps)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Expr::Contains { subject, needle } => {
            let subject = eval(subject, context, steps)?;
            let needle = eval(needle, context, steps)?;
            match (&subject, &needle) {
                (Value::String(haystack), Value::String(sub)) => {
                    Ok(Value::Bool(haystack.contains(sub.as_str())))
                }
                (Value::Array(items), needle) => {
                    Ok(Value::Bool(items.iter().any(|item| value_eq(item, needle))))
                }
                _ => Err(EvalError::TypeMismatch {
                    message: format!(
                        "contains() requires (string, string) or (array, value), found ({}, {})",
                        type_tag(&subject),
                        type_tag(&needle)
                    ),
                }),
            }
        }
        Expr::StartsWith { subject, prefix } => {
            let subject = eval(subject, context, steps)?;
            let prefix = eval(prefix, context, steps)?;
            string_pair(&subject, &prefix, "startsWith")
                .map(|(s, p)| Value::Bool(s.starts_with(p)))
        }
        Expr::EndsWith { subject, suffix } => {
            let subject = eval(subject, context, steps)?;
            let suffix = eval(suffix, context, steps)?;
            string_pair(&subject, &suffix, "endsWith").map(|(s, p)| Value::Bool(s.ends_with(p)))
        }
        Expr::Matches { subject, regex } => {
            let subject = eval(subject, context, steps)?;
            match subject {
                Value::String(text) => Ok(Value::Bool(regex.is_match(&text))),
                other => Err(EvalError::TypeMismatch {
                    message: format!("matches() requires a string, found {}", type_tag(&other)),
                }),
            }
        }
    }
}

fn eval_path(segments: &[PathSegment], context: &Context) -> Result<Value, EvalError> {
    let joined = |upto: usize| {
        segments[..upto]
            .iter()
            .map(|s| match s {
                PathSegment::Key(k) => k.clone(),
                PathSegment::Index(i) => format!("[{}]", i),
            })
            .collect::<Vec<_>>()
            .join(".")
    };

    let root = match &segments[0] {
        PathSegment::Key(key) => context.get(key).ok_or(EvalError::MissingPath {
            path: joined(1),
        })?,
        PathSegment::Index(_) => {
            return Err(EvalError::MissingPath { path: joined(1) });
        }
    };

    let mut current = root;
    for (i, segment) in segments.iter().enumerate().skip(1) {
        match segment {
            PathSegment::Key(key) => {
                // An explicit object key always wins over the builtin
                // accessors, so structured outputs keep their own
                // `length`/`type` fields reachable.
                if let Some(next) = current.as_object().and_then(|obj| obj.get(key)) {
                    current = next;
                    continue;
                }
                match key.as_str() {
                    "length" => {
                        let length = match current {
                            Value::String(s) => s.chars().count(),
                            Value::Array(items) => items.len(),
                            other => {
                                return Err(EvalError::TypeMismatch {
                                    message: format!(
                                        "`{}.length` is not defined for {}",
                                        joined(i),
                                        type_tag(other)
                                    ),
                                })
                            }
                        };
                        return tail_must_end(segments, i, Value::from(length));
                    }
                    "type" => {
                        let tag = Value::String(type_tag(current).to_string());
                        return tail_must_end(segments, i, tag);
                    }
                    _ => {
                        return Err(EvalError::MissingPath {
                            path: joined(i + 1),
                        })
                    }
                }
            }
            PathSegment::Index(index) => match current.as_array().and_then(|a| a.get(*index)) {
                Some(next) => current = next,
                None => {
                    return Err(EvalError::MissingPath {
                        path: joined(i + 1),
                    })
                }
            },
        }
    }

    Ok(current.clone())
}

fn tail_must_end(segments: &[PathSegment], i: usize, value: Value) -> Result<Value, EvalError> {
    if i + 1 == segments.len() {
        Ok(value)
    } else {
        Err(EvalError::TypeMismatch {
            message: "builtin accessors terminate a path".to_string(),
        })
    }
}

fn string_pair<'v>(
    subject: &'v Value,
    other: &'v Value,
    predicate: &str,
) -> Result<(&'v str, &'v str), EvalError> {
    match (subject, other) {
        (Value::String(a), Value::String(b)) => Ok((a.as_str(), b.as_str())),
        (a, b) => Err(EvalError::TypeMismatch {
            message: format!(
                "{}() requires two strings, found ({}, {})",
                predicate,
                type_tag(a),
                type_tag(b)
            ),
        }),
    }
}

fn as_bool(value: Value, combinator: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch {
            message: format!(
                "`{}` requires boolean operands, found {}",
                combinator,
                type_tag(&other)
            ),
        }),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    if matches!(op, CmpOp::Eq | CmpOp::Ne) {
        let equal = value_eq(left, right);
        return Ok(if op == CmpOp::Eq { equal } else { !equal });
    }

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or(EvalError::TypeMismatch {
                message: "cannot order NaN".to_string(),
            })?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => {
            return Err(EvalError::TypeMismatch {
                message: format!(
                    "cannot order {} against {}",
                    type_tag(a),
                    type_tag(b)
                ),
            })
        }
    };

    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Eq | CmpOp::Ne => unreachable!(),
    })
}

/// Equality with numbers compared by value, so `1 == 1.0` holds.
fn value_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (a, b) => a == b,
    }
}

fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new()
            .with(
                "output",
                json!({
                    "text": "The temperature in Oakland is 72F.",
                    "length": 34,
                    "json": {"confidence": 0.93, "items": ["a", "b", "c"], "ok": true}
                }),
            )
            .with("tools", json!({"count": 2, "names": ["get_weather", "echo"]}))
            .with("usage", json!({"prompt_tokens": 120, "completion_tokens": 40}))
            .with("turns", json!(2))
    }

    fn check(source: &str) -> bool {
        compile(source).unwrap().evaluate(&ctx()).unwrap()
    }

    #[test]
    fn test_comparisons() {
        assert!(check("output.length < 500"));
        assert!(check("output.length <= 34"));
        assert!(check("output.length == 34"));
        assert!(check("output.length != 35"));
        assert!(check("usage.prompt_tokens >= 100"));
        assert!(check("turns > 1"));
        assert!(!check("output.length > 500"));
        assert!(check("output.text == 'The temperature in Oakland is 72F.'"));
        assert!(check("'abc' < 'abd'"));
    }

    #[test]
    fn test_boolean_combinators() {
        assert!(check("output.length < 500 and turns <= 2"));
        assert!(check("output.length > 500 or turns == 2"));
        assert!(check("not (output.length > 500)"));
        assert!(check("not not output.json.ok"));
        assert!(!check("output.json.ok and output.length > 500"));
    }

    #[test]
    fn test_string_predicates() {
        assert!(check("contains(output.text, 'Oakland')"));
        assert!(!check("contains(output.text, 'Berkeley')"));
        assert!(check("startsWith(output.text, 'The')"));
        assert!(check("endsWith(output.text, '72F.')"));
        assert!(check("matches(output.text, '[0-9]+F')"));
        assert!(!check("matches(output.text, '^[0-9]+$')"));
    }

    #[test]
    fn test_array_membership_and_indexing() {
        assert!(check("contains(tools.names, 'get_weather')"));
        assert!(!check("contains(tools.names, 'rm_rf')"));
        assert!(check("tools.names[0] == 'get_weather'"));
        assert!(check("output.json.items.length == 3"));
    }

    #[test]
    fn test_type_accessor() {
        assert!(check("output.json.confidence.type == 'number'"));
        assert!(check("output.text.type == 'string'"));
        assert!(check("output.json.items.type == 'array'"));
        assert!(check("output.json.type == 'object'"));
    }

    #[test]
    fn test_explicit_key_beats_builtin() {
        // `output.length` resolves to the context's own field, not the
        // builtin over the object.
        assert!(check("output.length == 34"));
    }

    #[test]
    fn test_number_literal_forms() {
        assert!(check("output.json.confidence > 0.9"));
        assert!(check("-1 < output.json.confidence"));
        assert!(check("output.json.confidence != null"));
    }

    #[test]
    fn test_missing_path_is_eval_error() {
        let invariant = compile("output.json.score > 0.5").unwrap();
        let err = invariant.evaluate(&ctx()).unwrap_err();
        assert_eq!(
            err,
            EvalError::MissingPath {
                path: "output.json.score".to_string()
            }
        );
    }

    #[test]
    fn test_type_mismatch_is_eval_error() {
        let invariant = compile("output.text < 5").unwrap();
        assert!(matches!(
            invariant.evaluate(&ctx()),
            Err(EvalError::TypeMismatch { .. })
        ));

        let invariant = compile("output.json and true").unwrap();
        assert!(matches!(
            invariant.evaluate(&ctx()),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let invariant = compile("output.length").unwrap();
        assert_eq!(invariant.evaluate(&ctx()), Err(EvalError::NotBoolean));
    }

    #[test]
    fn test_parse_errors_carry_offsets() {
        let err = compile("output.length <").unwrap_err();
        assert_eq!(err.offset, 15);

        let err = compile("x = 1").unwrap_err();
        assert_eq!(err.offset, 2);

        let err = compile("output..length").unwrap_err();
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn test_disallowed_operations_fail_to_compile() {
        // No arbitrary calls.
        assert!(compile("__import__('os')").is_err());
        assert!(compile("eval('1')").is_err());
        assert!(compile("output.text.strip()").is_err());
        // No assignment or statements.
        assert!(compile("x = 1").is_err());
        assert!(compile("while true").is_err());
        // No bare operators.
        assert!(compile("< 5").is_err());
    }

    #[test]
    fn test_attribute_traversal_stays_inside_context() {
        // Dunder-style chains are just paths; they resolve only against the
        // supplied context and fail closed when absent.
        let invariant = compile("output.__class__.__bases__ == null").unwrap();
        assert!(matches!(
            invariant.evaluate(&ctx()),
            Err(EvalError::MissingPath { .. })
        ));
    }

    #[test]
    fn test_matches_requires_literal_pattern() {
        let err = compile("matches(output.text, output.text)").unwrap_err();
        assert!(err.message.contains("string-literal"));
    }

    #[test]
    fn test_oversized_regex_rejected_at_compile() {
        // Nested counted repetition blows the compiled-size budget.
        let source = "matches(output.text, '(?:a{1000}){1000}')";
        assert!(compile(source).is_err());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let invariant = compile(
            "contains(output.text, 'Oakland') and output.json.confidence > 0.5 \
             and matches(output.text, '[0-9]+F')",
        )
        .unwrap();
        let context = ctx();
        let first = invariant.evaluate(&context).unwrap();
        for _ in 0..100 {
            assert_eq!(invariant.evaluate(&context).unwrap(), first);
        }
    }

    #[test]
    fn test_short_circuit_keeps_result_deterministic() {
        // The right-hand side would error, but the left side decides first.
        assert!(!check("false and missing.path == 1"));
        assert!(check("true or missing.path == 1"));
    }

    #[test]
    fn test_source_preserved() {
        let invariant = compile("output.length < 500").unwrap();
        assert_eq!(invariant.source(), "output.length < 500");
    }
}
