//! Predicate expressions for the `filter` strategy
//!
//! ```text
//! score >= 7 and (label == "pos" or label in ["neutral", "mixed"])
//! not exists(error) && tags contains "gold"
//! ```
//!
//! Missing fields evaluate to `null`. Ordering comparisons only hold
//! between two numbers or two strings.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("Unexpected character at offset {0}")]
    UnexpectedChar(usize),
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("Unknown operator {0:?}")]
    UnknownOperator(String),
    #[error("Expression nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

/// Nesting limit for parentheses, lists and `not`
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Symbol(String),
    Ident(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Symbol(s) | Token::Ident(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
}

impl CmpOp {
    /// Parse an operator name as used by structured filter options
    pub fn parse(op: &str) -> Result<Self, ExprError> {
        Ok(match op.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" => CmpOp::Eq,
            "!=" | "ne" => CmpOp::Ne,
            "<" | "lt" => CmpOp::Lt,
            "<=" | "le" | "lte" => CmpOp::Le,
            ">" | "gt" => CmpOp::Gt,
            ">=" | "ge" | "gte" => CmpOp::Ge,
            "in" => CmpOp::In,
            "not in" | "not_in" => CmpOp::NotIn,
            "contains" => CmpOp::Contains,
            other => return Err(ExprError::UnknownOperator(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Field(Vec<String>),
    List(Vec<Expr>),
    Exists(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A compiled filter predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(Self { expr }),
            Some(token) => Err(ExprError::UnexpectedToken(token.describe())),
        }
    }

    /// `field <op> value`; the `exists` operator ignores `value`
    pub fn comparison(field: &str, op: &str, value: Value) -> Result<Self, ExprError> {
        let path = split_path(field);
        if op.trim().eq_ignore_ascii_case("exists") {
            return Ok(Self {
                expr: Expr::Exists(path),
            });
        }
        let op = CmpOp::parse(op)?;
        Ok(Self {
            expr: Expr::Compare(op, Box::new(Expr::Field(path)), Box::new(Expr::Literal(value))),
        })
    }

    pub fn matches(&self, item: &Value) -> bool {
        truthy(&eval(&self.expr, item))
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:(?P<num>-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)|"(?P<dq>(?:[^"\\]|\\.)*)"|'(?P<sq>(?:[^'\\]|\\.)*)'|(?P<sym>==|!=|<=|>=|&&|\|\||[<>!()\[\],])|(?P<ident>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*))"#,
        )
        .expect("token regex is valid")
    })
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let re = token_regex();
    let mut tokens = Vec::new();
    let mut offset = 0;

    while offset < source.len() {
        let rest = &source[offset..];
        let trimmed = rest.trim_start();
        offset += rest.len() - trimmed.len();
        if trimmed.is_empty() {
            break;
        }

        let caps = re
            .captures(trimmed)
            .ok_or(ExprError::UnexpectedChar(offset))?;
        let whole = caps.get(0).map(|m| m.len()).unwrap_or(0);

        let token = if let Some(m) = caps.name("num") {
            let n = m
                .as_str()
                .parse()
                .map_err(|_| ExprError::UnexpectedChar(offset))?;
            Token::Number(n)
        } else if let Some(m) = caps.name("dq").or_else(|| caps.name("sq")) {
            Token::Str(unescape(m.as_str()))
        } else if let Some(m) = caps.name("sym") {
            Token::Symbol(m.as_str().to_string())
        } else if let Some(m) = caps.name("ident") {
            Token::Ident(m.as_str().to_string())
        } else {
            return Err(ExprError::UnexpectedChar(offset));
        };

        tokens.push(token);
        offset += whole;
    }

    Ok(tokens)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn split_path(field: &str) -> Vec<String> {
    field.split('.').map(|s| s.to_string()).collect()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn at_symbol(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Symbol(s)) if s == sym)
    }

    fn nested<F>(&mut self, parse: F) -> Result<Expr, ExprError>
    where
        F: FnOnce(&mut Self) -> Result<Expr, ExprError>,
    {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        self.depth += 1;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    fn expect_symbol(&mut self, sym: &str) -> Result<(), ExprError> {
        match self.next()? {
            Token::Symbol(s) if s == sym => Ok(()),
            other => Err(ExprError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") || self.at_symbol("||") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while self.at_keyword("and") || self.at_symbol("&&") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.at_keyword("not") || self.at_symbol("!") {
            self.pos += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_operand()?;

        // Operator plus the number of tokens it spans
        let (op, width) = match self.peek() {
            Some(Token::Symbol(s)) => match s.as_str() {
                "==" => (Some(CmpOp::Eq), 1),
                "!=" => (Some(CmpOp::Ne), 1),
                "<" => (Some(CmpOp::Lt), 1),
                "<=" => (Some(CmpOp::Le), 1),
                ">" => (Some(CmpOp::Gt), 1),
                ">=" => (Some(CmpOp::Ge), 1),
                _ => (None, 0),
            },
            Some(Token::Ident(w)) => match w.as_str() {
                "in" => (Some(CmpOp::In), 1),
                "contains" => (Some(CmpOp::Contains), 1),
                "not" if matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") => {
                    (Some(CmpOp::NotIn), 2)
                }
                _ => (None, 0),
            },
            _ => (None, 0),
        };

        let Some(op) = op else {
            return Ok(left);
        };
        self.pos += width;
        let right = self.parse_operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, ExprError> {
        match self.next()? {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Symbol(s) if s == "(" => self.nested(|p| {
                let inner = p.parse_or()?;
                p.expect_symbol(")")?;
                Ok(inner)
            }),
            Token::Symbol(s) if s == "[" => self.nested(Self::parse_list),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "none" | "None" => Ok(Expr::Literal(Value::Null)),
                "exists" if self.at_symbol("(") => {
                    self.pos += 1;
                    let field = match self.next()? {
                        Token::Ident(f) => f,
                        Token::Str(f) => f,
                        other => return Err(ExprError::UnexpectedToken(other.describe())),
                    };
                    self.expect_symbol(")")?;
                    Ok(Expr::Exists(split_path(&field)))
                }
                "and" | "or" | "not" | "in" | "contains" => Err(ExprError::UnexpectedToken(word.clone())),
                _ => Ok(Expr::Field(split_path(&word))),
            },
            other => Err(ExprError::UnexpectedToken(other.describe())),
        }
    }
    fn parse_list(&mut self) -> Result<Expr, ExprError> {
        let mut items = Vec::new();
        if self.at_symbol("]") {
            self.pos += 1;
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.parse_operand()?);
            match self.next()? {
                Token::Symbol(s) if s == "," => continue,
                Token::Symbol(s) if s == "]" => break,
                other => return Err(ExprError::UnexpectedToken(other.describe())),
            }
        }
        Ok(Expr::List(items))
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Walk a dotted path through objects (and arrays by index)
pub fn lookup<'a>(item: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(item, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn eval(expr: &Expr, item: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Field(path) => lookup(item, path).cloned().unwrap_or(Value::Null),
        Expr::List(items) => Value::Array(items.iter().map(|e| eval(e, item)).collect()),
        Expr::Exists(path) => Value::Bool(lookup(item, path).map(|v| !v.is_null()).unwrap_or(false)),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, item))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, item)) && truthy(&eval(r, item))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, item)) || truthy(&eval(r, item))),
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, item), &eval(r, item))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality that treats `8` and `8.0` as the same number
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.iter().any(|v| values_equal(v, needle)),
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => !contains(right, left),
        CmpOp::Contains => contains(left, right),
    }
}
