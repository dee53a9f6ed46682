//! Condition and effect expression language.
//!
//! Expressions are evaluated against a JSON scope object holding `state`,
//! `params`, `actor`, `phase` and `players`. Missing paths are `null`;
//! comparisons between incomparable values are `false`.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use tandem_core::ids::UserId;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error at {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("{0}")]
    Type(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn from_symbol(sym: &str) -> Option<Self> {
        Some(match sym {
            "||" => Self::Or,
            "&&" => Self::And,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            _ => return None,
        })
    }

    /// (left, right) binding power; all binary operators are left-associative.
    fn binding_power(self) -> (u8, u8) {
        match self {
            Self::Or => (1, 2),
            Self::And => (3, 4),
            Self::Eq | Self::Ne => (5, 6),
            Self::Lt | Self::Le | Self::Gt | Self::Ge => (7, 8),
            Self::Add | Self::Sub => (9, 10),
            Self::Mul | Self::Div | Self::Rem => (11, 12),
        }
    }
}

const UNARY_BP: u8 = 13;
const INDEX_BP: u8 = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
    Len,
    Contains,
    Count,
    Sum,
    Max,
    Min,
    Keys,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "contains" => Self::Contains,
            "count" => Self::Count,
            "sum" => Self::Sum,
            "max" => Self::Max,
            "min" => Self::Min,
            "keys" => Self::Keys,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Contains | Self::Count => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Len => "len",
            Self::Contains => "contains",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
            Self::Keys => "keys",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    /// Dotted path rooted in the scope, e.g. `state.votes.alice`.
    Path(Vec<String>),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// Parse and evaluate in one step.
pub fn evaluate(src: &str, scope: &Value) -> Result<Value, ExprError> {
    parse(src)?.eval(scope)
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: lex(src)?,
        pos: 0,
    };
    let expr = parser.expr(0)?;
    match parser.peek() {
        Token::End => Ok(expr),
        other => Err(parser.error(format!("unexpected {other}"))),
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// JSON equality with numbers compared by value (`1 == 1.0`).
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// ── Lexer ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Sym(&'static str),
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string {s:?}"),
            Self::Ident(s) => write!(f, "identifier {s}"),
            Self::Sym(s) => write!(f, "'{s}'"),
            Self::End => f.write_str("end of input"),
        }
    }
}

const SYMBOLS: &[&str] = &[
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[",
    "]", ",", ".",
];

fn lex(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let n: f64 = src[start..i].parse().map_err(|_| ExprError::Syntax {
                pos: start,
                message: "invalid number".into(),
            })?;
            tokens.push((start, Token::Num(n)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(src[start..i].to_string())));
        } else if c == b'\'' || c == b'"' {
            let (s, end) = lex_string(src, start)?;
            tokens.push((start, Token::Str(s)));
            i = end;
        } else if let Some(sym) = SYMBOLS.iter().find(|s| src[i..].starts_with(**s)) {
            tokens.push((start, Token::Sym(*sym)));
            i += sym.len();
        } else {
            let ch = src[i..].chars().next().unwrap_or('?');
            return Err(ExprError::Syntax {
                pos: start,
                message: format!("unexpected character {ch:?}"),
            });
        }
    }

    tokens.push((src.len(), Token::End));
    Ok(tokens)
}

/// Returns the unescaped string and the byte offset after the closing quote.
fn lex_string(src: &str, start: usize) -> Result<(String, usize), ExprError> {
    let mut chars = src[start..].char_indices();
    let (_, quote) = chars.next().unwrap_or((0, '"'));
    let mut out = String::new();
    let mut escaped = false;

    for (offset, ch) in chars {
        if escaped {
            out.push(match ch {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Ok((out, start + offset + ch.len_utf8()));
        } else {
            out.push(ch);
        }
    }

    Err(ExprError::Syntax {
        pos: start,
        message: "unterminated string".into(),
    })
}

// ── Parser ─────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::End, |(_, t)| t)
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Token::Sym(s) if *s == sym)
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ExprError> {
        if self.at_sym(sym) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{sym}', found {}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ExprError {
        let pos = self.tokens.get(self.pos).map_or(0, |(p, _)| *p);
        ExprError::Syntax { pos, message }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.prefix()?;

        loop {
            if self.at_sym("[") {
                if INDEX_BP < min_bp {
                    break;
                }
                self.pos += 1;
                let index = self.expr(0)?;
                self.expect_sym("]")?;
                lhs = Expr::Index(Box::new(lhs), Box::new(index));
                continue;
            }

            let op = match self.peek() {
                Token::Sym(s) => match BinaryOp::from_symbol(s) {
                    Some(op) => op,
                    None => break,
                },
                _ => break,
            };
            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(r_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.at_sym("(") => self.call(&name),
                _ => self.path(name),
            },
            Token::Sym("(") => {
                let inner = self.expr(0)?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Token::Sym("[") => {
                let items = self.list("]")?;
                Ok(Expr::Array(items))
            }
            Token::Sym("!") => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expr(UNARY_BP)?))),
            Token::Sym("-") => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.expr(UNARY_BP)?))),
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("unexpected {other}")))
            }
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ExprError> {
        let mut segments = vec![root];
        while self.at_sym(".") {
            self.pos += 1;
            match self.next() {
                Token::Ident(seg) => segments.push(seg),
                Token::Num(n) if n.fract() == 0.0 && n >= 0.0 => segments.push(format!("{}", n as u64)),
                other => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected path segment, found {other}")));
                }
            }
        }
        Ok(Expr::Path(segments))
    }

    fn call(&mut self, name: &str) -> Result<Expr, ExprError> {
        let func = Func::lookup(name).ok_or_else(|| self.error(format!("unknown function {name}")))?;
        self.expect_sym("(")?;
        let args = self.list(")")?;
        if args.len() != func.arity() {
            return Err(self.error(format!(
                "{func} takes {} argument(s), got {}",
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call(func, args))
    }

    /// Comma-separated expressions up to and including `close`.
    fn list(&mut self, close: &str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.at_sym(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.expr(0)?);
            if self.at_sym(",") {
                self.pos += 1;
                continue;
            }
            self.expect_sym(close)?;
            return Ok(items);
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────────────────

impl Expr {
    pub fn eval(&self, scope: &Value) -> Result<Value, ExprError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Array(items) => items
                .iter()
                .map(|e| e.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Path(segments) => Ok(segments
                .iter()
                .try_fold(scope, |value, seg| child(value, seg))
                .cloned()
                .unwrap_or(Value::Null)),
            Self::Index(base, index) => {
                let base = base.eval(scope)?;
                let key = key_string(&index.eval(scope)?)?;
                Ok(child(&base, &key).cloned().unwrap_or(Value::Null))
            }
            Self::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&inner.eval(scope)?))),
            Self::Unary(UnaryOp::Neg, inner) => {
                let v = inner.eval(scope)?;
                Ok(number(-as_number(&v, "-")?))
            }
            Self::Binary(op, lhs, rhs) => binary(*op, lhs, rhs, scope),
            Self::Call(func, args) => {
                let args = args
                    .iter()
                    .map(|a| a.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*func, &args)
            }
        }
    }
}

fn child<'a>(value: &'a Value, seg: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Render an index value as an object key / array position.
pub(crate) fn key_string(value: &Value) -> Result<String, ExprError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => match n.as_u64() {
            Some(i) => Ok(i.to_string()),
            None => Err(ExprError::Type(format!("invalid index {n}"))),
        },
        other => Err(ExprError::Type(format!("cannot index with {other}"))),
    }
}

fn binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, scope: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::And => {
            let l = truthy(&lhs.eval(scope)?);
            Ok(Value::Bool(l && truthy(&rhs.eval(scope)?)))
        }
        BinaryOp::Or => {
            let l = truthy(&lhs.eval(scope)?);
            Ok(Value::Bool(l || truthy(&rhs.eval(scope)?)))
        }
        _ => {
            let l = lhs.eval(scope)?;
            let r = rhs.eval(scope)?;
            match op {
                BinaryOp::And => Ok(Value::Bool(truthy(&l) && truthy(&r))),
                BinaryOp::Or => Ok(Value::Bool(truthy(&l) || truthy(&r))),
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
                BinaryOp::Lt => Ok(Value::Bool(compare(&l, &r) == Some(Ordering::Less))),
                BinaryOp::Le => Ok(Value::Bool(matches!(
                    compare(&l, &r),
                    Some(Ordering::Less | Ordering::Equal)
                ))),
                BinaryOp::Gt => Ok(Value::Bool(compare(&l, &r) == Some(Ordering::Greater))),
                BinaryOp::Ge => Ok(Value::Bool(matches!(
                    compare(&l, &r),
                    Some(Ordering::Greater | Ordering::Equal)
                ))),
                BinaryOp::Add => add(l, r),
                BinaryOp::Sub => Ok(number(as_number(&l, "-")? - as_number(&r, "-")?)),
                BinaryOp::Mul => Ok(number(as_number(&l, "*")? * as_number(&r, "*")?)),
                BinaryOp::Div | BinaryOp::Rem => {
                    let symbol = if op == BinaryOp::Div { "/" } else { "%" };
                    let (a, b) = (as_number(&l, symbol)?, as_number(&r, symbol)?);
                    if b == 0.0 {
                        return Err(ExprError::Type("division by zero".into()));
                    }
                    Ok(number(if op == BinaryOp::Div { a / b } else { a % b }))
                }
            }
        }
    }
}

fn add(l: Value, r: Value) -> Result<Value, ExprError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(number(
            a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default(),
        )),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::String(a), other) => Ok(Value::String(a + &display(&other))),
        (other, Value::String(b)) => Ok(Value::String(display(&other) + &b)),
        (a, b) => Err(ExprError::Type(format!("cannot add {a} and {b}"))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| ExprError::Type(format!("operator {op} expects numbers, got {value}")))
}

/// Integral values stay integers so they serialize without a fraction.
pub(crate) fn number(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() < MAX_SAFE {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn call(func: Func, args: &[Value]) -> Result<Value, ExprError> {
    let type_error = |what: &Value| ExprError::Type(format!("{func}() does not accept {what}"));

    match func {
        Func::Len => match &args[0] {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => Err(type_error(other)),
        },
        Func::Contains => {
            let needle = &args[1];
            match &args[0] {
                Value::Null => Ok(Value::Bool(false)),
                Value::Array(a) => Ok(Value::Bool(a.iter().any(|v| loose_eq(v, needle)))),
                Value::Object(o) => Ok(Value::Bool(
                    needle.as_str().is_some_and(|k| o.contains_key(k)),
                )),
                Value::String(s) => Ok(Value::Bool(needle.as_str().is_some_and(|n| s.contains(n)))),
                other => Err(type_error(other)),
            }
        }
        Func::Count => match &args[0] {
            Value::Null => Ok(Value::from(0)),
            Value::Array(a) => Ok(Value::from(a.iter().filter(|v| loose_eq(v, &args[1])).count())),
            Value::Object(o) => Ok(Value::from(o.values().filter(|v| loose_eq(v, &args[1])).count())),
            other => Err(type_error(other)),
        },
        Func::Sum | Func::Max | Func::Min => {
            let numbers = numbers_of(&args[0]).ok_or_else(|| type_error(&args[0]))?;
            Ok(match func {
                Func::Sum => number(numbers.iter().sum()),
                Func::Max => numbers.into_iter().reduce(f64::max).map_or(Value::Null, number),
                _ => numbers.into_iter().reduce(f64::min).map_or(Value::Null, number),
            })
        }
        Func::Keys => match &args[0] {
            Value::Null => Ok(Value::Array(Vec::new())),
            Value::Object(o) => Ok(Value::Array(o.keys().cloned().map(Value::String).collect())),
            other => Err(type_error(other)),
        },
    }
}

/// Numbers of an array, or of an object's values. `None` on any non-number.
fn numbers_of(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Null => Some(Vec::new()),
        Value::Array(a) => a.iter().map(Value::as_f64).collect(),
        Value::Object(o) => o.values().map(Value::as_f64).collect(),
        _ => None,
    }
}

// ── Scope ──────────────────────────────────────────────────────────────────

/// Everything an expression can see apart from the state itself.
#[derive(Clone, Debug, Default)]
pub struct Scope<'a> {
    pub params: Option<&'a Map<String, Value>>,
    pub actor: Option<(&'a UserId, &'a str)>,
    pub phase: Option<&'a str>,
    pub players: usize,
}

impl Scope<'_> {
    /// Build the evaluation scope around `state`.
    pub fn bind<S: Serialize + ?Sized>(&self, state: &S) -> Value {
        let actor = match self.actor {
            Some((id, role)) => json!({ "id": id, "role": role }),
            None => Value::Null,
        };
        json!({
            "state": state,
            "params": self.params.cloned().unwrap_or_default(),
            "actor": actor,
            "phase": self.phase,
            "players": self.players,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, scope: &Value) -> Value {
        evaluate(src, scope).unwrap_or_else(|e| panic!("{src}: {e}"))
    }

    fn scope() -> Value {
        json!({
            "state": {
                "score": 3,
                "votes": {"alice": "bob", "bob": "alice", "carol": "bob"},
                "items": ["a", "b"],
                "name": "round",
                "points": [4, 1.5, 9]
            },
            "params": {"target": "bob"},
            "actor": {"id": "alice", "role": "villager"},
            "phase": "day",
            "players": 3
        })
    }

    #[test]
    fn precedence_and_associativity() {
        let s = json!({});
        assert_eq!(eval("1 + 2 * 3", &s), json!(7));
        assert_eq!(eval("(1 + 2) * 3", &s), json!(9));
        assert_eq!(eval("10 - 4 - 3", &s), json!(3));
        assert_eq!(eval("-2 * 3", &s), json!(-6));
        assert_eq!(eval("7 % 4", &s), json!(3));
        assert_eq!(eval("1 / 2", &s), json!(0.5));
        assert_eq!(eval("1 < 2 && 3 > 2 || false", &s), json!(true));
        assert_eq!(eval("!true == false", &s), json!(true));
    }

    #[test]
    fn paths_and_indexing() {
        let s = scope();
        assert_eq!(eval("state.score", &s), json!(3));
        assert_eq!(eval("state.items.1", &s), json!("b"));
        assert_eq!(eval("state.votes[actor.id]", &s), json!("bob"));
        assert_eq!(eval("state.items[0]", &s), json!("a"));
        assert_eq!(eval("state.missing.deeper", &s), Value::Null);
        assert_eq!(eval("phase == 'day'", &s), json!(true));
        assert_eq!(eval("players >= 3", &s), json!(true));
    }

    #[test]
    fn functions() {
        let s = scope();
        assert_eq!(eval("len(state.items)", &s), json!(2));
        assert_eq!(eval("len(state.name)", &s), json!(5));
        assert_eq!(eval("len(state.nothing)", &s), json!(0));
        assert_eq!(eval("contains(state.items, 'b')", &s), json!(true));
        assert_eq!(eval("contains(state.votes, actor.id)", &s), json!(true));
        assert_eq!(eval("count(state.votes, params.target)", &s), json!(2));
        assert_eq!(eval("sum(state.points)", &s), json!(14.5));
        assert_eq!(eval("max(state.points)", &s), json!(9));
        assert_eq!(eval("min(state.points)", &s), json!(1.5));
        assert_eq!(eval("min([])", &s), Value::Null);
        assert_eq!(eval("len(keys(state.votes))", &s), json!(3));
    }

    #[test]
    fn literals_and_concatenation() {
        let s = json!({});
        assert_eq!(eval(r#""a" + 'b' + 1"#, &s), json!("ab1"));
        assert_eq!(eval("[1, 2] + [3]", &s), json!([1, 2, 3]));
        assert_eq!(eval("null == null", &s), json!(true));
        assert_eq!(eval("2 == 2.0", &s), json!(true));
        assert_eq!(eval(r"'it\'s'", &s), json!("it's"));
    }

    #[test]
    fn incomparable_values_compare_false() {
        let s = json!({});
        assert_eq!(eval("null < 1", &s), json!(false));
        assert_eq!(eval("'a' >= 1", &s), json!(false));
        assert_eq!(eval("'a' < 'b'", &s), json!(true));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let s = json!({});
        // The right side would fail with division by zero if evaluated.
        assert_eq!(eval("false && 1 / 0", &s), json!(false));
        assert_eq!(eval("true || 1 / 0", &s), json!(true));
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})] {
            assert!(!truthy(&falsy), "{falsy} should be falsy");
        }
        for t in [json!(true), json!(0.1), json!("x"), json!([0]), json!({"k": null})] {
            assert!(truthy(&t), "{t} should be truthy");
        }
    }

    #[test]
    fn syntax_errors_carry_position() {
        for src in ["1 +", "(1", "state.", "foo(1)", "len(1, 2)", "'open", "1 $ 2", "1 2"] {
            assert!(
                matches!(parse(src), Err(ExprError::Syntax { .. })),
                "{src} should not parse"
            );
        }
        match parse("1 + )") {
            Err(ExprError::Syntax { pos, .. }) => assert_eq!(pos, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn type_errors() {
        let s = json!({});
        assert!(matches!(evaluate("1 / 0", &s), Err(ExprError::Type(_))));
        assert!(matches!(evaluate("true - 1", &s), Err(ExprError::Type(_))));
        assert!(matches!(evaluate("sum(['x'])", &s), Err(ExprError::Type(_))));
        assert!(matches!(evaluate("len(5)", &s), Err(ExprError::Type(_))));
    }

    #[test]
    fn scope_binding() {
        let state = json!({"round": 2}).as_object().cloned().unwrap();
        let params = json!({"choice": "x"}).as_object().cloned().unwrap();
        let actor = UserId::from_raw("u1");
        let scope = Scope {
            params: Some(&params),
            actor: Some((&actor, "judge")),
            phase: Some("vote"),
            players: 4,
        };
        let bound = scope.bind(&state);
        assert_eq!(eval("state.round + players", &bound), json!(6));
        assert_eq!(eval("actor.role + ':' + params.choice", &bound), json!("judge:x"));

        let empty = Scope::default().bind(&state);
        assert_eq!(eval("actor.id", &empty), Value::Null);
        assert_eq!(eval("phase", &empty), Value::Null);
    }
}
