//! Routing predicates for conditional workflows.
//!
//! A small boolean language over the previous step's output:
//!
//! - paths: `output.score`, `input.user.tier`, `output.items.0`
//! - comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - logic: `&&`, `||`, `!`, parentheses
//! - literals: numbers, quoted strings, `true`, `false`, `null`
//!
//! Evaluation is three-valued. A path that does not resolve yields
//! [`Truth::Unknown`], which propagates through comparisons and negation and
//! is absorbed by `&&`/`||` only where the other side decides the result.
//! A route whose predicate is unknown does not match.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("parse error in '{expression}': {message}")]
    Parse { expression: String, message: String },
}

/// Result of evaluating a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }
}

/// A parsed predicate, ready to evaluate repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let fail = |message: String| PredicateError::Parse {
            expression: source.to_string(),
            message,
        };

        let tokens = tokenize(source).map_err(fail)?;
        if tokens.is_empty() {
            return Err(fail("empty expression".into()));
        }
        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let expr = parser.parse_or().map_err(fail)?;
        if let Some(tok) = parser.peek() {
            return Err(fail(format!("unexpected token {tok:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `scope`, typically `{"output": ..., "input": ...}`.
    pub fn evaluate(&self, scope: &Value) -> Truth {
        self.expr.eval(scope).truth()
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, scope: &Value) -> Result<Truth, PredicateError> {
    Ok(Predicate::parse(source)?.evaluate(scope))
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let peek = |idx: usize| chars.get(idx).copied();

    while i < chars.len() {
        let c = chars[i];
        let next = peek(i + 1);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or("unterminated string literal")?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse().map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.' | '-')) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Path(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let expr = match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.advance() != Some(&Token::RParen) {
                    return Err("expected ')'".into());
                }
                inner
            }
            Some(Token::Path(path)) => Expr::Path(path.split('.').map(str::to_string).collect()),
            Some(Token::Str(s)) => Expr::Literal(Value::String(s.clone())),
            Some(Token::Num(n)) => Expr::Literal(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .ok_or_else(|| format!("number out of range: {n}"))?,
            ),
            Some(Token::Bool(b)) => Expr::Literal(Value::Bool(*b)),
            Some(Token::Null) => Expr::Literal(Value::Null),
            Some(tok) => return Err(format!("unexpected token {tok:?}")),
            None => return Err("unexpected end of expression".into()),
        };
        Ok(expr)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// An operand: a JSON value, or nothing when a path did not resolve.
enum Operand {
    Present(Value),
    Missing,
    Truth(Truth),
}

impl Operand {
    fn truth(&self) -> Truth {
        match self {
            Operand::Missing => Truth::Unknown,
            Operand::Truth(t) => *t,
            Operand::Present(v) => Truth::from_bool(match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(_) | Value::Object(_) => true,
            }),
        }
    }

    fn into_value(self) -> Option<Value> {
        match self {
            Operand::Present(v) => Some(v),
            Operand::Truth(Truth::True) => Some(Value::Bool(true)),
            Operand::Truth(Truth::False) => Some(Value::Bool(false)),
            Operand::Truth(Truth::Unknown) | Operand::Missing => None,
        }
    }
}

impl Expr {
    fn eval(&self, scope: &Value) -> Operand {
        match self {
            Expr::Literal(v) => Operand::Present(v.clone()),
            Expr::Path(segments) => resolve(scope, segments)
                .map(|v| Operand::Present(v.clone()))
                .unwrap_or(Operand::Missing),
            Expr::Not(inner) => Operand::Truth(inner.eval(scope).truth().not()),
            Expr::And(l, r) => Operand::Truth(l.eval(scope).truth().and(r.eval(scope).truth())),
            Expr::Or(l, r) => Operand::Truth(l.eval(scope).truth().or(r.eval(scope).truth())),
            Expr::Compare(l, op, r) => {
                match (l.eval(scope).into_value(), r.eval(scope).into_value()) {
                    (Some(a), Some(b)) => Operand::Truth(Truth::from_bool(compare(&a, *op, &b))),
                    _ => Operand::Truth(Truth::Unknown),
                }
            }
        }
    }
}

fn resolve<'v>(scope: &'v Value, segments: &[String]) -> Option<&'v Value> {
    segments.iter().try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match (op, ordering) {
        (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
        (CmpOp::Eq, None) => a == b,
        (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
        (CmpOp::Ne, None) => a != b,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::Ge, Some(o)) => o != Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, scope: Value) -> Truth {
        evaluate(expr, &scope).unwrap()
    }

    #[test]
    fn test_numeric_comparisons() {
        let scope = json!({"output": {"score": 0.7}});
        assert_eq!(eval("output.score > 0.5", scope.clone()), Truth::True);
        assert_eq!(eval("output.score <= 0.5", scope.clone()), Truth::False);
        assert_eq!(eval("output.score == 0.7", scope.clone()), Truth::True);
        assert_eq!(eval("output.score >= -1", scope), Truth::True);
    }

    #[test]
    fn test_integer_and_float_are_equal() {
        assert_eq!(eval("output.n == 1.0", json!({"output": {"n": 1}})), Truth::True);
    }

    #[test]
    fn test_strings_and_bools() {
        let scope = json!({"output": {"label": "spam", "flagged": true}});
        assert_eq!(eval("output.label == 'spam'", scope.clone()), Truth::True);
        assert_eq!(eval("output.label != \"ham\"", scope.clone()), Truth::True);
        assert_eq!(eval("output.flagged", scope.clone()), Truth::True);
        assert_eq!(eval("!output.flagged", scope), Truth::False);
    }

    #[test]
    fn test_missing_field_is_unknown() {
        let scope = json!({"output": {}});
        assert_eq!(eval("output.score > 0.5", scope.clone()), Truth::Unknown);
        assert_eq!(eval("output.score <= 0.5", scope.clone()), Truth::Unknown);
        assert_eq!(eval("!(output.score > 0.5)", scope), Truth::Unknown);
    }

    #[test]
    fn test_three_valued_logic() {
        let scope = json!({"output": {"ok": true}});
        assert_eq!(eval("output.missing > 1 || output.ok", scope.clone()), Truth::True);
        assert_eq!(eval("output.missing > 1 && output.ok", scope.clone()), Truth::Unknown);
        assert_eq!(eval("output.missing > 1 && !output.ok", scope.clone()), Truth::False);
        assert_eq!(eval("output.missing > 1 or false", scope), Truth::Unknown);
    }

    #[test]
    fn test_null_is_present() {
        let scope = json!({"output": {"score": null}});
        assert_eq!(eval("output.score == null", scope.clone()), Truth::True);
        assert_eq!(eval("output.score > 0.5", scope), Truth::False);
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let scope = json!({"output": {"a": 1, "b": 2}});
        assert_eq!(eval("output.a == 1 || output.b == 3 && false", scope.clone()), Truth::True);
        assert_eq!(eval("(output.a == 1 || output.b == 3) && false", scope), Truth::False);
    }

    #[test]
    fn test_array_index_paths() {
        let scope = json!({"output": {"items": [{"v": 3}]}});
        assert_eq!(eval("output.items.0.v == 3", scope.clone()), Truth::True);
        assert_eq!(eval("output.items.4.v == 3", scope), Truth::Unknown);
    }

    #[test]
    fn test_mismatched_types_compare_false() {
        let scope = json!({"output": {"score": "high"}});
        assert_eq!(eval("output.score > 0.5", scope.clone()), Truth::False);
        assert_eq!(eval("output.score != 0.5", scope), Truth::True);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("output.score >").is_err());
        assert!(Predicate::parse("(output.a").is_err());
        assert!(Predicate::parse("output.a == 'open").is_err());
        assert!(Predicate::parse("output.a # 1").is_err());
        assert!(Predicate::parse("output.a 1").is_err());
    }

    #[test]
    fn test_parsed_predicate_is_reusable() {
        let p = Predicate::parse("output.score > 0.5").unwrap();
        assert_eq!(p.source(), "output.score > 0.5");
        assert_eq!(p.evaluate(&json!({"output": {"score": 0.9}})), Truth::True);
        assert_eq!(p.evaluate(&json!({"output": {"score": 0.1}})), Truth::False);
    }
}
