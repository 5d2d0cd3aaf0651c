//! Pure boolean guard expressions for `run_if` / `skip_if`.
//!
//! The language is deliberately tiny: dotted context paths, literals,
//! `==` `!=` `<` `<=` `>` `>=`, `&&` `||` `!`, and parentheses. Anything
//! else is rejected at plan construction with `Invalid`. Evaluation is
//! total — a missing path is `null`, and `null`/`false` are the only
//! falsy values.
//!
//! Examples: `fetch_result.status == 200`, `!(flags.dry_run || attempts > 2)`.

use serde_json::{Map, Value};

use crate::error::SwarmError;

// ─── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Operand, CmpOp, Operand),
    /// Bare operand — truthiness test.
    Truthy(Operand),
}

/// A parsed, validated guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    source: String,
    expr: Expr,
}

// ─── Tokenizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Int(i64),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, SwarmError> {
    let bad = |what: &str| SwarmError::invalid(format!("guard {src:?}: {what}"));
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::EqEq);
                } else {
                    return Err(bad("single '=' is not an operator; use '=='"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(bad("single '&' is not an operator; use '&&'"));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::OrOr);
                } else {
                    return Err(bad("single '|' is not an operator; use '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err(bad("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Ok(i) = s.parse::<i64>() {
                    tokens.push(Token::Int(i));
                } else {
                    let n: f64 = s
                        .parse()
                        .map_err(|_| bad(&format!("malformed number {s:?}")))?;
                    tokens.push(Token::Number(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Path(s)),
                }
            }
            other => return Err(bad(&format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

// ─── Parser (recursive descent) ───────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn bad(&self, what: &str) -> SwarmError {
        SwarmError::invalid(format!("guard {:?}: {what}", self.src))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, SwarmError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SwarmError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SwarmError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.parse_expr()?;
            if !self.eat(&Token::RParen) {
                return Err(self.bad("missing closing ')'"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SwarmError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::NotEq) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.next();
                let right = self.parse_operand()?;
                Ok(Expr::Cmp(left, op, right))
            }
            None => Ok(Expr::Truthy(left)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, SwarmError> {
        match self.next() {
            Some(Token::Path(p)) => Ok(Operand::Path(p)),
            Some(Token::Int(i)) => Ok(Operand::Literal(Value::from(i))),
            Some(Token::Number(n)) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::True) => Ok(Operand::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Value::Null)),
            Some(other) => Err(self.bad(&format!("expected operand, found {other:?}"))),
            None => Err(self.bad("expected operand, found end of input")),
        }
    }
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

fn resolve<'v>(path: &str, context: &'v Map<String, Value>) -> &'v Value {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return &Value::Null;
    };
    let mut current = match context.get(root) {
        Some(v) => v,
        None => return &Value::Null,
    };
    for seg in segments {
        current = match current.as_object().and_then(|o| o.get(seg)) {
            Some(v) => v,
            None => return &Value::Null,
        };
    }
    current
}

fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Bool(false))
}

/// Equality with numeric normalization: `200` and `200.0` are equal even
/// though serde_json's `Number` representations differ.
fn json_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => json_eq(left, right),
        CmpOp::Ne => !json_eq(left, right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            // Ordering is defined for number pairs and string pairs only;
            // mixed or unordered types compare false.
            if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
                return match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                };
            }
            if let (Value::String(a), Value::String(b)) = (left, right) {
                return match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                };
            }
            false
        }
    }
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> bool {
    match expr {
        Expr::Or(a, b) => eval(a, context) || eval(b, context),
        Expr::And(a, b) => eval(a, context) && eval(b, context),
        Expr::Not(inner) => !eval(inner, context),
        Expr::Cmp(left, op, right) => {
            let l = operand_value(left, context);
            let r = operand_value(right, context);
            compare(&l, *op, &r)
        }
        Expr::Truthy(op) => truthy(&operand_value(op, context)),
    }
}

fn operand_value(op: &Operand, context: &Map<String, Value>) -> Value {
    match op {
        Operand::Path(p) => resolve(p, context).clone(),
        Operand::Literal(v) => v.clone(),
    }
}

impl Guard {
    /// Parse and validate an expression; anything outside the language is
    /// rejected as `Invalid`.
    pub fn parse(source: &str) -> Result<Self, SwarmError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(SwarmError::invalid("guard expression is empty"));
        }
        let mut parser = Parser {
            src: source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.bad("trailing input after expression"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against the plan context. Total — never fails.
    pub fn evaluate(&self, context: &Map<String, Value>) -> bool {
        eval(&self.expr, context)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn equality_and_paths() {
        let context = ctx(json!({"fetch_result": {"status": 200}, "mode": "fast"}));
        assert!(Guard::parse("fetch_result.status == 200")
            .unwrap()
            .evaluate(&context));
        assert!(Guard::parse("mode == 'fast'").unwrap().evaluate(&context));
        assert!(Guard::parse("mode != \"slow\"").unwrap().evaluate(&context));
    }

    #[test]
    fn ordering_logic_and_not() {
        let context = ctx(json!({"n": 5, "flag": false}));
        assert!(Guard::parse("n > 3 && n <= 5").unwrap().evaluate(&context));
        assert!(Guard::parse("!flag || n < 0").unwrap().evaluate(&context));
        assert!(Guard::parse("!(n > 10)").unwrap().evaluate(&context));
    }

    #[test]
    fn missing_path_is_null() {
        let context = ctx(json!({}));
        assert!(Guard::parse("missing == null").unwrap().evaluate(&context));
        assert!(!Guard::parse("missing.deep.path").unwrap().evaluate(&context));
    }

    #[test]
    fn skipped_dependency_result_compares_as_null() {
        let context = ctx(json!({"upstream_result": null}));
        assert!(Guard::parse("upstream_result == null")
            .unwrap()
            .evaluate(&context));
        assert!(!Guard::parse("upstream_result").unwrap().evaluate(&context));
    }

    #[test]
    fn bare_path_truthiness() {
        let context = ctx(json!({"ok": true, "zero": 0, "empty": ""}));
        assert!(Guard::parse("ok").unwrap().evaluate(&context));
        // Only null and false are falsy in this language.
        assert!(Guard::parse("zero").unwrap().evaluate(&context));
        assert!(Guard::parse("empty").unwrap().evaluate(&context));
    }

    #[test]
    fn rejects_anything_outside_the_language() {
        for bad in [
            "",
            "n = 1",
            "n + 1 > 2",
            "fn()",
            "a ? b : c",
            "n &",
            "(a == 1",
            "a == 1 extra",
            "'unterminated",
        ] {
            assert!(Guard::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn mixed_type_ordering_is_false() {
        let context = ctx(json!({"s": "abc"}));
        assert!(!Guard::parse("s > 1").unwrap().evaluate(&context));
    }

    proptest! {
        // Parser must never panic on arbitrary input.
        #[test]
        fn parse_never_panics(src in "\\PC{0,64}") {
            let _ = Guard::parse(&src);
        }

        // Number equality round-trips through the parser.
        #[test]
        fn number_equality_holds(n in -1_000_000i64..1_000_000i64) {
            let guard = Guard::parse(&format!("x == {n}")).unwrap();
            let context = ctx(json!({ "x": n }));
            prop_assert!(guard.evaluate(&context));
        }
    }
}
