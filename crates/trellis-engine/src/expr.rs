//! Sandboxed condition/expression language.
//!
//! A hand-written lexer, recursive-descent parser, and tree-walking
//! evaluator over a deliberately closed grammar: `and`/`or`/`not`,
//! comparisons (`==`, `!=`, `>`, `<`, `>=`, `<=`, `in`, `not in`, chained),
//! literals, attribute/subscript access on already-resolved values, and
//! variable lookups routed exclusively through the caller's resolver.
//! Enforcement is allow-list based: the grammar cannot produce a call, a
//! conditional, or any other host construct, and every unrecognized token
//! is a rejection fault.

use serde_json::json;

use trellis_core::error::{Result, TrellisError};
use trellis_core::value::{is_truthy, Value};

/// Evaluate `expression` to a boolean against the caller's resolver.
///
/// Syntax outside the whitelist is an [`TrellisError::ExpressionRejected`]
/// fault; runtime failures (unknown variables, unorderable operands) are
/// [`TrellisError::ExpressionFailed`]. An empty expression is true.
pub fn evaluate<F>(expression: &str, resolver: F) -> Result<bool>
where
    F: Fn(&str) -> Option<Value>,
{
    if expression.trim().is_empty() {
        return Ok(true);
    }
    let tokens = lex(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    let value = eval(&expr, &resolver)?;
    Ok(is_truthy(&value))
}

// ── Lexer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    And,
    Or,
    Not,
    In,
    EqEq,
    NotEq,
    Gt,
    Lt,
    Ge,
    Le,
    Minus,
    Dot,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

fn rejected(message: impl Into<String>) -> TrellisError {
    TrellisError::ExpressionRejected(message.into())
}

fn failed(message: impl Into<String>) -> TrellisError {
    TrellisError::ExpressionFailed(message.into())
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => push_simple(&mut chars, &mut tokens, Token::LParen),
            ')' => push_simple(&mut chars, &mut tokens, Token::RParen),
            '[' => push_simple(&mut chars, &mut tokens, Token::LBracket),
            ']' => push_simple(&mut chars, &mut tokens, Token::RBracket),
            '{' => push_simple(&mut chars, &mut tokens, Token::LBrace),
            '}' => push_simple(&mut chars, &mut tokens, Token::RBrace),
            ',' => push_simple(&mut chars, &mut tokens, Token::Comma),
            ':' => push_simple(&mut chars, &mut tokens, Token::Colon),
            '.' => push_simple(&mut chars, &mut tokens, Token::Dot),
            '-' => push_simple(&mut chars, &mut tokens, Token::Minus),
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err(rejected("assignment is not allowed"));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    return Err(rejected("unary '!' is not allowed"));
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '\'' | '"' => {
                let quote = ch;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err(rejected("unterminated string literal")),
                        },
                        Some(c) => text.push(c),
                        None => return Err(rejected("unterminated string literal")),
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        // lookahead: digit after the dot means a float,
                        // otherwise it is attribute access on a number
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                            is_float = true;
                            text.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let value = if is_float {
                    let num: f64 = text
                        .parse()
                        .map_err(|_| rejected(format!("malformed number '{text}'")))?;
                    json!(num)
                } else {
                    let num: i64 = text
                        .parse()
                        .map_err(|_| rejected(format!("malformed number '{text}'")))?;
                    json!(num)
                };
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(keyword_or_ident(name)?);
            }
            other => {
                return Err(rejected(format!("unsupported character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn push_simple(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    tokens: &mut Vec<Token>,
    token: Token,
) {
    chars.next();
    tokens.push(token);
}

fn keyword_or_ident(name: String) -> Result<Token> {
    let token = match name.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "true" | "True" => Token::Literal(json!(true)),
        "false" | "False" => Token::Literal(json!(false)),
        "null" | "None" => Token::Literal(Value::Null),
        _ => {
            if name.contains("__") {
                return Err(rejected(format!("reserved name '{name}'")));
            }
            Token::Ident(name)
        }
    };
    Ok(token)
}

// ── Parser ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(rejected(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(rejected(format!("unexpected trailing {:?}", self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            Ok(Expr::Not(Box::new(operand)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let first = self.parse_unary()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::Ne,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Ge) => CmpOp::Ge,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => CmpOp::NotIn,
                _ => break,
            };
            self.next();
            if op == CmpOp::NotIn {
                self.next(); // the 'in' after 'not'
            }
            let right = self.parse_unary()?;
            chain.push((op, right));
        }
        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            Ok(Expr::Neg(Box::new(operand)))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Attr(Box::new(expr), name);
                    }
                    other => {
                        return Err(rejected(format!(
                            "expected attribute name, found {other:?}"
                        )))
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.peek() == Some(&Token::LParen) {
                return Err(rejected("function calls are not allowed"));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            if self.peek() == Some(&Token::RBracket) {
                                self.next();
                                break;
                            }
                            continue;
                        }
                        self.expect(Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = self.parse_or()?;
                        self.expect(Token::Colon)?;
                        let value = self.parse_or()?;
                        entries.push((key, value));
                        if self.eat(&Token::Comma) {
                            if self.peek() == Some(&Token::RBrace) {
                                self.next();
                                break;
                            }
                            continue;
                        }
                        self.expect(Token::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(rejected(format!("unexpected token {other:?}"))),
        }
    }
}

// ── Evaluator ───────────────────────────────────────────────────

fn eval<F>(expr: &Expr, resolver: &F) -> Result<Value>
where
    F: Fn(&str) -> Option<Value>,
{
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => {
            resolver(name).ok_or_else(|| TrellisError::MissingVariable(name.clone()))
        }
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, resolver)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (key_expr, value_expr) in entries {
                let key = match eval(key_expr, resolver)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                map.insert(key, eval(value_expr, resolver)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Attr(base, name) => {
            if name.contains("__") {
                return Err(rejected(format!("reserved attribute '{name}'")));
            }
            let value = eval(base, resolver)?;
            match value {
                Value::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| failed(format!("no attribute '{name}'"))),
                other => Err(failed(format!(
                    "cannot access attribute '{name}' on {}",
                    type_name(&other)
                ))),
            }
        }
        Expr::Index(base, index) => {
            let value = eval(base, resolver)?;
            let key = eval(index, resolver)?;
            index_value(&value, &key)
        }
        Expr::Neg(operand) => {
            let value = eval(operand, resolver)?;
            match value.as_f64() {
                Some(n) => Ok(json!(-n)),
                None => Err(failed("unary minus requires a number")),
            }
        }
        Expr::Not(operand) => {
            let value = eval(operand, resolver)?;
            Ok(json!(!is_truthy(&value)))
        }
        Expr::And(left, right) => {
            let lhs = eval(left, resolver)?;
            if !is_truthy(&lhs) {
                return Ok(json!(false));
            }
            let rhs = eval(right, resolver)?;
            Ok(json!(is_truthy(&rhs)))
        }
        Expr::Or(left, right) => {
            let lhs = eval(left, resolver)?;
            if is_truthy(&lhs) {
                return Ok(json!(true));
            }
            let rhs = eval(right, resolver)?;
            Ok(json!(is_truthy(&rhs)))
        }
        Expr::Compare(first, chain) => {
            let mut current = eval(first, resolver)?;
            for (op, right_expr) in chain {
                let right = eval(right_expr, resolver)?;
                if !compare(&current, *op, &right)? {
                    return Ok(json!(false));
                }
                current = right;
            }
            Ok(json!(true))
        }
    }
}

fn index_value(value: &Value, key: &Value) -> Result<Value> {
    match (value, key) {
        (Value::Array(items), Value::Number(n)) => {
            let raw = n
                .as_i64()
                .ok_or_else(|| failed("list index must be an integer"))?;
            let idx = if raw < 0 {
                items.len() as i64 + raw
            } else {
                raw
            };
            items
                .get(usize::try_from(idx).map_err(|_| failed("list index out of range"))?)
                .cloned()
                .ok_or_else(|| failed("list index out of range"))
        }
        (Value::Object(map), Value::String(name)) => {
            if name.contains("__") {
                return Err(rejected(format!("reserved attribute '{name}'")));
            }
            map.get(name)
                .cloned()
                .ok_or_else(|| failed(format!("no key '{name}'")))
        }
        (other, _) => Err(failed(format!("cannot index {}", type_name(other)))),
    }
}

/// Pairwise comparison used by (possibly chained) comparison expressions.
fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(value_eq(left, right)),
        CmpOp::Ne => Ok(!value_eq(left, right)),
        CmpOp::In => value_in(left, right),
        CmpOp::NotIn => value_in(left, right).map(|found| !found),
        CmpOp::Gt | CmpOp::Lt | CmpOp::Ge | CmpOp::Le => {
            let ordering = order(left, right)?;
            Ok(match op {
                CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
                CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                CmpOp::Ge => ordering != std::cmp::Ordering::Less,
                CmpOp::Le => ordering != std::cmp::Ordering::Greater,
                _ => unreachable!(),
            })
        }
    }
}

/// Structural equality with numeric coercion (1 == 1.0).
pub(crate) fn value_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn value_in(needle: &Value, haystack: &Value) -> Result<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| value_eq(needle, item))),
        Value::String(text) => match needle {
            Value::String(sub) => Ok(text.contains(sub.as_str())),
            _ => Err(failed("substring test requires a string")),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(failed("key test requires a string")),
        },
        other => Err(failed(format!(
            "'in' requires a list, string, or mapping, got {}",
            type_name(other)
        ))),
    }
}

fn order(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| failed("numbers are not comparable"));
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    Err(failed(format!(
        "cannot order {} against {}",
        type_name(left),
        type_name(right)
    )))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_with(expr: &str, pairs: &[(&str, Value)]) -> Result<bool> {
        let map = vars(pairs);
        evaluate(expr, |name| map.get(name).cloned())
    }

    #[test]
    fn whitelisted_operations() {
        let scope = [
            ("score", json!(12)),
            ("tag", json!("ok")),
            ("items", json!(["a", "b"])),
        ];
        assert!(eval_with("score > 10 and tag == 'ok' and 'a' in items", &scope).unwrap());
        assert!(!eval_with("score > 10 and tag == 'nope'", &scope).unwrap());
    }

    #[test]
    fn calls_rejected() {
        let err = eval_with("danger()", &[]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionRejected(_)));
    }

    #[test]
    fn dunders_rejected() {
        let err = eval_with("value.__class__", &[("value", json!(1))]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionRejected(_)));

        let err = eval_with("__import__", &[]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionRejected(_)));
    }

    #[test]
    fn not_and_extended_comparisons() {
        let scope = [
            ("score", json!(5)),
            ("tags", json!(["x", "z"])),
            ("flag", json!(false)),
        ];
        assert!(eval_with("not flag and score >= 5 and 'y' not in tags", &scope).unwrap());
    }

    #[test]
    fn chained_comparison_short_circuits() {
        let scope = [("score", json!(5))];
        assert!(eval_with("-1 < score <= 5", &scope).unwrap());
        assert!(!eval_with("-1 < score <= 4", &scope).unwrap());
        assert!(!eval_with("10 < score < 100", &scope).unwrap());
    }

    #[test]
    fn unsupported_operator_rejected() {
        let err = eval_with("~score", &[("score", json!(1))]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionRejected(_)));
    }

    #[test]
    fn unknown_variable_fails() {
        let err = eval_with("missing_var > 1", &[("existing", json!(1))]).unwrap_err();
        assert!(matches!(err, TrellisError::MissingVariable(_)));
    }

    #[test]
    fn attribute_and_subscript_on_resolved_values() {
        let scope = [("payload", json!({"user": {"age": 30}, "tags": ["a", "b"]}))];
        assert!(eval_with("payload.user.age == 30", &scope).unwrap());
        assert!(eval_with("payload.tags[0] == 'a'", &scope).unwrap());
        assert!(eval_with("payload.tags[-1] == 'b'", &scope).unwrap());
        assert!(eval_with("payload['user']['age'] > 18", &scope).unwrap());
    }

    #[test]
    fn literal_containers() {
        assert!(eval_with("'a' in ['a', 'b']", &[]).unwrap());
        assert!(eval_with("'k' in {'k': 1}", &[]).unwrap());
        assert!(eval_with("'ell' in 'hello'", &[]).unwrap());
        assert!(eval_with("2 in [1, 2, 3]", &[]).unwrap());
    }

    #[test]
    fn boolean_literals_both_spellings() {
        assert!(eval_with("true or False", &[]).unwrap());
        assert!(!eval_with("True and false", &[]).unwrap());
        assert!(eval_with("x == None", &[("x", Value::Null)]).unwrap());
    }

    #[test]
    fn numeric_coercion_in_equality() {
        assert!(eval_with("x == 1", &[("x", json!(1.0))]).unwrap());
    }

    #[test]
    fn empty_expression_is_true() {
        assert!(evaluate("", |_| None).unwrap());
        assert!(evaluate("   ", |_| None).unwrap());
    }

    #[test]
    fn ordering_mismatch_fails_not_panics() {
        let err = eval_with("x > 'a'", &[("x", json!(1))]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionFailed(_)));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let err = eval_with("1 == 1 1", &[]).unwrap_err();
        assert!(matches!(err, TrellisError::ExpressionRejected(_)));
    }
}
