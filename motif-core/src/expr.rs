//! Edge expressions.
//!
//! Expression-defined edges carry their predicate or transform as text so a
//! workflow's graph can be exported as plain data and restored later. The
//! text is compiled once, when the edge is constructed, and evaluated against
//! the candidate output bound to `out`.
//!
//! The language is a small JavaScript subset:
//!
//! - `out`, `out.field`, `out.items[0]`, `out["key"]` - access to the output
//! - `42`, `1.5`, `"text"`, `'text'`, `true`, `false`, `null`, `undefined`
//! - `{ name: out.user, "age": 3 }`, `[out.a, out.b]` - object and array literals
//! - `!x`, `-x`
//! - `* / %`, `+ -` (`+` concatenates when either side is a string)
//! - `< <= > >=`, `=== !== == !=`
//! - `a && b`, `a || b` - return one of the operands
//! - `c ? a : b`, `( ... )`
//!
//! Examples:
//! - `out % 2 === 0`
//! - `out.confirmed === true`
//! - `{ username: out.name, years: out.age }`

use crate::error::WorkflowError;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Name the candidate output is bound to.
pub const OUTPUT_BINDING: &str = "out";

/// Failure while evaluating a compiled expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EvalError(String);

impl EvalError {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    StrictEq,
    StrictNe,
    LooseEq,
    LooseNe,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A JSON literal.
    Literal(Value),
    /// `undefined`.
    Undefined,
    /// The `out` binding.
    Output,
    /// `target.field`.
    Member(Box<Expr>, String),
    /// `target[index]`.
    Index(Box<Expr>, Box<Expr>),
    /// `{ key: value, ... }`.
    Object(Vec<(String, Expr)>),
    /// `[a, b, ...]`.
    Array(Vec<Expr>),
    /// `!expr`.
    Not(Box<Expr>),
    /// `-expr`.
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `cond ? then : otherwise`.
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// An expression compiled from source, ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    expr: Expr,
}

impl CompiledExpr {
    /// Parses `source`.
    pub fn compile(source: &str) -> Result<Self, WorkflowError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut parser = Parser::new(trimmed);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < trimmed.len() {
            return Err(invalid(format!(
                "unexpected '{}' at position {}",
                &trimmed[parser.pos..],
                parser.pos
            )));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates against `out`. `None` is `undefined`.
    pub fn evaluate(&self, out: &Value) -> Result<Option<Value>, EvalError> {
        self.expr.evaluate(out)
    }

    /// Evaluates and applies truthiness.
    pub fn test(&self, out: &Value) -> Result<bool, EvalError> {
        Ok(is_truthy(&self.evaluate(out)?))
    }
}

impl Expr {
    /// Evaluates against `out`. `None` is `undefined`.
    pub fn evaluate(&self, out: &Value) -> Result<Option<Value>, EvalError> {
        match self {
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::Undefined => Ok(None),
            Expr::Output => Ok(Some(out.clone())),
            Expr::Member(target, field) => {
                let target = target.evaluate(out)?;
                read_property(target.as_ref(), field)
            }
            Expr::Index(target, index) => {
                let target = target.evaluate(out)?;
                let index = index.evaluate(out)?;
                read_index(target.as_ref(), index.as_ref())
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    // undefined members are omitted, as JSON.stringify does
                    if let Some(v) = value.evaluate(out)? {
                        map.insert(key.clone(), v);
                    }
                }
                Ok(Some(Value::Object(map)))
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(out)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(values)))
            }
            Expr::Not(inner) => Ok(Some(Value::Bool(!is_truthy(&inner.evaluate(out)?)))),
            Expr::Neg(inner) => {
                let v = inner.evaluate(out)?;
                let n = as_number(v.as_ref(), "-")?;
                number(-n).map(Some)
            }
            Expr::Binary(op, left, right) => {
                let l = left.evaluate(out)?;
                let r = right.evaluate(out)?;
                binary(*op, l, r)
            }
            Expr::And(left, right) => {
                let l = left.evaluate(out)?;
                if is_truthy(&l) {
                    right.evaluate(out)
                } else {
                    Ok(l)
                }
            }
            Expr::Or(left, right) => {
                let l = left.evaluate(out)?;
                if is_truthy(&l) {
                    Ok(l)
                } else {
                    right.evaluate(out)
                }
            }
            Expr::Conditional(cond, then, otherwise) => {
                if is_truthy(&cond.evaluate(out)?) {
                    then.evaluate(out)
                } else {
                    otherwise.evaluate(out)
                }
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidExpression {
        reason: reason.into(),
    }
}

/// JavaScript truthiness; `None` is `undefined`.
pub fn is_truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn describe(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(v) => crate::schema::type_name(v),
    }
}

fn read_property(target: Option<&Value>, field: &str) -> Result<Option<Value>, EvalError> {
    match target {
        None | Some(Value::Null) => Err(EvalError::new(format!(
            "cannot read property '{}' of {}",
            field,
            describe(target)
        ))),
        Some(Value::Object(map)) => Ok(map.get(field).cloned()),
        Some(Value::Array(items)) if field == "length" => Ok(Some(Value::from(items.len()))),
        Some(Value::String(s)) if field == "length" => Ok(Some(Value::from(s.chars().count()))),
        Some(_) => Ok(None),
    }
}

fn read_index(target: Option<&Value>, index: Option<&Value>) -> Result<Option<Value>, EvalError> {
    match (target, index) {
        (None | Some(Value::Null), _) => Err(EvalError::new(format!(
            "cannot index into {}",
            describe(target)
        ))),
        (Some(Value::Array(items)), Some(Value::Number(n))) => Ok(n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()),
        (Some(Value::String(s)), Some(Value::Number(n))) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))),
        (Some(target), Some(Value::String(key))) => read_property(Some(target), key),
        _ => Ok(None),
    }
}

fn as_number(value: Option<&Value>, op: &str) -> Result<f64, EvalError> {
    match value {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| EvalError::new(format!("number out of range for '{}'", op))),
        other => Err(EvalError::new(format!(
            "operator '{}' expects numbers, got {}",
            op,
            describe(other)
        ))),
    }
}

/// Converts an arithmetic result back into a JSON number.
fn number(f: f64) -> Result<Value, EvalError> {
    if !f.is_finite() {
        return Err(EvalError::new("arithmetic result is not a finite number"));
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::from(f as i64));
    }
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::new("arithmetic result is not a finite number"))
}

fn to_display(value: &Option<Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn strict_equal(l: &Option<Value>, r: &Option<Value>) -> bool {
    match (l, r) {
        (None, None) => true,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| a == b)
            .unwrap_or(false),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn loose_equal(l: &Option<Value>, r: &Option<Value>) -> bool {
    let nullish = |v: &Option<Value>| matches!(v, None | Some(Value::Null));
    if nullish(l) || nullish(r) {
        return nullish(l) && nullish(r);
    }
    strict_equal(l, r)
}

fn binary(op: BinaryOp, l: Option<Value>, r: Option<Value>) -> Result<Option<Value>, EvalError> {
    let result = match op {
        BinaryOp::Add => match (&l, &r) {
            (Some(Value::String(_)), _) | (_, Some(Value::String(_))) => {
                Value::String(format!("{}{}", to_display(&l), to_display(&r)))
            }
            _ => number(as_number(l.as_ref(), "+")? + as_number(r.as_ref(), "+")?)?,
        },
        BinaryOp::Sub => number(as_number(l.as_ref(), "-")? - as_number(r.as_ref(), "-")?)?,
        BinaryOp::Mul => number(as_number(l.as_ref(), "*")? * as_number(r.as_ref(), "*")?)?,
        BinaryOp::Div => {
            let divisor = as_number(r.as_ref(), "/")?;
            if divisor == 0.0 {
                return Err(EvalError::new("division by zero"));
            }
            number(as_number(l.as_ref(), "/")? / divisor)?
        }
        BinaryOp::Rem => {
            let divisor = as_number(r.as_ref(), "%")?;
            if divisor == 0.0 {
                return Err(EvalError::new("modulo by zero"));
            }
            number(as_number(l.as_ref(), "%")? % divisor)?
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Value::Bool(compare(op, &l, &r)?)
        }
        BinaryOp::StrictEq => Value::Bool(strict_equal(&l, &r)),
        BinaryOp::StrictNe => Value::Bool(!strict_equal(&l, &r)),
        BinaryOp::LooseEq => Value::Bool(loose_equal(&l, &r)),
        BinaryOp::LooseNe => Value::Bool(!loose_equal(&l, &r)),
    };
    Ok(Some(result))
}

fn compare(op: BinaryOp, l: &Option<Value>, r: &Option<Value>) -> Result<bool, EvalError> {
    let ordering = match (l, r) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.partial_cmp(b),
        (Some(Value::Number(_)), Some(Value::Number(_))) => {
            let a = as_number(l.as_ref(), "<")?;
            let b = as_number(r.as_ref(), "<")?;
            a.partial_cmp(&b)
        }
        _ => {
            return Err(EvalError::new(format!(
                "cannot compare {} with {}",
                describe(l.as_ref()),
                describe(r.as_ref())
            )))
        }
    };
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

/// Recursive descent parser for edge expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, WorkflowError> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Expr, WorkflowError> {
        let cond = self.parse_or()?;
        self.skip_whitespace();

        if self.peek_char() == Some('?') {
            self.pos += 1;
            let then = self.parse_conditional()?;
            self.expect(':')?;
            let otherwise = self.parse_conditional()?;
            return Ok(Expr::Conditional(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }

        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_comparison()?;

        loop {
            self.skip_whitespace();
            let op = if self.peek_str("===") {
                self.pos += 3;
                BinaryOp::StrictEq
            } else if self.peek_str("!==") {
                self.pos += 3;
                BinaryOp::StrictNe
            } else if self.peek_str("==") {
                self.pos += 2;
                BinaryOp::LooseEq
            } else if self.peek_str("!=") {
                self.pos += 2;
                BinaryOp::LooseNe
            } else {
                return Ok(left);
            };
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_additive()?;

        loop {
            self.skip_whitespace();
            let op = if self.peek_str("<=") {
                self.pos += 2;
                BinaryOp::Le
            } else if self.peek_str(">=") {
                self.pos += 2;
                BinaryOp::Ge
            } else if self.peek_char() == Some('<') {
                self.pos += 1;
                BinaryOp::Lt
            } else if self.peek_char() == Some('>') {
                self.pos += 1;
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, WorkflowError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') => {
                self.pos += 1;
                let inner = self.parse_unary()?; // allows !!out
                Ok(Expr::Not(Box::new(inner)))
            }
            Some('-') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, WorkflowError> {
        let mut expr = self.parse_primary()?;

        loop {
            self.skip_whitespace();
            match self.peek_char() {
                Some('.') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    let field = self.parse_ident()?;
                    expr = Expr::Member(Box::new(expr), field);
                }
                Some('[') => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    self.expect(']')?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, WorkflowError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) if is_ident_start(c) => {
                let ident = self.parse_ident()?;
                match ident.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    "undefined" => Ok(Expr::Undefined),
                    OUTPUT_BINDING => Ok(Expr::Output),
                    other => Err(invalid(format!(
                        "unknown identifier '{}', only '{}' is bound",
                        other, OUTPUT_BINDING
                    ))),
                }
            }
            Some(c) => Err(invalid(format!(
                "unexpected '{}' at position {}",
                c, self.pos
            ))),
            None => Err(invalid("unexpected end of expression")),
        }
    }

    fn parse_object(&mut self) -> Result<Expr, WorkflowError> {
        self.expect('{')?;
        let mut fields = Vec::new();

        loop {
            self.skip_whitespace();
            if self.peek_char() == Some('}') {
                self.pos += 1;
                return Ok(Expr::Object(fields));
            }

            let key = match self.peek_char() {
                Some('"') | Some('\'') => self.parse_string()?,
                Some(c) if is_ident_start(c) => self.parse_ident()?,
                _ => return Err(invalid(format!("expected object key at position {}", self.pos))),
            };
            self.expect(':')?;
            let value = self.parse_expr()?;
            fields.push((key, value));

            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some('}') => {}
                _ => return Err(invalid("expected ',' or '}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Expr, WorkflowError> {
        self.expect('[')?;
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            if self.peek_char() == Some(']') {
                self.pos += 1;
                return Ok(Expr::Array(items));
            }

            items.push(self.parse_expr()?);

            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(']') => {}
                _ => return Err(invalid("expected ',' or ']'")),
            }
        }
    }

    fn parse_ident(&mut self) -> Result<String, WorkflowError> {
        let start = self.pos;
        match self.peek_char() {
            Some(c) if is_ident_start(c) => self.pos += c.len_utf8(),
            _ => return Err(invalid(format!("expected identifier at position {}", start))),
        }
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, WorkflowError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(invalid("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .peek_char()
                .ok_or_else(|| invalid("unterminated string"))?;
            self.pos += escaped.len_utf8();
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Expr, WorkflowError> {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        // Optional exponent
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            self.pos += 1;
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        let parsed = num_str
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", num_str)))?;
        number(parsed)
            .map(Expr::Literal)
            .map_err(|e| invalid(e.to_string()))
    }

    fn expect(&mut self, c: char) -> Result<(), WorkflowError> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(invalid(format!("expected '{}' at position {}", c, self.pos)));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}
