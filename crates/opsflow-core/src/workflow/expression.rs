//! Safe predicate evaluation for condition and break expressions.
//!
//! Expressions are authored by workflow designers, not trusted operators, so
//! nothing here ever executes code. An expression is parsed into a tiny
//! [`Expression`] structure with exactly one of two shapes:
//!
//! - `<path> <op> <operand>` with op in `== === != !== > >= < <=`
//! - `<operand>` alone, evaluated for truthiness
//!
//! Paths are dot-separated lookups resolved by [`resolve_path`]. Operands are
//! parsed in priority order: number, quoted string, boolean, `null`, else path.

use std::borrow::Cow;

use serde_json::Value;

/// Path segments that are never traversed.
const BLOCKED_SEGMENTS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Operators, longest first so `===` is not read as `==`.
const OPERATORS: [(&str, CompareOp); 8] = [
    ("===", CompareOp::StrictEq),
    ("!==", CompareOp::StrictNe),
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

// ---------------------------------------------------------------------------
// Parsed form
// ---------------------------------------------------------------------------

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A literal value or a path to look up.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

impl Operand {
    /// Parse an operand token: number, quoted string, boolean, null, else path.
    pub fn parse(token: &str) -> Operand {
        let token = token.trim();

        if let Ok(i) = token.parse::<i64>() {
            return Operand::Literal(Value::from(i));
        }
        if let Ok(f) = token.parse::<f64>() {
            if f.is_finite() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Operand::Literal(Value::Number(n));
                }
            }
        }
        if token.len() >= 2 {
            let quoted = (token.starts_with('"') && token.ends_with('"'))
                || (token.starts_with('\'') && token.ends_with('\''));
            if quoted {
                return Operand::Literal(Value::String(token[1..token.len() - 1].to_string()));
            }
        }
        match token {
            "true" => Operand::Literal(Value::Bool(true)),
            "false" => Operand::Literal(Value::Bool(false)),
            "null" => Operand::Literal(Value::Null),
            _ => Operand::Path(token.to_string()),
        }
    }

    fn resolve<'a>(&'a self, context: &'a Value) -> Option<Cow<'a, Value>> {
        match self {
            Operand::Literal(v) => Some(Cow::Borrowed(v)),
            Operand::Path(p) => resolve_path(context, p),
        }
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        path: String,
        op: CompareOp,
        rhs: Operand,
    },
    Truthy(Operand),
}

impl Expression {
    /// Parse an expression. Never fails: anything that is not a single
    /// comparison is a truthiness check.
    pub fn parse(source: &str) -> Expression {
        let source = source.trim();
        if let Some((pos, op_str, op)) = find_operator(source) {
            let path = source[..pos].trim();
            let rhs = source[pos + op_str.len()..].trim();
            if is_path(path) && !rhs.is_empty() {
                return Expression::Compare {
                    path: path.to_string(),
                    op,
                    rhs: Operand::parse(rhs),
                };
            }
        }
        Expression::Truthy(Operand::parse(source))
    }

    /// Evaluate against a JSON context object.
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Expression::Truthy(operand) => operand
                .resolve(context)
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            Expression::Compare { path, op, rhs } => {
                let left = resolve_path(context, path);
                let right = rhs.resolve(context);
                compare(left.as_deref(), *op, right.as_deref())
            }
        }
    }
}

/// Parse and evaluate `expression` against `context`.
pub fn safe_evaluate_expression(expression: &str, context: &Value) -> bool {
    let parsed = Expression::parse(expression);
    let result = parsed.evaluate(context);
    tracing::trace!(expression, result, "evaluated expression");
    result
}

/// First operator occurrence outside quotes.
fn find_operator(source: &str) -> Option<(usize, &'static str, CompareOp)> {
    let bytes = source.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None => {
                for (op_str, op) in OPERATORS {
                    if bytes[i..].starts_with(op_str.as_bytes()) {
                        return Some((i, op_str, op));
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn is_path(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(char::is_whitespace)
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Walk dot-separated `path` through `root`.
///
/// - `__proto__`, `constructor` and `prototype` resolve to `None`
/// - `length` on an array or string yields its element count
/// - numeric segments index arrays
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if segment.is_empty() || BLOCKED_SEGMENTS.contains(&segment) {
            return None;
        }
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                if segment == "length" {
                    return segments
                        .peek()
                        .is_none()
                        .then(|| Cow::Owned(Value::from(items.len())));
                }
                let idx: usize = segment.parse().ok()?;
                current = items.get(idx)?;
            }
            Value::String(s) if segment == "length" && segments.peek().is_none() => {
                return Some(Cow::Owned(Value::from(s.chars().count())));
            }
            _ => return None,
        }
    }

    Some(Cow::Borrowed(current))
}

// ---------------------------------------------------------------------------
// Comparison semantics
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(left: Option<&Value>, op: CompareOp, right: Option<&Value>) -> bool {
    match op {
        CompareOp::StrictEq => left == right,
        CompareOp::StrictNe => left != right,
        CompareOp::Eq => loose_eq(left, right),
        CompareOp::Ne => !loose_eq(left, right),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let (Some(l), Some(r)) = (left, right) else {
                return false;
            };
            let ordering = if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
                a.partial_cmp(&b)
            } else if let (Value::String(a), Value::String(b)) = (l, r) {
                Some(a.cmp(b))
            } else {
                None
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    }
}

/// `==`: null and missing are equal to each other; numbers, numeric strings
/// and booleans compare numerically; everything else compares structurally.
fn loose_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(l), Some(r)) => {
            if l == r {
                return true;
            }
            match (l, r) {
                (Value::String(_), Value::String(_)) => false,
                _ => match (as_number(l), as_number(r)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
            }
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Template interpolation
// ---------------------------------------------------------------------------

/// Replace `{{path}}` placeholders with values from `context`.
///
/// Strings are inserted as-is, other values as compact JSON. Placeholders
/// that do not resolve become empty strings.
pub fn interpolate_template(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = resolve_path(context, path) {
            match value.as_ref() {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
