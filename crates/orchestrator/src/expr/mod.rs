//! Expression evaluator (C1): path queries, boolean conditions, ternary
//! actor-name resolution, and a handful of pseudo-functions, evaluated
//! against a flat JSON context object.
//!
//! The context passed to [`evaluate`] is expected to be a JSON object with
//! `trigger` and `stages` keys plus, for scatter/gather scoped evaluation,
//! any additional sibling keys bound by the executor (e.g. the scatter
//! `as` binding). Evaluator failures never abort dispatch: callers get
//! `None`/`false` plus a `tracing::warn!` rather than a propagated error,
//! matching the "surfaces as null/false with a diagnostic" contract.

mod lexer;
mod parser;

use serde_json::Value;

use lexer::Lexer;
use parser::{Expr, Parser};

/// Marker prefix identifying a string as a path/boolean/ternary expression
/// rather than a literal value.
pub const PATH_MARKER: &str = "$.";

/// Returns true if `value` looks like an expression rather than a literal.
pub fn is_expression(value: &str) -> bool {
    value.starts_with(PATH_MARKER) || value.contains("$.")
}

/// Evaluate an expression string against a context, returning `Value::Null`
/// (with a warning logged) on any parse or lookup failure.
pub fn evaluate(expression: &str, context: &Value) -> Value {
    match parse(expression) {
        Ok(expr) => expr.eval(context),
        Err(err) => {
            tracing::warn!(expression, error = %err, "expression evaluation failed");
            Value::Null
        }
    }
}

/// Evaluate an expression as a boolean condition; evaluation failures and
/// non-boolean results coerce to `false`.
pub fn evaluate_bool(expression: &str, context: &Value) -> bool {
    match evaluate(expression, context) {
        Value::Bool(b) => b,
        Value::Null => false,
        other => truthy(&other),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolve a stage input map: for each value, if it is a string expression
/// evaluate it; if it is a plain string, keep it verbatim; otherwise copy
/// it as-is.
pub fn resolve_input_map(
    input: &serde_json::Map<String, Value>,
    context: &Value,
) -> serde_json::Map<String, Value> {
    input
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(s) if is_expression(s) => evaluate(s, context),
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn parse(expression: &str) -> Result<Expr, String> {
    let tokens = Lexer::new(expression).tokenize()?;
    Parser::new(tokens).parse()
}
