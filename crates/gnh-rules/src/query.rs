//! Path queries over semi-structured records, backed by JMESPath.

use std::fmt;
use std::sync::Arc;

use jmespath::Expression;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path query `{expression}`: {message}")]
pub struct QueryError {
    pub expression: String,
    pub message: String,
}

/// Parses `expression` without evaluating it.
pub fn validate(expression: &str) -> Result<(), QueryError> {
    PathQuery::compile(expression).map(|_| ())
}

/// JMESPath truthiness: null, false, empty strings, lists and objects are falsy.
/// Numbers are always truthy, zero included.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(_) => true,
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// Rewrites bare `true`, `false` and `null` operands into JMESPath literals so
/// `items[?flag==true]` compares against the boolean rather than a field named
/// `true`. Quoted regions, dotted sub-expressions (`a.true`) and hash keys
/// (`{true: a}`) are left alone.
fn normalize_literals(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len() + 8);
    let mut chars = expression.chars().peekable();
    let mut quote: Option<char> = None;
    let mut last_significant: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
                last_significant = Some(c);
            }
            continue;
        }

        if matches!(c, '\'' | '"' | '`') {
            quote = Some(c);
            out.push(c);
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    word.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let is_literal = matches!(word.as_str(), "true" | "false" | "null");
            let is_key = chars.clone().find(|next| !next.is_whitespace()) == Some(':');
            if is_literal && !is_key && last_significant != Some('.') {
                out.push('`');
                out.push_str(&word);
                out.push('`');
            } else {
                out.push_str(&word);
            }
            last_significant = word.chars().last();
            continue;
        }

        if !c.is_whitespace() {
            last_significant = Some(c);
        }
        out.push(c);
    }
    out
}

/// A compiled path query. Compilation happens once, at configuration load.
#[derive(Clone)]
pub struct PathQuery {
    source: String,
    compiled: Arc<Expression<'static>>,
}

impl PathQuery {
    pub fn compile(expression: &str) -> Result<Self, QueryError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(QueryError {
                expression: expression.to_string(),
                message: "expression is empty".to_string(),
            });
        }
        let compiled = jmespath::compile(&normalize_literals(trimmed)).map_err(|err| QueryError {
            expression: expression.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            source: trimmed.to_string(),
            compiled: Arc::new(compiled),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `None` when the path is missing or resolves to null. Never errors:
    /// runtime type errors inside the expression also read as "not found".
    pub fn evaluate(&self, doc: &JsonValue) -> Option<JsonValue> {
        let found = match self.compiled.search(doc) {
            Ok(found) => found,
            Err(err) => {
                debug!(query = %self.source, error = %err, "path query failed at runtime; treating as missing");
                return None;
            }
        };
        if found.is_null() {
            return None;
        }
        match serde_json::to_value(&*found) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(query = %self.source, error = %err, "path query result is not representable as JSON");
                None
            }
        }
    }

    /// `found && truthy(value)`.
    pub fn test(&self, doc: &JsonValue) -> bool {
        self.evaluate(doc).is_some_and(|value| is_truthy(&value))
    }
}

impl fmt::Debug for PathQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathQuery").field(&self.source).finish()
    }
}

impl fmt::Display for PathQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for PathQuery {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
