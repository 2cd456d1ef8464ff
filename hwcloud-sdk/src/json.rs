//! Helpers for building request bodies and digging through responses.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Key(String),
    Index(i64),
    Wildcard,
}

/// Tokens of each `|`-separated segment
fn tokenize(expr: &str) -> Option<Vec<Vec<Token>>> {
    let mut segments = Vec::new();
    let mut tokens = Vec::new();
    let mut chars = expr.chars();
    let mut ident = String::new();

    let flush = |ident: &mut String, tokens: &mut Vec<Token>| {
        if !ident.is_empty() {
            tokens.push(Token::Key(std::mem::take(ident)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut ident, &mut tokens),
            '|' => {
                flush(&mut ident, &mut tokens);
                segments.push(std::mem::take(&mut tokens));
            }
            '"' => {
                flush(&mut ident, &mut tokens);
                let mut key = String::new();
                loop {
                    match chars.next()? {
                        '"' => break,
                        c => key.push(c),
                    }
                }
                tokens.push(Token::Key(key));
            }
            '[' => {
                flush(&mut ident, &mut tokens);
                let mut inner = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        c => inner.push(c),
                    }
                }
                match inner.trim() {
                    "*" => tokens.push(Token::Wildcard),
                    n => tokens.push(Token::Index(n.parse().ok()?)),
                }
            }
            c if c.is_whitespace() => {}
            c => ident.push(c),
        }
    }
    flush(&mut ident, &mut tokens);
    segments.push(tokens);
    Some(segments)
}

fn search(tokens: &[Token], value: &Value) -> Option<Value> {
    let Some((first, rest)) = tokens.split_first() else {
        return Some(value.clone());
    };
    match first {
        Token::Key(key) => search(rest, value.as_object()?.get(key)?),
        Token::Index(i) => {
            let items = value.as_array()?;
            let idx = if *i < 0 {
                items.len().checked_sub(i.unsigned_abs() as usize)?
            } else {
                *i as usize
            };
            search(rest, items.get(idx)?)
        }
        Token::Wildcard => {
            let projected: Vec<Value> = value
                .as_array()?
                .iter()
                .filter_map(|item| search(rest, item))
                .filter(|v| !v.is_null())
                .collect();
            Some(Value::Array(projected))
        }
    }
}

/// Evaluate a small JMESPath subset: `a.b`, `a[0]`, `a[-1]`, `"quoted.key"`,
/// `a[*].b` projections and `a|[0]` pipes. A pipe ends a projection: the
/// next segment sees the projected array. Missing paths yield `None`.
pub fn path_search(expr: &str, value: &Value) -> Option<Value> {
    let segments = tokenize(expr)?;
    let mut current = value.clone();
    for tokens in &segments {
        current = search(tokens, &current)?;
    }
    Some(current).filter(|v| !v.is_null())
}

pub fn path_search_str(expr: &str, value: &Value) -> Option<String> {
    path_search(expr, value).and_then(|v| v.as_str().map(str::to_string))
}

pub fn path_search_i64(expr: &str, value: &Value) -> Option<i64> {
    path_search(expr, value).and_then(|v| v.as_i64())
}

pub fn path_search_bool(expr: &str, value: &Value) -> Option<bool> {
    path_search(expr, value).and_then(|v| v.as_bool())
}

/// Array at `expr`, or an empty list
pub fn path_search_array(expr: &str, value: &Value) -> Vec<Value> {
    match path_search(expr, value) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// `Null` for zero values (empty string, 0, false, empty collections)
pub fn value_ignore_empty(value: Value) -> Value {
    let empty = match &value {
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !b,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Null => true,
    };
    if empty { Value::Null } else { value }
}

/// Drop `null` members and objects left empty, recursively
pub fn remove_nil(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    let v = remove_nil(v);
                    match &v {
                        Value::Null => None,
                        Value::Object(o) if o.is_empty() => None,
                        _ => Some((k, v)),
                    }
                })
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(remove_nil)
                .filter(|v| !v.is_null())
                .collect(),
        ),
        other => other,
    }
}
