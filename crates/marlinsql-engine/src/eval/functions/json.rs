use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;

use super::{check_compiled_args, text_arg};
use crate::eval::CompiledScalar;

pub(crate) fn handles(name: &str) -> bool {
    matches!(name, "json_value" | "json_query" | "json_path_exists")
}

pub(crate) fn compile(name: &str, args: &[CompiledScalar]) -> Result<CompiledScalar> {
    check_compiled_args(name, args, 2, 2)?;
    let json = args[0].clone();
    let path = args[1].clone();
    let kind = name.to_string();
    Ok(Arc::new(move |row| {
        let (json_text, path_text) = match (text_arg(json(row)?), text_arg(path(row)?)) {
            (Some(j), Some(p)) => (j, p),
            _ => return Ok(QueryValue::Null),
        };
        let parsed: serde_json::Value = match serde_json::from_str(&json_text) {
            Ok(v) => v,
            Err(e) => {
                return Err(Error::execution(format!("invalid JSON text: {}", e)))
            }
        };
        let steps = parse_path(&path_text)?;
        let target = walk(&parsed, &steps);
        Ok(match (kind.as_str(), target) {
            ("json_path_exists", found) => QueryValue::Bool(found.is_some()),
            (_, None) => QueryValue::Null,
            // JSON_VALUE returns scalars only; JSON_QUERY returns
            // objects/arrays only.
            ("json_value", Some(v)) => match v {
                serde_json::Value::Null => QueryValue::Null,
                serde_json::Value::Bool(b) => QueryValue::Bool(*b),
                serde_json::Value::Number(n) => number_value(n),
                serde_json::Value::String(s) => QueryValue::Text(s.clone()),
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => QueryValue::Null,
            },
            (_, Some(v)) => match v {
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    QueryValue::Text(v.to_string())
                }
                _ => QueryValue::Null,
            },
        })
    }))
}

pub(crate) fn number_value(n: &serde_json::Number) -> QueryValue {
    if let Some(i) = n.as_i64() {
        QueryValue::Int(i)
    } else {
        QueryValue::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

#[derive(Debug, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

/// The T-SQL path dialect: `$`, `.key`, `."quoted key"`, `[index]`. A lax
/// prefix is accepted and ignored.
fn parse_path(path: &str) -> Result<Vec<Step>> {
    let path = path
        .trim()
        .strip_prefix("lax ")
        .or_else(|| path.trim().strip_prefix("strict "))
        .unwrap_or(path.trim());
    let mut chars = path.chars().peekable();
    if chars.next() != Some('$') {
        return Err(Error::execution(format!("JSON path must start with $: {}", path)));
    }
    let mut steps = Vec::new();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    let mut key = String::new();
                    for inner in chars.by_ref() {
                        if inner == '"' {
                            break;
                        }
                        key.push(inner);
                    }
                    steps.push(Step::Key(key));
                } else {
                    let mut key = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        key.push(next);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(Error::execution(format!("empty JSON path step: {}", path)));
                    }
                    steps.push(Step::Key(key));
                }
            }
            '[' => {
                let mut digits = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    digits.push(inner);
                }
                let index = digits
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::execution(format!("invalid JSON index [{}]", digits)))?;
                steps.push(Step::Index(index));
            }
            other => {
                return Err(Error::execution(format!(
                    "unexpected {} in JSON path {}",
                    other, path
                )))
            }
        }
    }
    Ok(steps)
}

fn walk<'a>(value: &'a serde_json::Value, steps: &[Step]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for step in steps {
        current = match step {
            Step::Key(key) => current.as_object()?.get(key)?,
            Step::Index(i) => current.as_array()?.get(*i)?,
        };
    }
    Some(current)
}
