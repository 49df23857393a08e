use std::sync::Arc;

use async_stream::try_stream;

use marlinsql_common::error::Error;
use marlinsql_common::types::{QueryValue, Row};

use crate::context::ExecutionContext;
use crate::eval::functions::number_value;
use crate::eval::CompiledScalar;
use crate::exec::{QueryPlanNode, RowStream};

/// OPENJSON(json [, path]): yields `{key, value, type}` rows over the
/// elements of the addressed array or object.
pub struct OpenJson {
    pub json: CompiledScalar,
    pub path: Option<String>,
}

/// T-SQL OPENJSON type codes.
fn type_code(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Null => 0,
        serde_json::Value::String(_) => 1,
        serde_json::Value::Number(_) => 2,
        serde_json::Value::Bool(_) => 3,
        serde_json::Value::Array(_) => 4,
        serde_json::Value::Object(_) => 5,
    }
}

fn element_value(value: &serde_json::Value) -> QueryValue {
    match value {
        serde_json::Value::Null => QueryValue::Null,
        serde_json::Value::Bool(b) => QueryValue::Bool(*b),
        serde_json::Value::Number(n) => number_value(n),
        serde_json::Value::String(s) => QueryValue::Text(s.clone()),
        nested => QueryValue::Text(nested.to_string()),
    }
}

fn openjson_row(key: String, value: &serde_json::Value) -> Row {
    Row::from_pairs([
        ("key".to_string(), QueryValue::Text(key)),
        ("value".to_string(), element_value(value)),
        ("type".to_string(), QueryValue::Int(type_code(value))),
    ])
}

impl QueryPlanNode for OpenJson {
    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("OpenJson({})", path),
            None => "OpenJson".to_string(),
        }
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let json = match (self.json)(&Row::new())? {
                QueryValue::Null => return,
                value => require_text("OPENJSON", value)?,
            };
            let parsed: serde_json::Value = serde_json::from_str(&json)
                .map_err(|e| Error::execution(format!("invalid JSON text: {}", e)))?;

            let target = match &self.path {
                Some(path) => match json_path(&parsed, path) {
                    Some(v) => v.clone(),
                    None => return,
                },
                None => parsed,
            };

            match target {
                serde_json::Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        ctx.ensure_active()?;
                        yield openjson_row(i.to_string(), item);
                    }
                }
                serde_json::Value::Object(map) => {
                    for (key, value) in &map {
                        ctx.ensure_active()?;
                        yield openjson_row(key.clone(), value);
                    }
                }
                scalar => {
                    yield openjson_row("0".to_string(), &scalar);
                }
            }
        })
    }
}

fn require_text(label: &str, value: QueryValue) -> marlinsql_common::error::Result<String> {
    match value {
        QueryValue::Text(s) => Ok(s),
        other => Err(Error::type_mismatch(
            format!("nvarchar argument to {}", label),
            other.type_name(),
        )),
    }
}

fn require_separator(value: QueryValue) -> marlinsql_common::error::Result<String> {
    match value {
        QueryValue::Text(s) if s.chars().count() == 1 => Ok(s),
        QueryValue::Null => Err(Error::execution("STRING_SPLIT separator must not be null")),
        other => Err(Error::execution(format!(
            "STRING_SPLIT separator must be a single character, got '{}'",
            other
        ))),
    }
}

/// Minimal `$`-rooted dotted path for OPENJSON's second argument.
fn json_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    let trimmed = path.trim().trim_start_matches("lax ").trim_start_matches("strict ");
    let rest = trimmed.strip_prefix('$')?;
    for step in rest.split('.').filter(|s| !s.is_empty()) {
        let (key, indices) = match step.find('[') {
            Some(bracket) => (&step[..bracket], Some(&step[bracket..])),
            None => (step, None),
        };
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        if let Some(indices) = indices {
            for part in indices.split('[').filter(|s| !s.is_empty()) {
                let index: usize = part.trim_end_matches(']').trim().parse().ok()?;
                current = current.as_array()?.get(index)?;
            }
        }
    }
    Some(current)
}

/// STRING_SPLIT(text, separator): one `value` column per fragment.
pub struct StringSplit {
    pub text: CompiledScalar,
    pub separator: CompiledScalar,
}

impl QueryPlanNode for StringSplit {
    fn describe(&self) -> String {
        "StringSplit".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let text = match (self.text)(&Row::new())? {
                QueryValue::Null => return,
                value => require_text("STRING_SPLIT", value)?,
            };
            let separator = require_separator((self.separator)(&Row::new())?)?;
            for piece in text.split(&separator) {
                ctx.ensure_active()?;
                yield Row::from_pairs([(
                    "value".to_string(),
                    QueryValue::Text(piece.to_string()),
                )]);
            }
        })
    }
}
