use std::sync::Arc;

use regex::Regex;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;
use marlinsql_ir::{Expr, Literal};

use super::{CompiledScalar, ExprCompiler};

/// Compile a LIKE. Literal patterns compile their regex once; dynamic
/// patterns compile per evaluation.
pub fn compile(
    compiler: &ExprCompiler,
    expr: &Expr,
    pattern: &Expr,
    escape: Option<char>,
    negated: bool,
) -> Result<CompiledScalar> {
    let value = compiler.compile_scalar(expr)?;

    if let Expr::Literal(Literal::Text(pattern_text)) = pattern {
        let regex = translate(pattern_text, escape)?;
        return Ok(Arc::new(move |row| {
            match_like(&value(row)?, &regex, negated)
        }));
    }

    let pattern = compiler.compile_scalar(pattern)?;
    Ok(Arc::new(move |row| {
        let pattern_value = pattern(row)?;
        let pattern_text = match &pattern_value {
            QueryValue::Null => return Ok(QueryValue::Null),
            QueryValue::Text(s) => s,
            other => return Err(Error::type_mismatch("nvarchar pattern", other.type_name())),
        };
        let regex = translate(pattern_text, escape)?;
        match_like(&value(row)?, &regex, negated)
    }))
}

fn match_like(value: &QueryValue, regex: &Regex, negated: bool) -> Result<QueryValue> {
    let text = match value {
        QueryValue::Null => return Ok(QueryValue::Null),
        QueryValue::Text(s) => s.clone(),
        other => other.display_text(),
    };
    Ok(QueryValue::Bool(regex.is_match(&text) != negated))
}

/// Translate a SQL LIKE pattern (`%`, `_`, `[...]`, `[^...]`, ESCAPE) to an
/// anchored case-insensitive regex.
pub fn translate(pattern: &str, escape: Option<char>) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?is)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            match chars.next() {
                Some(escaped) => push_literal(&mut out, escaped),
                None => {
                    return Err(Error::execution(format!(
                        "LIKE pattern ends with escape character: {}",
                        pattern
                    )))
                }
            }
            continue;
        }
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if matches!(inner, '\\' | '[') {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            other => push_literal(&mut out, other),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::execution(format!("invalid LIKE pattern: {}", e)))
}

fn push_literal(out: &mut String, c: char) {
    if c.is_ascii_alphanumeric() {
        out.push(c);
    } else {
        out.push_str(&regex::escape(&c.to_string()));
    }
}
