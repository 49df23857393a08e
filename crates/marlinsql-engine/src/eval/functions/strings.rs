use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;

use super::{check_compiled_args, int_arg, text_arg};
use crate::eval::{like, CompiledScalar};

pub(crate) fn handles(name: &str) -> bool {
    matches!(
        name,
        "upper"
            | "lower"
            | "len"
            | "datalength"
            | "substring"
            | "charindex"
            | "replace"
            | "trim"
            | "ltrim"
            | "rtrim"
            | "stuff"
            | "replicate"
            | "patindex"
            | "concat"
            | "concat_ws"
            | "format"
            | "space"
            | "left"
            | "right"
            | "reverse"
    )
}

pub(crate) fn compile(name: &str, args: &[CompiledScalar]) -> Result<CompiledScalar> {
    match name {
        "upper" => unary_text(name, args, |s| QueryValue::Text(s.to_uppercase())),
        "lower" => unary_text(name, args, |s| QueryValue::Text(s.to_lowercase())),
        // LEN ignores trailing spaces; DATALENGTH does not.
        "len" => unary_text(name, args, |s| {
            QueryValue::Int(s.trim_end_matches(' ').chars().count() as i64)
        }),
        "datalength" => unary_text(name, args, |s| QueryValue::Int(s.len() as i64)),
        "trim" => unary_text(name, args, |s| QueryValue::Text(s.trim().to_string())),
        "ltrim" => unary_text(name, args, |s| QueryValue::Text(s.trim_start().to_string())),
        "rtrim" => unary_text(name, args, |s| QueryValue::Text(s.trim_end().to_string())),
        "reverse" => unary_text(name, args, |s| {
            QueryValue::Text(s.chars().rev().collect())
        }),
        "substring" => {
            check_compiled_args(name, args, 3, 3)?;
            let (value, start, length) = (args[0].clone(), args[1].clone(), args[2].clone());
            Ok(Arc::new(move |row| {
                let (s, start, length) = match (
                    text_arg(value(row)?),
                    int_arg("SUBSTRING", start(row)?)?,
                    int_arg("SUBSTRING", length(row)?)?,
                ) {
                    (Some(s), Some(start), Some(length)) => (s, start, length),
                    _ => return Ok(QueryValue::Null),
                };
                if length < 0 {
                    return Err(Error::execution("SUBSTRING length must not be negative"));
                }
                // 1-based start; a start before 1 consumes length.
                let skip = (start - 1).max(0) as usize;
                let take = (length + (start - 1).min(0)).max(0) as usize;
                Ok(QueryValue::Text(
                    s.chars().skip(skip).take(take).collect(),
                ))
            }))
        }
        "charindex" => {
            check_compiled_args(name, args, 2, 3)?;
            let needle = args[0].clone();
            let haystack = args[1].clone();
            let start = args.get(2).cloned();
            Ok(Arc::new(move |row| {
                let (needle, haystack) =
                    match (text_arg(needle(row)?), text_arg(haystack(row)?)) {
                        (Some(n), Some(h)) => (n, h),
                        _ => return Ok(QueryValue::Null),
                    };
                let from = match &start {
                    Some(s) => match int_arg("CHARINDEX", s(row)?)? {
                        Some(i) => (i - 1).max(0) as usize,
                        None => return Ok(QueryValue::Null),
                    },
                    None => 0,
                };
                let lower_h = haystack.to_lowercase();
                let lower_n = needle.to_lowercase();
                let chars: Vec<char> = lower_h.chars().collect();
                if from > chars.len() {
                    return Ok(QueryValue::Int(0));
                }
                let suffix: String = chars[from..].iter().collect();
                Ok(QueryValue::Int(match suffix.find(&lower_n) {
                    Some(byte_pos) => {
                        let char_pos = suffix[..byte_pos].chars().count();
                        (from + char_pos + 1) as i64
                    }
                    None => 0,
                }))
            }))
        }
        "replace" => {
            check_compiled_args(name, args, 3, 3)?;
            let (value, from, to) = (args[0].clone(), args[1].clone(), args[2].clone());
            Ok(Arc::new(move |row| {
                match (
                    text_arg(value(row)?),
                    text_arg(from(row)?),
                    text_arg(to(row)?),
                ) {
                    (Some(s), Some(from), Some(to)) if !from.is_empty() => {
                        Ok(QueryValue::Text(replace_ci(&s, &from, &to)))
                    }
                    (Some(s), Some(_), Some(_)) => Ok(QueryValue::Text(s)),
                    _ => Ok(QueryValue::Null),
                }
            }))
        }
        "stuff" => {
            check_compiled_args(name, args, 4, 4)?;
            let (value, start, length, insert) = (
                args[0].clone(),
                args[1].clone(),
                args[2].clone(),
                args[3].clone(),
            );
            Ok(Arc::new(move |row| {
                let (s, start, length, insert) = match (
                    text_arg(value(row)?),
                    int_arg("STUFF", start(row)?)?,
                    int_arg("STUFF", length(row)?)?,
                    text_arg(insert(row)?),
                ) {
                    (Some(s), Some(start), Some(length), Some(insert)) => {
                        (s, start, length, insert)
                    }
                    _ => return Ok(QueryValue::Null),
                };
                let chars: Vec<char> = s.chars().collect();
                if start < 1 || length < 0 || start as usize > chars.len() {
                    return Ok(QueryValue::Null);
                }
                let start = (start - 1) as usize;
                let end = (start + length as usize).min(chars.len());
                let mut out: String = chars[..start].iter().collect();
                out.push_str(&insert);
                out.extend(&chars[end..]);
                Ok(QueryValue::Text(out))
            }))
        }
        "replicate" => {
            check_compiled_args(name, args, 2, 2)?;
            let (value, count) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                match (text_arg(value(row)?), int_arg("REPLICATE", count(row)?)?) {
                    (Some(s), Some(n)) if n >= 0 => {
                        Ok(QueryValue::Text(s.repeat(n as usize)))
                    }
                    (Some(_), Some(_)) => Ok(QueryValue::Null),
                    _ => Ok(QueryValue::Null),
                }
            }))
        }
        "patindex" => {
            check_compiled_args(name, args, 2, 2)?;
            let (pattern, value) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                let (pattern, s) = match (text_arg(pattern(row)?), text_arg(value(row)?)) {
                    (Some(p), Some(s)) => (p, s),
                    _ => return Ok(QueryValue::Null),
                };
                let inner = pattern
                    .strip_prefix('%')
                    .unwrap_or(&pattern)
                    .strip_suffix('%')
                    .unwrap_or(pattern.strip_prefix('%').unwrap_or(&pattern));
                let regex = like::translate(inner, None)?;
                // Drop the anchors: PATINDEX searches for the first match.
                let unanchored = regex
                    .as_str()
                    .trim_start_matches("(?is)^")
                    .trim_end_matches('$')
                    .to_string();
                let regex = regex::Regex::new(&format!("(?is){}", unanchored))
                    .map_err(|e| Error::execution(format!("invalid pattern: {}", e)))?;
                Ok(QueryValue::Int(match regex.find(&s) {
                    Some(m) => (s[..m.start()].chars().count() + 1) as i64,
                    None => 0,
                }))
            }))
        }
        "concat" => {
            check_compiled_args(name, args, 2, usize::MAX)?;
            let args = args.to_vec();
            Ok(Arc::new(move |row| {
                let mut out = String::new();
                for arg in &args {
                    if let Some(s) = text_arg(arg(row)?) {
                        out.push_str(&s);
                    }
                }
                Ok(QueryValue::Text(out))
            }))
        }
        "concat_ws" => {
            check_compiled_args(name, args, 2, usize::MAX)?;
            let separator = args[0].clone();
            let rest = args[1..].to_vec();
            Ok(Arc::new(move |row| {
                let separator = match text_arg(separator(row)?) {
                    Some(s) => s,
                    None => return Ok(QueryValue::Null),
                };
                let parts: Vec<String> = rest
                    .iter()
                    .map(|arg| arg(row).map(text_arg))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .flatten()
                    .collect();
                Ok(QueryValue::Text(parts.join(&separator)))
            }))
        }
        "format" => {
            check_compiled_args(name, args, 2, 2)?;
            let (value, fmt) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                let v = value(row)?;
                let fmt = match text_arg(fmt(row)?) {
                    Some(f) => f,
                    None => return Ok(QueryValue::Null),
                };
                match v {
                    QueryValue::Null => Ok(QueryValue::Null),
                    QueryValue::Timestamp(t) => {
                        Ok(QueryValue::Text(t.format(&dotnet_to_chrono(&fmt)).to_string()))
                    }
                    other => Ok(QueryValue::Text(other.display_text())),
                }
            }))
        }
        "space" => {
            check_compiled_args(name, args, 1, 1)?;
            let count = args[0].clone();
            Ok(Arc::new(move |row| {
                match int_arg("SPACE", count(row)?)? {
                    Some(n) if n >= 0 => Ok(QueryValue::Text(" ".repeat(n as usize))),
                    Some(_) => Ok(QueryValue::Null),
                    None => Ok(QueryValue::Null),
                }
            }))
        }
        "left" | "right" => {
            check_compiled_args(name, args, 2, 2)?;
            let from_left = name == "left";
            let (value, count) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                let (s, n) = match (text_arg(value(row)?), int_arg("LEFT", count(row)?)?) {
                    (Some(s), Some(n)) if n >= 0 => (s, n as usize),
                    (Some(_), Some(_)) => {
                        return Err(Error::execution("length must not be negative"))
                    }
                    _ => return Ok(QueryValue::Null),
                };
                let chars: Vec<char> = s.chars().collect();
                let out: String = if from_left {
                    chars.iter().take(n).collect()
                } else {
                    chars[chars.len().saturating_sub(n)..].iter().collect()
                };
                Ok(QueryValue::Text(out))
            }))
        }
        other => Err(Error::not_supported(format!("function {}()", other))),
    }
}

fn unary_text(
    name: &str,
    args: &[CompiledScalar],
    f: impl Fn(&str) -> QueryValue + Send + Sync + 'static,
) -> Result<CompiledScalar> {
    check_compiled_args(name, args, 1, 1)?;
    let value = args[0].clone();
    Ok(Arc::new(move |row| match text_arg(value(row)?) {
        Some(s) => Ok(f(&s)),
        None => Ok(QueryValue::Null),
    }))
}

/// Case-insensitive REPLACE, matching the store's collation.
fn replace_ci(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_h = haystack.to_lowercase();
    let lower_n = needle.to_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut rest = 0usize;
    let mut search = 0usize;
    while let Some(pos) = lower_h[search..].find(&lower_n) {
        let abs = search + pos;
        out.push_str(&haystack[rest..abs]);
        out.push_str(replacement);
        rest = abs + needle.len();
        search = rest;
        if search >= lower_h.len() {
            break;
        }
    }
    out.push_str(&haystack[rest..]);
    out
}

/// Minimal .NET date format translation for FORMAT(): the patterns the
/// original tool's users actually pass.
fn dotnet_to_chrono(fmt: &str) -> String {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        let mut run = 1usize;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        match (c, run) {
            ('y', 4) => out.push_str("%Y"),
            ('y', 2) => out.push_str("%y"),
            ('M', 2) => out.push_str("%m"),
            ('M', 3) => out.push_str("%b"),
            ('d', 2) => out.push_str("%d"),
            ('H', 2) => out.push_str("%H"),
            ('h', 2) => out.push_str("%I"),
            ('m', 2) => out.push_str("%M"),
            ('s', 2) => out.push_str("%S"),
            ('t', 2) => out.push_str("%p"),
            (other, run) => {
                for _ in 0..run {
                    out.push(other);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use marlinsql_common::types::Row;
    use marlinsql_ir::{Expr, Literal};

    use crate::eval::ExprCompiler;
    use crate::session::SessionHandle;

    use super::*;

    fn eval(name: &str, args: Vec<Expr>) -> QueryValue {
        let compiler = ExprCompiler::new(SessionHandle::new());
        let scalar = compiler
            .compile_scalar(&Expr::Function {
                name: name.into(),
                args,
            })
            .unwrap();
        scalar(&Row::new()).unwrap()
    }

    fn text(s: &str) -> Expr {
        Expr::Literal(Literal::Text(s.into()))
    }

    fn int(i: i64) -> Expr {
        Expr::Literal(Literal::Int(i))
    }

    #[test]
    fn test_len_ignores_trailing_spaces() {
        assert_eq!(eval("len", vec![text("abc  ")]), QueryValue::Int(3));
        assert_eq!(eval("datalength", vec![text("abc  ")]), QueryValue::Int(5));
    }

    #[test]
    fn test_substring_one_based() {
        assert_eq!(
            eval("substring", vec![text("abcdef"), int(2), int(3)]),
            QueryValue::Text("bcd".into())
        );
        assert_eq!(
            eval("substring", vec![text("abcdef"), int(0), int(3)]),
            QueryValue::Text("ab".into())
        );
    }

    #[test]
    fn test_charindex() {
        assert_eq!(
            eval("charindex", vec![text("C"), text("abcdef")]),
            QueryValue::Int(3)
        );
        assert_eq!(
            eval("charindex", vec![text("zz"), text("abcdef")]),
            QueryValue::Int(0)
        );
        assert_eq!(
            eval("charindex", vec![text("b"), text("abcabc"), int(3)]),
            QueryValue::Int(5)
        );
    }

    #[test]
    fn test_stuff() {
        assert_eq!(
            eval("stuff", vec![text("abcdef"), int(2), int(3), text("XY")]),
            QueryValue::Text("aXYef".into())
        );
    }

    #[test]
    fn test_patindex() {
        assert_eq!(
            eval("patindex", vec![text("%cd%"), text("abcdef")]),
            QueryValue::Int(3)
        );
        assert_eq!(
            eval("patindex", vec![text("%zz%"), text("abcdef")]),
            QueryValue::Int(0)
        );
    }

    #[test]
    fn test_concat_skips_nulls_concat_ws_joins() {
        assert_eq!(
            eval(
                "concat",
                vec![text("a"), Expr::Literal(Literal::Null), text("b")]
            ),
            QueryValue::Text("ab".into())
        );
        assert_eq!(
            eval(
                "concat_ws",
                vec![text("-"), text("a"), Expr::Literal(Literal::Null), text("b")]
            ),
            QueryValue::Text("a-b".into())
        );
    }

    #[test]
    fn test_left_right_reverse() {
        assert_eq!(
            eval("left", vec![text("hello"), int(2)]),
            QueryValue::Text("he".into())
        );
        assert_eq!(
            eval("right", vec![text("hello"), int(2)]),
            QueryValue::Text("lo".into())
        );
        assert_eq!(
            eval("reverse", vec![text("abc")]),
            QueryValue::Text("cba".into())
        );
    }

    #[test]
    fn test_replace_case_insensitive() {
        assert_eq!(
            eval("replace", vec![text("aXbXc"), text("x"), text("-")]),
            QueryValue::Text("a-b-c".into())
        );
    }

    #[test]
    fn test_null_propagation() {
        assert!(eval("upper", vec![Expr::Literal(Literal::Null)]).is_null());
        assert!(
            eval("substring", vec![text("abc"), Expr::Literal(Literal::Null), int(1)]).is_null()
        );
    }
}
