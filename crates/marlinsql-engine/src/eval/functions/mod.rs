mod datetime;
mod json;
mod math;
mod strings;

pub(crate) use json::number_value;

use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;
use marlinsql_ir::Expr;

use super::{truth, CompiledScalar, ExprCompiler};

/// Compile a scalar function call. Dispatch is by lowercase name; arity is
/// checked here so the per-function code can index args freely.
pub fn compile(compiler: &ExprCompiler, name: &str, args: &[Expr]) -> Result<CompiledScalar> {
    match name {
        // Conditional and null handling.
        "iif" => {
            check_args(name, args, 3, 3)?;
            let cond = compiler.compile_scalar(&args[0])?;
            let then = compiler.compile_scalar(&args[1])?;
            let otherwise = compiler.compile_scalar(&args[2])?;
            Ok(Arc::new(move |row| {
                if truth(&cond(row)?).unwrap_or(false) {
                    then(row)
                } else {
                    otherwise(row)
                }
            }))
        }
        "coalesce" => {
            check_args(name, args, 1, usize::MAX)?;
            let compiled = compile_all(compiler, args)?;
            Ok(Arc::new(move |row| {
                for arg in &compiled {
                    let v = arg(row)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(QueryValue::Null)
            }))
        }
        "isnull" => {
            check_args(name, args, 2, 2)?;
            let value = compiler.compile_scalar(&args[0])?;
            let fallback = compiler.compile_scalar(&args[1])?;
            Ok(Arc::new(move |row| {
                let v = value(row)?;
                if v.is_null() {
                    fallback(row)
                } else {
                    Ok(v)
                }
            }))
        }
        "nullif" => {
            check_args(name, args, 2, 2)?;
            let left = compiler.compile_scalar(&args[0])?;
            let right = compiler.compile_scalar(&args[1])?;
            Ok(Arc::new(move |row| {
                let l = left(row)?;
                let r = right(row)?;
                if l.compare(&r) == Some(std::cmp::Ordering::Equal) {
                    Ok(QueryValue::Null)
                } else {
                    Ok(l)
                }
            }))
        }

        // Session error state.
        "error_message" => {
            check_args(name, args, 0, 0)?;
            let session = compiler.session().clone();
            Ok(Arc::new(move |_| {
                let message = session.error_message();
                Ok(if message.is_empty() {
                    QueryValue::Null
                } else {
                    QueryValue::Text(message)
                })
            }))
        }
        "error_number" => {
            check_args(name, args, 0, 0)?;
            let session = compiler.session().clone();
            Ok(Arc::new(move |_| session.variable("@@error")))
        }

        "newid" => {
            check_args(name, args, 0, 0)?;
            Ok(Arc::new(move |_| Ok(QueryValue::Uuid(uuid::Uuid::new_v4()))))
        }

        _ => {
            if strings::handles(name) {
                strings::compile(name, &compile_all(compiler, args)?)
            } else if datetime::handles(name) {
                datetime::compile(compiler, name, args)
            } else if math::handles(name) {
                math::compile(name, &compile_all(compiler, args)?)
            } else if json::handles(name) {
                json::compile(name, &compile_all(compiler, args)?)
            } else {
                Err(Error::not_supported(format!(
                    "function {}()",
                    name.to_uppercase()
                )))
            }
        }
    }
}

pub(crate) fn compile_all(
    compiler: &ExprCompiler,
    args: &[Expr],
) -> Result<Vec<CompiledScalar>> {
    args.iter().map(|a| compiler.compile_scalar(a)).collect()
}

pub(crate) fn check_args(name: &str, args: &[Expr], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::plan(format!(
            "wrong number of arguments to {}(): got {}",
            name.to_uppercase(),
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_compiled_args(name: &str, args: &[CompiledScalar], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::plan(format!(
            "wrong number of arguments to {}(): got {}",
            name.to_uppercase(),
            args.len()
        )));
    }
    Ok(())
}

/// Extract text or propagate null; non-text values render via display text.
pub(crate) fn text_arg(value: QueryValue) -> Option<String> {
    match value {
        QueryValue::Null => None,
        QueryValue::Text(s) => Some(s),
        other => Some(other.display_text()),
    }
}

pub(crate) fn int_arg(name: &str, value: QueryValue) -> Result<Option<i64>> {
    match value {
        QueryValue::Null => Ok(None),
        other => other
            .as_int()
            .map(Some)
            .ok_or_else(|| Error::type_mismatch(format!("integer argument to {}", name), other.type_name())),
    }
}

pub(crate) fn float_arg(name: &str, value: QueryValue) -> Result<Option<f64>> {
    match value {
        QueryValue::Null => Ok(None),
        other => other
            .as_float()
            .map(Some)
            .ok_or_else(|| Error::type_mismatch(format!("numeric argument to {}", name), other.type_name())),
    }
}
