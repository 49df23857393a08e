use std::sync::Arc;

use rand::Rng;
use rust_decimal::prelude::*;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;

use super::{check_compiled_args, float_arg, int_arg};
use crate::eval::CompiledScalar;

pub(crate) fn handles(name: &str) -> bool {
    matches!(
        name,
        "abs"
            | "ceiling"
            | "floor"
            | "round"
            | "power"
            | "log"
            | "log10"
            | "sqrt"
            | "exp"
            | "sin"
            | "cos"
            | "tan"
            | "asin"
            | "acos"
            | "atan"
            | "atn2"
            | "degrees"
            | "radians"
            | "rand"
            | "pi"
            | "square"
            | "sign"
    )
}

pub(crate) fn compile(name: &str, args: &[CompiledScalar]) -> Result<CompiledScalar> {
    match name {
        "abs" => {
            check_compiled_args(name, args, 1, 1)?;
            let value = args[0].clone();
            Ok(Arc::new(move |row| {
                Ok(match value(row)? {
                    QueryValue::Null => QueryValue::Null,
                    QueryValue::Int(i) => QueryValue::Int(i.abs()),
                    QueryValue::Decimal(d) => QueryValue::Decimal(d.abs()),
                    QueryValue::Float(f) => QueryValue::Float(f.abs()),
                    other => return Err(Error::type_mismatch("numeric", other.type_name())),
                })
            }))
        }
        "ceiling" | "floor" => {
            check_compiled_args(name, args, 1, 1)?;
            let up = name == "ceiling";
            let value = args[0].clone();
            Ok(Arc::new(move |row| {
                Ok(match value(row)? {
                    QueryValue::Null => QueryValue::Null,
                    QueryValue::Int(i) => QueryValue::Int(i),
                    QueryValue::Decimal(d) => {
                        QueryValue::Decimal(if up { d.ceil() } else { d.floor() })
                    }
                    QueryValue::Float(f) => {
                        QueryValue::Float(if up { f.ceil() } else { f.floor() })
                    }
                    other => return Err(Error::type_mismatch("numeric", other.type_name())),
                })
            }))
        }
        "round" => {
            check_compiled_args(name, args, 2, 2)?;
            let (value, places) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                let places = match int_arg("ROUND", places(row)?)? {
                    Some(p) => p,
                    None => return Ok(QueryValue::Null),
                };
                Ok(match value(row)? {
                    QueryValue::Null => QueryValue::Null,
                    QueryValue::Decimal(d) if places >= 0 => {
                        QueryValue::Decimal(d.round_dp(places as u32))
                    }
                    QueryValue::Decimal(d) => {
                        let factor = Decimal::from(10i64.pow((-places) as u32));
                        QueryValue::Decimal((d / factor).round() * factor)
                    }
                    QueryValue::Int(i) if places >= 0 => QueryValue::Int(i),
                    QueryValue::Int(i) => {
                        let factor = 10i64.pow((-places) as u32);
                        QueryValue::Int((i as f64 / factor as f64).round() as i64 * factor)
                    }
                    QueryValue::Float(f) => {
                        let factor = 10f64.powi(places as i32);
                        QueryValue::Float((f * factor).round() / factor)
                    }
                    other => return Err(Error::type_mismatch("numeric", other.type_name())),
                })
            }))
        }
        "sign" => {
            check_compiled_args(name, args, 1, 1)?;
            let value = args[0].clone();
            Ok(Arc::new(move |row| {
                Ok(match float_arg("SIGN", value(row)?)? {
                    Some(f) => QueryValue::Int(if f > 0.0 {
                        1
                    } else if f < 0.0 {
                        -1
                    } else {
                        0
                    }),
                    None => QueryValue::Null,
                })
            }))
        }
        "power" | "atn2" => {
            check_compiled_args(name, args, 2, 2)?;
            let is_power = name == "power";
            let label = name.to_uppercase();
            let (a, b) = (args[0].clone(), args[1].clone());
            Ok(Arc::new(move |row| {
                match (float_arg(&label, a(row)?)?, float_arg(&label, b(row)?)?) {
                    (Some(x), Some(y)) => Ok(QueryValue::Float(if is_power {
                        x.powf(y)
                    } else {
                        x.atan2(y)
                    })),
                    _ => Ok(QueryValue::Null),
                }
            }))
        }
        "rand" => {
            check_compiled_args(name, args, 0, 1)?;
            // The optional seed is accepted and ignored; evaluation happens
            // once per invocation.
            Ok(Arc::new(move |_| {
                Ok(QueryValue::Float(rand::thread_rng().gen::<f64>()))
            }))
        }
        "pi" => {
            check_compiled_args(name, args, 0, 0)?;
            Ok(Arc::new(move |_| Ok(QueryValue::Float(std::f64::consts::PI))))
        }
        _ => {
            check_compiled_args(name, args, 1, 1)?;
            let label = name.to_uppercase();
            let f: fn(f64) -> f64 = match name {
                "log" => f64::ln,
                "log10" => f64::log10,
                "sqrt" => f64::sqrt,
                "exp" => f64::exp,
                "sin" => f64::sin,
                "cos" => f64::cos,
                "tan" => f64::tan,
                "asin" => f64::asin,
                "acos" => f64::acos,
                "atan" => f64::atan,
                "degrees" => f64::to_degrees,
                "radians" => f64::to_radians,
                "square" => |x| x * x,
                other => return Err(Error::not_supported(format!("function {}()", other))),
            };
            let value = args[0].clone();
            Ok(Arc::new(move |row| {
                Ok(match float_arg(&label, value(row)?)? {
                    Some(x) => QueryValue::Float(f(x)),
                    None => QueryValue::Null,
                })
            }))
        }
    }
}
