use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;
use marlinsql_ir::{ColumnRef, Expr, Literal};

use super::{check_args, int_arg};
use crate::eval::{cast, CompiledScalar, ExprCompiler};

pub(crate) fn handles(name: &str) -> bool {
    matches!(
        name,
        "getdate"
            | "getutcdate"
            | "sysutcdatetime"
            | "sysdatetime"
            | "dateadd"
            | "datediff"
            | "datepart"
            | "datename"
            | "day"
            | "month"
            | "year"
            | "eomonth"
            | "datefromparts"
            | "datetimefromparts"
            | "timefromparts"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatePart {
    Year,
    Quarter,
    Month,
    DayOfYear,
    Day,
    Week,
    Weekday,
    Hour,
    Minute,
    Second,
    Millisecond,
}

fn parse_date_part(expr: &Expr) -> Result<DatePart> {
    let name = match expr {
        Expr::Column(ColumnRef { table: None, name }) => name.to_lowercase(),
        Expr::Literal(Literal::Text(s)) => s.to_lowercase(),
        other => {
            return Err(Error::plan(format!(
                "expected a datepart keyword, got {:?}",
                other
            )))
        }
    };
    Ok(match name.as_str() {
        "year" | "yy" | "yyyy" => DatePart::Year,
        "quarter" | "qq" | "q" => DatePart::Quarter,
        "month" | "mm" | "m" => DatePart::Month,
        "dayofyear" | "dy" => DatePart::DayOfYear,
        "day" | "dd" | "d" => DatePart::Day,
        "week" | "wk" | "ww" => DatePart::Week,
        "weekday" | "dw" => DatePart::Weekday,
        "hour" | "hh" => DatePart::Hour,
        "minute" | "mi" | "n" => DatePart::Minute,
        "second" | "ss" | "s" => DatePart::Second,
        "millisecond" | "ms" => DatePart::Millisecond,
        other => return Err(Error::plan(format!("unknown datepart {}", other))),
    })
}

pub(crate) fn compile(
    compiler: &ExprCompiler,
    name: &str,
    args: &[Expr],
) -> Result<CompiledScalar> {
    match name {
        // Non-deterministic: evaluated at every invocation, never folded.
        "getdate" | "getutcdate" | "sysutcdatetime" | "sysdatetime" => {
            check_args(name, args, 0, 0)?;
            Ok(Arc::new(move |_| Ok(QueryValue::Timestamp(Utc::now()))))
        }
        "dateadd" => {
            check_args(name, args, 3, 3)?;
            let part = parse_date_part(&args[0])?;
            let amount = compiler.compile_scalar(&args[1])?;
            let value = compiler.compile_scalar(&args[2])?;
            Ok(Arc::new(move |row| {
                let amount = match int_arg("DATEADD", amount(row)?)? {
                    Some(n) => n,
                    None => return Ok(QueryValue::Null),
                };
                let ts = match timestamp_arg(value(row)?)? {
                    Some(ts) => ts,
                    None => return Ok(QueryValue::Null),
                };
                date_add(part, amount, ts).map(QueryValue::Timestamp)
            }))
        }
        "datediff" => {
            check_args(name, args, 3, 3)?;
            let part = parse_date_part(&args[0])?;
            let start = compiler.compile_scalar(&args[1])?;
            let end = compiler.compile_scalar(&args[2])?;
            Ok(Arc::new(move |row| {
                let (a, b) = match (timestamp_arg(start(row)?)?, timestamp_arg(end(row)?)?) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Ok(QueryValue::Null),
                };
                Ok(QueryValue::Int(date_diff(part, a, b)))
            }))
        }
        "datepart" | "datename" => {
            check_args(name, args, 2, 2)?;
            let as_name = name == "datename";
            let part = parse_date_part(&args[0])?;
            let value = compiler.compile_scalar(&args[1])?;
            Ok(Arc::new(move |row| {
                let ts = match timestamp_arg(value(row)?)? {
                    Some(ts) => ts,
                    None => return Ok(QueryValue::Null),
                };
                if as_name {
                    Ok(QueryValue::Text(date_name(part, ts)))
                } else {
                    Ok(QueryValue::Int(date_part(part, ts)))
                }
            }))
        }
        "day" | "month" | "year" => {
            check_args(name, args, 1, 1)?;
            let part = match name {
                "day" => DatePart::Day,
                "month" => DatePart::Month,
                _ => DatePart::Year,
            };
            let value = compiler.compile_scalar(&args[0])?;
            Ok(Arc::new(move |row| {
                Ok(match timestamp_arg(value(row)?)? {
                    Some(ts) => QueryValue::Int(date_part(part, ts)),
                    None => QueryValue::Null,
                })
            }))
        }
        "eomonth" => {
            check_args(name, args, 1, 2)?;
            let value = compiler.compile_scalar(&args[0])?;
            let offset = args.get(1).map(|a| compiler.compile_scalar(a)).transpose()?;
            Ok(Arc::new(move |row| {
                let ts = match timestamp_arg(value(row)?)? {
                    Some(ts) => ts,
                    None => return Ok(QueryValue::Null),
                };
                let months = match &offset {
                    Some(o) => match int_arg("EOMONTH", o(row)?)? {
                        Some(n) => n,
                        None => return Ok(QueryValue::Null),
                    },
                    None => 0,
                };
                let shifted = date_add(DatePart::Month, months, ts)?;
                let (y, m) = (shifted.year(), shifted.month());
                let first_next = if m == 12 {
                    NaiveDate::from_ymd_opt(y + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(y, m + 1, 1)
                }
                .ok_or_else(|| Error::execution("EOMONTH out of range"))?;
                let last = first_next.pred_opt().expect("not the minimum date");
                Ok(QueryValue::Timestamp(Utc.from_utc_datetime(
                    &last.and_hms_opt(0, 0, 0).expect("valid time"),
                )))
            }))
        }
        "datefromparts" | "datetimefromparts" => {
            let arity = if name == "datefromparts" { 3 } else { 7 };
            check_args(name, args, arity, arity)?;
            let parts = super::compile_all(compiler, args)?;
            let label = name.to_uppercase();
            Ok(Arc::new(move |row| {
                let mut nums = Vec::with_capacity(parts.len());
                for part in &parts {
                    match int_arg(&label, part(row)?)? {
                        Some(n) => nums.push(n),
                        None => return Ok(QueryValue::Null),
                    }
                }
                let date = NaiveDate::from_ymd_opt(nums[0] as i32, nums[1] as u32, nums[2] as u32)
                    .ok_or_else(|| Error::execution(format!("{} out of range", label)))?;
                let time = if nums.len() > 3 {
                    date.and_hms_milli_opt(
                        nums[3] as u32,
                        nums[4] as u32,
                        nums[5] as u32,
                        nums[6] as u32,
                    )
                } else {
                    date.and_hms_opt(0, 0, 0)
                }
                .ok_or_else(|| Error::execution(format!("{} out of range", label)))?;
                Ok(QueryValue::Timestamp(Utc.from_utc_datetime(&time)))
            }))
        }
        "timefromparts" => {
            check_args(name, args, 5, 5)?;
            let parts = super::compile_all(compiler, args)?;
            Ok(Arc::new(move |row| {
                let mut nums = Vec::with_capacity(parts.len());
                for part in &parts {
                    match int_arg("TIMEFROMPARTS", part(row)?)? {
                        Some(n) => nums.push(n),
                        None => return Ok(QueryValue::Null),
                    }
                }
                let (h, mi, s, fraction, scale) = (nums[0], nums[1], nums[2], nums[3], nums[4]);
                if !(0..24).contains(&h) || !(0..60).contains(&mi) || !(0..60).contains(&s) {
                    return Err(Error::execution("TIMEFROMPARTS out of range"));
                }
                let text = if scale > 0 {
                    format!(
                        "{:02}:{:02}:{:02}.{:0width$}",
                        h,
                        mi,
                        s,
                        fraction,
                        width = scale as usize
                    )
                } else {
                    format!("{:02}:{:02}:{:02}", h, mi, s)
                };
                Ok(QueryValue::Text(text))
            }))
        }
        other => Err(Error::not_supported(format!("function {}()", other))),
    }
}

fn timestamp_arg(value: QueryValue) -> Result<Option<DateTime<Utc>>> {
    match value {
        QueryValue::Null => Ok(None),
        QueryValue::Timestamp(ts) => Ok(Some(ts)),
        QueryValue::Text(s) => cast::parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| Error::type_mismatch("datetime", format!("'{}'", s))),
        other => Err(Error::type_mismatch("datetime", other.type_name())),
    }
}

fn date_add(part: DatePart, amount: i64, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let out = match part {
        DatePart::Year => add_months(ts, amount * 12),
        DatePart::Quarter => add_months(ts, amount * 3),
        DatePart::Month => add_months(ts, amount),
        DatePart::Day | DatePart::DayOfYear | DatePart::Weekday => {
            ts.checked_add_signed(Duration::days(amount))
        }
        DatePart::Week => ts.checked_add_signed(Duration::weeks(amount)),
        DatePart::Hour => ts.checked_add_signed(Duration::hours(amount)),
        DatePart::Minute => ts.checked_add_signed(Duration::minutes(amount)),
        DatePart::Second => ts.checked_add_signed(Duration::seconds(amount)),
        DatePart::Millisecond => ts.checked_add_signed(Duration::milliseconds(amount)),
    };
    out.ok_or_else(|| Error::execution("DATEADD result out of range"))
}

fn add_months(ts: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    if months >= 0 {
        ts.checked_add_months(Months::new(months as u32))
    } else {
        ts.checked_sub_months(Months::new((-months) as u32))
    }
}

/// T-SQL DATEDIFF counts boundary crossings, not elapsed units.
fn date_diff(part: DatePart, a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    match part {
        DatePart::Year => (b.year() - a.year()) as i64,
        DatePart::Quarter => {
            (b.year() as i64 * 4 + quarter(b) as i64) - (a.year() as i64 * 4 + quarter(a) as i64)
        }
        DatePart::Month => {
            (b.year() as i64 * 12 + b.month() as i64) - (a.year() as i64 * 12 + a.month() as i64)
        }
        DatePart::Day | DatePart::DayOfYear | DatePart::Weekday => {
            days_from_ce(b) - days_from_ce(a)
        }
        // Weeks begin on Sunday.
        DatePart::Week => days_from_ce(b).div_euclid(7) - days_from_ce(a).div_euclid(7),
        DatePart::Hour => floored(b, a, 3600),
        DatePart::Minute => floored(b, a, 60),
        DatePart::Second => b.timestamp() - a.timestamp(),
        DatePart::Millisecond => b.timestamp_millis() - a.timestamp_millis(),
    }
}

fn floored(b: DateTime<Utc>, a: DateTime<Utc>, unit: i64) -> i64 {
    b.timestamp().div_euclid(unit) - a.timestamp().div_euclid(unit)
}

fn days_from_ce(ts: DateTime<Utc>) -> i64 {
    ts.date_naive().num_days_from_ce() as i64
}

fn quarter(ts: DateTime<Utc>) -> u32 {
    (ts.month() - 1) / 3 + 1
}

fn date_part(part: DatePart, ts: DateTime<Utc>) -> i64 {
    match part {
        DatePart::Year => ts.year() as i64,
        DatePart::Quarter => quarter(ts) as i64,
        DatePart::Month => ts.month() as i64,
        DatePart::DayOfYear => ts.ordinal() as i64,
        DatePart::Day => ts.day() as i64,
        DatePart::Week => (ts.ordinal() as i64 + 6) / 7,
        // 1 = Sunday, matching the default DATEFIRST.
        DatePart::Weekday => (ts.weekday().num_days_from_sunday() + 1) as i64,
        DatePart::Hour => ts.hour() as i64,
        DatePart::Minute => ts.minute() as i64,
        DatePart::Second => ts.second() as i64,
        DatePart::Millisecond => ts.timestamp_subsec_millis() as i64,
    }
}

fn date_name(part: DatePart, ts: DateTime<Utc>) -> String {
    match part {
        DatePart::Month => ts.format("%B").to_string(),
        DatePart::Weekday => ts.format("%A").to_string(),
        other => date_part(other, ts).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use marlinsql_common::types::Row;

    use crate::session::SessionHandle;

    use super::*;

    fn eval(sql_name: &str, args: Vec<Expr>) -> QueryValue {
        let compiler = ExprCompiler::new(SessionHandle::new());
        let scalar = compiler
            .compile_scalar(&Expr::Function {
                name: sql_name.into(),
                args,
            })
            .unwrap();
        scalar(&Row::new()).unwrap()
    }

    fn part(name: &str) -> Expr {
        Expr::Column(ColumnRef::bare(name))
    }

    fn ts(text: &str) -> Expr {
        Expr::Literal(Literal::Text(text.into()))
    }

    fn int(i: i64) -> Expr {
        Expr::Literal(Literal::Int(i))
    }

    #[test]
    fn test_dateadd_month_clamps() {
        let out = eval("dateadd", vec![part("month"), int(1), ts("2024-01-31")]);
        assert_eq!(
            out,
            QueryValue::Timestamp(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_datediff_counts_boundaries() {
        let out = eval(
            "datediff",
            vec![part("year"), ts("2023-12-31"), ts("2024-01-01")],
        );
        assert_eq!(out, QueryValue::Int(1));

        let out = eval(
            "datediff",
            vec![part("day"), ts("2024-01-01 23:59:00"), ts("2024-01-02 00:01:00")],
        );
        assert_eq!(out, QueryValue::Int(1));

        let out = eval(
            "datediff",
            vec![part("month"), ts("2024-03-15"), ts("2024-03-20")],
        );
        assert_eq!(out, QueryValue::Int(0));
    }

    #[test]
    fn test_datepart_and_names() {
        // 2024-03-01 is a Friday.
        assert_eq!(
            eval("datepart", vec![part("weekday"), ts("2024-03-01")]),
            QueryValue::Int(6)
        );
        assert_eq!(
            eval("datename", vec![part("month"), ts("2024-03-01")]),
            QueryValue::Text("March".into())
        );
        assert_eq!(eval("year", vec![ts("2024-03-01")]), QueryValue::Int(2024));
    }

    #[test]
    fn test_eomonth() {
        assert_eq!(
            eval("eomonth", vec![ts("2024-02-10")]),
            QueryValue::Timestamp(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap())
        );
        assert_eq!(
            eval("eomonth", vec![ts("2024-01-10"), int(1)]),
            QueryValue::Timestamp(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_fromparts() {
        assert_eq!(
            eval("datefromparts", vec![int(2024), int(3), int(1)]),
            QueryValue::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            eval(
                "timefromparts",
                vec![int(13), int(30), int(5), int(0), int(0)]
            ),
            QueryValue::Text("13:30:05".into())
        );
    }

    #[test]
    fn test_null_propagation() {
        assert!(eval(
            "dateadd",
            vec![part("day"), int(1), Expr::Literal(Literal::Null)]
        )
        .is_null());
    }
}
