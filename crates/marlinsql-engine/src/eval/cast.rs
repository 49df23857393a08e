use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;
use marlinsql_ir::CastType;

/// CAST / CONVERT / TRY_CONVERT over the value tag set. Lenient casts yield
/// null where a strict cast would fail.
pub fn cast_value(
    value: QueryValue,
    to: &CastType,
    lenient: bool,
    style: Option<i64>,
) -> Result<QueryValue> {
    if value.is_null() {
        return Ok(QueryValue::Null);
    }
    match try_cast(&value, to, style) {
        Some(out) => Ok(out),
        None if lenient => Ok(QueryValue::Null),
        None => Err(Error::type_mismatch(type_label(to), value.type_name())),
    }
}

fn type_label(to: &CastType) -> &'static str {
    match to {
        CastType::Bool => "bit",
        CastType::Int => "bigint",
        CastType::Decimal { .. } => "decimal",
        CastType::Float => "float",
        CastType::Text { .. } => "nvarchar",
        CastType::Timestamp => "datetime",
        CastType::Uuid => "uniqueidentifier",
        CastType::Binary => "varbinary",
    }
}

fn try_cast(value: &QueryValue, to: &CastType, style: Option<i64>) -> Option<QueryValue> {
    match to {
        CastType::Bool => match value {
            QueryValue::Bool(b) => Some(QueryValue::Bool(*b)),
            QueryValue::Text(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" => Some(QueryValue::Bool(true)),
                "0" | "false" => Some(QueryValue::Bool(false)),
                _ => None,
            },
            other => other.as_int().map(|i| QueryValue::Bool(i != 0)),
        },
        CastType::Int => match value {
            QueryValue::Text(s) => s.trim().parse::<i64>().ok().map(QueryValue::Int),
            QueryValue::Float(f) => Some(QueryValue::Int(f.trunc() as i64)),
            QueryValue::Decimal(d) => d.trunc().to_i64().map(QueryValue::Int),
            other => other.as_int().map(QueryValue::Int),
        },
        CastType::Decimal { scale, .. } => {
            let d = match value {
                QueryValue::Text(s) => s.trim().parse::<Decimal>().ok()?,
                other => other.as_decimal()?,
            };
            let d = match scale {
                Some(s) => d.round_dp(*s),
                None => d,
            };
            Some(QueryValue::Decimal(d))
        }
        CastType::Float => match value {
            QueryValue::Text(s) => s.trim().parse::<f64>().ok().map(QueryValue::Float),
            other => other.as_float().map(QueryValue::Float),
        },
        CastType::Text { length } => {
            let mut text = format_for_text(value, style);
            if let Some(len) = length {
                let len = *len as usize;
                if text.chars().count() > len {
                    text = text.chars().take(len).collect();
                }
            }
            Some(QueryValue::Text(text))
        }
        CastType::Timestamp => match value {
            QueryValue::Timestamp(t) => Some(QueryValue::Timestamp(*t)),
            QueryValue::Text(s) => parse_timestamp(s).map(QueryValue::Timestamp),
            _ => None,
        },
        CastType::Uuid => match value {
            QueryValue::Uuid(u) => Some(QueryValue::Uuid(*u)),
            QueryValue::Lookup { id, .. } => Some(QueryValue::Uuid(*id)),
            QueryValue::Text(s) => Uuid::parse_str(s.trim()).ok().map(QueryValue::Uuid),
            _ => None,
        },
        CastType::Binary => match value {
            QueryValue::Binary(b) => Some(QueryValue::Binary(b.clone())),
            QueryValue::Text(s) => {
                let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
                if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return None;
                }
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex checked"))
                    .collect();
                Some(QueryValue::Binary(bytes))
            }
            _ => None,
        },
    }
}

fn format_for_text(value: &QueryValue, style: Option<i64>) -> String {
    match (value, style) {
        // ISO 8601 with T separator.
        (QueryValue::Timestamp(t), Some(126)) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
        // US mm/dd/yyyy.
        (QueryValue::Timestamp(t), Some(101)) => t.format("%m/%d/%Y").to_string(),
        // ODBC canonical.
        (QueryValue::Timestamp(t), Some(120)) | (QueryValue::Timestamp(t), None) => {
            t.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        (QueryValue::Timestamp(t), Some(_)) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        (other, _) => other.to_string(),
    }
}

/// Accepts the timestamp spellings the remote store and T-SQL literals use.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y%m%d",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}
