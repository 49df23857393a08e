use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

mod row;

pub use row::Row;

/// A single value flowing through the engine. Each variant carries the raw
/// value; lookup, optionset and money additionally carry the server-formatted
/// display string when the remote store supplied one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Binary(Vec<u8>),
    Lookup {
        entity: String,
        id: Uuid,
        name: Option<String>,
    },
    OptionSet {
        code: i64,
        label: Option<String>,
    },
    Money {
        amount: Decimal,
        formatted: Option<String>,
    },
}

impl QueryValue {
    pub fn is_null(&self) -> bool {
        matches!(self, QueryValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            QueryValue::Null => "null",
            QueryValue::Bool(_) => "bit",
            QueryValue::Int(_) => "bigint",
            QueryValue::Decimal(_) => "decimal",
            QueryValue::Float(_) => "float",
            QueryValue::Text(_) => "nvarchar",
            QueryValue::Timestamp(_) => "datetime",
            QueryValue::Uuid(_) => "uniqueidentifier",
            QueryValue::Binary(_) => "varbinary",
            QueryValue::Lookup { .. } => "lookup",
            QueryValue::OptionSet { .. } => "optionset",
            QueryValue::Money { .. } => "money",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            QueryValue::Bool(b) => Some(*b),
            QueryValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            QueryValue::Int(i) => Some(*i),
            QueryValue::Bool(b) => Some(*b as i64),
            QueryValue::Decimal(d) => d.to_i64(),
            QueryValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            QueryValue::OptionSet { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            QueryValue::Float(f) => Some(*f),
            QueryValue::Int(i) => Some(*i as f64),
            QueryValue::Decimal(d) => d.to_f64(),
            QueryValue::Money { amount, .. } => amount.to_f64(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            QueryValue::Decimal(d) => Some(*d),
            QueryValue::Int(i) => Some(Decimal::from(*i)),
            QueryValue::Float(f) => Decimal::from_f64_retain(*f),
            QueryValue::Money { amount, .. } => Some(*amount),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            QueryValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            QueryValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            QueryValue::Uuid(u) => Some(*u),
            QueryValue::Lookup { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The display text for a value: the server-formatted string when one was
    /// supplied, otherwise a canonical client rendering.
    pub fn display_text(&self) -> String {
        match self {
            QueryValue::Lookup { name: Some(n), .. } => n.clone(),
            QueryValue::OptionSet { label: Some(l), .. } => l.clone(),
            QueryValue::Money {
                formatted: Some(s), ..
            } => s.clone(),
            other => other.to_string(),
        }
    }

    fn numeric_rank(&self) -> Option<u8> {
        match self {
            QueryValue::Bool(_) | QueryValue::Int(_) | QueryValue::OptionSet { .. } => Some(0),
            QueryValue::Decimal(_) | QueryValue::Money { .. } => Some(1),
            QueryValue::Float(_) => Some(2),
            _ => None,
        }
    }

    /// SQL comparison. `None` when either side is null or the types are not
    /// comparable; comparison predicates then evaluate to false at the client.
    pub fn compare(&self, other: &QueryValue) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        // Numeric values compare across tags at the widest common type.
        if let (Some(lr), Some(rr)) = (self.numeric_rank(), other.numeric_rank()) {
            return if lr.max(rr) >= 2 {
                Some(self.as_float()?.total_cmp(&other.as_float()?))
            } else {
                Some(self.as_decimal()?.cmp(&other.as_decimal()?))
            };
        }
        match (self, other) {
            (QueryValue::Text(a), QueryValue::Text(b)) => {
                // The remote store collates case-insensitively.
                Some(a.to_lowercase().cmp(&b.to_lowercase()))
            }
            (QueryValue::Timestamp(a), QueryValue::Timestamp(b)) => Some(a.cmp(b)),
            (QueryValue::Bool(a), QueryValue::Bool(b)) => Some(a.cmp(b)),
            (QueryValue::Binary(a), QueryValue::Binary(b)) => Some(a.cmp(b)),
            (a, b) => {
                let (ua, ub) = (a.as_uuid(), b.as_uuid());
                match (ua, ub) {
                    (Some(x), Some(y)) => Some(x.cmp(&y)),
                    _ => None,
                }
            }
        }
    }

    /// Total ordering for ORDER BY and merge joins: nulls sort first, values
    /// of incomparable types order by tag so sorts stay deterministic.
    pub fn cmp_for_sort(&self, other: &QueryValue) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        self.compare(other)
            .unwrap_or_else(|| self.tag().cmp(&other.tag()))
    }

    fn tag(&self) -> u8 {
        match self {
            QueryValue::Null => 0,
            QueryValue::Bool(_) => 1,
            QueryValue::Int(_) => 2,
            QueryValue::Decimal(_) => 3,
            QueryValue::Float(_) => 4,
            QueryValue::Text(_) => 5,
            QueryValue::Timestamp(_) => 6,
            QueryValue::Uuid(_) => 7,
            QueryValue::Binary(_) => 8,
            QueryValue::Lookup { .. } => 9,
            QueryValue::OptionSet { .. } => 10,
            QueryValue::Money { .. } => 11,
        }
    }

    /// Grouping equality: nulls compare equal (GROUP BY / DISTINCT place all
    /// nulls in one group), everything else per `compare`.
    pub fn group_eq(&self, other: &QueryValue) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            QueryValue::Null => serde_json::Value::Null,
            QueryValue::Bool(b) => serde_json::json!(b),
            QueryValue::Int(i) => serde_json::json!(i),
            QueryValue::Decimal(d) => serde_json::json!(d.to_string()),
            QueryValue::Float(f) => serde_json::json!(f),
            QueryValue::Text(s) => serde_json::json!(s),
            QueryValue::Timestamp(t) => {
                serde_json::json!(t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            QueryValue::Uuid(u) => serde_json::json!(u.to_string()),
            QueryValue::Binary(b) => serde_json::json!(b),
            QueryValue::Lookup { entity, id, name } => serde_json::json!({
                "entity": entity,
                "id": id.to_string(),
                "name": name,
            }),
            QueryValue::OptionSet { code, label } => serde_json::json!({
                "code": code,
                "label": label,
            }),
            QueryValue::Money { amount, formatted } => serde_json::json!({
                "amount": amount.to_string(),
                "formatted": formatted,
            }),
        }
    }
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Null => write!(f, "NULL"),
            QueryValue::Bool(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            QueryValue::Int(i) => write!(f, "{}", i),
            QueryValue::Decimal(d) => write!(f, "{}", d),
            QueryValue::Float(v) => write!(f, "{}", v),
            QueryValue::Text(s) => write!(f, "{}", s),
            QueryValue::Timestamp(t) => {
                write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            QueryValue::Uuid(u) => write!(f, "{}", u),
            QueryValue::Binary(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
            QueryValue::Lookup { id, name, .. } => match name {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{}", id),
            },
            QueryValue::OptionSet { code, label } => match label {
                Some(l) => write!(f, "{}", l),
                None => write!(f, "{}", code),
            },
            QueryValue::Money { amount, formatted } => match formatted {
                Some(s) => write!(f, "{}", s),
                None => write!(f, "{}", amount),
            },
        }
    }
}

fn numeric_pair(left: &QueryValue, right: &QueryValue, op: &str) -> Result<NumericPair> {
    let (lr, rr) = match (left.numeric_rank(), right.numeric_rank()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(Error::type_mismatch(
                "numeric operands",
                format!("{} {} {}", left.type_name(), op, right.type_name()),
            ))
        }
    };
    Ok(if lr.max(rr) >= 2 {
        NumericPair::Float(
            left.as_float().expect("numeric"),
            right.as_float().expect("numeric"),
        )
    } else if lr.max(rr) == 1 {
        NumericPair::Decimal(
            left.as_decimal().expect("numeric"),
            right.as_decimal().expect("numeric"),
        )
    } else {
        NumericPair::Int(
            left.as_int().expect("numeric"),
            right.as_int().expect("numeric"),
        )
    })
}

enum NumericPair {
    Int(i64, i64),
    Decimal(Decimal, Decimal),
    Float(f64, f64),
}

/// Binary arithmetic with numeric promotion (integer -> decimal -> float).
/// String `+` concatenates. Any null operand yields null.
pub fn arithmetic(left: &QueryValue, op: char, right: &QueryValue) -> Result<QueryValue> {
    if left.is_null() || right.is_null() {
        return Ok(QueryValue::Null);
    }
    if op == '+' {
        if let (QueryValue::Text(a), QueryValue::Text(b)) = (left, right) {
            return Ok(QueryValue::Text(format!("{}{}", a, b)));
        }
    }
    match numeric_pair(left, right, &op.to_string())? {
        NumericPair::Int(a, b) => {
            let out = match op {
                '+' => a.checked_add(b),
                '-' => a.checked_sub(b),
                '*' => a.checked_mul(b),
                '/' => {
                    if b == 0 {
                        return Err(Error::execution("division by zero"));
                    }
                    a.checked_div(b)
                }
                '%' => {
                    if b == 0 {
                        return Err(Error::execution("division by zero"));
                    }
                    a.checked_rem(b)
                }
                _ => None,
            };
            out.map(QueryValue::Int)
                .ok_or_else(|| Error::execution(format!("integer overflow in {}", op)))
        }
        NumericPair::Decimal(a, b) => {
            let out = match op {
                '+' => a.checked_add(b),
                '-' => a.checked_sub(b),
                '*' => a.checked_mul(b),
                '/' => {
                    if b.is_zero() {
                        return Err(Error::execution("division by zero"));
                    }
                    a.checked_div(b)
                }
                '%' => {
                    if b.is_zero() {
                        return Err(Error::execution("division by zero"));
                    }
                    a.checked_rem(b)
                }
                _ => None,
            };
            out.map(QueryValue::Decimal)
                .ok_or_else(|| Error::execution(format!("decimal overflow in {}", op)))
        }
        NumericPair::Float(a, b) => {
            let out = match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => {
                    if b == 0.0 {
                        return Err(Error::execution("division by zero"));
                    }
                    a / b
                }
                '%' => {
                    if b == 0.0 {
                        return Err(Error::execution("division by zero"));
                    }
                    a % b
                }
                _ => return Err(Error::execution(format!("unknown operator {}", op))),
            };
            Ok(QueryValue::Float(out))
        }
    }
}

pub fn negate(value: &QueryValue) -> Result<QueryValue> {
    match value {
        QueryValue::Null => Ok(QueryValue::Null),
        QueryValue::Int(i) => Ok(QueryValue::Int(-i)),
        QueryValue::Decimal(d) => Ok(QueryValue::Decimal(-d)),
        QueryValue::Float(f) => Ok(QueryValue::Float(-f)),
        QueryValue::Money { amount, .. } => Ok(QueryValue::Decimal(-amount)),
        other => Err(Error::type_mismatch("numeric", other.type_name())),
    }
}

/// Hashable grouping key over a row's key values, used by hash joins, hash
/// aggregation and DISTINCT. Nulls hash and compare equal to each other.
#[derive(Debug, Clone)]
pub struct GroupKey(pub Vec<QueryValue>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.group_eq(b))
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for val in &self.0 {
            match val {
                QueryValue::Null => 0u8.hash(state),
                QueryValue::Bool(b) => {
                    1u8.hash(state);
                    b.hash(state);
                }
                // Numerics hash through the decimal/float view so that
                // cross-tag equal values land in one bucket.
                QueryValue::Int(_)
                | QueryValue::Decimal(_)
                | QueryValue::Money { .. }
                | QueryValue::OptionSet { .. } => {
                    2u8.hash(state);
                    let d = val.as_decimal().unwrap_or_default().normalize();
                    d.mantissa().hash(state);
                    d.scale().hash(state);
                }
                QueryValue::Float(f) => {
                    if f.fract() == 0.0 {
                        2u8.hash(state);
                        let d = Decimal::from_f64_retain(*f).unwrap_or_default().normalize();
                        d.mantissa().hash(state);
                        d.scale().hash(state);
                    } else {
                        3u8.hash(state);
                        f.to_bits().hash(state);
                    }
                }
                QueryValue::Text(s) => {
                    4u8.hash(state);
                    s.to_lowercase().hash(state);
                }
                QueryValue::Timestamp(t) => {
                    5u8.hash(state);
                    t.timestamp_micros().hash(state);
                }
                QueryValue::Uuid(u) => {
                    6u8.hash(state);
                    u.hash(state);
                }
                QueryValue::Binary(b) => {
                    7u8.hash(state);
                    b.hash(state);
                }
                QueryValue::Lookup { id, .. } => {
                    6u8.hash(state);
                    id.hash(state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_arithmetic_promotion() {
        let out = arithmetic(&QueryValue::Int(3), '+', &QueryValue::Int(4)).unwrap();
        assert_eq!(out, QueryValue::Int(7));

        let out = arithmetic(
            &QueryValue::Int(3),
            '*',
            &QueryValue::Decimal(Decimal::new(25, 1)),
        )
        .unwrap();
        assert_eq!(out, QueryValue::Decimal(Decimal::new(75, 1)));

        let out = arithmetic(&QueryValue::Decimal(Decimal::ONE), '+', &QueryValue::Float(0.5))
            .unwrap();
        assert_eq!(out, QueryValue::Float(1.5));
    }

    #[test]
    fn test_string_concat() {
        let out = arithmetic(
            &QueryValue::Text("foo".into()),
            '+',
            &QueryValue::Text("bar".into()),
        )
        .unwrap();
        assert_eq!(out, QueryValue::Text("foobar".into()));
    }

    #[test]
    fn test_null_propagation() {
        let out = arithmetic(&QueryValue::Null, '+', &QueryValue::Int(1)).unwrap();
        assert!(out.is_null());
        assert!(QueryValue::Null.compare(&QueryValue::Int(1)).is_none());
    }

    #[test]
    fn test_division_by_zero() {
        let err = arithmetic(&QueryValue::Int(1), '/', &QueryValue::Int(0)).unwrap_err();
        assert_eq!(err.code(), "Query.ExecutionFailed");
    }

    #[test]
    fn test_cross_type_numeric_compare() {
        assert_eq!(
            QueryValue::Int(2).compare(&QueryValue::Float(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            QueryValue::Decimal(Decimal::new(15, 1)).compare(&QueryValue::Int(2)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_text_compare_case_insensitive() {
        assert_eq!(
            QueryValue::Text("Contoso".into()).compare(&QueryValue::Text("contoso".into())),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_sort_order_nulls_first() {
        let mut vals = vec![
            QueryValue::Int(2),
            QueryValue::Null,
            QueryValue::Int(1),
        ];
        vals.sort_by(|a, b| a.cmp_for_sort(b));
        assert!(vals[0].is_null());
        assert_eq!(vals[1], QueryValue::Int(1));
    }

    #[test]
    fn test_group_key_nulls_group_together() {
        let mut groups: HashMap<GroupKey, usize> = HashMap::new();
        *groups.entry(GroupKey(vec![QueryValue::Null])).or_default() += 1;
        *groups.entry(GroupKey(vec![QueryValue::Null])).or_default() += 1;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&GroupKey(vec![QueryValue::Null])], 2);
    }

    #[test]
    fn test_group_key_cross_type_numeric() {
        let mut groups: HashMap<GroupKey, usize> = HashMap::new();
        groups.insert(GroupKey(vec![QueryValue::Int(2)]), 1);
        assert!(groups.contains_key(&GroupKey(vec![QueryValue::Float(2.0)])));
        assert!(groups.contains_key(&GroupKey(vec![QueryValue::Decimal(Decimal::from(2))])));
    }

    #[test]
    fn test_display_prefers_formatted() {
        let v = QueryValue::Money {
            amount: Decimal::new(12345, 2),
            formatted: Some("$123.45".into()),
        };
        assert_eq!(v.display_text(), "$123.45");

        let t = QueryValue::Timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(t.to_string(), "2024-03-01T12:00:00.000Z");
    }
}
