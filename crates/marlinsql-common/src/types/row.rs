use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::QueryValue;

/// An ordered mapping from column name to value. Column names are unique per
/// row, compared case-insensitively; order is the order established by the
/// nearest upstream projection or scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: IndexMap<String, QueryValue>,
}

impl Row {
    pub fn new() -> Self {
        Self {
            columns: IndexMap::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            columns: IndexMap::with_capacity(n),
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, QueryValue)>) -> Self {
        let mut row = Row::new();
        for (name, value) in pairs {
            row.set(name, value);
        }
        row
    }

    /// Insert or replace a column. Replacing matches case-insensitively but
    /// keeps the original column's name and position.
    pub fn set(&mut self, name: impl Into<String>, value: QueryValue) {
        let name = name.into();
        if let Some(v) = self.columns.get_mut(&name) {
            *v = value;
            return;
        }
        if let Some(existing) = self.position(&name) {
            let key = self.columns.get_index(existing).expect("index").0.clone();
            self.columns[&key] = value;
            return;
        }
        self.columns.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&QueryValue> {
        if let Some(v) = self.columns.get(name) {
            return Some(v);
        }
        self.position(name)
            .and_then(|i| self.columns.get_index(i).map(|(_, v)| v))
    }

    pub fn get_at(&self, index: usize) -> Option<&QueryValue> {
        self.columns.get_index(index).map(|(_, v)| v)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .keys()
            .position(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name) || self.position(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &QueryValue> {
        self.columns.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Row concatenation for joins. Columns from `other` that collide with an
    /// existing name case-insensitively are skipped; the plan builder
    /// qualifies join inputs (`alias.column`) so collisions only occur for
    /// genuinely duplicate sources.
    pub fn concat(&self, other: &Row) -> Row {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            if !out.contains(name) {
                out.columns.insert(name.to_string(), value.clone());
            }
        }
        out
    }

    /// A row with the same column set as this one, every value null. Used to
    /// pad the unmatched side of outer joins.
    pub fn null_filled(&self) -> Row {
        Row {
            columns: self
                .columns
                .keys()
                .map(|k| (k.clone(), QueryValue::Null))
                .collect(),
        }
    }
}

impl FromIterator<(String, QueryValue)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, QueryValue)>>(iter: T) -> Self {
        Row::from_pairs(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_get() {
        let mut row = Row::new();
        row.set("AccountId", QueryValue::Int(1));
        assert_eq!(row.get("accountid"), Some(&QueryValue::Int(1)));
        assert_eq!(row.get("ACCOUNTID"), Some(&QueryValue::Int(1)));
        assert!(row.get("name").is_none());
    }

    #[test]
    fn test_set_replaces_keeping_name_and_position() {
        let mut row = Row::new();
        row.set("Name", QueryValue::Text("a".into()));
        row.set("Revenue", QueryValue::Int(10));
        row.set("NAME", QueryValue::Text("b".into()));
        assert_eq!(row.len(), 2);
        let names: Vec<_> = row.column_names().collect();
        assert_eq!(names, vec!["Name", "Revenue"]);
        assert_eq!(row.get("name"), Some(&QueryValue::Text("b".into())));
    }

    #[test]
    fn test_column_order_preserved() {
        let row = Row::from_pairs([
            ("b".to_string(), QueryValue::Int(2)),
            ("a".to_string(), QueryValue::Int(1)),
        ]);
        let names: Vec<_> = row.column_names().collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_concat_and_null_filled() {
        let left = Row::from_pairs([("a.id".to_string(), QueryValue::Int(1))]);
        let right = Row::from_pairs([("b.id".to_string(), QueryValue::Int(2))]);
        let joined = left.concat(&right);
        assert_eq!(joined.len(), 2);

        let padded = left.concat(&right.null_filled());
        assert!(padded.get("b.id").unwrap().is_null());
    }
}
