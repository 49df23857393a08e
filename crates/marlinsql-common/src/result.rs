use serde::{Deserialize, Serialize};

use crate::types::{QueryValue, Row};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// The collected result of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// True when the remote store reported further pages beyond `rows`.
    pub more: bool,
    pub paging_cookie: Option<String>,
    /// The fetch XML executed for the root scan, when one was pushed down.
    pub executed_xml: Option<String>,
    /// Rendered plan tree for the statement.
    pub plan: Option<String>,
    /// PRINT output and informational messages, in emission order.
    pub messages: Vec<String>,
    pub elapsed_ms: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|r| {
                r.iter()
                    .map(|(name, value)| ColumnInfo::new(name, value.type_name()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn get(&self, row: usize, col_name: &str) -> Option<&QueryValue> {
        self.rows.get(row).and_then(|r| r.get(col_name))
    }

    pub fn first_value(&self) -> Option<&QueryValue> {
        self.rows.first().and_then(|r| r.get_at(0))
    }
}

/// One unit of a streaming result. The first batch of a statement carries the
/// column header; subsequent batches carry rows only.
#[derive(Debug, Clone)]
pub enum RowBatch {
    Columns(Vec<ColumnInfo>),
    Rows(Vec<Row>),
    Message(String),
}
