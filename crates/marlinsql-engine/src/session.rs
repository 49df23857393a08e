use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{QueryValue, Row};
use marlinsql_ir::CastType;

/// Loop control raised by BREAK/CONTINUE, observed by the enclosing WHILE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    Break,
    Continue,
}

/// Mutable state bound to one statement batch: variable bindings, temp
/// tables, error state and the impersonation id. Owned by the batch's
/// `Script` plan; never shared across concurrent batches.
#[derive(Default)]
pub struct Session {
    variables: HashMap<String, (CastType, QueryValue)>,
    temp_tables: HashMap<String, TempTable>,
    error_number: i64,
    error_message: String,
    caller_id: Option<Uuid>,
    loop_signal: Option<LoopSignal>,
}

#[derive(Default, Clone)]
pub struct TempTable {
    pub columns: Vec<(String, CastType)>,
    pub rows: Vec<Row>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared handle to a batch session. Internally a mutex, but every access is
/// a short read-or-write of one binding; no lock is held across a row.
#[derive(Clone, Default)]
pub struct SessionHandle(Arc<Mutex<Session>>);

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, name: &str, ty: CastType, value: QueryValue) {
        self.0
            .lock()
            .variables
            .insert(normalize(name), (ty, value));
    }

    pub fn set_variable(&self, name: &str, value: QueryValue) -> Result<()> {
        let mut session = self.0.lock();
        match session.variables.get_mut(&normalize(name)) {
            Some(slot) => {
                slot.1 = value;
                Ok(())
            }
            None => Err(Error::execution(format!(
                "variable {} was not declared",
                name
            ))),
        }
    }

    pub fn variable(&self, name: &str) -> Result<QueryValue> {
        let name = normalize(name);
        let session = self.0.lock();
        match name.as_str() {
            "@@error" => Ok(QueryValue::Int(session.error_number)),
            "@@fetch_status" => Ok(QueryValue::Int(0)),
            "@@rowcount" => Ok(QueryValue::Null),
            _ => session
                .variables
                .get(&name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::execution(format!("variable {} was not declared", name))),
        }
    }

    pub fn variable_type(&self, name: &str) -> Option<CastType> {
        self.0
            .lock()
            .variables
            .get(&normalize(name))
            .map(|(t, _)| t.clone())
    }

    pub fn error_message(&self) -> String {
        self.0.lock().error_message.clone()
    }

    pub fn set_error(&self, number: i64, message: impl Into<String>) {
        let mut session = self.0.lock();
        session.error_number = number;
        session.error_message = message.into();
    }

    pub fn clear_error(&self) {
        self.set_error(0, "");
    }

    pub fn caller_id(&self) -> Option<Uuid> {
        self.0.lock().caller_id
    }

    pub fn set_caller_id(&self, id: Option<Uuid>) {
        self.0.lock().caller_id = id;
    }

    pub fn create_temp_table(&self, name: &str, columns: Vec<(String, CastType)>) -> Result<()> {
        let mut session = self.0.lock();
        let key = normalize(name);
        if session.temp_tables.contains_key(&key) {
            return Err(Error::execution(format!(
                "temp table {} already exists",
                name
            )));
        }
        session.temp_tables.insert(
            key,
            TempTable {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn drop_temp_table(&self, name: &str) -> bool {
        self.0.lock().temp_tables.remove(&normalize(name)).is_some()
    }

    pub fn temp_table(&self, name: &str) -> Option<TempTable> {
        self.0.lock().temp_tables.get(&normalize(name)).cloned()
    }

    pub fn temp_table_exists(&self, name: &str) -> bool {
        self.0.lock().temp_tables.contains_key(&normalize(name))
    }

    pub fn append_temp_rows(&self, name: &str, rows: Vec<Row>) -> Result<usize> {
        let mut session = self.0.lock();
        match session.temp_tables.get_mut(&normalize(name)) {
            Some(table) => {
                let n = rows.len();
                table.rows.extend(rows);
                Ok(n)
            }
            None => Err(Error::execution(format!(
                "temp table {} does not exist",
                name
            ))),
        }
    }

    pub fn replace_temp_rows(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        let mut session = self.0.lock();
        match session.temp_tables.get_mut(&normalize(name)) {
            Some(table) => {
                table.rows = rows;
                Ok(())
            }
            None => Err(Error::execution(format!(
                "temp table {} does not exist",
                name
            ))),
        }
    }

    pub fn raise_loop_signal(&self, signal: LoopSignal) {
        self.0.lock().loop_signal = Some(signal);
    }

    pub fn take_loop_signal(&self) -> Option<LoopSignal> {
        self.0.lock().loop_signal.take()
    }

    pub fn peek_loop_signal(&self) -> Option<LoopSignal> {
        self.0.lock().loop_signal
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_case_insensitive() {
        let session = SessionHandle::new();
        session.declare("@Total", CastType::Int, QueryValue::Int(1));
        session.set_variable("@TOTAL", QueryValue::Int(5)).unwrap();
        assert_eq!(session.variable("@total").unwrap(), QueryValue::Int(5));
    }

    #[test]
    fn test_undeclared_variable_errors() {
        let session = SessionHandle::new();
        let err = session.set_variable("@missing", QueryValue::Int(1)).unwrap_err();
        assert_eq!(err.code(), "Query.ExecutionFailed");
        assert!(session.variable("@missing").is_err());
    }

    #[test]
    fn test_error_state() {
        let session = SessionHandle::new();
        session.set_error(547, "constraint violated");
        assert_eq!(session.variable("@@error").unwrap(), QueryValue::Int(547));
        assert_eq!(session.error_message(), "constraint violated");
        session.clear_error();
        assert_eq!(session.variable("@@ERROR").unwrap(), QueryValue::Int(0));
    }

    #[test]
    fn test_temp_table_lifecycle() {
        let session = SessionHandle::new();
        session
            .create_temp_table("#t", vec![("id".into(), CastType::Int)])
            .unwrap();
        assert!(session.temp_table_exists("#T"));
        session
            .append_temp_rows(
                "#t",
                vec![Row::from_pairs([("id".to_string(), QueryValue::Int(1))])],
            )
            .unwrap();
        assert_eq!(session.temp_table("#t").unwrap().rows.len(), 1);
        assert!(session.drop_temp_table("#t"));
        assert!(!session.temp_table_exists("#t"));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let a = SessionHandle::new();
        let b = SessionHandle::new();
        a.declare("@x", CastType::Int, QueryValue::Int(1));
        a.set_error(1, "boom");
        assert!(b.variable("@x").is_err());
        assert_eq!(b.variable("@@error").unwrap(), QueryValue::Int(0));
    }
}
