use async_trait::async_trait;
use chrono::{DateTime, Utc};

use marlinsql_common::error::Result;
use marlinsql_common::types::Row;

/// One page of a fetch-query result.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub more: bool,
    pub paging_cookie: Option<String>,
    /// Present when the request asked for the total record count.
    pub total_count: Option<u64>,
}

/// Per-request knobs passed alongside the XML document. Paging inputs also
/// appear inside the document; they are duplicated here so implementations
/// that drive paging at the transport level need not re-parse the XML.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub max_rows: Option<u64>,
    pub paging_cookie: Option<String>,
    pub include_count: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlOperation {
    Insert,
    Update,
    Delete,
}

/// A batch of rows to write. Update and delete rows carry the primary key
/// column; update rows additionally carry every changed attribute.
#[derive(Debug, Clone)]
pub struct DmlRequest {
    pub operation: DmlOperation,
    pub entity: String,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct DmlOutcome {
    pub index: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// The pooled remote access capability the engine consumes. Implementations
/// own authentication, transport, throttle retries and timeouts; the engine
/// sees their failures as the error kinds in `marlinsql_common::Error`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Execute a fetch-query XML document, returning one page.
    async fn execute_fetch(&self, xml: &str, request: &FetchRequest) -> Result<FetchPage>;

    /// Pass a SQL statement through to the tabular endpoint verbatim.
    async fn execute_tabular(&self, sql: &str) -> Result<Vec<Row>>;

    /// Stale-by-design row count used only as a planning estimate.
    async fn total_record_count(&self, entity: &str) -> Result<i64>;

    /// Min/max of a timestamp column, served from an index; never hits the
    /// aggregate cap.
    async fn min_max_timestamp(
        &self,
        entity: &str,
        column: &str,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>;

    /// Submit one batch of writes; one outcome per input row.
    async fn execute_dml(&self, request: DmlRequest) -> Result<Vec<DmlOutcome>>;

    /// Maximum concurrent in-flight requests the engine may issue.
    fn pool_capacity(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod tests_support {
    use marlinsql_common::error::Error;

    use super::*;

    /// A remote store that rejects every request; unit tests for client-side
    /// operators use it to prove they never touch the wire.
    pub struct NullRemote;

    #[async_trait]
    impl RemoteStore for NullRemote {
        async fn execute_fetch(&self, _xml: &str, _request: &FetchRequest) -> Result<FetchPage> {
            Err(Error::execution("unexpected remote fetch in test"))
        }

        async fn execute_tabular(&self, _sql: &str) -> Result<Vec<Row>> {
            Err(Error::execution("unexpected tabular request in test"))
        }

        async fn total_record_count(&self, _entity: &str) -> Result<i64> {
            Ok(0)
        }

        async fn min_max_timestamp(
            &self,
            _entity: &str,
            _column: &str,
        ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
            Ok((None, None))
        }

        async fn execute_dml(&self, _request: DmlRequest) -> Result<Vec<DmlOutcome>> {
            Err(Error::execution("unexpected DML in test"))
        }

        fn pool_capacity(&self) -> usize {
            1
        }
    }
}
