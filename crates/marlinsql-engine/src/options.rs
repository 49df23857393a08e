use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Caller-supplied configuration for one statement batch.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Cap on rows returned to the caller; also forwarded to scans.
    pub max_rows: Option<u64>,
    /// Remote page size for fetch scans.
    pub page_size: Option<u32>,
    /// Resume a prior scan; injected verbatim into the generated XML.
    pub paging_cookie: Option<String>,
    pub include_count: bool,
    /// Route eligible SELECTs through the tabular SQL endpoint.
    pub use_tabular_endpoint: bool,
    /// Planning estimate override; when absent the builder asks the remote
    /// store for `total_record_count`.
    pub estimated_record_count: Option<i64>,
    /// Timestamp range override for the adaptive aggregate partitioner.
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
    /// Concurrency bound; 0 means "ask the remote store".
    pub pool_capacity: usize,
    /// Hard cap on rows a single DML statement may write.
    pub dml_row_cap: Option<usize>,
    /// Rows per DML submission batch.
    pub dml_batch_size: usize,
    pub block_unrestricted_delete: bool,
    pub block_unrestricted_update: bool,
    /// Explicit caller confirmation for UPDATE/DELETE without WHERE when not
    /// blocked outright.
    pub confirm_unrestricted_dml: bool,
    /// Pre-resolved impersonation id for EXECUTE AS.
    pub caller_id: Option<Uuid>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            max_rows: None,
            page_size: None,
            paging_cookie: None,
            include_count: false,
            use_tabular_endpoint: false,
            estimated_record_count: None,
            min_timestamp: None,
            max_timestamp: None,
            pool_capacity: 0,
            dml_row_cap: None,
            dml_batch_size: 100,
            block_unrestricted_delete: true,
            block_unrestricted_update: true,
            confirm_unrestricted_dml: false,
            caller_id: None,
        }
    }
}

/// Remote store limits that shape planning.
pub mod limits {
    /// Hard cap on rows an aggregate fetch may touch.
    pub const AGGREGATE_RECORD_CAP: i64 = 50_000;
    /// Target rows per adaptive partition; leaves headroom under the cap.
    pub const AGGREGATE_PARTITION_TARGET: i64 = 40_000;
    /// Recursion bound for adaptive bisection.
    pub const MAX_PARTITION_DEPTH: u32 = 15;
    /// Default remote page size when the caller does not choose one.
    pub const DEFAULT_PAGE_SIZE: u32 = 5_000;
    /// Hash join build-side memory budget in bytes.
    pub const HASH_BUILD_BUDGET: usize = 256 * 1024 * 1024;
}
