//! Plan nodes and the streaming pull runtime. Every operator implements
//! [`QueryPlanNode`]: `describe` for EXPLAIN, `estimated_rows` for the
//! planner, and `execute` returning a lazy row stream driven by the consumer.
//! Operators check the cancellation token between rows and yield at most one
//! further row after it fires.

pub mod aggregate;
pub mod distinct;
pub mod dml;
pub mod filter;
pub mod join;
pub mod metadata_scan;
pub mod partition;
pub mod scan;
pub mod script;
pub mod sort;
pub mod tabular;
pub mod tvf;
pub mod window;

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::TryStreamExt;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::Row;

use crate::context::ExecutionContext;

pub type RowStream = BoxStream<'static, Result<Row>>;

pub trait QueryPlanNode: Send + Sync {
    /// Short human-readable node label used by EXPLAIN.
    fn describe(&self) -> String;

    /// `-1` when unknown.
    fn estimated_rows(&self) -> i64 {
        -1
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        Vec::new()
    }

    /// The fetch XML this node would execute, when it is a pushed-down scan.
    /// `transpile` and `QueryResult::executed_xml` read it off the plan.
    fn fetch_xml(&self) -> Option<String> {
        None
    }

    /// Streaming, restartable only through re-entry, driven by the consumer.
    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream;
}

pub type PlanNodeRef = Arc<dyn QueryPlanNode>;

/// Drain a child plan into memory, checking cancellation between rows. Used
/// by the blocking operators (sort, hash build, window spool).
pub(crate) async fn collect(node: PlanNodeRef, ctx: &ExecutionContext) -> Result<Vec<Row>> {
    let mut stream = node.execute(ctx.clone());
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await? {
        ctx.ensure_active()?;
        rows.push(row);
    }
    Ok(rows)
}

/// A stream that yields a single error.
pub(crate) fn error_stream(error: Error) -> RowStream {
    Box::pin(futures::stream::once(async move { Err(error) }))
}

/// Raise an error from inside a `try_stream!` body: `bail(...)?` keeps the
/// success type pinned to `()` so inference stays happy.
pub(crate) fn bail(error: Error) -> Result<()> {
    Err(error)
}

/// A stream producing no rows that still runs `action` when polled; the
/// side-effecting script nodes (SET, PRINT, DDL) are built on this.
pub(crate) fn effect_stream<F>(action: F) -> RowStream
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::pin(futures::stream::once(action).try_filter_map(|()| async { Ok(None) }))
}

/// A stream over pre-computed rows, with per-row cancellation checks.
pub(crate) fn rows_stream(rows: Vec<Row>, ctx: ExecutionContext) -> RowStream {
    Box::pin(async_stream::try_stream! {
        for row in rows {
            ctx.ensure_active()?;
            yield row;
        }
    })
}
