use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use tokio::sync::{mpsc, Semaphore};

use marlinsql_common::error::{Error, Result};
use marlinsql_fetchxml::{
    format_timestamp, FetchCondition, FetchFilter, FetchOperator, FetchQuery,
};

use crate::context::ExecutionContext;
use crate::exec::scan::expand_virtual_columns;
use crate::exec::{bail, PlanNodeRef, QueryPlanNode, RowStream};
use crate::options::limits;
use crate::remote::FetchRequest;

/// Fans children out concurrently, bounded by the pool capacity, with a
/// bounded output channel for backpressure. Ordering across children is
/// non-deterministic; the consumer is always `MergeAggregate`. The first
/// child error completes the output and cancels in-flight siblings.
pub struct ParallelPartition {
    pub children: Vec<PlanNodeRef>,
}

impl QueryPlanNode for ParallelPartition {
    fn describe(&self) -> String {
        format!("ParallelPartition({} partitions)", self.children.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        self.children.clone()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let capacity = ctx.pool_capacity();
        let (child_ctx, child_token) = ctx.with_child_cancel();
        let (tx, mut rx) = mpsc::channel(capacity.saturating_mul(2).max(2));
        let slots = Arc::new(Semaphore::new(capacity.max(1)));

        for child in self.children.clone() {
            let tx = tx.clone();
            let child_ctx = child_ctx.clone();
            let child_token = child_token.clone();
            let semaphore = slots.clone();
            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if child_token.is_cancelled() {
                    return;
                }
                let mut stream = child.execute(child_ctx);
                loop {
                    match stream.try_next().await {
                        Ok(Some(row)) => {
                            if tx.send(Ok(row)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            // Queue the originating error ahead of the
                            // Cancelled errors the siblings are about to
                            // raise.
                            let _ = tx.send(Err(e)).await;
                            child_token.cancel();
                            return;
                        }
                    }
                }
            });
        }
        drop(tx);

        Box::pin(try_stream! {
            while let Some(item) = rx.recv().await {
                ctx.ensure_active()?;
                let row = item?;
                yield row;
            }
        })
    }
}

/// A partitioned aggregate scan over `[start, end)` of a timestamp column.
/// On the store's aggregate record cap the range bisects recursively, to a
/// depth of 15; other failures propagate untouched.
pub struct AdaptiveAggregateScan {
    pub entity: String,
    /// Aggregate fetch document without the partition's range conditions.
    pub template: FetchQuery,
    pub ts_column: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub estimated: i64,
}

impl AdaptiveAggregateScan {
    fn range_query(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> FetchQuery {
        let mut query = self.template.clone();
        let mut range = FetchFilter::all();
        range.conditions.push(FetchCondition {
            attribute: self.ts_column.clone(),
            entity_alias: None,
            operator: FetchOperator::Ge,
            values: vec![format_timestamp(start)],
        });
        range.conditions.push(FetchCondition {
            attribute: self.ts_column.clone(),
            entity_alias: None,
            operator: FetchOperator::Lt,
            values: vec![format_timestamp(end)],
        });
        match query.entity.filter.take() {
            Some(existing) if !existing.is_empty() => {
                range.filters.push(existing);
            }
            _ => {}
        }
        query.entity.filter = Some(range);
        query
    }
}

fn is_aggregate_cap_error(error: &Error) -> bool {
    match error {
        Error::AggregateLimitExceeded(_) => true,
        Error::BadQuery(message) | Error::ExecutionFailed(message) => {
            Error::is_aggregate_cap(None, message)
        }
        _ => false,
    }
}

impl QueryPlanNode for AdaptiveAggregateScan {
    fn describe(&self) -> String {
        format!(
            "AdaptiveAggregateScan({} [{} .. {}))",
            self.entity,
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }

    fn estimated_rows(&self) -> i64 {
        self.estimated
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            // Depth-first over subranges; no ancestor retains row buffers.
            let mut stack: Vec<(DateTime<Utc>, DateTime<Utc>, u32)> =
                vec![(self.start, self.end, 0)];

            while let Some((start, end, depth)) = stack.pop() {
                ctx.ensure_active()?;
                let query = self.range_query(start, end);
                let xml = query.to_xml()?;
                let request = FetchRequest::default();
                match ctx.remote.execute_fetch(&xml, &request).await {
                    Ok(page) => {
                        for row in page.rows {
                            ctx.ensure_active()?;
                            yield expand_virtual_columns(row);
                        }
                    }
                    Err(error) if is_aggregate_cap_error(&error) => {
                        let splittable = depth < limits::MAX_PARTITION_DEPTH
                            && end - start > Duration::milliseconds(1);
                        if !splittable {
                            bail(Error::aggregate_limit(format!(
                                "partition [{}, {}) still exceeds the aggregate cap at depth {}",
                                format_timestamp(start),
                                format_timestamp(end),
                                depth
                            )))?;
                        }
                        let mid = start + (end - start) / 2;
                        tracing::debug!(
                            target: "marlinsql::partition",
                            entity = %self.entity,
                            depth,
                            "aggregate cap hit; splitting at {}",
                            format_timestamp(mid)
                        );
                        // Process [start, mid) before [mid, end).
                        stack.push((mid, end, depth + 1));
                        stack.push((start, mid, depth + 1));
                    }
                    Err(error) => {
                        bail(error)?;
                    }
                }
            }
        })
    }
}

/// Uniform initial partitioning of a timestamp range: `count` adjacent
/// subranges covering `[min, max)`.
pub fn uniform_partitions(
    min: DateTime<Utc>,
    max: DateTime<Utc>,
    count: usize,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let count = count.max(1);
    let span = max - min;
    let mut bounds = Vec::with_capacity(count);
    for i in 0..count {
        let lo = min + span * (i as i32) / (count as i32);
        let hi = if i + 1 == count {
            max
        } else {
            min + span * ((i + 1) as i32) / (count as i32)
        };
        bounds.push((lo, hi));
    }
    bounds
}
