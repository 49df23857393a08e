use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::Row;

use crate::context::ExecutionContext;
use crate::eval::CompiledScalar;
use crate::exec::{collect, PlanNodeRef, QueryPlanNode, RowStream};

pub struct SortKey {
    pub scalar: CompiledScalar,
    pub ascending: bool,
}

/// Fully materializes the input and sorts by the compiled key vector. Nulls
/// sort first ascending, last descending.
pub struct Sort {
    pub input: PlanNodeRef,
    pub keys: Vec<SortKey>,
}

impl QueryPlanNode for Sort {
    fn describe(&self) -> String {
        format!("Sort({} keys)", self.keys.len())
    }

    fn estimated_rows(&self) -> i64 {
        self.input.estimated_rows()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let rows = collect(self.input.clone(), &ctx).await?;

            let mut keyed: Vec<(Vec<marlinsql_common::types::QueryValue>, Row)> =
                Vec::with_capacity(rows.len());
            for row in rows {
                ctx.ensure_active()?;
                let key = self
                    .keys
                    .iter()
                    .map(|k| (k.scalar)(&row))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((key, row));
            }

            keyed.sort_by(|(a, _), (b, _)| {
                for ((x, y), key) in a.iter().zip(b.iter()).zip(self.keys.iter()) {
                    let ord = x.cmp_for_sort(y);
                    let ord = if key.ascending { ord } else { ord.reverse() };
                    if !ord.is_eq() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });

            for (_, row) in keyed {
                ctx.ensure_active()?;
                yield row;
            }
        })
    }
}

/// TOP n, and TOP n PERCENT by materializing.
pub struct Top {
    pub input: PlanNodeRef,
    pub quantity: CompiledScalar,
    pub percent: bool,
}

impl QueryPlanNode for Top {
    fn describe(&self) -> String {
        if self.percent {
            "Top(percent)".to_string()
        } else {
            "Top".to_string()
        }
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let quantity = (self.quantity)(&Row::new())?;
            if self.percent {
                let pct = quantity
                    .as_float()
                    .ok_or_else(|| Error::plan("TOP PERCENT requires a numeric value"))?;
                if !(0.0..=100.0).contains(&pct) {
                    crate::exec::bail(Error::plan("TOP PERCENT must be between 0 and 100"))?;
                }
                let rows = collect(self.input.clone(), &ctx).await?;
                let take = ((rows.len() as f64) * pct / 100.0).ceil() as usize;
                for row in rows.into_iter().take(take) {
                    ctx.ensure_active()?;
                    yield row;
                }
                return;
            }

            let n = quantity
                .as_int()
                .filter(|n| *n >= 0)
                .ok_or_else(|| Error::plan("TOP requires a non-negative integer"))?
                as usize;
            if n == 0 {
                return;
            }
            let mut produced = 0usize;
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                yield row;
                produced += 1;
                if produced >= n {
                    break;
                }
            }
        })
    }
}

/// OFFSET m ROWS FETCH NEXT n ROWS ONLY.
pub struct OffsetFetch {
    pub input: PlanNodeRef,
    pub offset: CompiledScalar,
    pub fetch: Option<CompiledScalar>,
}

impl QueryPlanNode for OffsetFetch {
    fn describe(&self) -> String {
        "OffsetFetch".to_string()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let skip = (self.offset)(&Row::new())?
                .as_int()
                .filter(|n| *n >= 0)
                .ok_or_else(|| Error::plan("OFFSET requires a non-negative integer"))?
                as usize;
            let take = match &self.fetch {
                Some(fetch) => Some(
                    fetch(&Row::new())?
                        .as_int()
                        .filter(|n| *n >= 0)
                        .ok_or_else(|| {
                            Error::plan("FETCH requires a non-negative integer")
                        })? as usize,
                ),
                None => None,
            };

            let mut seen = 0usize;
            let mut produced = 0usize;
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                seen += 1;
                if seen <= skip {
                    continue;
                }
                yield row;
                produced += 1;
                if let Some(take) = take {
                    if produced >= take {
                        break;
                    }
                }
            }
        })
    }
}
