use std::sync::Arc;

use async_stream::try_stream;
use indexmap::IndexMap;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{GroupKey, QueryValue, Row};
use marlinsql_ir::{FrameBound, FrameUnits, WindowFrame, WindowFunc};

use crate::context::ExecutionContext;
use crate::eval::CompiledScalar;
use crate::exec::aggregate::aggregate_values;
use crate::exec::sort::SortKey;
use crate::exec::{collect, PlanNodeRef, QueryPlanNode, RowStream};

/// One compiled window expression: function, arguments and its OVER clause.
pub struct WindowExpr {
    pub output: String,
    pub func: WindowFunc,
    pub args: Vec<CompiledScalar>,
    pub partition_by: Vec<CompiledScalar>,
    pub order_by: Vec<SortKey>,
    pub frame: Option<WindowFrame>,
    /// STRING_AGG over a window carries its separator here.
    pub separator: Option<String>,
}

/// Materializes the input once, partitions by the compiled partition keys,
/// sorts each partition, then computes every window expression. Output
/// preserves the input row order.
pub struct WindowSpool {
    pub input: PlanNodeRef,
    pub windows: Vec<WindowExpr>,
}

impl QueryPlanNode for WindowSpool {
    fn describe(&self) -> String {
        format!("WindowSpool({} expressions)", self.windows.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let rows = collect(self.input.clone(), &ctx).await?;
            let mut outputs: Vec<Vec<QueryValue>> = Vec::with_capacity(self.windows.len());

            for window in &self.windows {
                ctx.ensure_active()?;
                outputs.push(compute_window(window, &rows)?);
            }

            for (i, row) in rows.into_iter().enumerate() {
                ctx.ensure_active()?;
                let mut out = row;
                for (window, values) in self.windows.iter().zip(outputs.iter()) {
                    out.set(window.output.clone(), values[i].clone());
                }
                yield out;
            }
        })
    }
}

fn compute_window(window: &WindowExpr, rows: &[Row]) -> Result<Vec<QueryValue>> {
    let mut partitions: IndexMap<GroupKey, Vec<usize>> = IndexMap::new();
    for (i, row) in rows.iter().enumerate() {
        let key = window
            .partition_by
            .iter()
            .map(|k| k(row))
            .collect::<Result<Vec<_>>>()?;
        partitions.entry(GroupKey(key)).or_default().push(i);
    }

    let mut results = vec![QueryValue::Null; rows.len()];
    for (_, mut indices) in partitions {
        sort_partition(&mut indices, rows, &window.order_by)?;
        compute_partition(window, rows, &indices, &mut results)?;
    }
    Ok(results)
}

fn sort_partition(indices: &mut [usize], rows: &[Row], order_by: &[SortKey]) -> Result<()> {
    if order_by.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<Vec<QueryValue>> = Vec::with_capacity(indices.len());
    for &i in indices.iter() {
        keys.push(
            order_by
                .iter()
                .map(|k| (k.scalar)(&rows[i]))
                .collect::<Result<Vec<_>>>()?,
        );
    }
    let mut order: Vec<usize> = (0..indices.len()).collect();
    order.sort_by(|&a, &b| {
        for ((x, y), key) in keys[a].iter().zip(keys[b].iter()).zip(order_by.iter()) {
            let ord = x.cmp_for_sort(y);
            let ord = if key.ascending { ord } else { ord.reverse() };
            if !ord.is_eq() {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
    let sorted: Vec<usize> = order.iter().map(|&p| indices[p]).collect();
    indices.copy_from_slice(&sorted);
    Ok(())
}

/// Peer groups: runs of rows equal on the full ORDER BY key.
fn peer_groups(rows: &[Row], indices: &[usize], order_by: &[SortKey]) -> Result<Vec<usize>> {
    // group id per position within the partition
    let mut groups = Vec::with_capacity(indices.len());
    let mut last_key: Option<Vec<QueryValue>> = None;
    let mut group = 0usize;
    for &i in indices {
        let key = order_by
            .iter()
            .map(|k| (k.scalar)(&rows[i]))
            .collect::<Result<Vec<_>>>()?;
        if let Some(last) = &last_key {
            let equal = last
                .iter()
                .zip(key.iter())
                .all(|(a, b)| a.cmp_for_sort(b).is_eq());
            if !equal {
                group += 1;
            }
        }
        groups.push(group);
        last_key = Some(key);
    }
    Ok(groups)
}

fn compute_partition(
    window: &WindowExpr,
    rows: &[Row],
    indices: &[usize],
    results: &mut [QueryValue],
) -> Result<()> {
    let n = indices.len();
    let groups = peer_groups(rows, indices, &window.order_by)?;

    match &window.func {
        WindowFunc::RowNumber => {
            for (pos, &i) in indices.iter().enumerate() {
                results[i] = QueryValue::Int(pos as i64 + 1);
            }
        }
        WindowFunc::Rank | WindowFunc::DenseRank => {
            let dense = matches!(window.func, WindowFunc::DenseRank);
            let mut first_of_group = vec![0usize; groups.last().map_or(0, |g| g + 1)];
            for (pos, &g) in groups.iter().enumerate() {
                if pos == 0 || groups[pos - 1] != g {
                    first_of_group[g] = pos;
                }
            }
            for (pos, &i) in indices.iter().enumerate() {
                let g = groups[pos];
                let rank = if dense {
                    g as i64 + 1
                } else {
                    first_of_group[g] as i64 + 1
                };
                results[i] = QueryValue::Int(rank);
            }
        }
        WindowFunc::CumeDist => {
            // (position of last peer + 1) / partition size
            let mut last_of_group = vec![0usize; groups.last().map_or(0, |g| g + 1)];
            for (pos, &g) in groups.iter().enumerate() {
                last_of_group[g] = pos;
            }
            for (pos, &i) in indices.iter().enumerate() {
                let last = last_of_group[groups[pos]];
                results[i] = QueryValue::Float((last + 1) as f64 / n as f64);
            }
        }
        WindowFunc::PercentRank => {
            let mut first_of_group = vec![0usize; groups.last().map_or(0, |g| g + 1)];
            for (pos, &g) in groups.iter().enumerate() {
                if pos == 0 || groups[pos - 1] != g {
                    first_of_group[g] = pos;
                }
            }
            for (pos, &i) in indices.iter().enumerate() {
                let rank = first_of_group[groups[pos]] as i64 + 1;
                results[i] = QueryValue::Float(if n == 1 {
                    0.0
                } else {
                    (rank - 1) as f64 / (n - 1) as f64
                });
            }
        }
        WindowFunc::Ntile => {
            let buckets = constant_int_arg(window, 0, "NTILE")?
                .filter(|b| *b > 0)
                .ok_or_else(|| Error::plan("NTILE requires a positive integer"))?
                as usize;
            let base = n / buckets;
            let extra = n % buckets;
            // Earlier buckets take the extra row.
            for (pos, &i) in indices.iter().enumerate() {
                let bucket = if pos < extra * (base + 1) {
                    pos / (base + 1)
                } else if base > 0 {
                    extra + (pos - extra * (base + 1)) / base
                } else {
                    pos
                };
                results[i] = QueryValue::Int(bucket as i64 + 1);
            }
        }
        WindowFunc::Lag | WindowFunc::Lead => {
            let arg = window
                .args
                .first()
                .ok_or_else(|| Error::plan("LAG/LEAD require an argument"))?;
            let offset = match window.args.get(1) {
                Some(_) => constant_int_arg(window, 1, "LAG/LEAD offset")?
                    .filter(|o| *o >= 0)
                    .ok_or_else(|| Error::plan("LAG/LEAD offset must be non-negative"))?,
                None => 1,
            };
            let backwards = matches!(window.func, WindowFunc::Lag);
            for (pos, &i) in indices.iter().enumerate() {
                let target = if backwards {
                    pos.checked_sub(offset as usize)
                } else {
                    let t = pos + offset as usize;
                    (t < n).then_some(t)
                };
                results[i] = match target {
                    Some(t) => arg(&rows[indices[t]])?,
                    None => match window.args.get(2) {
                        Some(default) => default(&rows[i])?,
                        None => QueryValue::Null,
                    },
                };
            }
        }
        WindowFunc::FirstValue | WindowFunc::LastValue => {
            let arg = window
                .args
                .first()
                .ok_or_else(|| Error::plan("FIRST_VALUE/LAST_VALUE require an argument"))?;
            let first = matches!(window.func, WindowFunc::FirstValue);
            for (pos, &i) in indices.iter().enumerate() {
                results[i] = match frame_bounds(window, pos, n, &groups)? {
                    Some((lo, hi)) => {
                        let target = if first { lo } else { hi };
                        arg(&rows[indices[target]])?
                    }
                    None => QueryValue::Null,
                };
            }
        }
        WindowFunc::Aggregate(func) => {
            for (pos, &i) in indices.iter().enumerate() {
                let (values, frame_len) = match frame_bounds(window, pos, n, &groups)? {
                    Some((lo, hi)) => {
                        let values = (lo..=hi)
                            .map(|p| match window.args.first() {
                                Some(arg) => arg(&rows[indices[p]]),
                                None => Ok(QueryValue::Null),
                            })
                            .collect::<Result<Vec<_>>>()?;
                        (values, hi - lo + 1)
                    }
                    None => (Vec::new(), 0),
                };
                results[i] = aggregate_values(
                    *func,
                    values.into_iter(),
                    frame_len,
                    window.separator.as_deref(),
                )?;
            }
        }
    }
    Ok(())
}

/// Evaluate an argument that must be a per-partition constant (NTILE count,
/// LAG offset) against the first row it applies to.
fn constant_int_arg(window: &WindowExpr, index: usize, label: &str) -> Result<Option<i64>> {
    let arg = window
        .args
        .get(index)
        .ok_or_else(|| Error::plan(format!("{} argument missing", label)))?;
    Ok(arg(&Row::new())?.as_int())
}

/// Inclusive frame bounds for one row position within its sorted partition;
/// `None` for an empty frame.
fn frame_bounds(
    window: &WindowExpr,
    pos: usize,
    n: usize,
    groups: &[usize],
) -> Result<Option<(usize, usize)>> {
    let frame = match &window.frame {
        Some(frame) => frame.clone(),
        None => {
            // Default: whole partition without ORDER BY, otherwise RANGE
            // UNBOUNDED PRECEDING .. CURRENT ROW.
            if window.order_by.is_empty() {
                return Ok(Some((0, n - 1)));
            }
            WindowFrame {
                units: FrameUnits::Range,
                start: FrameBound::UnboundedPreceding,
                end: FrameBound::CurrentRow,
            }
        }
    };

    let by_rows = matches!(frame.units, FrameUnits::Rows);
    let lo = match &frame.start {
        FrameBound::UnboundedPreceding => 0,
        FrameBound::CurrentRow => {
            if by_rows {
                pos
            } else {
                first_peer(groups, pos)
            }
        }
        FrameBound::Preceding(k) => {
            if by_rows {
                pos.saturating_sub(*k as usize)
            } else {
                return Err(Error::not_supported(
                    "RANGE frames with numeric offsets",
                ));
            }
        }
        FrameBound::Following(k) => {
            if by_rows {
                (pos + *k as usize).min(n - 1)
            } else {
                return Err(Error::not_supported(
                    "RANGE frames with numeric offsets",
                ));
            }
        }
        FrameBound::UnboundedFollowing => {
            return Err(Error::plan("frame start may not be UNBOUNDED FOLLOWING"))
        }
    };
    let hi = match &frame.end {
        FrameBound::UnboundedFollowing => n - 1,
        FrameBound::CurrentRow => {
            if by_rows {
                pos
            } else {
                last_peer(groups, pos)
            }
        }
        FrameBound::Preceding(k) => {
            if by_rows {
                pos.saturating_sub(*k as usize)
            } else {
                return Err(Error::not_supported(
                    "RANGE frames with numeric offsets",
                ));
            }
        }
        FrameBound::Following(k) => {
            if by_rows {
                (pos + *k as usize).min(n - 1)
            } else {
                return Err(Error::not_supported(
                    "RANGE frames with numeric offsets",
                ));
            }
        }
        FrameBound::UnboundedPreceding => {
            return Err(Error::plan("frame end may not be UNBOUNDED PRECEDING"))
        }
    };
    if lo > hi {
        return Ok(None);
    }
    Ok(Some((lo, hi)))
}

fn first_peer(groups: &[usize], pos: usize) -> usize {
    let g = groups[pos];
    (0..=pos).find(|&p| groups[p] == g).unwrap_or(pos)
}

fn last_peer(groups: &[usize], pos: usize) -> usize {
    let g = groups[pos];
    (pos..groups.len())
        .take_while(|&p| groups[p] == g)
        .last()
        .unwrap_or(pos)
}
