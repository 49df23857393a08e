use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;
use indexmap::IndexMap;
use rust_decimal::Decimal;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{arithmetic, GroupKey, QueryValue, Row};
use marlinsql_ir::AggregateFunc;

use crate::context::ExecutionContext;
use crate::eval::CompiledScalar;
use crate::exec::{collect, PlanNodeRef, QueryPlanNode, RowStream};

/// One aggregate output column.
pub struct AggregateExpr {
    pub output: String,
    pub func: AggregateFunc,
    pub arg: Option<CompiledScalar>,
    pub distinct: bool,
    pub separator: Option<String>,
}

enum AccumulatorState {
    Count(i64),
    Sum(Option<QueryValue>),
    MinMax {
        best: Option<QueryValue>,
        take_max: bool,
    },
    Avg {
        sum: Option<QueryValue>,
        count: i64,
    },
    StringAgg {
        parts: Vec<String>,
        separator: String,
    },
}

struct Accumulator {
    state: AccumulatorState,
    seen: Option<HashSet<GroupKey>>,
}

impl Accumulator {
    fn new(expr: &AggregateExpr) -> Self {
        let state = match expr.func {
            AggregateFunc::CountStar | AggregateFunc::Count => AccumulatorState::Count(0),
            AggregateFunc::Sum => AccumulatorState::Sum(None),
            AggregateFunc::Min => AccumulatorState::MinMax {
                best: None,
                take_max: false,
            },
            AggregateFunc::Max => AccumulatorState::MinMax {
                best: None,
                take_max: true,
            },
            AggregateFunc::Avg => AccumulatorState::Avg {
                sum: None,
                count: 0,
            },
            AggregateFunc::StringAgg => AccumulatorState::StringAgg {
                parts: Vec::new(),
                separator: expr.separator.clone().unwrap_or_default(),
            },
        };
        Self {
            state,
            seen: expr.distinct.then(HashSet::new),
        }
    }

    fn update(&mut self, value: Option<QueryValue>) -> Result<()> {
        // COUNT(*) counts rows; every other aggregate skips nulls.
        let value = match (&self.state, value) {
            (AccumulatorState::Count(_), None) => {
                if let AccumulatorState::Count(n) = &mut self.state {
                    *n += 1;
                }
                return Ok(());
            }
            (_, Some(v)) if v.is_null() => return Ok(()),
            (_, Some(v)) => v,
            (_, None) => return Ok(()),
        };

        if let Some(seen) = &mut self.seen {
            if !seen.insert(GroupKey(vec![value.clone()])) {
                return Ok(());
            }
        }

        match &mut self.state {
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::Sum(sum) => {
                *sum = Some(match sum.take() {
                    Some(acc) => arithmetic(&acc, '+', &value)?,
                    None => value,
                });
            }
            AccumulatorState::MinMax { best, take_max } => {
                let replace = match best {
                    Some(current) => {
                        let ord = value.cmp_for_sort(current);
                        if *take_max {
                            ord.is_gt()
                        } else {
                            ord.is_lt()
                        }
                    }
                    None => true,
                };
                if replace {
                    *best = Some(value);
                }
            }
            AccumulatorState::Avg { sum, count } => {
                *sum = Some(match sum.take() {
                    Some(acc) => arithmetic(&acc, '+', &value)?,
                    None => value,
                });
                *count += 1;
            }
            AccumulatorState::StringAgg { parts, .. } => {
                parts.push(value.display_text());
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<QueryValue> {
        Ok(match self.state {
            AccumulatorState::Count(n) => QueryValue::Int(n),
            AccumulatorState::Sum(sum) => sum.unwrap_or(QueryValue::Null),
            AccumulatorState::MinMax { best, .. } => best.unwrap_or(QueryValue::Null),
            AccumulatorState::Avg { sum, count } => match sum {
                Some(sum) if count > 0 => divide(&sum, count)?,
                _ => QueryValue::Null,
            },
            AccumulatorState::StringAgg { parts, separator } => {
                if parts.is_empty() {
                    QueryValue::Null
                } else {
                    QueryValue::Text(parts.join(&separator))
                }
            }
        })
    }
}

/// Fold a finished set of values with one aggregate function; the window
/// spool uses this for aggregate-over-frame evaluation.
pub(crate) fn aggregate_values(
    func: AggregateFunc,
    values: impl Iterator<Item = QueryValue>,
    frame_len: usize,
    separator: Option<&str>,
) -> Result<QueryValue> {
    if matches!(func, AggregateFunc::CountStar) {
        return Ok(QueryValue::Int(frame_len as i64));
    }
    let expr = AggregateExpr {
        output: String::new(),
        func,
        arg: None,
        distinct: false,
        separator: separator.map(str::to_string),
    };
    let mut acc = Accumulator::new(&expr);
    for value in values {
        acc.update(Some(value))?;
    }
    acc.finish()
}

fn divide(sum: &QueryValue, count: i64) -> Result<QueryValue> {
    // Integer sums promote so AVG keeps its fraction.
    let sum = match sum {
        QueryValue::Int(i) => QueryValue::Decimal(Decimal::from(*i)),
        other => other.clone(),
    };
    arithmetic(&sum, '/', &QueryValue::Decimal(Decimal::from(count)))
}

fn evaluate_arg(expr: &AggregateExpr, row: &Row) -> Result<Option<QueryValue>> {
    match &expr.arg {
        Some(arg) => arg(row).map(Some),
        None => Ok(None),
    }
}

fn output_row(
    group_names: &[String],
    key: &[QueryValue],
    accumulators: Vec<Accumulator>,
    aggregates: &[AggregateExpr],
) -> Result<Row> {
    let mut row = Row::with_capacity(group_names.len() + aggregates.len());
    for (name, value) in group_names.iter().zip(key.iter()) {
        row.set(name.clone(), value.clone());
    }
    for (acc, expr) in accumulators.into_iter().zip(aggregates.iter()) {
        row.set(expr.output.clone(), acc.finish()?);
    }
    Ok(row)
}

/// Hash aggregation; grouping order of the output follows first appearance.
pub struct HashAggregate {
    pub input: PlanNodeRef,
    pub group_by: Vec<(String, CompiledScalar)>,
    pub aggregates: Vec<AggregateExpr>,
}

impl QueryPlanNode for HashAggregate {
    fn describe(&self) -> String {
        format!(
            "HashAggregate({} groups, {} aggregates)",
            self.group_by.len(),
            self.aggregates.len()
        )
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let group_names: Vec<String> =
                self.group_by.iter().map(|(n, _)| n.clone()).collect();
            let mut groups: IndexMap<GroupKey, Vec<Accumulator>> = IndexMap::new();

            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                let key = self
                    .group_by
                    .iter()
                    .map(|(_, scalar)| scalar(&row))
                    .collect::<Result<Vec<_>>>()?;
                let accumulators = groups
                    .entry(GroupKey(key))
                    .or_insert_with(|| self.aggregates.iter().map(Accumulator::new).collect());
                for (acc, expr) in accumulators.iter_mut().zip(self.aggregates.iter()) {
                    acc.update(evaluate_arg(expr, &row)?)?;
                }
            }

            // A global aggregate over zero rows still produces one row.
            if groups.is_empty() && self.group_by.is_empty() {
                let accumulators: Vec<Accumulator> =
                    self.aggregates.iter().map(Accumulator::new).collect();
                yield output_row(&group_names, &[], accumulators, &self.aggregates)?;
                return;
            }

            for (key, accumulators) in groups {
                ctx.ensure_active()?;
                yield output_row(&group_names, &key.0, accumulators, &self.aggregates)?;
            }
        })
    }
}

/// Streaming aggregation over an input sorted on the full group key. The
/// operator asserts the ordering and fails on regression.
pub struct StreamAggregate {
    pub input: PlanNodeRef,
    pub group_by: Vec<(String, CompiledScalar)>,
    pub aggregates: Vec<AggregateExpr>,
}

impl QueryPlanNode for StreamAggregate {
    fn describe(&self) -> String {
        format!("StreamAggregate({} groups)", self.group_by.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let group_names: Vec<String> =
                self.group_by.iter().map(|(n, _)| n.clone()).collect();
            let mut current: Option<(Vec<QueryValue>, Vec<Accumulator>)> = None;
            let mut saw_rows = false;

            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                saw_rows = true;
                let key = self
                    .group_by
                    .iter()
                    .map(|(_, scalar)| scalar(&row))
                    .collect::<Result<Vec<_>>>()?;

                let start_new = match &current {
                    Some((active, _)) => {
                        let ord = compare_keys(active, &key);
                        if ord.is_gt() {
                            crate::exec::bail(Error::execution(
                                "stream aggregate input is not sorted on the group key",
                            ))?;
                        }
                        ord.is_lt()
                    }
                    None => true,
                };
                if start_new {
                    if let Some((key, accumulators)) = current.take() {
                        yield output_row(&group_names, &key, accumulators, &self.aggregates)?;
                    }
                    current = Some((
                        key,
                        self.aggregates.iter().map(Accumulator::new).collect(),
                    ));
                }
                let (_, accumulators) = current.as_mut().expect("group initialized");
                for (acc, expr) in accumulators.iter_mut().zip(self.aggregates.iter()) {
                    acc.update(evaluate_arg(expr, &row)?)?;
                }
            }

            if let Some((key, accumulators)) = current.take() {
                yield output_row(&group_names, &key, accumulators, &self.aggregates)?;
            } else if !saw_rows && self.group_by.is_empty() {
                let accumulators: Vec<Accumulator> =
                    self.aggregates.iter().map(Accumulator::new).collect();
                yield output_row(&group_names, &[], accumulators, &self.aggregates)?;
            }
        })
    }
}

fn compare_keys(a: &[QueryValue], b: &[QueryValue]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.cmp_for_sort(y);
        if !ord.is_eq() {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// How a partial aggregate column recombines across partitions.
pub enum MergeKind {
    /// COUNT and SUM partials add.
    Sum,
    Min,
    Max,
    /// AVG recombines from companion sum and count columns injected by the
    /// plan builder.
    Avg {
        sum_column: String,
        count_column: String,
    },
}

pub struct MergeSpec {
    pub column: String,
    pub kind: MergeKind,
}

struct MergeState {
    value: Option<QueryValue>,
    avg_sum: Option<QueryValue>,
    avg_count: i64,
}

/// Recombines partial aggregates produced by `ParallelPartition` children.
/// Input ordering is irrelevant; output follows first appearance of each
/// group.
pub struct MergeAggregate {
    pub input: PlanNodeRef,
    pub group_by: Vec<String>,
    pub merges: Vec<MergeSpec>,
}

impl QueryPlanNode for MergeAggregate {
    fn describe(&self) -> String {
        format!("MergeAggregate({} columns)", self.merges.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut groups: IndexMap<GroupKey, Vec<MergeState>> = IndexMap::new();

            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                let key: Vec<QueryValue> = self
                    .group_by
                    .iter()
                    .map(|name| row.get(name).cloned().unwrap_or(QueryValue::Null))
                    .collect();
                let states = groups.entry(GroupKey(key)).or_insert_with(|| {
                    self.merges
                        .iter()
                        .map(|_| MergeState {
                            value: None,
                            avg_sum: None,
                            avg_count: 0,
                        })
                        .collect()
                });
                for (state, spec) in states.iter_mut().zip(self.merges.iter()) {
                    merge_partial(state, spec, &row)?;
                }
            }

            if groups.is_empty() && self.group_by.is_empty() {
                let mut row = Row::with_capacity(self.merges.len());
                for spec in &self.merges {
                    let value = match &spec.kind {
                        MergeKind::Sum => QueryValue::Int(0),
                        _ => QueryValue::Null,
                    };
                    row.set(spec.column.clone(), value);
                }
                yield row;
                return;
            }

            for (key, states) in groups {
                ctx.ensure_active()?;
                let mut row = Row::with_capacity(self.group_by.len() + self.merges.len());
                for (name, value) in self.group_by.iter().zip(key.0.iter()) {
                    row.set(name.clone(), value.clone());
                }
                for (state, spec) in states.into_iter().zip(self.merges.iter()) {
                    let value = match &spec.kind {
                        MergeKind::Avg { .. } => match state.avg_sum {
                            Some(sum) if state.avg_count > 0 => {
                                divide(&sum, state.avg_count)?
                            }
                            _ => QueryValue::Null,
                        },
                        _ => state.value.unwrap_or(QueryValue::Null),
                    };
                    row.set(spec.column.clone(), value);
                }
                yield row;
            }
        })
    }
}

fn merge_partial(state: &mut MergeState, spec: &MergeSpec, row: &Row) -> Result<()> {
    match &spec.kind {
        MergeKind::Avg {
            sum_column,
            count_column,
        } => {
            let sum = row.get(sum_column).cloned().unwrap_or(QueryValue::Null);
            let count = row
                .get(count_column)
                .and_then(QueryValue::as_int)
                .unwrap_or(0);
            if !sum.is_null() {
                state.avg_sum = Some(match state.avg_sum.take() {
                    Some(acc) => arithmetic(&acc, '+', &sum)?,
                    None => sum,
                });
            }
            state.avg_count += count;
        }
        kind => {
            let partial = row.get(&spec.column).cloned().unwrap_or(QueryValue::Null);
            if partial.is_null() {
                return Ok(());
            }
            state.value = Some(match (state.value.take(), kind) {
                (None, _) => partial,
                (Some(acc), MergeKind::Sum) => arithmetic(&acc, '+', &partial)?,
                (Some(acc), MergeKind::Min) => {
                    if partial.cmp_for_sort(&acc).is_lt() {
                        partial
                    } else {
                        acc
                    }
                }
                (Some(acc), MergeKind::Max) => {
                    if partial.cmp_for_sort(&acc).is_gt() {
                        partial
                    } else {
                        acc
                    }
                }
                (Some(_), MergeKind::Avg { .. }) => unreachable!("handled above"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use marlinsql_common::metadata::MetadataCache;
    use marlinsql_ir::{ColumnRef, Expr};

    use crate::eval::ExprCompiler;
    use crate::exec::scan::ConstantScan;
    use crate::options::PlanOptions;
    use crate::remote::tests_support::NullRemote;
    use crate::session::SessionHandle;

    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(NullRemote),
            Arc::new(MetadataCache::new()),
            SessionHandle::new(),
            Arc::new(PlanOptions::default()),
        )
    }

    fn scalar(expr: &Expr) -> CompiledScalar {
        ExprCompiler::new(SessionHandle::new())
            .compile_scalar(expr)
            .unwrap()
    }

    fn col(name: &str) -> CompiledScalar {
        scalar(&Expr::Column(ColumnRef::bare(name)))
    }

    fn input(rows: &[(i64, Option<i64>)]) -> PlanNodeRef {
        let compiled = rows
            .iter()
            .map(|(g, v)| {
                vec![
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(*g))),
                    match v {
                        Some(v) => scalar(&Expr::Literal(marlinsql_ir::Literal::Int(*v))),
                        None => scalar(&Expr::Literal(marlinsql_ir::Literal::Null)),
                    },
                ]
            })
            .collect();
        Arc::new(ConstantScan {
            columns: vec!["g".into(), "v".into()],
            rows: compiled,
        })
    }

    fn aggs() -> Vec<AggregateExpr> {
        vec![
            AggregateExpr {
                output: "n".into(),
                func: AggregateFunc::CountStar,
                arg: None,
                distinct: false,
                separator: None,
            },
            AggregateExpr {
                output: "total".into(),
                func: AggregateFunc::Sum,
                arg: Some(col("v")),
                distinct: false,
                separator: None,
            },
            AggregateExpr {
                output: "mean".into(),
                func: AggregateFunc::Avg,
                arg: Some(col("v")),
                distinct: false,
                separator: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_hash_aggregate_groups_and_skips_nulls() {
        let node = Arc::new(HashAggregate {
            input: input(&[(1, Some(10)), (1, None), (2, Some(5)), (1, Some(20))]),
            group_by: vec![("g".into(), col("g"))],
            aggregates: aggs(),
        });
        let rows = collect(node, &ctx()).await.unwrap();
        assert_eq!(rows.len(), 2);
        let g1 = rows.iter().find(|r| r.get("g") == Some(&QueryValue::Int(1))).unwrap();
        // COUNT(*) counts the null row, SUM/AVG skip it.
        assert_eq!(g1.get("n"), Some(&QueryValue::Int(3)));
        assert_eq!(g1.get("total"), Some(&QueryValue::Int(30)));
        assert_eq!(
            g1.get("mean"),
            Some(&QueryValue::Decimal(Decimal::from(15)))
        );
    }

    #[tokio::test]
    async fn test_global_aggregate_over_empty_input() {
        let node = Arc::new(HashAggregate {
            input: input(&[]),
            group_by: Vec::new(),
            aggregates: aggs(),
        });
        let rows = collect(node, &ctx()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&QueryValue::Int(0)));
        assert!(rows[0].get("total").unwrap().is_null());
    }

    #[tokio::test]
    async fn test_stream_aggregate_asserts_order() {
        let node = Arc::new(StreamAggregate {
            input: input(&[(1, Some(1)), (2, Some(2)), (1, Some(3))]),
            group_by: vec![("g".into(), col("g"))],
            aggregates: aggs(),
        });
        let err = collect(node, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("not sorted"));
    }

    #[tokio::test]
    async fn test_count_distinct() {
        let node = Arc::new(HashAggregate {
            input: input(&[(1, Some(5)), (1, Some(5)), (1, Some(7))]),
            group_by: Vec::new(),
            aggregates: vec![AggregateExpr {
                output: "d".into(),
                func: AggregateFunc::Count,
                arg: Some(col("v")),
                distinct: true,
                separator: None,
            }],
        });
        let rows = collect(node, &ctx()).await.unwrap();
        assert_eq!(rows[0].get("d"), Some(&QueryValue::Int(2)));
    }

    #[tokio::test]
    async fn test_merge_aggregate_recombines_partials() {
        // Two partitions of partial aggregates for one global group.
        let partials: PlanNodeRef = {
            let mk = |n: i64, sum: i64, mn: i64, mx: i64, cnt: i64| {
                vec![
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(n))),
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(sum))),
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(mn))),
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(mx))),
                    scalar(&Expr::Literal(marlinsql_ir::Literal::Int(cnt))),
                ]
            };
            Arc::new(ConstantScan {
                columns: vec![
                    "n".into(),
                    "total".into(),
                    "low".into(),
                    "high".into(),
                    "__total_count".into(),
                ],
                rows: vec![mk(10, 100, 3, 50, 10), mk(5, 60, 1, 90, 5)],
            })
        };
        let node = Arc::new(MergeAggregate {
            input: partials,
            group_by: Vec::new(),
            merges: vec![
                MergeSpec {
                    column: "n".into(),
                    kind: MergeKind::Sum,
                },
                MergeSpec {
                    column: "low".into(),
                    kind: MergeKind::Min,
                },
                MergeSpec {
                    column: "high".into(),
                    kind: MergeKind::Max,
                },
                MergeSpec {
                    column: "avg_total".into(),
                    kind: MergeKind::Avg {
                        sum_column: "total".into(),
                        count_column: "__total_count".into(),
                    },
                },
            ],
        });
        let rows = collect(node, &ctx()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&QueryValue::Int(15)));
        assert_eq!(rows[0].get("low"), Some(&QueryValue::Int(1)));
        assert_eq!(rows[0].get("high"), Some(&QueryValue::Int(90)));
        // AVG = (100 + 60) / (10 + 5)
        assert_eq!(
            rows[0].get("avg_total"),
            Some(&QueryValue::Decimal(Decimal::from(160) / Decimal::from(15)))
        );
    }
}
