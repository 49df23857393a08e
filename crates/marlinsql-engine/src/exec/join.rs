use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{GroupKey, QueryValue, Row};

use crate::context::ExecutionContext;
use crate::eval::{CompiledPredicate, CompiledScalar};
use crate::exec::{collect, PlanNodeRef, QueryPlanNode, RowStream};
use crate::options::limits;

/// Join semantics implemented by the physical join operators. Semi and anti
/// joins come out of the IN/EXISTS rewrites; `SingleLeft` backs correlated
/// scalar subqueries (left outer join asserting at most one match).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSemantics {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
    /// NOT IN: one null in the build keys poisons every probe row.
    NullAwareAnti,
    SingleLeft,
}

impl JoinSemantics {
    fn name(&self) -> &'static str {
        match self {
            JoinSemantics::Inner => "inner",
            JoinSemantics::Left => "left",
            JoinSemantics::Right => "right",
            JoinSemantics::Full => "full",
            JoinSemantics::Semi => "semi",
            JoinSemantics::Anti => "anti",
            JoinSemantics::NullAwareAnti => "null-aware anti",
            JoinSemantics::SingleLeft => "single-row left",
        }
    }
}

fn concat(left: &Row, right: &Row) -> Row {
    left.concat(right)
}

fn null_pad(columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| (c.clone(), QueryValue::Null))
        .collect()
}

fn row_columns(rows: &[Row]) -> Vec<String> {
    rows.first()
        .map(|r| r.column_names().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Rough heap footprint of a value, for the hash build budget.
fn value_size(value: &QueryValue) -> usize {
    16 + match value {
        QueryValue::Text(s) => s.len(),
        QueryValue::Binary(b) => b.len(),
        QueryValue::Lookup { entity, name, .. } => {
            entity.len() + name.as_ref().map_or(0, |n| n.len()) + 16
        }
        QueryValue::OptionSet { label, .. } => label.as_ref().map_or(0, |l| l.len()),
        QueryValue::Money { formatted, .. } => formatted.as_ref().map_or(0, |f| f.len()),
        _ => 0,
    }
}

fn row_size(row: &Row) -> usize {
    row.iter()
        .map(|(k, v)| k.len() + value_size(v))
        .sum::<usize>()
        + 32
}

/// Hash join: builds on the right input, probes with the left. Respects a
/// fixed memory budget on the build side; there is no spill path.
pub struct HashJoin {
    pub left: PlanNodeRef,
    pub right: PlanNodeRef,
    pub semantics: JoinSemantics,
    pub left_keys: Vec<CompiledScalar>,
    pub right_keys: Vec<CompiledScalar>,
    /// Non-equi part of the join condition, over the combined row.
    pub residual: Option<CompiledPredicate>,
    pub estimated: i64,
}

impl HashJoin {
    fn keys(&self, row: &Row, scalars: &[CompiledScalar]) -> Result<Vec<QueryValue>> {
        scalars.iter().map(|k| k(row)).collect()
    }
}

impl QueryPlanNode for HashJoin {
    fn describe(&self) -> String {
        format!("HashJoin({}, {} keys)", self.semantics.name(), self.left_keys.len())
    }

    fn estimated_rows(&self) -> i64 {
        self.estimated
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let build_rows = collect(self.right.clone(), &ctx).await?;
            let build_columns = row_columns(&build_rows);

            let mut table: HashMap<GroupKey, Vec<usize>> = HashMap::new();
            let mut build_has_null_key = false;
            let mut bytes = 0usize;
            for (i, row) in build_rows.iter().enumerate() {
                bytes += row_size(row);
                if bytes > limits::HASH_BUILD_BUDGET {
                    crate::exec::bail(Error::execution(format!(
                        "hash join build side exceeded the {} MiB memory budget",
                        limits::HASH_BUILD_BUDGET / (1024 * 1024)
                    )))?;
                }
                let keys = self.keys(row, &self.right_keys)?;
                if keys.iter().any(QueryValue::is_null) {
                    build_has_null_key = true;
                    continue;
                }
                table.entry(GroupKey(keys)).or_default().push(i);
            }

            let mut matched_build = vec![false; build_rows.len()];
            let mut probe_columns: Vec<String> = Vec::new();

            let mut probe = self.left.clone().execute(ctx.clone());
            while let Some(row) = probe.try_next().await? {
                ctx.ensure_active()?;
                if probe_columns.is_empty() {
                    probe_columns = row.column_names().map(str::to_string).collect();
                }
                let keys = self.keys(&row, &self.left_keys)?;
                let probe_key_null = keys.iter().any(QueryValue::is_null);

                let candidates: &[usize] = if probe_key_null {
                    &[]
                } else {
                    table.get(&GroupKey(keys)).map(Vec::as_slice).unwrap_or(&[])
                };

                let mut match_count = 0usize;
                for &i in candidates {
                    let combined = concat(&row, &build_rows[i]);
                    if let Some(residual) = &self.residual {
                        if !residual(&combined)? {
                            continue;
                        }
                    }
                    match_count += 1;
                    matched_build[i] = true;
                    match self.semantics {
                        JoinSemantics::Inner
                        | JoinSemantics::Left
                        | JoinSemantics::Right
                        | JoinSemantics::Full => yield combined,
                        JoinSemantics::SingleLeft => {
                            if match_count > 1 {
                                crate::exec::bail(Error::execution(
                                    "scalar subquery returned more than one row",
                                ))?;
                            }
                            yield combined;
                        }
                        JoinSemantics::Semi => {
                            yield row.clone();
                            break;
                        }
                        JoinSemantics::Anti | JoinSemantics::NullAwareAnti => break,
                    }
                }

                if match_count == 0 {
                    match self.semantics {
                        JoinSemantics::Left | JoinSemantics::SingleLeft => {
                            yield concat(&row, &null_pad(&build_columns));
                        }
                        JoinSemantics::Full => {
                            yield concat(&row, &null_pad(&build_columns));
                        }
                        JoinSemantics::Anti => yield row,
                        JoinSemantics::NullAwareAnti => {
                            // Unknown membership: a null probe key or any null
                            // build key makes NOT IN unknowable, so the row is
                            // filtered.
                            if !probe_key_null && !build_has_null_key {
                                yield row;
                            }
                        }
                        _ => {}
                    }
                }
            }

            if matches!(self.semantics, JoinSemantics::Right | JoinSemantics::Full) {
                let pad = null_pad(&probe_columns);
                for (i, row) in build_rows.iter().enumerate() {
                    ctx.ensure_active()?;
                    if !matched_build[i] {
                        yield concat(&pad, row);
                    }
                }
            }
        })
    }
}

/// Nested loop join: materializes the inner (right) input, streams the
/// outer. Chosen for small inner sides and for non-equi conditions.
pub struct NestedLoopJoin {
    pub left: PlanNodeRef,
    pub right: PlanNodeRef,
    pub semantics: JoinSemantics,
    pub condition: Option<CompiledPredicate>,
    pub estimated: i64,
}

impl QueryPlanNode for NestedLoopJoin {
    fn describe(&self) -> String {
        format!("NestedLoopJoin({})", self.semantics.name())
    }

    fn estimated_rows(&self) -> i64 {
        self.estimated
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let inner_rows = collect(self.right.clone(), &ctx).await?;
            let inner_columns = row_columns(&inner_rows);
            let mut matched_inner = vec![false; inner_rows.len()];
            let mut outer_columns: Vec<String> = Vec::new();

            let mut outer = self.left.clone().execute(ctx.clone());
            while let Some(row) = outer.try_next().await? {
                ctx.ensure_active()?;
                if outer_columns.is_empty() {
                    outer_columns = row.column_names().map(str::to_string).collect();
                }
                let mut had_match = false;
                for (i, inner) in inner_rows.iter().enumerate() {
                    let combined = concat(&row, inner);
                    let matches = match &self.condition {
                        Some(condition) => condition(&combined)?,
                        None => true,
                    };
                    if !matches {
                        continue;
                    }
                    had_match = true;
                    matched_inner[i] = true;
                    match self.semantics {
                        JoinSemantics::Semi => {
                            yield row.clone();
                            break;
                        }
                        JoinSemantics::Anti => break,
                        _ => yield combined,
                    }
                }
                if !had_match {
                    match self.semantics {
                        JoinSemantics::Left | JoinSemantics::Full => {
                            yield concat(&row, &null_pad(&inner_columns));
                        }
                        JoinSemantics::Anti => yield row,
                        _ => {}
                    }
                }
            }

            if matches!(self.semantics, JoinSemantics::Right | JoinSemantics::Full) {
                let pad = null_pad(&outer_columns);
                for (i, inner) in inner_rows.iter().enumerate() {
                    ctx.ensure_active()?;
                    if !matched_inner[i] {
                        yield concat(&pad, inner);
                    }
                }
            }
        })
    }
}

/// Merge join over two inputs already sorted on the full equi-join key.
pub struct MergeJoin {
    pub left: PlanNodeRef,
    pub right: PlanNodeRef,
    pub semantics: JoinSemantics,
    pub left_keys: Vec<CompiledScalar>,
    pub right_keys: Vec<CompiledScalar>,
    pub estimated: i64,
}

fn key_of(row: &Row, keys: &[CompiledScalar]) -> Result<Vec<QueryValue>> {
    keys.iter().map(|k| k(row)).collect()
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

impl QueryPlanNode for MergeJoin {
    fn describe(&self) -> String {
        format!("MergeJoin({})", self.semantics.name())
    }

    fn estimated_rows(&self) -> i64 {
        self.estimated
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut left = self.left.clone().execute(ctx.clone());
            let mut right = self.right.clone().execute(ctx.clone());

            let mut left_row = left.try_next().await?;
            let mut right_row = right.try_next().await?;
            let mut right_columns: Vec<String> = right_row
                .as_ref()
                .map(|r| r.column_names().map(str::to_string).collect())
                .unwrap_or_default();

            while let Some(l) = left_row.clone() {
                ctx.ensure_active()?;
                let lk = key_of(&l, &self.left_keys)?;
                // Null keys never match; left rows surface for outer joins.
                if lk.iter().any(QueryValue::is_null) {
                    if matches!(self.semantics, JoinSemantics::Left) {
                        yield concat(&l, &null_pad(&right_columns));
                    }
                    left_row = left.try_next().await?;
                    continue;
                }

                // Advance the right side to the left key.
                loop {
                    match &right_row {
                        Some(r) => {
                            let rk = key_of(r, &self.right_keys)?;
                            if rk.iter().any(QueryValue::is_null)
                                || compare_keys(&rk, &lk).is_lt()
                            {
                                right_columns =
                                    r.column_names().map(str::to_string).collect();
                                right_row = right.try_next().await?;
                            } else {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                // Gather the right-side group equal to the left key.
                let mut group: Vec<Row> = Vec::new();
                while let Some(r) = &right_row {
                    let rk = key_of(r, &self.right_keys)?;
                    if compare_keys(&rk, &lk).is_eq() {
                        right_columns = r.column_names().map(str::to_string).collect();
                        group.push(r.clone());
                        right_row = right.try_next().await?;
                    } else {
                        break;
                    }
                }

                // Emit every left row sharing this key against the group.
                loop {
                    let l = match &left_row {
                        Some(l) => l.clone(),
                        None => break,
                    };
                    let current = key_of(&l, &self.left_keys)?;
                    if !compare_keys(&current, &lk).is_eq() {
                        break;
                    }
                    if group.is_empty() {
                        if matches!(self.semantics, JoinSemantics::Left) {
                            yield concat(&l, &null_pad(&right_columns));
                        }
                    } else {
                        for r in &group {
                            ctx.ensure_active()?;
                            yield concat(&l, r);
                        }
                    }
                    left_row = left.try_next().await?;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use marlinsql_common::metadata::MetadataCache;

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

    fn rows_node(columns: &[&str], rows: &[&[i64]]) -> PlanNodeRef {
        let compiler = ExprCompiler::new(SessionHandle::new());
        let compiled = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| {
                        compiler
                            .compile_scalar(&marlinsql_ir::Expr::Literal(
                                marlinsql_ir::Literal::Int(*v),
                            ))
                            .unwrap()
                    })
                    .collect()
            })
            .collect();
        Arc::new(ConstantScan {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: compiled,
        })
    }

    fn key(name: &str) -> CompiledScalar {
        let compiler = ExprCompiler::new(SessionHandle::new());
        compiler
            .compile_scalar(&marlinsql_ir::Expr::Column(marlinsql_ir::ColumnRef::bare(
                name,
            )))
            .unwrap()
    }

    async fn run(node: PlanNodeRef) -> Vec<Row> {
        collect(node, &ctx()).await.unwrap()
    }

    #[tokio::test]
    async fn test_hash_inner_join() {
        let join = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1], &[2], &[3]]),
            right: rows_node(&["b"], &[&[2], &[3], &[3]]),
            semantics: JoinSemantics::Inner,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        let rows = run(join).await;
        // 2 matches once, 3 matches twice.
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_hash_left_join_pads_nulls() {
        let join = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1], &[2]]),
            right: rows_node(&["b"], &[&[2]]),
            semantics: JoinSemantics::Left,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        let rows = run(join).await;
        assert_eq!(rows.len(), 2);
        let unmatched = rows.iter().find(|r| r.get("a") == Some(&QueryValue::Int(1))).unwrap();
        assert!(unmatched.get("b").unwrap().is_null());
    }

    #[tokio::test]
    async fn test_semi_and_anti() {
        let semi = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1], &[2], &[3]]),
            right: rows_node(&["b"], &[&[2], &[2]]),
            semantics: JoinSemantics::Semi,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        let rows = run(semi).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some(&QueryValue::Int(2)));
        // Semi join output keeps only probe columns.
        assert!(rows[0].get("b").is_none());

        let anti = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1], &[2], &[3]]),
            right: rows_node(&["b"], &[&[2]]),
            semantics: JoinSemantics::Anti,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        let rows = run(anti).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_null_aware_anti_poisoned_by_build_null() {
        let compiler = ExprCompiler::new(SessionHandle::new());
        let null_row = vec![compiler
            .compile_scalar(&marlinsql_ir::Expr::Literal(marlinsql_ir::Literal::Null))
            .unwrap()];
        let two = vec![compiler
            .compile_scalar(&marlinsql_ir::Expr::Literal(marlinsql_ir::Literal::Int(2)))
            .unwrap()];
        let build: PlanNodeRef = Arc::new(ConstantScan {
            columns: vec!["b".into()],
            rows: vec![two, null_row],
        });
        let join = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1], &[3]]),
            right: build,
            semantics: JoinSemantics::NullAwareAnti,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        // NOT IN with a null in the list filters everything.
        let rows = run(join).await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_single_left_asserts_one_match() {
        let join = Arc::new(HashJoin {
            left: rows_node(&["a"], &[&[1]]),
            right: rows_node(&["b"], &[&[1], &[1]]),
            semantics: JoinSemantics::SingleLeft,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            residual: None,
            estimated: -1,
        });
        let err = collect(join, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("more than one row"));
    }

    #[tokio::test]
    async fn test_nested_loop_cross() {
        let join = Arc::new(NestedLoopJoin {
            left: rows_node(&["a"], &[&[1], &[2]]),
            right: rows_node(&["b"], &[&[10], &[20], &[30]]),
            semantics: JoinSemantics::Inner,
            condition: None,
            estimated: -1,
        });
        let rows = run(join).await;
        assert_eq!(rows.len(), 6);
    }

    #[tokio::test]
    async fn test_merge_join_with_duplicates() {
        let join = Arc::new(MergeJoin {
            left: rows_node(&["a"], &[&[1], &[2], &[2], &[4]]),
            right: rows_node(&["b"], &[&[2], &[2], &[3]]),
            semantics: JoinSemantics::Inner,
            left_keys: vec![key("a")],
            right_keys: vec![key("b")],
            estimated: -1,
        });
        let rows = run(join).await;
        // 2x2 cross product for the duplicated key.
        assert_eq!(rows.len(), 4);
    }
}
