use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::types::{GroupKey, Row};

use crate::context::ExecutionContext;
use crate::exec::{collect, PlanNodeRef, QueryPlanNode, RowStream};

fn row_key(row: &Row) -> GroupKey {
    GroupKey(row.values().cloned().collect())
}

/// Hash-based DISTINCT over whole rows.
pub struct Distinct {
    pub input: PlanNodeRef,
}

impl QueryPlanNode for Distinct {
    fn describe(&self) -> String {
        "Distinct".to_string()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut seen: HashSet<GroupKey> = HashSet::new();
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                if seen.insert(row_key(&row)) {
                    yield row;
                }
            }
        })
    }
}

/// Interleaves branches in order; the row column schema follows the first
/// branch, with later branches renamed positionally onto it.
pub struct Concatenate {
    pub branches: Vec<PlanNodeRef>,
}

impl QueryPlanNode for Concatenate {
    fn describe(&self) -> String {
        format!("Concatenate({} branches)", self.branches.len())
    }

    fn estimated_rows(&self) -> i64 {
        let mut total = 0i64;
        for branch in &self.branches {
            let est = branch.estimated_rows();
            if est < 0 {
                return -1;
            }
            total += est;
        }
        total
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        self.branches.clone()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut schema: Option<Vec<String>> = None;
            for branch in &self.branches {
                let mut input = branch.clone().execute(ctx.clone());
                while let Some(row) = input.try_next().await? {
                    ctx.ensure_active()?;
                    match &schema {
                        None => {
                            schema =
                                Some(row.column_names().map(str::to_string).collect());
                            yield row;
                        }
                        Some(names) => yield rename_positional(row, names),
                    }
                }
            }
        })
    }
}

fn rename_positional(row: Row, names: &[String]) -> Row {
    let mut out = Row::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let value = row
            .get_at(i)
            .cloned()
            .unwrap_or(marlinsql_common::types::QueryValue::Null);
        out.set(name.clone(), value);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Intersect,
    Except,
}

/// Hash-based INTERSECT / EXCEPT over materialized inputs. Both operators
/// are distinct-set semantics, as in T-SQL.
pub struct HashSetOp {
    pub left: PlanNodeRef,
    pub right: PlanNodeRef,
    pub kind: SetOpKind,
}

impl QueryPlanNode for HashSetOp {
    fn describe(&self) -> String {
        match self.kind {
            SetOpKind::Intersect => "Intersect".to_string(),
            SetOpKind::Except => "Except".to_string(),
        }
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let right_rows = collect(self.right.clone(), &ctx).await?;
            let mut right_keys: HashMap<GroupKey, ()> = HashMap::new();
            let mut left_schema: Option<Vec<String>> = None;

            let left_rows = collect(self.left.clone(), &ctx).await?;
            if let Some(first) = left_rows.first() {
                left_schema = Some(first.column_names().map(str::to_string).collect());
            }
            for row in &right_rows {
                // Right rows key positionally against the left schema.
                let keyed = match &left_schema {
                    Some(names) => rename_positional(row.clone(), names),
                    None => row.clone(),
                };
                right_keys.insert(row_key(&keyed), ());
            }

            let mut emitted: HashSet<GroupKey> = HashSet::new();
            for row in left_rows {
                ctx.ensure_active()?;
                let key = row_key(&row);
                let in_right = right_keys.contains_key(&key);
                let keep = match self.kind {
                    SetOpKind::Intersect => in_right,
                    SetOpKind::Except => !in_right,
                };
                if keep && emitted.insert(key) {
                    yield row;
                }
            }
        })
    }
}
