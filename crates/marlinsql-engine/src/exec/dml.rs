use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::error::Error;
use marlinsql_common::types::{QueryValue, Row};

use crate::context::ExecutionContext;
use crate::eval::{CompiledPredicate, CompiledScalar};
use crate::exec::{bail, collect, PlanNodeRef, QueryPlanNode, RowStream};
use crate::remote::{DmlOperation, DmlRequest};

fn operation_name(op: DmlOperation) -> &'static str {
    match op {
        DmlOperation::Insert => "insert",
        DmlOperation::Update => "update",
        DmlOperation::Delete => "delete",
    }
}

/// Consumes input rows in batches and submits them through the remote access
/// layer. Per-row failures are collected, surfaced as messages and counted in
/// the summary row; submitted rows stay submitted (the store is not
/// transactional, so a halted statement is at-least-once per submitted row).
pub struct DmlExecute {
    pub input: PlanNodeRef,
    pub operation: DmlOperation,
    pub entity: String,
}

impl QueryPlanNode for DmlExecute {
    fn describe(&self) -> String {
        format!("Dml({} {})", operation_name(self.operation), self.entity)
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let batch_size = ctx.options.dml_batch_size.max(1);
            let row_cap = ctx.options.dml_row_cap;

            let mut affected = 0usize;
            let mut failed = 0usize;
            let mut consumed = 0usize;
            let mut batch: Vec<Row> = Vec::with_capacity(batch_size);

            let mut input = self.input.clone().execute(ctx.clone());
            let mut done = false;
            while !done {
                match input.try_next().await? {
                    Some(row) => {
                        ctx.ensure_active()?;
                        if let Some(cap) = row_cap {
                            if consumed >= cap {
                                // Already-submitted rows remain submitted.
                                bail(Error::DmlRowCapExceeded {
                                    cap,
                                    submitted: affected + failed,
                                })?;
                            }
                        }
                        consumed += 1;
                        batch.push(row);
                        if batch.len() < batch_size {
                            continue;
                        }
                    }
                    None => done = true,
                }

                if !batch.is_empty() {
                    let request = DmlRequest {
                        operation: self.operation,
                        entity: self.entity.clone(),
                        rows: std::mem::take(&mut batch),
                    };
                    let submitted = request.rows.len();
                    tracing::debug!(
                        target: "marlinsql::dml",
                        entity = %self.entity,
                        rows = submitted,
                        "submit {} batch",
                        operation_name(self.operation)
                    );
                    let outcomes = ctx.remote.execute_dml(request).await?;
                    for outcome in &outcomes {
                        if outcome.success {
                            affected += 1;
                        } else {
                            failed += 1;
                            ctx.info(format!(
                                "{} row {} failed: {}",
                                operation_name(self.operation),
                                outcome.index,
                                outcome.error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                    }
                    // Outcomes are per input row; anything unreported counts
                    // as submitted-and-unknown, kept in the affected total.
                    affected += submitted.saturating_sub(outcomes.len());
                }
            }

            yield Row::from_pairs([
                ("affected".to_string(), QueryValue::Int(affected as i64)),
                ("failed".to_string(), QueryValue::Int(failed as i64)),
            ]);
        })
    }
}

/// INSERT ... into a session temp table.
pub struct TempTableInsert {
    pub name: String,
    pub input: PlanNodeRef,
}

impl QueryPlanNode for TempTableInsert {
    fn describe(&self) -> String {
        format!("TempTableInsert({})", self.name)
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let rows = collect(self.input.clone(), &ctx).await?;
            let n = ctx.session.append_temp_rows(&self.name, rows)?;
            yield Row::from_pairs([("affected".to_string(), QueryValue::Int(n as i64))]);
        })
    }
}

/// UPDATE / DELETE against a session temp table, fully client-side.
pub struct TempTableMutate {
    pub name: String,
    pub assignments: Vec<(String, CompiledScalar)>,
    pub predicate: Option<CompiledPredicate>,
    pub delete: bool,
}

impl QueryPlanNode for TempTableMutate {
    fn describe(&self) -> String {
        if self.delete {
            format!("TempTableDelete({})", self.name)
        } else {
            format!("TempTableUpdate({})", self.name)
        }
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let table = match ctx.session.temp_table(&self.name) {
                Some(table) => table,
                None => {
                    bail(Error::execution(format!(
                        "temp table {} does not exist",
                        self.name
                    )))?;
                    unreachable!()
                }
            };

            let mut affected = 0usize;
            let mut kept = Vec::with_capacity(table.rows.len());
            for row in table.rows {
                ctx.ensure_active()?;
                let selected = match &self.predicate {
                    Some(predicate) => predicate(&row)?,
                    None => true,
                };
                if !selected {
                    kept.push(row);
                    continue;
                }
                affected += 1;
                if self.delete {
                    continue;
                }
                let mut updated = row;
                for (column, scalar) in &self.assignments {
                    let value = scalar(&updated)?;
                    updated.set(column.clone(), value);
                }
                kept.push(updated);
            }
            ctx.session.replace_temp_rows(&self.name, kept)?;
            yield Row::from_pairs([("affected".to_string(), QueryValue::Int(affected as i64))]);
        })
    }
}
