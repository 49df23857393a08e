use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::types::Row;

use crate::context::ExecutionContext;
use crate::eval::{CompiledPredicate, CompiledScalar};
use crate::exec::{PlanNodeRef, QueryPlanNode, RowStream};

/// Applies a compiled predicate row by row.
pub struct ClientFilter {
    pub input: PlanNodeRef,
    pub predicate: CompiledPredicate,
    /// Rendered predicate text for EXPLAIN.
    pub label: String,
}

impl QueryPlanNode for ClientFilter {
    fn describe(&self) -> String {
        format!("Filter({})", self.label)
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                if (self.predicate)(&row)? {
                    yield row;
                }
            }
        })
    }
}

pub enum ProjectItem {
    /// A computed output column.
    Column { name: String, scalar: CompiledScalar },
    /// `*` / `alias.*`: pass input columns through, optionally restricted to
    /// one alias prefix and stripped of it.
    All { prefix: Option<String> },
}

/// Applies a vector of compiled scalars, producing a new row with the
/// projection's column names and order.
pub struct Project {
    pub input: PlanNodeRef,
    pub items: Vec<ProjectItem>,
}

impl Project {
    fn project(&self, row: &Row) -> marlinsql_common::error::Result<Row> {
        let mut out = Row::with_capacity(self.items.len());
        for item in &self.items {
            match item {
                ProjectItem::Column { name, scalar } => {
                    out.set(name.clone(), scalar(row)?);
                }
                ProjectItem::All { prefix } => {
                    for (name, value) in row.iter() {
                        match prefix {
                            Some(p) => {
                                let qualified = format!("{}.", p);
                                if let Some(stripped) =
                                    strip_prefix_ci(name, &qualified)
                                {
                                    out.set(stripped.to_string(), value.clone());
                                }
                            }
                            None => out.set(name.to_string(), value.clone()),
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn strip_prefix_ci<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

impl QueryPlanNode for Project {
    fn describe(&self) -> String {
        let cols: Vec<String> = self
            .items
            .iter()
            .map(|i| match i {
                ProjectItem::Column { name, .. } => name.clone(),
                ProjectItem::All { prefix: Some(p) } => format!("{}.*", p),
                ProjectItem::All { prefix: None } => "*".to_string(),
            })
            .collect();
        format!("Project({})", cols.join(", "))
    }

    fn estimated_rows(&self) -> i64 {
        self.input.estimated_rows()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                yield self.project(&row)?;
            }
        })
    }
}

/// Renames input columns positionally; INSERT ... SELECT uses this to map a
/// query's output onto the target column list.
pub struct RenameColumns {
    pub input: PlanNodeRef,
    pub names: Vec<String>,
}

impl QueryPlanNode for RenameColumns {
    fn describe(&self) -> String {
        format!("Rename({})", self.names.join(", "))
    }

    fn estimated_rows(&self) -> i64 {
        self.input.estimated_rows()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                let mut out = Row::with_capacity(self.names.len());
                for (i, name) in self.names.iter().enumerate() {
                    let value = row
                        .get_at(i)
                        .cloned()
                        .unwrap_or(marlinsql_common::types::QueryValue::Null);
                    out.set(name.clone(), value);
                }
                yield out;
            }
        })
    }
}

/// Renames every unqualified input column to `alias.column`, establishing the
/// name scope a join input contributes.
pub struct QualifyColumns {
    pub input: PlanNodeRef,
    pub alias: String,
}

impl QueryPlanNode for QualifyColumns {
    fn describe(&self) -> String {
        format!("Qualify({})", self.alias)
    }

    fn estimated_rows(&self) -> i64 {
        self.input.estimated_rows()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                let mut out = Row::with_capacity(row.len());
                for (name, value) in row.iter() {
                    if name.contains('.') {
                        out.set(name.to_string(), value.clone());
                    } else {
                        out.set(format!("{}.{}", self.alias, name), value.clone());
                    }
                }
                yield out;
            }
        })
    }
}
