use std::sync::Arc;

use async_stream::try_stream;

use crate::context::ExecutionContext;
use crate::exec::{QueryPlanNode, RowStream};

/// Pass-through of the original SQL to the tabular endpoint, capped at
/// `max_rows`. The endpoint materializes; rows stream out of the returned
/// buffer with cancellation checks.
pub struct TabularScan {
    pub sql: String,
    pub max_rows: Option<u64>,
}

impl QueryPlanNode for TabularScan {
    fn describe(&self) -> String {
        "TabularScan".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            ctx.ensure_active()?;
            tracing::debug!(target: "marlinsql::scan", "tabular pass-through");
            let rows = ctx.remote.execute_tabular(&self.sql).await?;
            let cap = self.max_rows.unwrap_or(u64::MAX);
            for (i, row) in rows.into_iter().enumerate() {
                if i as u64 >= cap {
                    break;
                }
                ctx.ensure_active()?;
                yield row;
            }
        })
    }
}
