use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{QueryValue, Row};
use marlinsql_fetchxml::FetchQuery;

use crate::context::ExecutionContext;
use crate::eval::CompiledScalar;
use crate::exec::{error_stream, PlanNodeRef, QueryPlanNode, RowStream};
use crate::options::limits;
use crate::remote::FetchRequest;

/// Executes a fetch-query document against the remote store, following
/// paging cookies until the store reports no more pages. Lookup and
/// option-set values are post-expanded into their display-name virtual
/// columns.
pub struct FetchScan {
    pub query: FetchQuery,
    pub entity: String,
    pub estimated: i64,
    /// Resume cookie supplied by the caller for the root scan.
    pub initial_cookie: Option<String>,
    /// Stop paging once this many rows were produced.
    pub max_rows: Option<u64>,
}

impl FetchScan {
    pub fn new(entity: impl Into<String>, query: FetchQuery) -> Self {
        Self {
            query,
            entity: entity.into(),
            estimated: -1,
            initial_cookie: None,
            max_rows: None,
        }
    }

    /// The XML for the first page, as surfaced in `QueryResult::executed_xml`
    /// and `transpile`.
    pub fn xml(&self) -> Result<String> {
        self.page_query(1, None).to_xml()
    }

    fn page_query(&self, page: u32, cookie: Option<&str>) -> FetchQuery {
        let mut query = self.query.clone();
        // TOP queries are single-shot; everything else pages.
        if query.top.is_none() && !query.aggregate {
            query.page = Some(page);
            if query.page_size.is_none() {
                query.page_size = Some(limits::DEFAULT_PAGE_SIZE);
            }
            query.paging_cookie = cookie.map(str::to_string);
        }
        query
    }
}

impl QueryPlanNode for FetchScan {
    fn describe(&self) -> String {
        format!("FetchScan({})", self.entity)
    }

    fn estimated_rows(&self) -> i64 {
        self.estimated
    }

    fn fetch_xml(&self) -> Option<String> {
        self.xml().ok()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let mut page_no: u32 = 1;
            let mut cookie = self.initial_cookie.clone();
            let mut produced: u64 = 0;
            loop {
                ctx.ensure_active()?;
                let query = self.page_query(page_no, cookie.as_deref());
                let xml = query.to_xml()?;
                let request = FetchRequest {
                    max_rows: self.max_rows,
                    paging_cookie: cookie.clone(),
                    include_count: ctx.options.include_count,
                };
                tracing::debug!(target: "marlinsql::scan", entity = %self.entity, page = page_no, "fetch page");
                let page = ctx.remote.execute_fetch(&xml, &request).await?;
                let more = page.more;
                cookie = page.paging_cookie.clone();
                for row in page.rows {
                    ctx.ensure_active()?;
                    yield expand_virtual_columns(row);
                    produced += 1;
                    if let Some(cap) = self.max_rows {
                        if produced >= cap {
                            return;
                        }
                    }
                }
                if !more || query.page.is_none() {
                    break;
                }
                page_no += 1;
            }
        })
    }
}

/// Adds the client-synthesized display columns: `<column>name` for lookups
/// and option sets. Server-supplied columns win on collision.
pub(crate) fn expand_virtual_columns(row: Row) -> Row {
    let mut extra: Vec<(String, QueryValue)> = Vec::new();
    for (name, value) in row.iter() {
        let display = match value {
            QueryValue::Lookup { name: Some(text), .. } => Some(text.clone()),
            QueryValue::OptionSet { label: Some(text), .. } => Some(text.clone()),
            _ => None,
        };
        if let Some(text) = display {
            let virtual_name = format!("{}name", name);
            if !row.contains(&virtual_name) {
                extra.push((virtual_name, QueryValue::Text(text)));
            }
        }
    }
    if extra.is_empty() {
        return row;
    }
    let mut out = row;
    for (name, value) in extra {
        out.set(name, value);
    }
    out
}

/// Read-ahead wrapper: a spawned producer keeps one page worth of rows
/// buffered while the consumer drains the current one.
pub struct PrefetchScan {
    pub input: PlanNodeRef,
    pub buffer: usize,
}

impl QueryPlanNode for PrefetchScan {
    fn describe(&self) -> String {
        "Prefetch".to_string()
    }

    fn estimated_rows(&self) -> i64 {
        self.input.estimated_rows()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Row>>(self.buffer.max(1));
        let input = self.input.clone();
        let producer_ctx = ctx.clone();
        tokio::spawn(async move {
            let mut stream = input.execute(producer_ctx.clone());
            loop {
                match stream.try_next().await {
                    Ok(Some(row)) => {
                        if tx.send(Ok(row)).await.is_err() {
                            return; // consumer dropped
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });
        Box::pin(try_stream! {
            while let Some(item) = rx.recv().await {
                ctx.ensure_active()?;
                let row = item?;
                yield row;
            }
        })
    }
}

/// A fixed set of computed rows: SELECT without FROM, and VALUES sources.
/// Scalars are compiled at plan time and evaluated against the empty row so
/// variable references observe the session at execution time.
pub struct ConstantScan {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CompiledScalar>>,
}

impl QueryPlanNode for ConstantScan {
    fn describe(&self) -> String {
        format!("ConstantScan({} rows)", self.rows.len())
    }

    fn estimated_rows(&self) -> i64 {
        self.rows.len() as i64
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            let empty = Row::new();
            for scalars in &self.rows {
                ctx.ensure_active()?;
                let mut row = Row::with_capacity(self.columns.len());
                for (name, scalar) in self.columns.iter().zip(scalars) {
                    row.set(name.clone(), scalar(&empty)?);
                }
                yield row;
            }
        })
    }
}

/// Scan over a session temp table.
pub struct TempTableScan {
    pub name: String,
}

impl QueryPlanNode for TempTableScan {
    fn describe(&self) -> String {
        format!("TempTableScan({})", self.name)
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let table = match ctx.session.temp_table(&self.name) {
            Some(table) => table,
            None => {
                return error_stream(Error::execution(format!(
                    "temp table {} does not exist",
                    self.name
                )))
            }
        };
        crate::exec::rows_stream(table.rows, ctx)
    }
}
