//! MarlinSQL: a T-SQL query engine over remote record stores that expose an
//! XML fetch-query protocol and a tabular SQL pass-through endpoint.
//!
//! The facade owns the statement entry points; everything else lives in the
//! member crates: parsing (`marlinsql-parser`), the typed syntax tree
//! (`marlinsql-ir`), plan building and streaming execution
//! (`marlinsql-engine`), the fetch XML documents (`marlinsql-fetchxml`) and
//! editor services (`marlinsql-intellisense`).

use std::sync::Arc;
use std::time::Instant;

use futures::stream::BoxStream;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

pub use marlinsql_common::error::{Error, ErrorPayload, Result};
pub use marlinsql_common::metadata::{
    AttributeMetadata, AttributeType, EntityMetadata, MetadataCache, OptionSetValue,
    RelationshipMetadata,
};
pub use marlinsql_common::result::{ColumnInfo, QueryResult, RowBatch};
pub use marlinsql_common::types::{QueryValue, Row};
pub use marlinsql_engine::explain::PlanDescription;
pub use marlinsql_engine::{
    DmlOperation, DmlOutcome, DmlRequest, FetchPage, FetchRequest, PlanOptions, RemoteStore,
};
pub use marlinsql_intellisense as intellisense;

use marlinsql_engine::explain::{describe_plan, render_plan};
use marlinsql_engine::session::SessionHandle;
use marlinsql_engine::{ExecutionContext, PlanBuilder};

/// The SQL query engine. One instance per connected environment; cheap to
/// clone, safe to share.
#[derive(Clone)]
pub struct QueryEngine {
    remote: Arc<dyn RemoteStore>,
    metadata: Arc<MetadataCache>,
}

impl QueryEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, metadata: Arc<MetadataCache>) -> Self {
        Self { remote, metadata }
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// Parse, plan and run a statement batch, collecting all rows.
    pub async fn execute(&self, sql: &str, options: PlanOptions) -> Result<QueryResult> {
        self.execute_with_cancel(sql, options, CancellationToken::new())
            .await
    }

    /// `execute` with an external cancellation signal; the token reaches
    /// every operator and in-flight remote request.
    pub async fn execute_with_cancel(
        &self,
        sql: &str,
        options: PlanOptions,
        cancel: CancellationToken,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let (plan, ctx) = self.plan_batch(sql, options, cancel).await?;

        let executed_xml = PlanBuilder::find_fetch_xml(&plan);
        let plan_text = render_plan(&plan);

        let mut stream = plan.clone().execute(ctx.clone());
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            rows.push(row);
        }
        drop(stream);

        let mut result = QueryResult::from_rows(rows);
        result.executed_xml = executed_xml;
        result.plan = Some(plan_text);
        result.messages = ctx.take_messages();
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Streaming execution: a columns header per result shape, row batches
    /// thereafter, informational messages as they appear.
    pub fn execute_streaming(
        &self,
        sql: &str,
        options: PlanOptions,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<RowBatch>> {
        const BATCH: usize = 256;
        let engine = self.clone();
        let sql = sql.to_string();
        Box::pin(async_stream::try_stream! {
            let (plan, ctx) = engine.plan_batch(&sql, options, cancel).await?;
            let mut stream = plan.execute(ctx.clone());

            let mut header: Option<Vec<String>> = None;
            let mut batch: Vec<Row> = Vec::with_capacity(BATCH);
            while let Some(row) = stream.try_next().await? {
                for message in ctx.take_messages() {
                    yield RowBatch::Message(message);
                }
                let names: Vec<String> = row.column_names().map(str::to_string).collect();
                if header.as_ref() != Some(&names) {
                    if !batch.is_empty() {
                        yield RowBatch::Rows(std::mem::take(&mut batch));
                    }
                    header = Some(names.clone());
                    yield RowBatch::Columns(
                        row.iter()
                            .map(|(name, value)| ColumnInfo::new(name, value.type_name()))
                            .collect(),
                    );
                }
                batch.push(row);
                if batch.len() >= BATCH {
                    yield RowBatch::Rows(std::mem::take(&mut batch));
                }
            }
            if !batch.is_empty() {
                yield RowBatch::Rows(batch);
            }
            for message in ctx.take_messages() {
                yield RowBatch::Message(message);
            }
        })
    }

    /// The plan tree for a batch, with no side effects.
    pub async fn explain(&self, sql: &str, options: PlanOptions) -> Result<Vec<PlanDescription>> {
        let statements = marlinsql_parser::parse(sql)?;
        let session = SessionHandle::new();
        let mut builder =
            PlanBuilder::new(self.metadata.clone(), Arc::new(options), session);
        builder.prepare(&*self.remote, &statements).await?;
        statements
            .iter()
            .map(|statement| Ok(describe_plan(&builder.build_statement(statement)?)))
            .collect()
    }

    /// The fetch XML generated for the statement's default scan subtree,
    /// without executing anything.
    pub async fn transpile(&self, sql: &str, options: PlanOptions) -> Result<String> {
        let statements = marlinsql_parser::parse(sql)?;
        let statement = statements
            .first()
            .ok_or_else(|| Error::plan("empty batch"))?;
        let session = SessionHandle::new();
        let mut builder =
            PlanBuilder::new(self.metadata.clone(), Arc::new(options), session);
        builder.prepare(&*self.remote, &statements).await?;
        let plan = builder.build_statement(statement)?;
        PlanBuilder::find_fetch_xml(&plan).ok_or_else(|| {
            Error::plan("the statement has no pushed-down fetch scan to transpile")
        })
    }

    async fn plan_batch(
        &self,
        sql: &str,
        options: PlanOptions,
        cancel: CancellationToken,
    ) -> Result<(marlinsql_engine::PlanNodeRef, ExecutionContext)> {
        let statements = marlinsql_parser::parse(sql)?;
        if statements.is_empty() {
            return Err(Error::plan("empty batch"));
        }
        let session = SessionHandle::new();
        let options = Arc::new(options);
        session.set_caller_id(None);

        let mut builder =
            PlanBuilder::new(self.metadata.clone(), options.clone(), session.clone());
        builder.prepare(&*self.remote, &statements).await?;
        let plan = builder.build_batch(&statements)?;

        let mut ctx = ExecutionContext::new(
            self.remote.clone(),
            self.metadata.clone(),
            session,
            options,
        );
        ctx.cancel = cancel;
        Ok((plan, ctx))
    }
}
