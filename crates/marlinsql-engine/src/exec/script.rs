use std::sync::Arc;

use async_stream::try_stream;
use futures::TryStreamExt;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{QueryValue, Row};
use marlinsql_ir::CastType;

use crate::context::ExecutionContext;
use crate::eval::{cast, CompiledPredicate, CompiledScalar};
use crate::exec::{PlanNodeRef, QueryPlanNode, RowStream};
use crate::session::LoopSignal;

/// Drive a sequence of statement plans in order, forwarding their rows.
/// Stops early when a BREAK/CONTINUE signal is pending so it can surface to
/// the enclosing loop.
async fn run_sequence(
    nodes: &[PlanNodeRef],
    ctx: &ExecutionContext,
    sink: &tokio::sync::mpsc::Sender<Result<Row>>,
) -> Result<()> {
    for node in nodes {
        ctx.ensure_active()?;
        let mut stream = node.clone().execute(ctx.clone());
        while let Some(row) = stream.try_next().await? {
            ctx.ensure_active()?;
            if sink.send(Ok(row)).await.is_err() {
                return Err(Error::Cancelled);
            }
        }
        if ctx.session.peek_loop_signal().is_some() {
            return Ok(());
        }
    }
    Ok(())
}

/// Channel-backed adapter turning the imperative statement driver into a row
/// stream.
fn sequence_stream(
    nodes: Vec<PlanNodeRef>,
    ctx: ExecutionContext,
    run: impl FnOnce(
            Vec<PlanNodeRef>,
            ExecutionContext,
            tokio::sync::mpsc::Sender<Result<Row>>,
        ) -> futures::future::BoxFuture<'static, Result<()>>
        + Send
        + 'static,
) -> RowStream {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Row>>(64);
    let driver_ctx = ctx.clone();
    tokio::spawn(async move {
        let failing = tx.clone();
        if let Err(e) = run(nodes, driver_ctx, tx).await {
            let _ = failing.send(Err(e)).await;
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

/// Runs child statement plans in order against a shared session.
/// Short-circuits on the first unhandled error.
pub struct Script {
    pub statements: Vec<PlanNodeRef>,
}

impl QueryPlanNode for Script {
    fn describe(&self) -> String {
        format!("Script({} statements)", self.statements.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        self.statements.clone()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        sequence_stream(self.statements.clone(), ctx, |nodes, ctx, sink| {
            Box::pin(async move {
                run_sequence(&nodes, &ctx, &sink).await?;
                // A stray BREAK/CONTINUE outside a loop is dropped.
                ctx.session.take_loop_signal();
                Ok(())
            })
        })
    }
}

/// IF / ELSE.
pub struct Conditional {
    pub condition: CompiledPredicate,
    pub then_branch: Vec<PlanNodeRef>,
    pub else_branch: Vec<PlanNodeRef>,
    pub label: String,
}

impl QueryPlanNode for Conditional {
    fn describe(&self) -> String {
        format!("If({})", self.label)
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        let mut all = self.then_branch.clone();
        all.extend(self.else_branch.clone());
        all
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let node = self.clone();
        sequence_stream(Vec::new(), ctx, move |_, ctx, sink| {
            Box::pin(async move {
                let branch = if (node.condition)(&Row::new())? {
                    &node.then_branch
                } else {
                    &node.else_branch
                };
                run_sequence(branch, &ctx, &sink).await
            })
        })
    }
}

/// WHILE, with BREAK/CONTINUE observed through the session's loop signal.
/// Condition subqueries re-resolve before every iteration.
pub struct WhileLoop {
    pub condition: CompiledPredicate,
    pub bindings: Vec<SubqueryBinding>,
    pub body: Vec<PlanNodeRef>,
    pub label: String,
}

impl QueryPlanNode for WhileLoop {
    fn describe(&self) -> String {
        format!("While({})", self.label)
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        self.body.clone()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let node = self.clone();
        sequence_stream(Vec::new(), ctx, move |_, ctx, sink| {
            Box::pin(async move {
                loop {
                    ctx.ensure_active()?;
                    for binding in &node.bindings {
                        resolve_binding(binding, &ctx).await?;
                    }
                    if !(node.condition)(&Row::new())? {
                        break;
                    }
                    run_sequence(&node.body, &ctx, &sink).await?;
                    match ctx.session.take_loop_signal() {
                        Some(LoopSignal::Break) => break,
                        Some(LoopSignal::Continue) | None => continue,
                    }
                }
                Ok(())
            })
        })
    }
}

/// Maps an engine error onto a T-SQL-style error number for `@@ERROR`.
fn error_number(error: &Error) -> i64 {
    match error {
        Error::TypeMismatch { .. } => 245,
        Error::ExecutionFailed(message) if message.contains("division by zero") => 8134,
        Error::DmlRowCapExceeded { .. } => 50001,
        _ => 50000,
    }
}

/// BEGIN TRY / BEGIN CATCH. Entering the catch block sets the session error
/// state; a successful try block clears it. Cancellation is always rethrown.
pub struct TryCatch {
    pub try_block: Vec<PlanNodeRef>,
    pub catch_block: Vec<PlanNodeRef>,
}

impl QueryPlanNode for TryCatch {
    fn describe(&self) -> String {
        "TryCatch".to_string()
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        let mut all = self.try_block.clone();
        all.extend(self.catch_block.clone());
        all
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let node = self.clone();
        sequence_stream(Vec::new(), ctx, move |_, ctx, sink| {
            Box::pin(async move {
                match run_sequence(&node.try_block, &ctx, &sink).await {
                    Ok(()) => {
                        ctx.session.clear_error();
                        Ok(())
                    }
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(error) => {
                        tracing::debug!(target: "marlinsql::script", %error, "caught by TRY/CATCH");
                        ctx.session.set_error(error_number(&error), error.to_string());
                        run_sequence(&node.catch_block, &ctx, &sink).await
                    }
                }
            })
        })
    }
}

/// DECLARE: registers variables, initializing with a cast of the initial
/// expression or null.
pub struct DeclareVariables {
    pub declarations: Vec<(String, CastType, Option<CompiledScalar>)>,
}

impl QueryPlanNode for DeclareVariables {
    fn describe(&self) -> String {
        let names: Vec<&str> = self
            .declarations
            .iter()
            .map(|(n, _, _)| n.as_str())
            .collect();
        format!("Declare({})", names.join(", "))
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            for (name, ty, init) in &self.declarations {
                ctx.ensure_active()?;
                let value = match init {
                    Some(scalar) => cast::cast_value(scalar(&Row::new())?, ty, false, None)?,
                    None => QueryValue::Null,
                };
                ctx.session.declare(name, ty.clone(), value);
            }
            Ok(())
        })
    }
}

/// SET @var = expr, casting to the declared type.
pub struct AssignVariable {
    pub name: String,
    pub value: CompiledScalar,
}

impl QueryPlanNode for AssignVariable {
    fn describe(&self) -> String {
        format!("Set({})", self.name)
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            ctx.ensure_active()?;
            let mut value = (self.value)(&Row::new())?;
            if let Some(ty) = ctx.session.variable_type(&self.name) {
                value = cast::cast_value(value, &ty, false, None)?;
            }
            ctx.session.set_variable(&self.name, value)
        })
    }
}

/// SELECT @x = expr ...: drives the query and assigns from the last row.
pub struct AssignFromQuery {
    pub input: PlanNodeRef,
    /// variable name -> projected column name
    pub assignments: Vec<(String, String)>,
}

impl QueryPlanNode for AssignFromQuery {
    fn describe(&self) -> String {
        let names: Vec<&str> = self.assignments.iter().map(|(v, _)| v.as_str()).collect();
        format!("SelectAssign({})", names.join(", "))
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        vec![self.input.clone()]
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            let mut last: Option<Row> = None;
            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                last = Some(row);
            }
            // Variables keep their values when the query returns no rows.
            if let Some(row) = last {
                for (variable, column) in &self.assignments {
                    let mut value = row.get(column).cloned().unwrap_or(QueryValue::Null);
                    if let Some(ty) = ctx.session.variable_type(variable) {
                        value = cast::cast_value(value, &ty, false, None)?;
                    }
                    ctx.session.set_variable(variable, value)?;
                }
            }
            Ok(())
        })
    }
}

pub struct PrintMessage {
    pub message: CompiledScalar,
}

impl QueryPlanNode for PrintMessage {
    fn describe(&self) -> String {
        "Print".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            ctx.ensure_active()?;
            let value = (self.message)(&Row::new())?;
            ctx.info(value.display_text());
            Ok(())
        })
    }
}

pub struct BreakLoop;

impl QueryPlanNode for BreakLoop {
    fn describe(&self) -> String {
        "Break".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        ctx.session.raise_loop_signal(LoopSignal::Break);
        Box::pin(futures::stream::empty())
    }
}

pub struct ContinueLoop;

impl QueryPlanNode for ContinueLoop {
    fn describe(&self) -> String {
        "Continue".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        ctx.session.raise_loop_signal(LoopSignal::Continue);
        Box::pin(futures::stream::empty())
    }
}

/// EXECUTE AS: only mutates the session caller id, and only when the caller
/// supplied a pre-resolved impersonation id in the options.
pub struct ExecuteAs {
    pub user: CompiledScalar,
}

impl QueryPlanNode for ExecuteAs {
    fn describe(&self) -> String {
        "ExecuteAs".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            ctx.ensure_active()?;
            let requested = (self.user)(&Row::new())?;
            match ctx.options.caller_id {
                Some(id) => {
                    tracing::debug!(target: "marlinsql::script", user = %requested, caller = %id, "impersonate");
                    ctx.session.set_caller_id(Some(id));
                    Ok(())
                }
                None => Err(Error::not_supported(
                    "EXECUTE AS requires a pre-resolved caller id in the statement options",
                )),
            }
        })
    }
}

pub struct Revert;

impl QueryPlanNode for Revert {
    fn describe(&self) -> String {
        "Revert".to_string()
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        ctx.session.set_caller_id(None);
        Box::pin(futures::stream::empty())
    }
}

/// EXECUTE <procedure>: reserved; the engine has no message pipeline.
pub struct ExecuteMessage {
    pub procedure: String,
}

impl QueryPlanNode for ExecuteMessage {
    fn describe(&self) -> String {
        format!("Execute({})", self.procedure)
    }

    fn execute(self: Arc<Self>, _ctx: ExecutionContext) -> RowStream {
        crate::exec::error_stream(Error::not_supported(format!(
            "EXECUTE {}: stored procedures are not available on the remote store",
            self.procedure
        )))
    }
}

pub struct CreateTempTable {
    pub name: String,
    pub columns: Vec<(String, CastType)>,
}

impl QueryPlanNode for CreateTempTable {
    fn describe(&self) -> String {
        format!("CreateTempTable({})", self.name)
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            ctx.ensure_active()?;
            ctx.session.create_temp_table(&self.name, self.columns.clone())
        })
    }
}

pub struct DropTables {
    pub names: Vec<String>,
    pub if_exists: bool,
}

impl QueryPlanNode for DropTables {
    fn describe(&self) -> String {
        format!("DropTables({})", self.names.join(", "))
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        crate::exec::effect_stream(async move {
            for name in &self.names {
                ctx.ensure_active()?;
                if !name.starts_with('#') {
                    return Err(Error::not_supported(
                        "DROP TABLE applies only to session temp tables",
                    ));
                }
                let dropped = ctx.session.drop_temp_table(name);
                if !dropped && !self.if_exists {
                    return Err(Error::execution(format!(
                        "temp table {} does not exist",
                        name
                    )));
                }
            }
            Ok(())
        })
    }
}

/// Pre-executes uncorrelated subqueries and binds their results to internal
/// session variables before the wrapped plan runs.
pub struct SubqueryBind {
    pub bindings: Vec<SubqueryBinding>,
    pub input: PlanNodeRef,
}

pub struct SubqueryBinding {
    pub variable: String,
    pub plan: PlanNodeRef,
    pub exists: bool,
}

/// Run one binding's subplan and store its result in the session.
pub(crate) async fn resolve_binding(
    binding: &SubqueryBinding,
    ctx: &ExecutionContext,
) -> Result<()> {
    ctx.ensure_active()?;
    let mut stream = binding.plan.clone().execute(ctx.clone());
    let first = stream.try_next().await?;
    let value = if binding.exists {
        QueryValue::Bool(first.is_some())
    } else {
        match &first {
            Some(row) => {
                if stream.try_next().await?.is_some() {
                    return Err(Error::execution(
                        "scalar subquery returned more than one row",
                    ));
                }
                row.get_at(0).cloned().unwrap_or(QueryValue::Null)
            }
            None => QueryValue::Null,
        }
    };
    ctx.session
        .declare(&binding.variable, CastType::Text { length: None }, value);
    Ok(())
}

impl QueryPlanNode for SubqueryBind {
    fn describe(&self) -> String {
        format!("SubqueryBind({} subqueries)", self.bindings.len())
    }

    fn children(&self) -> Vec<PlanNodeRef> {
        let mut all: Vec<PlanNodeRef> = self.bindings.iter().map(|b| b.plan.clone()).collect();
        all.push(self.input.clone());
        all
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        Box::pin(try_stream! {
            for binding in &self.bindings {
                resolve_binding(binding, &ctx).await?;
            }

            let mut input = self.input.clone().execute(ctx.clone());
            while let Some(row) = input.try_next().await? {
                ctx.ensure_active()?;
                yield row;
            }
        })
    }
}
