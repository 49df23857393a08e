//! The plan builder: walks the syntax tree bottom-up and produces the
//! operator tree, routing each SELECT subtree among the metadata virtual
//! tables, the tabular pass-through, the partitioned aggregate rewrite and
//! the default fetch scan with client-side wrappers.

mod dml;
mod pushdown;
mod select;
mod subquery;
mod tabular;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use marlinsql_common::error::{Error, Result};
use marlinsql_common::metadata::MetadataCache;
use marlinsql_ir::{Cte, Expr, Query, QueryBody, Select, SelectItem, Statement, StatementKind, TableSource};

use crate::eval::ExprCompiler;
use crate::exec::script::{
    AssignFromQuery, AssignVariable, BreakLoop, Conditional, ContinueLoop, CreateTempTable,
    DeclareVariables, DropTables, ExecuteAs, ExecuteMessage, PrintMessage, Revert, Script,
    SubqueryBind, SubqueryBinding, TryCatch, WhileLoop,
};
use crate::exec::tabular::TabularScan;
use crate::exec::PlanNodeRef;
use crate::explain::format_expr;
use crate::options::{limits, PlanOptions};
use crate::remote::RemoteStore;
use crate::session::SessionHandle;

/// Planning estimates gathered before building: stale record counts and
/// timestamp ranges for the entities that may need the partitioned rewrite.
#[derive(Default)]
pub struct Estimates {
    counts: HashMap<String, i64>,
    ranges: HashMap<String, (DateTime<Utc>, DateTime<Utc>)>,
}

impl Estimates {
    pub fn count(&self, entity: &str) -> Option<i64> {
        self.counts.get(&entity.to_lowercase()).copied()
    }

    pub fn range(&self, entity: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.ranges.get(&entity.to_lowercase()).copied()
    }
}

/// Name resolution scope for one query nesting level: visible CTEs plus the
/// statement-wide counter for internal subquery bind variables.
pub struct Scope<'a> {
    ctes: Vec<&'a Cte>,
    parent: Option<&'a Scope<'a>>,
    binds: &'a Cell<usize>,
}

impl<'a> Scope<'a> {
    fn root(binds: &'a Cell<usize>) -> Self {
        Scope {
            ctes: Vec::new(),
            parent: None,
            binds,
        }
    }

    pub(crate) fn with_ctes(&'a self, ctes: &'a [Cte]) -> Scope<'a> {
        Scope {
            ctes: ctes.iter().collect(),
            parent: Some(self),
            binds: self.binds,
        }
    }

    pub(crate) fn cte(&self, name: &str) -> Option<&'a Cte> {
        self.ctes
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .copied()
            .or_else(|| self.parent.and_then(|p| p.cte(name)))
    }

    pub(crate) fn bind_counter(&self) -> usize {
        self.binds.get()
    }

    pub(crate) fn store_bind_counter(&self, value: usize) {
        self.binds.set(value);
    }
}

pub struct PlanBuilder {
    pub(crate) metadata: Arc<MetadataCache>,
    pub(crate) options: Arc<PlanOptions>,
    pub(crate) compiler: ExprCompiler,
    pub(crate) estimates: Estimates,
}

impl PlanBuilder {
    pub fn new(
        metadata: Arc<MetadataCache>,
        options: Arc<PlanOptions>,
        session: SessionHandle,
    ) -> Self {
        Self {
            metadata,
            options,
            compiler: ExprCompiler::new(session),
            estimates: Estimates::default(),
        }
    }

    /// Gather planning estimates for every entity that appears under an
    /// aggregate. Separated from building so the builder itself stays
    /// synchronous and deterministic.
    pub async fn prepare(&mut self, remote: &dyn RemoteStore, statements: &[Statement]) -> Result<()> {
        let mut entities = Vec::new();
        for statement in statements {
            collect_aggregate_entities(statement, &mut entities);
        }
        for entity in entities {
            let key = entity.to_lowercase();
            if self.estimates.counts.contains_key(&key) {
                continue;
            }
            let count = match self.options.estimated_record_count {
                Some(count) => count,
                None => remote.total_record_count(&key).await.unwrap_or(-1),
            };
            self.estimates.counts.insert(key.clone(), count);
            if count > limits::AGGREGATE_RECORD_CAP {
                let range = match (self.options.min_timestamp, self.options.max_timestamp) {
                    (Some(min), Some(max)) => Some((min, max)),
                    _ => {
                        let column = self
                            .metadata
                            .entity(&key)
                            .and_then(|meta| meta.created_on_attribute.clone())
                            .unwrap_or_else(|| "createdon".to_string());
                        match remote.min_max_timestamp(&key, &column).await {
                            Ok((Some(min), Some(max))) => Some((min, max)),
                            _ => None,
                        }
                    }
                };
                if let Some(range) = range {
                    self.estimates.ranges.insert(key, range);
                }
            }
        }
        Ok(())
    }

    /// Build the whole batch as one `Script` plan over the shared session.
    pub fn build_batch(&self, statements: &[Statement]) -> Result<PlanNodeRef> {
        let nodes = statements
            .iter()
            .map(|statement| self.build_statement(statement))
            .collect::<Result<Vec<_>>>()?;
        if nodes.len() == 1 {
            Ok(nodes.into_iter().next().expect("one statement"))
        } else {
            Ok(Arc::new(Script { statements: nodes }))
        }
    }

    pub fn build_statement(&self, statement: &Statement) -> Result<PlanNodeRef> {
        let binds = Cell::new(0usize);
        let scope = Scope::root(&binds);
        self.build_statement_in(statement, &scope)
    }

    fn build_statement_in(&self, statement: &Statement, scope: &Scope<'_>) -> Result<PlanNodeRef> {
        match &statement.kind {
            StatementKind::Select {
                query,
                into_variables,
            } => self.build_select_statement(statement, query, into_variables, scope),
            StatementKind::Insert { .. }
            | StatementKind::Update { .. }
            | StatementKind::Delete { .. }
            | StatementKind::Merge { .. } => dml::build_dml(self, statement, scope),
            StatementKind::Declare { declarations } => {
                let declarations = declarations
                    .iter()
                    .map(|(name, ty, init)| {
                        Ok((
                            name.clone(),
                            ty.clone(),
                            init.as_ref()
                                .map(|e| self.compiler.compile_scalar(e))
                                .transpose()?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(DeclareVariables { declarations }))
            }
            StatementKind::SetVariable { name, value } => {
                let (value, bindings) = self.expr_with_binds(value, scope)?;
                let assign: PlanNodeRef = Arc::new(AssignVariable {
                    name: name.clone(),
                    value: self.compiler.compile_scalar(&value)?,
                });
                Ok(self.wrap_bindings(assign, bindings))
            }
            StatementKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let label = format_expr(condition);
                let (condition, bindings) = self.expr_with_binds(condition, scope)?;
                let node: PlanNodeRef = Arc::new(Conditional {
                    condition: self.compiler.compile_predicate(&condition)?,
                    then_branch: self.build_block(then_branch, scope)?,
                    else_branch: match else_branch {
                        Some(block) => self.build_block(block, scope)?,
                        None => Vec::new(),
                    },
                    label,
                });
                Ok(self.wrap_bindings(node, bindings))
            }
            StatementKind::While { condition, body } => {
                let label = format_expr(condition);
                let (condition, bindings) = self.expr_with_binds(condition, scope)?;
                Ok(Arc::new(WhileLoop {
                    condition: self.compiler.compile_predicate(&condition)?,
                    bindings,
                    body: self.build_block(body, scope)?,
                    label,
                }))
            }
            StatementKind::TryCatch {
                try_block,
                catch_block,
            } => Ok(Arc::new(TryCatch {
                try_block: self.build_block(try_block, scope)?,
                catch_block: self.build_block(catch_block, scope)?,
            })),
            StatementKind::Block(statements) => Ok(Arc::new(Script {
                statements: self.build_block(statements, scope)?,
            })),
            StatementKind::Break => Ok(Arc::new(BreakLoop)),
            StatementKind::Continue => Ok(Arc::new(ContinueLoop)),
            StatementKind::Print(message) => {
                let (message, bindings) = self.expr_with_binds(message, scope)?;
                let node: PlanNodeRef = Arc::new(PrintMessage {
                    message: self.compiler.compile_scalar(&message)?,
                });
                Ok(self.wrap_bindings(node, bindings))
            }
            StatementKind::ExecuteAs { user } => Ok(Arc::new(ExecuteAs {
                user: self.compiler.compile_scalar(user)?,
            })),
            StatementKind::Revert => Ok(Arc::new(Revert)),
            StatementKind::Execute { procedure, .. } => Ok(Arc::new(ExecuteMessage {
                procedure: procedure.clone(),
            })),
            StatementKind::CreateTempTable { name, columns } => Ok(Arc::new(CreateTempTable {
                name: name.clone(),
                columns: columns.clone(),
            })),
            StatementKind::DropTables { names, if_exists } => Ok(Arc::new(DropTables {
                names: names.clone(),
                if_exists: *if_exists,
            })),
        }
    }

    fn build_select_statement(
        &self,
        statement: &Statement,
        query: &Query,
        into_variables: &[String],
        scope: &Scope<'_>,
    ) -> Result<PlanNodeRef> {
        // Tabular pass-through runs the caller's SQL verbatim when requested
        // and compatible.
        if self.options.use_tabular_endpoint
            && into_variables.is_empty()
            && tabular::compatible(query, scope)
        {
            return Ok(Arc::new(TabularScan {
                sql: statement.sql.clone(),
                max_rows: self.options.max_rows,
            }));
        }

        let node = select::build_query(self, query, scope)?;
        if into_variables.is_empty() {
            return Ok(node);
        }
        let assignments = into_variables
            .iter()
            .map(|variable| (variable.clone(), variable.trim_start_matches('@').to_string()))
            .collect();
        Ok(Arc::new(AssignFromQuery {
            input: node,
            assignments,
        }))
    }

    fn build_block(&self, statements: &[Statement], scope: &Scope<'_>) -> Result<Vec<PlanNodeRef>> {
        statements
            .iter()
            .map(|statement| self.build_statement_in(statement, scope))
            .collect()
    }

    /// Rewrite uncorrelated subqueries in a scalar context into pre-executed
    /// bindings.
    fn expr_with_binds(
        &self,
        expr: &Expr,
        scope: &Scope<'_>,
    ) -> Result<(Expr, Vec<SubqueryBinding>)> {
        if !expr.contains_subquery() {
            return Ok((expr.clone(), Vec::new()));
        }
        let mut counter = scope.bind_counter();
        let mut binds = Vec::new();
        let rewritten = subquery::bind_scalar_subqueries(expr, &[], &mut counter, &mut binds)?;
        scope.store_bind_counter(counter);
        let bindings = binds
            .into_iter()
            .map(|bind| {
                Ok(SubqueryBinding {
                    variable: bind.variable,
                    plan: select::build_query(self, &bind.query, scope)?,
                    exists: bind.exists,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((rewritten, bindings))
    }

    fn wrap_bindings(&self, node: PlanNodeRef, bindings: Vec<SubqueryBinding>) -> PlanNodeRef {
        if bindings.is_empty() {
            node
        } else {
            Arc::new(SubqueryBind {
                bindings,
                input: node,
            })
        }
    }

    /// The generated XML of the default scan subtree, for `transpile` and
    /// `QueryResult::executed_xml`.
    pub fn find_fetch_xml(node: &PlanNodeRef) -> Option<String> {
        if let Some(xml) = node.fetch_xml() {
            return Some(xml);
        }
        for child in node.children() {
            if let Some(xml) = Self::find_fetch_xml(&child) {
                return Some(xml);
            }
        }
        None
    }
}

fn collect_aggregate_entities(statement: &Statement, out: &mut Vec<String>) {
    match &statement.kind {
        StatementKind::Select { query, .. } => collect_from_query(query, out),
        StatementKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            for statement in then_branch {
                collect_aggregate_entities(statement, out);
            }
            if let Some(block) = else_branch {
                for statement in block {
                    collect_aggregate_entities(statement, out);
                }
            }
        }
        StatementKind::While { body, .. } => {
            for statement in body {
                collect_aggregate_entities(statement, out);
            }
        }
        StatementKind::TryCatch {
            try_block,
            catch_block,
        } => {
            for statement in try_block.iter().chain(catch_block) {
                collect_aggregate_entities(statement, out);
            }
        }
        StatementKind::Block(statements) => {
            for statement in statements {
                collect_aggregate_entities(statement, out);
            }
        }
        _ => {}
    }
}

fn collect_from_query(query: &Query, out: &mut Vec<String>) {
    for cte in &query.ctes {
        collect_from_query(&cte.query, out);
    }
    collect_from_body(&query.body, out);
}

fn collect_from_body(body: &QueryBody, out: &mut Vec<String>) {
    match body {
        QueryBody::Select(select) => collect_from_select(select, out),
        QueryBody::SetOperation { left, right, .. } => {
            collect_from_body(left, out);
            collect_from_body(right, out);
        }
    }
}

fn collect_from_select(select: &Select, out: &mut Vec<String>) {
    let has_aggregate = !select.group_by.is_empty()
        || select.projection.iter().any(|item| match item {
            SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
            SelectItem::Wildcard(_) => false,
        })
        || select
            .having
            .as_ref()
            .is_some_and(|having| having.contains_aggregate());
    if has_aggregate {
        if let Some(from) = &select.from {
            if from.joins.is_empty() {
                if let TableSource::Entity {
                    schema: None, name, ..
                } = &from.base
                {
                    if !name.starts_with('#') {
                        out.push(name.clone());
                    }
                }
            }
        }
    }
    // Subqueries in FROM and WHERE may aggregate too.
    if let Some(from) = &select.from {
        if let TableSource::Derived { query, .. } = &from.base {
            collect_from_query(query, out);
        }
        for join in &from.joins {
            if let TableSource::Derived { query, .. } = &join.source {
                collect_from_query(query, out);
            }
        }
    }
    if let Some(selection) = &select.selection {
        collect_subquery_entities(selection, out);
    }
}

fn collect_subquery_entities(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::InSubquery { subquery, .. }
        | Expr::Exists { subquery, .. }
        | Expr::ScalarSubquery(subquery) => collect_from_query(subquery, out),
        Expr::Binary { left, right, .. } => {
            collect_subquery_entities(left, out);
            collect_subquery_entities(right, out);
        }
        Expr::Unary { expr, .. } => collect_subquery_entities(expr, out),
        _ => {}
    }
}
