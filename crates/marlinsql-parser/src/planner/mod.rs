mod dml;
mod query;

pub(crate) use query::plan_query;

use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{CastType, StatementKind};
use sqlparser::ast;
use sqlparser::tokenizer::Location;

use crate::expr::{plan_cast_type, plan_expr};

/// Lowers sqlparser statements into the typed syntax tree. Stateless; one
/// instance per script parse.
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Planner
    }

    #[allow(clippy::wildcard_enum_match_arm)]
    pub fn plan_statement(
        &self,
        stmt: &ast::Statement,
        start: Location,
    ) -> Result<StatementKind> {
        match stmt {
            ast::Statement::Query(q) => query::plan_query_statement(q),
            ast::Statement::Insert(insert) => dml::plan_insert(insert),
            ast::Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => dml::plan_update(table, assignments, from.is_some(), selection.as_ref()),
            ast::Statement::Delete(delete) => dml::plan_delete(delete),
            ast::Statement::Merge {
                table,
                source,
                on,
                clauses,
                ..
            } => dml::plan_merge(table, source, on, clauses),
            ast::Statement::Declare { stmts } => self.plan_declare(stmts),
            ast::Statement::SetVariable {
                variables, value, ..
            } => self.plan_set(variables, value),
            ast::Statement::CreateTable(create) => self.plan_create_table(create),
            ast::Statement::Drop {
                object_type: ast::ObjectType::Table,
                if_exists,
                names,
                ..
            } => Ok(StatementKind::DropTables {
                names: names.iter().map(object_base_name).collect(),
                if_exists: *if_exists,
            }),
            ast::Statement::Execute {
                name, parameters, ..
            } => Ok(StatementKind::Execute {
                procedure: name.to_string(),
                args: parameters
                    .iter()
                    .map(plan_expr)
                    .collect::<Result<Vec<_>>>()?,
            }),
            other => Err(Error::parse_error(
                format!("unsupported statement: {}", summarize(other)),
                start.line,
                start.column,
            )),
        }
    }

    fn plan_declare(&self, stmts: &[ast::Declare]) -> Result<StatementKind> {
        let mut declarations = Vec::new();
        for decl in stmts {
            let data_type = decl
                .data_type
                .as_ref()
                .ok_or_else(|| Error::plan("DECLARE requires a data type"))?;
            let ty = plan_cast_type(data_type)?;
            let init = match &decl.assignment {
                Some(assignment) => Some(declare_value(assignment)?),
                None => None,
            };
            for name in &decl.names {
                declarations.push((name.value.clone(), ty.clone(), init.clone()));
            }
        }
        Ok(StatementKind::Declare { declarations })
    }

    fn plan_set(
        &self,
        variables: &ast::OneOrManyWithParens<ast::ObjectName>,
        value: &[ast::Expr],
    ) -> Result<StatementKind> {
        let name = match variables {
            ast::OneOrManyWithParens::One(name) => name.to_string(),
            ast::OneOrManyWithParens::Many(_) => {
                return Err(Error::not_supported("SET with multiple variables"))
            }
        };
        if !name.starts_with('@') {
            return Err(Error::not_supported(format!("SET option {}", name)));
        }
        let value = value
            .first()
            .ok_or_else(|| Error::plan("SET requires a value"))?;
        Ok(StatementKind::SetVariable {
            name,
            value: plan_expr(value)?,
        })
    }

    fn plan_create_table(&self, create: &ast::CreateTable) -> Result<StatementKind> {
        let name = object_base_name(&create.name);
        if !name.starts_with('#') {
            return Err(Error::not_supported(
                "CREATE TABLE is only supported for session temp tables (#name)",
            ));
        }
        let columns = create
            .columns
            .iter()
            .map(|col| Ok((col.name.value.clone(), plan_cast_type(&col.data_type)?)))
            .collect::<Result<Vec<(String, CastType)>>>()?;
        Ok(StatementKind::CreateTempTable { name, columns })
    }
}

impl Default for Planner {
    fn default() -> Self {
        Planner::new()
    }
}

#[allow(clippy::wildcard_enum_match_arm)]
fn declare_value(assignment: &ast::DeclareAssignment) -> Result<marlinsql_ir::Expr> {
    match assignment {
        ast::DeclareAssignment::MsSqlAssignment(e)
        | ast::DeclareAssignment::Expr(e)
        | ast::DeclareAssignment::Default(e) => plan_expr(e),
        other => Err(Error::not_supported(format!(
            "DECLARE initializer: {}",
            other
        ))),
    }
}

pub(crate) fn object_base_name(name: &ast::ObjectName) -> String {
    name.0
        .last()
        .map(|i| i.value.clone())
        .unwrap_or_default()
}

pub(crate) fn object_schema_and_name(name: &ast::ObjectName) -> Result<(Option<String>, String)> {
    match name.0.as_slice() {
        [n] => Ok((None, n.value.clone())),
        [s, n] => Ok((Some(s.value.clone()), n.value.clone())),
        _ => Err(Error::not_supported(format!(
            "three-part table name {}",
            name
        ))),
    }
}

fn summarize(stmt: &ast::Statement) -> String {
    let text = stmt.to_string();
    let head: String = text.chars().take(40).collect();
    if head.len() < text.len() {
        format!("{}...", head)
    } else {
        head
    }
}
