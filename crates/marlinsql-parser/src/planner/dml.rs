use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{
    Expr, InsertSource, Literal, MergeAction, MergeClause, MergeMatchKind, StatementKind,
};
use sqlparser::ast;

use super::{object_base_name, plan_query};
use crate::expr::plan_expr;
use crate::planner::query::plan_table_factor;

pub(crate) fn plan_insert(insert: &ast::Insert) -> Result<StatementKind> {
    let table_name = match &insert.table {
        ast::TableObject::TableName(name) => name,
        ast::TableObject::TableFunction(_) => {
            return Err(Error::not_supported("INSERT INTO TABLE FUNCTION"))
        }
    };
    let entity = object_base_name(table_name);
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let source = match &insert.source {
        Some(query) => match &*query.body {
            ast::SetExpr::Values(values) => {
                let rows = values
                    .rows
                    .iter()
                    .map(|row| row.iter().map(plan_assignment_value).collect::<Result<Vec<_>>>())
                    .collect::<Result<Vec<_>>>()?;
                InsertSource::Values(rows)
            }
            _ => InsertSource::Query(Box::new(plan_query(query)?)),
        },
        None => return Err(Error::not_supported("INSERT without a source")),
    };

    if columns.is_empty() {
        return Err(Error::plan(
            "INSERT requires an explicit column list against the remote store",
        ));
    }

    Ok(StatementKind::Insert {
        entity,
        columns,
        source,
    })
}

pub(crate) fn plan_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    has_from: bool,
    selection: Option<&ast::Expr>,
) -> Result<StatementKind> {
    if has_from {
        return Err(Error::not_supported("UPDATE ... FROM"));
    }
    if !table.joins.is_empty() {
        return Err(Error::not_supported("joined UPDATE targets"));
    }
    let (entity, alias) = entity_target(&table.relation)?;

    let assignments = assignments
        .iter()
        .map(|a| {
            let column = match &a.target {
                ast::AssignmentTarget::ColumnName(name) => object_base_name(name),
                ast::AssignmentTarget::Tuple(_) => {
                    return Err(Error::not_supported("tuple assignment targets"))
                }
            };
            Ok((column, plan_assignment_value(&a.value)?))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StatementKind::Update {
        entity,
        alias,
        assignments,
        selection: selection.map(plan_expr).transpose()?,
    })
}

pub(crate) fn plan_delete(delete: &ast::Delete) -> Result<StatementKind> {
    if !delete.tables.is_empty() {
        return Err(Error::not_supported("multi-table DELETE"));
    }
    if delete.using.is_some() {
        return Err(Error::not_supported("DELETE ... USING"));
    }
    let from = match &delete.from {
        ast::FromTable::WithFromKeyword(tables) | ast::FromTable::WithoutKeyword(tables) => tables,
    };
    let table = match from.as_slice() {
        [single] if single.joins.is_empty() => single,
        _ => return Err(Error::not_supported("joined DELETE targets")),
    };
    let (entity, alias) = entity_target(&table.relation)?;

    Ok(StatementKind::Delete {
        entity,
        alias,
        selection: delete.selection.as_ref().map(plan_expr).transpose()?,
    })
}

pub(crate) fn plan_merge(
    table: &ast::TableFactor,
    source: &ast::TableFactor,
    on: &ast::Expr,
    clauses: &[ast::MergeClause],
) -> Result<StatementKind> {
    let (entity, alias) = entity_target(table)?;
    let source = plan_table_factor(source)?;
    let on = plan_expr(on)?;

    let clauses = clauses
        .iter()
        .map(plan_merge_clause)
        .collect::<Result<Vec<_>>>()?;

    Ok(StatementKind::Merge {
        entity,
        alias,
        source,
        on,
        clauses,
    })
}

fn plan_merge_clause(clause: &ast::MergeClause) -> Result<MergeClause> {
    let kind = match clause.clause_kind {
        ast::MergeClauseKind::Matched => MergeMatchKind::Matched,
        ast::MergeClauseKind::NotMatched | ast::MergeClauseKind::NotMatchedByTarget => {
            MergeMatchKind::NotMatchedByTarget
        }
        ast::MergeClauseKind::NotMatchedBySource => MergeMatchKind::NotMatchedBySource,
    };
    let predicate = clause.predicate.as_ref().map(plan_expr).transpose()?;
    let action = match &clause.action {
        ast::MergeAction::Insert(insert) => {
            let columns = insert.columns.iter().map(|c| c.value.clone()).collect();
            let values = match &insert.kind {
                ast::MergeInsertKind::Values(values) => match values.rows.as_slice() {
                    [row] => row
                        .iter()
                        .map(plan_assignment_value)
                        .collect::<Result<Vec<_>>>()?,
                    _ => {
                        return Err(Error::plan(
                            "MERGE ... INSERT takes exactly one VALUES row",
                        ))
                    }
                },
                ast::MergeInsertKind::Row => {
                    return Err(Error::not_supported("MERGE ... INSERT ROW"))
                }
            };
            MergeAction::Insert { columns, values }
        }
        ast::MergeAction::Update { assignments } => {
            let assignments = assignments
                .iter()
                .map(|a| {
                    let column = match &a.target {
                        ast::AssignmentTarget::ColumnName(name) => object_base_name(name),
                        ast::AssignmentTarget::Tuple(_) => {
                            return Err(Error::not_supported("tuple assignment targets"))
                        }
                    };
                    Ok((column, plan_assignment_value(&a.value)?))
                })
                .collect::<Result<Vec<_>>>()?;
            MergeAction::Update { assignments }
        }
        ast::MergeAction::Delete => MergeAction::Delete,
    };
    Ok(MergeClause {
        kind,
        predicate,
        action,
    })
}

/// Assignment and VALUES positions accept DEFAULT, which the store treats as
/// clearing the attribute.
fn plan_assignment_value(expr: &ast::Expr) -> Result<Expr> {
    if let ast::Expr::Identifier(ident) = expr {
        if ident.value.eq_ignore_ascii_case("default") {
            return Ok(Expr::Literal(Literal::Null));
        }
    }
    plan_expr(expr)
}

#[allow(clippy::wildcard_enum_match_arm)]
fn entity_target(factor: &ast::TableFactor) -> Result<(String, Option<String>)> {
    match factor {
        ast::TableFactor::Table { name, alias, .. } => Ok((
            object_base_name(name),
            alias.as_ref().map(|a| a.name.value.clone()),
        )),
        other => Err(Error::not_supported(format!("DML target: {}", other))),
    }
}
