use marlinsql_ir::{Expr, Query, QueryBody, Select, SelectItem, TableSource};

use crate::plan::Scope;

/// Compatibility check for the tabular pass-through: the endpoint rejects
/// session temp tables, the metadata virtual schema, table-valued functions
/// and variable references, and never sees CTE names defined client-side.
pub(crate) fn compatible(query: &Query, scope: &Scope<'_>) -> bool {
    query_compatible(query, scope)
}

fn query_compatible(query: &Query, scope: &Scope<'_>) -> bool {
    if !query.ctes.iter().all(|cte| query_compatible(&cte.query, scope)) {
        return false;
    }
    body_compatible(&query.body, scope)
        && query.order_by.iter().all(|s| expr_compatible(&s.expr))
        && query.offset.as_ref().map_or(true, expr_compatible)
        && query.fetch.as_ref().map_or(true, expr_compatible)
}

fn body_compatible(body: &QueryBody, scope: &Scope<'_>) -> bool {
    match body {
        QueryBody::Select(select) => select_compatible(select, scope),
        QueryBody::SetOperation { left, right, .. } => {
            body_compatible(left, scope) && body_compatible(right, scope)
        }
    }
}

fn select_compatible(select: &Select, scope: &Scope<'_>) -> bool {
    if let Some(from) = &select.from {
        if !source_compatible(&from.base, scope) {
            return false;
        }
        for join in &from.joins {
            if !source_compatible(&join.source, scope) {
                return false;
            }
            if !join.condition.as_ref().map_or(true, expr_compatible) {
                return false;
            }
        }
    }
    select.projection.iter().all(|item| match item {
        SelectItem::Expr { expr, .. } => expr_compatible(expr),
        SelectItem::Wildcard(_) => true,
    }) && select.selection.as_ref().map_or(true, expr_compatible)
        && select.group_by.iter().all(expr_compatible)
        && select.having.as_ref().map_or(true, expr_compatible)
}

fn source_compatible(source: &TableSource, scope: &Scope<'_>) -> bool {
    match source {
        TableSource::Entity { schema, name, .. } => {
            !name.starts_with('#')
                && scope.cte(name).is_none()
                && !schema
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case("metadata"))
        }
        TableSource::Derived { query, .. } => query_compatible(query, scope),
        TableSource::OpenJson { .. } | TableSource::StringSplit { .. } => false,
    }
}

fn expr_compatible(expr: &Expr) -> bool {
    let mut ok = true;
    expr.walk(&mut |e| {
        if matches!(e, Expr::Variable(_)) {
            ok = false;
        }
    });
    ok
}
