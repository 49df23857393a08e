use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_fetchxml::{FetchAttribute, FetchEntity, FetchQuery};
use marlinsql_ir::{
    ColumnRef, Expr, InsertSource, MergeAction, MergeClause, MergeMatchKind, Statement,
    StatementKind, TableSource,
};

use crate::exec::dml::{DmlExecute, TempTableInsert, TempTableMutate};
use crate::exec::filter::{ClientFilter, Project, ProjectItem, QualifyColumns, RenameColumns};
use crate::exec::join::{HashJoin, JoinSemantics};
use crate::exec::scan::{ConstantScan, FetchScan};
use crate::exec::PlanNodeRef;
use crate::explain::format_expr;
use crate::guard::{check_unrestricted_dml, DmlKind};
use crate::plan::pushdown::split_predicate;
use crate::plan::select::build_query;
use crate::plan::{PlanBuilder, Scope};
use crate::remote::DmlOperation;

pub(crate) fn build_dml(
    builder: &PlanBuilder,
    statement: &Statement,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    match &statement.kind {
        StatementKind::Insert {
            entity,
            columns,
            source,
        } => build_insert(builder, entity, columns, source, scope),
        StatementKind::Update {
            entity,
            alias,
            assignments,
            selection,
        } => build_update(builder, entity, alias.as_deref(), assignments, selection.as_ref()),
        StatementKind::Delete {
            entity,
            alias,
            selection,
        } => build_delete(builder, entity, alias.as_deref(), selection.as_ref()),
        StatementKind::Merge {
            entity,
            alias,
            source,
            on,
            clauses,
        } => build_merge(builder, entity, alias.as_deref(), source, on, clauses, scope),
        _ => unreachable!("dispatched by build_statement"),
    }
}

fn build_insert(
    builder: &PlanBuilder,
    entity: &str,
    columns: &[String],
    source: &InsertSource,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    let input: PlanNodeRef = match source {
        InsertSource::Values(rows) => {
            let compiled = rows
                .iter()
                .map(|row| {
                    if row.len() != columns.len() {
                        return Err(Error::plan(format!(
                            "INSERT has {} columns but a VALUES row has {}",
                            columns.len(),
                            row.len()
                        )));
                    }
                    row.iter()
                        .map(|expr| builder.compiler.compile_scalar(expr))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?;
            Arc::new(ConstantScan {
                columns: columns.to_vec(),
                rows: compiled,
            })
        }
        InsertSource::Query(query) => {
            let node = build_query(builder, query, scope)?;
            Arc::new(RenameColumns {
                input: node,
                names: columns.to_vec(),
            })
        }
    };

    if entity.starts_with('#') {
        return Ok(Arc::new(TempTableInsert {
            name: entity.to_string(),
            input,
        }));
    }

    Ok(Arc::new(DmlExecute {
        input,
        operation: DmlOperation::Insert,
        entity: entity.to_lowercase(),
    }))
}

/// The scan feeding UPDATE/DELETE: projects the primary key plus every
/// referenced attribute; the pushable predicate part rides in the XML and
/// the residual becomes a client filter.
fn build_target_scan(
    builder: &PlanBuilder,
    entity: &str,
    alias: &str,
    primary_key: &str,
    referenced: &[String],
    selection: Option<&Expr>,
) -> Result<PlanNodeRef> {
    let mut fetch_entity = FetchEntity::new(entity.to_lowercase());
    let mut attributes = vec![primary_key.to_string()];
    for column in referenced {
        let column = column.to_lowercase();
        if !attributes.contains(&column) {
            attributes.push(column);
        }
    }
    for attribute in &attributes {
        fetch_entity
            .attributes
            .push(FetchAttribute::plain(attribute.clone()));
    }

    let split = split_predicate(selection, alias);
    fetch_entity.filter = split.filter;

    let mut scan = FetchScan::new(entity.to_lowercase(), FetchQuery::new(fetch_entity));
    scan.estimated = builder.estimates.count(entity).unwrap_or(-1);
    let mut node: PlanNodeRef = Arc::new(scan);

    if let Some(residual) = &split.residual {
        node = Arc::new(ClientFilter {
            input: node,
            label: format_expr(residual),
            predicate: builder.compiler.compile_predicate(residual)?,
        });
    }
    Ok(node)
}

fn referenced_attributes(exprs: impl IntoIterator<Item = Expr>) -> Vec<String> {
    let mut out = Vec::new();
    for expr in exprs {
        for column in expr.referenced_columns() {
            let name = column.name.to_lowercase();
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

fn primary_key_of(builder: &PlanBuilder, entity: &str) -> String {
    builder
        .metadata
        .entity(entity)
        .map(|meta| meta.primary_key.clone())
        .unwrap_or_else(|| format!("{}id", entity.to_lowercase()))
}

fn build_update(
    builder: &PlanBuilder,
    entity: &str,
    alias: Option<&str>,
    assignments: &[(String, Expr)],
    selection: Option<&Expr>,
) -> Result<PlanNodeRef> {
    if entity.starts_with('#') {
        return Ok(Arc::new(TempTableMutate {
            name: entity.to_string(),
            assignments: assignments
                .iter()
                .map(|(column, expr)| {
                    Ok((column.clone(), builder.compiler.compile_scalar(expr)?))
                })
                .collect::<Result<Vec<_>>>()?,
            predicate: selection
                .map(|expr| builder.compiler.compile_predicate(expr))
                .transpose()?,
            delete: false,
        }));
    }

    check_unrestricted_dml(DmlKind::Update, entity, selection.is_some(), &builder.options)?;

    let alias = alias.unwrap_or(entity);
    let primary_key = primary_key_of(builder, entity);
    let mut referenced = referenced_attributes(
        assignments
            .iter()
            .map(|(_, expr)| expr.clone())
            .chain(selection.cloned()),
    );
    referenced.extend(assignments.iter().map(|(column, _)| column.to_lowercase()));

    let scan = build_target_scan(builder, entity, alias, &primary_key, &referenced, selection)?;

    // Row shape submitted to the store: primary key plus assigned attributes.
    let mut items = vec![ProjectItem::Column {
        name: primary_key.clone(),
        scalar: builder
            .compiler
            .compile_scalar(&Expr::Column(ColumnRef::bare(primary_key.clone())))?,
    }];
    for (column, expr) in assignments {
        items.push(ProjectItem::Column {
            name: column.to_lowercase(),
            scalar: builder.compiler.compile_scalar(expr)?,
        });
    }

    Ok(Arc::new(DmlExecute {
        input: Arc::new(Project { input: scan, items }),
        operation: DmlOperation::Update,
        entity: entity.to_lowercase(),
    }))
}

fn build_delete(
    builder: &PlanBuilder,
    entity: &str,
    alias: Option<&str>,
    selection: Option<&Expr>,
) -> Result<PlanNodeRef> {
    if entity.starts_with('#') {
        return Ok(Arc::new(TempTableMutate {
            name: entity.to_string(),
            assignments: Vec::new(),
            predicate: selection
                .map(|expr| builder.compiler.compile_predicate(expr))
                .transpose()?,
            delete: true,
        }));
    }

    check_unrestricted_dml(DmlKind::Delete, entity, selection.is_some(), &builder.options)?;

    let alias = alias.unwrap_or(entity);
    let primary_key = primary_key_of(builder, entity);
    let referenced = referenced_attributes(selection.cloned());
    let scan = build_target_scan(builder, entity, alias, &primary_key, &referenced, selection)?;

    let items = vec![ProjectItem::Column {
        name: primary_key.clone(),
        scalar: builder
            .compiler
            .compile_scalar(&Expr::Column(ColumnRef::bare(primary_key)))?,
    }];

    Ok(Arc::new(DmlExecute {
        input: Arc::new(Project { input: scan, items }),
        operation: DmlOperation::Delete,
        entity: entity.to_lowercase(),
    }))
}

/// MERGE supports only WHEN NOT MATCHED THEN INSERT; the remote store has no
/// atomic lookup-and-lock, so matched variants fail at plan time.
fn build_merge(
    builder: &PlanBuilder,
    entity: &str,
    alias: Option<&str>,
    source: &TableSource,
    on: &Expr,
    clauses: &[MergeClause],
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    for clause in clauses {
        match clause.kind {
            MergeMatchKind::Matched => {
                return Err(Error::not_supported(
                    "MERGE ... WHEN MATCHED: the remote store has no atomic \
                     lookup-and-lock, so matched updates cannot run safely",
                ))
            }
            MergeMatchKind::NotMatchedBySource => {
                return Err(Error::not_supported(
                    "MERGE ... WHEN NOT MATCHED BY SOURCE",
                ))
            }
            MergeMatchKind::NotMatchedByTarget => {}
        }
    }
    let insert = clauses
        .iter()
        .find(|clause| clause.kind == MergeMatchKind::NotMatchedByTarget)
        .ok_or_else(|| Error::plan("MERGE requires a WHEN NOT MATCHED THEN INSERT clause"))?;
    let (columns, values) = match &insert.action {
        MergeAction::Insert { columns, values } => (columns, values),
        _ => {
            return Err(Error::not_supported(
                "MERGE ... WHEN NOT MATCHED supports only INSERT",
            ))
        }
    };

    let target_alias = alias.unwrap_or(entity).to_string();
    let source_alias = source
        .alias_or_name()
        .map(str::to_string)
        .unwrap_or_else(|| "src".to_string());

    // Split ON into target/source key pairs.
    let mut target_keys = Vec::new();
    let mut source_keys = Vec::new();
    for conjunct in split_conjuncts(on) {
        let (left, right) = match conjunct {
            Expr::Binary {
                left,
                op: marlinsql_ir::BinaryOp::Eq,
                right,
            } => (left, right),
            other => {
                return Err(Error::not_supported(format!(
                    "MERGE ON supports only equality conditions, got {}",
                    format_expr(other)
                )))
            }
        };
        let classify = |expr: &Expr| match expr {
            Expr::Column(column) => match &column.table {
                Some(table) if table.eq_ignore_ascii_case(&target_alias) => {
                    Some((true, column.name.to_lowercase()))
                }
                Some(table) if table.eq_ignore_ascii_case(&source_alias) => {
                    Some((false, column.name.to_lowercase()))
                }
                _ => None,
            },
            _ => None,
        };
        match (classify(left), classify(right)) {
            (Some((true, t)), Some((false, s))) | (Some((false, s)), Some((true, t))) => {
                target_keys.push(t);
                source_keys.push(s);
            }
            _ => {
                return Err(Error::not_supported(
                    "MERGE ON conditions must compare target and source columns",
                ))
            }
        }
    }
    if target_keys.is_empty() {
        return Err(Error::plan("MERGE requires at least one ON equality"));
    }

    // Source rows, qualified; anti-joined against the target's key scan.
    let source_node = build_merge_source(builder, source, scope)?;
    let source_node: PlanNodeRef = Arc::new(QualifyColumns {
        input: source_node,
        alias: source_alias.clone(),
    });

    let mut target_fetch = FetchEntity::new(entity.to_lowercase());
    for key in &target_keys {
        target_fetch
            .attributes
            .push(FetchAttribute::plain(key.clone()));
    }
    let target_scan: PlanNodeRef = Arc::new(FetchScan::new(
        entity.to_lowercase(),
        FetchQuery::new(target_fetch),
    ));

    let left_keys = source_keys
        .iter()
        .map(|key| {
            builder.compiler.compile_scalar(&Expr::Column(ColumnRef::qualified(
                source_alias.clone(),
                key.clone(),
            )))
        })
        .collect::<Result<Vec<_>>>()?;
    let right_keys = target_keys
        .iter()
        .map(|key| {
            builder
                .compiler
                .compile_scalar(&Expr::Column(ColumnRef::bare(key.clone())))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut unmatched: PlanNodeRef = Arc::new(HashJoin {
        left: source_node,
        right: target_scan,
        semantics: JoinSemantics::Anti,
        left_keys,
        right_keys,
        residual: None,
        estimated: -1,
    });

    if let Some(predicate) = &insert.predicate {
        unmatched = Arc::new(ClientFilter {
            input: unmatched,
            label: format_expr(predicate),
            predicate: builder.compiler.compile_predicate(predicate)?,
        });
    }

    // Shape the insert rows from the VALUES expressions over source rows.
    let items = columns
        .iter()
        .zip(values.iter())
        .map(|(column, value)| {
            Ok(ProjectItem::Column {
                name: column.to_lowercase(),
                scalar: builder.compiler.compile_scalar(value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(DmlExecute {
        input: Arc::new(Project {
            input: unmatched,
            items,
        }),
        operation: DmlOperation::Insert,
        entity: entity.to_lowercase(),
    }))
}

fn build_merge_source(
    builder: &PlanBuilder,
    source: &TableSource,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    match source {
        TableSource::Entity { name, .. } if name.starts_with('#') => {
            Ok(Arc::new(crate::exec::scan::TempTableScan { name: name.clone() }))
        }
        TableSource::Entity { name, .. } => {
            let mut fetch_entity = FetchEntity::new(name.to_lowercase());
            fetch_entity.all_attributes = true;
            Ok(Arc::new(FetchScan::new(
                name.to_lowercase(),
                FetchQuery::new(fetch_entity),
            )))
        }
        TableSource::Derived { query, .. } => build_query(builder, query, scope),
        other => Err(Error::not_supported(format!(
            "MERGE source: {:?}",
            other
        ))),
    }
}

fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
        match expr {
            Expr::Binary {
                left,
                op: marlinsql_ir::BinaryOp::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            other => out.push(other),
        }
    }
    walk(expr, &mut out);
    out
}
