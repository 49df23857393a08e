use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_fetchxml::{FetchAttribute, FetchEntity, FetchOrder, FetchQuery};
use marlinsql_ir::{
    AggregateFunc, ColumnRef, Expr, JoinKind, Literal, Query, QueryBody, Select, SelectItem,
    SetOperator, SortExpr, TableSource, WindowFunc,
};

use crate::exec::aggregate::{AggregateExpr, HashAggregate, MergeAggregate, MergeKind, MergeSpec, StreamAggregate};
use crate::exec::distinct::{Concatenate, Distinct, HashSetOp, SetOpKind};
use crate::exec::filter::{ClientFilter, Project, ProjectItem, QualifyColumns};
use crate::exec::join::{HashJoin, JoinSemantics, MergeJoin, NestedLoopJoin};
use crate::exec::metadata_scan::{MetadataScan, MetadataTable};
use crate::exec::partition::{uniform_partitions, AdaptiveAggregateScan, ParallelPartition};
use crate::exec::scan::{ConstantScan, FetchScan, PrefetchScan, TempTableScan};
use crate::exec::script::{SubqueryBind, SubqueryBinding};
use crate::exec::sort::{OffsetFetch, Sort, SortKey, Top};
use crate::exec::tvf::{OpenJson, StringSplit};
use crate::exec::window::{WindowExpr, WindowSpool};
use crate::exec::PlanNodeRef;
use crate::explain::format_expr;
use crate::options::limits;
use crate::plan::pushdown::{
    avg_count_column, avg_sum_column, build_aggregate_query, filter_references, partition_count,
    split_predicate, usable_range, PushedAggregate,
};
use crate::plan::subquery::{
    aggregate_arg_has_correlated_subquery, analyze_where, bind_scalar_subqueries,
    collect_aggregates, collect_windows, merge_and, replace_with_columns,
    rewrite_correlated_scalars, ScalarJoinRewrite, VariableBind,
};
use crate::plan::{PlanBuilder, Scope};

pub(crate) fn build_query(
    builder: &PlanBuilder,
    query: &Query,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    let scope = scope.with_ctes(&query.ctes);
    match &query.body {
        QueryBody::Select(select) => build_select(
            builder,
            select,
            &scope,
            &query.order_by,
            query.offset.as_ref(),
            query.fetch.as_ref(),
        ),
        QueryBody::SetOperation { .. } => {
            let mut node = build_set_operation(builder, &query.body, &scope)?;
            if !query.order_by.is_empty() {
                node = Arc::new(Sort {
                    input: node,
                    keys: compile_sort_keys(builder, &query.order_by)?,
                });
            }
            if query.offset.is_some() || query.fetch.is_some() {
                node = Arc::new(OffsetFetch {
                    input: node,
                    offset: builder.compiler.compile_scalar(
                        query
                            .offset
                            .as_ref()
                            .unwrap_or(&Expr::Literal(Literal::Int(0))),
                    )?,
                    fetch: query
                        .fetch
                        .as_ref()
                        .map(|f| builder.compiler.compile_scalar(f))
                        .transpose()?,
                });
            }
            Ok(node)
        }
    }
}

/// UNION branches collect recursively through nested binary query
/// expressions; `Concatenate` over all of them, deduplicated unless every
/// boundary was UNION ALL. INTERSECT/EXCEPT hash over materialized inputs.
fn build_set_operation(
    builder: &PlanBuilder,
    body: &QueryBody,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    match body {
        QueryBody::Select(select) => {
            build_select(builder, select, scope, &[], None, None)
        }
        QueryBody::SetOperation {
            op: SetOperator::Union,
            ..
        } => {
            let mut branches = Vec::new();
            let mut all_boundaries = true;
            collect_union_branches(body, &mut branches, &mut all_boundaries);
            let built = branches
                .into_iter()
                .map(|branch| build_set_operation(builder, branch, scope))
                .collect::<Result<Vec<_>>>()?;
            let concat: PlanNodeRef = Arc::new(Concatenate { branches: built });
            Ok(if all_boundaries {
                concat
            } else {
                Arc::new(Distinct { input: concat })
            })
        }
        QueryBody::SetOperation {
            op,
            left,
            right,
            ..
        } => {
            let kind = match op {
                SetOperator::Intersect => SetOpKind::Intersect,
                SetOperator::Except => SetOpKind::Except,
                SetOperator::Union => unreachable!("handled above"),
            };
            Ok(Arc::new(HashSetOp {
                left: build_set_operation(builder, left, scope)?,
                right: build_set_operation(builder, right, scope)?,
                kind,
            }))
        }
    }
}

fn collect_union_branches<'a>(
    body: &'a QueryBody,
    branches: &mut Vec<&'a QueryBody>,
    all_boundaries: &mut bool,
) {
    match body {
        QueryBody::SetOperation {
            op: SetOperator::Union,
            all,
            left,
            right,
        } => {
            if !*all {
                *all_boundaries = false;
            }
            collect_union_branches(left, branches, all_boundaries);
            collect_union_branches(right, branches, all_boundaries);
        }
        other => branches.push(other),
    }
}

struct NamedExpr {
    name: String,
    expr: Expr,
}

/// The full single-SELECT pipeline: routing, pushdown, joins, aggregation,
/// windows, projection, distinct, sort and row limits.
#[allow(clippy::too_many_arguments)]
fn build_select(
    builder: &PlanBuilder,
    select: &Select,
    scope: &Scope<'_>,
    order_by: &[SortExpr],
    offset: Option<&Expr>,
    fetch: Option<&Expr>,
) -> Result<PlanNodeRef> {
    if let Some(top) = &select.top {
        if top.with_ties {
            return Err(Error::not_supported("TOP ... WITH TIES"));
        }
    }

    let mut bind_counter = scope.bind_counter();
    let mut binds: Vec<VariableBind> = Vec::new();

    // SELECT without FROM: one computed row.
    let from = match &select.from {
        Some(from) => from,
        None => {
            let node = build_constant_select(builder, select, &mut bind_counter, &mut binds)?;
            let node = apply_tail(
                builder, node, select, order_by, offset, fetch, false, false, false,
            )?;
            return wrap_binds(builder, node, binds, scope, &mut bind_counter);
        }
    };

    let aliases = collect_aliases(from);

    // WHERE decomposition: subquery conjuncts into joins and binds.
    let analysis = analyze_where(select.selection.as_ref(), &aliases, &mut bind_counter)?;
    binds.extend(analysis.binds);
    let mut selection = analysis.remaining;
    let mut scalar_joins = analysis.scalar_joins;

    let windows = {
        let mut exprs: Vec<&Expr> = projection_exprs(select);
        if let Some(having) = &select.having {
            exprs.push(having);
        }
        collect_windows(&exprs)
    };
    let has_aggregate = !select.group_by.is_empty() || {
        let mut exprs: Vec<&Expr> = projection_exprs(select);
        if let Some(having) = &select.having {
            exprs.push(having);
        }
        exprs.iter().any(|e| e.contains_aggregate())
    };

    // Correlated scalar subqueries in the projection join the same way the
    // WHERE-clause ones do. Post-aggregation projections only see group and
    // aggregate columns, so that combination has no join rewrite.
    let mut projection = named_projection(select)?;
    let where_scalar_joins = scalar_joins.len();
    projection =
        rewrite_correlated_projection(projection, &aliases, &mut bind_counter, &mut scalar_joins)?;
    if has_aggregate && scalar_joins.len() > where_scalar_joins {
        return Err(Error::not_supported(
            "correlated scalar subqueries in the projection of an aggregate query",
        ));
    }

    let has_joins =
        !from.joins.is_empty() || !analysis.joins.is_empty() || !scalar_joins.is_empty();

    // A first INNER equi-join between two plain remote entities sorts both
    // scans remotely on the key and merges; everything else hashes.
    let merge_plan = detect_merge_join(from, scope);

    let mut node: PlanNodeRef = match &from.base {
        TableSource::Entity { schema, name, .. }
            if schema.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("metadata")) =>
        {
            let table = MetadataTable::from_name(name).ok_or_else(|| {
                Error::plan(format!("unknown metadata table metadata.{}", name))
            })?;
            Arc::new(MetadataScan { table })
        }
        TableSource::Entity { name, .. } if name.starts_with('#') => {
            Arc::new(TempTableScan { name: name.clone() })
        }
        TableSource::Entity { name, .. } if scope.cte(name).is_some() => {
            let cte = scope.cte(name).expect("checked");
            let node = build_query(builder, &cte.query, scope)?;
            if cte.columns.is_empty() {
                node
            } else {
                Arc::new(crate::exec::filter::RenameColumns {
                    input: node,
                    names: cte.columns.clone(),
                })
            }
        }
        TableSource::Entity { name, alias, .. } => {
            // Remote entity: the pushdown path.
            let base_alias = alias.clone().unwrap_or_else(|| name.clone());
            if !has_joins {
                return build_remote_select(
                    builder,
                    select,
                    name,
                    &base_alias,
                    selection,
                    projection,
                    order_by,
                    offset,
                    fetch,
                    has_aggregate,
                    windows,
                    binds,
                    scope,
                    &mut bind_counter,
                );
            }
            let taken = selection.take();
            let (scan, residual) = build_remote_scan_for_join(
                builder,
                name,
                &base_alias,
                taken.as_ref(),
                merge_plan.as_ref().map(|m| m.base_key.as_str()),
            )?;
            selection = residual;
            scan
        }
        other => build_side_source(builder, other, scope)?,
    };

    // Qualify the base when joins are present so names stay unambiguous.
    if has_joins {
        if let Some(alias) = from.base.alias_or_name() {
            node = Arc::new(QualifyColumns {
                input: node,
                alias: alias.to_string(),
            });
        }
    }

    // Client-side joins.
    let mut seen_aliases: Vec<String> = from
        .base
        .alias_or_name()
        .map(|a| vec![a.to_string()])
        .unwrap_or_default();
    for (i, join) in from.joins.iter().enumerate() {
        if i == 0 {
            if let Some(merge) = &merge_plan {
                let (scan, _) = build_remote_scan_for_join(
                    builder,
                    &merge.right_entity,
                    &merge.right_alias,
                    None,
                    Some(&merge.right_key),
                )?;
                let right: PlanNodeRef = Arc::new(QualifyColumns {
                    input: scan,
                    alias: merge.right_alias.clone(),
                });
                node = Arc::new(MergeJoin {
                    left: node,
                    right,
                    semantics: JoinSemantics::Inner,
                    left_keys: vec![builder.compiler.compile_scalar(&merge.left_expr)?],
                    right_keys: vec![builder.compiler.compile_scalar(&merge.right_expr)?],
                    estimated: -1,
                });
                seen_aliases.push(merge.right_alias.clone());
                continue;
            }
        }
        let right = build_join_input(builder, &join.source, scope)?;
        node = build_client_join(builder, node, right, join.kind, join.condition.as_ref(), &seen_aliases)?;
        if let Some(alias) = join.source.alias_or_name() {
            seen_aliases.push(alias.to_string());
        }
    }

    // Semi/anti joins from IN/EXISTS rewrites.
    for rewrite in analysis.joins {
        let sub_node = build_query(builder, &rewrite.query, scope)?;
        let left_keys = rewrite
            .keys
            .iter()
            .map(|(probe, _)| builder.compiler.compile_scalar(probe))
            .collect::<Result<Vec<_>>>()?;
        let right_keys = rewrite
            .keys
            .iter()
            .map(|(_, build_col)| {
                builder
                    .compiler
                    .compile_scalar(&Expr::Column(ColumnRef::bare(build_col.clone())))
            })
            .collect::<Result<Vec<_>>>()?;
        node = Arc::new(HashJoin {
            left: node,
            right: sub_node,
            semantics: if rewrite.null_aware {
                JoinSemantics::NullAwareAnti
            } else if rewrite.anti {
                JoinSemantics::Anti
            } else {
                JoinSemantics::Semi
            },
            left_keys,
            right_keys,
            residual: None,
            estimated: -1,
        });
    }

    // Correlated scalar subqueries: a left outer join asserting at most one
    // build row per key, ahead of the residual filter that reads its value.
    for rewrite in scalar_joins {
        node = build_scalar_join(builder, node, rewrite, scope)?;
    }

    // Residual WHERE after any pushdown into the base scan.
    if let Some(residual) = selection {
        node = Arc::new(ClientFilter {
            input: node,
            label: format_expr(&residual),
            predicate: builder.compiler.compile_predicate(&residual)?,
        });
    }

    // Client aggregation.
    projection = bind_projection(projection, &aliases, &mut bind_counter, &mut binds)?;
    if has_aggregate {
        let (agg_node, rewrites) = build_client_aggregate(builder, select, node)?;
        node = agg_node;
        projection = rewrite_projection(projection, &rewrites);
        if let Some(having) = &select.having {
            let having = replace_with_columns(having, &rewrites);
            node = Arc::new(ClientFilter {
                input: node,
                label: format_expr(&having),
                predicate: builder.compiler.compile_predicate(&having)?,
            });
        }
    }

    // Windows over the (possibly aggregated) input.
    if !windows.is_empty() {
        let (spool, rewrites) = build_window_spool(builder, &windows, node)?;
        node = spool;
        projection = rewrite_projection(projection, &rewrites);
    }

    // ORDER BY keys referencing columns the projection drops sort first.
    let sort_early = !order_by.is_empty() && !order_targets_projection(&projection, order_by);
    if sort_early {
        node = Arc::new(Sort {
            input: node,
            keys: compile_sort_keys(builder, order_by)?,
        });
    }

    node = apply_projection(builder, node, &projection)?;
    node = apply_tail(
        builder, node, select, order_by, offset, fetch, sort_early, false, false,
    )?;
    wrap_binds(builder, node, binds, scope, &mut bind_counter)
}

/// One decorrelated scalar subquery as a `SingleLeft` hash join: probe rows
/// keep flowing, gain the subquery's value column, and more than one build
/// row per key fails the statement.
fn build_scalar_join(
    builder: &PlanBuilder,
    node: PlanNodeRef,
    rewrite: ScalarJoinRewrite,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    let sub_node = build_query(builder, &rewrite.query, scope)?;
    let left_keys = rewrite
        .keys
        .iter()
        .map(|(probe, _)| builder.compiler.compile_scalar(probe))
        .collect::<Result<Vec<_>>>()?;
    let right_keys = rewrite
        .keys
        .iter()
        .map(|(_, build_col)| {
            builder
                .compiler
                .compile_scalar(&Expr::Column(ColumnRef::bare(build_col.clone())))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(HashJoin {
        left: node,
        right: sub_node,
        semantics: JoinSemantics::SingleLeft,
        left_keys,
        right_keys,
        residual: None,
        estimated: -1,
    }))
}

/// Correlated scalar subqueries in projection expressions become single-row
/// left joins; a correlated subquery nested inside an aggregate argument has
/// no join rewrite and is rejected.
fn rewrite_correlated_projection(
    projection: NamedProjection,
    aliases: &[String],
    counter: &mut usize,
    joins: &mut Vec<ScalarJoinRewrite>,
) -> Result<NamedProjection> {
    let items = projection
        .items
        .into_iter()
        .map(|slot| {
            Ok(match slot {
                ProjectionSlot::Expr(named) if named.expr.contains_subquery() => {
                    if aggregate_arg_has_correlated_subquery(&named.expr, aliases) {
                        return Err(Error::not_supported(
                            "correlated subquery inside an aggregate argument",
                        ));
                    }
                    ProjectionSlot::Expr(NamedExpr {
                        expr: rewrite_correlated_scalars(&named.expr, aliases, counter, joins)?,
                        name: named.name,
                    })
                }
                other => other,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NamedProjection { items })
}

/// Whether every ORDER BY key resolves against the projection's output
/// columns; wildcards keep everything visible.
fn order_targets_projection(projection: &NamedProjection, order_by: &[SortExpr]) -> bool {
    if projection
        .items
        .iter()
        .any(|slot| matches!(slot, ProjectionSlot::Wildcard(_)))
    {
        return true;
    }
    let names: Vec<&str> = projection
        .items
        .iter()
        .filter_map(|slot| match slot {
            ProjectionSlot::Expr(named) => Some(named.name.as_str()),
            ProjectionSlot::Wildcard(_) => None,
        })
        .collect();
    order_by.iter().all(|sort| {
        sort.expr
            .referenced_columns()
            .iter()
            .all(|column| names.iter().any(|n| n.eq_ignore_ascii_case(&column.name)))
    })
}

/// Rewrite uncorrelated subqueries inside projection expressions into
/// pre-executed binds; correlated ones are not supported in this position.
fn bind_projection(
    projection: NamedProjection,
    aliases: &[String],
    bind_counter: &mut usize,
    binds: &mut Vec<VariableBind>,
) -> Result<NamedProjection> {
    let items = projection
        .items
        .into_iter()
        .map(|slot| {
            Ok(match slot {
                ProjectionSlot::Expr(named) if named.expr.contains_subquery() => {
                    ProjectionSlot::Expr(NamedExpr {
                        expr: bind_scalar_subqueries(&named.expr, aliases, bind_counter, binds)?,
                        name: named.name,
                    })
                }
                other => other,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NamedProjection { items })
}

#[derive(Default)]
struct PushedShape {
    orders: bool,
    top: bool,
    distinct: bool,
}

fn projection_exprs(select: &Select) -> Vec<&Expr> {
    select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::Expr { expr, .. } => Some(expr),
            SelectItem::Wildcard(_) => None,
        })
        .collect()
}

fn collect_aliases(from: &marlinsql_ir::TableWithJoins) -> Vec<String> {
    let mut aliases = Vec::new();
    if let Some(alias) = from.base.alias_or_name() {
        aliases.push(alias.to_string());
    }
    for join in &from.joins {
        if let Some(alias) = join.source.alias_or_name() {
            aliases.push(alias.to_string());
        }
    }
    aliases
}

fn build_constant_select(
    builder: &PlanBuilder,
    select: &Select,
    bind_counter: &mut usize,
    binds: &mut Vec<VariableBind>,
) -> Result<PlanNodeRef> {
    let mut columns = Vec::new();
    let mut scalars = Vec::new();
    for (i, item) in select.projection.iter().enumerate() {
        match item {
            SelectItem::Expr { expr, alias } => {
                let expr = bind_scalar_subqueries(expr, &[], bind_counter, binds)?;
                columns.push(output_name(alias.as_deref(), &expr, i, &columns));
                scalars.push(builder.compiler.compile_scalar(&expr)?);
            }
            SelectItem::Wildcard(_) => {
                return Err(Error::plan("SELECT * requires a FROM clause"))
            }
        }
    }
    Ok(Arc::new(ConstantScan {
        columns,
        rows: vec![scalars],
    }))
}

fn wrap_binds(
    builder: &PlanBuilder,
    node: PlanNodeRef,
    binds: Vec<VariableBind>,
    scope: &Scope<'_>,
    bind_counter: &mut usize,
) -> Result<PlanNodeRef> {
    scope.store_bind_counter(*bind_counter);
    if binds.is_empty() {
        return Ok(node);
    }
    let bindings = binds
        .into_iter()
        .map(|bind| {
            Ok(SubqueryBinding {
                variable: bind.variable,
                plan: build_query(builder, &bind.query, scope)?,
                exists: bind.exists,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(SubqueryBind {
        bindings,
        input: node,
    }))
}

/// Scans backing derived tables, CTE-free side sources and table-valued
/// functions.
fn build_side_source(
    builder: &PlanBuilder,
    source: &TableSource,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    match source {
        TableSource::Derived { query, .. } => build_query(builder, query, scope),
        TableSource::OpenJson { json, path, .. } => Ok(Arc::new(OpenJson {
            json: builder.compiler.compile_scalar(json)?,
            path: path.clone(),
        })),
        TableSource::StringSplit {
            text, separator, ..
        } => Ok(Arc::new(StringSplit {
            text: builder.compiler.compile_scalar(text)?,
            separator: builder.compiler.compile_scalar(separator)?,
        })),
        TableSource::Entity { .. } => unreachable!("entities resolved by caller"),
    }
}

/// A join input: entity scans fetch every attribute (residual predicates and
/// projections bind late), other sources build normally. Everything is
/// alias-qualified.
fn build_join_input(
    builder: &PlanBuilder,
    source: &TableSource,
    scope: &Scope<'_>,
) -> Result<PlanNodeRef> {
    let node: PlanNodeRef = match source {
        TableSource::Entity { schema, name, .. }
            if schema.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("metadata")) =>
        {
            let table = MetadataTable::from_name(name)
                .ok_or_else(|| Error::plan(format!("unknown metadata table metadata.{}", name)))?;
            Arc::new(MetadataScan { table })
        }
        TableSource::Entity { name, .. } if name.starts_with('#') => {
            Arc::new(TempTableScan { name: name.clone() })
        }
        TableSource::Entity { name, .. } if scope.cte(name).is_some() => {
            let cte = scope.cte(name).expect("checked");
            build_query(builder, &cte.query, scope)?
        }
        TableSource::Entity { name, .. } => {
            let (scan, _residual) = build_remote_scan_for_join(
                builder,
                name,
                source.alias_or_name().unwrap_or(name),
                None,
                None,
            )?;
            scan
        }
        other => build_side_source(builder, other, scope)?,
    };
    Ok(match source.alias_or_name() {
        Some(alias) => Arc::new(QualifyColumns {
            input: node,
            alias: alias.to_string(),
        }),
        None => node,
    })
}

/// The first-join merge shape: two plain remote entities joined INNER on one
/// column each.
struct MergeFirstJoin {
    base_key: String,
    right_entity: String,
    right_alias: String,
    right_key: String,
    left_expr: Expr,
    right_expr: Expr,
}

fn detect_merge_join(
    from: &marlinsql_ir::TableWithJoins,
    scope: &Scope<'_>,
) -> Option<MergeFirstJoin> {
    let base_alias = match &from.base {
        TableSource::Entity {
            schema: None,
            name,
            alias,
        } if !name.starts_with('#') && scope.cte(name).is_none() => {
            alias.clone().unwrap_or_else(|| name.clone())
        }
        _ => return None,
    };
    let first = from.joins.first()?;
    if first.kind != JoinKind::Inner {
        return None;
    }
    let (right_entity, right_alias) = match &first.source {
        TableSource::Entity {
            schema: None,
            name,
            alias,
        } if !name.starts_with('#') && scope.cte(name).is_none() => {
            (name.clone(), alias.clone().unwrap_or_else(|| name.clone()))
        }
        _ => return None,
    };
    let (left, right) = match first.condition.as_ref()? {
        Expr::Binary {
            left,
            op: marlinsql_ir::BinaryOp::Eq,
            right,
        } => (left, right),
        _ => return None,
    };
    let classify = |expr: &Expr| -> Option<(String, bool)> {
        match expr {
            Expr::Column(ColumnRef {
                table: Some(table),
                name,
            }) => {
                if table.eq_ignore_ascii_case(&base_alias) {
                    Some((name.to_lowercase(), true))
                } else if table.eq_ignore_ascii_case(&right_alias) {
                    Some((name.to_lowercase(), false))
                } else {
                    None
                }
            }
            _ => None,
        }
    };
    let (left_col, left_is_base) = classify(left)?;
    let (right_col, right_is_base) = classify(right)?;
    if left_is_base == right_is_base {
        return None;
    }
    let (base_key, right_key) = if left_is_base {
        (left_col, right_col)
    } else {
        (right_col, left_col)
    };
    Some(MergeFirstJoin {
        left_expr: Expr::Column(ColumnRef::qualified(base_alias, base_key.clone())),
        right_expr: Expr::Column(ColumnRef::qualified(right_alias.clone(), right_key.clone())),
        base_key,
        right_entity,
        right_alias,
        right_key,
    })
}

/// Full-width scan of a remote entity used as a join input. The part of the
/// WHERE clause that converts cleanly and touches only this alias is pushed;
/// the residual is handed back for client filtering after the joins.
fn build_remote_scan_for_join(
    builder: &PlanBuilder,
    entity: &str,
    alias: &str,
    selection: Option<&Expr>,
    order_on: Option<&str>,
) -> Result<(PlanNodeRef, Option<Expr>)> {
    let mut fetch_entity = FetchEntity::new(entity.to_lowercase());
    fetch_entity.all_attributes = true;
    let split = split_predicate(selection, alias);
    fetch_entity.filter = split.filter;
    if let Some(attribute) = order_on {
        fetch_entity.orders.push(FetchOrder {
            attribute: attribute.to_string(),
            alias: None,
            descending: false,
        });
    }
    let query = FetchQuery::new(fetch_entity);
    let mut scan = FetchScan::new(entity.to_lowercase(), query);
    scan.estimated = builder.estimates.count(entity).unwrap_or(-1);
    let node: PlanNodeRef = Arc::new(PrefetchScan {
        input: Arc::new(scan),
        buffer: limits::DEFAULT_PAGE_SIZE as usize,
    });
    Ok((node, split.residual))
}

/// Join strategy selection: nested loop for small or non-equi inners, merge
/// join when both inputs arrive sorted on the full key, hash otherwise with
/// the smaller input as the build side.
fn build_client_join(
    builder: &PlanBuilder,
    left: PlanNodeRef,
    right: PlanNodeRef,
    kind: JoinKind,
    condition: Option<&Expr>,
    left_aliases: &[String],
) -> Result<PlanNodeRef> {
    let semantics = match kind {
        JoinKind::Inner | JoinKind::Cross => JoinSemantics::Inner,
        JoinKind::Left => JoinSemantics::Left,
        JoinKind::Right => JoinSemantics::Right,
        JoinKind::Full => JoinSemantics::Full,
    };

    let condition = match condition {
        Some(condition) => condition,
        None => {
            return Ok(Arc::new(NestedLoopJoin {
                left,
                right,
                semantics,
                condition: None,
                estimated: -1,
            }))
        }
    };

    let (equi, residual) = split_equi_keys(condition, left_aliases);

    if equi.is_empty() {
        return Ok(Arc::new(NestedLoopJoin {
            left,
            right,
            semantics,
            condition: Some(builder.compiler.compile_predicate(condition)?),
            estimated: -1,
        }));
    }

    let right_estimate = right.estimated_rows();
    if (0..1_000).contains(&right_estimate) {
        return Ok(Arc::new(NestedLoopJoin {
            left,
            right,
            semantics,
            condition: Some(builder.compiler.compile_predicate(condition)?),
            estimated: -1,
        }));
    }

    let left_keys = equi
        .iter()
        .map(|(l, _)| builder.compiler.compile_scalar(l))
        .collect::<Result<Vec<_>>>()?;
    let right_keys = equi
        .iter()
        .map(|(_, r)| builder.compiler.compile_scalar(r))
        .collect::<Result<Vec<_>>>()?;
    let residual = residual
        .map(|r| builder.compiler.compile_predicate(&r))
        .transpose()?;

    Ok(Arc::new(HashJoin {
        left,
        right,
        semantics,
        left_keys,
        right_keys,
        residual,
        estimated: -1,
    }))
}

/// Split a join condition into equi-key pairs (left expr, right expr) and a
/// residual predicate.
fn split_equi_keys(
    condition: &Expr,
    left_aliases: &[String],
) -> (Vec<(Expr, Expr)>, Option<Expr>) {
    let mut keys = Vec::new();
    let mut residual: Option<Expr> = None;

    fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
        match expr {
            Expr::Binary {
                left,
                op: marlinsql_ir::BinaryOp::And,
                right,
            } => {
                conjuncts(left, out);
                conjuncts(right, out);
            }
            other => out.push(other),
        }
    }
    let mut parts = Vec::new();
    conjuncts(condition, &mut parts);

    for part in parts {
        if let Expr::Binary {
            left,
            op: marlinsql_ir::BinaryOp::Eq,
            right,
        } = part
        {
            let left_is_outer = side_of(left, left_aliases);
            let right_is_outer = side_of(right, left_aliases);
            match (left_is_outer, right_is_outer) {
                (Some(true), Some(false)) => {
                    keys.push(((**left).clone(), (**right).clone()));
                    continue;
                }
                (Some(false), Some(true)) => {
                    keys.push(((**right).clone(), (**left).clone()));
                    continue;
                }
                _ => {}
            }
        }
        residual = merge_and(residual, part.clone());
    }
    (keys, residual)
}

/// `Some(true)` when the expression references only left-side aliases,
/// `Some(false)` for only the right side, `None` when mixed or bare.
fn side_of(expr: &Expr, left_aliases: &[String]) -> Option<bool> {
    let mut outer = false;
    let mut inner = false;
    let mut bare = false;
    expr.walk(&mut |e| {
        if let Expr::Column(column) = e {
            match &column.table {
                Some(table) => {
                    if left_aliases.iter().any(|a| a.eq_ignore_ascii_case(table)) {
                        outer = true;
                    } else {
                        inner = true;
                    }
                }
                None => bare = true,
            }
        }
    });
    match (outer, inner, bare) {
        (true, false, false) => Some(true),
        (false, true, false) => Some(false),
        _ => None,
    }
}

struct NamedProjection {
    items: Vec<ProjectionSlot>,
}

enum ProjectionSlot {
    Wildcard(Option<String>),
    Expr(NamedExpr),
}

fn named_projection(select: &Select) -> Result<NamedProjection> {
    let mut used: Vec<String> = Vec::new();
    let mut items = Vec::new();
    for (i, item) in select.projection.iter().enumerate() {
        match item {
            SelectItem::Wildcard(prefix) => {
                items.push(ProjectionSlot::Wildcard(prefix.clone()))
            }
            SelectItem::Expr { expr, alias } => {
                let name = output_name(alias.as_deref(), expr, i, &used);
                used.push(name.clone());
                items.push(ProjectionSlot::Expr(NamedExpr {
                    name,
                    expr: expr.clone(),
                }));
            }
        }
    }
    Ok(NamedProjection { items })
}

fn output_name(alias: Option<&str>, expr: &Expr, index: usize, used: &[String]) -> String {
    let base = match alias {
        Some(alias) => alias.to_string(),
        None => match expr {
            Expr::Column(column) => column.name.clone(),
            Expr::Aggregate { func, .. } => func.name().to_string(),
            Expr::Function { name, .. } => name.clone(),
            _ => format!("column{}", index + 1),
        },
    };
    if !used.iter().any(|u| u.eq_ignore_ascii_case(&base)) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}{}", base, n);
        if !used.iter().any(|u| u.eq_ignore_ascii_case(&candidate)) {
            return candidate;
        }
        n += 1;
    }
}

fn rewrite_projection(
    projection: NamedProjection,
    rewrites: &[(Expr, String)],
) -> NamedProjection {
    NamedProjection {
        items: projection
            .items
            .into_iter()
            .map(|slot| match slot {
                ProjectionSlot::Expr(named) => ProjectionSlot::Expr(NamedExpr {
                    expr: replace_with_columns(&named.expr, rewrites),
                    name: named.name,
                }),
                wildcard => wildcard,
            })
            .collect(),
    }
}

fn apply_projection(
    builder: &PlanBuilder,
    node: PlanNodeRef,
    projection: &NamedProjection,
) -> Result<PlanNodeRef> {
    // A bare `SELECT *` passes rows through untouched.
    if projection.items.len() == 1 {
        if let ProjectionSlot::Wildcard(None) = &projection.items[0] {
            return Ok(node);
        }
    }
    let items = projection
        .items
        .iter()
        .map(|slot| {
            Ok(match slot {
                ProjectionSlot::Wildcard(prefix) => ProjectItem::All {
                    prefix: prefix.clone(),
                },
                ProjectionSlot::Expr(named) => ProjectItem::Column {
                    name: named.name.clone(),
                    scalar: builder.compiler.compile_scalar(&named.expr)?,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Project { input: node, items }))
}

/// Sort, TOP, OFFSET/FETCH and DISTINCT, honoring what was already pushed.
#[allow(clippy::too_many_arguments)]
fn apply_tail(
    builder: &PlanBuilder,
    mut node: PlanNodeRef,
    select: &Select,
    order_by: &[SortExpr],
    offset: Option<&Expr>,
    fetch: Option<&Expr>,
    orders_pushed: bool,
    top_pushed: bool,
    distinct_pushed: bool,
) -> Result<PlanNodeRef> {
    if select.distinct && !distinct_pushed {
        node = Arc::new(Distinct { input: node });
    }
    if !order_by.is_empty() && !orders_pushed {
        node = Arc::new(Sort {
            input: node,
            keys: compile_sort_keys(builder, order_by)?,
        });
    }
    if let Some(top) = &select.top {
        if !top_pushed {
            node = Arc::new(Top {
                input: node,
                quantity: builder.compiler.compile_scalar(&top.quantity)?,
                percent: top.percent,
            });
        }
    }
    if offset.is_some() || fetch.is_some() {
        node = Arc::new(OffsetFetch {
            input: node,
            offset: builder
                .compiler
                .compile_scalar(offset.unwrap_or(&Expr::Literal(Literal::Int(0))))?,
            fetch: fetch
                .map(|f| builder.compiler.compile_scalar(f))
                .transpose()?,
        });
    }
    Ok(node)
}

fn compile_sort_keys(builder: &PlanBuilder, order_by: &[SortExpr]) -> Result<Vec<SortKey>> {
    order_by
        .iter()
        .map(|sort| {
            Ok(SortKey {
                scalar: builder.compiler.compile_scalar(&sort.expr)?,
                ascending: sort.ascending,
            })
        })
        .collect()
}

struct AggregateParts {
    group_by: Vec<(String, crate::eval::CompiledScalar)>,
    aggregates: Vec<AggregateExpr>,
    rewrites: Vec<(Expr, String)>,
}

fn build_aggregate_parts(builder: &PlanBuilder, select: &Select) -> Result<AggregateParts> {
    let mut exprs: Vec<&Expr> = projection_exprs(select);
    if let Some(having) = &select.having {
        exprs.push(having);
    }
    let aggregates = collect_aggregates(&exprs);

    let mut rewrites: Vec<(Expr, String)> = Vec::new();
    let mut group_by = Vec::new();
    for (i, group) in select.group_by.iter().enumerate() {
        let name = match group {
            Expr::Column(column) => column.name.clone(),
            _ => format!("g{}", i),
        };
        rewrites.push((group.clone(), name.clone()));
        group_by.push((name, builder.compiler.compile_scalar(group)?));
    }

    let mut aggregate_exprs = Vec::new();
    for (i, aggregate) in aggregates.iter().enumerate() {
        let name = aggregate_output_name(select, aggregate, i);
        rewrites.push((aggregate.clone(), name.clone()));
        let (func, arg, distinct, separator) = match aggregate {
            Expr::Aggregate {
                func,
                arg,
                distinct,
                separator,
            } => (*func, arg, *distinct, separator.clone()),
            _ => unreachable!("collect_aggregates returns aggregates"),
        };
        aggregate_exprs.push(AggregateExpr {
            output: name,
            func,
            arg: arg
                .as_ref()
                .map(|a| builder.compiler.compile_scalar(a))
                .transpose()?,
            distinct,
            separator,
        });
    }

    Ok(AggregateParts {
        group_by,
        aggregates: aggregate_exprs,
        rewrites,
    })
}

/// Client-side GROUP BY: returns the aggregation node plus the rewrite table
/// mapping group expressions and aggregates onto output columns.
fn build_client_aggregate(
    builder: &PlanBuilder,
    select: &Select,
    input: PlanNodeRef,
) -> Result<(PlanNodeRef, Vec<(Expr, String)>)> {
    let parts = build_aggregate_parts(builder, select)?;
    Ok((
        Arc::new(HashAggregate {
            input,
            group_by: parts.group_by,
            aggregates: parts.aggregates,
        }),
        parts.rewrites,
    ))
}

/// Output column name for an aggregate: the projection alias when the item is
/// exactly this aggregate, a synthesized name otherwise.
fn aggregate_output_name(select: &Select, aggregate: &Expr, index: usize) -> String {
    for item in &select.projection {
        if let SelectItem::Expr {
            expr,
            alias: Some(alias),
        } = item
        {
            if expr == aggregate {
                return alias.clone();
            }
        }
    }
    format!("agg{}", index)
}

fn build_window_spool(
    builder: &PlanBuilder,
    windows: &[Expr],
    input: PlanNodeRef,
) -> Result<(PlanNodeRef, Vec<(Expr, String)>)> {
    let mut rewrites = Vec::new();
    let mut compiled = Vec::new();
    for (i, window) in windows.iter().enumerate() {
        let output = format!("__win{}", i);
        rewrites.push((window.clone(), output.clone()));
        let (func, args, partition_by, order_by, frame) = match window {
            Expr::Window {
                func,
                args,
                partition_by,
                order_by,
                frame,
            } => (func, args, partition_by, order_by, frame),
            _ => unreachable!("collect_windows returns windows"),
        };
        if matches!(func, WindowFunc::Aggregate(AggregateFunc::StringAgg)) {
            return Err(Error::not_supported("STRING_AGG over a window"));
        }
        compiled.push(WindowExpr {
            output,
            func: func.clone(),
            args: args
                .iter()
                .map(|a| builder.compiler.compile_scalar(a))
                .collect::<Result<Vec<_>>>()?,
            partition_by: partition_by
                .iter()
                .map(|p| builder.compiler.compile_scalar(p))
                .collect::<Result<Vec<_>>>()?,
            order_by: compile_sort_keys(builder, order_by)?,
            frame: frame.clone(),
            separator: None,
        });
    }
    Ok((
        Arc::new(WindowSpool {
            input,
            windows: compiled,
        }),
        rewrites,
    ))
}

/// The no-join remote-entity pipeline: decides among a plain pushed-down
/// scan, a single aggregate fetch, and the partitioned adaptive rewrite.
#[allow(clippy::too_many_arguments)]
fn build_remote_select(
    builder: &PlanBuilder,
    select: &Select,
    entity: &str,
    alias: &str,
    selection: Option<Expr>,
    projection: NamedProjection,
    order_by: &[SortExpr],
    offset: Option<&Expr>,
    fetch: Option<&Expr>,
    has_aggregate: bool,
    windows: Vec<Expr>,
    binds: Vec<VariableBind>,
    scope: &Scope<'_>,
    bind_counter: &mut usize,
) -> Result<PlanNodeRef> {
    let split = split_predicate(selection.as_ref(), alias);
    let mut binds = binds;
    let mut projection = bind_projection(
        projection,
        &[alias.to_string()],
        bind_counter,
        &mut binds,
    )?;
    let mut pushed = PushedShape::default();
    let mut node: PlanNodeRef;

    if has_aggregate {
        let (agg_plan, rewrites) = plan_pushable_aggregate(builder, select, entity, alias)?;
        match agg_plan {
            Some(plan) if split.residual.is_none() => {
                node = build_pushed_aggregate(builder, entity, &split, plan)?;
                projection = rewrite_projection(projection, &rewrites);
                if let Some(having) = &select.having {
                    let having = replace_with_columns(having, &rewrites);
                    node = Arc::new(ClientFilter {
                        input: node,
                        label: format_expr(&having),
                        predicate: builder.compiler.compile_predicate(&having)?,
                    });
                }
            }
            _ => {
                // Aggregation stays client-side over a plain scan.
                let scan = build_plain_scan(
                    builder, select, entity, alias, &split, order_by, &windows, &mut pushed,
                    true,
                )?;
                let mut input: PlanNodeRef = scan;
                if let Some(residual) = &split.residual {
                    input = Arc::new(ClientFilter {
                        input,
                        label: format_expr(residual),
                        predicate: builder.compiler.compile_predicate(residual)?,
                    });
                }
                let sorted_on_group_key = pushed.orders
                    && !select.group_by.is_empty()
                    && group_key_matches_order(select, order_by);
                let (agg_node, rewrites) =
                    build_client_aggregate_node(builder, select, input, sorted_on_group_key)?;
                node = agg_node;
                projection = rewrite_projection(projection, &rewrites);
                if let Some(having) = &select.having {
                    let having = replace_with_columns(having, &rewrites);
                    node = Arc::new(ClientFilter {
                        input: node,
                        label: format_expr(&having),
                        predicate: builder.compiler.compile_predicate(&having)?,
                    });
                }
                // A stream aggregate emits groups in key order, so a fully
                // matching ORDER BY is already satisfied; anything else gets
                // the client sort.
                pushed.orders =
                    sorted_on_group_key && order_by.len() == select.group_by.len();
            }
        }
    } else {
        node = build_plain_scan(
            builder, select, entity, alias, &split, order_by, &windows, &mut pushed, false,
        )?;
        if let Some(residual) = &split.residual {
            node = Arc::new(ClientFilter {
                input: node,
                label: format_expr(residual),
                predicate: builder.compiler.compile_predicate(residual)?,
            });
        }
    }

    if !windows.is_empty() {
        let (spool, rewrites) = build_window_spool(builder, &windows, node)?;
        node = spool;
        projection = rewrite_projection(projection, &rewrites);
    }

    let sort_early = !order_by.is_empty()
        && !pushed.orders
        && !order_targets_projection(&projection, order_by);
    if sort_early {
        node = Arc::new(Sort {
            input: node,
            keys: compile_sort_keys(builder, order_by)?,
        });
    }

    node = apply_projection(builder, node, &projection)?;
    node = apply_tail(
        builder,
        node,
        select,
        order_by,
        offset,
        fetch,
        pushed.orders || sort_early,
        pushed.top,
        pushed.distinct,
    )?;
    wrap_binds(builder, node, binds, scope, bind_counter)
}

fn group_key_matches_order(select: &Select, order_by: &[SortExpr]) -> bool {
    if order_by.len() < select.group_by.len() {
        return false;
    }
    select
        .group_by
        .iter()
        .zip(order_by.iter())
        .all(|(group, sort)| group == &sort.expr)
}

/// Stream aggregation when the pushed-down scan order matches the full
/// group key; hash aggregation otherwise.
fn build_client_aggregate_node(
    builder: &PlanBuilder,
    select: &Select,
    input: PlanNodeRef,
    sorted: bool,
) -> Result<(PlanNodeRef, Vec<(Expr, String)>)> {
    let parts = build_aggregate_parts(builder, select)?;
    let node: PlanNodeRef = if sorted {
        Arc::new(StreamAggregate {
            input,
            group_by: parts.group_by,
            aggregates: parts.aggregates,
        })
    } else {
        Arc::new(HashAggregate {
            input,
            group_by: parts.group_by,
            aggregates: parts.aggregates,
        })
    };
    Ok((node, parts.rewrites))
}

/// A pushable aggregate shape, or None when it must stay client-side.
struct PushableAggregatePlan {
    group_columns: Vec<(String, String)>,
    aggregates: Vec<PushedAggregate>,
    has_count_distinct: bool,
}

fn plan_pushable_aggregate(
    builder: &PlanBuilder,
    select: &Select,
    entity: &str,
    alias: &str,
) -> Result<(Option<PushableAggregatePlan>, Vec<(Expr, String)>)> {
    let mut exprs: Vec<&Expr> = projection_exprs(select);
    if let Some(having) = &select.having {
        exprs.push(having);
    }
    let aggregates = collect_aggregates(&exprs);

    let mut rewrites = Vec::new();
    let mut group_columns = Vec::new();
    for group in &select.group_by {
        match group {
            Expr::Column(column)
                if column
                    .table
                    .as_deref()
                    .map_or(true, |t| t.eq_ignore_ascii_case(alias)) =>
            {
                let name = column.name.to_lowercase();
                rewrites.push((group.clone(), name.clone()));
                group_columns.push((name.clone(), name));
            }
            _ => return Ok((None, Vec::new())),
        }
    }

    let primary_key = builder
        .metadata
        .entity(entity)
        .map(|meta| meta.primary_key.clone())
        .unwrap_or_else(|| format!("{}id", entity.to_lowercase()));

    let mut pushed = Vec::new();
    let mut has_count_distinct = false;
    for (i, aggregate) in aggregates.iter().enumerate() {
        let (func, arg, distinct) = match aggregate {
            Expr::Aggregate {
                func,
                arg,
                distinct,
                separator: None,
            } => (*func, arg, *distinct),
            _ => return Ok((None, Vec::new())),
        };
        if matches!(func, AggregateFunc::StringAgg) {
            return Ok((None, Vec::new()));
        }
        if distinct && !matches!(func, AggregateFunc::Count) {
            return Ok((None, Vec::new()));
        }
        if distinct {
            has_count_distinct = true;
        }
        let attribute = match arg {
            None => primary_key.clone(),
            Some(arg) => match &**arg {
                Expr::Column(column)
                    if column
                        .table
                        .as_deref()
                        .map_or(true, |t| t.eq_ignore_ascii_case(alias)) =>
                {
                    column.name.to_lowercase()
                }
                _ => return Ok((None, Vec::new())),
            },
        };
        let output = aggregate_output_name(select, aggregate, i);
        rewrites.push((aggregate.clone(), output.clone()));
        pushed.push(PushedAggregate {
            output,
            func,
            attribute,
            distinct,
        });
    }

    Ok((
        Some(PushableAggregatePlan {
            group_columns,
            aggregates: pushed,
            has_count_distinct,
        }),
        rewrites,
    ))
}

/// Single aggregate fetch, or the partitioned adaptive rewrite when the
/// estimate exceeds the aggregate cap and a timestamp range is known.
fn build_pushed_aggregate(
    builder: &PlanBuilder,
    entity: &str,
    split: &crate::plan::pushdown::PredicateSplit,
    plan: PushableAggregatePlan,
) -> Result<PlanNodeRef> {
    let estimated = builder.estimates.count(entity).unwrap_or(-1);
    let range = builder.estimates.range(entity);
    let ts_column = builder
        .metadata
        .entity(entity)
        .and_then(|meta| meta.created_on_attribute.clone())
        .unwrap_or_else(|| "createdon".to_string());
    let partition_eligible = estimated > limits::AGGREGATE_RECORD_CAP
        && !plan.has_count_distinct
        && range.is_some()
        // A caller filter on the partition column itself would double-apply
        // against the injected range conditions; any other filter rides
        // along into every subrange request.
        && !filter_references(split.filter.as_ref(), &ts_column);

    if partition_eligible {
        let (min, max) = range.expect("checked");
        if let Some((min, max)) = usable_range(Some(min), Some(max)) {
            let template = build_aggregate_query(
                entity,
                split.filter.clone(),
                &plan.group_columns,
                &plan.aggregates,
                true,
            )?;
            let count = partition_count(estimated, limits::AGGREGATE_PARTITION_TARGET);
            let children: Vec<PlanNodeRef> = uniform_partitions(min, max, count)
                .into_iter()
                .map(|(start, end)| -> PlanNodeRef {
                    Arc::new(AdaptiveAggregateScan {
                        entity: entity.to_string(),
                        template: template.clone(),
                        ts_column: ts_column.clone(),
                        start,
                        end,
                        estimated: estimated / count as i64,
                    })
                })
                .collect();
            let merges = merge_specs(&plan);
            let group_by = plan
                .group_columns
                .iter()
                .map(|(output, _)| output.clone())
                .collect();
            tracing::debug!(
                target: "marlinsql::plan",
                entity,
                partitions = count,
                estimated,
                "partitioned aggregate rewrite"
            );
            return Ok(Arc::new(MergeAggregate {
                input: Arc::new(ParallelPartition { children }),
                group_by,
                merges,
            }));
        }
    }

    let query = build_aggregate_query(
        entity,
        split.filter.clone(),
        &plan.group_columns,
        &plan.aggregates,
        false,
    )?;
    let mut scan = FetchScan::new(entity.to_lowercase(), query);
    scan.estimated = if plan.group_columns.is_empty() { 1 } else { -1 };
    Ok(Arc::new(scan))
}

fn merge_specs(plan: &PushableAggregatePlan) -> Vec<MergeSpec> {
    plan.aggregates
        .iter()
        .map(|aggregate| MergeSpec {
            column: aggregate.output.clone(),
            kind: match aggregate.func {
                AggregateFunc::CountStar | AggregateFunc::Count | AggregateFunc::Sum => {
                    MergeKind::Sum
                }
                AggregateFunc::Min => MergeKind::Min,
                AggregateFunc::Max => MergeKind::Max,
                AggregateFunc::Avg => MergeKind::Avg {
                    sum_column: avg_sum_column(&aggregate.output),
                    count_column: avg_count_column(&aggregate.output),
                },
                AggregateFunc::StringAgg => unreachable!("rejected earlier"),
            },
        })
        .collect()
}

/// A plain (non-aggregate) scan with attribute, order, TOP, DISTINCT and
/// paging pushdown.
#[allow(clippy::too_many_arguments)]
fn build_plain_scan(
    builder: &PlanBuilder,
    select: &Select,
    entity: &str,
    alias: &str,
    split: &crate::plan::pushdown::PredicateSplit,
    order_by: &[SortExpr],
    windows: &[Expr],
    pushed: &mut PushedShape,
    for_aggregation: bool,
) -> Result<PlanNodeRef> {
    let mut fetch_entity = FetchEntity::new(entity.to_lowercase());

    // Needed attributes from every expression that will evaluate client-side.
    match needed_attributes(select, split.residual.as_ref(), order_by, windows, alias) {
        Some(attributes) => {
            for attribute in attributes {
                fetch_entity
                    .attributes
                    .push(FetchAttribute::plain(attribute));
            }
        }
        None => fetch_entity.all_attributes = true,
    }
    fetch_entity.filter = split.filter.clone();

    // Orders push when every key is a bare attribute of this entity and no
    // client-side stage would disturb them. An aggregation input may still
    // push an order matching the group key, enabling stream aggregation.
    let can_push_orders = !order_by.is_empty()
        && split.residual.is_none()
        && windows.is_empty()
        && (!for_aggregation || group_key_matches_order(select, order_by))
        && order_by.iter().all(|sort| {
            matches!(
                &sort.expr,
                Expr::Column(column)
                    if column.table.as_deref().map_or(true, |t| t.eq_ignore_ascii_case(alias))
            )
        });
    if can_push_orders {
        for sort in order_by {
            if let Expr::Column(column) = &sort.expr {
                fetch_entity.orders.push(FetchOrder {
                    attribute: column.name.to_lowercase(),
                    alias: None,
                    descending: !sort.ascending,
                });
            }
        }
        pushed.orders = true;
    }

    let mut query = FetchQuery::new(fetch_entity);

    // DISTINCT of bare columns dedups remotely.
    if select.distinct
        && !for_aggregation
        && split.residual.is_none()
        && windows.is_empty()
        && select
            .projection
            .iter()
            .all(|item| matches!(item, SelectItem::Expr { expr: Expr::Column(_), .. }))
    {
        query.distinct = true;
        pushed.distinct = true;
    }

    // TOP n with a literal count pushes when ordering is settled remotely.
    if let Some(top) = &select.top {
        if !top.percent && (order_by.is_empty() || pushed.orders) && split.residual.is_none() {
            if let Expr::Literal(Literal::Int(n)) = &top.quantity {
                if *n >= 0 {
                    query.top = Some(*n as u64);
                    pushed.top = true;
                }
            }
        }
    }

    if let Some(size) = builder.options.page_size {
        query.page_size = Some(size);
    }

    let mut scan = FetchScan::new(entity.to_lowercase(), query);
    scan.estimated = builder.estimates.count(entity).unwrap_or(-1);
    // Caller paging applies only when rows stream straight out of the scan;
    // capping an aggregation or window input would corrupt the result.
    if !for_aggregation && windows.is_empty() && split.residual.is_none() {
        scan.initial_cookie = builder.options.paging_cookie.clone();
        scan.max_rows = builder.options.max_rows;
    }

    Ok(Arc::new(PrefetchScan {
        input: Arc::new(scan),
        buffer: limits::DEFAULT_PAGE_SIZE as usize,
    }))
}

/// Attributes the scan must fetch; None means `all-attributes` (wildcard or
/// unresolvable references).
fn needed_attributes(
    select: &Select,
    residual: Option<&Expr>,
    order_by: &[SortExpr],
    windows: &[Expr],
    alias: &str,
) -> Option<Vec<String>> {
    let mut attributes: Vec<String> = Vec::new();
    let mut add_expr = |expr: &Expr| -> bool {
        let mut ok = true;
        for column in expr.referenced_columns() {
            match &column.table {
                Some(table) if !table.eq_ignore_ascii_case(alias) => ok = false,
                _ => {
                    let name = column.name.to_lowercase();
                    if !attributes.contains(&name) {
                        attributes.push(name);
                    }
                }
            }
        }
        ok
    };

    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => return None,
            SelectItem::Expr { expr, .. } => {
                if !add_expr(expr) {
                    return None;
                }
            }
        }
    }
    if let Some(residual) = residual {
        if !add_expr(residual) {
            return None;
        }
    }
    for sort in order_by {
        if !add_expr(&sort.expr) {
            return None;
        }
    }
    for window in windows {
        if !add_expr(window) {
            return None;
        }
    }
    for group in &select.group_by {
        if !add_expr(group) {
            return None;
        }
    }
    if let Some(having) = &select.having {
        if !add_expr(having) {
            return None;
        }
    }
    if attributes.is_empty() {
        return None;
    }
    Some(attributes)
}
