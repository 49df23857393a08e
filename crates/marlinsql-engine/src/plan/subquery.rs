use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{BinaryOp, ColumnRef, Expr, Query, SelectItem};

/// Structural map over an expression: `f` may replace any node; children of
/// untouched nodes are mapped recursively. Subqueries are not descended into.
pub(crate) fn map_expr(expr: &Expr, f: &impl Fn(&Expr) -> Option<Expr>) -> Expr {
    if let Some(replaced) = f(expr) {
        return replaced;
    }
    match expr {
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(map_expr(left, f)),
            op: *op,
            right: Box::new(map_expr(right, f)),
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(map_expr(expr, f)),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(map_expr(expr, f)),
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            escape,
            negated,
        } => Expr::Like {
            expr: Box::new(map_expr(expr, f)),
            pattern: Box::new(map_expr(pattern, f)),
            escape: *escape,
            negated: *negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(map_expr(expr, f)),
            list: list.iter().map(|e| map_expr(e, f)).collect(),
            negated: *negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: Box::new(map_expr(expr, f)),
            low: Box::new(map_expr(low, f)),
            high: Box::new(map_expr(high, f)),
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            else_result,
        } => Expr::Case {
            operand: operand.as_ref().map(|o| Box::new(map_expr(o, f))),
            branches: branches
                .iter()
                .map(|(w, t)| (map_expr(w, f), map_expr(t, f)))
                .collect(),
            else_result: else_result.as_ref().map(|e| Box::new(map_expr(e, f))),
        },
        Expr::Cast {
            expr,
            to,
            lenient,
            style,
        } => Expr::Cast {
            expr: Box::new(map_expr(expr, f)),
            to: to.clone(),
            lenient: *lenient,
            style: *style,
        },
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|a| map_expr(a, f)).collect(),
        },
        Expr::Aggregate {
            func,
            arg,
            distinct,
            separator,
        } => Expr::Aggregate {
            func: *func,
            arg: arg.as_ref().map(|a| Box::new(map_expr(a, f))),
            distinct: *distinct,
            separator: separator.clone(),
        },
        Expr::Window {
            func,
            args,
            partition_by,
            order_by,
            frame,
        } => Expr::Window {
            func: func.clone(),
            args: args.iter().map(|a| map_expr(a, f)).collect(),
            partition_by: partition_by.iter().map(|p| map_expr(p, f)).collect(),
            order_by: order_by
                .iter()
                .map(|s| marlinsql_ir::SortExpr {
                    expr: map_expr(&s.expr, f),
                    ascending: s.ascending,
                })
                .collect(),
            frame: frame.clone(),
        },
        leaf => leaf.clone(),
    }
}

/// Replace every occurrence of the listed expressions with bare column
/// references onto the named output columns.
pub(crate) fn replace_with_columns(expr: &Expr, table: &[(Expr, String)]) -> Expr {
    map_expr(expr, &|candidate| {
        table
            .iter()
            .find(|(target, _)| target == candidate)
            .map(|(_, name)| Expr::Column(ColumnRef::bare(name.clone())))
    })
}

/// Distinct aggregate expressions appearing in the given expressions, in
/// first-appearance order.
pub(crate) fn collect_aggregates(exprs: &[&Expr]) -> Vec<Expr> {
    let mut found: Vec<Expr> = Vec::new();
    for expr in exprs {
        expr.walk(&mut |e| {
            if e.is_aggregate() && !found.contains(e) {
                found.push(e.clone());
            }
        });
    }
    found
}

pub(crate) fn collect_windows(exprs: &[&Expr]) -> Vec<Expr> {
    let mut found: Vec<Expr> = Vec::new();
    for expr in exprs {
        expr.walk(&mut |e| {
            if matches!(e, Expr::Window { .. }) && !found.contains(e) {
                found.push(e.clone());
            }
        });
    }
    found
}

/// A WHERE-clause subquery rewritten to a join.
pub(crate) struct JoinRewrite {
    pub query: Query,
    /// Probe-side key expressions paired with build-side output column names.
    pub keys: Vec<(Expr, String)>,
    pub anti: bool,
    pub null_aware: bool,
}

/// A correlated scalar subquery rewritten to a left outer join that asserts
/// at most one build row per key. The subquery's value lands in a synthetic
/// output column; the enclosing expression reads it as a plain column.
pub(crate) struct ScalarJoinRewrite {
    pub query: Query,
    /// Probe-side key expressions paired with build-side output column names.
    pub keys: Vec<(Expr, String)>,
}

/// An uncorrelated subquery bound to an internal variable before execution.
pub(crate) struct VariableBind {
    pub variable: String,
    pub query: Query,
    pub exists: bool,
}

pub(crate) struct WhereAnalysis {
    pub joins: Vec<JoinRewrite>,
    pub scalar_joins: Vec<ScalarJoinRewrite>,
    pub binds: Vec<VariableBind>,
    /// The predicate that remains for pushdown / client filtering.
    pub remaining: Option<Expr>,
}

/// Decompose a WHERE clause: `IN (SELECT ...)` and correlated `EXISTS`
/// conjuncts become semi/anti joins, uncorrelated `EXISTS` and scalar
/// subqueries become pre-executed variable binds, everything else remains.
pub(crate) fn analyze_where(
    selection: Option<&Expr>,
    outer_aliases: &[String],
    bind_counter: &mut usize,
) -> Result<WhereAnalysis> {
    let mut joins = Vec::new();
    let mut scalar_joins = Vec::new();
    let mut binds = Vec::new();
    let mut remaining: Option<Expr> = None;

    let conjuncts = match selection {
        Some(expr) => split_and(expr),
        None => Vec::new(),
    };

    for conjunct in conjuncts {
        match conjunct {
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let key_column = single_output_column(subquery).ok_or_else(|| {
                    Error::plan("IN subquery must select exactly one column")
                })?;
                joins.push(JoinRewrite {
                    query: (**subquery).clone(),
                    keys: vec![((**expr).clone(), key_column)],
                    anti: *negated,
                    null_aware: *negated,
                });
            }
            Expr::Exists { subquery, negated } => {
                let (keys, residual) = decorrelate(subquery, outer_aliases)?;
                if keys.is_empty() {
                    let variable = next_bind(bind_counter);
                    binds.push(VariableBind {
                        variable: variable.clone(),
                        query: (**subquery).clone(),
                        exists: true,
                    });
                    let test = Expr::Binary {
                        left: Box::new(Expr::Variable(variable)),
                        op: BinaryOp::Eq,
                        right: Box::new(Expr::literal_bool(!negated)),
                    };
                    remaining = merge_and(remaining, test);
                } else {
                    let mut query = (**subquery).clone();
                    set_selection(&mut query, residual.clone());
                    joins.push(JoinRewrite {
                        query,
                        keys,
                        anti: *negated,
                        null_aware: false,
                    });
                }
            }
            other => {
                // Correlated scalar subqueries become single-row left joins;
                // whatever stays uncorrelated pre-executes and binds.
                let rewritten = rewrite_correlated_scalars(
                    other,
                    outer_aliases,
                    bind_counter,
                    &mut scalar_joins,
                )?;
                let rewritten =
                    bind_scalar_subqueries(&rewritten, outer_aliases, bind_counter, &mut binds)?;
                remaining = merge_and(remaining, rewritten);
            }
        }
    }

    Ok(WhereAnalysis {
        joins,
        scalar_joins,
        binds,
        remaining,
    })
}

/// Replace every correlated scalar subquery in the expression with a
/// reference onto a synthetic join output column, collecting one
/// `ScalarJoinRewrite` per subquery.
pub(crate) fn rewrite_correlated_scalars(
    expr: &Expr,
    outer_aliases: &[String],
    counter: &mut usize,
    joins: &mut Vec<ScalarJoinRewrite>,
) -> Result<Expr> {
    if outer_aliases.is_empty() || !expr.contains_subquery() {
        return Ok(expr.clone());
    }
    let mut candidates: Vec<Expr> = Vec::new();
    expr.walk(&mut |e| {
        if let Expr::ScalarSubquery(subquery) = e {
            if references_aliases(subquery, outer_aliases) && !candidates.contains(e) {
                candidates.push(e.clone());
            }
        }
    });
    let mut table: Vec<(Expr, Expr)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let subquery = match &candidate {
            Expr::ScalarSubquery(subquery) => subquery,
            _ => unreachable!("only scalar subqueries are collected"),
        };
        let value_column = format!("__scalar{}", *counter);
        *counter += 1;
        joins.push(plan_scalar_join(subquery, outer_aliases, value_column.clone())?);
        table.push((candidate, Expr::Column(ColumnRef::bare(value_column))));
    }
    Ok(map_expr(expr, &|e| {
        table
            .iter()
            .find(|(target, _)| target == e)
            .map(|(_, replacement)| replacement.clone())
    }))
}

/// Decorrelate one scalar subquery into a joinable shape: the correlation
/// equalities become join keys, the scalar value gets the synthetic output
/// name, and the correlation keys surface through the projection (and the
/// group key, for aggregating subqueries, so each key yields one row).
fn plan_scalar_join(
    query: &Query,
    outer_aliases: &[String],
    value_column: String,
) -> Result<ScalarJoinRewrite> {
    let (keys, residual) = decorrelate(query, outer_aliases)?;
    if keys.is_empty() {
        return Err(Error::not_supported(
            "correlated scalar subqueries support only equality correlation in WHERE",
        ));
    }

    let mut query = query.clone();
    let select = match &mut query.body {
        marlinsql_ir::QueryBody::Select(select) => select,
        marlinsql_ir::QueryBody::SetOperation { .. } => {
            return Err(Error::not_supported(
                "set operations in a correlated scalar subquery",
            ))
        }
    };
    select.selection = residual;

    match select.projection.as_mut_slice() {
        [SelectItem::Expr { alias, .. }] => *alias = Some(value_column),
        _ => {
            return Err(Error::plan(
                "a scalar subquery must select exactly one expression",
            ))
        }
    }
    let grouped = !select.group_by.is_empty()
        || select.projection.iter().any(|item| {
            matches!(item, SelectItem::Expr { expr, .. } if expr.contains_aggregate())
        });
    for (_, inner) in &keys {
        select.projection.push(SelectItem::Expr {
            expr: Expr::Column(ColumnRef::bare(inner.clone())),
            alias: None,
        });
        if grouped {
            select
                .group_by
                .push(Expr::Column(ColumnRef::bare(inner.clone())));
        }
    }

    Ok(ScalarJoinRewrite { query, keys })
}

/// Whether any aggregate argument in the expression nests a correlated
/// subquery; that shape has no join rewrite and is rejected at plan time.
pub(crate) fn aggregate_arg_has_correlated_subquery(
    expr: &Expr,
    outer_aliases: &[String],
) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Aggregate { arg: Some(arg), .. } = e {
            arg.walk(&mut |inner| match inner {
                Expr::ScalarSubquery(subquery) | Expr::Exists { subquery, .. } => {
                    if references_aliases(subquery, outer_aliases) {
                        found = true;
                    }
                }
                _ => {}
            });
        }
    });
    found
}

pub(crate) fn bind_scalar_subqueries(
    expr: &Expr,
    outer_aliases: &[String],
    bind_counter: &mut usize,
    binds: &mut Vec<VariableBind>,
) -> Result<Expr> {
    // First pass: collect the uncorrelated subquery nodes in this expression.
    let mut candidates: Vec<Expr> = Vec::new();
    expr.walk(&mut |e| match e {
        Expr::ScalarSubquery(subquery) | Expr::Exists { subquery, .. } => {
            if !references_aliases(subquery, outer_aliases) && !candidates.contains(e) {
                candidates.push(e.clone());
            }
        }
        _ => {}
    });

    // Second pass: allocate one bind per candidate and substitute.
    let mut table: Vec<(Expr, Expr)> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let variable = next_bind(bind_counter);
        let replacement = match &candidate {
            Expr::ScalarSubquery(subquery) => {
                binds.push(VariableBind {
                    variable: variable.clone(),
                    query: (**subquery).clone(),
                    exists: false,
                });
                Expr::Variable(variable)
            }
            Expr::Exists { subquery, negated } => {
                binds.push(VariableBind {
                    variable: variable.clone(),
                    query: (**subquery).clone(),
                    exists: true,
                });
                Expr::Binary {
                    left: Box::new(Expr::Variable(variable)),
                    op: BinaryOp::Eq,
                    right: Box::new(Expr::literal_bool(!negated)),
                }
            }
            _ => unreachable!("only subquery nodes are collected"),
        };
        table.push((candidate, replacement));
    }

    let out = map_expr(expr, &|e| {
        table
            .iter()
            .find(|(target, _)| target == e)
            .map(|(_, replacement)| replacement.clone())
    });
    if out.contains_subquery() {
        return Err(Error::not_supported("subquery in this position"));
    }
    Ok(out)
}

fn next_bind(counter: &mut usize) -> String {
    let variable = format!("@__subq{}", *counter);
    *counter += 1;
    variable
}

fn split_and(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
        match expr {
            Expr::Binary {
                left,
                op: BinaryOp::And,
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

pub(crate) fn merge_and(acc: Option<Expr>, next: Expr) -> Option<Expr> {
    Some(match acc {
        Some(acc) => Expr::Binary {
            left: Box::new(acc),
            op: BinaryOp::And,
            right: Box::new(next),
        },
        None => next,
    })
}

/// Output column name of a one-column subquery.
fn single_output_column(query: &Query) -> Option<String> {
    let select = query.first_select();
    if select.projection.len() != 1 {
        return None;
    }
    match &select.projection[0] {
        SelectItem::Expr { alias: Some(a), .. } => Some(a.clone()),
        SelectItem::Expr {
            expr: Expr::Column(c),
            ..
        } => Some(c.name.clone()),
        _ => None,
    }
}

/// Pull `inner_col = outer_alias.col` equalities out of a correlated EXISTS
/// subquery's WHERE clause. Returns (probe expr, build column) pairs plus the
/// remaining uncorrelated predicate.
fn decorrelate(
    query: &Query,
    outer_aliases: &[String],
) -> Result<(Vec<(Expr, String)>, Option<Expr>)> {
    let select = query.first_select();
    let mut keys = Vec::new();
    let mut residual: Option<Expr> = None;

    let conjuncts = match &select.selection {
        Some(expr) => split_and(expr),
        None => Vec::new(),
    };
    for conjunct in conjuncts {
        if let Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } = conjunct
        {
            match (classify(left, outer_aliases), classify(right, outer_aliases)) {
                (Side::Outer(outer), Side::Inner(inner))
                | (Side::Inner(inner), Side::Outer(outer)) => {
                    keys.push((Expr::Column(outer), inner.name));
                    continue;
                }
                _ => {}
            }
        }
        if references_expr_aliases(conjunct, outer_aliases) {
            return Err(Error::not_supported(
                "correlated subqueries support only equality correlation",
            ));
        }
        residual = merge_and(residual, conjunct.clone());
    }
    Ok((keys, residual))
}

enum Side {
    Outer(ColumnRef),
    Inner(ColumnRef),
    Neither,
}

fn classify(expr: &Expr, outer_aliases: &[String]) -> Side {
    match expr {
        Expr::Column(column) => match &column.table {
            Some(table)
                if outer_aliases
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(table)) =>
            {
                Side::Outer(column.clone())
            }
            _ => Side::Inner(column.clone()),
        },
        _ => Side::Neither,
    }
}

fn references_expr_aliases(expr: &Expr, outer_aliases: &[String]) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Column(column) = e {
            if let Some(table) = &column.table {
                if outer_aliases.iter().any(|a| a.eq_ignore_ascii_case(table)) {
                    found = true;
                }
            }
        }
    });
    found
}

/// Whether any expression inside the query references an outer alias through
/// a qualified column. Bare-name correlation is not detectable without the
/// subquery's schema and is treated as uncorrelated.
fn references_aliases(query: &Query, outer_aliases: &[String]) -> bool {
    let select = query.first_select();
    let mut exprs: Vec<&Expr> = Vec::new();
    for item in &select.projection {
        if let SelectItem::Expr { expr, .. } = item {
            exprs.push(expr);
        }
    }
    if let Some(selection) = &select.selection {
        exprs.push(selection);
    }
    exprs
        .iter()
        .any(|e| references_expr_aliases(e, outer_aliases))
}

fn set_selection(query: &mut Query, selection: Option<Expr>) {
    if let marlinsql_ir::QueryBody::Select(select) = &mut query.body {
        select.selection = selection;
    }
}

#[cfg(test)]
mod tests {
    use marlinsql_ir::{Literal, Select, TableSource, TableWithJoins};

    use super::*;

    fn subquery(selection: Option<Expr>) -> Query {
        Query::single_select(Select {
            distinct: false,
            top: None,
            projection: vec![SelectItem::Expr {
                expr: Expr::Column(ColumnRef::bare("parentaccountid")),
                alias: None,
            }],
            from: Some(TableWithJoins {
                base: TableSource::Entity {
                    schema: None,
                    name: "contact".into(),
                    alias: None,
                },
                joins: Vec::new(),
            }),
            selection,
            group_by: Vec::new(),
            having: None,
        })
    }

    #[test]
    fn test_in_subquery_becomes_semi_join() {
        let selection = Expr::InSubquery {
            expr: Box::new(Expr::Column(ColumnRef::bare("accountid"))),
            subquery: Box::new(subquery(None)),
            negated: false,
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &["account".into()], &mut counter).unwrap();
        assert_eq!(analysis.joins.len(), 1);
        assert!(!analysis.joins[0].anti);
        assert_eq!(analysis.joins[0].keys[0].1, "parentaccountid");
        assert!(analysis.remaining.is_none());
    }

    #[test]
    fn test_not_in_is_null_aware() {
        let selection = Expr::InSubquery {
            expr: Box::new(Expr::Column(ColumnRef::bare("accountid"))),
            subquery: Box::new(subquery(None)),
            negated: true,
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &[], &mut counter).unwrap();
        assert!(analysis.joins[0].anti);
        assert!(analysis.joins[0].null_aware);
    }

    #[test]
    fn test_correlated_exists_decorrelates() {
        let correlated = Expr::Binary {
            left: Box::new(Expr::Column(ColumnRef::bare("parentaccountid"))),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Column(ColumnRef::qualified("a", "accountid"))),
        };
        let selection = Expr::Exists {
            subquery: Box::new(subquery(Some(correlated))),
            negated: false,
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &["a".into()], &mut counter).unwrap();
        assert_eq!(analysis.joins.len(), 1);
        assert_eq!(analysis.joins[0].keys.len(), 1);
        assert_eq!(analysis.joins[0].keys[0].1, "parentaccountid");
    }

    #[test]
    fn test_uncorrelated_exists_binds() {
        let selection = Expr::Exists {
            subquery: Box::new(subquery(None)),
            negated: true,
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &[], &mut counter).unwrap();
        assert!(analysis.joins.is_empty());
        assert_eq!(analysis.binds.len(), 1);
        assert!(analysis.binds[0].exists);
        assert!(analysis.remaining.is_some());
    }

    #[test]
    fn test_scalar_subquery_binds_inside_expression() {
        let selection = Expr::Binary {
            left: Box::new(Expr::Column(ColumnRef::bare("revenue"))),
            op: BinaryOp::Gt,
            right: Box::new(Expr::ScalarSubquery(Box::new(subquery(None)))),
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &[], &mut counter).unwrap();
        assert_eq!(analysis.binds.len(), 1);
        assert!(!analysis.binds[0].exists);
        match analysis.remaining.unwrap() {
            Expr::Binary { right, .. } => {
                assert_eq!(*right, Expr::Variable("@__subq0".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_correlated_scalar_becomes_single_row_join() {
        // revenue > (SELECT MAX(statecode) FROM contact
        //            WHERE parentaccountid = a.accountid)
        let correlated = Expr::Binary {
            left: Box::new(Expr::Column(ColumnRef::bare("parentaccountid"))),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Column(ColumnRef::qualified("a", "accountid"))),
        };
        let mut inner = subquery(Some(correlated));
        if let marlinsql_ir::QueryBody::Select(select) = &mut inner.body {
            select.projection = vec![SelectItem::Expr {
                expr: Expr::Aggregate {
                    func: marlinsql_ir::AggregateFunc::Max,
                    arg: Some(Box::new(Expr::Column(ColumnRef::bare("statecode")))),
                    distinct: false,
                    separator: None,
                },
                alias: None,
            }];
        }
        let selection = Expr::Binary {
            left: Box::new(Expr::Column(ColumnRef::qualified("a", "revenue"))),
            op: BinaryOp::Gt,
            right: Box::new(Expr::ScalarSubquery(Box::new(inner))),
        };
        let mut counter = 0;
        let analysis = analyze_where(Some(&selection), &["a".into()], &mut counter).unwrap();

        assert_eq!(analysis.scalar_joins.len(), 1);
        let rewrite = &analysis.scalar_joins[0];
        assert_eq!(rewrite.keys.len(), 1);
        assert_eq!(rewrite.keys[0].1, "parentaccountid");

        // The subquery now groups by the correlation key and surfaces it.
        let select = rewrite.query.first_select();
        assert!(select.selection.is_none());
        assert_eq!(select.projection.len(), 2);
        assert!(matches!(
            &select.projection[0],
            SelectItem::Expr { alias: Some(alias), .. } if alias == "__scalar0"
        ));
        assert_eq!(
            select.group_by,
            vec![Expr::Column(ColumnRef::bare("parentaccountid"))]
        );

        // The conjunct reads the synthetic column instead of the subquery.
        match analysis.remaining.unwrap() {
            Expr::Binary { right, .. } => {
                assert_eq!(*right, Expr::Column(ColumnRef::bare("__scalar0")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_arg_correlation_detection() {
        let correlated_subquery = subquery(Some(Expr::Binary {
            left: Box::new(Expr::Column(ColumnRef::bare("parentaccountid"))),
            op: BinaryOp::Eq,
            right: Box::new(Expr::Column(ColumnRef::qualified("a", "accountid"))),
        }));
        let inside_aggregate = Expr::Aggregate {
            func: marlinsql_ir::AggregateFunc::Sum,
            arg: Some(Box::new(Expr::ScalarSubquery(Box::new(
                correlated_subquery.clone(),
            )))),
            distinct: false,
            separator: None,
        };
        assert!(aggregate_arg_has_correlated_subquery(
            &inside_aggregate,
            &["a".into()]
        ));
        // The same subquery outside an aggregate argument does not trip it.
        let beside_aggregate = Expr::Binary {
            left: Box::new(Expr::ScalarSubquery(Box::new(correlated_subquery))),
            op: BinaryOp::Gt,
            right: Box::new(Expr::Literal(Literal::Int(0))),
        };
        assert!(!aggregate_arg_has_correlated_subquery(
            &beside_aggregate,
            &["a".into()]
        ));
    }

    #[test]
    fn test_replace_with_columns() {
        let agg = Expr::Aggregate {
            func: marlinsql_ir::AggregateFunc::CountStar,
            arg: None,
            distinct: false,
            separator: None,
        };
        let expr = Expr::Binary {
            left: Box::new(agg.clone()),
            op: BinaryOp::Gt,
            right: Box::new(Expr::Literal(Literal::Int(5))),
        };
        let rewritten = replace_with_columns(&expr, &[(agg, "agg0".into())]);
        match rewritten {
            Expr::Binary { left, .. } => {
                assert_eq!(*left, Expr::Column(ColumnRef::bare("agg0")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
