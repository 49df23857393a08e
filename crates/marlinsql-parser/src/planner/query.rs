use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{
    BinaryOp, Cte, Expr, Join, JoinKind, Query, QueryBody, Select, SelectItem, SetOperator,
    StatementKind, TableSource, TableWithJoins, TopClause,
};
use sqlparser::ast;

use crate::expr::{plan_expr, plan_order_by};

/// Top-level SELECT statement, recognizing `SELECT @var = expr` projection
/// assignments.
pub(crate) fn plan_query_statement(q: &ast::Query) -> Result<StatementKind> {
    let mut query = plan_query(q)?;
    let mut into_variables = Vec::new();

    if let QueryBody::Select(select) = &mut query.body {
        let mut all_assign = true;
        let mut rewritten = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            match item {
                SelectItem::Expr {
                    expr:
                        Expr::Binary {
                            left,
                            op: BinaryOp::Eq,
                            right,
                        },
                    alias: None,
                } if matches!(&**left, Expr::Variable(_)) => {
                    let name = match &**left {
                        Expr::Variable(name) => name.clone(),
                        _ => unreachable!(),
                    };
                    rewritten.push(SelectItem::Expr {
                        expr: (**right).clone(),
                        alias: Some(name.trim_start_matches('@').to_string()),
                    });
                    into_variables.push(name);
                }
                other => {
                    all_assign = false;
                    rewritten.push(other.clone());
                }
            }
        }
        if !into_variables.is_empty() {
            if !all_assign {
                return Err(Error::plan(
                    "a SELECT may assign variables or return rows, not both",
                ));
            }
            select.projection = rewritten;
        }
    }

    Ok(StatementKind::Select {
        query,
        into_variables,
    })
}

pub(crate) fn plan_query(q: &ast::Query) -> Result<Query> {
    let mut ctes = Vec::new();
    if let Some(with) = &q.with {
        if with.recursive {
            return Err(Error::not_supported("recursive CTEs"));
        }
        for cte in &with.cte_tables {
            ctes.push(Cte {
                name: cte.alias.name.value.clone(),
                columns: cte.alias.columns.iter().map(|c| c.name.value.clone()).collect(),
                query: plan_query(&cte.query)?,
            });
        }
    }

    let body = plan_set_expr(&q.body)?;

    let order_by = match &q.order_by {
        Some(order_by) => order_by
            .exprs
            .iter()
            .map(plan_order_by)
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    if q.limit.is_some() {
        return Err(Error::not_supported("LIMIT (use TOP or OFFSET ... FETCH)"));
    }

    let offset = q
        .offset
        .as_ref()
        .map(|o| plan_expr(&o.value))
        .transpose()?;
    let fetch = match &q.fetch {
        Some(fetch) => {
            if fetch.percent || fetch.with_ties {
                return Err(Error::not_supported("FETCH with PERCENT or WITH TIES"));
            }
            match &fetch.quantity {
                Some(quantity) => Some(plan_expr(quantity)?),
                None => None,
            }
        }
        None => None,
    };

    Ok(Query {
        ctes,
        body,
        order_by,
        offset,
        fetch,
    })
}

#[allow(clippy::wildcard_enum_match_arm)]
fn plan_set_expr(body: &ast::SetExpr) -> Result<QueryBody> {
    match body {
        ast::SetExpr::Select(select) => Ok(QueryBody::Select(Box::new(plan_select(select)?))),
        ast::SetExpr::Query(inner) => {
            let planned = plan_query(inner)?;
            if !planned.ctes.is_empty() || !planned.order_by.is_empty() || planned.offset.is_some()
            {
                return Err(Error::not_supported(
                    "ORDER BY or WITH inside a set-operation branch",
                ));
            }
            Ok(planned.body)
        }
        ast::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            let op = match op {
                ast::SetOperator::Union => SetOperator::Union,
                ast::SetOperator::Intersect => SetOperator::Intersect,
                ast::SetOperator::Except => SetOperator::Except,
                ast::SetOperator::Minus => SetOperator::Except,
            };
            let all = matches!(set_quantifier, ast::SetQuantifier::All);
            Ok(QueryBody::SetOperation {
                op,
                all,
                left: Box::new(plan_set_expr(left)?),
                right: Box::new(plan_set_expr(right)?),
            })
        }
        other => Err(Error::not_supported(format!("query body: {}", other))),
    }
}

fn plan_select(select: &ast::Select) -> Result<Select> {
    let distinct = match &select.distinct {
        None => false,
        Some(ast::Distinct::Distinct) => true,
        Some(ast::Distinct::On(_)) => return Err(Error::not_supported("DISTINCT ON")),
    };

    let top = select.top.as_ref().map(plan_top).transpose()?;

    let projection = select
        .projection
        .iter()
        .map(plan_select_item)
        .collect::<Result<Vec<_>>>()?;

    let from = plan_from(&select.from)?;
    let selection = select.selection.as_ref().map(plan_expr).transpose()?;

    let group_by = match &select.group_by {
        ast::GroupByExpr::Expressions(exprs, modifiers) => {
            if !modifiers.is_empty() {
                return Err(Error::not_supported("GROUP BY modifiers (ROLLUP/CUBE)"));
            }
            exprs.iter().map(plan_expr).collect::<Result<Vec<_>>>()?
        }
        ast::GroupByExpr::All(_) => return Err(Error::not_supported("GROUP BY ALL")),
    };

    let having = select.having.as_ref().map(plan_expr).transpose()?;

    Ok(Select {
        distinct,
        top,
        projection,
        from,
        selection,
        group_by,
        having,
    })
}

fn plan_top(top: &ast::Top) -> Result<TopClause> {
    let quantity = match &top.quantity {
        Some(ast::TopQuantity::Expr(e)) => plan_expr(e)?,
        Some(ast::TopQuantity::Constant(n)) => {
            Expr::Literal(marlinsql_ir::Literal::Int(*n as i64))
        }
        None => return Err(Error::plan("TOP requires a row count")),
    };
    Ok(TopClause {
        quantity,
        percent: top.percent,
        with_ties: top.with_ties,
    })
}

fn plan_select_item(item: &ast::SelectItem) -> Result<SelectItem> {
    match item {
        ast::SelectItem::UnnamedExpr(e) => Ok(SelectItem::Expr {
            expr: plan_expr(e)?,
            alias: None,
        }),
        ast::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expr {
            expr: plan_expr(expr)?,
            alias: Some(alias.value.clone()),
        }),
        ast::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard(None)),
        ast::SelectItem::QualifiedWildcard(name, _) => {
            Ok(SelectItem::Wildcard(Some(name.to_string())))
        }
    }
}

fn plan_from(from: &[ast::TableWithJoins]) -> Result<Option<TableWithJoins>> {
    let mut iter = from.iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return Ok(None),
    };
    let mut planned = plan_table_with_joins(first)?;

    // Additional comma-separated FROM entries are cross joins.
    for extra in iter {
        let extra = plan_table_with_joins(extra)?;
        planned.joins.push(Join {
            source: extra.base,
            kind: JoinKind::Cross,
            condition: None,
        });
        planned.joins.extend(extra.joins);
    }
    Ok(Some(planned))
}

fn plan_table_with_joins(twj: &ast::TableWithJoins) -> Result<TableWithJoins> {
    let base = plan_table_factor(&twj.relation)?;
    let mut joins = Vec::with_capacity(twj.joins.len());
    for join in &twj.joins {
        let source = plan_table_factor(&join.relation)?;
        let (kind, constraint) = match &join.join_operator {
            ast::JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
            ast::JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
            ast::JoinOperator::RightOuter(c) => (JoinKind::Right, Some(c)),
            ast::JoinOperator::FullOuter(c) => (JoinKind::Full, Some(c)),
            ast::JoinOperator::CrossJoin => (JoinKind::Cross, None),
            other => {
                return Err(Error::not_supported(format!("join type {:?}", other)))
            }
        };
        let condition = match constraint {
            Some(ast::JoinConstraint::On(e)) => Some(plan_expr(e)?),
            Some(ast::JoinConstraint::None) | None => None,
            Some(ast::JoinConstraint::Using(_)) | Some(ast::JoinConstraint::Natural) => {
                return Err(Error::not_supported("USING / NATURAL join constraints"))
            }
        };
        joins.push(Join {
            source,
            kind,
            condition,
        });
    }
    Ok(TableWithJoins { base, joins })
}

#[allow(clippy::wildcard_enum_match_arm)]
pub(crate) fn plan_table_factor(factor: &ast::TableFactor) -> Result<TableSource> {
    match factor {
        ast::TableFactor::Table {
            name, alias, args, ..
        } => {
            let alias = alias.as_ref().map(|a| a.name.value.clone());
            if let Some(args) = args {
                return plan_table_function(name, &args.args, alias);
            }
            let (schema, name) = super::object_schema_and_name(name)?;
            Ok(TableSource::Entity {
                schema,
                name,
                alias,
            })
        }
        ast::TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .ok_or_else(|| Error::plan("derived tables require an alias"))?;
            Ok(TableSource::Derived {
                query: Box::new(plan_query(subquery)?),
                alias,
            })
        }
        ast::TableFactor::OpenJsonTable {
            json_expr,
            json_path,
            columns,
            alias,
        } => {
            if !columns.is_empty() {
                return Err(Error::not_supported("OPENJSON WITH column clause"));
            }
            let path = match json_path {
                Some(ast::Value::SingleQuotedString(s)) => Some(s.clone()),
                Some(other) => {
                    return Err(Error::not_supported(format!("OPENJSON path {}", other)))
                }
                None => None,
            };
            Ok(TableSource::OpenJson {
                json: plan_expr(json_expr)?,
                path,
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            })
        }
        other => Err(Error::not_supported(format!("table source: {}", other))),
    }
}

fn plan_table_function(
    name: &ast::ObjectName,
    args: &[ast::FunctionArg],
    alias: Option<String>,
) -> Result<TableSource> {
    let fn_name = super::object_base_name(name).to_lowercase();
    let exprs = args
        .iter()
        .map(|arg| match arg {
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => plan_expr(e),
            other => Err(Error::not_supported(format!(
                "argument syntax {} in {}()",
                other, fn_name
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    match fn_name.as_str() {
        "string_split" => {
            if exprs.len() != 2 {
                return Err(Error::plan("STRING_SPLIT takes (text, separator)"));
            }
            let mut iter = exprs.into_iter();
            Ok(TableSource::StringSplit {
                text: iter.next().expect("arity checked"),
                separator: iter.next().expect("arity checked"),
                alias,
            })
        }
        "openjson" => {
            if exprs.is_empty() || exprs.len() > 2 {
                return Err(Error::plan("OPENJSON takes (json [, path])"));
            }
            let mut iter = exprs.into_iter();
            let json = iter.next().expect("arity checked");
            let path = match iter.next() {
                Some(Expr::Literal(marlinsql_ir::Literal::Text(s))) => Some(s),
                Some(_) => return Err(Error::not_supported("non-literal OPENJSON path")),
                None => None,
            };
            Ok(TableSource::OpenJson { json, path, alias })
        }
        other => Err(Error::not_supported(format!(
            "table-valued function {}",
            other
        ))),
    }
}
