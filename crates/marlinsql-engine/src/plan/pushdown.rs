use chrono::{DateTime, Utc};

use marlinsql_common::error::{Error, Result};
use marlinsql_fetchxml::{
    format_value, FetchAggregate, FetchAttribute, FetchCondition, FetchEntity, FetchFilter,
    FetchOperator, FetchQuery, FilterKind,
};
use marlinsql_ir::{AggregateFunc, BinaryOp, ColumnRef, Expr, Literal};

use crate::eval::literal_value;

/// Outcome of splitting a WHERE clause against one remote entity: the
/// convertible part as a fetch filter, the rest left for `ClientFilter`.
pub(crate) struct PredicateSplit {
    pub filter: Option<FetchFilter>,
    pub residual: Option<Expr>,
}

/// Split a predicate into remote and client parts. Only conjuncts entirely
/// expressible in the fetch protocol move across the boundary; null handling
/// inside them then follows the remote store's semantics, untouched.
pub(crate) fn split_predicate(predicate: Option<&Expr>, base_alias: &str) -> PredicateSplit {
    let predicate = match predicate {
        Some(p) => p,
        None => {
            return PredicateSplit {
                filter: None,
                residual: None,
            }
        }
    };

    let mut filter = FetchFilter::all();
    let mut residual: Option<Expr> = None;
    for conjunct in conjuncts(predicate) {
        match convert_boolean(conjunct, base_alias) {
            Some(Converted::Condition(cond)) => filter.conditions.push(cond),
            Some(Converted::Filter(nested)) => filter.filters.push(nested),
            None => {
                residual = Some(match residual.take() {
                    Some(acc) => Expr::Binary {
                        left: Box::new(acc),
                        op: BinaryOp::And,
                        right: Box::new(conjunct.clone()),
                    },
                    None => conjunct.clone(),
                });
            }
        }
    }

    PredicateSplit {
        filter: (!filter.is_empty()).then_some(filter),
        residual,
    }
}

fn conjuncts(expr: &Expr) -> Vec<&Expr> {
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

enum Converted {
    Condition(FetchCondition),
    Filter(FetchFilter),
}

fn base_attribute(column: &ColumnRef, base_alias: &str) -> Option<String> {
    match &column.table {
        Some(table) if !table.eq_ignore_ascii_case(base_alias) => None,
        _ => Some(column.name.to_lowercase()),
    }
}

fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(Literal::Null) => None,
        Expr::Literal(literal) => Some(format_value(&literal_value(literal))),
        _ => None,
    }
}

/// A LIKE pattern is pushable when it only uses `%` and `_`.
fn pushable_pattern(pattern: &str) -> bool {
    !pattern.contains('[') && !pattern.contains(']')
}

fn convert_boolean(expr: &Expr, base_alias: &str) -> Option<Converted> {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let mut filter = FetchFilter::all();
            merge_converted(&mut filter, convert_boolean(left, base_alias)?);
            merge_converted(&mut filter, convert_boolean(right, base_alias)?);
            Some(Converted::Filter(filter))
        }
        Expr::Binary {
            left,
            op: BinaryOp::Or,
            right,
        } => {
            let mut filter = FetchFilter::any();
            merge_converted(&mut filter, convert_boolean(left, base_alias)?);
            merge_converted(&mut filter, convert_boolean(right, base_alias)?);
            Some(Converted::Filter(filter))
        }
        Expr::Binary { left, op, right } if op.is_comparison() => {
            // column <op> literal, or flipped
            let (column, literal, op) = match (&**left, &**right) {
                (Expr::Column(c), rhs) => (c, rhs, *op),
                (lhs, Expr::Column(c)) => (c, lhs, flip(*op)),
                _ => return None,
            };
            let attribute = base_attribute(column, base_alias)?;
            let value = literal_text(literal)?;
            let operator = match op {
                BinaryOp::Eq => FetchOperator::Eq,
                BinaryOp::NotEq => FetchOperator::Neq,
                BinaryOp::Lt => FetchOperator::Lt,
                BinaryOp::LtEq => FetchOperator::Le,
                BinaryOp::Gt => FetchOperator::Gt,
                BinaryOp::GtEq => FetchOperator::Ge,
                _ => return None,
            };
            Some(Converted::Condition(FetchCondition {
                attribute,
                entity_alias: None,
                operator,
                values: vec![value],
            }))
        }
        Expr::IsNull { expr, negated } => {
            let column = match &**expr {
                Expr::Column(c) => c,
                _ => return None,
            };
            Some(Converted::Condition(FetchCondition {
                attribute: base_attribute(column, base_alias)?,
                entity_alias: None,
                operator: if *negated {
                    FetchOperator::NotNull
                } else {
                    FetchOperator::Null
                },
                values: Vec::new(),
            }))
        }
        Expr::Like {
            expr,
            pattern,
            escape: None,
            negated,
        } => {
            let column = match &**expr {
                Expr::Column(c) => c,
                _ => return None,
            };
            let pattern = match &**pattern {
                Expr::Literal(Literal::Text(p)) if pushable_pattern(p) => p.clone(),
                _ => return None,
            };
            Some(Converted::Condition(FetchCondition {
                attribute: base_attribute(column, base_alias)?,
                entity_alias: None,
                operator: if *negated {
                    FetchOperator::NotLike
                } else {
                    FetchOperator::Like
                },
                values: vec![pattern],
            }))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let column = match &**expr {
                Expr::Column(c) => c,
                _ => return None,
            };
            let values = list
                .iter()
                .map(literal_text)
                .collect::<Option<Vec<_>>>()?;
            if values.is_empty() {
                return None;
            }
            Some(Converted::Condition(FetchCondition {
                attribute: base_attribute(column, base_alias)?,
                entity_alias: None,
                operator: if *negated {
                    FetchOperator::NotIn
                } else {
                    FetchOperator::In
                },
                values,
            }))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let column = match &**expr {
                Expr::Column(c) => c,
                _ => return None,
            };
            let low = literal_text(low)?;
            let high = literal_text(high)?;
            Some(Converted::Condition(FetchCondition {
                attribute: base_attribute(column, base_alias)?,
                entity_alias: None,
                operator: if *negated {
                    FetchOperator::NotBetween
                } else {
                    FetchOperator::Between
                },
                values: vec![low, high],
            }))
        }
        _ => None,
    }
}

fn merge_converted(filter: &mut FetchFilter, converted: Converted) {
    match converted {
        Converted::Condition(cond) => filter.conditions.push(cond),
        Converted::Filter(nested) if nested.kind == filter.kind => {
            filter.conditions.extend(nested.conditions);
            filter.filters.extend(nested.filters);
        }
        Converted::Filter(nested) => filter.filters.push(nested),
    }
}

fn flip(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::LtEq => BinaryOp::GtEq,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::GtEq => BinaryOp::LtEq,
        other => other,
    }
}

/// One aggregate column pushed into an aggregate fetch document.
pub(crate) struct PushedAggregate {
    pub output: String,
    pub func: AggregateFunc,
    /// Attribute the aggregate reads; the entity's primary key for COUNT(*).
    pub attribute: String,
    pub distinct: bool,
}

fn fetch_aggregate(func: AggregateFunc) -> Option<FetchAggregate> {
    match func {
        AggregateFunc::CountStar => Some(FetchAggregate::Count),
        AggregateFunc::Count => Some(FetchAggregate::CountColumn),
        AggregateFunc::Sum => Some(FetchAggregate::Sum),
        AggregateFunc::Avg => Some(FetchAggregate::Avg),
        AggregateFunc::Min => Some(FetchAggregate::Min),
        AggregateFunc::Max => Some(FetchAggregate::Max),
        AggregateFunc::StringAgg => None,
    }
}

/// Companion column names for AVG merging.
pub(crate) fn avg_count_column(output: &str) -> String {
    format!("__{}_count", output)
}

pub(crate) fn avg_sum_column(output: &str) -> String {
    format!("__{}_sum", output)
}

/// Build an aggregate fetch document. `partitioned` additionally injects the
/// companion SUM beside each AVG so partials can be recombined faithfully;
/// the companion COUNT is always injected adjacent to each AVG.
pub(crate) fn build_aggregate_query(
    entity: &str,
    filter: Option<FetchFilter>,
    group_columns: &[(String, String)],
    aggregates: &[PushedAggregate],
    partitioned: bool,
) -> Result<FetchQuery> {
    let mut fetch_entity = FetchEntity::new(entity.to_lowercase());
    for (output, attribute) in group_columns {
        fetch_entity
            .attributes
            .push(FetchAttribute::grouped(attribute.clone(), output.clone()));
    }
    for aggregate in aggregates {
        let wire = fetch_aggregate(aggregate.func).ok_or_else(|| {
            Error::not_supported(format!(
                "{} cannot be pushed to the remote store",
                aggregate.func.name().to_uppercase()
            ))
        })?;
        let mut attr = FetchAttribute::aggregated(
            aggregate.attribute.clone(),
            wire,
            aggregate.output.clone(),
        );
        attr.distinct = aggregate.distinct;
        fetch_entity.attributes.push(attr);

        if matches!(aggregate.func, AggregateFunc::Avg) {
            fetch_entity.attributes.push(FetchAttribute::aggregated(
                aggregate.attribute.clone(),
                FetchAggregate::CountColumn,
                avg_count_column(&aggregate.output),
            ));
            if partitioned {
                fetch_entity.attributes.push(FetchAttribute::aggregated(
                    aggregate.attribute.clone(),
                    FetchAggregate::Sum,
                    avg_sum_column(&aggregate.output),
                ));
            }
        }
    }
    fetch_entity.filter = filter;

    let mut query = FetchQuery::new(fetch_entity);
    query.aggregate = true;
    Ok(query)
}

/// Whether a fetch filter constrains the given attribute anywhere in its
/// condition tree. The partitioned rewrite bows out when the caller already
/// filters the partition timestamp column, since the injected range
/// conditions would double-apply.
pub(crate) fn filter_references(filter: Option<&FetchFilter>, attribute: &str) -> bool {
    match filter {
        None => false,
        Some(filter) => {
            filter
                .conditions
                .iter()
                .any(|c| c.attribute.eq_ignore_ascii_case(attribute))
                || filter
                    .filters
                    .iter()
                    .any(|nested| filter_references(Some(nested), attribute))
        }
    }
}

/// Partition count for the adaptive rewrite: `ceil(estimated / target)`.
pub(crate) fn partition_count(estimated: i64, target: i64) -> usize {
    (((estimated.max(1) + target - 1) / target) as usize).max(2)
}

/// Whether a usable timestamp range is known.
pub(crate) fn usable_range(
    min: Option<DateTime<Utc>>,
    max: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match (min, max) {
        (Some(min), Some(max)) if max > min => {
            // End bound is exclusive; nudge past the newest record.
            Some((min, max + chrono::Duration::seconds(1)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column(ColumnRef::bare(name))
    }

    fn lit(i: i64) -> Expr {
        Expr::Literal(Literal::Int(i))
    }

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(l),
            op: BinaryOp::Eq,
            right: Box::new(r),
        }
    }

    fn and(l: Expr, r: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(l),
            op: BinaryOp::And,
            right: Box::new(r),
        }
    }

    #[test]
    fn test_fully_pushable_predicate() {
        let predicate = and(
            eq(col("statecode"), lit(0)),
            Expr::Like {
                expr: Box::new(col("name")),
                pattern: Box::new(Expr::Literal(Literal::Text("%contoso%".into()))),
                escape: None,
                negated: false,
            },
        );
        let split = split_predicate(Some(&predicate), "account");
        assert!(split.residual.is_none());
        let filter = split.filter.unwrap();
        assert_eq!(filter.conditions.len(), 2);
        assert_eq!(filter.conditions[0].operator, FetchOperator::Eq);
        assert_eq!(filter.conditions[1].operator, FetchOperator::Like);
    }

    #[test]
    fn test_residual_split() {
        let predicate = and(
            eq(col("statecode"), lit(0)),
            eq(
                Expr::Function {
                    name: "upper".into(),
                    args: vec![col("name")],
                },
                Expr::Literal(Literal::Text("X".into())),
            ),
        );
        let split = split_predicate(Some(&predicate), "account");
        assert_eq!(split.filter.unwrap().conditions.len(), 1);
        assert!(split.residual.is_some());
    }

    #[test]
    fn test_variable_predicates_stay_client_side() {
        let predicate = eq(col("statecode"), Expr::Variable("@state".into()));
        let split = split_predicate(Some(&predicate), "account");
        assert!(split.filter.is_none());
        assert!(split.residual.is_some());
    }

    #[test]
    fn test_or_pushes_as_nested_filter() {
        let predicate = Expr::Binary {
            left: Box::new(eq(col("a"), lit(1))),
            op: BinaryOp::Or,
            right: Box::new(eq(col("b"), lit(2))),
        };
        let split = split_predicate(Some(&predicate), "t");
        let filter = split.filter.unwrap();
        assert_eq!(filter.filters.len(), 1);
        assert_eq!(filter.filters[0].kind, FilterKind::Or);
    }

    #[test]
    fn test_character_class_like_is_not_pushed() {
        let predicate = Expr::Like {
            expr: Box::new(col("name")),
            pattern: Box::new(Expr::Literal(Literal::Text("[abc]%".into()))),
            escape: None,
            negated: false,
        };
        let split = split_predicate(Some(&predicate), "t");
        assert!(split.filter.is_none());
        assert!(split.residual.is_some());
    }

    #[test]
    fn test_reversed_comparison_flips() {
        let predicate = Expr::Binary {
            left: Box::new(lit(5)),
            op: BinaryOp::Lt,
            right: Box::new(col("revenue")),
        };
        let split = split_predicate(Some(&predicate), "t");
        let filter = split.filter.unwrap();
        assert_eq!(filter.conditions[0].operator, FetchOperator::Gt);
    }

    #[test]
    fn test_aggregate_query_injects_avg_companions() {
        let query = build_aggregate_query(
            "account",
            None,
            &[("industry".into(), "industrycode".into())],
            &[
                PushedAggregate {
                    output: "total".into(),
                    func: AggregateFunc::Sum,
                    attribute: "revenue".into(),
                    distinct: false,
                },
                PushedAggregate {
                    output: "mean".into(),
                    func: AggregateFunc::Avg,
                    attribute: "revenue".into(),
                    distinct: false,
                },
            ],
            true,
        )
        .unwrap();
        let xml = query.to_xml().unwrap();
        assert!(xml.contains("aggregate=\"true\""));
        assert!(xml.contains("groupby=\"true\""));
        assert!(xml.contains("alias=\"__mean_count\""));
        assert!(xml.contains("alias=\"__mean_sum\""));
        // companion count sits adjacent to the avg attribute
        let avg_pos = xml.find("aggregate=\"avg\"").unwrap();
        let count_pos = xml.find("alias=\"__mean_count\"").unwrap();
        assert!(count_pos > avg_pos);
    }

    #[test]
    fn test_partition_count() {
        assert_eq!(partition_count(200_000, 40_000), 5);
        assert_eq!(partition_count(200_001, 40_000), 6);
        assert_eq!(partition_count(10, 40_000), 2);
    }

    #[test]
    fn test_filter_references_walks_nested_filters() {
        let predicate = and(
            eq(col("statecode"), lit(0)),
            Expr::Binary {
                left: Box::new(eq(col("createdon"), lit(1))),
                op: BinaryOp::Or,
                right: Box::new(eq(col("industrycode"), lit(2))),
            },
        );
        let split = split_predicate(Some(&predicate), "account");
        let filter = split.filter;
        assert!(filter_references(filter.as_ref(), "createdon"));
        assert!(filter_references(filter.as_ref(), "STATECODE"));
        assert!(!filter_references(filter.as_ref(), "revenue"));
        assert!(!filter_references(None, "createdon"));
    }
}
