use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{
    AggregateFunc, BinaryOp, CastType, ColumnRef, Expr, FrameBound, FrameUnits, Literal, SortExpr,
    UnaryOp, WindowFrame, WindowFunc,
};
use rust_decimal::Decimal;
use sqlparser::ast;

use crate::planner::plan_query;

/// Lower a sqlparser scalar expression into the typed tree.
#[allow(clippy::wildcard_enum_match_arm)]
pub fn plan_expr(expr: &ast::Expr) -> Result<Expr> {
    match expr {
        ast::Expr::Identifier(ident) => Ok(plan_ident(ident)),
        ast::Expr::CompoundIdentifier(idents) => {
            let name = idents.last().expect("non-empty identifier").value.clone();
            let table = idents[..idents.len() - 1]
                .iter()
                .map(|i| i.value.clone())
                .collect::<Vec<_>>()
                .join(".");
            Ok(Expr::Column(ColumnRef {
                table: Some(table),
                name,
            }))
        }
        ast::Expr::Value(value) => plan_literal(value),
        ast::Expr::BinaryOp { left, op, right } => plan_binary(left, op, right),
        ast::Expr::UnaryOp { op, expr } => {
            let inner = plan_expr(expr)?;
            match op {
                ast::UnaryOperator::Minus => Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                }),
                ast::UnaryOperator::Plus => Ok(inner),
                ast::UnaryOperator::Not => Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(inner),
                }),
                other => Err(Error::not_supported(format!("unary operator {}", other))),
            }
        }
        ast::Expr::Nested(inner) => plan_expr(inner),
        ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(plan_expr(inner)?),
            negated: false,
        }),
        ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(plan_expr(inner)?),
            negated: true,
        }),
        ast::Expr::Like {
            negated,
            expr,
            pattern,
            escape_char,
            ..
        } => Ok(Expr::Like {
            expr: Box::new(plan_expr(expr)?),
            pattern: Box::new(plan_expr(pattern)?),
            escape: escape_char.as_ref().and_then(|s| s.chars().next()),
            negated: *negated,
        }),
        ast::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: Box::new(plan_expr(expr)?),
            list: list.iter().map(plan_expr).collect::<Result<Vec<_>>>()?,
            negated: *negated,
        }),
        ast::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Ok(Expr::InSubquery {
            expr: Box::new(plan_expr(expr)?),
            subquery: Box::new(plan_query(subquery)?),
            negated: *negated,
        }),
        ast::Expr::Exists { subquery, negated } => Ok(Expr::Exists {
            subquery: Box::new(plan_query(subquery)?),
            negated: *negated,
        }),
        ast::Expr::Subquery(subquery) => Ok(Expr::ScalarSubquery(Box::new(plan_query(subquery)?))),
        ast::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: Box::new(plan_expr(expr)?),
            low: Box::new(plan_expr(low)?),
            high: Box::new(plan_expr(high)?),
            negated: *negated,
        }),
        ast::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let operand = operand
                .as_ref()
                .map(|o| plan_expr(o).map(Box::new))
                .transpose()?;
            let branches = conditions
                .iter()
                .zip(results.iter())
                .map(|(when, then)| Ok((plan_expr(when)?, plan_expr(then)?)))
                .collect::<Result<Vec<_>>>()?;
            let else_result = else_result
                .as_ref()
                .map(|e| plan_expr(e).map(Box::new))
                .transpose()?;
            Ok(Expr::Case {
                operand,
                branches,
                else_result,
            })
        }
        ast::Expr::Cast {
            kind,
            expr,
            data_type,
            ..
        } => {
            let lenient = matches!(kind, ast::CastKind::TryCast | ast::CastKind::SafeCast);
            Ok(Expr::Cast {
                expr: Box::new(plan_expr(expr)?),
                to: plan_cast_type(data_type)?,
                lenient,
                style: None,
            })
        }
        ast::Expr::Convert {
            is_try,
            expr,
            data_type,
            styles,
            ..
        } => {
            let data_type = data_type
                .as_ref()
                .ok_or_else(|| Error::not_supported("CONVERT without a target type"))?;
            let style = match styles.first() {
                Some(ast::Expr::Value(ast::Value::Number(n, _))) => n.parse::<i64>().ok(),
                Some(_) => return Err(Error::not_supported("non-literal CONVERT style")),
                None => None,
            };
            Ok(Expr::Cast {
                expr: Box::new(plan_expr(expr)?),
                to: plan_cast_type(data_type)?,
                lenient: *is_try,
                style,
            })
        }
        ast::Expr::Function(func) => plan_function(func),
        ast::Expr::Tuple(items) if items.len() == 1 => plan_expr(&items[0]),
        other => Err(Error::not_supported(format!("expression: {}", other))),
    }
}

fn plan_ident(ident: &ast::Ident) -> Expr {
    if ident.value.starts_with('@') {
        Expr::Variable(ident.value.clone())
    } else {
        Expr::Column(ColumnRef::bare(ident.value.clone()))
    }
}

#[allow(clippy::wildcard_enum_match_arm)]
fn plan_literal(value: &ast::Value) -> Result<Expr> {
    let literal = match value {
        ast::Value::Number(text, _) => parse_number(text)?,
        ast::Value::SingleQuotedString(s) | ast::Value::NationalStringLiteral(s) => {
            Literal::Text(s.clone())
        }
        ast::Value::Boolean(b) => Literal::Bool(*b),
        ast::Value::Null => Literal::Null,
        ast::Value::HexStringLiteral(hex) => {
            // Binary literals flow as a cast over their textual form so the
            // value keeps a printable shape in plan descriptions.
            return Ok(Expr::Cast {
                expr: Box::new(Expr::Literal(Literal::Text(format!(
                    "0x{}",
                    hex.to_uppercase()
                )))),
                to: CastType::Binary,
                lenient: false,
                style: None,
            });
        }
        other => return Err(Error::not_supported(format!("literal: {}", other))),
    };
    Ok(Expr::Literal(literal))
}

fn parse_number(text: &str) -> Result<Literal> {
    if text.contains(['e', 'E']) {
        return text
            .parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| Error::parse_error(format!("invalid number {}", text), 0, 0));
    }
    if text.contains('.') {
        return text
            .parse::<Decimal>()
            .map(Literal::Decimal)
            .map_err(|_| Error::parse_error(format!("invalid number {}", text), 0, 0));
    }
    match text.parse::<i64>() {
        Ok(i) => Ok(Literal::Int(i)),
        Err(_) => text
            .parse::<Decimal>()
            .map(Literal::Decimal)
            .map_err(|_| Error::parse_error(format!("invalid number {}", text), 0, 0)),
    }
}

#[allow(clippy::wildcard_enum_match_arm)]
fn plan_binary(left: &ast::Expr, op: &ast::BinaryOperator, right: &ast::Expr) -> Result<Expr> {
    let op = match op {
        ast::BinaryOperator::Plus => BinaryOp::Add,
        ast::BinaryOperator::Minus => BinaryOp::Sub,
        ast::BinaryOperator::Multiply => BinaryOp::Mul,
        ast::BinaryOperator::Divide => BinaryOp::Div,
        ast::BinaryOperator::Modulo => BinaryOp::Mod,
        ast::BinaryOperator::StringConcat => BinaryOp::Add,
        ast::BinaryOperator::Eq => BinaryOp::Eq,
        ast::BinaryOperator::NotEq => BinaryOp::NotEq,
        ast::BinaryOperator::Lt => BinaryOp::Lt,
        ast::BinaryOperator::LtEq => BinaryOp::LtEq,
        ast::BinaryOperator::Gt => BinaryOp::Gt,
        ast::BinaryOperator::GtEq => BinaryOp::GtEq,
        ast::BinaryOperator::And => BinaryOp::And,
        ast::BinaryOperator::Or => BinaryOp::Or,
        other => return Err(Error::not_supported(format!("operator {}", other))),
    };
    Ok(Expr::Binary {
        left: Box::new(plan_expr(left)?),
        op,
        right: Box::new(plan_expr(right)?),
    })
}

#[allow(clippy::wildcard_enum_match_arm)]
pub(crate) fn plan_cast_type(data_type: &ast::DataType) -> Result<CastType> {
    Ok(match data_type {
        ast::DataType::Bool | ast::DataType::Boolean => CastType::Bool,
        ast::DataType::TinyInt(_)
        | ast::DataType::SmallInt(_)
        | ast::DataType::Int(_)
        | ast::DataType::Integer(_)
        | ast::DataType::BigInt(_) => CastType::Int,
        ast::DataType::Decimal(info) | ast::DataType::Numeric(info) => match info {
            ast::ExactNumberInfo::None => CastType::Decimal {
                precision: None,
                scale: None,
            },
            ast::ExactNumberInfo::Precision(p) => CastType::Decimal {
                precision: Some(*p as u32),
                scale: None,
            },
            ast::ExactNumberInfo::PrecisionAndScale(p, s) => CastType::Decimal {
                precision: Some(*p as u32),
                scale: Some(*s as u32),
            },
        },
        ast::DataType::Float(_)
        | ast::DataType::Real
        | ast::DataType::Double(_)
        | ast::DataType::DoublePrecision => CastType::Float,
        ast::DataType::Char(len)
        | ast::DataType::Varchar(len)
        | ast::DataType::Nvarchar(len) => CastType::Text {
            length: char_length(len),
        },
        ast::DataType::Text | ast::DataType::String(_) => CastType::Text { length: None },
        ast::DataType::Date
        | ast::DataType::Datetime(_)
        | ast::DataType::Timestamp(_, _) => CastType::Timestamp,
        ast::DataType::Uuid => CastType::Uuid,
        ast::DataType::Varbinary(_) | ast::DataType::Binary(_) => CastType::Binary,
        ast::DataType::Custom(name, _) => {
            let name = name.to_string().to_lowercase();
            match name.as_str() {
                "uniqueidentifier" => CastType::Uuid,
                "bit" => CastType::Bool,
                "money" | "smallmoney" => CastType::Decimal {
                    precision: None,
                    scale: Some(4),
                },
                "datetime2" | "smalldatetime" | "datetimeoffset" => CastType::Timestamp,
                other => return Err(Error::not_supported(format!("type {}", other))),
            }
        }
        other => return Err(Error::not_supported(format!("type {}", other))),
    })
}

fn char_length(len: &Option<ast::CharacterLength>) -> Option<u64> {
    match len {
        Some(ast::CharacterLength::IntegerLength { length, .. }) => Some(*length),
        _ => None,
    }
}

fn function_args(func: &ast::Function) -> Result<Vec<Expr>> {
    match &func.args {
        ast::FunctionArguments::None => Ok(Vec::new()),
        ast::FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => plan_expr(e),
                other => Err(Error::not_supported(format!(
                    "argument syntax {} in {}()",
                    other, func.name
                ))),
            })
            .collect(),
        ast::FunctionArguments::Subquery(_) => Err(Error::not_supported(format!(
            "subquery argument in {}()",
            func.name
        ))),
    }
}

fn has_wildcard_arg(func: &ast::Function) -> bool {
    matches!(
        &func.args,
        ast::FunctionArguments::List(list)
            if list.args.iter().any(|a| matches!(
                a,
                ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard)
            ))
    )
}

fn is_distinct(func: &ast::Function) -> bool {
    matches!(
        &func.args,
        ast::FunctionArguments::List(list)
            if matches!(list.duplicate_treatment, Some(ast::DuplicateTreatment::Distinct))
    )
}

fn aggregate_func(name: &str) -> Option<AggregateFunc> {
    match name {
        "count" => Some(AggregateFunc::Count),
        "sum" => Some(AggregateFunc::Sum),
        "avg" => Some(AggregateFunc::Avg),
        "min" => Some(AggregateFunc::Min),
        "max" => Some(AggregateFunc::Max),
        _ => None,
    }
}

fn plan_function(func: &ast::Function) -> Result<Expr> {
    let name = func.name.to_string().to_lowercase();

    if let Some(over) = &func.over {
        return plan_window(func, &name, over);
    }

    if let Some(agg) = aggregate_func(&name) {
        if has_wildcard_arg(func) {
            return Ok(Expr::Aggregate {
                func: AggregateFunc::CountStar,
                arg: None,
                distinct: false,
                separator: None,
            });
        }
        let args = function_args(func)?;
        let arg = args.into_iter().next().map(Box::new);
        if arg.is_none() {
            return Err(Error::plan(format!("{} requires an argument", name)));
        }
        return Ok(Expr::Aggregate {
            func: agg,
            arg,
            distinct: is_distinct(func),
            separator: None,
        });
    }

    if name == "string_agg" {
        let mut args = function_args(func)?.into_iter();
        let arg = args
            .next()
            .ok_or_else(|| Error::plan("STRING_AGG takes (expression, separator)"))?;
        let separator = match args.next() {
            Some(Expr::Literal(Literal::Text(s))) => s,
            Some(_) => return Err(Error::not_supported("non-literal STRING_AGG separator")),
            None => return Err(Error::plan("STRING_AGG takes (expression, separator)")),
        };
        return Ok(Expr::Aggregate {
            func: AggregateFunc::StringAgg,
            arg: Some(Box::new(arg)),
            distinct: false,
            separator: Some(separator),
        });
    }

    // System functions surface as zero-argument calls.
    let args = function_args(func)?;
    Ok(Expr::Function { name, args })
}

fn window_func(name: &str) -> Option<WindowFunc> {
    match name {
        "row_number" => Some(WindowFunc::RowNumber),
        "rank" => Some(WindowFunc::Rank),
        "dense_rank" => Some(WindowFunc::DenseRank),
        "cume_dist" => Some(WindowFunc::CumeDist),
        "percent_rank" => Some(WindowFunc::PercentRank),
        "ntile" => Some(WindowFunc::Ntile),
        "lag" => Some(WindowFunc::Lag),
        "lead" => Some(WindowFunc::Lead),
        "first_value" => Some(WindowFunc::FirstValue),
        "last_value" => Some(WindowFunc::LastValue),
        _ => None,
    }
}

fn plan_window(func: &ast::Function, name: &str, over: &ast::WindowType) -> Result<Expr> {
    let spec = match over {
        ast::WindowType::WindowSpec(spec) => spec,
        ast::WindowType::NamedWindow(_) => {
            return Err(Error::not_supported("named windows (WINDOW clause)"))
        }
    };

    let wf = match window_func(name) {
        Some(wf) => wf,
        None => match aggregate_func(name) {
            Some(_) if has_wildcard_arg(func) => {
                WindowFunc::Aggregate(AggregateFunc::CountStar)
            }
            Some(agg) => WindowFunc::Aggregate(agg),
            None => {
                return Err(Error::not_supported(format!(
                    "window function {}",
                    name.to_uppercase()
                )))
            }
        },
    };

    let args = if has_wildcard_arg(func) {
        Vec::new()
    } else {
        function_args(func)?
    };
    let partition_by = spec
        .partition_by
        .iter()
        .map(plan_expr)
        .collect::<Result<Vec<_>>>()?;
    let order_by = spec
        .order_by
        .iter()
        .map(plan_order_by)
        .collect::<Result<Vec<_>>>()?;
    let frame = spec.window_frame.as_ref().map(plan_frame).transpose()?;

    Ok(Expr::Window {
        func: wf,
        args,
        partition_by,
        order_by,
        frame,
    })
}

pub(crate) fn plan_order_by(item: &ast::OrderByExpr) -> Result<SortExpr> {
    Ok(SortExpr {
        expr: plan_expr(&item.expr)?,
        ascending: item.asc.unwrap_or(true),
    })
}

fn plan_frame(frame: &ast::WindowFrame) -> Result<WindowFrame> {
    let units = match frame.units {
        ast::WindowFrameUnits::Rows => FrameUnits::Rows,
        ast::WindowFrameUnits::Range => FrameUnits::Range,
        ast::WindowFrameUnits::Groups => {
            return Err(Error::not_supported("GROUPS window frames"))
        }
    };
    let start = plan_frame_bound(&frame.start_bound)?;
    let end = match &frame.end_bound {
        Some(bound) => plan_frame_bound(bound)?,
        None => FrameBound::CurrentRow,
    };
    Ok(WindowFrame { units, start, end })
}

fn plan_frame_bound(bound: &ast::WindowFrameBound) -> Result<FrameBound> {
    Ok(match bound {
        ast::WindowFrameBound::CurrentRow => FrameBound::CurrentRow,
        ast::WindowFrameBound::Preceding(None) => FrameBound::UnboundedPreceding,
        ast::WindowFrameBound::Following(None) => FrameBound::UnboundedFollowing,
        ast::WindowFrameBound::Preceding(Some(expr)) => {
            FrameBound::Preceding(frame_offset(expr)?)
        }
        ast::WindowFrameBound::Following(Some(expr)) => {
            FrameBound::Following(frame_offset(expr)?)
        }
    })
}

#[allow(clippy::wildcard_enum_match_arm)]
fn frame_offset(expr: &ast::Expr) -> Result<u64> {
    match expr {
        ast::Expr::Value(ast::Value::Number(n, _)) => n
            .parse::<u64>()
            .map_err(|_| Error::plan(format!("invalid frame offset {}", n))),
        other => Err(Error::plan(format!(
            "window frame offsets must be integer literals, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one_expr(sql: &str) -> Expr {
        use sqlparser::dialect::MsSqlDialect;
        use sqlparser::parser::Parser;
        let mut parser = Parser::new(&MsSqlDialect {}).try_with_sql(sql).unwrap();
        plan_expr(&parser.parse_expr().unwrap()).unwrap()
    }

    #[test]
    fn test_variable_and_column() {
        assert_eq!(parse_one_expr("@total"), Expr::Variable("@total".into()));
        assert_eq!(
            parse_one_expr("a.name"),
            Expr::Column(ColumnRef::qualified("a", "name"))
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(parse_one_expr("42"), Expr::Literal(Literal::Int(42)));
        assert_eq!(
            parse_one_expr("1.5"),
            Expr::Literal(Literal::Decimal(Decimal::new(15, 1)))
        );
        assert!(matches!(
            parse_one_expr("1e3"),
            Expr::Literal(Literal::Float(_))
        ));
    }

    #[test]
    fn test_count_star() {
        assert_eq!(
            parse_one_expr("COUNT(*)"),
            Expr::Aggregate {
                func: AggregateFunc::CountStar,
                arg: None,
                distinct: false,
                separator: None,
            }
        );
    }

    #[test]
    fn test_string_agg() {
        match parse_one_expr("STRING_AGG(name, ', ')") {
            Expr::Aggregate {
                func: AggregateFunc::StringAgg,
                separator: Some(sep),
                ..
            } => assert_eq!(sep, ", "),
            other => panic!("expected string_agg, got {:?}", other),
        }
    }

    #[test]
    fn test_count_distinct() {
        match parse_one_expr("COUNT(DISTINCT name)") {
            Expr::Aggregate { func, distinct, .. } => {
                assert_eq!(func, AggregateFunc::Count);
                assert!(distinct);
            }
            other => panic!("expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_window_with_frame() {
        let expr = parse_one_expr(
            "SUM(revenue) OVER (PARTITION BY region ORDER BY createdon \
             ROWS BETWEEN 2 PRECEDING AND CURRENT ROW)",
        );
        match expr {
            Expr::Window {
                func: WindowFunc::Aggregate(AggregateFunc::Sum),
                partition_by,
                order_by,
                frame: Some(frame),
                ..
            } => {
                assert_eq!(partition_by.len(), 1);
                assert_eq!(order_by.len(), 1);
                assert_eq!(frame.units, FrameUnits::Rows);
                assert_eq!(frame.start, FrameBound::Preceding(2));
                assert_eq!(frame.end, FrameBound::CurrentRow);
            }
            other => panic!("expected window, got {:?}", other),
        }
    }

    #[test]
    fn test_try_convert() {
        match parse_one_expr("TRY_CONVERT(INT, '12')") {
            Expr::Cast { to, lenient, .. } => {
                assert_eq!(to, CastType::Int);
                assert!(lenient);
            }
            other => panic!("expected cast, got {:?}", other),
        }
    }

    #[test]
    fn test_case_searched() {
        match parse_one_expr("CASE WHEN x > 1 THEN 'big' ELSE 'small' END") {
            Expr::Case {
                operand: None,
                branches,
                else_result: Some(_),
            } => assert_eq!(branches.len(), 1),
            other => panic!("expected case, got {:?}", other),
        }
    }
}
