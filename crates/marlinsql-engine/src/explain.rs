use itertools::Itertools;
use serde::Serialize;

use marlinsql_ir::{BinaryOp, Expr, Literal, UnaryOp};

use crate::exec::PlanNodeRef;

/// One node of the rendered plan tree, as returned by `explain`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDescription {
    pub description: String,
    pub estimated_rows: i64,
    pub children: Vec<PlanDescription>,
}

pub fn describe_plan(node: &PlanNodeRef) -> PlanDescription {
    PlanDescription {
        description: node.describe(),
        estimated_rows: node.estimated_rows(),
        children: node.children().iter().map(describe_plan).collect(),
    }
}

/// Indented single-string rendering, used for `QueryResult::plan`.
pub fn render_plan(node: &PlanNodeRef) -> String {
    let mut out = String::new();
    render_into(&describe_plan(node), 0, &mut out);
    out
}

fn render_into(desc: &PlanDescription, depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(&desc.description);
    if desc.estimated_rows >= 0 {
        out.push_str(&format!(" [~{} rows]", desc.estimated_rows));
    }
    out.push('\n');
    for child in &desc.children {
        render_into(child, depth + 1, out);
    }
}

/// Compact expression rendering for operator labels.
pub fn format_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(literal) => match literal {
            Literal::Null => "NULL".to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Int(i) => i.to_string(),
            Literal::Decimal(d) => d.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::Text(s) => format!("'{}'", s),
            Literal::Timestamp(t) => format!("'{}'", t),
            Literal::Uuid(u) => format!("'{}'", u),
        },
        Expr::Column(c) => match &c.table {
            Some(t) => format!("{}.{}", t, c.name),
            None => c.name.clone(),
        },
        Expr::Variable(v) => v.clone(),
        Expr::Binary { left, op, right } => format!(
            "{} {} {}",
            format_expr(left),
            binary_symbol(*op),
            format_expr(right)
        ),
        Expr::Unary { op, expr } => match op {
            UnaryOp::Neg => format!("-{}", format_expr(expr)),
            UnaryOp::Not => format!("NOT {}", format_expr(expr)),
        },
        Expr::IsNull { expr, negated } => format!(
            "{} IS {}NULL",
            format_expr(expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Like {
            expr,
            pattern,
            negated,
            ..
        } => format!(
            "{} {}LIKE {}",
            format_expr(expr),
            if *negated { "NOT " } else { "" },
            format_expr(pattern)
        ),
        Expr::InList { expr, list, negated } => format!(
            "{} {}IN ({} values)",
            format_expr(expr),
            if *negated { "NOT " } else { "" },
            list.len()
        ),
        Expr::InSubquery { expr, negated, .. } => format!(
            "{} {}IN (subquery)",
            format_expr(expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Exists { negated, .. } => {
            format!("{}EXISTS (subquery)", if *negated { "NOT " } else { "" })
        }
        Expr::ScalarSubquery(_) => "(subquery)".to_string(),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => format!(
            "{} {}BETWEEN {} AND {}",
            format_expr(expr),
            if *negated { "NOT " } else { "" },
            format_expr(low),
            format_expr(high)
        ),
        Expr::Case { .. } => "CASE".to_string(),
        Expr::Cast { expr, .. } => format!("CAST({})", format_expr(expr)),
        Expr::Function { name, args } => format!(
            "{}({})",
            name.to_uppercase(),
            args.iter().map(format_expr).join(", ")
        ),
        Expr::Aggregate { func, arg, distinct, .. } => format!(
            "{}({}{})",
            func.name().to_uppercase(),
            if *distinct { "DISTINCT " } else { "" },
            match arg {
                Some(arg) => format_expr(arg),
                None => "*".to_string(),
            }
        ),
        Expr::Window { func, .. } => format!("{:?}() OVER (...)", func),
    }
}

fn binary_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Eq => "=",
        BinaryOp::NotEq => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
    }
}
