//! The expression compiler: lowers scalar and predicate syntax into opaque
//! closures over rows. Plan nodes hold these closures, never syntax trees;
//! aggregates, windows and subqueries must be rewritten away by the plan
//! builder before an expression reaches this module.

pub mod cast;
pub mod functions;
pub mod like;

use std::sync::Arc;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::{arithmetic, negate, QueryValue, Row};
use marlinsql_ir::{BinaryOp, ColumnRef, Expr, Literal, UnaryOp};

use crate::session::SessionHandle;

pub type CompiledScalar = Arc<dyn Fn(&Row) -> Result<QueryValue> + Send + Sync>;
pub type CompiledPredicate = Arc<dyn Fn(&Row) -> Result<bool> + Send + Sync>;

/// Compiles expressions against one batch session. Compiled closures borrow
/// the session handle for variable lookups; everything else is resolved at
/// compile time.
#[derive(Clone)]
pub struct ExprCompiler {
    session: SessionHandle,
}

impl ExprCompiler {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    pub fn compile_scalar(&self, expr: &Expr) -> Result<CompiledScalar> {
        let compiled = self.compile(expr)?;
        // Constant subexpressions fold to a captured value. A folding
        // failure (1/0 inside a TRY block) defers to execution time.
        if is_constant(expr) {
            if let Ok(value) = compiled(&Row::new()) {
                return Ok(Arc::new(move |_| Ok(value.clone())));
            }
        }
        Ok(compiled)
    }

    /// Tri-valued logic collapses at the predicate boundary: null is false.
    pub fn compile_predicate(&self, expr: &Expr) -> Result<CompiledPredicate> {
        let scalar = self.compile_scalar(expr)?;
        Ok(Arc::new(move |row| {
            Ok(truth(&scalar(row)?).unwrap_or(false))
        }))
    }

    fn compile(&self, expr: &Expr) -> Result<CompiledScalar> {
        match expr {
            Expr::Literal(literal) => {
                let value = literal_value(literal);
                Ok(Arc::new(move |_| Ok(value.clone())))
            }
            Expr::Column(column) => {
                let column = column.clone();
                Ok(Arc::new(move |row| lookup_column(row, &column)))
            }
            Expr::Variable(name) => {
                let name = name.clone();
                let session = self.session.clone();
                Ok(Arc::new(move |_| session.variable(&name)))
            }
            Expr::Binary { left, op, right } => self.compile_binary(left, *op, right),
            Expr::Unary { op, expr } => {
                let inner = self.compile(expr)?;
                match op {
                    UnaryOp::Neg => Ok(Arc::new(move |row| negate(&inner(row)?))),
                    UnaryOp::Not => Ok(Arc::new(move |row| {
                        Ok(match truth(&inner(row)?) {
                            Some(b) => QueryValue::Bool(!b),
                            None => QueryValue::Null,
                        })
                    })),
                }
            }
            Expr::IsNull { expr, negated } => {
                let inner = self.compile(expr)?;
                let negated = *negated;
                Ok(Arc::new(move |row| {
                    Ok(QueryValue::Bool(inner(row)?.is_null() != negated))
                }))
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => like::compile(self, expr, pattern, *escape, *negated),
            Expr::InList {
                expr,
                list,
                negated,
            } => self.compile_in_list(expr, list, *negated),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = self.compile(expr)?;
                let low = self.compile(low)?;
                let high = self.compile(high)?;
                let negated = *negated;
                Ok(Arc::new(move |row| {
                    let v = value(row)?;
                    let lo = low(row)?;
                    let hi = high(row)?;
                    let inside = match (v.compare(&lo), v.compare(&hi)) {
                        (Some(a), Some(b)) => Some(!a.is_lt() && !b.is_gt()),
                        _ => None,
                    };
                    Ok(match inside {
                        Some(b) => QueryValue::Bool(b != negated),
                        None => QueryValue::Null,
                    })
                }))
            }
            Expr::Case {
                operand,
                branches,
                else_result,
            } => self.compile_case(operand.as_deref(), branches, else_result.as_deref()),
            Expr::Cast {
                expr,
                to,
                lenient,
                style,
            } => {
                let inner = self.compile(expr)?;
                let to = to.clone();
                let lenient = *lenient;
                let style = *style;
                Ok(Arc::new(move |row| {
                    cast::cast_value(inner(row)?, &to, lenient, style)
                }))
            }
            Expr::Function { name, args } => functions::compile(self, name, args),
            Expr::Aggregate { .. } | Expr::Window { .. } => Err(Error::plan(
                "aggregate or window expression outside an aggregation context",
            )),
            Expr::InSubquery { .. } | Expr::Exists { .. } | Expr::ScalarSubquery(_) => Err(
                Error::not_supported("subquery in this position"),
            ),
        }
    }

    fn compile_binary(&self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<CompiledScalar> {
        let lhs = self.compile(left)?;
        let rhs = self.compile(right)?;
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                let symbol = match op {
                    BinaryOp::Add => '+',
                    BinaryOp::Sub => '-',
                    BinaryOp::Mul => '*',
                    BinaryOp::Div => '/',
                    _ => '%',
                };
                Ok(Arc::new(move |row| {
                    arithmetic(&lhs(row)?, symbol, &rhs(row)?)
                }))
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => Ok(Arc::new(move |row| {
                let l = lhs(row)?;
                let r = rhs(row)?;
                Ok(match l.compare(&r) {
                    Some(ord) => QueryValue::Bool(match op {
                        BinaryOp::Eq => ord.is_eq(),
                        BinaryOp::NotEq => ord.is_ne(),
                        BinaryOp::Lt => ord.is_lt(),
                        BinaryOp::LtEq => ord.is_le(),
                        BinaryOp::Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    }),
                    None => QueryValue::Null,
                })
            })),
            BinaryOp::And => Ok(Arc::new(move |row| {
                Ok(match truth(&lhs(row)?) {
                    Some(false) => QueryValue::Bool(false),
                    Some(true) => match truth(&rhs(row)?) {
                        Some(b) => QueryValue::Bool(b),
                        None => QueryValue::Null,
                    },
                    None => match truth(&rhs(row)?) {
                        Some(false) => QueryValue::Bool(false),
                        _ => QueryValue::Null,
                    },
                })
            })),
            BinaryOp::Or => Ok(Arc::new(move |row| {
                Ok(match truth(&lhs(row)?) {
                    Some(true) => QueryValue::Bool(true),
                    Some(false) => match truth(&rhs(row)?) {
                        Some(b) => QueryValue::Bool(b),
                        None => QueryValue::Null,
                    },
                    None => match truth(&rhs(row)?) {
                        Some(true) => QueryValue::Bool(true),
                        _ => QueryValue::Null,
                    },
                })
            })),
        }
    }

    fn compile_in_list(&self, expr: &Expr, list: &[Expr], negated: bool) -> Result<CompiledScalar> {
        let value = self.compile(expr)?;
        let items = list
            .iter()
            .map(|e| self.compile(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(move |row| {
            let v = value(row)?;
            if v.is_null() {
                return Ok(QueryValue::Null);
            }
            let mut saw_null = false;
            for item in &items {
                let candidate = item(row)?;
                if candidate.is_null() {
                    saw_null = true;
                    continue;
                }
                if v.compare(&candidate) == Some(std::cmp::Ordering::Equal) {
                    return Ok(QueryValue::Bool(!negated));
                }
            }
            Ok(if saw_null {
                QueryValue::Null
            } else {
                QueryValue::Bool(negated)
            })
        }))
    }

    fn compile_case(
        &self,
        operand: Option<&Expr>,
        branches: &[(Expr, Expr)],
        else_result: Option<&Expr>,
    ) -> Result<CompiledScalar> {
        let operand = operand.map(|o| self.compile(o)).transpose()?;
        let branches = branches
            .iter()
            .map(|(when, then)| Ok((self.compile(when)?, self.compile(then)?)))
            .collect::<Result<Vec<_>>>()?;
        let fallback = else_result.map(|e| self.compile(e)).transpose()?;
        Ok(Arc::new(move |row| {
            let matched = match &operand {
                Some(op) => {
                    let target = op(row)?;
                    let mut result = None;
                    for (when, then) in &branches {
                        let candidate = when(row)?;
                        if target.compare(&candidate) == Some(std::cmp::Ordering::Equal) {
                            result = Some(then(row)?);
                            break;
                        }
                    }
                    result
                }
                None => {
                    let mut result = None;
                    for (when, then) in &branches {
                        if truth(&when(row)?).unwrap_or(false) {
                            result = Some(then(row)?);
                            break;
                        }
                    }
                    result
                }
            };
            match matched {
                Some(v) => Ok(v),
                None => match &fallback {
                    Some(f) => f(row),
                    None => Ok(QueryValue::Null),
                },
            }
        }))
    }

    pub(crate) fn session(&self) -> &SessionHandle {
        &self.session
    }
}

/// SQL truth of a value: `Some(bool)` for boolean-convertible values, `None`
/// for null.
pub fn truth(value: &QueryValue) -> Option<bool> {
    match value {
        QueryValue::Null => None,
        other => other.as_bool(),
    }
}

pub fn literal_value(literal: &Literal) -> QueryValue {
    match literal {
        Literal::Null => QueryValue::Null,
        Literal::Bool(b) => QueryValue::Bool(*b),
        Literal::Int(i) => QueryValue::Int(*i),
        Literal::Decimal(d) => QueryValue::Decimal(*d),
        Literal::Float(f) => QueryValue::Float(*f),
        Literal::Text(s) => QueryValue::Text(s.clone()),
        Literal::Timestamp(t) => QueryValue::Timestamp(*t),
        Literal::Uuid(u) => QueryValue::Uuid(*u),
    }
}

/// Resolve a possibly-qualified column reference against a row. Joined rows
/// carry `alias.attribute` column names; single-source rows carry bare names.
/// A qualified reference that resolves to nothing reads as null: the
/// unmatched side of an outer join against an empty input has no columns to
/// pad with.
pub fn lookup_column(row: &Row, column: &ColumnRef) -> Result<QueryValue> {
    if let Some(table) = &column.table {
        let qualified = format!("{}.{}", table, column.name);
        if let Some(v) = row.get(&qualified) {
            return Ok(v.clone());
        }
        if let Some(v) = row.get(&column.name) {
            return Ok(v.clone());
        }
        return Ok(QueryValue::Null);
    }

    if let Some(v) = row.get(&column.name) {
        return Ok(v.clone());
    }

    // A bare name against a qualified row matches a unique `alias.name`.
    let mut found: Option<&QueryValue> = None;
    for (key, value) in row.iter() {
        if let Some((_, suffix)) = key.rsplit_once('.') {
            if suffix.eq_ignore_ascii_case(&column.name) {
                if found.is_some() {
                    return Err(Error::execution(format!(
                        "column {} is ambiguous",
                        column.name
                    )));
                }
                found = Some(value);
            }
        }
    }
    found
        .cloned()
        .ok_or_else(|| Error::execution(format!("column {} not found", column.name)))
}

fn is_constant(expr: &Expr) -> bool {
    let mut constant = true;
    expr.walk(&mut |e| match e {
        Expr::Column(_)
        | Expr::Variable(_)
        | Expr::Function { .. }
        | Expr::Aggregate { .. }
        | Expr::Window { .. }
        | Expr::InSubquery { .. }
        | Expr::Exists { .. }
        | Expr::ScalarSubquery(_) => constant = false,
        _ => {}
    });
    constant
}

#[cfg(test)]
mod tests {
    use marlinsql_ir::CastType;

    use super::*;

    fn compiler() -> ExprCompiler {
        ExprCompiler::new(SessionHandle::new())
    }

    fn int(i: i64) -> Expr {
        Expr::Literal(Literal::Int(i))
    }

    fn col(name: &str) -> Expr {
        Expr::Column(ColumnRef::bare(name))
    }

    fn row(pairs: &[(&str, QueryValue)]) -> Row {
        Row::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    #[test]
    fn test_comparison_null_is_false_at_predicate() {
        let pred = compiler()
            .compile_predicate(&Expr::Binary {
                left: Box::new(col("a")),
                op: BinaryOp::Gt,
                right: Box::new(int(1)),
            })
            .unwrap();
        assert!(!pred(&row(&[("a", QueryValue::Null)])).unwrap());
        assert!(pred(&row(&[("a", QueryValue::Int(2))])).unwrap());
    }

    #[test]
    fn test_three_valued_or() {
        // NULL OR TRUE is true, NULL OR FALSE is null (false as predicate).
        let scalar = compiler()
            .compile_scalar(&Expr::Binary {
                left: Box::new(col("a")),
                op: BinaryOp::Or,
                right: Box::new(col("b")),
            })
            .unwrap();
        let out = scalar(&row(&[
            ("a", QueryValue::Null),
            ("b", QueryValue::Bool(true)),
        ]))
        .unwrap();
        assert_eq!(out, QueryValue::Bool(true));
        let out = scalar(&row(&[
            ("a", QueryValue::Null),
            ("b", QueryValue::Bool(false)),
        ]))
        .unwrap();
        assert!(out.is_null());
    }

    #[test]
    fn test_in_list_null_semantics() {
        let scalar = compiler()
            .compile_in_list(&col("a"), &[int(1), Expr::Literal(Literal::Null)], false)
            .unwrap();
        // no match but a null in the list -> unknown
        assert!(scalar(&row(&[("a", QueryValue::Int(9))])).unwrap().is_null());
        assert_eq!(
            scalar(&row(&[("a", QueryValue::Int(1))])).unwrap(),
            QueryValue::Bool(true)
        );
    }

    #[test]
    fn test_case_simple_and_searched() {
        let simple = Expr::Case {
            operand: Some(Box::new(col("x"))),
            branches: vec![(int(1), Expr::Literal(Literal::Text("one".into())))],
            else_result: Some(Box::new(Expr::Literal(Literal::Text("other".into())))),
        };
        let scalar = compiler().compile_scalar(&simple).unwrap();
        assert_eq!(
            scalar(&row(&[("x", QueryValue::Int(1))])).unwrap(),
            QueryValue::Text("one".into())
        );
        assert_eq!(
            scalar(&row(&[("x", QueryValue::Int(7))])).unwrap(),
            QueryValue::Text("other".into())
        );
    }

    #[test]
    fn test_variable_lookup() {
        let session = SessionHandle::new();
        session.declare("@n", CastType::Int, QueryValue::Int(42));
        let compiler = ExprCompiler::new(session);
        let scalar = compiler
            .compile_scalar(&Expr::Variable("@n".into()))
            .unwrap();
        assert_eq!(scalar(&Row::new()).unwrap(), QueryValue::Int(42));
    }

    #[test]
    fn test_constant_folding() {
        let scalar = compiler()
            .compile_scalar(&Expr::Binary {
                left: Box::new(int(2)),
                op: BinaryOp::Mul,
                right: Box::new(int(21)),
            })
            .unwrap();
        assert_eq!(scalar(&Row::new()).unwrap(), QueryValue::Int(42));
    }

    #[test]
    fn test_qualified_lookup() {
        let r = row(&[
            ("a.name", QueryValue::Text("x".into())),
            ("b.name", QueryValue::Text("y".into())),
        ]);
        let v = lookup_column(&r, &ColumnRef::qualified("b", "name")).unwrap();
        assert_eq!(v, QueryValue::Text("y".into()));
        let err = lookup_column(&r, &ColumnRef::bare("name")).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        // missing qualified columns read as null (outer-join padding)
        let v = lookup_column(&r, &ColumnRef::qualified("c", "name")).unwrap();
        assert!(v.is_null());
    }
}
