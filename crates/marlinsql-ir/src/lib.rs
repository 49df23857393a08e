//! Typed syntax tree for MarlinSQL. Produced exclusively by the parser,
//! consumed by the plan builder; immutable after parsing.

pub mod expr;
pub mod stmt;

pub use expr::{
    AggregateFunc, BinaryOp, CastType, ColumnRef, Expr, FrameBound, FrameUnits, Literal, SortExpr,
    UnaryOp, WindowFrame, WindowFunc,
};
pub use stmt::{
    Cte, InsertSource, Join, JoinKind, MergeAction, MergeClause, MergeMatchKind, Query, QueryBody,
    Select, SelectItem, SetOperator, Statement, StatementKind, TableSource, TableWithJoins,
    TopClause,
};
