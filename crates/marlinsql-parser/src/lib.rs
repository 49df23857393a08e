//! T-SQL front end: parses a script into the MarlinSQL syntax tree.
//!
//! Leaf statements (SELECT, INSERT, UPDATE, DELETE, MERGE, DECLARE, SET,
//! CREATE/DROP TABLE) are parsed by `sqlparser` with the MSSQL dialect.
//! Script-level control flow the dialect predates (IF/ELSE, WHILE,
//! BEGIN TRY/CATCH, BEGIN/END blocks, EXECUTE AS/REVERT, PRINT,
//! BREAK/CONTINUE, GO) is recognized by a thin recursive-descent layer over
//! the same token stream (`script` module).

mod expr;
mod planner;
mod script;

pub use expr::plan_expr;
pub use planner::Planner;

use marlinsql_common::error::Result;
use marlinsql_ir::Statement;

/// Parse a T-SQL script into the typed syntax tree. Deterministic and pure;
/// fails with `Error::ParseError` carrying line and column.
pub fn parse(script_text: &str) -> Result<Vec<Statement>> {
    script::ScriptParser::new(script_text)?.parse_script()
}

#[cfg(test)]
mod tests {
    use marlinsql_ir::{QueryBody, StatementKind};

    use super::*;

    #[test]
    fn test_parse_simple_select() {
        let stmts = parse("SELECT name FROM account WHERE statecode = 0").unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StatementKind::Select { query, .. } => {
                let select = query.first_select();
                assert_eq!(select.projection.len(), 1);
                assert!(select.selection.is_some());
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse("SELECT FROM WHERE").unwrap_err();
        assert_eq!(err.code(), "Query.ParseError");
    }

    #[test]
    fn test_parse_multi_statement_batch() {
        let stmts = parse(
            "DECLARE @n INT = 0;\n\
             WHILE @n < 3\n\
             BEGIN\n\
                 SET @n = @n + 1;\n\
             END\n\
             SELECT @n",
        )
        .unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0].kind, StatementKind::Declare { .. }));
        assert!(matches!(stmts[1].kind, StatementKind::While { .. }));
        assert!(matches!(stmts[2].kind, StatementKind::Select { .. }));
    }

    #[test]
    fn test_parse_if_else() {
        let stmts = parse(
            "IF @x > 1\n\
                 SELECT 1\n\
             ELSE\n\
             BEGIN\n\
                 SELECT 2;\n\
                 SELECT 3;\n\
             END",
        )
        .unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StatementKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(then_branch.len(), 1);
                assert_eq!(else_branch.as_ref().unwrap().len(), 2);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_try_catch() {
        let stmts = parse(
            "BEGIN TRY\n\
                 SELECT 1/0;\n\
             END TRY\n\
             BEGIN CATCH\n\
                 SELECT ERROR_MESSAGE();\n\
             END CATCH",
        )
        .unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0].kind, StatementKind::TryCatch { .. }));
    }

    #[test]
    fn test_parse_union_all() {
        let stmts = parse("SELECT a FROM t1 UNION ALL SELECT a FROM t2").unwrap();
        match &stmts[0].kind {
            StatementKind::Select { query, .. } => {
                assert!(matches!(query.body, QueryBody::SetOperation { all: true, .. }));
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_statement_positions_and_text() {
        let stmts = parse("SELECT 1;\nSELECT 2").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].line, 1);
        assert_eq!(stmts[1].line, 2);
        assert_eq!(stmts[0].sql.trim_end_matches(';').trim(), "SELECT 1");
        assert_eq!(stmts[1].sql.trim(), "SELECT 2");
    }

    #[test]
    fn test_go_separates_statements() {
        let stmts = parse("SELECT 1\nGO\nSELECT 2").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_print_and_break() {
        let stmts = parse(
            "WHILE 1 = 1\n\
             BEGIN\n\
                 PRINT 'looping';\n\
                 BREAK;\n\
             END",
        )
        .unwrap();
        match &stmts[0].kind {
            StatementKind::While { body, .. } => {
                assert!(matches!(body[0].kind, StatementKind::Print(_)));
                assert!(matches!(body[1].kind, StatementKind::Break));
            }
            other => panic!("expected while, got {:?}", other),
        }
    }
}
