use marlinsql_common::error::{Error, Result};
use marlinsql_ir::{Statement, StatementKind};
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Location, Token};

use crate::expr::plan_expr;
use crate::planner::Planner;

static DIALECT: MsSqlDialect = MsSqlDialect {};

/// Recursive-descent layer over the sqlparser token stream. Owns statement
/// splitting and the T-SQL control-flow constructs; leaf statements are
/// delegated to `Parser::parse_statement`.
pub(crate) struct ScriptParser<'a> {
    parser: Parser<'a>,
    src: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> ScriptParser<'a> {
    pub(crate) fn new(src: &'a str) -> Result<Self> {
        let parser = Parser::new(&DIALECT)
            .try_with_sql(src)
            .map_err(tokenizer_error)?;
        let mut line_starts = vec![0usize];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Ok(Self {
            parser,
            src,
            line_starts,
        })
    }

    pub(crate) fn parse_script(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if self.at_eof() {
                break;
            }
            statements.push(self.parse_one()?);
        }
        Ok(statements)
    }

    fn parse_one(&mut self) -> Result<Statement> {
        let start = self.current_location();
        let kind = self.parse_kind(start)?;
        let end = self.current_location();
        let sql = self.slice(start, end);
        Ok(Statement::new(kind, start.line, start.column, sql))
    }

    fn parse_kind(&mut self, start: Location) -> Result<StatementKind> {
        match self.peek_word().as_deref() {
            Some("IF") => self.parse_if(),
            Some("WHILE") => self.parse_while(),
            Some("BEGIN") => match self.peek_word_at(1).as_deref() {
                Some("TRY") => self.parse_try_catch(),
                Some("TRANSACTION") | Some("TRAN") => Err(Error::parse_error(
                    "transactions are not supported by the remote store",
                    start.line,
                    start.column,
                )),
                _ => {
                    self.bump();
                    let body = self.parse_until_end()?;
                    self.expect_word("END", start)?;
                    Ok(StatementKind::Block(body))
                }
            },
            Some("BREAK") => {
                self.bump();
                Ok(StatementKind::Break)
            }
            Some("CONTINUE") => {
                self.bump();
                Ok(StatementKind::Continue)
            }
            Some("PRINT") => {
                self.bump();
                let expr = self.parse_scalar(start)?;
                Ok(StatementKind::Print(expr))
            }
            Some("REVERT") => {
                self.bump();
                Ok(StatementKind::Revert)
            }
            Some("EXEC") | Some("EXECUTE") if self.peek_word_at(1).as_deref() == Some("AS") => {
                self.parse_execute_as(start)
            }
            Some("ELSE") | Some("END") => Err(Error::parse_error(
                format!("unexpected {}", self.peek_word().unwrap_or_default()),
                start.line,
                start.column,
            )),
            _ => {
                let stmt = self
                    .parser
                    .parse_statement()
                    .map_err(|e| self.parser_error(e, start))?;
                Planner::new().plan_statement(&stmt, start)
            }
        }
    }

    fn parse_if(&mut self) -> Result<StatementKind> {
        let start = self.current_location();
        self.bump();
        let condition = self.parse_scalar(start)?;
        let then_branch = self.parse_branch()?;
        self.skip_separators();
        let else_branch = if self.peek_word().as_deref() == Some("ELSE") {
            self.bump();
            Some(self.parse_branch()?)
        } else {
            None
        };
        Ok(StatementKind::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn parse_while(&mut self) -> Result<StatementKind> {
        let start = self.current_location();
        self.bump();
        let condition = self.parse_scalar(start)?;
        let body = self.parse_branch()?;
        Ok(StatementKind::While { condition, body })
    }

    fn parse_try_catch(&mut self) -> Result<StatementKind> {
        let start = self.current_location();
        self.bump(); // BEGIN
        self.bump(); // TRY
        let try_block = self.parse_until_end()?;
        self.expect_word("END", start)?;
        self.expect_word("TRY", start)?;
        self.skip_separators();
        self.expect_word("BEGIN", start)?;
        self.expect_word("CATCH", start)?;
        let catch_block = self.parse_until_end()?;
        self.expect_word("END", start)?;
        self.expect_word("CATCH", start)?;
        Ok(StatementKind::TryCatch {
            try_block,
            catch_block,
        })
    }

    fn parse_execute_as(&mut self, start: Location) -> Result<StatementKind> {
        self.bump(); // EXEC[UTE]
        self.bump(); // AS
        match self.peek_word().as_deref() {
            Some("USER") | Some("LOGIN") => {
                self.bump();
            }
            _ => {
                return Err(Error::parse_error(
                    "expected USER or LOGIN after EXECUTE AS",
                    start.line,
                    start.column,
                ))
            }
        }
        if !matches!(self.parser.peek_token().token, Token::Eq) {
            return Err(Error::parse_error(
                "expected = after EXECUTE AS USER",
                start.line,
                start.column,
            ));
        }
        self.bump();
        let user = self.parse_scalar(start)?;
        Ok(StatementKind::ExecuteAs { user })
    }

    /// One statement, or a BEGIN ... END block flattened into its statements.
    fn parse_branch(&mut self) -> Result<Vec<Statement>> {
        self.skip_separators();
        let start = self.current_location();
        if self.peek_word().as_deref() == Some("BEGIN")
            && self.peek_word_at(1).as_deref() != Some("TRY")
        {
            self.bump();
            let body = self.parse_until_end()?;
            self.expect_word("END", start)?;
            Ok(body)
        } else {
            Ok(vec![self.parse_one()?])
        }
    }

    fn parse_until_end(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if self.at_eof() {
                let loc = self.current_location();
                return Err(Error::parse_error(
                    "missing END",
                    loc.line,
                    loc.column,
                ));
            }
            if self.peek_word().as_deref() == Some("END") {
                return Ok(statements);
            }
            statements.push(self.parse_one()?);
        }
    }

    fn parse_scalar(&mut self, start: Location) -> Result<marlinsql_ir::Expr> {
        let ast = self
            .parser
            .parse_expr()
            .map_err(|e| self.parser_error(e, start))?;
        plan_expr(&ast)
    }

    fn skip_separators(&mut self) {
        loop {
            match &self.parser.peek_token().token {
                Token::SemiColon => {
                    self.bump();
                }
                Token::Word(w) if w.value.eq_ignore_ascii_case("GO") => {
                    self.bump();
                }
                _ => return,
            }
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.parser.peek_token().token, Token::EOF)
    }

    fn bump(&mut self) {
        self.parser.next_token();
    }

    fn peek_word(&self) -> Option<String> {
        match &self.parser.peek_token().token {
            Token::Word(w) => Some(w.value.to_uppercase()),
            _ => None,
        }
    }

    fn peek_word_at(&self, n: usize) -> Option<String> {
        match &self.parser.peek_nth_token(n).token {
            Token::Word(w) => Some(w.value.to_uppercase()),
            _ => None,
        }
    }

    fn expect_word(&mut self, word: &str, start: Location) -> Result<()> {
        if self.peek_word().as_deref() == Some(word) {
            self.bump();
            Ok(())
        } else {
            let loc = self.current_location();
            Err(Error::parse_error(
                format!("expected {} for block starting here", word),
                if loc.line > 0 { loc.line } else { start.line },
                if loc.line > 0 { loc.column } else { start.column },
            ))
        }
    }

    fn current_location(&self) -> Location {
        self.parser.peek_token().span.start
    }

    fn offset_of(&self, loc: Location) -> usize {
        if loc.line == 0 {
            return self.src.len();
        }
        let line_start = match self.line_starts.get(loc.line as usize - 1) {
            Some(s) => *s,
            None => return self.src.len(),
        };
        let line = &self.src[line_start..];
        let col = loc.column.saturating_sub(1) as usize;
        match line.char_indices().nth(col) {
            Some((i, _)) => line_start + i,
            None => (line_start + line.find('\n').unwrap_or(line.len())).min(self.src.len()),
        }
    }

    fn slice(&self, start: Location, end: Location) -> String {
        let s = self.offset_of(start);
        let e = if matches!(self.parser.peek_token().token, Token::EOF) {
            self.src.len()
        } else {
            self.offset_of(end)
        };
        self.src[s..e.max(s)].trim().to_string()
    }

    fn parser_error(&self, e: ParserError, start: Location) -> Error {
        let loc = self.current_location();
        let (line, column) = if loc.line > 0 {
            (loc.line, loc.column)
        } else {
            (start.line, start.column)
        };
        Error::parse_error(strip_prefix(&e.to_string()), line, column)
    }
}

fn tokenizer_error(e: ParserError) -> Error {
    Error::parse_error(strip_prefix(&e.to_string()), 0, 0)
}

fn strip_prefix(message: &str) -> String {
    message
        .trim_start_matches("sql parser error: ")
        .trim_start_matches("tokenizer error: ")
        .to_string()
}
