//! Editor services over the MarlinSQL front end: token classification for
//! highlighting, parse/semantic diagnostics, and cursor-aware completions
//! against the schema cache.

use std::time::{Duration, Instant};

use sqlparser::dialect::MsSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use tokio_util::sync::CancellationToken;

use marlinsql_common::metadata::MetadataCache;
use marlinsql_ir::{Statement, StatementKind, TableSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    Variable,
    Number,
    Text,
    Operator,
    Comment,
    Whitespace,
    Punctuation,
}

#[derive(Debug, Clone)]
pub struct ClassifiedToken {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based source position.
    pub line: u64,
    pub column: u64,
}

/// Token classification for syntax highlighting. Unlexable text yields the
/// tokens up to the failure point.
pub fn tokenize(text: &str) -> Vec<ClassifiedToken> {
    let dialect = MsSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, text).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(_) => Vec::new(),
    };
    tokens
        .into_iter()
        .filter(|t| !matches!(t.token, Token::EOF))
        .map(|t| {
            let kind = classify(&t.token);
            ClassifiedToken {
                kind,
                text: t.token.to_string(),
                line: t.span.start.line,
                column: t.span.start.column,
            }
        })
        .collect()
}

fn classify(token: &Token) -> TokenKind {
    match token {
        Token::Word(word) => {
            if word.value.starts_with('@') {
                TokenKind::Variable
            } else if word.keyword != Keyword::NoKeyword && word.quote_style.is_none() {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier
            }
        }
        Token::Number(_, _) => TokenKind::Number,
        Token::SingleQuotedString(_)
        | Token::NationalStringLiteral(_)
        | Token::HexStringLiteral(_) => TokenKind::Text,
        Token::Whitespace(Whitespace::SingleLineComment { .. })
        | Token::Whitespace(Whitespace::MultiLineComment(_)) => TokenKind::Comment,
        Token::Whitespace(_) => TokenKind::Whitespace,
        Token::Comma | Token::SemiColon | Token::LParen | Token::RParen | Token::Period => {
            TokenKind::Punctuation
        }
        _ => TokenKind::Operator,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u64,
    pub column: u64,
}

/// Parse the script and report syntax errors plus unknown-entity warnings
/// against a warm schema cache.
pub fn diagnostics(text: &str, metadata: &MetadataCache) -> Vec<Diagnostic> {
    let statements = match marlinsql_parser::parse(text) {
        Ok(statements) => statements,
        Err(error) => {
            let payload = error.payload();
            return vec![Diagnostic {
                severity: Severity::Error,
                message: payload.message,
                line: payload.line.unwrap_or(0),
                column: payload.column.unwrap_or(0),
            }];
        }
    };

    if metadata.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for statement in &statements {
        check_statement(statement, metadata, &mut out);
    }
    out
}

fn check_statement(statement: &Statement, metadata: &MetadataCache, out: &mut Vec<Diagnostic>) {
    let mut entities: Vec<String> = Vec::new();
    collect_entities(&statement.kind, &mut entities);
    for entity in entities {
        if metadata.entity(&entity).is_none() {
            out.push(Diagnostic {
                severity: Severity::Warning,
                message: format!("unknown entity '{}'", entity),
                line: statement.line,
                column: statement.column,
            });
        }
    }
}

fn collect_entities(kind: &StatementKind, out: &mut Vec<String>) {
    fn from_source(source: &TableSource, out: &mut Vec<String>) {
        if let TableSource::Entity {
            schema: None, name, ..
        } = source
        {
            if !name.starts_with('#') && !out.contains(name) {
                out.push(name.clone());
            }
        }
    }
    match kind {
        StatementKind::Select { query, .. } => {
            let select = query.first_select();
            if let Some(from) = &select.from {
                from_source(&from.base, out);
                for join in &from.joins {
                    from_source(&join.source, out);
                }
            }
        }
        StatementKind::Insert { entity, .. }
        | StatementKind::Update { entity, .. }
        | StatementKind::Delete { entity, .. }
        | StatementKind::Merge { entity, .. } => {
            if !entity.starts_with('#') && !out.contains(entity) {
                out.push(entity.clone());
            }
        }
        StatementKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            for statement in then_branch {
                collect_entities(&statement.kind, out);
            }
            if let Some(block) = else_branch {
                for statement in block {
                    collect_entities(&statement.kind, out);
                }
            }
        }
        StatementKind::While { body, .. } | StatementKind::Block(body) => {
            for statement in body {
                collect_entities(&statement.kind, out);
            }
        }
        StatementKind::TryCatch {
            try_block,
            catch_block,
        } => {
            for statement in try_block.iter().chain(catch_block) {
                collect_entities(&statement.kind, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Entity,
    Attribute,
    Function,
    Keyword,
}

#[derive(Debug, Clone)]
pub struct CompletionItem {
    pub label: String,
    pub kind: CompletionKind,
}

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP BY", "HAVING", "ORDER BY", "JOIN", "LEFT JOIN",
    "INNER JOIN", "UNION", "UNION ALL", "INSERT INTO", "UPDATE", "DELETE FROM", "DECLARE",
    "SET", "IF", "ELSE", "WHILE", "BEGIN", "END", "BEGIN TRY", "BEGIN CATCH", "TOP",
    "DISTINCT", "OFFSET", "FETCH NEXT", "CASE", "WHEN", "THEN", "EXISTS", "BETWEEN", "LIKE",
    "IS NULL", "IS NOT NULL",
];

const FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "STRING_AGG", "UPPER", "LOWER", "LEN", "SUBSTRING",
    "CHARINDEX", "REPLACE", "TRIM", "LTRIM", "RTRIM", "STUFF", "REPLICATE", "PATINDEX",
    "CONCAT", "CONCAT_WS", "FORMAT", "LEFT", "RIGHT", "REVERSE", "GETDATE", "SYSUTCDATETIME",
    "DATEADD", "DATEDIFF", "DATEPART", "DATENAME", "EOMONTH", "DATEFROMPARTS", "ABS",
    "CEILING", "FLOOR", "ROUND", "POWER", "SQRT", "IIF", "COALESCE", "NULLIF", "ISNULL",
    "CAST", "CONVERT", "TRY_CONVERT", "JSON_VALUE", "JSON_QUERY", "JSON_PATH_EXISTS",
    "ROW_NUMBER", "RANK", "DENSE_RANK", "NTILE", "LAG", "LEAD", "OPENJSON", "STRING_SPLIT",
];

/// Kind-aware completion at a cursor offset. Cancellable; returns whatever
/// was gathered when the budget runs out.
pub fn completions(
    text: &str,
    offset: usize,
    metadata: &MetadataCache,
    cancel: &CancellationToken,
    budget: Option<Duration>,
) -> Vec<CompletionItem> {
    let started = Instant::now();
    let budget = budget.unwrap_or(Duration::from_millis(100));
    let before = &text[..offset.min(text.len())];

    let dialect = MsSqlDialect {};
    let strip = |input: &str| -> Vec<Token> {
        Tokenizer::new(&dialect, input)
            .tokenize()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .collect()
    };
    let tokens = strip(before);
    // Alias resolution sees the whole statement; a FROM clause after the
    // cursor still names the entities in play.
    let all_tokens = strip(text);

    let mut out = Vec::new();
    let exhausted =
        |out: &Vec<CompletionItem>| cancel.is_cancelled() || started.elapsed() > budget && !out.is_empty();

    match cursor_context(&tokens) {
        CursorContext::EntityName => {
            for name in metadata.entity_names() {
                if exhausted(&out) {
                    return out;
                }
                out.push(CompletionItem {
                    label: name,
                    kind: CompletionKind::Entity,
                });
            }
        }
        CursorContext::AttributeOf(alias) => {
            let aliases = from_clause_aliases(&all_tokens);
            let entity = aliases
                .iter()
                .find(|(a, _)| a.eq_ignore_ascii_case(&alias))
                .map(|(_, e)| e.clone())
                .unwrap_or(alias);
            if let Some(meta) = metadata.entity(&entity) {
                for attr in &meta.attributes {
                    if exhausted(&out) {
                        return out;
                    }
                    out.push(CompletionItem {
                        label: attr.logical_name.clone(),
                        kind: CompletionKind::Attribute,
                    });
                }
            }
        }
        CursorContext::Expression => {
            for (_, entity) in from_clause_aliases(&all_tokens) {
                if let Some(meta) = metadata.entity(&entity) {
                    for attr in &meta.attributes {
                        if exhausted(&out) {
                            return out;
                        }
                        out.push(CompletionItem {
                            label: attr.logical_name.clone(),
                            kind: CompletionKind::Attribute,
                        });
                    }
                }
            }
            for function in FUNCTIONS {
                if exhausted(&out) {
                    return out;
                }
                out.push(CompletionItem {
                    label: format!("{}(", function),
                    kind: CompletionKind::Function,
                });
            }
        }
        CursorContext::StatementStart => {
            for keyword in KEYWORDS {
                if exhausted(&out) {
                    return out;
                }
                out.push(CompletionItem {
                    label: keyword.to_string(),
                    kind: CompletionKind::Keyword,
                });
            }
        }
    }
    out
}

enum CursorContext {
    StatementStart,
    EntityName,
    AttributeOf(String),
    Expression,
}

fn cursor_context(tokens: &[Token]) -> CursorContext {
    // alias '.' [partial] addresses an entity's attributes
    let tail = tokens.len().saturating_sub(3);
    for window_start in (tail..tokens.len()).rev() {
        if let Some(Token::Period) = tokens.get(window_start) {
            if let Some(Token::Word(word)) = tokens.get(window_start.wrapping_sub(1)) {
                return CursorContext::AttributeOf(word.value.clone());
            }
        }
    }

    let last_keyword = tokens.iter().rev().find_map(|token| match token {
        Token::Word(word) if word.keyword != Keyword::NoKeyword => Some(word.keyword),
        _ => None,
    });

    match last_keyword {
        None => CursorContext::StatementStart,
        Some(Keyword::FROM) | Some(Keyword::JOIN) | Some(Keyword::INTO)
        | Some(Keyword::UPDATE) | Some(Keyword::MERGE) | Some(Keyword::USING) => {
            // `FROM entity alias` already names the entity.
            let since_keyword = tokens
                .iter()
                .rev()
                .take_while(|t| {
                    !matches!(t, Token::Word(w) if w.keyword != Keyword::NoKeyword)
                })
                .count();
            if since_keyword == 0 {
                CursorContext::EntityName
            } else {
                CursorContext::Expression
            }
        }
        Some(Keyword::SELECT) | Some(Keyword::WHERE) | Some(Keyword::BY) | Some(Keyword::ON)
        | Some(Keyword::HAVING) | Some(Keyword::AND) | Some(Keyword::OR) | Some(Keyword::WHEN)
        | Some(Keyword::THEN) | Some(Keyword::SET) => CursorContext::Expression,
        Some(_) => CursorContext::Expression,
    }
}

/// `(alias, entity)` pairs from every FROM/JOIN in the token stream.
fn from_clause_aliases(tokens: &[Token]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_source_keyword = matches!(
            &tokens[i],
            Token::Word(w) if matches!(w.keyword, Keyword::FROM | Keyword::JOIN | Keyword::UPDATE | Keyword::INTO)
        );
        if is_source_keyword {
            if let Some(Token::Word(entity)) = tokens.get(i + 1) {
                if entity.keyword == Keyword::NoKeyword {
                    let mut alias = entity.value.clone();
                    let mut next = i + 2;
                    if let Some(Token::Word(word)) = tokens.get(next) {
                        if word.keyword == Keyword::AS {
                            next += 1;
                        }
                    }
                    if let Some(Token::Word(word)) = tokens.get(next) {
                        if word.keyword == Keyword::NoKeyword {
                            alias = word.value.clone();
                        }
                    }
                    out.push((alias, entity.value.clone()));
                }
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use marlinsql_common::metadata::{AttributeMetadata, AttributeType, EntityMetadata};

    use super::*;

    fn cache() -> MetadataCache {
        let cache = MetadataCache::new();
        cache.insert(EntityMetadata {
            logical_name: "account".into(),
            display_name: Some("Account".into()),
            primary_key: "accountid".into(),
            created_on_attribute: Some("createdon".into()),
            attributes: vec![
                AttributeMetadata::new("accountid", AttributeType::Uuid),
                AttributeMetadata::new("name", AttributeType::Text),
                AttributeMetadata::new("revenue", AttributeType::Money),
            ],
            relationships: Vec::new(),
        });
        cache.insert(EntityMetadata {
            logical_name: "contact".into(),
            display_name: None,
            primary_key: "contactid".into(),
            created_on_attribute: Some("createdon".into()),
            attributes: vec![AttributeMetadata::new("contactid", AttributeType::Uuid)],
            relationships: Vec::new(),
        });
        cache
    }

    #[test]
    fn test_tokenize_classification() {
        let tokens = tokenize("SELECT name, @x FROM account -- trailing");
        let kinds: Vec<TokenKind> = tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Punctuation,
                TokenKind::Variable,
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Comment,
            ]
        );
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[0].column, 1);
    }

    #[test]
    fn test_diagnostics_parse_error() {
        let out = diagnostics("SELEC name FROM account", &cache());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Error);
    }

    #[test]
    fn test_diagnostics_unknown_entity() {
        let out = diagnostics("SELECT name FROM nonexistent", &cache());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Warning);
        assert!(out[0].message.contains("nonexistent"));
    }

    #[test]
    fn test_completion_after_from_offers_entities() {
        let text = "SELECT name FROM ";
        let items = completions(text, text.len(), &cache(), &CancellationToken::new(), None);
        assert!(items
            .iter()
            .all(|item| item.kind == CompletionKind::Entity));
        assert!(items.iter().any(|item| item.label == "account"));
    }

    #[test]
    fn test_completion_after_alias_dot_offers_attributes() {
        let text = "SELECT a. FROM account a";
        let offset = "SELECT a.".len();
        let items = completions(text, offset, &cache(), &CancellationToken::new(), None);
        assert!(items.iter().any(|item| item.label == "revenue"));
        assert!(items
            .iter()
            .all(|item| item.kind == CompletionKind::Attribute));
    }

    #[test]
    fn test_completion_in_where_offers_columns_and_functions() {
        let text = "SELECT name FROM account WHERE ";
        let items = completions(text, text.len(), &cache(), &CancellationToken::new(), None);
        assert!(items.iter().any(|item| item.kind == CompletionKind::Attribute));
        assert!(items
            .iter()
            .any(|item| item.kind == CompletionKind::Function));
    }

    #[test]
    fn test_completion_at_start_offers_keywords() {
        let items = completions("", 0, &cache(), &CancellationToken::new(), None);
        assert!(items.iter().any(|item| item.label == "SELECT"));
        assert!(items.iter().all(|item| item.kind == CompletionKind::Keyword));
    }

    #[test]
    fn test_cancelled_completion_returns_partial() {
        let token = CancellationToken::new();
        token.cancel();
        let text = "SELECT name FROM ";
        let items = completions(text, text.len(), &cache(), &token, None);
        // cancelled before the second entity could be added
        assert!(items.len() <= 1);
    }
}
