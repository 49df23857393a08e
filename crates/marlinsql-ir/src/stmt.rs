use crate::expr::{CastType, Expr, SortExpr};

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub columns: Vec<String>,
    pub query: Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    Select(Box<Select>),
    SetOperation {
        op: SetOperator,
        all: bool,
        left: Box<QueryBody>,
        right: Box<QueryBody>,
    },
}

/// A full query expression: body plus the clauses that apply across set
/// operation branches.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub ctes: Vec<Cte>,
    pub body: QueryBody,
    pub order_by: Vec<SortExpr>,
    pub offset: Option<Expr>,
    pub fetch: Option<Expr>,
}

impl Query {
    pub fn single_select(select: Select) -> Query {
        Query {
            ctes: Vec::new(),
            body: QueryBody::Select(Box::new(select)),
            order_by: Vec::new(),
            offset: None,
            fetch: None,
        }
    }

    /// The leftmost SELECT of the body, which establishes the output column
    /// set for set operations.
    pub fn first_select(&self) -> &Select {
        fn first(body: &QueryBody) -> &Select {
            match body {
                QueryBody::Select(s) => s,
                QueryBody::SetOperation { left, .. } => first(left),
            }
        }
        first(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopClause {
    pub quantity: Expr,
    pub percent: bool,
    pub with_ties: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Expr { expr: Expr, alias: Option<String> },
    /// `*` or `alias.*`.
    Wildcard(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    /// A remote entity, `schema.name` or bare; `#name` is a session temp
    /// table and the reserved `metadata` schema addresses the virtual tables.
    Entity {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    Derived {
        query: Box<Query>,
        alias: String,
    },
    OpenJson {
        json: Expr,
        path: Option<String>,
        alias: Option<String>,
    },
    StringSplit {
        text: Expr,
        separator: Expr,
        alias: Option<String>,
    },
}

impl TableSource {
    pub fn alias_or_name(&self) -> Option<&str> {
        match self {
            TableSource::Entity { alias, name, .. } => Some(alias.as_deref().unwrap_or(name)),
            TableSource::Derived { alias, .. } => Some(alias),
            TableSource::OpenJson { alias, .. } | TableSource::StringSplit { alias, .. } => {
                alias.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub source: TableSource,
    pub kind: JoinKind,
    pub condition: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableWithJoins {
    pub base: TableSource,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub top: Option<TopClause>,
    pub projection: Vec<SelectItem>,
    pub from: Option<TableWithJoins>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Query(Box<Query>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMatchKind {
    Matched,
    NotMatchedByTarget,
    NotMatchedBySource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Insert {
        columns: Vec<String>,
        values: Vec<Expr>,
    },
    Update {
        assignments: Vec<(String, Expr)>,
    },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeClause {
    pub kind: MergeMatchKind,
    pub predicate: Option<Expr>,
    pub action: MergeAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Select {
        query: Query,
        /// Non-empty for `SELECT @x = expr ...`; one variable per projection
        /// column, assigned from the last row.
        into_variables: Vec<String>,
    },
    Insert {
        entity: String,
        columns: Vec<String>,
        source: InsertSource,
    },
    Update {
        entity: String,
        alias: Option<String>,
        assignments: Vec<(String, Expr)>,
        selection: Option<Expr>,
    },
    Delete {
        entity: String,
        alias: Option<String>,
        selection: Option<Expr>,
    },
    Merge {
        entity: String,
        alias: Option<String>,
        source: TableSource,
        on: Expr,
        clauses: Vec<MergeClause>,
    },
    Declare {
        declarations: Vec<(String, CastType, Option<Expr>)>,
    },
    SetVariable {
        name: String,
        value: Expr,
    },
    If {
        condition: Expr,
        then_branch: Vec<Statement>,
        else_branch: Option<Vec<Statement>>,
    },
    While {
        condition: Expr,
        body: Vec<Statement>,
    },
    TryCatch {
        try_block: Vec<Statement>,
        catch_block: Vec<Statement>,
    },
    Block(Vec<Statement>),
    Break,
    Continue,
    Print(Expr),
    ExecuteAs {
        user: Expr,
    },
    Revert,
    Execute {
        procedure: String,
        args: Vec<Expr>,
    },
    CreateTempTable {
        name: String,
        columns: Vec<(String, CastType)>,
    },
    DropTables {
        names: Vec<String>,
        if_exists: bool,
    },
}

/// One parsed statement with its source position and original text.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub line: u64,
    pub column: u64,
    /// Verbatim source of the statement, used for the tabular pass-through
    /// compatibility path and diagnostics.
    pub sql: String,
}

impl Statement {
    pub fn new(kind: StatementKind, line: u64, column: u64, sql: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            column,
            sql: sql.into(),
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Insert { .. }
                | StatementKind::Update { .. }
                | StatementKind::Delete { .. }
                | StatementKind::Merge { .. }
        )
    }
}
