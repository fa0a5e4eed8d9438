//! SQL AST types.
//!
//! The planner builds these nodes to describe the single statement a pipeline
//! prefix compiles to, and the memory engine parses incoming SQL into them.
//! Only the statement shapes the crate emits are represented.

/// Top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<SelectQuery>),
    Insert(InsertQuery),
    Update(UpdateQuery),
}

/// A single-table SELECT.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub filter: Option<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expression>,
    pub offset: Option<Expression>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// Simple table: `schema.table AS alias`
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// Derived table: `(SELECT ...) AS alias`
    Subquery { query: Box<Query>, alias: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    Literal(Literal),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Scalar function call: `LOWER(x)`.
    Function { name: String, args: Vec<Expression> },
    /// Aggregate call: `COUNT(*)`.
    Aggregate { name: String, args: Vec<Expression> },
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    Between {
        expr: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// `*` inside `COUNT(*)`.
    Wildcard,
    /// Bound parameter. Compiles to `?`; parsed from `$n` (1-based).
    Parameter(usize),
    /// Parenthesized expression.
    Nested(Box<Expression>),
    /// Pre-rendered dialect SQL, emitted verbatim.
    Fragment(String),
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Left-deep AND of `terms`, `None` when empty.
    pub fn conjoin(terms: impl IntoIterator<Item = Expression>) -> Option<Expression> {
        terms.into_iter().reduce(|left, right| Expression::BinaryOp {
            left: Box::new(left),
            op: BinaryOperator::And,
            right: Box::new(right),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
    NotLike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: TableRef,
    /// Empty means DEFAULT VALUES.
    pub columns: Vec<String>,
    pub values: Vec<Vec<Expression>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expression,
}
