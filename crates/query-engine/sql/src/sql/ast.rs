//! Type definitions of a SQL AST representation.

/// A SELECT statement
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub select_list: SelectList,
    pub from: TableName,
    pub where_: Where,
    pub order_by: OrderBy,
    pub limit: Limit,
}

/// An INSERT statement over a single row
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: TableName,
    pub columns: Vec<ColumnName>,
    pub values: Vec<Expression>,
    pub returning: Returning,
}

/// An UPDATE statement
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableName,
    pub set: Vec<(ColumnName, Expression)>,
    pub where_: Where,
    pub returning: Returning,
}

/// A DELETE statement
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableName,
    pub where_: Where,
}

/// a RETURNING clause
#[derive(Debug, Clone, PartialEq)]
pub enum Returning {
    Nothing,
    Star,
    /// An explicit aliased projection, like a select list
    Projection(Vec<(ColumnAlias, Expression)>),
}

/// A select list of aliased expressions
#[derive(Debug, Clone, PartialEq)]
pub struct SelectList(pub Vec<(ColumnAlias, Expression)>);

/// A WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub struct Where(pub Expression);

/// An ORDER BY clause
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub elements: Vec<OrderByElement>,
}

/// A single element in an ORDER BY clause
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByElement {
    pub target: Expression,
    pub direction: OrderByDirection,
}

/// A direction for a single ORDER BY element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderByDirection {
    Asc,
    Desc,
}

/// LIMIT and OFFSET clauses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A scalar expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// AND clause
    And {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// OR clause
    Or {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// NOT clause
    Not(Box<Expression>),
    /// A binary operation on two scalar expressions
    BinaryOperation {
        left: Box<Expression>,
        operator: BinaryOperator,
        right: Box<Expression>,
    },
    /// A binary operation on a scalar expression and an array of scalar expressions
    BinaryArrayOperation {
        left: Box<Expression>,
        operator: BinaryArrayOperator,
        right: Vec<Expression>,
    },
    /// An unary operation on a scalar expression
    UnaryOperation {
        expression: Box<Expression>,
        operator: UnaryOperator,
    },
    /// A scalar function call
    FunctionCall {
        function: Function,
        args: Vec<Expression>,
    },
    /// A cast of an expression to a native type
    Cast {
        expression: Box<Expression>,
        r#type: CastType,
    },
    /// A jsonb path access into a column, `"col"->'a'->>'b'`.
    /// `as_text` picks `->>` for the final step.
    JsonPath {
        column: ColumnName,
        path: Vec<String>,
        as_text: bool,
    },
    /// A column reference
    ColumnReference(ColumnName),
    /// An irreducible value
    Value(Value),
    /// A raw fragment. The single unsafe variant: callers own the proof
    /// that the contents cannot escape the surrounding statement.
    Raw(String),
}

/// An unary operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnaryOperator {
    IsNull,
    IsNotNull,
}

/// A binary operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryOperator {
    Equals,
    NotEquals,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    Regex,
    CaseInsensitiveRegex,
    /// `@>`: jsonb or geometric containment
    Contains,
    /// `<@`: jsonb or geometric containment, flipped
    ContainedBy,
    /// `&&`: array overlap
    ArrayOverlaps,
    /// `~=`: geometric point equality
    PointEquals,
    /// `@@`: text-search match
    TextSearchMatch,
    /// `+`: numeric addition
    Plus,
    /// `-`: numeric subtraction, or jsonb key removal
    Minus,
    /// `->`: jsonb key access on an arbitrary expression
    JsonGet,
    /// `->>`: jsonb key access, extracting text
    JsonGetText,
}

/// A binary operator when the rhs is an array
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryArrayOperator {
    In,
    NotIn,
}

/// A scalar function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Function {
    Coalesce,
    JsonBuildArray,
    ToJsonb,
    ToTsvector,
    ToTsquery,
    TsRank,
    Point,
    DistanceSphere,
    Unknown(String),
}

/// Native types an expression can be cast to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastType {
    Jsonb,
    Text,
    TextArray,
    DoublePrecision,
    Point,
    Polygon,
    Box,
    Geometry,
    Timestamptz,
}

/// Value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Null,
    Json(serde_json::Value),
    StringArray(Vec<String>),
}

/// A database table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(pub String);

/// A database table's column name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnName(pub String);

/// aliases that we give to columns
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnAlias {
    pub name: String,
}
