//! Helpers for building sql::ast types in certain shapes and patterns.

use super::ast::*;

/// A `true` expression.
pub fn true_expr() -> Expression {
    Expression::Value(Value::Bool(true))
}

/// A `false` expression.
pub fn false_expr() -> Expression {
    Expression::Value(Value::Bool(false))
}

// Combinators //

/// Fold a list of expressions into a single AND chain. An empty list
/// collapses to TRUE.
pub fn and_all(exprs: impl IntoIterator<Item = Expression>) -> Expression {
    let mut iter = exprs.into_iter();
    match iter.next() {
        None => true_expr(),
        Some(first) => iter.fold(first, |acc, expr| Expression::And {
            left: Box::new(acc),
            right: Box::new(expr),
        }),
    }
}

/// Fold a list of expressions into a single OR chain. An empty list
/// collapses to FALSE.
pub fn or_all(exprs: impl IntoIterator<Item = Expression>) -> Expression {
    let mut iter = exprs.into_iter();
    match iter.next() {
        None => false_expr(),
        Some(first) => iter.fold(first, |acc, expr| Expression::Or {
            left: Box::new(acc),
            right: Box::new(expr),
        }),
    }
}

/// An equality comparison between a column and a value.
pub fn column_equals(column: &str, value: Value) -> Expression {
    Expression::BinaryOperation {
        left: Box::new(Expression::ColumnReference(ColumnName(column.to_string()))),
        operator: BinaryOperator::Equals,
        right: Box::new(Expression::Value(value)),
    }
}

/// An `IS NULL` check on a column.
pub fn column_is_null(column: &str) -> Expression {
    Expression::UnaryOperation {
        expression: Box::new(Expression::ColumnReference(ColumnName(column.to_string()))),
        operator: UnaryOperator::IsNull,
    }
}

/// Create column aliases using this function so we build everything in one place.
pub fn make_column_alias(name: String) -> ColumnAlias {
    ColumnAlias { name }
}
