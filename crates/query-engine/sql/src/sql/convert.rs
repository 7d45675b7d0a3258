//! Convert a SQL AST to a low-level SQL string.

use super::ast::*;
use super::helpers;
use super::string::{Param, SQL};

impl Select {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_syntax("SELECT ");
        self.select_list.to_sql(sql);
        sql.append_syntax(" FROM ");
        self.from.to_sql(sql);
        self.where_.to_sql(sql);
        self.order_by.to_sql(sql);
        self.limit.to_sql(sql);
    }
}

impl Insert {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_syntax("INSERT INTO ");
        self.table.to_sql(sql);
        sql.append_syntax(" (");
        for (index, column) in self.columns.iter().enumerate() {
            column.to_sql(sql);
            if index < (self.columns.len() - 1) {
                sql.append_syntax(", ")
            }
        }
        sql.append_syntax(") VALUES (");
        for (index, value) in self.values.iter().enumerate() {
            value.to_sql(sql);
            if index < (self.values.len() - 1) {
                sql.append_syntax(", ")
            }
        }
        sql.append_syntax(")");
        self.returning.to_sql(sql);
    }
}

impl Update {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_syntax("UPDATE ");
        self.table.to_sql(sql);
        sql.append_syntax(" SET ");
        for (index, (column, expression)) in self.set.iter().enumerate() {
            column.to_sql(sql);
            sql.append_syntax(" = ");
            expression.to_sql(sql);
            if index < (self.set.len() - 1) {
                sql.append_syntax(", ")
            }
        }
        self.where_.to_sql(sql);
        self.returning.to_sql(sql);
    }
}

impl Delete {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_syntax("DELETE FROM ");
        self.table.to_sql(sql);
        self.where_.to_sql(sql);
    }
}

impl Returning {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            Returning::Nothing => {}
            Returning::Star => sql.append_syntax(" RETURNING *"),
            Returning::Projection(projection) => {
                sql.append_syntax(" RETURNING ");
                SelectList(projection.clone()).to_sql(sql);
            }
        }
    }
}

impl SelectList {
    pub fn to_sql(&self, sql: &mut SQL) {
        let SelectList(select_list) = self;
        for (index, (col, expr)) in select_list.iter().enumerate() {
            expr.to_sql(sql);
            sql.append_syntax(" AS ");
            col.to_sql(sql);
            if index < (select_list.len() - 1) {
                sql.append_syntax(", ")
            }
        }
    }
}

impl Where {
    pub fn to_sql(&self, sql: &mut SQL) {
        let Where(expression) = self;
        if *expression != helpers::true_expr() {
            sql.append_syntax(" WHERE ");
            expression.to_sql(sql);
        }
    }
}

// scalars
impl Expression {
    pub fn to_sql(&self, sql: &mut SQL) {
        match &self {
            Expression::ColumnReference(column_name) => column_name.to_sql(sql),
            Expression::Value(value) => value.to_sql(sql),
            Expression::And { left, right } => {
                sql.append_syntax("(");
                left.to_sql(sql);
                sql.append_syntax(" AND ");
                right.to_sql(sql);
                sql.append_syntax(")");
            }
            Expression::Or { left, right } => {
                sql.append_syntax("(");
                left.to_sql(sql);
                sql.append_syntax(" OR ");
                right.to_sql(sql);
                sql.append_syntax(")");
            }
            Expression::Not(expr) => {
                sql.append_syntax("NOT ");
                expr.to_sql(sql);
            }
            Expression::BinaryOperation {
                left,
                operator,
                right,
            } => {
                sql.append_syntax("(");
                left.to_sql(sql);
                operator.to_sql(sql);
                right.to_sql(sql);
                sql.append_syntax(")");
            }
            Expression::BinaryArrayOperation {
                left,
                operator,
                right,
            } => {
                sql.append_syntax("(");
                left.to_sql(sql);
                operator.to_sql(sql);
                sql.append_syntax("(");
                for (index, item) in right.iter().enumerate() {
                    item.to_sql(sql);
                    if index < (right.len() - 1) {
                        sql.append_syntax(", ")
                    }
                }
                sql.append_syntax(")");
                sql.append_syntax(")");
            }
            Expression::UnaryOperation {
                expression,
                operator,
            } => {
                sql.append_syntax("(");
                expression.to_sql(sql);
                operator.to_sql(sql);
                sql.append_syntax(")");
            }
            Expression::FunctionCall { function, args } => {
                function.to_sql(sql);
                sql.append_syntax("(");
                for (index, arg) in args.iter().enumerate() {
                    arg.to_sql(sql);
                    if index < (args.len() - 1) {
                        sql.append_syntax(", ")
                    }
                }
                sql.append_syntax(")");
            }
            Expression::Cast { expression, r#type } => {
                // `::` binds tighter than `->` and most operators
                sql.append_syntax("(");
                expression.to_sql(sql);
                sql.append_syntax(")");
                r#type.to_sql(sql);
            }
            Expression::JsonPath {
                column,
                path,
                as_text,
            } => {
                column.to_sql(sql);
                for (index, key) in path.iter().enumerate() {
                    let last = index == path.len() - 1;
                    if last && *as_text {
                        sql.append_syntax("->>");
                    } else {
                        sql.append_syntax("->");
                    }
                    sql.append_syntax("'");
                    // keys are validated upstream to contain no quote chars
                    sql.append_syntax(&key.replace('\'', ""));
                    sql.append_syntax("'");
                }
            }
            Expression::Raw(fragment) => {
                sql.append_syntax(fragment);
            }
        }
    }
}

impl UnaryOperator {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            UnaryOperator::IsNull => sql.append_syntax(" IS NULL"),
            UnaryOperator::IsNotNull => sql.append_syntax(" IS NOT NULL"),
        }
    }
}

impl BinaryOperator {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            BinaryOperator::Equals => sql.append_syntax(" = "),
            BinaryOperator::NotEquals => sql.append_syntax(" <> "),
            BinaryOperator::LessThan => sql.append_syntax(" < "),
            BinaryOperator::LessThanOrEqualTo => sql.append_syntax(" <= "),
            BinaryOperator::GreaterThan => sql.append_syntax(" > "),
            BinaryOperator::GreaterThanOrEqualTo => sql.append_syntax(" >= "),
            BinaryOperator::Regex => sql.append_syntax(" ~ "),
            BinaryOperator::CaseInsensitiveRegex => sql.append_syntax(" ~* "),
            BinaryOperator::Contains => sql.append_syntax(" @> "),
            BinaryOperator::ContainedBy => sql.append_syntax(" <@ "),
            BinaryOperator::ArrayOverlaps => sql.append_syntax(" && "),
            BinaryOperator::PointEquals => sql.append_syntax(" ~= "),
            BinaryOperator::TextSearchMatch => sql.append_syntax(" @@ "),
            BinaryOperator::Plus => sql.append_syntax(" + "),
            BinaryOperator::Minus => sql.append_syntax(" - "),
            BinaryOperator::JsonGet => sql.append_syntax(" -> "),
            BinaryOperator::JsonGetText => sql.append_syntax(" ->> "),
        }
    }
}

impl BinaryArrayOperator {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            BinaryArrayOperator::In => sql.append_syntax(" IN "),
            BinaryArrayOperator::NotIn => sql.append_syntax(" NOT IN "),
        }
    }
}

impl Function {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            Function::Coalesce => sql.append_syntax("COALESCE"),
            Function::JsonBuildArray => sql.append_syntax("json_build_array"),
            Function::ToJsonb => sql.append_syntax("to_jsonb"),
            Function::ToTsvector => sql.append_syntax("to_tsvector"),
            Function::ToTsquery => sql.append_syntax("to_tsquery"),
            Function::TsRank => sql.append_syntax("ts_rank"),
            Function::Point => sql.append_syntax("POINT"),
            Function::DistanceSphere => sql.append_syntax("ST_DistanceSphere"),
            Function::Unknown(name) => sql.append_syntax(name),
        }
    }
}

impl CastType {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            CastType::Jsonb => sql.append_syntax("::jsonb"),
            CastType::Text => sql.append_syntax("::text"),
            CastType::TextArray => sql.append_syntax("::text[]"),
            CastType::DoublePrecision => sql.append_syntax("::double precision"),
            CastType::Point => sql.append_syntax("::point"),
            CastType::Polygon => sql.append_syntax("::polygon"),
            CastType::Box => sql.append_syntax("::box"),
            CastType::Geometry => sql.append_syntax("::geometry"),
            CastType::Timestamptz => sql.append_syntax("::timestamptz"),
        }
    }
}

impl Value {
    pub fn to_sql(&self, sql: &mut SQL) {
        match &self {
            Value::Int(i) => sql.append_param(Param::Int(*i)),
            Value::Float(n) => sql.append_param(Param::Float(*n)),
            Value::Bool(true) => sql.append_syntax("TRUE"),
            Value::Bool(false) => sql.append_syntax("FALSE"),
            Value::String(s) => sql.append_param(Param::String(s.clone())),
            Value::Null => sql.append_syntax("NULL"),
            Value::Json(v) => sql.append_param(Param::Json(v.clone())),
            Value::StringArray(items) => sql.append_param(Param::StringArray(items.clone())),
        }
    }
}

impl Limit {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self.limit {
            None => (),
            Some(limit) => {
                sql.append_syntax(" LIMIT ");
                sql.append_syntax(format!("{}", limit).as_str());
            }
        };
        match self.offset {
            None => (),
            Some(offset) => {
                sql.append_syntax(" OFFSET ");
                sql.append_syntax(format!("{}", offset).as_str());
            }
        };
    }
}

impl TableName {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_identifier(&self.0);
    }
}

impl ColumnName {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_identifier(&self.0);
    }
}

impl ColumnAlias {
    pub fn to_sql(&self, sql: &mut SQL) {
        sql.append_identifier(&self.name);
    }
}

impl OrderBy {
    pub fn to_sql(&self, sql: &mut SQL) {
        if !self.elements.is_empty() {
            sql.append_syntax(" ORDER BY ");
            for (index, order_by_item) in self.elements.iter().enumerate() {
                order_by_item.to_sql(sql);
                if index < (self.elements.len() - 1) {
                    sql.append_syntax(", ")
                }
            }
        }
    }
}

impl OrderByElement {
    pub fn to_sql(&self, sql: &mut SQL) {
        self.target.to_sql(sql);
        self.direction.to_sql(sql)
    }
}

impl OrderByDirection {
    pub fn to_sql(&self, sql: &mut SQL) {
        match self {
            OrderByDirection::Asc => sql.append_syntax(" ASC"),
            OrderByDirection::Desc => sql.append_syntax(" DESC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::helpers;

    fn render(expr: &Expression) -> SQL {
        let mut sql = SQL::new();
        expr.to_sql(&mut sql);
        sql
    }

    /// Every `$N` placeholder in the rendered string indexes into `params`
    /// by position, and the count matches.
    #[test]
    fn placeholder_count_matches_params() {
        let expr = Expression::And {
            left: Box::new(Expression::BinaryOperation {
                left: Box::new(Expression::ColumnReference(ColumnName("name".to_string()))),
                operator: BinaryOperator::Equals,
                right: Box::new(Expression::Value(Value::String("ada".to_string()))),
            }),
            right: Box::new(Expression::BinaryArrayOperation {
                left: Box::new(Expression::ColumnReference(ColumnName("age".to_string()))),
                operator: BinaryArrayOperator::In,
                right: vec![
                    Expression::Value(Value::Float(1.0)),
                    Expression::Value(Value::Float(2.0)),
                ],
            }),
        };
        let sql = render(&expr);
        let placeholders = (1..=9)
            .filter(|n| sql.sql.contains(&format!("${}", n)))
            .count();
        assert_eq!(placeholders, sql.params.len());
        assert_eq!(sql.params.len(), 3);
    }

    #[test]
    fn true_where_clause_is_omitted() {
        let mut sql = SQL::new();
        Where(helpers::true_expr()).to_sql(&mut sql);
        assert_eq!(sql.sql, "");
    }

    #[test]
    fn json_path_renders_arrow_chain() {
        let expr = Expression::JsonPath {
            column: ColumnName("col".to_string()),
            path: vec!["k1".to_string(), "k2".to_string()],
            as_text: true,
        };
        assert_eq!(render(&expr).sql, "\"col\"->'k1'->>'k2'");
    }

    #[test]
    fn delete_statement_renders_where() {
        let delete = Delete {
            table: TableName("Player".to_string()),
            where_: Where(Expression::BinaryOperation {
                left: Box::new(Expression::ColumnReference(ColumnName(
                    "objectId".to_string(),
                ))),
                operator: BinaryOperator::Equals,
                right: Box::new(Expression::Value(Value::String("xyz".to_string()))),
            }),
        };
        let mut sql = SQL::new();
        delete.to_sql(&mut sql);
        assert_eq!(sql.sql, "DELETE FROM \"Player\" WHERE (\"objectId\" = $1)");
    }

    #[test]
    fn update_statement_renders_set_and_where() {
        let update = Update {
            table: TableName("Player".to_string()),
            set: vec![(
                ColumnName("score".to_string()),
                Expression::Value(Value::Float(3.0)),
            )],
            where_: Where(Expression::BinaryOperation {
                left: Box::new(Expression::ColumnReference(ColumnName(
                    "objectId".to_string(),
                ))),
                operator: BinaryOperator::Equals,
                right: Box::new(Expression::Value(Value::String("xyz".to_string()))),
            }),
            returning: Returning::Star,
        };
        let mut sql = SQL::new();
        update.to_sql(&mut sql);
        assert_eq!(
            sql.sql,
            "UPDATE \"Player\" SET \"score\" = $1 WHERE (\"objectId\" = $2) RETURNING *"
        );
    }
}
