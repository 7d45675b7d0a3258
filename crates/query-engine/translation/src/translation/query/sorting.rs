//! Translate a sort specification into ORDER BY elements.

use indexmap::IndexMap;
use query_engine_sql::sql::ast::{
    CastType, ColumnName, Expression, Function, OrderByDirection, OrderByElement, Value,
};

use super::super::error::Error;
use super::filtering::TextSearch;

/// The reserved sort key selecting text-search relevance.
pub const SCORE_KEY: &str = "$score";

/// Translate a `{field: 1 | -1}` sort map, preserving key order.
/// `$score` requires an active text-search constraint and sorts by
/// relevance.
pub fn translate_sort(
    sort: &IndexMap<String, i64>,
    text_search: Option<&TextSearch>,
) -> Result<Vec<OrderByElement>, Error> {
    let mut elements = vec![];
    for (field, direction) in sort {
        let direction = match direction {
            1 => OrderByDirection::Asc,
            -1 => OrderByDirection::Desc,
            _ => {
                return Err(Error::InvalidQuery(format!(
                    "Invalid sort direction for {}: expected 1 or -1",
                    field
                )))
            }
        };
        let target = if field == SCORE_KEY {
            let text_search = text_search.ok_or_else(|| {
                Error::InvalidQuery(
                    "You cannot sort by $score without a $text constraint".to_string(),
                )
            })?;
            score_expression(text_search)
        } else {
            sort_target(field)
        };
        elements.push(OrderByElement { target, direction });
    }
    Ok(elements)
}

/// Relevance of the matched column against the search term.
pub fn score_expression(text_search: &TextSearch) -> Expression {
    Expression::FunctionCall {
        function: Function::TsRank,
        args: vec![
            Expression::FunctionCall {
                function: Function::ToTsvector,
                args: vec![
                    Expression::Value(Value::String(text_search.language.clone())),
                    sort_target(&text_search.column),
                ],
            },
            Expression::FunctionCall {
                function: Function::ToTsquery,
                args: vec![
                    Expression::Value(Value::String(text_search.language.clone())),
                    Expression::Value(Value::String(text_search.term.clone())),
                ],
            },
        ],
    }
}

/// Dotted sort keys descend into json and compare textually.
fn sort_target(field: &str) -> Expression {
    match field.split_once('.') {
        None => Expression::ColumnReference(ColumnName(field.to_string())),
        Some((column, rest)) => Expression::Cast {
            expression: Box::new(Expression::JsonPath {
                column: ColumnName(column.to_string()),
                path: rest.split('.').map(str::to_string).collect(),
                as_text: true,
            }),
            r#type: CastType::Text,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_sql::sql::string::SQL;

    fn render(elements: &[OrderByElement]) -> String {
        let mut sql = SQL::new();
        query_engine_sql::sql::ast::OrderBy {
            elements: elements.to_vec(),
        }
        .to_sql(&mut sql);
        sql.sql
    }

    fn sort_of(pairs: &[(&str, i64)]) -> IndexMap<String, i64> {
        pairs
            .iter()
            .map(|(field, direction)| (field.to_string(), *direction))
            .collect()
    }

    #[test]
    fn directions_map_to_asc_and_desc_preserving_order() {
        let sort = sort_of(&[("name", 1), ("age", -1)]);
        let elements = translate_sort(&sort, None).unwrap();
        assert_eq!(render(&elements), " ORDER BY \"name\" ASC, \"age\" DESC");
    }

    #[test]
    fn invalid_direction_is_rejected() {
        let result = translate_sort(&sort_of(&[("age", 2)]), None);
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn dotted_keys_sort_by_json_text() {
        let elements = translate_sort(&sort_of(&[("stats.rank", 1)]), None).unwrap();
        assert_eq!(
            render(&elements),
            " ORDER BY (\"stats\"->>'rank')::text ASC"
        );
    }

    #[test]
    fn score_requires_text_search() {
        let sort = sort_of(&[("$score", -1)]);
        assert!(translate_sort(&sort, None).is_err());
        let text_search = TextSearch {
            column: "body".to_string(),
            language: "english".to_string(),
            term: "hello".to_string(),
        };
        let elements = translate_sort(&sort, Some(&text_search)).unwrap();
        assert!(render(&elements).contains("ts_rank"));
    }
}
