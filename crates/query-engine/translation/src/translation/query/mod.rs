//! Translate a declarative query against a class into a SELECT statement.

pub mod fields;
pub mod filtering;
pub mod regex;
pub mod sorting;

use indexmap::IndexMap;
use query_engine_metadata::metadata::ClassSchema;
use query_engine_sql::sql::ast::{Expression, Limit, OrderBy, Select, SelectList, TableName, Where};

use super::error::Error;

/// Options shaping a find beyond the constraint tree.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// `{field: 1 | -1}` sort specification, in significance order.
    pub sort: IndexMap<String, i64>,
    /// Restrict the projection to these fields.
    pub keys: Option<Vec<String>>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// Principals the caller acts as; `None` bypasses row security.
    pub acl: Option<Vec<String>>,
}

/// Compile a find into a complete SELECT.
pub fn translate(
    schema: &ClassSchema,
    where_: &serde_json::Map<String, serde_json::Value>,
    options: &QueryOptions,
) -> Result<Select, Error> {
    let compiled = filtering::translate_where(schema, where_)?;
    let select_list = fields::projection(
        schema,
        options.keys.as_deref(),
        compiled.text_search.as_ref(),
    )?;
    let mut predicate = compiled.expression;
    if let Some(acl) = &options.acl {
        predicate = Expression::And {
            left: Box::new(predicate),
            right: Box::new(filtering::read_access_expression(acl)),
        };
    }
    let mut elements = sorting::translate_sort(&options.sort, compiled.text_search.as_ref())?;
    // implicit sorts (geo proximity) follow any explicit ones
    elements.extend(compiled.sorts);
    Ok(Select {
        select_list: SelectList(select_list),
        from: TableName(schema.class_name.clone()),
        where_: Where(predicate),
        order_by: OrderBy { elements },
        limit: Limit {
            limit: options.limit,
            offset: options.skip,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::FieldType;
    use query_engine_sql::sql::string::SQL;

    fn schema() -> ClassSchema {
        let mut schema = ClassSchema::new("Player");
        schema.fields.insert("name".to_string(), FieldType::String);
        schema.fields.insert("age".to_string(), FieldType::Number);
        schema
    }

    #[test]
    fn full_select_renders_projection_acl_sort_and_paging() {
        let where_ = serde_json::json!({"name": "ada"});
        let options = QueryOptions {
            sort: IndexMap::from([("age".to_string(), -1)]),
            keys: None,
            limit: Some(2),
            skip: Some(1),
            acl: Some(vec!["*".to_string(), "u1".to_string()]),
        };
        let select = translate(&schema(), where_.as_object().unwrap(), &options).unwrap();
        let mut sql = SQL::new();
        select.to_sql(&mut sql);
        similar_asserts::assert_eq!(
            sql.sql,
            "SELECT \"age\" AS \"age\", \"createdAt\" AS \"createdAt\", \
             \"name\" AS \"name\", \"objectId\" AS \"objectId\", \
             \"updatedAt\" AS \"updatedAt\" FROM \"Player\" \
             WHERE ((\"name\" = $1) AND ((\"_rperm\" IS NULL) OR (\"_rperm\" && $2))) \
             ORDER BY \"age\" DESC LIMIT 2 OFFSET 1"
        );
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn empty_query_selects_everything() {
        let where_ = serde_json::Map::new();
        let select = translate(&schema(), &where_, &QueryOptions::default()).unwrap();
        let mut sql = SQL::new();
        select.to_sql(&mut sql);
        assert!(!sql.sql.contains("WHERE"));
        assert!(!sql.sql.contains("ORDER BY"));
        assert!(!sql.sql.contains("LIMIT"));
    }
}
