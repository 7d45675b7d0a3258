//! Aggregation pipelines: a restricted stage set ($match, $group,
//! $project, $sort, $limit, $skip) compiled into one grouped SELECT.

use sqlx::PgPool;

use query_engine_metadata::metadata::ClassSchema;
use query_engine_sql::sql::ast::{
    ColumnAlias, ColumnName, Expression, Limit, OrderBy, OrderByDirection, OrderByElement,
    SelectList, Value, Where,
};
use query_engine_sql::sql::helpers::{self, make_column_alias};
use query_engine_sql::sql::string::SQL;
use query_engine_translation::translation::query::{fields, filtering};

use crate::error::{Error, TranslationError};
use crate::query as exec;
use crate::row;

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// The alias the group key is returned under.
const GROUP_KEY_ALIAS: &str = "objectId";

pub async fn execute(
    pool: &PgPool,
    schema: &ClassSchema,
    pipeline: &[serde_json::Value],
    acl: Option<&[String]>,
) -> Result<Vec<JsonObject>, Error> {
    let plan = translate_pipeline(schema, pipeline, acl)?;
    let rows = match exec::fetch_all(pool, &plan.sql).await {
        Ok(rows) => rows,
        Err(error) if error.is_undefined_table() => return Ok(vec![]),
        Err(error) => return Err(error),
    };
    let mut results = vec![];
    for r in &rows {
        if plan.grouped {
            let mut object = JsonObject::new();
            if !plan.composite.is_empty() {
                // multi-field keys come back as one column per sub-key and
                // are reassembled into an object here
                let mut id = JsonObject::new();
                for name in &plan.composite {
                    let value = row::decode_loose(r, &composite_alias(name));
                    id.insert(name.clone(), value.unwrap_or(serde_json::Value::Null));
                }
                object.insert(
                    GROUP_KEY_ALIAS.to_string(),
                    serde_json::Value::Object(id),
                );
            }
            for alias in &plan.aliases {
                if plan
                    .composite
                    .iter()
                    .any(|name| composite_alias(name) == *alias)
                {
                    continue;
                }
                let value = row::decode_loose(r, alias);
                if alias == GROUP_KEY_ALIAS {
                    // the group key is always present, even when null
                    object.insert(alias.clone(), value.unwrap_or(serde_json::Value::Null));
                } else if let Some(value) = value {
                    object.insert(alias.clone(), value);
                }
            }
            results.push(object);
        } else {
            results.push(row::row_to_object(schema, r)?);
        }
    }
    Ok(results)
}

struct Plan {
    sql: SQL,
    grouped: bool,
    aliases: Vec<String>,
    /// Sub-key names when `_id` was a multi-field object.
    composite: Vec<String>,
}

fn translate_pipeline(
    schema: &ClassSchema,
    pipeline: &[serde_json::Value],
    acl: Option<&[String]>,
) -> Result<Plan, Error> {
    let mut predicates = vec![];
    let mut group: Option<Group> = None;
    let mut keys: Option<Vec<String>> = None;
    let mut order_elements = vec![];
    let mut limit = Limit {
        limit: None,
        offset: None,
    };

    if let Some(acl) = acl {
        predicates.push(filtering::read_access_expression(acl));
    }

    for stage in pipeline {
        let stage = stage.as_object().filter(|s| s.len() == 1).ok_or_else(|| {
            TranslationError::InvalidQuery(
                "each pipeline stage should be an object with one key".to_string(),
            )
        })?;
        let (name, body) = stage.iter().next().expect("one stage key");
        match name.as_str() {
            "$match" => {
                let where_ = body.as_object().ok_or_else(|| {
                    TranslationError::InvalidQuery("$match should be an object".to_string())
                })?;
                predicates.push(filtering::translate_where(schema, where_)?.expression);
            }
            "$group" => {
                group = Some(translate_group(body)?);
            }
            "$project" => {
                let projected = body.as_object().ok_or_else(|| {
                    TranslationError::InvalidQuery("$project should be an object".to_string())
                })?;
                keys = Some(
                    projected
                        .iter()
                        .filter(|(_, include)| {
                            include.as_i64() == Some(1) || include.as_bool() == Some(true)
                        })
                        .map(|(field, _)| field.clone())
                        .collect(),
                );
            }
            "$sort" => {
                let sort = body.as_object().ok_or_else(|| {
                    TranslationError::InvalidQuery("$sort should be an object".to_string())
                })?;
                for (field, direction) in sort {
                    let direction = match direction.as_i64() {
                        Some(1) => OrderByDirection::Asc,
                        Some(-1) => OrderByDirection::Desc,
                        _ => {
                            return Err(TranslationError::InvalidQuery(format!(
                                "Invalid sort direction for {}: expected 1 or -1",
                                field
                            ))
                            .into())
                        }
                    };
                    order_elements.push(OrderByElement {
                        // aliases from earlier stages are legal targets
                        target: Expression::ColumnReference(ColumnName(field.clone())),
                        direction,
                    });
                }
            }
            "$limit" => {
                limit.limit = Some(require_u64(body, "$limit")?);
            }
            "$skip" => {
                limit.offset = Some(require_u64(body, "$skip")?);
            }
            other => {
                return Err(TranslationError::InvalidQuery(format!(
                    "unsupported pipeline stage: {}",
                    other
                ))
                .into())
            }
        }
    }

    let (select_list, group_keys, composite, grouped) = match group {
        Some(group) => (group.columns, group.keys, group.composite, true),
        None => (
            fields::projection(schema, keys.as_deref(), None)?,
            vec![],
            vec![],
            false,
        ),
    };
    let aliases = select_list
        .iter()
        .map(|(alias, _)| alias.name.clone())
        .collect();

    let mut sql = SQL::new();
    sql.append_syntax("SELECT ");
    SelectList(select_list).to_sql(&mut sql);
    sql.append_syntax(" FROM ");
    sql.append_identifier(&schema.class_name);
    Where(helpers::and_all(predicates)).to_sql(&mut sql);
    if !group_keys.is_empty() {
        sql.append_syntax(" GROUP BY ");
        for (index, key) in group_keys.iter().enumerate() {
            if index > 0 {
                sql.append_syntax(", ");
            }
            key.to_sql(&mut sql);
        }
    }
    OrderBy {
        elements: order_elements,
    }
    .to_sql(&mut sql);
    limit.to_sql(&mut sql);

    Ok(Plan {
        sql,
        grouped,
        aliases,
        composite,
    })
}

struct Group {
    columns: Vec<(ColumnAlias, Expression)>,
    /// GROUP BY targets, empty when grouping the whole class.
    keys: Vec<Expression>,
    composite: Vec<String>,
}

/// The select alias backing one sub-key of a multi-field `_id`.
fn composite_alias(name: &str) -> String {
    format!("_id_{}", name)
}

/// `$group`: the `_id` key plus accumulator columns.
fn translate_group(body: &serde_json::Value) -> Result<Group, Error> {
    let body = body.as_object().ok_or_else(|| {
        TranslationError::InvalidQuery("$group should be an object".to_string())
    })?;
    let id = body.get("_id").ok_or_else(|| {
        TranslationError::InvalidQuery("$group requires an _id key".to_string())
    })?;

    let (mut columns, keys, composite) = match id {
        serde_json::Value::Null => (
            vec![(
                make_column_alias(GROUP_KEY_ALIAS.to_string()),
                Expression::Value(Value::Null),
            )],
            vec![],
            vec![],
        ),
        serde_json::Value::String(reference) => {
            let expr = field_reference(reference)?;
            (
                vec![(make_column_alias(GROUP_KEY_ALIAS.to_string()), expr.clone())],
                vec![expr],
                vec![],
            )
        }
        serde_json::Value::Object(parts)
            if parts.len() == 1 && parts.keys().next().is_some_and(|k| k.starts_with('$')) =>
        {
            let (part, reference) = parts.iter().next().expect("one part");
            let reference = reference.as_str().ok_or_else(|| {
                TranslationError::InvalidQuery(format!(
                    "bad $group _id: {} expects a field reference",
                    part
                ))
            })?;
            let expr = date_part_expression(part, reference)?;
            (
                vec![(make_column_alias(GROUP_KEY_ALIAS.to_string()), expr.clone())],
                vec![expr],
                vec![],
            )
        }
        // multi-field key: one grouping expression per sub-key
        serde_json::Value::Object(parts) if !parts.is_empty() => {
            let mut columns = vec![];
            let mut keys = vec![];
            let mut names = vec![];
            for (name, value) in parts {
                let expr = match value {
                    serde_json::Value::String(reference) => field_reference(reference)?,
                    serde_json::Value::Object(part) if part.len() == 1 => {
                        let (part_name, reference) = part.iter().next().expect("one part");
                        let reference = reference.as_str().ok_or_else(|| {
                            TranslationError::InvalidQuery(format!(
                                "bad $group _id: {} expects a field reference",
                                part_name
                            ))
                        })?;
                        date_part_expression(part_name, reference)?
                    }
                    _ => {
                        return Err(TranslationError::InvalidQuery(format!(
                            "bad $group _id key {}: expected a field reference or a date part",
                            name
                        ))
                        .into())
                    }
                };
                columns.push((make_column_alias(composite_alias(name)), expr.clone()));
                keys.push(expr);
                names.push(name.clone());
            }
            (columns, keys, names)
        }
        _ => {
            return Err(TranslationError::InvalidQuery(
                "bad $group _id: expected null, a field reference, or a date part".to_string(),
            )
            .into())
        }
    };

    for (alias, accumulator) in body {
        if alias == "_id" {
            continue;
        }
        columns.push((
            make_column_alias(alias.clone()),
            translate_accumulator(accumulator)?,
        ));
    }
    Ok(Group {
        columns,
        keys,
        composite,
    })
}

fn translate_accumulator(accumulator: &serde_json::Value) -> Result<Expression, Error> {
    let accumulator = accumulator.as_object().filter(|a| a.len() == 1).ok_or_else(|| {
        TranslationError::InvalidQuery(
            "each accumulator should be an object with one operator".to_string(),
        )
    })?;
    let (operator, operand) = accumulator.iter().next().expect("one operator");
    let function = match operator.as_str() {
        "$sum" => "SUM",
        "$avg" => "AVG",
        "$min" => "MIN",
        "$max" => "MAX",
        other => {
            return Err(TranslationError::InvalidQuery(format!(
                "unsupported accumulator: {}",
                other
            ))
            .into())
        }
    };
    match operand {
        // counting rows
        serde_json::Value::Number(_) if function == "SUM" => {
            Ok(Expression::Raw("count(*)".to_string()))
        }
        serde_json::Value::String(reference) => Ok(Expression::FunctionCall {
            function: query_engine_sql::sql::ast::Function::Unknown(function.to_string()),
            args: vec![field_reference(reference)?],
        }),
        _ => Err(TranslationError::InvalidQuery(format!(
            "bad {} operand: expected a field reference",
            operator
        ))
        .into()),
    }
}

fn require_u64(value: &serde_json::Value, stage: &str) -> Result<u64, Error> {
    value.as_u64().ok_or_else(|| {
        TranslationError::InvalidQuery(format!("{} should be a non-negative integer", stage))
            .into()
    })
}

/// A `$field` reference.
fn field_reference(reference: &str) -> Result<Expression, Error> {
    let field = reference.strip_prefix('$').ok_or_else(|| {
        TranslationError::InvalidQuery(format!(
            "bad field reference, expected a $-prefixed name: {}",
            reference
        ))
    })?;
    Ok(Expression::ColumnReference(ColumnName(field.to_string())))
}

/// Date-part bucketing, `{"$dayOfMonth": "$createdAt"}`.
fn date_part_expression(part: &str, reference: &str) -> Result<Expression, Error> {
    let unit = match part {
        "$dayOfMonth" => "DAY",
        "$dayOfWeek" => "DOW",
        "$month" => "MONTH",
        "$week" => "WEEK",
        "$year" => "YEAR",
        "$hour" => "HOUR",
        "$minute" => "MINUTE",
        "$second" => "SECOND",
        other => {
            return Err(TranslationError::InvalidQuery(format!(
                "unsupported $group date operator: {}",
                other
            ))
            .into())
        }
    };
    let field = reference.strip_prefix('$').ok_or_else(|| {
        TranslationError::InvalidQuery(format!(
            "bad field reference, expected a $-prefixed name: {}",
            reference
        ))
    })?;
    // EXTRACT has keyword syntax; the identifier is quote-escaped by hand
    Ok(Expression::Raw(format!(
        "EXTRACT({} FROM \"{}\")",
        unit,
        field.replace('"', "\"\"")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::FieldType;

    fn schema() -> ClassSchema {
        let mut schema = ClassSchema::new("Order");
        schema
            .fields
            .insert("total".to_string(), FieldType::Number);
        schema
            .fields
            .insert("status".to_string(), FieldType::String);
        schema
    }

    fn plan(pipeline: serde_json::Value) -> Result<Plan, Error> {
        translate_pipeline(&schema(), pipeline.as_array().unwrap(), None)
    }

    #[test]
    fn group_by_field_renders_group_by_and_aggregates() {
        let plan = plan(serde_json::json!([
            {"$group": {"_id": "$status", "revenue": {"$sum": "$total"}}}
        ]))
        .unwrap();
        assert!(plan.grouped);
        assert_eq!(
            plan.sql.sql,
            "SELECT \"status\" AS \"objectId\", SUM(\"total\") AS \"revenue\" \
             FROM \"Order\" GROUP BY \"status\""
        );
    }

    #[test]
    fn sum_of_one_counts_rows() {
        let plan = plan(serde_json::json!([
            {"$group": {"_id": null, "n": {"$sum": 1}}}
        ]))
        .unwrap();
        assert_eq!(
            plan.sql.sql,
            "SELECT NULL AS \"objectId\", count(*) AS \"n\" FROM \"Order\""
        );
    }

    #[test]
    fn date_parts_bucket_with_extract() {
        let plan = plan(serde_json::json!([
            {"$group": {"_id": {"$month": "$createdAt"}}}
        ]))
        .unwrap();
        assert!(plan
            .sql
            .sql
            .contains("EXTRACT(MONTH FROM \"createdAt\") AS \"objectId\""));
        assert!(plan.sql.sql.contains("GROUP BY EXTRACT(MONTH FROM \"createdAt\")"));
    }

    #[test]
    fn composite_group_key_renders_one_expression_per_sub_key() {
        let plan = plan(serde_json::json!([
            {"$group": {
                "_id": {"month": {"$month": "$createdAt"}, "status": "$status"},
                "revenue": {"$sum": "$total"}
            }}
        ]))
        .unwrap();
        assert!(plan.grouped);
        assert_eq!(plan.composite, vec!["month".to_string(), "status".to_string()]);
        assert_eq!(
            plan.sql.sql,
            "SELECT EXTRACT(MONTH FROM \"createdAt\") AS \"_id_month\", \
             \"status\" AS \"_id_status\", SUM(\"total\") AS \"revenue\" \
             FROM \"Order\" \
             GROUP BY EXTRACT(MONTH FROM \"createdAt\"), \"status\""
        );
    }

    #[test]
    fn match_sort_and_paging_stages_compose() {
        let plan = plan(serde_json::json!([
            {"$match": {"status": "paid"}},
            {"$sort": {"total": -1}},
            {"$skip": 5},
            {"$limit": 10}
        ]))
        .unwrap();
        assert!(!plan.grouped);
        assert!(plan.sql.sql.contains("WHERE (\"status\" = $1)"));
        assert!(plan.sql.sql.ends_with("ORDER BY \"total\" DESC LIMIT 10 OFFSET 5"));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let result = plan(serde_json::json!([{"$lookup": {}}]));
        assert!(result.is_err());
    }
}
