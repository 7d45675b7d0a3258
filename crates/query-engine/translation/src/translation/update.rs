//! Translate an update document into SET assignments.
//!
//! Field values are either plain values, `__op` operator objects
//! (Increment, Add, AddUnique, Remove, Delete), or dotted paths that
//! rewrite a key inside a json column in place.

use query_engine_metadata::metadata::{ClassSchema, FieldType};
use query_engine_sql::sql::ast::{
    BinaryOperator, CastType, ColumnName, Expression, Function, Value,
};

use super::error::Error;
use super::values;
use super::wire::{self, WireValue};

/// The prefix REST clients use for per-provider auth entries.
const AUTH_DATA_PREFIX: &str = "_auth_data_";

/// A parsed field operation.
#[derive(Debug, Clone, PartialEq)]
enum FieldOp {
    Set(serde_json::Value),
    Increment(f64),
    Add(Vec<serde_json::Value>),
    AddUnique(Vec<serde_json::Value>),
    Remove(Vec<serde_json::Value>),
    Delete,
}

/// Translate an update document into `(column, expression)` assignments
/// for an UPDATE statement. Relation operations (`AddRelation`,
/// `RemoveRelation`) must be split off by the caller before this point.
pub fn translate_update(
    schema: &ClassSchema,
    update: &serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<(ColumnName, Expression)>, Error> {
    // (root column, dotted tail, op); preserves input order per root
    let mut plain: Vec<(String, FieldOp)> = vec![];
    let mut dotted: Vec<(String, Vec<String>, FieldOp)> = vec![];
    let mut auth_providers: Vec<(String, serde_json::Value)> = vec![];

    for (field, value) in update {
        if field == "objectId" {
            return Err(Error::InvalidQuery(
                "objectId cannot be modified".to_string(),
            ));
        }
        if let Some(provider) = field.strip_prefix(AUTH_DATA_PREFIX) {
            // an explicit Delete op unlinks the provider
            let data = if value.get("__op").and_then(|op| op.as_str()) == Some("Delete") {
                serde_json::Value::Null
            } else {
                value.clone()
            };
            auth_providers.push((provider.to_string(), data));
            continue;
        }
        if field == "authData" {
            let providers = value.as_object().ok_or_else(|| {
                Error::InvalidJson("authData should be an object".to_string())
            })?;
            for (provider, data) in providers {
                auth_providers.push((provider.clone(), data.clone()));
            }
            continue;
        }
        let op = parse_op(value)?;
        match field.split_once('.') {
            None => plain.push((field.clone(), op)),
            Some((root, tail)) => dotted.push((
                root.to_string(),
                tail.split('.').map(str::to_string).collect(),
                op,
            )),
        }
    }

    let mut assignments: Vec<(ColumnName, Expression)> = vec![];

    for (field, op) in &plain {
        let field_type = schema
            .field(field)
            .ok_or_else(|| Error::InvalidQuery(format!("Column not found: {}", field)))?;
        assignments.push((
            ColumnName(field.clone()),
            plain_assignment(field, field_type, op)?,
        ));
    }

    // dotted paths rewrite their root column; multiple paths under the
    // same root chain onto one expression
    for (root, path, op) in &dotted {
        let field_type = schema
            .field(root)
            .ok_or_else(|| Error::InvalidQuery(format!("Column not found: {}", root)))?;
        if !matches!(field_type, FieldType::Object | FieldType::Array { .. }) {
            return Err(Error::InvalidQuery(format!(
                "cannot set a nested key on a non-object column: {}",
                root
            )));
        }
        let current = match assignments.iter().position(|(name, _)| name.0 == *root) {
            Some(index) => assignments.remove(index).1,
            None => Expression::ColumnReference(ColumnName(root.clone())),
        };
        let rewritten = nested_assignment(current, path, op)?;
        assignments.push((ColumnName(root.clone()), rewritten));
    }

    if !auth_providers.is_empty() {
        assignments.push((
            ColumnName("authData".to_string()),
            auth_data_expression(&auth_providers),
        ));
    }

    Ok(assignments)
}

/// Merge per-provider auth entries into the `authData` column: non-null
/// entries overwrite their key, null entries remove it.
pub fn auth_data_expression(providers: &[(String, serde_json::Value)]) -> Expression {
    let mut expr = coalesce_jsonb(
        Expression::ColumnReference(ColumnName("authData".to_string())),
        serde_json::json!({}),
    );
    for (provider, data) in providers {
        expr = if data.is_null() {
            json_remove_key(expr, provider)
        } else {
            json_set_key(
                expr,
                provider,
                Expression::Cast {
                    expression: Box::new(Expression::Value(Value::Json(data.clone()))),
                    r#type: CastType::Jsonb,
                },
            )
        };
    }
    expr
}

fn parse_op(value: &serde_json::Value) -> Result<FieldOp, Error> {
    let Some(op) = value.get("__op").and_then(|op| op.as_str()) else {
        validate_nested_keys(value)?;
        return Ok(FieldOp::Set(value.clone()));
    };
    match op {
        "Increment" => {
            let amount = value
                .get("amount")
                .and_then(|a| a.as_f64())
                .ok_or_else(|| {
                    Error::InvalidJson("Increment amount should be a number".to_string())
                })?;
            Ok(FieldOp::Increment(amount))
        }
        "Add" | "AddUnique" | "Remove" => {
            let objects = value
                .get("objects")
                .and_then(|o| o.as_array())
                .ok_or_else(|| {
                    Error::InvalidJson(format!("{} objects should be an array", op))
                })?
                .clone();
            Ok(match op {
                "Add" => FieldOp::Add(objects),
                "AddUnique" => FieldOp::AddUnique(objects),
                _ => FieldOp::Remove(objects),
            })
        }
        "Delete" => Ok(FieldOp::Delete),
        "AddRelation" | "RemoveRelation" => Err(Error::InvalidQuery(format!(
            "relation operation {} cannot target a column",
            op
        ))),
        other => Err(Error::OperationForbidden(format!(
            "unsupported update operation: {}",
            other
        ))),
    }
}

/// Keys inside plain nested objects may not contain `$` or `.`.
fn validate_nested_keys(value: &serde_json::Value) -> Result<(), Error> {
    match value {
        serde_json::Value::Object(object) => {
            if wire::detect(value).is_some() {
                return Ok(());
            }
            for (key, nested) in object {
                if key.contains('$') || key.contains('.') {
                    return Err(Error::InvalidNestedKey(format!(
                        "Nested keys should not contain the '$' or '.' characters: {}",
                        key
                    )));
                }
                validate_nested_keys(nested)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            items.iter().try_for_each(validate_nested_keys)
        }
        _ => Ok(()),
    }
}

fn plain_assignment(
    field: &str,
    field_type: &FieldType,
    op: &FieldOp,
) -> Result<Expression, Error> {
    let column = || Expression::ColumnReference(ColumnName(field.to_string()));
    match op {
        FieldOp::Set(value) => match field_type {
            FieldType::GeoPoint => match wire::detect(value) {
                Some(WireValue::GeoPoint {
                    latitude,
                    longitude,
                }) => {
                    wire::validate_coordinates(latitude, longitude)?;
                    Ok(values::geo_point_expression(longitude, latitude))
                }
                _ => Err(Error::InvalidJson(format!(
                    "expected a GeoPoint for {}: {}",
                    field, value
                ))),
            },
            _ => values::encode_column_value(field_type, value),
        },
        FieldOp::Increment(amount) => Ok(Expression::BinaryOperation {
            left: Box::new(Expression::FunctionCall {
                function: Function::Coalesce,
                args: vec![column(), Expression::Value(Value::Float(0.0))],
            }),
            operator: BinaryOperator::Plus,
            right: Box::new(Expression::Value(Value::Float(*amount))),
        }),
        FieldOp::Add(objects) => Ok(array_function("array_add", column(), objects)),
        FieldOp::AddUnique(objects) => {
            Ok(array_function("array_add_unique", column(), objects))
        }
        FieldOp::Remove(objects) => Ok(array_function("array_remove", column(), objects)),
        FieldOp::Delete => Ok(Expression::Value(Value::Null)),
    }
}

fn nested_assignment(
    current: Expression,
    path: &[String],
    op: &FieldOp,
) -> Result<Expression, Error> {
    match op {
        FieldOp::Set(value) => {
            let encoded = Expression::FunctionCall {
                function: Function::ToJsonb,
                args: vec![match value {
                    serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                        Expression::Cast {
                            expression: Box::new(Expression::Value(Value::Json(value.clone()))),
                            r#type: CastType::Jsonb,
                        }
                    }
                    serde_json::Value::String(s) => Expression::Value(Value::String(s.clone())),
                    serde_json::Value::Number(n) => {
                        Expression::Value(Value::Float(n.as_f64().unwrap_or(0.0)))
                    }
                    serde_json::Value::Bool(b) => Expression::Value(Value::Bool(*b)),
                    serde_json::Value::Null => Expression::Value(Value::Null),
                }],
            };
            Ok(set_path(current, path, encoded))
        }
        FieldOp::Increment(amount) => {
            // read the current numeric value out of the original column
            // expression, defaulting to zero
            let read = Expression::FunctionCall {
                function: Function::Coalesce,
                args: vec![
                    Expression::Cast {
                        expression: Box::new(get_path(current.clone(), path, true)),
                        r#type: CastType::DoublePrecision,
                    },
                    Expression::Value(Value::Float(0.0)),
                ],
            };
            let bumped = Expression::FunctionCall {
                function: Function::ToJsonb,
                args: vec![Expression::BinaryOperation {
                    left: Box::new(read),
                    operator: BinaryOperator::Plus,
                    right: Box::new(Expression::Value(Value::Float(*amount))),
                }],
            };
            Ok(set_path(current, path, bumped))
        }
        FieldOp::Add(objects) => Ok(nested_array_function("array_add", current, path, objects)),
        FieldOp::AddUnique(objects) => Ok(nested_array_function(
            "array_add_unique",
            current,
            path,
            objects,
        )),
        FieldOp::Remove(objects) => {
            Ok(nested_array_function("array_remove", current, path, objects))
        }
        FieldOp::Delete => Ok(delete_path(current, path)),
    }
}

fn array_function(name: &str, column: Expression, objects: &[serde_json::Value]) -> Expression {
    Expression::FunctionCall {
        function: Function::Unknown(name.to_string()),
        args: vec![
            coalesce_jsonb(column, serde_json::json!([])),
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(serde_json::Value::Array(
                    objects.to_vec(),
                )))),
                r#type: CastType::Jsonb,
            },
        ],
    }
}

fn nested_array_function(
    name: &str,
    current: Expression,
    path: &[String],
    objects: &[serde_json::Value],
) -> Expression {
    let rewritten = array_function(name, get_path(current.clone(), path, false), objects);
    set_path(current, path, rewritten)
}

/// `json_object_set_key(...)` rewriting `path` inside `current` to
/// `value`, creating intermediate objects as needed.
fn set_path(current: Expression, path: &[String], value: Expression) -> Expression {
    let base = coalesce_jsonb(current.clone(), serde_json::json!({}));
    match path {
        [] => value,
        [key] => json_set_key(base, key, value),
        [key, rest @ ..] => {
            let inner = set_path(
                Expression::BinaryOperation {
                    left: Box::new(current),
                    operator: BinaryOperator::JsonGet,
                    right: Box::new(Expression::Value(Value::String(key.clone()))),
                },
                rest,
                value,
            );
            json_set_key(base, key, inner)
        }
    }
}

/// Remove the key at `path` inside `current`.
fn delete_path(current: Expression, path: &[String]) -> Expression {
    match path {
        [] | [_] => json_remove_key(
            coalesce_jsonb(current, serde_json::json!({})),
            path.first().map(String::as_str).unwrap_or_default(),
        ),
        [..] => {
            let (last, parent) = path.split_last().unwrap();
            let parent_read = get_path(current.clone(), parent, false);
            let removed = json_remove_key(
                coalesce_jsonb(parent_read, serde_json::json!({})),
                last,
            );
            set_path(current, parent, removed)
        }
    }
}

fn get_path(current: Expression, path: &[String], as_text: bool) -> Expression {
    let mut expr = current;
    for (index, key) in path.iter().enumerate() {
        let last = index == path.len() - 1;
        expr = Expression::BinaryOperation {
            left: Box::new(expr),
            operator: if last && as_text {
                BinaryOperator::JsonGetText
            } else {
                BinaryOperator::JsonGet
            },
            right: Box::new(Expression::Value(Value::String(key.clone()))),
        };
    }
    expr
}

fn json_set_key(object: Expression, key: &str, value: Expression) -> Expression {
    Expression::FunctionCall {
        function: Function::Unknown("json_object_set_key".to_string()),
        args: vec![object, Expression::Value(Value::String(key.to_string())), value],
    }
}

fn json_remove_key(object: Expression, key: &str) -> Expression {
    Expression::BinaryOperation {
        left: Box::new(object),
        operator: BinaryOperator::Minus,
        right: Box::new(Expression::Value(Value::String(key.to_string()))),
    }
}

fn coalesce_jsonb(expr: Expression, default: serde_json::Value) -> Expression {
    Expression::FunctionCall {
        function: Function::Coalesce,
        args: vec![
            expr,
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(default))),
                r#type: CastType::Jsonb,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_sql::sql::string::SQL;

    fn schema() -> ClassSchema {
        let mut schema = ClassSchema::new("Player");
        schema.fields.insert("score".to_string(), FieldType::Number);
        schema
            .fields
            .insert("tags".to_string(), FieldType::array());
        schema
            .fields
            .insert("stats".to_string(), FieldType::Object);
        schema.fields.insert("name".to_string(), FieldType::String);
        schema
    }

    fn translate(update: serde_json::Value) -> Result<Vec<(ColumnName, Expression)>, Error> {
        translate_update(&schema(), update.as_object().unwrap())
    }

    fn render_one(update: serde_json::Value) -> (String, SQL) {
        let assignments = translate(update).unwrap();
        assert_eq!(assignments.len(), 1);
        let (column, expression) = &assignments[0];
        let mut sql = SQL::new();
        expression.to_sql(&mut sql);
        (column.0.clone(), sql)
    }

    #[test]
    fn increment_defaults_missing_values_to_zero() {
        let (column, sql) =
            render_one(serde_json::json!({"score": {"__op": "Increment", "amount": 3}}));
        assert_eq!(column, "score");
        assert_eq!(sql.sql, "(COALESCE(\"score\", $1) + $2)");
    }

    #[test]
    fn add_unique_uses_the_array_helper() {
        let (_, sql) = render_one(serde_json::json!({
            "tags": {"__op": "AddUnique", "objects": ["a"]}
        }));
        assert!(sql.sql.starts_with("array_add_unique(COALESCE(\"tags\""));
    }

    #[test]
    fn delete_assigns_null() {
        let (_, sql) = render_one(serde_json::json!({"name": {"__op": "Delete"}}));
        assert_eq!(sql.sql, "NULL");
    }

    #[test]
    fn dotted_set_rewrites_the_json_key() {
        let (column, sql) = render_one(serde_json::json!({"stats.rank": 5}));
        assert_eq!(column, "stats");
        assert!(sql.sql.starts_with("json_object_set_key(COALESCE(\"stats\""));
        assert!(sql.sql.contains("to_jsonb"));
    }

    #[test]
    fn dotted_delete_removes_the_json_key() {
        let (_, sql) = render_one(serde_json::json!({"stats.rank": {"__op": "Delete"}}));
        assert!(sql.sql.contains(" - "));
    }

    #[test]
    fn two_dotted_updates_chain_on_one_column() {
        let assignments = translate(serde_json::json!({
            "stats.a": 1, "stats.b": 2
        }))
        .unwrap();
        assert_eq!(assignments.len(), 1);
        let mut sql = SQL::new();
        assignments[0].1.to_sql(&mut sql);
        assert_eq!(sql.sql.matches("json_object_set_key").count(), 2);
    }

    #[test]
    fn nested_keys_with_dollar_are_rejected() {
        let result = translate(serde_json::json!({"stats": {"$bad": 1}}));
        assert!(matches!(result, Err(Error::InvalidNestedKey(_))));
    }

    #[test]
    fn relation_ops_cannot_target_a_column() {
        let result = translate(serde_json::json!({
            "tags": {"__op": "AddRelation", "objects": []}
        }));
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn object_id_is_immutable() {
        let result = translate(serde_json::json!({"objectId": "nope"}));
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn auth_data_merges_and_removes_providers() {
        let expr = auth_data_expression(&[
            ("github".to_string(), serde_json::json!({"id": "g1"})),
            ("twitter".to_string(), serde_json::Value::Null),
        ]);
        let mut sql = SQL::new();
        expr.to_sql(&mut sql);
        assert!(sql.sql.contains("json_object_set_key"));
        assert!(sql.sql.contains(" - "));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let result = translate(serde_json::json!({"ghost": 1}));
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }
}
