//! Handle filtering/where clause translation: compile a constraint tree
//! into a SQL predicate expression plus any implicit sort elements.

use query_engine_metadata::metadata::{ClassSchema, FieldType, READ_PERM_COLUMN, WRITE_PERM_COLUMN};
use query_engine_sql::sql::ast::{
    BinaryArrayOperator, BinaryOperator, CastType, ColumnName, Expression, Function,
    OrderByDirection, OrderByElement, UnaryOperator, Value,
};
use query_engine_sql::sql::helpers;

use super::super::error::Error;
use super::super::values;
use super::super::wire::{self, WireValue};
use super::regex;

/// Earth radius in meters; `$maxDistance` style factors are expressed
/// in radians and scale by this.
const EARTH_RADIUS_METERS: f64 = 6371.0 * 1000.0;

/// A boolean can never be cast to double precision; comparing one
/// against a Number column compares against a value outside the i64
/// range instead, which never matches a realistic row.
const UNSATISFIABLE_NUMBER: f64 = 9_223_372_036_854_775_808.0;

/// The output of compiling a constraint tree.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWhere {
    pub expression: Expression,
    /// Implicit sorts, e.g. ascending distance for `$nearSphere`.
    pub sorts: Vec<OrderByElement>,
    /// Present when the tree carried a `$text` constraint; needed by
    /// `$score` projections.
    pub text_search: Option<TextSearch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub column: String,
    pub language: String,
    pub term: String,
}

#[derive(Debug, Default)]
struct Context {
    sorts: Vec<OrderByElement>,
    text_search: Option<TextSearch>,
}

/// Compile a constraint tree against a class schema.
pub fn translate_where(
    schema: &ClassSchema,
    where_: &serde_json::Map<String, serde_json::Value>,
) -> Result<CompiledWhere, Error> {
    let mut ctx = Context::default();
    let expression = translate_map(schema, where_, &mut ctx)?;
    Ok(CompiledWhere {
        expression,
        sorts: ctx.sorts,
        text_search: ctx.text_search,
    })
}

/// Row-level read access: the request's ACL must overlap `_rperm`, or
/// the row must carry no read restriction at all.
pub fn read_access_expression(acl: &[String]) -> Expression {
    access_expression(READ_PERM_COLUMN, acl)
}

/// Row-level write access over `_wperm`.
pub fn write_access_expression(acl: &[String]) -> Expression {
    access_expression(WRITE_PERM_COLUMN, acl)
}

fn access_expression(column: &str, acl: &[String]) -> Expression {
    Expression::Or {
        left: Box::new(helpers::column_is_null(column)),
        right: Box::new(Expression::BinaryOperation {
            left: Box::new(Expression::ColumnReference(ColumnName(column.to_string()))),
            operator: BinaryOperator::ArrayOverlaps,
            right: Box::new(Expression::Value(Value::StringArray(acl.to_vec()))),
        }),
    }
}

fn translate_map(
    schema: &ClassSchema,
    map: &serde_json::Map<String, serde_json::Value>,
    ctx: &mut Context,
) -> Result<Expression, Error> {
    let mut predicates = vec![];
    for (field, value) in map {
        match field.as_str() {
            "$or" | "$and" | "$nor" => {
                let clauses = value.as_array().ok_or_else(|| {
                    Error::InvalidQuery(format!("bad {}: expected an array of clauses", field))
                })?;
                let mut compiled = vec![];
                for clause in clauses {
                    let object = clause.as_object().ok_or_else(|| {
                        Error::InvalidQuery(format!("bad {}: clauses must be objects", field))
                    })?;
                    compiled.push(translate_map(schema, object, ctx)?);
                }
                predicates.push(match field.as_str() {
                    "$or" => helpers::or_all(compiled),
                    "$and" => helpers::and_all(compiled),
                    _ => Expression::Not(Box::new(helpers::or_all(compiled))),
                });
            }
            _ => predicates.extend(translate_field(schema, field, value, ctx)?),
        }
    }
    Ok(helpers::and_all(predicates))
}

/// Whether a field name traverses into a json column.
fn is_dotted(field: &str) -> bool {
    field.contains('.')
}

/// A reference to the field's column, descending into json for dotted
/// paths. `as_text` selects `->>` for the final path step.
fn column_expression(field: &str, as_text: bool) -> Expression {
    match field.split_once('.') {
        None => Expression::ColumnReference(ColumnName(field.to_string())),
        Some((column, rest)) => Expression::JsonPath {
            column: ColumnName(column.to_string()),
            path: rest.split('.').map(str::to_string).collect(),
            as_text,
        },
    }
}

fn is_null(expr: Expression) -> Expression {
    Expression::UnaryOperation {
        expression: Box::new(expr),
        operator: UnaryOperator::IsNull,
    }
}

fn is_not_null(expr: Expression) -> Expression {
    Expression::UnaryOperation {
        expression: Box::new(expr),
        operator: UnaryOperator::IsNotNull,
    }
}

fn compare(left: Expression, operator: BinaryOperator, right: Expression) -> Expression {
    Expression::BinaryOperation {
        left: Box::new(left),
        operator,
        right: Box::new(right),
    }
}

fn array_contains(column: Expression, payload: serde_json::Value) -> Expression {
    Expression::FunctionCall {
        function: Function::Unknown("array_contains".to_string()),
        args: vec![
            column,
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(payload))),
                r#type: CastType::Jsonb,
            },
        ],
    }
}

/// Compile the constraints listed for one field. All returned
/// predicates are ANDed by the caller.
fn translate_field(
    schema: &ClassSchema,
    field: &str,
    value: &serde_json::Value,
    ctx: &mut Context,
) -> Result<Vec<Expression>, Error> {
    let field_type = schema.field(field);
    let dotted = is_dotted(field);

    // a field absent from the schema whose only constraint is
    // `$exists: false` is trivially satisfiable
    if field_type.is_none() && !dotted {
        if let Some(object) = value.as_object() {
            if object.len() == 1 && object.get("$exists") == Some(&serde_json::Value::Bool(false))
            {
                return Ok(vec![]);
            }
        }
    }

    let column = || column_expression(field, true);

    // a literal null short-circuits before any operator processing
    if value.is_null() {
        return Ok(vec![is_null(column())]);
    }

    // scalar literals imply equality
    match value {
        serde_json::Value::String(s) => {
            return Ok(vec![compare(
                column(),
                BinaryOperator::Equals,
                Expression::Value(Value::String(s.clone())),
            )]);
        }
        serde_json::Value::Number(n) => {
            let rhs = Expression::Value(Value::Float(n.as_f64().unwrap_or(f64::NAN)));
            let lhs = if dotted {
                Expression::Cast {
                    expression: Box::new(column()),
                    r#type: CastType::DoublePrecision,
                }
            } else {
                column()
            };
            return Ok(vec![compare(lhs, BinaryOperator::Equals, rhs)]);
        }
        serde_json::Value::Bool(b) => {
            let rhs = if matches!(field_type, Some(FieldType::Number)) {
                Expression::Value(Value::Float(UNSATISFIABLE_NUMBER))
            } else {
                Expression::Value(Value::Bool(*b))
            };
            return Ok(vec![compare(column(), BinaryOperator::Equals, rhs)]);
        }
        _ => {}
    }

    // typed wrapper shortcut: equality against a wire value
    if let Some(wire_value) = wire::detect(value) {
        return Ok(vec![wrapper_equality(field_type, field, &wire_value)?]);
    }

    // a bare array implies containment for array fields
    if let Some(items) = value.as_array() {
        return Ok(vec![array_contains(
            column_expression(field, false),
            serde_json::Value::Array(items.clone()),
        )]);
    }

    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidQuery(format!("bad constraint for field {}", field)))?;

    let mut predicates = vec![];
    // set when an operator is understood but deliberately appends no
    // predicate (dot-path $regex, bare $nearSphere sort)
    let mut handled_without_predicate = false;

    if let Some(ne) = object.get("$ne") {
        predicates.push(translate_ne(schema, field_type, field, ne)?);
    }
    if let Some(eq) = object.get("$eq") {
        predicates.push(translate_eq(schema, field_type, field, eq)?);
    }
    if let Some(in_values) = object.get("$in") {
        predicates.push(translate_in(field_type, field, in_values, false)?);
    }
    if let Some(nin_values) = object.get("$nin") {
        predicates.push(translate_in(field_type, field, nin_values, true)?);
    }
    if let Some(all) = object.get("$all") {
        predicates.push(translate_all(field, all)?);
    }
    if let Some(exists) = object.get("$exists") {
        let exists = exists
            .as_bool()
            .ok_or_else(|| Error::InvalidJson("bad $exists: should be a boolean".to_string()))?;
        predicates.push(if exists {
            is_not_null(column())
        } else {
            is_null(column())
        });
    }
    if let Some(contained_by) = object.get("$containedBy") {
        let items = contained_by.as_array().ok_or_else(|| {
            Error::InvalidJson("bad $containedBy: should be an array".to_string())
        })?;
        predicates.push(compare(
            column_expression(field, false),
            BinaryOperator::ContainedBy,
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(serde_json::Value::Array(
                    items.clone(),
                )))),
                r#type: CastType::Jsonb,
            },
        ));
    }
    if let Some(text) = object.get("$text") {
        predicates.push(translate_text(field, text, ctx)?);
    }
    if let Some(near) = object.get("$nearSphere") {
        translate_near_sphere(
            field,
            near,
            object.get("$maxDistance"),
            ctx,
            &mut predicates,
        )?;
        handled_without_predicate = true;
    }
    if let Some(within) = object.get("$within") {
        predicates.push(translate_within_box(field, within)?);
    }
    if let Some(geo_within) = object.get("$geoWithin") {
        predicates.push(translate_geo_within(field, geo_within)?);
    }
    if let Some(geo_intersects) = object.get("$geoIntersects") {
        predicates.push(translate_geo_intersects(field, geo_intersects)?);
    }
    if let Some(pattern) = object.get("$regex") {
        if dotted {
            // documented limitation: $regex does not descend into json
            // columns; the constraint is dropped
            tracing::warn!(field, "$regex on a nested path is not supported; ignoring");
            handled_without_predicate = true;
        } else {
            predicates.push(translate_regex(field, pattern, object.get("$options"))?);
        }
    }
    for (op, operator) in [
        ("$gt", BinaryOperator::GreaterThan),
        ("$gte", BinaryOperator::GreaterThanOrEqualTo),
        ("$lt", BinaryOperator::LessThan),
        ("$lte", BinaryOperator::LessThanOrEqualTo),
    ] {
        if let Some(bound) = object.get(op) {
            predicates.push(translate_comparator(field_type, field, operator, bound)?);
        }
    }

    // fail fast instead of silently ignoring a constraint shape we do
    // not understand
    if predicates.is_empty() && !handled_without_predicate {
        return Err(Error::OperationForbidden(format!(
            "unsupported query shape for field {}: {}",
            field, value
        )));
    }
    Ok(predicates)
}

fn wrapper_equality(
    field_type: Option<&FieldType>,
    field: &str,
    wire_value: &WireValue,
) -> Result<Expression, Error> {
    let column = column_expression(field, true);
    match wire_value {
        WireValue::Pointer { .. } if matches!(field_type, Some(FieldType::Array { .. })) => {
            let payload = serde_json::to_value(wire_value)
                .map_err(|e| Error::InvalidJson(e.to_string()))?;
            Ok(array_contains(
                column_expression(field, false),
                serde_json::Value::Array(vec![payload]),
            ))
        }
        WireValue::GeoPoint {
            latitude,
            longitude,
        } => {
            wire::validate_coordinates(*latitude, *longitude)?;
            Ok(compare(
                column,
                BinaryOperator::PointEquals,
                values::geo_point_expression(*longitude, *latitude),
            ))
        }
        WireValue::Polygon { coordinates } => {
            let native = wire::polygon_to_native(coordinates)?;
            Ok(compare(
                column,
                BinaryOperator::PointEquals,
                Expression::Cast {
                    expression: Box::new(Expression::Value(Value::String(native))),
                    r#type: CastType::Polygon,
                },
            ))
        }
        _ => {
            let rhs = values::encode_comparison(field_type, &serde_json::to_value(wire_value)
                .map_err(|e| Error::InvalidJson(e.to_string()))?)?;
            Ok(compare(column, BinaryOperator::Equals, rhs))
        }
    }
}

fn translate_eq(
    _schema: &ClassSchema,
    field_type: Option<&FieldType>,
    field: &str,
    value: &serde_json::Value,
) -> Result<Expression, Error> {
    let column = column_expression(field, true);
    if value.is_null() {
        return Ok(is_null(column));
    }
    if matches!(field_type, Some(FieldType::Array { .. })) {
        return Ok(array_contains(
            column_expression(field, false),
            serde_json::Value::Array(vec![value.clone()]),
        ));
    }
    if value.as_bool().is_some() && matches!(field_type, Some(FieldType::Number)) {
        return Ok(compare(
            column,
            BinaryOperator::Equals,
            Expression::Value(Value::Float(UNSATISFIABLE_NUMBER)),
        ));
    }
    let rhs = values::encode_comparison(field_type, value)?;
    Ok(compare(column, BinaryOperator::Equals, rhs))
}

fn translate_ne(
    _schema: &ClassSchema,
    field_type: Option<&FieldType>,
    field: &str,
    value: &serde_json::Value,
) -> Result<Expression, Error> {
    let column = column_expression(field, true);
    if value.is_null() {
        return Ok(is_not_null(column));
    }
    if matches!(field_type, Some(FieldType::Array { .. })) {
        // containment-negation, keeping rows where the column is unset
        return Ok(Expression::Or {
            left: Box::new(Expression::Not(Box::new(array_contains(
                column_expression(field, false),
                serde_json::Value::Array(vec![value.clone()]),
            )))),
            right: Box::new(is_null(column)),
        });
    }
    let rhs = values::encode_comparison(field_type, value)?;
    Ok(Expression::Or {
        left: Box::new(compare(
            column_expression(field, true),
            BinaryOperator::NotEquals,
            rhs,
        )),
        right: Box::new(is_null(column)),
    })
}

fn translate_in(
    field_type: Option<&FieldType>,
    field: &str,
    value: &serde_json::Value,
    negated: bool,
) -> Result<Expression, Error> {
    let op_name = if negated { "$nin" } else { "$in" };
    let items = value
        .as_array()
        .ok_or_else(|| Error::InvalidJson(format!("bad {}: should be an array", op_name)))?;

    // json-containment carve-out for dotted paths; only scalars are
    // accepted, and string values are interpolated into the literal
    // after quote rejection
    if is_dotted(field) {
        for item in items {
            match item {
                serde_json::Value::String(text) => {
                    if text.contains('\'') || text.contains('"') {
                        return Err(Error::InvalidJson(format!(
                            "bad {} value: strings in nested-path lists cannot contain quote characters",
                            op_name
                        )));
                    }
                }
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    return Err(Error::InvalidJson(format!(
                        "bad {} value: nested-path lists accept only scalar values",
                        op_name
                    )));
                }
                _ => {}
            }
        }
        let literal = serde_json::to_string(&serde_json::Value::Array(items.clone()))
            .map_err(|e| Error::InvalidJson(e.to_string()))?;
        let containment = compare(
            Expression::Cast {
                expression: Box::new(column_expression(field, false)),
                r#type: CastType::Jsonb,
            },
            BinaryOperator::Contains,
            // safe: only quote-checked strings and bare scalars remain,
            // none of which can close the literal
            Expression::Raw(format!("'{}'::jsonb", literal)),
        );
        return Ok(if negated {
            Expression::Not(Box::new(containment))
        } else {
            containment
        });
    }

    // vacuous boundaries: nothing is in the empty list, and everything
    // is not-in it
    if items.is_empty() {
        return Ok(if negated {
            helpers::true_expr()
        } else {
            helpers::false_expr()
        });
    }

    let column = column_expression(field, true);

    // array columns are jsonb, which has no native overlap operator;
    // membership goes through the installed helper, with null elements
    // matched as an absent column
    if matches!(field_type, Some(FieldType::Array { .. })) {
        let mut non_null = vec![];
        let mut has_null = false;
        for item in items {
            if item.is_null() {
                has_null = true;
            } else {
                non_null.push(item.clone());
            }
        }
        let mut branches = vec![array_contains(
            column_expression(field, false),
            serde_json::Value::Array(non_null),
        )];
        if has_null {
            branches.push(is_null(column));
        }
        let membership = helpers::or_all(branches);
        return Ok(if negated {
            Expression::Not(Box::new(membership))
        } else {
            membership
        });
    }

    // scalar columns: a disjunctive IN list
    let mut encoded = vec![];
    let mut has_null = false;
    for item in items {
        if item.is_null() {
            has_null = true;
        } else {
            encoded.push(values::encode_comparison(field_type, item)?);
        }
    }
    if negated {
        let not_in = Expression::BinaryArrayOperation {
            left: Box::new(column_expression(field, true)),
            operator: BinaryArrayOperator::NotIn,
            right: encoded,
        };
        Ok(if has_null {
            Expression::And {
                left: Box::new(not_in),
                right: Box::new(is_not_null(column)),
            }
        } else {
            Expression::Or {
                left: Box::new(not_in),
                right: Box::new(is_null(column)),
            }
        })
    } else {
        let in_list = Expression::BinaryArrayOperation {
            left: Box::new(column_expression(field, true)),
            operator: BinaryArrayOperator::In,
            right: encoded,
        };
        Ok(if has_null {
            Expression::Or {
                left: Box::new(in_list),
                right: Box::new(is_null(column)),
            }
        } else {
            in_list
        })
    }
}

fn translate_all(field: &str, value: &serde_json::Value) -> Result<Expression, Error> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::InvalidJson("bad $all: should be an array".to_string()))?;
    let column = column_expression(field, false);

    if !items.is_empty() && items.iter().all(regex::is_starts_with_regex) {
        let prefixes: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                let pattern = item["$regex"].as_str().unwrap_or_default();
                serde_json::Value::String(regex::process_regex_pattern(pattern))
            })
            .collect();
        return Ok(Expression::FunctionCall {
            function: Function::Unknown("array_contains_all_regex".to_string()),
            args: vec![
                column,
                Expression::Cast {
                    expression: Box::new(Expression::Value(Value::Json(
                        serde_json::Value::Array(prefixes),
                    ))),
                    r#type: CastType::Jsonb,
                },
            ],
        });
    }
    if items.iter().any(regex::is_any_regex) {
        return Err(Error::InvalidJson(
            "All $all values must be of regex type or none".to_string(),
        ));
    }
    Ok(Expression::FunctionCall {
        function: Function::Unknown("array_contains_all".to_string()),
        args: vec![
            column,
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(serde_json::Value::Array(
                    items.clone(),
                )))),
                r#type: CastType::Jsonb,
            },
        ],
    })
}

fn translate_text(
    field: &str,
    value: &serde_json::Value,
    ctx: &mut Context,
) -> Result<Expression, Error> {
    let search = value
        .get("$search")
        .and_then(|s| s.as_object())
        .ok_or_else(|| Error::InvalidJson("bad $text: $search, should be an object".to_string()))?;
    let term = search
        .get("$term")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::InvalidJson("bad $text: $term, should be a string".to_string()))?;
    let language = match search.get("$language") {
        None => "english",
        Some(language) => language.as_str().ok_or_else(|| {
            Error::InvalidJson("bad $text: $language, should be a string".to_string())
        })?,
    };
    if search.get("$caseSensitive").and_then(|v| v.as_bool()) == Some(true) {
        return Err(Error::InvalidJson(
            "bad $text: $caseSensitive not supported, please use $regex or create a separate lower case column".to_string(),
        ));
    }
    if search.get("$diacriticSensitive").and_then(|v| v.as_bool()) == Some(false) {
        return Err(Error::InvalidJson(
            "bad $text: $diacriticSensitive - false not supported, install Postgres Unaccent Extension".to_string(),
        ));
    }
    ctx.text_search = Some(TextSearch {
        column: field.to_string(),
        language: language.to_string(),
        term: term.to_string(),
    });
    Ok(compare(
        Expression::FunctionCall {
            function: Function::ToTsvector,
            args: vec![
                Expression::Value(Value::String(language.to_string())),
                column_expression(field, true),
            ],
        },
        BinaryOperator::TextSearchMatch,
        Expression::FunctionCall {
            function: Function::ToTsquery,
            args: vec![
                Expression::Value(Value::String(language.to_string())),
                Expression::Value(Value::String(term.to_string())),
            ],
        },
    ))
}

/// Extract a (longitude, latitude) pair from a wire GeoPoint, a plain
/// `{latitude, longitude}` object, or an `[lng, lat]` array.
fn point_from_value(value: &serde_json::Value, context: &str) -> Result<(f64, f64), Error> {
    if let Some(WireValue::GeoPoint {
        latitude,
        longitude,
    }) = wire::detect(value)
    {
        wire::validate_coordinates(latitude, longitude)?;
        return Ok((longitude, latitude));
    }
    if let Some(pair) = value.as_array() {
        if let [lng, lat] = pair.as_slice() {
            if let (Some(longitude), Some(latitude)) = (lng.as_f64(), lat.as_f64()) {
                wire::validate_coordinates(latitude, longitude)?;
                return Ok((longitude, latitude));
            }
        }
    }
    if let (Some(latitude), Some(longitude)) = (
        value.get("latitude").and_then(|v| v.as_f64()),
        value.get("longitude").and_then(|v| v.as_f64()),
    ) {
        wire::validate_coordinates(latitude, longitude)?;
        return Ok((longitude, latitude));
    }
    Err(Error::InvalidJson(format!(
        "bad {}: expected a GeoPoint",
        context
    )))
}

fn distance_expression(field: &str, longitude: f64, latitude: f64) -> Expression {
    Expression::FunctionCall {
        function: Function::DistanceSphere,
        args: vec![
            Expression::Cast {
                expression: Box::new(column_expression(field, true)),
                r#type: CastType::Geometry,
            },
            Expression::Cast {
                expression: Box::new(values::geo_point_expression(longitude, latitude)),
                r#type: CastType::Geometry,
            },
        ],
    }
}

fn translate_near_sphere(
    field: &str,
    value: &serde_json::Value,
    max_distance: Option<&serde_json::Value>,
    ctx: &mut Context,
    predicates: &mut Vec<Expression>,
) -> Result<(), Error> {
    let (longitude, latitude) = point_from_value(value, "$nearSphere")?;
    let distance = distance_expression(field, longitude, latitude);
    if let Some(max_distance) = max_distance {
        let factor = max_distance.as_f64().ok_or_else(|| {
            Error::InvalidJson("bad $maxDistance: should be a number".to_string())
        })?;
        predicates.push(compare(
            distance.clone(),
            BinaryOperator::LessThanOrEqualTo,
            Expression::Value(Value::Float(factor * EARTH_RADIUS_METERS)),
        ));
    }
    // geo-near queries always implicitly sort by proximity
    ctx.sorts.push(OrderByElement {
        target: distance,
        direction: OrderByDirection::Asc,
    });
    Ok(())
}

fn translate_within_box(field: &str, value: &serde_json::Value) -> Result<Expression, Error> {
    let corners = value
        .get("$box")
        .and_then(|b| b.as_array())
        .filter(|b| b.len() == 2)
        .ok_or_else(|| {
            Error::InvalidJson("bad $within value; $box should be an array of two points".to_string())
        })?;
    let (left, bottom) = point_from_value(&corners[0], "$within")?;
    let (right, top) = point_from_value(&corners[1], "$within")?;
    let box_literal = format!("(({}, {}), ({}, {}))", left, bottom, right, top);
    Ok(compare(
        Expression::Cast {
            expression: Box::new(column_expression(field, true)),
            r#type: CastType::Point,
        },
        BinaryOperator::ContainedBy,
        Expression::Cast {
            expression: Box::new(Expression::Value(Value::String(box_literal))),
            r#type: CastType::Box,
        },
    ))
}

fn translate_geo_within(field: &str, value: &serde_json::Value) -> Result<Expression, Error> {
    if let Some(center_sphere) = value.get("$centerSphere") {
        let pair = center_sphere
            .as_array()
            .filter(|pair| pair.len() == 2)
            .ok_or_else(|| {
                Error::InvalidJson(
                    "bad $geoWithin value; $centerSphere should be an array of a point and a distance".to_string(),
                )
            })?;
        let (longitude, latitude) = point_from_value(&pair[0], "$geoWithin")?;
        let factor = pair[1]
            .as_f64()
            .filter(|d| !d.is_nan() && *d >= 0.0)
            .ok_or_else(|| {
                Error::InvalidJson(
                    "bad $geoWithin value; $centerSphere distance invalid".to_string(),
                )
            })?;
        return Ok(compare(
            distance_expression(field, longitude, latitude),
            BinaryOperator::LessThanOrEqualTo,
            Expression::Value(Value::Float(factor * EARTH_RADIUS_METERS)),
        ));
    }
    if let Some(polygon) = value.get("$polygon") {
        let native = match wire::detect(polygon) {
            Some(WireValue::Polygon { coordinates }) => wire::polygon_to_native(&coordinates)?,
            Some(_) => {
                return Err(Error::InvalidJson(
                    "bad $geoWithin value; $polygon should be Polygon object or Array of GeoPoints".to_string(),
                ))
            }
            None => {
                let points = polygon
                    .as_array()
                    .filter(|points| points.len() >= 3)
                    .ok_or_else(|| {
                        Error::InvalidJson(
                            "bad $geoWithin value; $polygon should contain at least 3 GeoPoints".to_string(),
                        )
                    })?;
                let mut literals = vec![];
                for point in points {
                    let (longitude, latitude) = point_from_value(point, "$geoWithin")?;
                    literals.push(format!("({}, {})", longitude, latitude));
                }
                format!("({})", literals.join(", "))
            }
        };
        return Ok(compare(
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(native))),
                r#type: CastType::Polygon,
            },
            BinaryOperator::Contains,
            Expression::Cast {
                expression: Box::new(column_expression(field, true)),
                r#type: CastType::Point,
            },
        ));
    }
    Err(Error::InvalidJson(
        "bad $geoWithin value; expected $centerSphere or $polygon".to_string(),
    ))
}

fn translate_geo_intersects(field: &str, value: &serde_json::Value) -> Result<Expression, Error> {
    let point = value.get("$point").ok_or_else(|| {
        Error::InvalidJson("bad $geoIntersect value; $point should be GeoPoint".to_string())
    })?;
    match wire::detect(point) {
        Some(WireValue::GeoPoint {
            latitude,
            longitude,
        }) => {
            wire::validate_coordinates(latitude, longitude)?;
            Ok(compare(
                Expression::Cast {
                    expression: Box::new(column_expression(field, true)),
                    r#type: CastType::Polygon,
                },
                BinaryOperator::Contains,
                Expression::Cast {
                    expression: Box::new(Expression::Value(Value::String(format!(
                        "({}, {})",
                        longitude, latitude
                    )))),
                    r#type: CastType::Point,
                },
            ))
        }
        _ => Err(Error::InvalidJson(
            "bad $geoIntersect value; $point should be GeoPoint".to_string(),
        )),
    }
}

fn translate_regex(
    field: &str,
    pattern: &serde_json::Value,
    options: Option<&serde_json::Value>,
) -> Result<Expression, Error> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::InvalidJson("bad $regex: should be a string".to_string()))?;
    let mut operator = BinaryOperator::Regex;
    let mut pattern = pattern.to_string();
    if let Some(options) = options {
        let options = options
            .as_str()
            .ok_or_else(|| Error::InvalidJson("bad $options: should be a string".to_string()))?;
        for flag in options.chars() {
            match flag {
                'i' => operator = BinaryOperator::CaseInsensitiveRegex,
                'x' => pattern = regex::remove_white_space(&pattern),
                other => {
                    return Err(Error::InvalidQuery(format!(
                        "unsupported $options flag: {}",
                        other
                    )))
                }
            }
        }
    }
    let processed = regex::process_regex_pattern(&pattern);
    Ok(compare(
        column_expression(field, true),
        operator,
        // safe: literalization doubles every single quote in the pattern
        Expression::Raw(format!("'{}'", processed)),
    ))
}

fn translate_comparator(
    field_type: Option<&FieldType>,
    field: &str,
    operator: BinaryOperator,
    value: &serde_json::Value,
) -> Result<Expression, Error> {
    if value.get("$relativeTime").is_some() {
        return Err(Error::InvalidJson(
            "$relativeTime is not supported on this backend".to_string(),
        ));
    }
    let rhs = values::encode_comparison(field_type, value)?;
    let lhs = if is_dotted(field) {
        match &rhs {
            Expression::Value(Value::Float(_)) => Expression::Cast {
                expression: Box::new(column_expression(field, true)),
                r#type: CastType::DoublePrecision,
            },
            Expression::Cast {
                r#type: CastType::Timestamptz,
                ..
            } => Expression::Cast {
                expression: Box::new(column_expression(field, true)),
                r#type: CastType::Timestamptz,
            },
            _ => column_expression(field, true),
        }
    } else {
        column_expression(field, true)
    };
    Ok(compare(lhs, operator, rhs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_sql::sql::string::SQL;

    fn schema() -> ClassSchema {
        let mut schema = ClassSchema::new("Player");
        schema.fields.insert("name".to_string(), FieldType::String);
        schema.fields.insert("age".to_string(), FieldType::Number);
        schema
            .fields
            .insert("tags".to_string(), FieldType::array());
        schema.fields.insert(
            "labels".to_string(),
            FieldType::Array {
                contents: Some(Box::new(FieldType::String)),
            },
        );
        schema
            .fields
            .insert("loc".to_string(), FieldType::GeoPoint);
        schema
            .fields
            .insert("stats".to_string(), FieldType::Object);
        schema.fields.insert(
            "owner".to_string(),
            FieldType::Pointer {
                target_class: "_User".to_string(),
            },
        );
        schema
    }

    fn compile(where_: serde_json::Value) -> Result<CompiledWhere, Error> {
        translate_where(&schema(), where_.as_object().unwrap())
    }

    fn render(compiled: &CompiledWhere) -> SQL {
        let mut sql = SQL::new();
        compiled.expression.to_sql(&mut sql);
        sql
    }

    #[test]
    fn literal_null_short_circuits_to_is_null() {
        let compiled = compile(serde_json::json!({"name": null})).unwrap();
        assert_eq!(render(&compiled).sql, "(\"name\" IS NULL)");
    }

    #[test]
    fn boolean_against_number_column_cannot_match() {
        let compiled = compile(serde_json::json!({"age": true})).unwrap();
        let sql = render(&compiled);
        assert_eq!(sql.sql, "(\"age\" = $1)");
        assert_eq!(
            sql.params,
            vec![query_engine_sql::sql::string::Param::Float(
                9_223_372_036_854_775_808.0
            )]
        );
    }

    #[test]
    fn empty_in_is_always_false_and_empty_nin_always_true() {
        let always_false = compile(serde_json::json!({"name": {"$in": []}})).unwrap();
        assert_eq!(always_false.expression, helpers::false_expr());
        let always_true = compile(serde_json::json!({"name": {"$nin": []}})).unwrap();
        assert_eq!(always_true.expression, helpers::true_expr());
    }

    #[test]
    fn unknown_operator_fails_fast() {
        let result = compile(serde_json::json!({"name": {"$foo": 1}}));
        assert!(matches!(result, Err(Error::OperationForbidden(_))));
    }

    #[test]
    fn absent_field_with_exists_false_is_skipped() {
        let compiled = compile(serde_json::json!({"ghost": {"$exists": false}})).unwrap();
        assert_eq!(compiled.expression, helpers::true_expr());
    }

    #[test]
    fn declared_field_with_exists_false_is_checked() {
        let compiled = compile(serde_json::json!({"name": {"$exists": false}})).unwrap();
        assert_eq!(render(&compiled).sql, "(\"name\" IS NULL)");
    }

    #[test]
    fn dot_path_in_uses_json_containment_and_rejects_quotes() {
        let compiled =
            compile(serde_json::json!({"stats.rank": {"$in": ["x", "y"]}})).unwrap();
        let sql = render(&compiled);
        insta::assert_snapshot!(
            sql.sql,
            @r#"(("stats"->'rank')::jsonb @> '["x","y"]'::jsonb)"#
        );
        assert!(sql.params.is_empty());

        let rejected = compile(serde_json::json!({"stats.rank": {"$in": ["x'y"]}}));
        assert!(matches!(rejected, Err(Error::InvalidJson(_))));
    }

    #[test]
    fn dot_path_in_rejects_non_scalar_values() {
        // quote characters nested inside an object would escape the
        // rendered literal, so only scalars are allowed at all
        let with_object = compile(serde_json::json!({
            "stats.rank": {"$in": [{"k": "x', '1'"}]}
        }));
        assert!(matches!(with_object, Err(Error::InvalidJson(_))));

        let with_array = compile(serde_json::json!({"stats.rank": {"$nin": [["x"]]}}));
        assert!(matches!(with_array, Err(Error::InvalidJson(_))));

        // bare scalars cannot close the literal and stay accepted
        let scalars = compile(serde_json::json!({"stats.rank": {"$in": [1, true, null]}}));
        assert!(scalars.is_ok());
    }

    #[test]
    fn geo_near_appends_predicate_and_implicit_sort() {
        let compiled = compile(serde_json::json!({
            "loc": {
                "$nearSphere": {"latitude": 10.0, "longitude": 20.0},
                "$maxDistance": 1.0
            }
        }))
        .unwrap();
        assert_eq!(compiled.sorts.len(), 1);
        assert_eq!(compiled.sorts[0].direction, OrderByDirection::Asc);
        let sql = render(&compiled);
        assert!(sql.sql.contains("ST_DistanceSphere"));
        assert!(sql.sql.contains("<="));
        // distance factor scaled to meters
        assert!(sql
            .params
            .contains(&query_engine_sql::sql::string::Param::Float(6_371_000.0)));
    }

    #[test]
    fn bare_near_sphere_sorts_without_predicate() {
        let compiled = compile(serde_json::json!({
            "loc": {"$nearSphere": {"latitude": 0.0, "longitude": 0.0}}
        }))
        .unwrap();
        assert_eq!(compiled.expression, helpers::true_expr());
        assert_eq!(compiled.sorts.len(), 1);
    }

    #[test]
    fn string_array_in_uses_jsonb_membership_with_null_branch() {
        let compiled =
            compile(serde_json::json!({"labels": {"$in": ["a", null]}})).unwrap();
        let sql = render(&compiled);
        // jsonb columns have no native array overlap
        assert!(!sql.sql.contains("&&"));
        assert!(sql.sql.contains("array_contains"));
        assert!(sql.sql.contains("IS NULL"));
    }

    #[test]
    fn general_array_in_uses_containment() {
        let compiled = compile(serde_json::json!({"tags": {"$in": [1, 2]}})).unwrap();
        assert!(render(&compiled).sql.contains("array_contains"));
    }

    #[test]
    fn all_with_mixed_regex_fails() {
        let result = compile(serde_json::json!({
            "tags": {"$all": [{"$regex": "^\\Qa\\E"}, "plain"]}
        }));
        assert!(matches!(result, Err(Error::InvalidJson(_))));
    }

    #[test]
    fn all_with_starts_with_regexes_rewrites_to_prefix_match() {
        let compiled = compile(serde_json::json!({
            "tags": {"$all": [{"$regex": "^\\Qfoo\\E"}, {"$regex": "^\\Qbar\\E"}]}
        }))
        .unwrap();
        assert!(render(&compiled).sql.contains("array_contains_all_regex"));
    }

    #[test]
    fn text_search_validates_and_records_term() {
        let compiled = compile(serde_json::json!({
            "name": {"$text": {"$search": {"$term": "hello"}}}
        }))
        .unwrap();
        assert_eq!(
            compiled.text_search,
            Some(TextSearch {
                column: "name".to_string(),
                language: "english".to_string(),
                term: "hello".to_string(),
            })
        );
        let case_sensitive = compile(serde_json::json!({
            "name": {"$text": {"$search": {"$term": "x", "$caseSensitive": true}}}
        }));
        assert!(matches!(case_sensitive, Err(Error::InvalidJson(_))));
    }

    #[test]
    fn nor_negates_the_disjunction() {
        let compiled = compile(serde_json::json!({
            "$nor": [{"name": "a"}, {"name": "b"}]
        }))
        .unwrap();
        assert!(render(&compiled).sql.starts_with("NOT "));
    }

    #[test]
    fn pointer_equality_compares_object_id() {
        let compiled = compile(serde_json::json!({
            "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"}
        }))
        .unwrap();
        let sql = render(&compiled);
        assert_eq!(sql.sql, "(\"owner\" = $1)");
        assert_eq!(
            sql.params,
            vec![query_engine_sql::sql::string::Param::String("u1".to_string())]
        );
    }

    #[test]
    fn ne_keeps_null_rows() {
        let compiled = compile(serde_json::json!({"name": {"$ne": "a"}})).unwrap();
        let sql = render(&compiled);
        assert!(sql.sql.contains("<>"));
        assert!(sql.sql.contains("IS NULL"));
    }

    #[test]
    fn multiple_operators_on_one_field_are_anded() {
        let compiled =
            compile(serde_json::json!({"age": {"$gt": 1.0, "$lt": 10.0}})).unwrap();
        let sql = render(&compiled);
        assert!(sql.sql.contains(" > "));
        assert!(sql.sql.contains(" < "));
        assert!(sql.sql.contains(" AND "));
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn regex_is_literalized_and_embedded_quoted() {
        let compiled = compile(serde_json::json!({
            "name": {"$regex": "^\\Qa.b\\E", "$options": "i"}
        }))
        .unwrap();
        let sql = render(&compiled);
        assert_eq!(sql.sql, "(\"name\" ~* '^a\\.b')");
        assert!(sql.params.is_empty());
    }

    #[test]
    fn dot_path_regex_is_a_no_op() {
        let compiled =
            compile(serde_json::json!({"stats.name": {"$regex": "^x"}})).unwrap();
        assert_eq!(compiled.expression, helpers::true_expr());
    }

    #[test]
    fn acl_expression_overlaps_rperm() {
        let expr = read_access_expression(&["*".to_string(), "u1".to_string()]);
        let mut sql = SQL::new();
        expr.to_sql(&mut sql);
        assert!(sql.sql.contains("\"_rperm\""));
        assert!(sql.sql.contains("&&"));
        assert!(sql.sql.contains("IS NULL"));
    }
}
