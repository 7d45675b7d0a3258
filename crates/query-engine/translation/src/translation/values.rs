//! The value coder: translate wire values to SQL expressions on the
//! write/compare paths, and native column values back to wire shape on
//! the read path.

use query_engine_metadata::metadata::{self, FieldType};
use query_engine_sql::sql::ast::{CastType, Expression, Function, Value};

use super::error::Error;
use super::wire::{self, WireValue};

/// Encode a wire value for use in a comparison predicate: typed
/// wrappers are stripped down to their native comparable form.
pub fn encode_comparison(
    field_type: Option<&FieldType>,
    value: &serde_json::Value,
) -> Result<Expression, Error> {
    if let Some(wire_value) = wire::detect(value) {
        return encode_wire_comparison(&wire_value);
    }
    match value {
        serde_json::Value::Null => Ok(Expression::Value(Value::Null)),
        serde_json::Value::Bool(b) => Ok(Expression::Value(Value::Bool(*b))),
        serde_json::Value::Number(num) => {
            let n = num
                .as_f64()
                .ok_or_else(|| Error::InvalidJson(format!("bad number: {}", num)))?;
            Ok(Expression::Value(Value::Float(n)))
        }
        serde_json::Value::String(s) => match field_type {
            // ISO strings compared against Date columns need the cast
            Some(FieldType::Date) => Ok(Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(s.clone()))),
                r#type: CastType::Timestamptz,
            }),
            _ => Ok(Expression::Value(Value::String(s.clone()))),
        },
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => Ok(Expression::Cast {
            expression: Box::new(Expression::Value(Value::Json(value.clone()))),
            r#type: CastType::Jsonb,
        }),
    }
}

fn encode_wire_comparison(wire_value: &WireValue) -> Result<Expression, Error> {
    match wire_value {
        WireValue::Pointer { object_id, .. } => {
            Ok(Expression::Value(Value::String(object_id.clone())))
        }
        WireValue::Date { iso } => Ok(Expression::Cast {
            expression: Box::new(Expression::Value(Value::String(iso.clone()))),
            r#type: CastType::Timestamptz,
        }),
        WireValue::File { name, .. } => Ok(Expression::Value(Value::String(name.clone()))),
        WireValue::GeoPoint {
            latitude,
            longitude,
        } => {
            wire::validate_coordinates(*latitude, *longitude)?;
            Ok(geo_point_expression(*longitude, *latitude))
        }
        WireValue::Polygon { coordinates } => {
            let native = wire::polygon_to_native(coordinates)?;
            Ok(Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(native))),
                r#type: CastType::Polygon,
            })
        }
        WireValue::Bytes { .. } => Ok(Expression::Cast {
            expression: Box::new(Expression::Value(Value::Json(
                serde_json::to_value(wire_value)
                    .map_err(|e| Error::InvalidJson(e.to_string()))?,
            ))),
            r#type: CastType::Jsonb,
        }),
        WireValue::Relation { .. } => Err(Error::InvalidQuery(
            "cannot compare against a Relation value".to_string(),
        )),
    }
}

/// `POINT(x, y)` with x carrying longitude and y latitude.
pub fn geo_point_expression(longitude: f64, latitude: f64) -> Expression {
    Expression::FunctionCall {
        function: Function::Point,
        args: vec![
            Expression::Value(Value::Float(longitude)),
            Expression::Value(Value::Float(latitude)),
        ],
    }
}

/// Encode a wire value for a column write, per the declared field type.
/// GeoPoint columns are handled by the caller (they are deferred to the
/// end of the column list) and are rejected here.
pub fn encode_column_value(
    field_type: &FieldType,
    value: &serde_json::Value,
) -> Result<Expression, Error> {
    if value.is_null() {
        return Ok(Expression::Value(Value::Null));
    }
    match field_type {
        FieldType::String | FieldType::File | FieldType::Pointer { .. } => {
            let text = match wire::detect(value) {
                Some(WireValue::File { name, .. }) => name,
                Some(WireValue::Pointer { object_id, .. }) => object_id,
                _ => value
                    .as_str()
                    .ok_or_else(|| Error::InvalidJson(format!("expected a string: {}", value)))?
                    .to_string(),
            };
            Ok(Expression::Value(Value::String(text)))
        }
        FieldType::Number => {
            let n = value
                .as_f64()
                .ok_or_else(|| Error::InvalidJson(format!("expected a number: {}", value)))?;
            Ok(Expression::Value(Value::Float(n)))
        }
        FieldType::Boolean => {
            let b = value
                .as_bool()
                .ok_or_else(|| Error::InvalidJson(format!("expected a boolean: {}", value)))?;
            Ok(Expression::Value(Value::Bool(b)))
        }
        FieldType::Date => {
            let iso = match wire::detect(value) {
                Some(WireValue::Date { iso }) => iso,
                _ => value
                    .as_str()
                    .ok_or_else(|| Error::InvalidJson(format!("expected a date: {}", value)))?
                    .to_string(),
            };
            Ok(Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(iso))),
                r#type: CastType::Timestamptz,
            })
        }
        FieldType::Object | FieldType::Bytes => Ok(Expression::Cast {
            expression: Box::new(Expression::Value(Value::Json(value.clone()))),
            r#type: CastType::Jsonb,
        }),
        FieldType::Array { .. } => {
            let items = value
                .as_array()
                .ok_or_else(|| Error::InvalidJson(format!("expected an array: {}", value)))?;
            Ok(json_array_expression(items))
        }
        FieldType::Polygon => {
            let coordinates = match wire::detect(value) {
                Some(WireValue::Polygon { coordinates }) => coordinates,
                _ => {
                    return Err(Error::InvalidJson(format!(
                        "expected a Polygon: {}",
                        value
                    )))
                }
            };
            let native = wire::polygon_to_native(&coordinates)?;
            Ok(Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(native))),
                r#type: CastType::Polygon,
            })
        }
        FieldType::GeoPoint | FieldType::Relation { .. } => Err(Error::InvalidJson(format!(
            "field type cannot be written as a plain column: {:?}",
            field_type
        ))),
    }
}

/// Build a `json_build_array(...)` expression preserving nested-array
/// shape and per-element typing; plain scalar lists collapse to one
/// jsonb parameter.
pub fn json_array_expression(items: &[serde_json::Value]) -> Expression {
    fn needs_construction(value: &serde_json::Value) -> bool {
        // nested arrays lose their shape inside a single jsonb parameter
        // with some drivers; typed wrappers need per-element handling
        match value {
            serde_json::Value::Array(_) => true,
            serde_json::Value::Object(_) => wire::detect(value).is_some(),
            _ => false,
        }
    }

    fn element(value: &serde_json::Value) -> Expression {
        match value {
            serde_json::Value::Array(inner) => Expression::FunctionCall {
                function: Function::JsonBuildArray,
                args: inner.iter().map(element).collect(),
            },
            serde_json::Value::Null => Expression::Value(Value::Null),
            serde_json::Value::Bool(b) => Expression::Value(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                Expression::Value(Value::Float(n.as_f64().unwrap_or(0.0)))
            }
            serde_json::Value::String(s) => Expression::Value(Value::String(s.clone())),
            serde_json::Value::Object(_) => Expression::Cast {
                expression: Box::new(Expression::Value(Value::Json(value.clone()))),
                r#type: CastType::Jsonb,
            },
        }
    }

    if items.iter().any(needs_construction) {
        Expression::Cast {
            expression: Box::new(Expression::FunctionCall {
                function: Function::JsonBuildArray,
                args: items.iter().map(element).collect(),
            }),
            r#type: CastType::Jsonb,
        }
    } else {
        Expression::Cast {
            expression: Box::new(Expression::Value(Value::Json(serde_json::Value::Array(
                items.to_vec(),
            )))),
            r#type: CastType::Jsonb,
        }
    }
}

/// Decode a native column value (as read from a row) back into its wire
/// shape. Returns `None` for null values: nulls are stripped from wire
/// objects, never round-tripped explicitly.
pub fn decode_field(
    field_name: &str,
    field_type: Option<&FieldType>,
    native: serde_json::Value,
) -> Option<serde_json::Value> {
    if native.is_null() {
        return None;
    }
    // reserved timestamp columns are Date regardless of declared schema
    if metadata::is_reserved_date_column(field_name) {
        if let serde_json::Value::String(iso) = native {
            return Some(date_wire(&iso));
        }
    }
    match field_type {
        Some(FieldType::Pointer { target_class }) => {
            let object_id = native.as_str()?.to_string();
            serde_json::to_value(WireValue::Pointer {
                class_name: target_class.clone(),
                object_id,
            })
            .ok()
        }
        Some(FieldType::Relation { target_class }) => serde_json::to_value(WireValue::Relation {
            class_name: target_class.clone(),
        })
        .ok(),
        Some(FieldType::Date) => {
            let iso = native.as_str()?;
            Some(date_wire(iso))
        }
        Some(FieldType::GeoPoint) => {
            let (longitude, latitude) = wire::native_to_point(native.as_str()?)?;
            serde_json::to_value(WireValue::GeoPoint {
                latitude,
                longitude,
            })
            .ok()
        }
        Some(FieldType::Polygon) => {
            let coordinates = wire::native_to_polygon(native.as_str()?)?;
            serde_json::to_value(WireValue::Polygon { coordinates }).ok()
        }
        Some(FieldType::File) => {
            let name = native.as_str()?.to_string();
            serde_json::to_value(WireValue::File { name, url: None }).ok()
        }
        // Bytes columns already store their wire wrapper as jsonb
        _ => Some(native),
    }
}

/// The wire wrapper for a Date value.
pub fn date_wire(iso: &str) -> serde_json::Value {
    serde_json::json!({ "__type": "Date", "iso": iso })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer_type() -> FieldType {
        FieldType::Pointer {
            target_class: "_User".to_string(),
        }
    }

    #[test]
    fn comparison_strips_pointer_to_object_id() {
        let value = serde_json::json!({
            "__type": "Pointer", "className": "_User", "objectId": "u1"
        });
        let expr = encode_comparison(Some(&pointer_type()), &value).unwrap();
        assert_eq!(expr, Expression::Value(Value::String("u1".to_string())));
    }

    #[test]
    fn comparison_strips_date_to_iso_with_cast() {
        let value = serde_json::json!({"__type": "Date", "iso": "2020-01-01T00:00:00.000Z"});
        let expr = encode_comparison(Some(&FieldType::Date), &value).unwrap();
        assert_eq!(
            expr,
            Expression::Cast {
                expression: Box::new(Expression::Value(Value::String(
                    "2020-01-01T00:00:00.000Z".to_string()
                ))),
                r#type: CastType::Timestamptz,
            }
        );
    }

    #[test]
    fn round_trip_per_field_type() {
        // decode(encode(wire)) == wire for the typed wrappers
        let cases: Vec<(&str, FieldType, serde_json::Value)> = vec![
            (
                "owner",
                pointer_type(),
                serde_json::json!({"__type": "Pointer", "className": "_User", "objectId": "u1"}),
            ),
            (
                "avatar",
                FieldType::File,
                serde_json::json!({"__type": "File", "name": "pic.png"}),
            ),
            (
                "location",
                FieldType::GeoPoint,
                serde_json::json!({"__type": "GeoPoint", "latitude": 10.0, "longitude": 20.0}),
            ),
        ];
        for (name, field_type, wire_value) in cases {
            // native forms as the row mapper would extract them
            let native = match &field_type {
                FieldType::GeoPoint => serde_json::json!("(20, 10)"),
                _ => serde_json::json!(wire_value
                    .get("objectId")
                    .or_else(|| wire_value.get("name"))
                    .unwrap()
                    .as_str()
                    .unwrap()),
            };
            let decoded = decode_field(name, Some(&field_type), native).unwrap();
            assert_eq!(decoded, wire_value, "field {}", name);
        }
    }

    #[test]
    fn nulls_are_stripped_on_decode() {
        assert_eq!(
            decode_field("x", Some(&FieldType::String), serde_json::Value::Null),
            None
        );
    }

    #[test]
    fn reserved_timestamps_decode_as_dates_without_schema() {
        let decoded = decode_field(
            "_account_lockout_expires_at",
            None,
            serde_json::json!("2021-05-01T00:00:00.000Z"),
        )
        .unwrap();
        assert_eq!(decoded["__type"], "Date");
    }

    #[test]
    fn nested_arrays_build_json_array_construction() {
        let items = vec![serde_json::json!([1, 2]), serde_json::json!("x")];
        match json_array_expression(&items) {
            Expression::Cast { expression, .. } => match *expression {
                Expression::FunctionCall { function, args } => {
                    assert_eq!(function, Function::JsonBuildArray);
                    assert_eq!(args.len(), 2);
                }
                other => panic!("expected json_build_array, got {:?}", other),
            },
            other => panic!("expected cast, got {:?}", other),
        }
    }
}
