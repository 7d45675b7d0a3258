//! Decode database rows back into wire-format objects, driven by the
//! class schema.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row};

use query_engine_metadata::metadata::{self, ClassSchema, FieldType};
use query_engine_translation::translation::values;

use crate::error::Error;

/// Decode one row into a wire object. Columns are matched against the
/// schema by name; null columns are stripped from the result.
pub fn row_to_object(
    schema: &ClassSchema,
    row: &PgRow,
) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let field_type = schema.field(name);
        let Some(native) = native_value(row, name, field_type)? else {
            continue;
        };
        if let Some(wire) = values::decode_field(name, field_type, native) {
            object.insert(name.to_string(), wire);
        }
    }
    // relations have no backing column; the stub is synthesized from the
    // schema and resolved through the join table by callers that need it
    for (name, field_type) in &schema.fields {
        if let FieldType::Relation { target_class } = field_type {
            object.insert(
                name.clone(),
                serde_json::json!({ "__type": "Relation", "className": target_class }),
            );
        }
    }
    Ok(object)
}

/// Extract a column in its natural driver type and re-express it as
/// json, before wire wrapping. Point and polygon columns arrive as text
/// thanks to the projection cast.
fn native_value(
    row: &PgRow,
    name: &str,
    field_type: Option<&FieldType>,
) -> Result<Option<serde_json::Value>, Error> {
    let value = match field_type {
        Some(FieldType::Number) => row
            .try_get::<Option<f64>, _>(name)
            .map_err(driver_error)?
            .map(|n| serde_json::json!(n)),
        Some(FieldType::Boolean) => row
            .try_get::<Option<bool>, _>(name)
            .map_err(driver_error)?
            .map(|b| serde_json::json!(b)),
        Some(FieldType::Date) => row
            .try_get::<Option<DateTime<Utc>>, _>(name)
            .map_err(driver_error)?
            .map(|ts| serde_json::json!(iso(&ts))),
        Some(FieldType::Object) | Some(FieldType::Array { .. }) | Some(FieldType::Bytes) => row
            .try_get::<Option<serde_json::Value>, _>(name)
            .map_err(driver_error)?,
        // relation fields carry no column and are never projected
        Some(FieldType::Relation { .. }) => None,
        // strings, pointers, files, and text-cast geo columns
        Some(_) => row
            .try_get::<Option<String>, _>(name)
            .map_err(driver_error)?
            .map(serde_json::Value::String),
        None if name == "$score" => row
            .try_get::<Option<f32>, _>(name)
            .map_err(driver_error)?
            .map(|score| serde_json::json!(score)),
        None if metadata::is_reserved_date_column(name) => row
            .try_get::<Option<DateTime<Utc>>, _>(name)
            .map_err(driver_error)?
            .map(|ts| serde_json::json!(iso(&ts))),
        None => {
            // column outside the schema; best-effort decodes
            if let Ok(text) = row.try_get::<Option<String>, _>(name) {
                text.map(serde_json::Value::String)
            } else if let Ok(json) = row.try_get::<Option<serde_json::Value>, _>(name) {
                json
            } else {
                None
            }
        }
    };
    Ok(value.filter(|v| !v.is_null()))
}

/// Decode a column without schema guidance, trying the likely driver
/// types in turn. Used for computed columns (aggregates, distinct).
pub fn decode_loose(row: &PgRow, name: &str) -> Option<serde_json::Value> {
    if let Ok(n) = row.try_get::<Option<f64>, _>(name) {
        return n.map(|n| serde_json::json!(n));
    }
    if let Ok(n) = row.try_get::<Option<i64>, _>(name) {
        return n.map(|n| serde_json::json!(n));
    }
    if let Ok(b) = row.try_get::<Option<bool>, _>(name) {
        return b.map(|b| serde_json::json!(b));
    }
    if let Ok(ts) = row.try_get::<Option<DateTime<Utc>>, _>(name) {
        return ts.map(|ts| serde_json::json!(iso(&ts)));
    }
    if let Ok(s) = row.try_get::<Option<String>, _>(name) {
        return s.map(serde_json::Value::String);
    }
    if let Ok(json) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return json.filter(|v| !v.is_null());
    }
    None
}

fn driver_error(error: sqlx::Error) -> Error {
    Error::Internal(format!("failed to decode column: {}", error))
}

/// Millisecond-precision UTC ISO form, the wire format for dates.
pub fn iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_uses_millisecond_utc() {
        let ts = DateTime::parse_from_rfc3339("2020-06-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(iso(&ts), "2020-06-01T12:30:45.123Z");
    }
}
