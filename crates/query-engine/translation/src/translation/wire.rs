//! Wire-format typed values: the `__type`-tagged wrapper objects REST
//! clients exchange for non-primitive field types.

use serde::{Deserialize, Serialize};

use super::error::Error;

/// A typed wire value. The wire shape is a JSON object tagged by `__type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type")]
pub enum WireValue {
    Pointer {
        #[serde(rename = "className")]
        class_name: String,
        #[serde(rename = "objectId")]
        object_id: String,
    },
    Date {
        iso: String,
    },
    GeoPoint {
        latitude: f64,
        longitude: f64,
    },
    Polygon {
        /// `[latitude, longitude]` pairs.
        coordinates: Vec<[f64; 2]>,
    },
    File {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Bytes {
        base64: String,
    },
    Relation {
        #[serde(rename = "className")]
        class_name: String,
    },
}

/// Recognize a typed wire wrapper. Returns `None` for anything that is
/// not an object carrying a known `__type` tag.
pub fn detect(value: &serde_json::Value) -> Option<WireValue> {
    let object = value.as_object()?;
    object.get("__type")?.as_str()?;
    serde_json::from_value(value.clone()).ok()
}

/// Validate a coordinate pair: latitude ∈ [-90, 90], longitude ∈ [-180, 180].
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), Error> {
    if !(-90.0..=90.0).contains(&latitude) || latitude.is_nan() {
        return Err(Error::InvalidJson(format!(
            "Point latitude out of bounds: {}",
            latitude
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) || longitude.is_nan() {
        return Err(Error::InvalidJson(format!(
            "Point longitude out of bounds: {}",
            longitude
        )));
    }
    Ok(())
}

/// Encode a polygon ring as a native polygon literal `((x1,y1),...)`,
/// x carrying longitude and y latitude.
///
/// The ring is closed if necessary (idempotently), and must keep at
/// least 3 distinct vertices.
pub fn polygon_to_native(coordinates: &[[f64; 2]]) -> Result<String, Error> {
    if coordinates.len() < 3 {
        return Err(Error::InvalidJson(
            "GeoJSON: Loop must have at least 3 different vertices".to_string(),
        ));
    }
    for [latitude, longitude] in coordinates {
        validate_coordinates(*latitude, *longitude)?;
    }

    let mut ring: Vec<[f64; 2]> = coordinates.to_vec();
    if ring.first() != ring.last() {
        let first = ring[0];
        ring.push(first);
    }

    // distinct vertices, not counting the closing duplicate
    let mut distinct: Vec<[f64; 2]> = vec![];
    for point in &ring[..ring.len() - 1] {
        if !distinct.contains(point) {
            distinct.push(*point);
        }
    }
    if distinct.len() < 3 {
        return Err(Error::InvalidJson(
            "GeoJSON: Loop must have at least 3 different vertices".to_string(),
        ));
    }

    let points = ring
        .iter()
        .map(|[latitude, longitude]| format!("({}, {})", longitude, latitude))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("({})", points))
}

/// Parse a native point literal `(x,y)` back into (longitude, latitude).
pub fn native_to_point(native: &str) -> Option<(f64, f64)> {
    let inner = native.trim().strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = inner.splitn(2, ',');
    let x = parts.next()?.trim().parse().ok()?;
    let y = parts.next()?.trim().parse().ok()?;
    Some((x, y))
}

/// Parse a native polygon literal `((x1,y1),(x2,y2),...)` back into
/// wire `[latitude, longitude]` pairs.
pub fn native_to_polygon(native: &str) -> Option<Vec<[f64; 2]>> {
    let inner = native.trim().strip_prefix('(')?.strip_suffix(')')?;
    let mut coordinates = vec![];
    let mut rest = inner.trim_start();
    while !rest.is_empty() {
        let end = rest.find(')')?;
        let (longitude, latitude) = native_to_point(&rest[..=end])?;
        coordinates.push([latitude, longitude]);
        rest = rest[end + 1..].trim_start_matches([',', ' ']);
    }
    Some(coordinates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pointer_wrappers() {
        let value = serde_json::json!({
            "__type": "Pointer", "className": "_User", "objectId": "abc123"
        });
        assert_eq!(
            detect(&value),
            Some(WireValue::Pointer {
                class_name: "_User".to_string(),
                object_id: "abc123".to_string(),
            })
        );
        assert_eq!(detect(&serde_json::json!({"a": 1})), None);
        assert_eq!(detect(&serde_json::json!("Pointer")), None);
    }

    #[test]
    fn polygon_closure_is_idempotent() {
        let open = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let closed = [[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.0, 0.0]];
        let from_open = polygon_to_native(&open).unwrap();
        let from_closed = polygon_to_native(&closed).unwrap();
        assert_eq!(from_open, from_closed);
        assert_eq!(from_open, "((0, 0), (1, 0), (1, 1), (0, 0))");
    }

    #[test]
    fn polygon_requires_three_distinct_vertices() {
        let degenerate = [[0.0, 0.0], [0.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        assert!(matches!(
            polygon_to_native(&degenerate),
            Err(Error::InvalidJson(_))
        ));
        let too_few = [[0.0, 0.0], [1.0, 1.0]];
        assert!(matches!(
            polygon_to_native(&too_few),
            Err(Error::InvalidJson(_))
        ));
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, -181.0).is_err());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());
    }

    #[test]
    fn native_geo_literals_round_trip() {
        let native = polygon_to_native(&[[10.0, 20.0], [11.0, 21.0], [12.0, 22.0]]).unwrap();
        let coordinates = native_to_polygon(&native).unwrap();
        // closing vertex included in the native form
        assert_eq!(
            coordinates,
            vec![[10.0, 20.0], [11.0, 21.0], [12.0, 22.0], [10.0, 20.0]]
        );
        assert_eq!(native_to_point("(20.5, 10.25)"), Some((20.5, 10.25)));
    }
}
