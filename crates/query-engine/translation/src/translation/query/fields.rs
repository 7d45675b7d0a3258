//! Build the SELECT projection for a class: one aliased expression per
//! requested native column.

use query_engine_metadata::metadata::ClassSchema;
use query_engine_sql::sql::ast::{CastType, ColumnAlias, ColumnName, Expression};
use query_engine_sql::sql::helpers::make_column_alias;

use super::super::error::Error;
use super::filtering::TextSearch;
use super::sorting::{score_expression, SCORE_KEY};

/// Columns included in every projection regardless of a `keys` filter.
const ALWAYS_PROJECTED: &[&str] = &["objectId", "createdAt", "updatedAt"];

/// The projection for a find over `schema`, optionally restricted to
/// `keys`. Point and polygon columns are read back as text so their
/// literals can be parsed without native geometric decoding.
pub fn projection(
    schema: &ClassSchema,
    keys: Option<&[String]>,
    text_search: Option<&TextSearch>,
) -> Result<Vec<(ColumnAlias, Expression)>, Error> {
    let mut columns = vec![];
    for (name, field_type) in &schema.fields {
        if field_type.postgres_type().is_none() {
            // relation fields carry no column
            continue;
        }
        if !selected(name, keys) {
            continue;
        }
        let column = Expression::ColumnReference(ColumnName(name.clone()));
        let expression = match field_type.postgres_type() {
            Some("point") | Some("polygon") => Expression::Cast {
                expression: Box::new(column),
                r#type: CastType::Text,
            },
            _ => column,
        };
        columns.push((make_column_alias(name.clone()), expression));
    }
    if let Some(keys) = keys {
        if keys.iter().any(|key| key == SCORE_KEY) {
            let text_search = text_search.ok_or_else(|| {
                Error::InvalidQuery(
                    "You cannot use $score without a $text constraint".to_string(),
                )
            })?;
            columns.push((
                make_column_alias(SCORE_KEY.to_string()),
                score_expression(text_search),
            ));
        }
    }
    Ok(columns)
}

/// Whether a column survives the `keys` restriction. Dotted keys keep
/// their root column; the identity columns are always kept.
fn selected(name: &str, keys: Option<&[String]>) -> bool {
    let Some(keys) = keys else { return true };
    if ALWAYS_PROJECTED.contains(&name) {
        return true;
    }
    keys.iter().any(|key| {
        key == name
            || key
                .split_once('.')
                .is_some_and(|(root, _)| root == name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_engine_metadata::metadata::FieldType;

    fn schema() -> ClassSchema {
        let mut schema = ClassSchema::new("Place");
        schema.fields.insert("name".to_string(), FieldType::String);
        schema
            .fields
            .insert("loc".to_string(), FieldType::GeoPoint);
        schema
            .fields
            .insert("stats".to_string(), FieldType::Object);
        schema.fields.insert(
            "friends".to_string(),
            FieldType::Relation {
                target_class: "_User".to_string(),
            },
        );
        schema
    }

    fn names(columns: &[(ColumnAlias, Expression)]) -> Vec<String> {
        columns.iter().map(|(alias, _)| alias.name.clone()).collect()
    }

    #[test]
    fn relations_have_no_column_and_are_skipped() {
        let columns = projection(&schema(), None, None).unwrap();
        assert!(!names(&columns).contains(&"friends".to_string()));
        assert!(names(&columns).contains(&"name".to_string()));
    }

    #[test]
    fn geo_columns_are_read_as_text() {
        let columns = projection(&schema(), None, None).unwrap();
        let (_, loc) = columns
            .iter()
            .find(|(alias, _)| alias.name == "loc")
            .unwrap();
        assert!(matches!(
            loc,
            Expression::Cast {
                r#type: CastType::Text,
                ..
            }
        ));
    }

    #[test]
    fn keys_keep_identity_columns_and_dotted_roots() {
        let keys = vec!["stats.rank".to_string()];
        let columns = projection(&schema(), Some(&keys), None).unwrap();
        let names = names(&columns);
        assert!(names.contains(&"objectId".to_string()));
        assert!(names.contains(&"createdAt".to_string()));
        assert!(names.contains(&"stats".to_string()));
        assert!(!names.contains(&"name".to_string()));
    }

    #[test]
    fn score_key_requires_text_search() {
        let keys = vec!["$score".to_string()];
        assert!(projection(&schema(), Some(&keys), None).is_err());
        let text_search = TextSearch {
            column: "name".to_string(),
            language: "english".to_string(),
            term: "x".to_string(),
        };
        let columns = projection(&schema(), Some(&keys), Some(&text_search)).unwrap();
        assert!(names(&columns).contains(&"$score".to_string()));
    }
}
