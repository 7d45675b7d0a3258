//! The per-class schema model: field types, class-level permissions,
//! indexes, and the authoritative mapping from field types to native
//! column types.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The name of the reserved relation holding class schemas.
pub const SCHEMA_TABLE: &str = "_SCHEMA";

/// Implicit array-of-string permission columns every class table carries.
pub const READ_PERM_COLUMN: &str = "_rperm";
pub const WRITE_PERM_COLUMN: &str = "_wperm";

/// System classes whose schema is recreated/upgraded on every startup.
pub const VOLATILE_CLASSES: &[&str] = &[
    "_JobStatus",
    "_PushStatus",
    "_Hooks",
    "_GlobalConfig",
    "_JobSchedule",
    "_Audience",
    "_Idempotency",
];

/// The closed set of field types a class schema may declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<Box<FieldType>>,
    },
    GeoPoint,
    Polygon,
    Bytes,
    File,
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
}

impl FieldType {
    /// A plain array with unspecified contents.
    pub fn array() -> FieldType {
        FieldType::Array { contents: None }
    }

    /// The native column type backing this field type, or `None` for
    /// Relation fields, which carry no column and live in a join table.
    pub fn postgres_type(&self) -> Option<&'static str> {
        match self {
            FieldType::String => Some("text"),
            FieldType::Number => Some("double precision"),
            FieldType::Boolean => Some("boolean"),
            FieldType::Date => Some("timestamp with time zone"),
            FieldType::Object => Some("jsonb"),
            FieldType::Array { .. } => Some("jsonb"),
            FieldType::GeoPoint => Some("point"),
            FieldType::Polygon => Some("polygon"),
            FieldType::Bytes => Some("jsonb"),
            FieldType::File => Some("text"),
            FieldType::Pointer { .. } => Some("text"),
            FieldType::Relation { .. } => None,
        }
    }

    pub fn target_class(&self) -> Option<&str> {
        match self {
            FieldType::Pointer { target_class } | FieldType::Relation { target_class } => {
                Some(target_class)
            }
            _ => None,
        }
    }
}

/// A capability set: operation name to the set of principals allowed to
/// perform it. `{"*": true}` means public.
pub type PermissionSet = BTreeMap<String, bool>;

/// Class-level permissions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ClassLevelPermissions {
    #[serde(default)]
    pub find: PermissionSet,
    #[serde(default)]
    pub get: PermissionSet,
    #[serde(default)]
    pub create: PermissionSet,
    #[serde(default)]
    pub update: PermissionSet,
    #[serde(default)]
    pub delete: PermissionSet,
    #[serde(default, rename = "addField")]
    pub add_field: PermissionSet,
}

impl ClassLevelPermissions {
    /// Permissions allowing every operation to everyone.
    pub fn public() -> Self {
        let star: PermissionSet = BTreeMap::from([("*".to_string(), true)]);
        ClassLevelPermissions {
            find: star.clone(),
            get: star.clone(),
            create: star.clone(),
            update: star.clone(),
            delete: star.clone(),
            add_field: star,
        }
    }
}

/// A class schema: field descriptors, permissions, and named indexes.
/// This is what the `schema` jsonb column of `_SCHEMA` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClassSchema {
    #[serde(rename = "className")]
    pub class_name: String,
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default, rename = "classLevelPermissions")]
    pub class_level_permissions: ClassLevelPermissions,
    #[serde(default)]
    pub indexes: BTreeMap<String, serde_json::Value>,
}

impl ClassSchema {
    /// A new schema with the implicit system fields already present.
    pub fn new(class_name: &str) -> Self {
        let mut schema = ClassSchema {
            class_name: class_name.to_string(),
            fields: BTreeMap::new(),
            class_level_permissions: ClassLevelPermissions::public(),
            indexes: BTreeMap::new(),
        };
        for (name, ty) in default_fields(class_name) {
            schema.fields.insert(name.to_string(), ty);
        }
        schema
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    /// The join table backing a Relation field of this class.
    pub fn join_table_name(&self, field: &str) -> String {
        format!("_Join:{}:{}", field, self.class_name)
    }
}

/// The implicit fields every class starts with, plus the `_User`
/// auth-flow bookkeeping columns.
pub fn default_fields(class_name: &str) -> Vec<(&'static str, FieldType)> {
    let mut fields = vec![
        ("objectId", FieldType::String),
        ("createdAt", FieldType::Date),
        ("updatedAt", FieldType::Date),
    ];
    if class_name == "_User" {
        fields.extend([
            ("username", FieldType::String),
            ("email", FieldType::String),
            ("emailVerified", FieldType::Boolean),
            ("authData", FieldType::Object),
            ("_hashed_password", FieldType::String),
            ("_email_verify_token", FieldType::String),
            ("_email_verify_token_expires_at", FieldType::Date),
            ("_account_lockout_expires_at", FieldType::Date),
            ("_failed_login_count", FieldType::Number),
            ("_perishable_token", FieldType::String),
            ("_perishable_token_expires_at", FieldType::Date),
            ("_password_changed_at", FieldType::Date),
            ("_password_history", FieldType::array()),
        ]);
    }
    fields
}

/// Reserved columns that are always Date-typed regardless of the
/// declared schema (password-reset tokens, lockout timestamps, ...).
pub fn is_reserved_date_column(name: &str) -> bool {
    matches!(
        name,
        "createdAt"
            | "updatedAt"
            | "expiresAt"
            | "_email_verify_token_expires_at"
            | "_account_lockout_expires_at"
            | "_perishable_token_expires_at"
            | "_password_changed_at"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_round_trips_through_parse_format() {
        let pointer = FieldType::Pointer {
            target_class: "_User".to_string(),
        };
        let json = serde_json::to_value(&pointer).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "Pointer", "targetClass": "_User"})
        );
        let back: FieldType = serde_json::from_value(json).unwrap();
        assert_eq!(back, pointer);
    }

    #[test]
    fn array_contents_are_optional() {
        let array: FieldType = serde_json::from_value(serde_json::json!({"type": "Array"})).unwrap();
        assert_eq!(array, FieldType::array());
        let typed: FieldType = serde_json::from_value(
            serde_json::json!({"type": "Array", "contents": {"type": "String"}}),
        )
        .unwrap();
        assert_eq!(
            typed,
            FieldType::Array {
                contents: Some(Box::new(FieldType::String))
            }
        );
        assert_eq!(typed.postgres_type(), Some("jsonb"));
    }

    #[test]
    fn relations_have_no_backing_column() {
        let relation = FieldType::Relation {
            target_class: "Game".to_string(),
        };
        assert_eq!(relation.postgres_type(), None);
        assert_eq!(relation.target_class(), Some("Game"));
    }

    #[test]
    fn user_class_carries_security_columns() {
        let schema = ClassSchema::new("_User");
        assert_eq!(
            schema.field("_account_lockout_expires_at"),
            Some(&FieldType::Date)
        );
        assert!(is_reserved_date_column("_password_changed_at"));
        assert!(!is_reserved_date_column("username"));
    }
}
