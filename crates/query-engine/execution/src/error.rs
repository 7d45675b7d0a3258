//! The unified error taxonomy for storage operations, and the mapping
//! from PostgreSQL SQLSTATE codes into it.

use thiserror::Error;

pub use query_engine_translation::translation::error::Error as TranslationError;

/// SQLSTATE codes the adapter reacts to.
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const DUPLICATE_COLUMN: &str = "42701";
    pub const DUPLICATE_OBJECT: &str = "42710";
    pub const IN_FAILED_TRANSACTION: &str = "25P02";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error("Object not found.")]
    ObjectNotFound,
    #[error("A duplicate value for a field with unique values was provided: {field}")]
    DuplicateValue { field: String },
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// The stable numeric error code surfaced to API clients.
    pub fn code(&self) -> i32 {
        match self {
            Error::Translation(inner) => inner.code(),
            Error::ObjectNotFound => 101,
            Error::DuplicateValue { .. } => 137,
            Error::Database(_) | Error::Internal(_) => 1,
        }
    }

    /// The SQLSTATE carried by a database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            Error::Database(error) => sqlstate_of(error),
            _ => None,
        }
    }

    /// Whether this is a missing-relation error, absorbed by reads
    /// against classes whose table was never created.
    pub fn is_undefined_table(&self) -> bool {
        self.sqlstate().as_deref() == Some(sqlstate::UNDEFINED_TABLE)
    }

    /// Whether this is a lost race against concurrent DDL creating the
    /// same table, column, or constraint.
    pub fn is_duplicate_definition(&self) -> bool {
        matches!(
            self.sqlstate().as_deref(),
            Some(sqlstate::DUPLICATE_TABLE)
                | Some(sqlstate::DUPLICATE_COLUMN)
                | Some(sqlstate::DUPLICATE_OBJECT)
        )
    }
}

fn sqlstate_of(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|code| code.to_string()),
        _ => None,
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &error {
            if db.code().as_deref() == Some(sqlstate::UNIQUE_VIOLATION) {
                return Error::DuplicateValue {
                    field: violated_field(db.as_ref()),
                };
            }
        }
        Error::Database(error)
    }
}

/// Pull the offending column out of a unique-violation detail line,
/// `Key (username)=(ada) already exists.`
fn violated_field(db: &dyn sqlx::error::DatabaseError) -> String {
    let detail = db
        .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
        .and_then(|pg| pg.detail())
        .unwrap_or("");
    detail
        .split_once("Key (")
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(field, _)| field.to_string())
        .unwrap_or_else(|| db.constraint().unwrap_or("unknown").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::ObjectNotFound.code(), 101);
        assert_eq!(
            Error::DuplicateValue {
                field: "username".to_string()
            }
            .code(),
            137
        );
        assert_eq!(Error::Internal("boom".to_string()).code(), 1);
        assert_eq!(
            Error::Translation(TranslationError::InvalidQuery("x".to_string())).code(),
            102
        );
    }
}
