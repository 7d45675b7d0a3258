//! Errors that can arise while handling configuration.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ParseConfigurationError {
    #[error("parse error in {file_path}: {message}")]
    ParseError { file_path: PathBuf, message: String },

    #[error("I/O error on {file_path}: {error}")]
    IoError {
        file_path: PathBuf,
        error: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MakeRuntimeConfigurationError {
    #[error("missing environment variable: {0}")]
    MissingEnvironmentVariable(#[from] crate::environment::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InitializationError {
    #[error("unable to initialize connection pool: {0}")]
    UnableToCreatePool(sqlx::Error),

    #[error("error initializing metrics: {0}")]
    MetricsError(query_engine_execution::error::Error),

    #[error("error preparing the database: {0}")]
    SetupError(query_engine_execution::error::Error),
}
