//! Infrastructure for resolving values from the environment.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("the environment variable is not present: {0}")]
    VariableNotPresent(String),
    #[error("the environment variable value is not valid Unicode: {0}")]
    NonUnicodeValue(String),
}

/// A source of environment variables.
pub trait Environment {
    fn read(&self, variable: &str) -> Result<String, Error>;
}

/// Reads from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn read(&self, variable: &str) -> Result<String, Error> {
        std::env::var(variable).map_err(|error| match error {
            std::env::VarError::NotPresent => Error::VariableNotPresent(variable.to_string()),
            std::env::VarError::NotUnicode(_) => Error::NonUnicodeValue(variable.to_string()),
        })
    }
}

/// An environment with a fixed set of variables, for testing.
#[derive(Debug, Clone, Default)]
pub struct FixedEnvironment(HashMap<String, String>);

impl FixedEnvironment {
    pub fn new(variables: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(variables.into_iter().collect())
    }
}

impl Environment for FixedEnvironment {
    fn read(&self, variable: &str) -> Result<String, Error> {
        self.0
            .get(variable)
            .cloned()
            .ok_or_else(|| Error::VariableNotPresent(variable.to_string()))
    }
}

impl<E: Environment> Environment for &E {
    fn read(&self, variable: &str) -> Result<String, Error> {
        (*self).read(variable)
    }
}
