use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A value that is either a string, or a reference to an environment variable
/// holding the string. Secrets are resolved against an
/// [`Environment`](crate::environment::Environment) at startup so that
/// credentials never need to live in the configuration file itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum Secret {
    Plain(String),
    FromEnvironment { variable: String },
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}
