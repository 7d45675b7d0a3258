//! Metadata information regarding classes and tracked information.

pub mod database;

// re-export without modules
pub use database::*;
