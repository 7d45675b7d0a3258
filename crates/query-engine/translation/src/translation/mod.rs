//! Translate incoming constraint and update trees to SQL to be run
//! against the database.

pub mod error;
pub mod query;
pub mod update;
pub mod values;
pub mod wire;
