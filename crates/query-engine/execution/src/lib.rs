//! Query execution against a PostgreSQL database: statement binding,
//! row decoding, and the storage adapter tying them together.

pub mod adapter;
pub mod aggregate;
pub mod error;
pub mod metrics;
pub mod query;
pub mod row;
