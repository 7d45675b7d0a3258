//! Structured SQL fragments and their rendering to parameterized statements.

pub mod sql;
