//! Translate wire-format queries and updates into SQL execution plans.

pub mod translation;
