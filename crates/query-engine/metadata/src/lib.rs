//! Schema metadata for classes stored in the engine.

pub mod metadata;
