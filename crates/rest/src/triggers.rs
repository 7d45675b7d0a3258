//! Post-read hooks.

use async_trait::async_trait;

use query_engine_execution::adapter::JsonObject;
use query_engine_execution::error::Error;

/// A class-level hook invoked with the materialized results of a plain find.
/// The hook may return a different result set. It is not invoked for
/// aggregate or distinct reads.
#[async_trait]
pub trait AfterFind: Send + Sync {
    async fn after_find(
        &self,
        class_name: &str,
        objects: Vec<JsonObject>,
    ) -> Result<Vec<JsonObject>, Error>;
}
