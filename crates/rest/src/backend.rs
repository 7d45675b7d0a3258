//! The storage seam the query executor runs against.

use async_trait::async_trait;

use query_engine_execution::adapter::{JsonObject, PostgresAdapter};
use query_engine_execution::error::Error;
use query_engine_metadata::metadata::ClassSchema;
use query_engine_translation::translation::query::QueryOptions;

/// The storage operations a read query needs. The Postgres adapter is the
/// production implementation; tests substitute an in-memory fake.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn find(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        options: &QueryOptions,
    ) -> Result<Vec<JsonObject>, Error>;

    async fn count(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<i64, Error>;

    async fn get_class(&self, class_name: &str) -> Result<Option<ClassSchema>, Error>;
}

#[async_trait]
impl Backend for PostgresAdapter {
    async fn find(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        options: &QueryOptions,
    ) -> Result<Vec<JsonObject>, Error> {
        PostgresAdapter::find(self, schema, where_, options).await
    }

    async fn count(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<i64, Error> {
        PostgresAdapter::count(self, schema, where_, acl).await
    }

    async fn get_class(&self, class_name: &str) -> Result<Option<ClassSchema>, Error> {
        PostgresAdapter::get_class(self, class_name).await
    }
}
