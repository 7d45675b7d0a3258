//! The PostgreSQL storage adapter: CRUD over class tables, schema
//! bookkeeping in `_SCHEMA`, and the DDL that keeps tables in step with
//! class schemas.

use sqlx::PgPool;

use query_engine_metadata::metadata::{
    ClassSchema, FieldType, READ_PERM_COLUMN, SCHEMA_TABLE, VOLATILE_CLASSES, WRITE_PERM_COLUMN,
};
use query_engine_sql::sql::ast::{
    ColumnName, Delete, Expression, Insert, Returning, TableName, Update, Value, Where,
};
use query_engine_sql::sql::helpers;
use query_engine_sql::sql::string::{DDL, SQL};
use query_engine_translation::translation::query::{fields, filtering, QueryOptions};
use query_engine_translation::translation::update::translate_update;
use query_engine_translation::translation::{query, values, wire};

use crate::error::{Error, TranslationError};
use crate::metrics::Metrics;
use crate::{aggregate, query as exec, row};

pub type JsonObject = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct PostgresAdapter {
    pub pool: PgPool,
    pub metrics: Metrics,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool, metrics: Metrics) -> Self {
        PostgresAdapter { pool, metrics }
    }

    // reads //

    /// Run a find and decode the matching rows to wire objects. A class
    /// whose table was never created matches nothing.
    pub async fn find(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        options: &QueryOptions,
    ) -> Result<Vec<JsonObject>, Error> {
        let select = query::translate(schema, where_, options)?;
        let mut sql = SQL::new();
        select.to_sql(&mut sql);
        let rows = match exec::fetch_all(&self.pool, &sql).await {
            Ok(rows) => rows,
            Err(error) if error.is_undefined_table() => return Ok(vec![]),
            Err(error) => return Err(error),
        };
        self.metrics.query_total.inc();
        rows.iter().map(|r| row::row_to_object(schema, r)).collect()
    }

    /// Count matching rows.
    pub async fn count(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<i64, Error> {
        let predicate = read_predicate(schema, where_, acl)?;
        let mut sql = SQL::new();
        sql.append_syntax("SELECT count(*) FROM ");
        sql.append_identifier(&schema.class_name);
        Where(predicate).to_sql(&mut sql);
        let row = match exec::fetch_optional(&self.pool, &sql).await {
            Ok(row) => row,
            Err(error) if error.is_undefined_table() => return Ok(0),
            Err(error) => return Err(error),
        };
        self.metrics.query_total.inc();
        match row {
            None => Ok(0),
            Some(row) => {
                use sqlx::Row;
                row.try_get::<i64, _>(0)
                    .map_err(|e| Error::Internal(e.to_string()))
            }
        }
    }

    /// Distinct values of a field (or nested path) among matching rows.
    pub async fn distinct(
        &self,
        schema: &ClassSchema,
        field: &str,
        where_: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let predicate = read_predicate(schema, where_, acl)?;
        let mut sql = SQL::new();
        sql.append_syntax("SELECT DISTINCT ");
        distinct_target(schema, field).to_sql(&mut sql);
        sql.append_syntax(" AS ");
        sql.append_identifier("distinct");
        sql.append_syntax(" FROM ");
        sql.append_identifier(&schema.class_name);
        Where(predicate).to_sql(&mut sql);
        let rows = match exec::fetch_all(&self.pool, &sql).await {
            Ok(rows) => rows,
            Err(error) if error.is_undefined_table() => return Ok(vec![]),
            Err(error) => return Err(error),
        };
        self.metrics.query_total.inc();
        let field_type = schema.field(field);
        let mut results = vec![];
        for r in &rows {
            let Some(native) = row::decode_loose(r, "distinct") else {
                continue;
            };
            if let Some(value) = values::decode_field(field, field_type, native) {
                results.push(value);
            }
        }
        Ok(results)
    }

    /// Run an aggregation pipeline.
    pub async fn aggregate(
        &self,
        schema: &ClassSchema,
        pipeline: &[serde_json::Value],
        acl: Option<&[String]>,
    ) -> Result<Vec<JsonObject>, Error> {
        let result = aggregate::execute(&self.pool, schema, pipeline, acl).await?;
        self.metrics.query_total.inc();
        Ok(result)
    }

    // writes //

    /// Insert one object and return it as stored.
    pub async fn create_object(
        &self,
        schema: &ClassSchema,
        object: &JsonObject,
    ) -> Result<JsonObject, Error> {
        let mut columns = vec![];
        let mut exprs = vec![];
        for (field, value) in object {
            let (column, expr) = write_expression(schema, field, value)?;
            columns.push(column);
            exprs.push(expr);
        }
        let insert = Insert {
            table: TableName(schema.class_name.clone()),
            columns,
            values: exprs,
            returning: Returning::Projection(fields::projection(schema, None, None)?),
        };
        let mut sql = SQL::new();
        insert.to_sql(&mut sql);
        let row = exec::fetch_optional(&self.pool, &sql)
            .await?
            .ok_or(Error::ObjectNotFound)?;
        self.metrics.write_total.inc();
        row::row_to_object(schema, &row)
    }

    /// Apply an update document to every row matching the query and
    /// return the rewritten rows.
    pub async fn update_objects_by_query(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        update_doc: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<Vec<JsonObject>, Error> {
        let set = translate_update(schema, update_doc)?;
        if set.is_empty() {
            return Err(
                TranslationError::InvalidQuery("no update operations given".to_string()).into(),
            );
        }
        let predicate = write_predicate(schema, where_, acl)?;
        let update = Update {
            table: TableName(schema.class_name.clone()),
            set,
            where_: Where(predicate),
            returning: Returning::Projection(fields::projection(schema, None, None)?),
        };
        let mut sql = SQL::new();
        update.to_sql(&mut sql);
        let rows = exec::fetch_all(&self.pool, &sql).await?;
        self.metrics.write_total.inc();
        rows.iter().map(|r| row::row_to_object(schema, r)).collect()
    }

    /// Update matching rows and return the first, failing when nothing
    /// matched.
    pub async fn find_one_and_update(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        update_doc: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<JsonObject, Error> {
        let mut updated = self
            .update_objects_by_query(schema, where_, update_doc, acl)
            .await?;
        if updated.is_empty() {
            return Err(Error::ObjectNotFound);
        }
        Ok(updated.swap_remove(0))
    }

    /// Update the object matching the query, creating it when absent.
    /// A create that loses a race against a concurrent insert falls
    /// back to updating the winner.
    pub async fn upsert_one_object(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        update_doc: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<JsonObject, Error> {
        match self
            .find_one_and_update(schema, where_, update_doc, acl)
            .await
        {
            Ok(object) => Ok(object),
            Err(Error::ObjectNotFound) => {
                let initial = initial_object(where_, update_doc);
                match self.create_object(schema, &initial).await {
                    Ok(object) => Ok(object),
                    Err(Error::DuplicateValue { .. }) => {
                        self.find_one_and_update(schema, where_, update_doc, acl)
                            .await
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Delete every matching row, failing when nothing matched.
    pub async fn delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        where_: &JsonObject,
        acl: Option<&[String]>,
    ) -> Result<u64, Error> {
        let delete = Delete {
            table: TableName(schema.class_name.clone()),
            where_: Where(write_predicate(schema, where_, acl)?),
        };
        let mut sql = SQL::new();
        delete.to_sql(&mut sql);
        let deleted = match exec::execute(&self.pool, &sql).await {
            Ok(count) => count,
            Err(error) if error.is_undefined_table() => 0,
            Err(error) => return Err(error),
        };
        if deleted == 0 {
            return Err(Error::ObjectNotFound);
        }
        self.metrics.write_total.inc();
        Ok(deleted)
    }

    // schema bookkeeping //

    /// Create the `_SCHEMA` bookkeeping table if missing.
    pub async fn ensure_schema_table(&self) -> Result<(), Error> {
        let mut sql = SQL::new();
        sql.append_syntax("CREATE TABLE IF NOT EXISTS ");
        sql.append_identifier(SCHEMA_TABLE);
        sql.append_syntax(
            " (\"className\" varchar(120), \"schema\" jsonb, \"isParseClass\" bool, \
             PRIMARY KEY (\"className\"))",
        );
        exec::run_ddl(&self.pool, &DDL(sql)).await
    }

    /// All stored class schemas.
    pub async fn get_all_classes(&self) -> Result<Vec<ClassSchema>, Error> {
        let mut sql = SQL::new();
        sql.append_syntax("SELECT \"schema\" FROM ");
        sql.append_identifier(SCHEMA_TABLE);
        let rows = match exec::fetch_all(&self.pool, &sql).await {
            Ok(rows) => rows,
            Err(error) if error.is_undefined_table() => {
                self.ensure_schema_table().await?;
                return Ok(vec![]);
            }
            Err(error) => return Err(error),
        };
        let mut classes = vec![];
        for r in &rows {
            use sqlx::Row;
            let value: serde_json::Value = r
                .try_get("schema")
                .map_err(|e| Error::Internal(e.to_string()))?;
            let class: ClassSchema = serde_json::from_value(value)
                .map_err(|e| Error::Internal(format!("corrupt schema row: {}", e)))?;
            classes.push(class);
        }
        Ok(classes)
    }

    /// One stored class schema.
    pub async fn get_class(&self, class_name: &str) -> Result<Option<ClassSchema>, Error> {
        let mut sql = SQL::new();
        sql.append_syntax("SELECT \"schema\" FROM ");
        sql.append_identifier(SCHEMA_TABLE);
        sql.append_syntax(" WHERE \"className\" = ");
        sql.append_param(query_engine_sql::sql::string::Param::String(
            class_name.to_string(),
        ));
        let row = match exec::fetch_optional(&self.pool, &sql).await {
            Ok(row) => row,
            Err(error) if error.is_undefined_table() => return Ok(None),
            Err(error) => return Err(error),
        };
        match row {
            None => Ok(None),
            Some(r) => {
                use sqlx::Row;
                let value: serde_json::Value = r
                    .try_get("schema")
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let class = serde_json::from_value(value)
                    .map_err(|e| Error::Internal(format!("corrupt schema row: {}", e)))?;
                Ok(Some(class))
            }
        }
    }

    /// Create a class: its table, its relation join tables, and its
    /// `_SCHEMA` row.
    pub async fn create_class(&self, schema: &ClassSchema) -> Result<(), Error> {
        self.ensure_schema_table().await?;
        self.create_table(schema).await?;
        let insert = Insert {
            table: TableName(SCHEMA_TABLE.to_string()),
            columns: vec![
                ColumnName("className".to_string()),
                ColumnName("schema".to_string()),
                ColumnName("isParseClass".to_string()),
            ],
            values: vec![
                Expression::Value(Value::String(schema.class_name.clone())),
                Expression::Value(Value::Json(
                    serde_json::to_value(schema).map_err(|e| Error::Internal(e.to_string()))?,
                )),
                Expression::Value(Value::Bool(true)),
            ],
            returning: Returning::Nothing,
        };
        let mut sql = SQL::new();
        insert.to_sql(&mut sql);
        exec::execute(&self.pool, &sql).await?;
        Ok(())
    }

    /// Persist a schema change for an existing class.
    pub async fn save_class(&self, schema: &ClassSchema) -> Result<(), Error> {
        let update = Update {
            table: TableName(SCHEMA_TABLE.to_string()),
            set: vec![(
                ColumnName("schema".to_string()),
                Expression::Value(Value::Json(
                    serde_json::to_value(schema).map_err(|e| Error::Internal(e.to_string()))?,
                )),
            )],
            where_: Where(helpers::column_equals(
                "className",
                Value::String(schema.class_name.clone()),
            )),
            returning: Returning::Nothing,
        };
        let mut sql = SQL::new();
        update.to_sql(&mut sql);
        exec::execute(&self.pool, &sql).await?;
        Ok(())
    }

    /// Create the table backing a class, plus a join table per relation
    /// field.
    pub async fn create_table(&self, schema: &ClassSchema) -> Result<(), Error> {
        exec::run_ddl(&self.pool, &table_definition(schema)).await?;

        for (name, field_type) in &schema.fields {
            if matches!(field_type, FieldType::Relation { .. }) {
                self.create_join_table(schema, name).await?;
            }
        }
        Ok(())
    }

    async fn create_join_table(&self, schema: &ClassSchema, field: &str) -> Result<(), Error> {
        let mut sql = SQL::new();
        sql.append_syntax("CREATE TABLE IF NOT EXISTS ");
        sql.append_identifier(&schema.join_table_name(field));
        sql.append_syntax(
            " (\"relatedId\" varchar(120), \"owningId\" varchar(120), \
             PRIMARY KEY (\"relatedId\", \"owningId\"))",
        );
        exec::run_ddl(&self.pool, &DDL(sql)).await
    }

    /// Add a column for a new field, or the join table for a new
    /// relation field.
    pub async fn add_field_if_not_exists(
        &self,
        schema: &ClassSchema,
        field: &str,
        field_type: &FieldType,
    ) -> Result<(), Error> {
        match field_type.postgres_type() {
            None => self.create_join_table(schema, field).await,
            Some(native) => {
                let mut sql = SQL::new();
                sql.append_syntax("ALTER TABLE ");
                sql.append_identifier(&schema.class_name);
                sql.append_syntax(" ADD COLUMN IF NOT EXISTS ");
                sql.append_identifier(field);
                sql.append_syntax(" ");
                sql.append_syntax(native);
                exec::run_ddl(&self.pool, &DDL(sql)).await
            }
        }
    }

    /// Drop a class: its table, its join tables, and its `_SCHEMA` row.
    pub async fn delete_class(&self, schema: &ClassSchema) -> Result<(), Error> {
        for (name, field_type) in &schema.fields {
            if matches!(field_type, FieldType::Relation { .. }) {
                let mut sql = SQL::new();
                sql.append_syntax("DROP TABLE IF EXISTS ");
                sql.append_identifier(&schema.join_table_name(name));
                exec::run_ddl(&self.pool, &DDL(sql)).await?;
            }
        }
        let mut sql = SQL::new();
        sql.append_syntax("DROP TABLE IF EXISTS ");
        sql.append_identifier(&schema.class_name);
        exec::run_ddl(&self.pool, &DDL(sql)).await?;

        let mut sql = SQL::new();
        sql.append_syntax("DELETE FROM ");
        sql.append_identifier(SCHEMA_TABLE);
        sql.append_syntax(" WHERE \"className\" = ");
        sql.append_param(query_engine_sql::sql::string::Param::String(
            schema.class_name.clone(),
        ));
        match exec::execute(&self.pool, &sql).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_undefined_table() => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Drop columns (or join tables) for removed fields.
    pub async fn delete_fields(
        &self,
        schema: &ClassSchema,
        removed: &[(String, FieldType)],
    ) -> Result<(), Error> {
        for (field, field_type) in removed {
            if field_type.postgres_type().is_none() {
                let mut sql = SQL::new();
                sql.append_syntax("DROP TABLE IF EXISTS ");
                sql.append_identifier(&schema.join_table_name(field));
                exec::run_ddl(&self.pool, &DDL(sql)).await?;
            } else {
                let mut sql = SQL::new();
                sql.append_syntax("ALTER TABLE ");
                sql.append_identifier(&schema.class_name);
                sql.append_syntax(" DROP COLUMN IF EXISTS ");
                sql.append_identifier(field);
                exec::run_ddl(&self.pool, &DDL(sql)).await?;
            }
        }
        Ok(())
    }

    /// Back a uniqueness requirement with a unique index over the given
    /// fields. Existing conflicting rows surface as a duplicate value.
    pub async fn ensure_uniqueness(
        &self,
        schema: &ClassSchema,
        field_names: &[String],
    ) -> Result<(), Error> {
        let mut sorted: Vec<&str> = field_names.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut sql = SQL::new();
        sql.append_syntax("CREATE UNIQUE INDEX IF NOT EXISTS ");
        sql.append_identifier(&unique_index_name(&schema.class_name, &sorted));
        sql.append_syntax(" ON ");
        sql.append_identifier(&schema.class_name);
        sql.append_syntax(" (");
        for (index, field) in sorted.iter().enumerate() {
            sql.append_identifier(field);
            if index < sorted.len() - 1 {
                sql.append_syntax(", ");
            }
        }
        sql.append_syntax(")");
        exec::run_ddl(&self.pool, &DDL(sql)).await
    }

    /// Create the named indexes, each over the columns listed in its key
    /// map. The whole batch runs in one transaction so a failing index
    /// leaves nothing behind.
    pub async fn create_indexes(
        &self,
        schema: &ClassSchema,
        indexes: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for (name, key) in indexes {
            let Some(columns) = key.as_object().filter(|columns| !columns.is_empty()) else {
                return Err(Error::Translation(TranslationError::InvalidQuery(format!(
                    "invalid index key for {name}"
                ))));
            };
            let mut sql = SQL::new();
            sql.append_syntax("CREATE INDEX IF NOT EXISTS ");
            sql.append_identifier(name);
            sql.append_syntax(" ON ");
            sql.append_identifier(&schema.class_name);
            sql.append_syntax(" (");
            for (index, column) in columns.keys().enumerate() {
                sql.append_identifier(column);
                if index < columns.len() - 1 {
                    sql.append_syntax(", ");
                }
            }
            sql.append_syntax(")");
            sqlx::query(&sql.sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop the named indexes in one transaction.
    pub async fn drop_indexes(&self, names: &[String]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            let mut sql = SQL::new();
            sql.append_syntax("DROP INDEX IF EXISTS ");
            sql.append_identifier(name);
            sqlx::query(&sql.sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Install the SQL helper functions the compiled statements call and
    /// bring the volatile system classes up to date. Failures are logged
    /// and swallowed so a read-only database can still serve queries.
    pub async fn perform_initialization(&self) -> Result<(), Error> {
        self.ensure_schema_table().await?;
        for (name, body) in HELPER_FUNCTIONS {
            let mut sql = SQL::new();
            sql.append_syntax(body);
            if let Err(error) = exec::run_ddl(&self.pool, &DDL(sql)).await {
                tracing::warn!(function = name, %error, "failed to install helper function");
            }
        }
        for class_name in VOLATILE_CLASSES {
            if let Err(error) = self.upgrade_volatile_class(class_name).await {
                tracing::warn!(class = class_name, %error, "failed to upgrade system class");
            }
        }
        Ok(())
    }

    /// Create or refresh one volatile system class. A concurrent starter
    /// racing us to the `_SCHEMA` insert is harmless.
    async fn upgrade_volatile_class(&self, class_name: &str) -> Result<(), Error> {
        let schema = ClassSchema::new(class_name);
        match self.get_class(class_name).await? {
            None => match self.create_class(&schema).await {
                Err(Error::DuplicateValue { .. }) => Ok(()),
                other => other,
            },
            // CREATE TABLE IF NOT EXISTS backfills a dropped table
            Some(stored) => self.create_table(&stored).await,
        }
    }
}

/// Identifier names are capped at 63 bytes; a hash keeps long field
/// lists within bounds.
fn unique_index_name(class_name: &str, sorted_fields: &[&str]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    sorted_fields.hash(&mut hasher);
    format!("unique_{}_{:x}", class_name, hasher.finish())
}

/// The CREATE TABLE statement backing a class. Relation fields have no
/// column; they live in join tables.
fn table_definition(schema: &ClassSchema) -> DDL {
    let mut sql = SQL::new();
    sql.append_syntax("CREATE TABLE IF NOT EXISTS ");
    sql.append_identifier(&schema.class_name);
    sql.append_syntax(" (");
    let mut first = true;
    for (name, field_type) in &schema.fields {
        let Some(native) = field_type.postgres_type() else {
            continue;
        };
        if !first {
            sql.append_syntax(", ");
        }
        first = false;
        sql.append_identifier(name);
        sql.append_syntax(" ");
        sql.append_syntax(native);
    }
    sql.append_syntax(", ");
    sql.append_identifier(READ_PERM_COLUMN);
    sql.append_syntax(" text[], ");
    sql.append_identifier(WRITE_PERM_COLUMN);
    sql.append_syntax(" text[], PRIMARY KEY (\"objectId\"))");
    DDL(sql)
}

fn read_predicate(
    schema: &ClassSchema,
    where_: &JsonObject,
    acl: Option<&[String]>,
) -> Result<Expression, Error> {
    let compiled = filtering::translate_where(schema, where_)?;
    Ok(match acl {
        None => compiled.expression,
        Some(acl) => Expression::And {
            left: Box::new(compiled.expression),
            right: Box::new(filtering::read_access_expression(acl)),
        },
    })
}

fn write_predicate(
    schema: &ClassSchema,
    where_: &JsonObject,
    acl: Option<&[String]>,
) -> Result<Expression, Error> {
    let compiled = filtering::translate_where(schema, where_)?;
    Ok(match acl {
        None => compiled.expression,
        Some(acl) => Expression::And {
            left: Box::new(compiled.expression),
            right: Box::new(filtering::write_access_expression(acl)),
        },
    })
}

/// The DISTINCT target: nested paths descend into json, geo columns
/// come back as text.
fn distinct_target(schema: &ClassSchema, field: &str) -> Expression {
    match field.split_once('.') {
        Some((column, rest)) => Expression::JsonPath {
            column: ColumnName(column.to_string()),
            path: rest.split('.').map(str::to_string).collect(),
            as_text: false,
        },
        None => {
            let column = Expression::ColumnReference(ColumnName(field.to_string()));
            match schema.field(field).and_then(FieldType::postgres_type) {
                Some("point") | Some("polygon") => Expression::Cast {
                    expression: Box::new(column),
                    r#type: query_engine_sql::sql::ast::CastType::Text,
                },
                _ => column,
            }
        }
    }
}

/// The column expression for one field of an object being written.
fn write_expression(
    schema: &ClassSchema,
    field: &str,
    value: &serde_json::Value,
) -> Result<(ColumnName, Expression), Error> {
    if field == READ_PERM_COLUMN || field == WRITE_PERM_COLUMN {
        let principals = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .ok_or_else(|| {
                TranslationError::InvalidJson(format!("{} should be an array", field))
            })?;
        return Ok((
            ColumnName(field.to_string()),
            Expression::Value(Value::StringArray(principals)),
        ));
    }
    let field_type = schema.field(field).ok_or_else(|| {
        TranslationError::InvalidQuery(format!("Column not found: {}", field))
    })?;
    let expr = match field_type {
        FieldType::GeoPoint => match wire::detect(value) {
            Some(wire::WireValue::GeoPoint {
                latitude,
                longitude,
            }) => {
                wire::validate_coordinates(latitude, longitude)?;
                values::geo_point_expression(longitude, latitude)
            }
            _ => {
                return Err(TranslationError::InvalidJson(format!(
                    "expected a GeoPoint for {}",
                    field
                ))
                .into())
            }
        },
        _ => values::encode_column_value(field_type, value)?,
    };
    Ok((ColumnName(field.to_string()), expr))
}

/// The object an upsert creates when the query matched nothing: the
/// query's literal equalities overlaid with the update's assignments.
fn initial_object(where_: &JsonObject, update_doc: &JsonObject) -> JsonObject {
    let mut object = JsonObject::new();
    for (field, value) in where_ {
        if field.starts_with('$') || field.contains('.') {
            continue;
        }
        let is_operator_object = value
            .as_object()
            .is_some_and(|o| o.keys().any(|k| k.starts_with('$')));
        if !is_operator_object {
            object.insert(field.clone(), value.clone());
        }
    }
    for (field, value) in update_doc {
        if field.contains('.') {
            continue;
        }
        match value.get("__op").and_then(|op| op.as_str()) {
            None => {
                object.insert(field.clone(), value.clone());
            }
            Some("Increment") => {
                if let Some(amount) = value.get("amount") {
                    object.insert(field.clone(), amount.clone());
                }
            }
            Some("Add") | Some("AddUnique") => {
                if let Some(objects) = value.get("objects") {
                    object.insert(field.clone(), objects.clone());
                }
            }
            // Delete and Remove have nothing to seed
            Some(_) => {}
        }
    }
    object
}

/// The helper functions installed at startup; compiled statements call
/// these for jsonb array and object manipulation.
const HELPER_FUNCTIONS: &[(&str, &str)] = &[
    (
        "array_add",
        "CREATE OR REPLACE FUNCTION array_add(arr jsonb, to_add jsonb) \
         RETURNS jsonb LANGUAGE sql IMMUTABLE AS $$ \
         SELECT COALESCE(arr, '[]'::jsonb) || to_add; \
         $$;",
    ),
    (
        "array_add_unique",
        "CREATE OR REPLACE FUNCTION array_add_unique(arr jsonb, to_add jsonb) \
         RETURNS jsonb LANGUAGE sql IMMUTABLE AS $$ \
         SELECT COALESCE(arr, '[]'::jsonb) || COALESCE( \
           (SELECT jsonb_agg(elt) FROM jsonb_array_elements(to_add) AS elt \
            WHERE NOT COALESCE(arr, '[]'::jsonb) @> jsonb_build_array(elt)), \
           '[]'::jsonb); \
         $$;",
    ),
    (
        "array_remove",
        "CREATE OR REPLACE FUNCTION array_remove(arr jsonb, to_remove jsonb) \
         RETURNS jsonb LANGUAGE sql IMMUTABLE AS $$ \
         SELECT COALESCE( \
           (SELECT jsonb_agg(elt) FROM jsonb_array_elements(COALESCE(arr, '[]'::jsonb)) AS elt \
            WHERE NOT to_remove @> jsonb_build_array(elt)), \
           '[]'::jsonb); \
         $$;",
    ),
    (
        "array_contains",
        "CREATE OR REPLACE FUNCTION array_contains(arr jsonb, to_check jsonb) \
         RETURNS boolean LANGUAGE sql IMMUTABLE AS $$ \
         SELECT EXISTS ( \
           SELECT 1 FROM jsonb_array_elements(to_check) AS elt \
           WHERE COALESCE(arr, '[]'::jsonb) @> jsonb_build_array(elt)); \
         $$;",
    ),
    (
        "array_contains_all",
        "CREATE OR REPLACE FUNCTION array_contains_all(arr jsonb, to_check jsonb) \
         RETURNS boolean LANGUAGE sql IMMUTABLE AS $$ \
         SELECT NOT EXISTS ( \
           SELECT 1 FROM jsonb_array_elements(to_check) AS elt \
           WHERE NOT COALESCE(arr, '[]'::jsonb) @> jsonb_build_array(elt)); \
         $$;",
    ),
    (
        "array_contains_all_regex",
        "CREATE OR REPLACE FUNCTION array_contains_all_regex(arr jsonb, patterns jsonb) \
         RETURNS boolean LANGUAGE sql IMMUTABLE AS $$ \
         SELECT NOT EXISTS ( \
           SELECT 1 FROM jsonb_array_elements_text(patterns) AS pat \
           WHERE NOT EXISTS ( \
             SELECT 1 FROM jsonb_array_elements_text(COALESCE(arr, '[]'::jsonb)) AS elt \
             WHERE elt ~ pat)); \
         $$;",
    ),
    (
        "json_object_set_key",
        "CREATE OR REPLACE FUNCTION json_object_set_key(object jsonb, key_to_set text, value_to_set jsonb) \
         RETURNS jsonb LANGUAGE sql IMMUTABLE AS $$ \
         SELECT jsonb_set(COALESCE(object, '{}'::jsonb), ARRAY[key_to_set], value_to_set, true); \
         $$;",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_seed_merges_query_equalities_and_update_values() {
        let where_ = serde_json::json!({
            "username": "ada",
            "age": {"$gt": 3},
            "stats.rank": 1,
            "$or": []
        });
        let update_doc = serde_json::json!({
            "score": {"__op": "Increment", "amount": 5},
            "tags": {"__op": "AddUnique", "objects": ["x"]},
            "gone": {"__op": "Delete"},
            "name": "Ada"
        });
        let seed = initial_object(
            where_.as_object().unwrap(),
            update_doc.as_object().unwrap(),
        );
        assert_eq!(seed["username"], "ada");
        assert_eq!(seed["score"], 5);
        assert_eq!(seed["tags"], serde_json::json!(["x"]));
        assert_eq!(seed["name"], "Ada");
        assert!(!seed.contains_key("age"));
        assert!(!seed.contains_key("gone"));
        assert!(!seed.contains_key("$or"));
    }

    #[test]
    fn unique_index_names_are_stable_and_order_insensitive() {
        let a = unique_index_name("Player", &["email", "username"]);
        let b = unique_index_name("Player", &["email", "username"]);
        assert_eq!(a, b);
        assert!(a.starts_with("unique_Player_"));
    }

    #[test]
    fn every_volatile_class_gets_a_creatable_table() {
        for class_name in VOLATILE_CLASSES {
            let ddl = table_definition(&ClassSchema::new(class_name));
            assert!(ddl.0.sql.starts_with("CREATE TABLE IF NOT EXISTS"));
            assert!(ddl.0.sql.contains(&format!("\"{}\"", class_name)));
            assert!(ddl.0.sql.ends_with("PRIMARY KEY (\"objectId\"))"));
        }
    }

    #[test]
    fn acl_columns_bind_as_text_arrays() {
        let schema = ClassSchema::new("Player");
        let value = serde_json::json!(["*", "u1"]);
        let (column, expr) = write_expression(&schema, "_rperm", &value).unwrap();
        assert_eq!(column.0, "_rperm");
        assert_eq!(
            expr,
            Expression::Value(Value::StringArray(vec![
                "*".to_string(),
                "u1".to_string()
            ]))
        );
    }
}
