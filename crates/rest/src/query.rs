//! The lifecycle of one REST-level find:
//! constructed, ACL-resolved, subqueries resolved to fixpoint, found,
//! counted, included, after-find-triggered.

use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde_json::Value;

use query_engine_execution::adapter::JsonObject;
use query_engine_execution::error::{Error, TranslationError};
use query_engine_metadata::metadata::{ClassSchema, FieldType};
use query_engine_translation::translation::query::QueryOptions;

use crate::auth::{self, Auth};
use crate::backend::Backend;
use crate::include;
use crate::triggers::AfterFind;

/// How deep subqueries may nest before resolution is abandoned. Cyclic or
/// pathological `$inQuery` chains would otherwise recurse without bound.
pub const MAX_SUBQUERY_DEPTH: usize = 16;

/// Options shaping a find beyond the constraint tree.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Restrict the projection to these fields.
    pub keys: Option<Vec<String>>,
    /// Dotted pointer paths to expand into full objects.
    pub include: Vec<String>,
    /// Expand every pointer field declared in the schema.
    pub include_all: bool,
    /// Also run a count of all matching rows, ignoring limit and skip.
    pub count: bool,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// `{field: 1 | -1}` sort specification, in significance order.
    pub sort: IndexMap<String, i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindResponse {
    pub results: Vec<JsonObject>,
    pub count: Option<i64>,
}

/// One read query, bound to a backend and a caller identity.
pub struct RestQuery<'a, B: Backend> {
    backend: &'a B,
    class_name: String,
    where_: JsonObject,
    options: FindOptions,
    acl: Option<Vec<String>>,
    after_find: Option<&'a dyn AfterFind>,
}

impl<'a, B: Backend> RestQuery<'a, B> {
    pub async fn new(
        backend: &'a B,
        auth: &dyn Auth,
        class_name: impl Into<String>,
        where_: JsonObject,
        options: FindOptions,
    ) -> Result<RestQuery<'a, B>, Error> {
        let acl = auth::acl_for(auth).await?;
        Ok(RestQuery {
            backend,
            class_name: class_name.into(),
            where_,
            options,
            acl,
            after_find: None,
        })
    }

    #[must_use]
    pub fn with_after_find(mut self, trigger: &'a dyn AfterFind) -> Self {
        self.after_find = Some(trigger);
        self
    }

    pub async fn execute(self) -> Result<FindResponse, Error> {
        self.execute_at_depth(0).await
    }

    // Subquery resolution re-enters the whole lifecycle, so the future has
    // to be boxed to have a size.
    fn execute_at_depth(
        mut self,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<FindResponse, Error>> + Send + 'a>> {
        Box::pin(async move {
            if depth >= MAX_SUBQUERY_DEPTH {
                tracing::warn!(class = %self.class_name, depth, "subquery depth limit reached");
                return Err(invalid_query("subqueries nested too deeply"));
            }
            tracing::debug!(class = %self.class_name, depth, "executing find");

            self.resolve_subqueries(depth).await?;

            let Some(schema) = self.backend.get_class(&self.class_name).await? else {
                // a class that was never written to matches nothing
                tracing::debug!(class = %self.class_name, "class has no schema");
                return Ok(FindResponse {
                    results: vec![],
                    count: self.options.count.then_some(0),
                });
            };

            let include = self.include_paths(&schema);
            let mut results = self
                .backend
                .find(&schema, &self.where_, &self.find_query_options(&include))
                .await?;

            let count = if self.options.count {
                Some(
                    self.backend
                        .count(&schema, &self.where_, self.acl.as_deref())
                        .await?,
                )
            } else {
                None
            };

            if !include.is_empty() {
                include::expand(self.backend, &include, &mut results, self.acl.as_deref())
                    .await?;
            }

            if let Some(trigger) = self.after_find {
                results = trigger.after_find(&self.class_name, results).await?;
            }

            Ok(FindResponse { results, count })
        })
    }

    /// Replace subquery markers with materialized `$in`/`$nin` lists until
    /// none remain. Each pass resolves the first marker found, then the tree
    /// is searched again, because a resolved subquery may have exposed a
    /// marker at a different depth.
    async fn resolve_subqueries(&mut self, depth: usize) -> Result<(), Error> {
        loop {
            let mut root = Value::Object(std::mem::take(&mut self.where_));
            let Some(site) = find_first_subquery(&root) else {
                self.where_ = into_object(root);
                return Ok(());
            };
            let replacement = self.resolve_one(&site, depth).await;
            match replacement {
                Ok(values) => {
                    let replaced = replace_first_subquery(
                        &mut root,
                        site.operator,
                        Value::Array(values),
                    );
                    debug_assert!(replaced);
                    self.where_ = into_object(root);
                }
                Err(error) => {
                    self.where_ = into_object(root);
                    return Err(error);
                }
            }
        }
    }

    /// Execute one subquery marker and produce the list to splice in.
    async fn resolve_one(&self, site: &SubquerySite, depth: usize) -> Result<Vec<Value>, Error> {
        tracing::debug!(operator = site.operator, depth, "resolving subquery");
        match site.operator {
            "$inQuery" | "$notInQuery" => {
                let (class_name, where_) = query_spec(&site.spec, site.operator)?;
                let results = self
                    .subquery_results(class_name.clone(), where_, vec!["objectId".to_string()], depth)
                    .await?;
                Ok(results
                    .iter()
                    .filter_map(|object| object.get("objectId"))
                    .filter_map(Value::as_str)
                    .map(|object_id| pointer(&class_name, object_id))
                    .collect())
            }
            "$select" | "$dontSelect" => {
                let spec = site
                    .spec
                    .as_object()
                    .ok_or_else(|| improper_usage(site.operator))?;
                let key = spec
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| improper_usage(site.operator))?;
                let query = spec.get("query").ok_or_else(|| improper_usage(site.operator))?;
                let (class_name, where_) = query_spec(query, site.operator)?;
                let root_key = key.split('.').next().unwrap_or(key).to_string();
                let results = self
                    .subquery_results(class_name, where_, vec![root_key], depth)
                    .await?;
                Ok(results
                    .iter()
                    .filter_map(|object| value_at_path(object, key))
                    .collect())
            }
            other => Err(improper_usage(other)),
        }
    }

    async fn subquery_results(
        &self,
        class_name: String,
        where_: JsonObject,
        keys: Vec<String>,
        depth: usize,
    ) -> Result<Vec<JsonObject>, Error> {
        let subquery = RestQuery {
            backend: self.backend,
            class_name,
            where_,
            options: FindOptions {
                keys: Some(keys),
                ..FindOptions::default()
            },
            acl: self.acl.clone(),
            after_find: None,
        };
        let response = subquery.execute_at_depth(depth + 1).await?;
        Ok(response.results)
    }

    /// The include set, shortest paths first, with every prefix of a dotted
    /// path present so parents are materialized before their children.
    fn include_paths(&self, schema: &ClassSchema) -> Vec<Vec<String>> {
        let mut paths: Vec<Vec<String>> = vec![];
        let mut add = |path: Vec<String>| {
            if !paths.contains(&path) {
                paths.push(path);
            }
        };
        if self.options.include_all {
            for (name, field) in &schema.fields {
                if matches!(field, FieldType::Pointer { .. }) {
                    add(vec![name.clone()]);
                }
            }
        }
        for dotted in &self.options.include {
            let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
            for prefix_len in 1..=segments.len() {
                add(segments[..prefix_len].to_vec());
            }
        }
        paths.sort_by_key(|path| path.len());
        paths
    }

    /// Keys restricted by the caller still have to cover the roots of the
    /// include paths, or there would be no pointers left to expand.
    fn find_query_options(&self, include: &[Vec<String>]) -> QueryOptions {
        let keys = self.options.keys.as_ref().map(|keys| {
            let mut keys = keys.clone();
            for path in include {
                if !keys.contains(&path[0]) {
                    keys.push(path[0].clone());
                }
            }
            keys
        });
        QueryOptions {
            sort: self.options.sort.clone(),
            keys,
            limit: self.options.limit,
            skip: self.options.skip,
            acl: self.acl.clone(),
        }
    }
}

const SUBQUERY_OPERATORS: [&str; 4] = ["$inQuery", "$notInQuery", "$select", "$dontSelect"];

struct SubquerySite {
    operator: &'static str,
    spec: Value,
}

/// Depth-first search for the first subquery marker anywhere in the tree.
fn find_first_subquery(value: &Value) -> Option<SubquerySite> {
    match value {
        Value::Object(map) => {
            for (key, entry) in map {
                if let Some(operator) = SUBQUERY_OPERATORS
                    .iter()
                    .copied()
                    .find(|operator| *operator == key.as_str())
                {
                    return Some(SubquerySite {
                        operator,
                        spec: entry.clone(),
                    });
                }
                if let Some(found) = find_first_subquery(entry) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_first_subquery),
        _ => None,
    }
}

/// Replace the first occurrence of `operator` with the equivalent membership
/// constraint. Mirrors the search order of [`find_first_subquery`].
fn replace_first_subquery(value: &mut Value, operator: &str, replacement: Value) -> bool {
    match value {
        Value::Object(map) => {
            if map.contains_key(operator) {
                map.remove(operator);
                let target = match operator {
                    "$inQuery" | "$select" => "$in",
                    _ => "$nin",
                };
                map.insert(target.to_string(), replacement);
                return true;
            }
            for (_, entry) in map.iter_mut() {
                if replace_first_subquery(entry, operator, replacement.clone()) {
                    return true;
                }
            }
            false
        }
        Value::Array(items) => items
            .iter_mut()
            .any(|item| replace_first_subquery(item, operator, replacement.clone())),
        _ => false,
    }
}

/// Extract `className` and `where` from a subquery specification.
fn query_spec(spec: &Value, operator: &str) -> Result<(String, JsonObject), Error> {
    let spec = spec.as_object().ok_or_else(|| improper_usage(operator))?;
    let class_name = spec
        .get("className")
        .and_then(Value::as_str)
        .ok_or_else(|| improper_usage(operator))?;
    let where_ = spec
        .get("where")
        .and_then(Value::as_object)
        .ok_or_else(|| improper_usage(operator))?;
    Ok((class_name.to_string(), where_.clone()))
}

fn value_at_path(object: &JsonObject, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = object.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn pointer(class_name: &str, object_id: &str) -> Value {
    serde_json::json!({
        "__type": "Pointer",
        "className": class_name,
        "objectId": object_id,
    })
}

fn into_object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

fn improper_usage(operator: &str) -> Error {
    invalid_query(format!("improper usage of {operator}"))
}

fn invalid_query(message: impl Into<String>) -> Error {
    Error::Translation(TranslationError::InvalidQuery(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Master;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// A backend serving canned rows per class, recording the queries made.
    #[derive(Default)]
    struct FakeBackend {
        rows: std::collections::BTreeMap<String, Vec<JsonObject>>,
        queries: Mutex<Vec<(String, Value)>>,
    }

    impl FakeBackend {
        fn with_rows(rows: &[(&str, Value)]) -> Self {
            let mut backend = FakeBackend::default();
            for (class, row) in rows {
                backend
                    .rows
                    .entry((*class).to_string())
                    .or_default()
                    .push(into_object(row.clone()));
            }
            backend
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn find(
            &self,
            schema: &ClassSchema,
            where_: &JsonObject,
            _options: &QueryOptions,
        ) -> Result<Vec<JsonObject>, Error> {
            self.queries
                .lock()
                .unwrap()
                .push((schema.class_name.clone(), Value::Object(where_.clone())));
            Ok(self.rows.get(&schema.class_name).cloned().unwrap_or_default())
        }

        async fn count(
            &self,
            schema: &ClassSchema,
            _where_: &JsonObject,
            _acl: Option<&[String]>,
        ) -> Result<i64, Error> {
            Ok(self
                .rows
                .get(&schema.class_name)
                .map_or(0, |rows| rows.len() as i64))
        }

        async fn get_class(&self, class_name: &str) -> Result<Option<ClassSchema>, Error> {
            Ok(Some(ClassSchema::new(class_name)))
        }
    }

    fn where_of(value: Value) -> JsonObject {
        into_object(value)
    }

    #[tokio::test]
    async fn in_query_resolves_to_a_pointer_list() {
        let backend = FakeBackend::with_rows(&[
            ("User", serde_json::json!({"objectId": "u1"})),
            ("User", serde_json::json!({"objectId": "u2"})),
        ]);
        let where_ = where_of(serde_json::json!({
            "owner": {"$inQuery": {"where": {}, "className": "User"}}
        }));

        let query = RestQuery::new(&backend, &Master, "Game", where_, FindOptions::default())
            .await
            .unwrap();
        query.execute().await.unwrap();

        let queries = backend.queries.lock().unwrap();
        // subquery first, then the rewritten parent query
        assert_eq!(queries[0].0, "User");
        assert_eq!(queries[1].0, "Game");
        similar_asserts::assert_eq!(
            queries[1].1,
            serde_json::json!({
                "owner": {"$in": [
                    {"__type": "Pointer", "className": "User", "objectId": "u1"},
                    {"__type": "Pointer", "className": "User", "objectId": "u2"},
                ]}
            })
        );
    }

    #[tokio::test]
    async fn dont_select_resolves_to_nin_of_key_values() {
        let backend = FakeBackend::with_rows(&[
            ("City", serde_json::json!({"objectId": "c1", "name": "Oslo"})),
            ("City", serde_json::json!({"objectId": "c2", "name": "Bergen"})),
        ]);
        let where_ = where_of(serde_json::json!({
            "hometown": {"$dontSelect": {
                "query": {"className": "City", "where": {}},
                "key": "name",
            }}
        }));

        let query = RestQuery::new(&backend, &Master, "Player", where_, FindOptions::default())
            .await
            .unwrap();
        query.execute().await.unwrap();

        let queries = backend.queries.lock().unwrap();
        similar_asserts::assert_eq!(
            queries[1].1,
            serde_json::json!({"hometown": {"$nin": ["Oslo", "Bergen"]}})
        );
    }

    #[tokio::test]
    async fn malformed_in_query_is_rejected() {
        let backend = FakeBackend::default();
        let where_ = where_of(serde_json::json!({
            "owner": {"$inQuery": {"where": {}}}
        }));

        let query = RestQuery::new(&backend, &Master, "Game", where_, FindOptions::default())
            .await
            .unwrap();
        let error = query.execute().await.unwrap_err();

        assert_eq!(error.code(), 102);
    }

    #[tokio::test]
    async fn count_is_reported_when_requested() {
        let backend = FakeBackend::with_rows(&[("Game", serde_json::json!({"objectId": "g1"}))]);
        let options = FindOptions {
            count: true,
            ..FindOptions::default()
        };

        let query = RestQuery::new(&backend, &Master, "Game", JsonObject::new(), options)
            .await
            .unwrap();
        let response = query.execute().await.unwrap();

        assert_eq!(response.count, Some(1));
        assert_eq!(response.results.len(), 1);
    }

    #[test]
    fn include_prefixes_come_before_their_children() {
        let backend = FakeBackend::default();
        let query = RestQuery {
            backend: &backend,
            class_name: "Comment".to_string(),
            where_: JsonObject::new(),
            options: FindOptions {
                include: vec!["post.author".to_string()],
                ..FindOptions::default()
            },
            acl: None,
            after_find: None,
        };
        let paths = query.include_paths(&ClassSchema::new("Comment"));

        assert_eq!(
            paths,
            vec![
                vec!["post".to_string()],
                vec!["post".to_string(), "author".to_string()],
            ]
        );
    }
}
