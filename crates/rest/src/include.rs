//! Expansion of pointer fields into full objects.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde_json::Value;

use query_engine_execution::adapter::JsonObject;
use query_engine_execution::error::Error;
use query_engine_translation::translation::query::QueryOptions;

use crate::backend::Backend;

/// Expand the pointers at each include path into the objects they refer to.
///
/// `paths` must be ordered shortest first with every prefix present, so that
/// by the time `foo.bar` is processed, `foo` already holds full objects to
/// descend into. For each path, the pointers found across all rows are
/// grouped by class and fetched with one batched `objectId $in` query per
/// class. Pointers to rows the caller cannot read stay as bare stubs.
pub async fn expand<B: Backend>(
    backend: &B,
    paths: &[Vec<String>],
    results: &mut [JsonObject],
    acl: Option<&[String]>,
) -> Result<(), Error> {
    for path in paths {
        let mut found: IndexMap<String, BTreeSet<String>> = IndexMap::new();
        for object in results.iter() {
            collect_at(object, path, &mut found);
        }
        if found.is_empty() {
            continue;
        }

        let mut fetched: HashMap<(String, String), JsonObject> = HashMap::new();
        for (class_name, object_ids) in found {
            let Some(schema) = backend.get_class(&class_name).await? else {
                continue;
            };
            let ids: Vec<Value> = object_ids.into_iter().map(Value::String).collect();
            let mut where_ = JsonObject::new();
            where_.insert(
                "objectId".to_string(),
                serde_json::json!({ "$in": ids }),
            );
            let options = QueryOptions {
                acl: acl.map(<[String]>::to_vec),
                ..QueryOptions::default()
            };
            for row in backend.find(&schema, &where_, &options).await? {
                if let Some(object_id) = row.get("objectId").and_then(Value::as_str) {
                    fetched.insert((class_name.clone(), object_id.to_string()), row);
                }
            }
        }

        for object in results.iter_mut() {
            splice_at(object, path, &fetched);
        }
    }
    Ok(())
}

fn as_pointer(value: &Value) -> Option<(&str, &str)> {
    let object = value.as_object()?;
    if object.get("__type")?.as_str()? != "Pointer" {
        return None;
    }
    Some((
        object.get("className")?.as_str()?,
        object.get("objectId")?.as_str()?,
    ))
}

fn collect_at(object: &JsonObject, path: &[String], found: &mut IndexMap<String, BTreeSet<String>>) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Some(child) = object.get(head) else {
        return;
    };
    if rest.is_empty() {
        harvest(child, found);
    } else {
        descend(child, rest, found);
    }
}

fn descend(value: &Value, path: &[String], found: &mut IndexMap<String, BTreeSet<String>>) {
    match value {
        Value::Object(map) => collect_at(map, path, found),
        Value::Array(items) => {
            for item in items {
                descend(item, path, found);
            }
        }
        _ => {}
    }
}

fn harvest(value: &Value, found: &mut IndexMap<String, BTreeSet<String>>) {
    match value {
        Value::Array(items) => {
            for item in items {
                harvest(item, found);
            }
        }
        _ => {
            if let Some((class_name, object_id)) = as_pointer(value) {
                found
                    .entry(class_name.to_string())
                    .or_default()
                    .insert(object_id.to_string());
            }
        }
    }
}

fn splice_at(
    object: &mut JsonObject,
    path: &[String],
    fetched: &HashMap<(String, String), JsonObject>,
) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Some(child) = object.get_mut(head) else {
        return;
    };
    if rest.is_empty() {
        splice(child, fetched);
    } else {
        descend_mut(child, rest, fetched);
    }
}

fn descend_mut(value: &mut Value, path: &[String], fetched: &HashMap<(String, String), JsonObject>) {
    match value {
        Value::Object(map) => splice_at(map, path, fetched),
        Value::Array(items) => {
            for item in items {
                descend_mut(item, path, fetched);
            }
        }
        _ => {}
    }
}

fn splice(value: &mut Value, fetched: &HashMap<(String, String), JsonObject>) {
    if let Value::Array(items) = value {
        for item in items {
            splice(item, fetched);
        }
        return;
    }
    let Some((class_name, object_id)) = as_pointer(value)
        .map(|(class_name, object_id)| (class_name.to_string(), object_id.to_string()))
    else {
        return;
    };
    if let Some(full) = fetched.get(&(class_name.clone(), object_id)) {
        let mut object = full.clone();
        object.insert("__type".to_string(), Value::String("Object".to_string()));
        object.insert("className".to_string(), Value::String(class_name));
        *value = Value::Object(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use query_engine_metadata::metadata::ClassSchema;

    struct OneClassBackend {
        class_name: String,
        rows: Vec<JsonObject>,
    }

    #[async_trait]
    impl Backend for OneClassBackend {
        async fn find(
            &self,
            schema: &ClassSchema,
            _where_: &JsonObject,
            _options: &QueryOptions,
        ) -> Result<Vec<JsonObject>, Error> {
            assert_eq!(schema.class_name, self.class_name);
            Ok(self.rows.clone())
        }

        async fn count(
            &self,
            _schema: &ClassSchema,
            _where_: &JsonObject,
            _acl: Option<&[String]>,
        ) -> Result<i64, Error> {
            unimplemented!("not used by include expansion")
        }

        async fn get_class(&self, class_name: &str) -> Result<Option<ClassSchema>, Error> {
            Ok(Some(ClassSchema::new(class_name)))
        }
    }

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn a_pointer_is_replaced_with_the_full_object() {
        let backend = OneClassBackend {
            class_name: "User".to_string(),
            rows: vec![object(
                serde_json::json!({"objectId": "u1", "name": "Ada"}),
            )],
        };
        let mut results = vec![object(serde_json::json!({
            "objectId": "g1",
            "owner": {"__type": "Pointer", "className": "User", "objectId": "u1"},
        }))];

        expand(
            &backend,
            &[vec!["owner".to_string()]],
            &mut results,
            None,
        )
        .await
        .unwrap();

        similar_asserts::assert_eq!(
            Value::Object(results[0].clone()),
            serde_json::json!({
                "objectId": "g1",
                "owner": {
                    "__type": "Object",
                    "className": "User",
                    "objectId": "u1",
                    "name": "Ada",
                },
            })
        );
    }

    #[tokio::test]
    async fn unresolvable_pointers_stay_as_stubs() {
        let backend = OneClassBackend {
            class_name: "User".to_string(),
            rows: vec![],
        };
        let stub = serde_json::json!({"__type": "Pointer", "className": "User", "objectId": "gone"});
        let mut results = vec![object(serde_json::json!({
            "objectId": "g1",
            "owner": stub.clone(),
        }))];

        expand(
            &backend,
            &[vec!["owner".to_string()]],
            &mut results,
            None,
        )
        .await
        .unwrap();

        assert_eq!(results[0].get("owner"), Some(&stub));
    }

    #[tokio::test]
    async fn pointers_inside_arrays_are_expanded() {
        let backend = OneClassBackend {
            class_name: "User".to_string(),
            rows: vec![object(serde_json::json!({"objectId": "u1"}))],
        };
        let mut results = vec![object(serde_json::json!({
            "objectId": "g1",
            "players": [
                {"__type": "Pointer", "className": "User", "objectId": "u1"},
            ],
        }))];

        expand(
            &backend,
            &[vec!["players".to_string()]],
            &mut results,
            None,
        )
        .await
        .unwrap();

        let players = results[0].get("players").unwrap().as_array().unwrap();
        assert_eq!(
            players[0].get("__type"),
            Some(&Value::String("Object".to_string()))
        );
    }
}
